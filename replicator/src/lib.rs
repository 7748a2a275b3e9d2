//! High-throughput UDP packet replicator on AF_XDP.
//!
//! An XDP classifier redirects UDP datagrams addressed to a configured
//! (ip, port) tuple into per-queue AF_XDP sockets. One worker thread per
//! RX queue parses each frame, re-encapsulates its payload for every
//! destination in a runtime-mutable registry, and transmits through the
//! same socket's zero-copy TX path. Destinations are managed over a small
//! UDP control protocol.
//!
//! Module map:
//!   umem        — page-aligned shared frame pool (TX/RX regions)
//!   ring        — SPSC fill/completion/RX/TX rings
//!   xsk         — per-queue socket wrapper and frame lifecycle
//!   classifier  — XDP program load/attach and map plumbing
//!   registry    — mutable destination set with ARP priming
//!   control     — UDP control protocol server
//!   packet      — frame parsing and synthesis
//!   worker      — receive → replicate → recycle loop
//!   runtime     — rlimits, CPU pinning, scheduling
//!   metrics     — counters and the periodic reporter

pub mod classifier;
pub mod control;
pub mod iface;
pub mod metrics;
pub mod packet;
pub mod registry;
pub mod ring;
pub mod runtime;
pub mod umem;
pub mod worker;
pub mod xsk;
