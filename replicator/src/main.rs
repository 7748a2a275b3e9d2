//! replicator: AF_XDP UDP packet replicator daemon.
//!
//! Startup order: raise the memory-lock limit, load and attach the XDP
//! classifier, bring up one AF_XDP socket + worker per RX queue, then the
//! control and metrics threads. Shutdown is the reverse: clear the running
//! flag, join the workers (each closes its socket and scrubs its map
//! entry), then detach the classifier.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use replicator::classifier::Classifier;
use replicator::control::{self, ControlServer};
use replicator::iface;
use replicator::metrics::{self, Stats};
use replicator::registry::Registry;
use replicator::runtime;
use replicator::umem::{FRAME_SIZE, UMEM_FRAMES};
use replicator::worker::{Worker, WorkerConfig};
use replicator::xsk::{BindMode, XskSocket};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "replicator",
    about = "AF_XDP UDP packet replicator with an eBPF classifier",
    version
)]
struct Cli {
    /// Network interface to bind to (e.g. eth0).
    interface: String,

    /// IPv4 address to intercept traffic for.
    listen_ip: Ipv4Addr,

    /// UDP port to intercept traffic for.
    listen_port: u16,

    /// Enable zero-copy mode ('true' or 'false').
    #[arg(default_value_t = true, action = clap::ArgAction::Set)]
    zero_copy: bool,

    /// Path to the compiled XDP classifier ELF binary.
    #[arg(long, default_value = "replicator-ebpf")]
    xdp_program: PathBuf,

    /// Number of RX queues to serve (one worker thread each).
    #[arg(long, default_value_t = 4)]
    queues: usize,

    /// UDP port of the destination control protocol.
    #[arg(long, default_value_t = control::DEFAULT_CONTROL_PORT)]
    control_port: u16,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    runtime::require_root()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        interface = %cli.interface,
        listen_ip = %cli.listen_ip,
        listen_port = cli.listen_port,
        zero_copy = cli.zero_copy,
        queues = cli.queues,
        control_port = cli.control_port,
        "starting replicator"
    );

    if cli.queues == 0 {
        bail!("at least one queue is required");
    }

    runtime::raise_memlock_limit();

    // --- Classifier ---
    let ebpf_bytes = std::fs::read(&cli.xdp_program).with_context(|| {
        format!(
            "reading XDP classifier from {}. Build it with: cargo xtask build-ebpf",
            cli.xdp_program.display()
        )
    })?;
    let mut classifier = Classifier::load(&ebpf_bytes)?;
    classifier.attach(&cli.interface, cli.zero_copy)?;
    classifier.configure(cli.listen_ip, cli.listen_port)?;
    let socket_map = classifier.socket_map()?;

    // --- Frame source addresses, resolved once and cached ---
    let src_mac = iface::interface_mac(&cli.interface)
        .with_context(|| format!("reading MAC of '{}'", cli.interface))?;
    let src_ip = match iface::interface_ip(&cli.interface) {
        Ok(ip) => ip,
        Err(e) => {
            warn!(
                interface = %cli.interface,
                error = %e,
                "no interface IPv4 address, using the listen address as source"
            );
            cli.listen_ip
        }
    };

    let registry = Arc::new(Registry::new());
    let stats = Stats::new(cli.queues);
    let running = Arc::new(AtomicBool::new(true));

    // --- One socket + worker per RX queue ---
    let mode = if cli.zero_copy {
        BindMode::ZeroCopy
    } else {
        BindMode::Drv
    };

    let mut workers = Vec::with_capacity(cli.queues);
    for queue_id in 0..cli.queues {
        let mut builder = XskSocket::create(FRAME_SIZE, UMEM_FRAMES, 0)
            .with_context(|| format!("creating AF_XDP socket for queue {queue_id}"))?;
        builder
            .setup_umem()
            .with_context(|| format!("registering UMEM for queue {queue_id}"))?;
        let mut sock = builder
            .bind(&cli.interface, queue_id as u32, mode)
            .with_context(|| format!("binding AF_XDP socket for queue {queue_id}"))?;
        sock.register_in_classifier(socket_map.clone(), queue_id as u32)?;

        let worker = Worker::new(
            WorkerConfig {
                queue_id,
                src_mac,
                src_ip,
                listen_port: cli.listen_port,
            },
            sock,
            registry.clone(),
            stats.clone(),
        )?;

        let worker_running = running.clone();
        let handle = thread::Builder::new()
            .name(format!("replicator-q{queue_id}"))
            .spawn(move || {
                runtime::pin_to_core(queue_id);
                runtime::try_set_realtime_priority();
                worker.run(worker_running);
            })
            .with_context(|| format!("spawning worker for queue {queue_id}"))?;
        workers.push(handle);
    }

    // --- Control and metrics threads ---
    let control_handle = ControlServer::bind(cli.control_port)?
        .spawn(registry.clone(), running.clone())?;
    let metrics_handle = metrics::spawn_reporter(
        stats.clone(),
        registry.clone(),
        running.clone(),
        Duration::from_secs(10),
    )?;

    info!("replicator is running; press Ctrl+C to stop");

    let unexpected_stop = wait_for_shutdown(&workers, &running).await?;

    // --- Graceful shutdown ---
    info!("shutting down...");
    running.store(false, Ordering::Release);

    for handle in workers {
        let _ = handle.join();
    }
    let _ = control_handle.join();
    let _ = metrics_handle.join();

    stats.report(registry.len());

    if let Err(e) = classifier.detach() {
        warn!(error = %e, "error detaching classifier");
    }

    if unexpected_stop {
        bail!("replicator stopped unexpectedly");
    }

    info!("replicator stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Signal handling
// ---------------------------------------------------------------------------

/// Wait for SIGINT/SIGTERM, watching the workers once a second. Returns
/// true when a worker died while the replicator was supposed to be
/// running.
async fn wait_for_shutdown(
    workers: &[thread::JoinHandle<()>],
    running: &AtomicBool,
) -> Result<bool> {
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("received Ctrl+C");
                return Ok(false);
            }
            _ = terminate.recv() => {
                info!("received SIGTERM");
                return Ok(false);
            }
            _ = ticker.tick() => {
                if running.load(Ordering::Relaxed)
                    && workers.iter().any(|w| w.is_finished())
                {
                    error!("worker thread exited unexpectedly");
                    return Ok(true);
                }
            }
        }
    }
}
