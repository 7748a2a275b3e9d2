//! Single-producer/single-consumer descriptor rings shared with the kernel.
//!
//! Each AF_XDP socket carries four rings: fill and TX (userspace produces),
//! completion and RX (userspace consumes). All four share the same memory
//! layout — a producer index, a consumer index, a kernel-written flags word
//! and a power-of-two descriptor array — and differ only in descriptor type
//! and in which side of the index pair userspace owns.
//!
//! The two roles are separate types so that producer and consumer APIs
//! cannot be mixed up: a `ProducerRing` can only reserve/write/submit, a
//! `ConsumerRing` can only peek/read/release. `heap_pair` builds both views
//! over one heap block, which is how tests play the kernel side of a ring.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};

/// Kernel-set flag asking userspace to poke the socket when producing.
pub const XDP_RING_NEED_WAKEUP: u32 = 1;

/// RX/TX ring descriptor (`struct xdp_desc`).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameDesc {
    pub addr: u64,
    pub len: u32,
    pub options: u32,
}

/// Offsets of the control words and descriptor array inside one ring's
/// shared block (`struct xdp_ring_offset`).
#[derive(Clone, Copy, Debug, Default)]
pub struct RingOffsets {
    pub producer: u64,
    pub consumer: u64,
    pub desc: u64,
    pub flags: u64,
}

// ---------------------------------------------------------------------------
// Backing memory
// ---------------------------------------------------------------------------

/// Heap block standing in for a kernel ring mapping. Shared by the
/// producer view and the consumer view of one ring.
struct HeapBlock {
    words: UnsafeCell<Box<[u64]>>,
}

unsafe impl Send for HeapBlock {}
unsafe impl Sync for HeapBlock {}

enum Backing {
    Mmap { base: *mut libc::c_void, len: usize },
    Heap(#[allow(dead_code)] Arc<HeapBlock>),
}

impl Drop for Backing {
    fn drop(&mut self) {
        if let Backing::Mmap { base, len } = *self {
            unsafe {
                libc::munmap(base, len);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shared ring plumbing
// ---------------------------------------------------------------------------

struct RawRing<D> {
    producer: *mut u32,
    consumer: *mut u32,
    flags: *const u32,
    desc: *mut D,
    size: u32,
    mask: u32,
    cached_prod: u32,
    cached_cons: u32,
    _backing: Backing,
    _marker: PhantomData<D>,
}

unsafe impl<D: Send> Send for RawRing<D> {}

impl<D: Copy + Default> RawRing<D> {
    /// Map one kernel ring from the socket at the given mmap page offset.
    fn from_mmap(fd: RawFd, pgoff: i64, off: &RingOffsets, size: u32) -> Result<Self> {
        debug_assert!(size.is_power_of_two());
        let len = off.desc as usize + size as usize * mem::size_of::<D>();
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                pgoff,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error()).context("mmap ring");
        }
        let base_u8 = base as *mut u8;
        Ok(unsafe {
            Self::at(
                base_u8.add(off.producer as usize) as *mut u32,
                base_u8.add(off.consumer as usize) as *mut u32,
                base_u8.add(off.flags as usize) as *const u32,
                base_u8.add(off.desc as usize) as *mut D,
                size,
                Backing::Mmap { base, len },
            )
        })
    }

    /// Two views of one heap-backed ring: `(user side, kernel side)` from
    /// the caller's perspective.
    fn heap_pair(size: u32) -> (Self, Self) {
        assert!(size.is_power_of_two());
        // Layout: producer at 0, consumer at 4, flags at 8, pad, then the
        // descriptor array at 16 (8-byte aligned via the u64 backing).
        let desc_bytes = size as usize * mem::size_of::<D>();
        let words = 2 + desc_bytes.div_ceil(8);
        let block = Arc::new(HeapBlock {
            words: UnsafeCell::new(vec![0u64; words].into_boxed_slice()),
        });
        let base = unsafe { (*block.words.get()).as_mut_ptr() as *mut u8 };
        let view = |backing| unsafe {
            Self::at(
                base as *mut u32,
                base.add(4) as *mut u32,
                base.add(8) as *const u32,
                base.add(16) as *mut D,
                size,
                backing,
            )
        };
        (
            view(Backing::Heap(block.clone())),
            view(Backing::Heap(block)),
        )
    }

    unsafe fn at(
        producer: *mut u32,
        consumer: *mut u32,
        flags: *const u32,
        desc: *mut D,
        size: u32,
        backing: Backing,
    ) -> Self {
        Self {
            producer,
            consumer,
            flags,
            desc,
            size,
            mask: size - 1,
            cached_prod: 0,
            cached_cons: 0,
            _backing: backing,
            _marker: PhantomData,
        }
    }

    #[inline(always)]
    fn load_producer(&self) -> u32 {
        unsafe { ptr::read_volatile(self.producer) }
    }

    #[inline(always)]
    fn load_consumer(&self) -> u32 {
        unsafe { ptr::read_volatile(self.consumer) }
    }

    #[inline(always)]
    fn store_producer(&self, val: u32) {
        fence(Ordering::Release);
        unsafe { ptr::write_volatile(self.producer, val) }
    }

    #[inline(always)]
    fn store_consumer(&self, val: u32) {
        fence(Ordering::Release);
        unsafe { ptr::write_volatile(self.consumer, val) }
    }

    #[inline(always)]
    fn flags(&self) -> u32 {
        unsafe { ptr::read_volatile(self.flags) }
    }
}

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Userspace-produced ring (fill, TX).
pub struct ProducerRing<D>(RawRing<D>);

/// Userspace-consumed ring (completion, RX).
pub struct ConsumerRing<D>(RawRing<D>);

impl<D: Copy + Default> ProducerRing<D> {
    pub fn from_mmap(fd: RawFd, pgoff: i64, off: &RingOffsets, size: u32) -> Result<Self> {
        Ok(Self(RawRing::from_mmap(fd, pgoff, off, size)?))
    }

    pub fn size(&self) -> u32 {
        self.0.size
    }

    /// Reserve up to `n` slots. Returns the starting index and how many
    /// slots were actually reserved (0 when the ring is full).
    pub fn reserve(&mut self, n: u32) -> (u32, u32) {
        let r = &mut self.0;
        let mut free = r.size - r.cached_prod.wrapping_sub(r.cached_cons);
        if free < n {
            r.cached_cons = r.load_consumer();
            free = r.size - r.cached_prod.wrapping_sub(r.cached_cons);
        }
        let got = n.min(free);
        let idx = r.cached_prod;
        r.cached_prod = r.cached_prod.wrapping_add(got);
        (idx, got)
    }

    /// Write the descriptor at a reserved slot.
    pub fn write(&mut self, idx: u32, desc: D) {
        let slot = (idx & self.0.mask) as usize;
        unsafe { ptr::write(self.0.desc.add(slot), desc) }
    }

    /// Publish `n` previously reserved slots to the kernel.
    pub fn submit(&mut self, n: u32) {
        let r = &self.0;
        r.store_producer(r.load_producer().wrapping_add(n));
    }

    pub fn needs_wakeup(&self) -> bool {
        self.0.flags() & XDP_RING_NEED_WAKEUP != 0
    }
}

impl<D: Copy + Default> ConsumerRing<D> {
    pub fn from_mmap(fd: RawFd, pgoff: i64, off: &RingOffsets, size: u32) -> Result<Self> {
        Ok(Self(RawRing::from_mmap(fd, pgoff, off, size)?))
    }

    pub fn size(&self) -> u32 {
        self.0.size
    }

    /// Peek up to `n` entries. Returns the starting index and how many are
    /// readable. Peeked entries stay owned by the ring until `release`.
    pub fn peek(&mut self, n: u32) -> (u32, u32) {
        let r = &mut self.0;
        let mut avail = r.cached_prod.wrapping_sub(r.cached_cons);
        if avail < n {
            r.cached_prod = r.load_producer();
            fence(Ordering::Acquire);
            avail = r.cached_prod.wrapping_sub(r.cached_cons);
        }
        let got = n.min(avail);
        let idx = r.cached_cons;
        r.cached_cons = r.cached_cons.wrapping_add(got);
        (idx, got)
    }

    /// Read the descriptor at a peeked slot.
    pub fn read(&self, idx: u32) -> D {
        let slot = (idx & self.0.mask) as usize;
        unsafe { ptr::read(self.0.desc.add(slot)) }
    }

    /// Hand `n` consumed slots back to the producer.
    pub fn release(&mut self, n: u32) {
        let r = &self.0;
        r.store_consumer(r.load_consumer().wrapping_add(n));
    }

    /// Entries readable right now, without consuming them.
    pub fn pending(&mut self) -> u32 {
        let r = &mut self.0;
        r.cached_prod = r.load_producer();
        fence(Ordering::Acquire);
        r.cached_prod.wrapping_sub(r.cached_cons)
    }
}

/// Both views of one heap-backed ring, as `(user role, kernel role)`.
/// The caller keeps the first and drives the second as the mock kernel.
pub fn heap_pair<D: Copy + Default>(size: u32) -> (ProducerRing<D>, ConsumerRing<D>) {
    let (user, kernel) = RawRing::heap_pair(size);
    (ProducerRing(user), ConsumerRing(kernel))
}

/// `heap_pair` with the roles swapped: userspace consumes, the mock kernel
/// produces (RX and completion rings).
pub fn heap_pair_rev<D: Copy + Default>(size: u32) -> (ConsumerRing<D>, ProducerRing<D>) {
    let (kernel, user) = RawRing::heap_pair(size);
    (ConsumerRing(user), ProducerRing(kernel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produce_then_consume() {
        let (mut prod, mut cons) = heap_pair::<u64>(8);
        let (idx, got) = prod.reserve(3);
        assert_eq!((idx, got), (0, 3));
        for i in 0..3 {
            prod.write(idx + i, (i as u64) * 100);
        }
        prod.submit(3);

        let (cidx, cgot) = cons.peek(8);
        assert_eq!(cgot, 3);
        assert_eq!(cons.read(cidx), 0);
        assert_eq!(cons.read(cidx + 2), 200);
        cons.release(3);

        // All capacity is available again.
        let (_, got) = prod.reserve(8);
        assert_eq!(got, 8);
    }

    #[test]
    fn producer_stops_at_capacity() {
        let (mut prod, mut cons) = heap_pair::<u64>(4);
        let (_, got) = prod.reserve(4);
        assert_eq!(got, 4);
        prod.submit(4);

        // Full: nothing more to reserve until the consumer releases.
        assert_eq!(prod.reserve(1).1, 0);

        let (_, cgot) = cons.peek(2);
        assert_eq!(cgot, 2);
        cons.release(2);

        assert_eq!(prod.reserve(4).1, 2);
    }

    #[test]
    fn consumer_sees_nothing_before_submit() {
        let (mut prod, mut cons) = heap_pair::<FrameDesc>(4);
        let (idx, got) = prod.reserve(2);
        assert_eq!(got, 2);
        prod.write(
            idx,
            FrameDesc {
                addr: 4096,
                len: 60,
                options: 0,
            },
        );
        assert_eq!(cons.peek(4).1, 0);

        prod.submit(2);
        let (cidx, cgot) = cons.peek(4);
        assert_eq!(cgot, 2);
        assert_eq!(cons.read(cidx).addr, 4096);
    }

    #[test]
    fn indices_wrap_across_the_ring_boundary() {
        let (mut prod, mut cons) = heap_pair::<u64>(4);
        for round in 0..10u64 {
            let (idx, got) = prod.reserve(3);
            assert_eq!(got, 3);
            for i in 0..3 {
                prod.write(idx + i, round * 10 + i as u64);
            }
            prod.submit(3);

            let (cidx, cgot) = cons.peek(4);
            assert_eq!(cgot, 3);
            for i in 0..3 {
                assert_eq!(cons.read(cidx + i), round * 10 + i as u64);
            }
            cons.release(3);
        }
    }

    #[test]
    fn peeked_but_unreleased_entries_hold_capacity() {
        let (mut prod, mut cons) = heap_pair::<u64>(4);
        prod.reserve(4);
        prod.submit(4);

        // Peek without release: producer still sees a full ring.
        let (_, cgot) = cons.peek(4);
        assert_eq!(cgot, 4);
        assert_eq!(prod.reserve(1).1, 0);

        cons.release(4);
        assert_eq!(prod.reserve(1).1, 1);
    }
}
