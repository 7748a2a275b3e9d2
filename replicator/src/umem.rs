//! UMEM arena: the shared frame pool backing one AF_XDP socket.
//!
//! A single anonymous, page-aligned mapping carved into fixed-size frames.
//! Frames `[0, tx_frames)` are reserved for transmit, `[tx_frames,
//! tx_frames + rx_frames)` for receive. A frame is identified by its byte
//! offset into the region, which is exactly the address form the kernel
//! rings carry.

use std::ptr;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

/// Number of frames reserved for transmit.
pub const TX_FRAMES: u32 = 2048;
/// Number of frames reserved for receive.
pub const RX_FRAMES: u32 = 2048;
/// Default UMEM population.
pub const UMEM_FRAMES: u32 = TX_FRAMES + RX_FRAMES;
/// Default frame (chunk) size.
pub const FRAME_SIZE: u32 = 4096;

/// Descriptors for unaligned chunks carry a data offset in the upper
/// 16 bits of the address.
const ADDR_MASK: u64 = (1 << 48) - 1;

/// Strip the offset bits from a descriptor address, leaving the frame
/// address within the UMEM.
#[inline(always)]
pub fn extract_addr(addr: u64) -> u64 {
    addr & ADDR_MASK
}

/// Owner of the mapped frame pool. Frames are loaned to the kernel through
/// ring entries; the backing memory lives until drop.
pub struct Umem {
    base: *mut u8,
    len: usize,
    frame_size: u32,
    tx_frames: u32,
    rx_frames: u32,
    headroom: u32,
}

// The arena is moved into exactly one worker thread together with its
// socket; the raw pointer is what prevents the auto impl.
unsafe impl Send for Umem {}

impl Umem {
    /// Map a frame pool using the default TX/RX split. `frame_count` below
    /// the split total is raised to the minimum.
    pub fn allocate(frame_size: u32, frame_count: u32, headroom: u32) -> Result<Self> {
        let required = TX_FRAMES + RX_FRAMES;
        let mut frame_count = frame_count;
        if frame_count < required {
            warn!(frame_count, required, "frame count too small, raising to minimum");
            frame_count = required;
        }
        Self::with_layout(frame_size, TX_FRAMES, frame_count - TX_FRAMES, headroom)
    }

    /// Map a frame pool with an explicit TX/RX frame split.
    pub fn with_layout(
        frame_size: u32,
        tx_frames: u32,
        rx_frames: u32,
        headroom: u32,
    ) -> Result<Self> {
        if frame_size < 2048 || !frame_size.is_power_of_two() {
            bail!("frame size must be a power of two >= 2048, got {frame_size}");
        }
        if tx_frames == 0 || rx_frames == 0 {
            bail!("UMEM needs at least one TX and one RX frame");
        }

        let len = frame_size as usize * (tx_frames + rx_frames) as usize;

        // Anonymous mappings are page-aligned and zero-filled, which is
        // exactly what UMEM registration requires.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error()).context("mmap for UMEM");
        }

        // Best effort; the arena works the same on 4K pages.
        unsafe {
            libc::madvise(base, len, libc::MADV_HUGEPAGE);
        }

        debug!(
            len,
            frame_size,
            tx_frames,
            rx_frames,
            headroom,
            "allocated UMEM"
        );

        Ok(Self {
            base: base as *mut u8,
            len,
            frame_size,
            tx_frames,
            rx_frames,
            headroom,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    pub fn headroom(&self) -> u32 {
        self.headroom
    }

    pub fn tx_frames(&self) -> u32 {
        self.tx_frames
    }

    pub fn rx_frames(&self) -> u32 {
        self.rx_frames
    }

    /// Address of the first RX-region frame.
    pub fn rx_base(&self) -> u64 {
        self.tx_frames as u64 * self.frame_size as u64
    }

    /// Address of the `i`-th RX-region frame.
    pub fn rx_frame_addr(&self, i: u32) -> u64 {
        self.rx_base() + i as u64 * self.frame_size as u64
    }

    /// Address of a TX-region frame. `frame_nb` wraps into the TX region.
    pub fn tx_frame_addr(&self, frame_nb: u32) -> u64 {
        (frame_nb % self.tx_frames) as u64 * self.frame_size as u64
    }

    /// Borrow `len` bytes at `addr`, or `None` if the range leaves the
    /// region.
    pub fn frame(&self, addr: u64, len: u32) -> Option<&[u8]> {
        let addr = extract_addr(addr) as usize;
        let len = len as usize;
        if addr.checked_add(len)? > self.len {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(self.base.add(addr), len) })
    }

    /// Mutably borrow an entire TX-region frame.
    pub fn tx_frame_mut(&mut self, frame_nb: u32) -> &mut [u8] {
        let addr = self.tx_frame_addr(frame_nb) as usize;
        let len = self.frame_size as usize;
        unsafe { std::slice::from_raw_parts_mut(self.base.add(addr), len) }
    }
}

impl Drop for Umem {
    fn drop(&mut self) {
        if !self.base.is_null() {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.len);
            }
        }
    }
}
