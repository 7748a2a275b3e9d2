//! Per-queue AF_XDP socket wrapper.
//!
//! Owns one AF_XDP socket fd, its UMEM and ring quartet, and the TX frame
//! cursor. Lifecycle: `create` (UMEM + socket) → `setup_umem` (UMEM
//! registration, fill/completion rings) → `bind` (RX/TX rings, interface
//! bind, fill-ring prefill) → `register_in_classifier` → serving →
//! `close`.
//!
//! A wrapper is owned by exactly one worker thread; nothing here is
//! shared. TX flow control is completion-driven: completions are drained
//! before every send and a send is refused while too many frames are
//! outstanding, which pushes back on the producer instead of overrunning
//! the ring.

use std::fmt;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::classifier::{XskMapHandle, SOCKET_MAP_ENTRIES};
use crate::iface;
use crate::ring::{ConsumerRing, FrameDesc, ProducerRing, RingOffsets};
use crate::umem::{extract_addr, Umem};

/// Largest number of TX descriptors moved per batch.
pub const TX_BATCH: u32 = 64;

// ---------------------------------------------------------------------------
// AF_XDP kernel ABI (<linux/if_xdp.h>)
// ---------------------------------------------------------------------------

const SOL_XDP: i32 = 283;

const XDP_MMAP_OFFSETS: i32 = 1;
const XDP_RX_RING: i32 = 2;
const XDP_TX_RING: i32 = 3;
const XDP_UMEM_REG: i32 = 4;
const XDP_UMEM_FILL_RING: i32 = 5;
const XDP_UMEM_COMPLETION_RING: i32 = 6;

const XDP_PGOFF_RX_RING: i64 = 0;
const XDP_PGOFF_TX_RING: i64 = 0x8000_0000;
const XDP_UMEM_PGOFF_FILL_RING: i64 = 0x1_0000_0000;
const XDP_UMEM_PGOFF_COMPLETION_RING: i64 = 0x1_8000_0000;

const XDP_COPY: u16 = 1 << 1;
const XDP_ZEROCOPY: u16 = 1 << 2;
const XDP_USE_NEED_WAKEUP: u16 = 1 << 3;

#[repr(C)]
struct XdpUmemReg {
    addr: u64,
    len: u64,
    chunk_size: u32,
    headroom: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct XdpRingOffset {
    producer: u64,
    consumer: u64,
    desc: u64,
    flags: u64,
}

impl From<XdpRingOffset> for RingOffsets {
    fn from(o: XdpRingOffset) -> Self {
        RingOffsets {
            producer: o.producer,
            consumer: o.consumer,
            desc: o.desc,
            flags: o.flags,
        }
    }
}

#[repr(C)]
#[derive(Debug, Default)]
struct XdpMmapOffsets {
    rx: XdpRingOffset,
    tx: XdpRingOffset,
    fr: XdpRingOffset, // fill ring
    cr: XdpRingOffset, // completion ring
}

#[repr(C)]
struct SockaddrXdp {
    sxdp_family: u16,
    sxdp_flags: u16,
    sxdp_ifindex: u32,
    sxdp_queue_id: u32,
    sxdp_shared_umem_fd: u32,
}

/// Attachment/copy mode for the socket bind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindMode {
    SkbCopy,
    Drv,
    Hw,
    ZeroCopy,
}

impl BindMode {
    fn bind_flags(self) -> u16 {
        match self {
            BindMode::SkbCopy => XDP_COPY,
            BindMode::Drv | BindMode::Hw => 0,
            BindMode::ZeroCopy => XDP_ZEROCOPY,
        }
    }
}

impl fmt::Display for BindMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BindMode::SkbCopy => "skb-copy",
            BindMode::Drv => "drv",
            BindMode::Hw => "hw",
            BindMode::ZeroCopy => "zero-copy",
        })
    }
}

fn set_sockopt<T>(fd: RawFd, opt: i32, val: &T) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            SOL_XDP,
            opt,
            val as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn mmap_offsets(fd: RawFd) -> Result<XdpMmapOffsets> {
    let mut offsets = XdpMmapOffsets::default();
    let mut optlen = mem::size_of::<XdpMmapOffsets>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            SOL_XDP,
            XDP_MMAP_OFFSETS,
            &mut offsets as *mut _ as *mut libc::c_void,
            &mut optlen,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error()).context("XDP_MMAP_OFFSETS");
    }
    Ok(offsets)
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

enum XskFd {
    Kernel(OwnedFd),
    #[cfg(test)]
    Mock(RawFd),
}

impl XskFd {
    fn raw(&self) -> RawFd {
        match self {
            XskFd::Kernel(fd) => fd.as_raw_fd(),
            #[cfg(test)]
            XskFd::Mock(fd) => *fd,
        }
    }
}

/// Socket with an allocated UMEM, not yet serving.
pub struct XskSocketBuilder {
    fd: OwnedFd,
    umem: Umem,
    fill: Option<ProducerRing<u64>>,
    completion: Option<ConsumerRing<u64>>,
}

impl XskSocketBuilder {
    /// Register the UMEM with the kernel and map the fill and completion
    /// rings. The fill ring is sized `rx_frames * 2`, the completion ring
    /// `tx_frames * 2`.
    pub fn setup_umem(&mut self) -> Result<()> {
        let fd = self.fd.as_raw_fd();
        let umem = &self.umem;

        let needed = (umem.tx_frames() + umem.rx_frames()) as usize * umem.frame_size() as usize;
        if umem.len() < needed {
            bail!(
                "UMEM of {} bytes too small for {} TX + {} RX frames",
                umem.len(),
                umem.tx_frames(),
                umem.rx_frames()
            );
        }

        let reg = XdpUmemReg {
            addr: umem.as_ptr() as u64,
            len: umem.len() as u64,
            chunk_size: umem.frame_size(),
            headroom: umem.headroom(),
            flags: 0,
        };
        set_sockopt(fd, XDP_UMEM_REG, &reg).context("XDP_UMEM_REG")?;

        let fill_size = umem.rx_frames() * 2;
        let comp_size = umem.tx_frames() * 2;
        set_sockopt(fd, XDP_UMEM_FILL_RING, &fill_size).context("setting FILL ring size")?;
        set_sockopt(fd, XDP_UMEM_COMPLETION_RING, &comp_size)
            .context("setting COMPLETION ring size")?;

        let off = mmap_offsets(fd)?;
        self.fill = Some(
            ProducerRing::from_mmap(fd, XDP_UMEM_PGOFF_FILL_RING, &off.fr.into(), fill_size)
                .context("mmap fill ring")?,
        );
        self.completion = Some(
            ConsumerRing::from_mmap(
                fd,
                XDP_UMEM_PGOFF_COMPLETION_RING,
                &off.cr.into(),
                comp_size,
            )
            .context("mmap completion ring")?,
        );

        debug!(fill_size, comp_size, "UMEM registered");
        Ok(())
    }

    /// Map the RX/TX rings, bind to `(interface, queue)` and pre-populate
    /// the fill ring with the RX-region frames.
    pub fn bind(mut self, ifname: &str, queue_id: u32, mode: BindMode) -> Result<XskSocket> {
        let (fill, completion) = match (self.fill.take(), self.completion.take()) {
            (Some(f), Some(c)) => (f, c),
            _ => bail!("UMEM not configured: call setup_umem first"),
        };

        let fd = self.fd.as_raw_fd();
        let ifindex = iface::interface_index(ifname)?;

        let rx_size = self.umem.rx_frames();
        let tx_size = self.umem.tx_frames();
        set_sockopt(fd, XDP_RX_RING, &rx_size).context("setting RX ring size")?;
        set_sockopt(fd, XDP_TX_RING, &tx_size).context("setting TX ring size")?;

        let off = mmap_offsets(fd)?;
        let rx = ConsumerRing::from_mmap(fd, XDP_PGOFF_RX_RING, &off.rx.into(), rx_size)
            .context("mmap RX ring")?;
        let tx = ProducerRing::from_mmap(fd, XDP_PGOFF_TX_RING, &off.tx.into(), tx_size)
            .context("mmap TX ring")?;

        let sxdp = SockaddrXdp {
            sxdp_family: libc::AF_XDP as u16,
            sxdp_flags: mode.bind_flags() | XDP_USE_NEED_WAKEUP,
            sxdp_ifindex: ifindex,
            sxdp_queue_id: queue_id,
            sxdp_shared_umem_fd: 0,
        };
        let ret = unsafe {
            libc::bind(
                fd,
                &sxdp as *const _ as *const libc::sockaddr,
                mem::size_of::<SockaddrXdp>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if mode == BindMode::ZeroCopy {
                return Err(err).with_context(|| {
                    format!(
                        "binding AF_XDP socket to {ifname} queue {queue_id} in zero-copy mode \
                         (the driver may not support XDP_ZEROCOPY)"
                    )
                });
            }
            return Err(err)
                .with_context(|| format!("binding AF_XDP socket to {ifname} queue {queue_id}"));
        }

        info!(
            interface = ifname,
            queue_id,
            mode = %mode,
            rx_size,
            tx_size,
            "AF_XDP socket bound"
        );

        let mut sock = XskSocket {
            fd: Some(XskFd::Kernel(self.fd)),
            umem: self.umem,
            fill,
            completion,
            rx,
            tx,
            queue_id,
            next_tx_frame: 0,
            outstanding_tx: 0,
            cached_completions: 0,
            pending_recycle: Vec::new(),
            xsks_map: None,
            closed: false,
        };
        sock.prefill();
        Ok(sock)
    }
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

pub struct XskSocket {
    fd: Option<XskFd>,
    umem: Umem,
    fill: ProducerRing<u64>,
    completion: ConsumerRing<u64>,
    rx: ConsumerRing<FrameDesc>,
    tx: ProducerRing<FrameDesc>,
    queue_id: u32,
    /// Monotonic TX frame cursor; wraps within the TX region.
    next_tx_frame: u32,
    /// Submitted TX descriptors not yet released from the completion ring.
    outstanding_tx: u32,
    /// Completions peeked but held back until a batch accumulates.
    cached_completions: u32,
    /// RX frame addresses awaiting return to the fill ring.
    pending_recycle: Vec<u64>,
    xsks_map: Option<(XskMapHandle, u32)>,
    closed: bool,
}

impl XskSocket {
    /// Allocate the UMEM and open the AF_XDP socket.
    pub fn create(frame_size: u32, frame_count: u32, headroom: u32) -> Result<XskSocketBuilder> {
        let umem = Umem::allocate(frame_size, frame_count, headroom)?;

        let raw = unsafe { libc::socket(libc::AF_XDP, libc::SOCK_RAW, 0) };
        if raw < 0 {
            return Err(io::Error::last_os_error()).context("creating AF_XDP socket");
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        debug!(fd = raw, "created AF_XDP socket");

        Ok(XskSocketBuilder {
            fd,
            umem,
            fill: None,
            completion: None,
        })
    }

    /// Donate the RX-region frames to the kernel through the fill ring.
    fn prefill(&mut self) {
        let rx_frames = self.umem.rx_frames();
        let (idx, got) = self.fill.reserve(rx_frames);
        if got != rx_frames {
            warn!(got, rx_frames, "could not pre-populate the whole fill ring");
        }
        for i in 0..got {
            self.fill.write(idx + i, self.umem.rx_frame_addr(i));
        }
        self.fill.submit(got);
        debug!(frames = got, "pre-populated fill ring");
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_ref().map(XskFd::raw).unwrap_or(-1)
    }

    pub fn queue_id(&self) -> u32 {
        self.queue_id
    }

    pub fn frame_size(&self) -> u32 {
        self.umem.frame_size()
    }

    pub fn outstanding_tx(&self) -> u32 {
        self.outstanding_tx
    }

    /// Register this socket for its queue in the classifier's socket map.
    pub fn register_in_classifier(&mut self, map: XskMapHandle, queue_id: u32) -> Result<()> {
        map.set(queue_id, self.raw_fd())
            .with_context(|| format!("registering socket in xsks_map[{queue_id}]"))?;
        info!(queue_id, fd = self.raw_fd(), "registered socket in classifier map");
        self.xsks_map = Some((map, queue_id));
        Ok(())
    }

    /// Next TX frame index, wrapping within the TX region. The TX region
    /// is at least as deep as the TX ring, so a frame is never handed out
    /// again before its descriptor could have completed.
    pub fn next_tx_frame(&mut self) -> u32 {
        let frame_nb = self.next_tx_frame % self.umem.tx_frames();
        self.next_tx_frame = self.next_tx_frame.wrapping_add(1);
        frame_nb
    }

    pub fn tx_frame_addr(&self, frame_nb: u32) -> u64 {
        self.umem.tx_frame_addr(frame_nb)
    }

    /// Whole TX frame as a writable slice.
    pub fn tx_frame_mut(&mut self, frame_nb: u32) -> &mut [u8] {
        self.umem.tx_frame_mut(frame_nb)
    }

    /// Received bytes at a descriptor address, bounds-checked.
    pub fn frame(&self, addr: u64, len: u32) -> Option<&[u8]> {
        self.umem.frame(addr, len)
    }

    pub fn reserve_tx(&mut self, n: u32) -> (u32, u32) {
        self.tx.reserve(n)
    }

    pub fn set_tx_desc(&mut self, idx: u32, addr: u64, len: u32) {
        self.tx.write(
            idx,
            FrameDesc {
                addr,
                len,
                options: 0,
            },
        );
    }

    pub fn submit_tx(&mut self, n: u32) {
        self.tx.submit(n);
        self.outstanding_tx += n;
    }

    /// Enqueue one frame for transmit. Returns 1, or 0 when the TX path
    /// has no room (the driver has been poked; retry after completions
    /// drain).
    pub fn send_one(&mut self, offset: u64, len: u32) -> u32 {
        self.send_batch(&[offset], &[len], 1)
    }

    /// Enqueue up to `batch` frames. Completions are drained first; the
    /// batch is refused outright when it would push `outstanding_tx` past
    /// `tx_frames`. Returns the number of descriptors submitted.
    pub fn send_batch(&mut self, offsets: &[u64], lens: &[u32], batch: usize) -> u32 {
        if self.closed {
            return 0;
        }
        let batch = batch
            .min(TX_BATCH as usize)
            .min(offsets.len())
            .min(lens.len()) as u32;
        if batch == 0 {
            return 0;
        }

        self.poll_completions();

        if self.outstanding_tx + batch > self.umem.tx_frames() {
            self.request_driver_poll();
            return 0;
        }

        let (idx, got) = self.tx.reserve(batch);
        if got == 0 {
            self.request_driver_poll();
            return 0;
        }
        for i in 0..got {
            self.tx.write(
                idx + i,
                FrameDesc {
                    addr: offsets[i as usize],
                    len: lens[i as usize],
                    options: 0,
                },
            );
        }
        self.tx.submit(got);
        self.outstanding_tx += got;
        self.request_driver_poll();
        got
    }

    /// Drain the completion ring. Peeked completions are held back until a
    /// batch accumulates, then released in one go; `outstanding_tx` drops
    /// by the released count.
    pub fn poll_completions(&mut self) {
        if self.outstanding_tx == 0 {
            return;
        }

        let (_, new_completions) = self.completion.peek(self.umem.tx_frames());
        if new_completions == 0 {
            return;
        }
        self.cached_completions += new_completions;

        let threshold = TX_BATCH.min(self.tx.size());
        if self.cached_completions < threshold {
            return;
        }

        self.completion.release(self.cached_completions);
        self.outstanding_tx = self.outstanding_tx.saturating_sub(self.cached_completions);
        self.cached_completions = 0;
    }

    /// Poke the driver if the TX ring asked for a wakeup.
    pub fn request_driver_poll(&self) {
        if !self.tx.needs_wakeup() {
            return;
        }
        self.kick_tx();
    }

    fn kick_tx(&self) {
        let fd = match &self.fd {
            Some(XskFd::Kernel(fd)) => fd.as_raw_fd(),
            #[cfg(test)]
            Some(XskFd::Mock(_)) => return,
            None => return,
        };
        let ret = unsafe { libc::sendto(fd, ptr::null(), 0, libc::MSG_DONTWAIT, ptr::null(), 0) };
        if ret >= 0 {
            return;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            // Expected under load or while the link settles.
            Some(libc::ENOBUFS | libc::EAGAIN | libc::EBUSY | libc::ENETDOWN) => {}
            _ => debug!(error = %err, "TX wakeup failed"),
        }
    }

    fn wake_fill(&self) {
        let fd = match &self.fd {
            Some(XskFd::Kernel(fd)) => fd.as_raw_fd(),
            #[cfg(test)]
            Some(XskFd::Mock(_)) => return,
            None => return,
        };
        unsafe {
            libc::recvfrom(
                fd,
                ptr::null_mut(),
                0,
                libc::MSG_DONTWAIT,
                ptr::null_mut(),
                ptr::null_mut(),
            );
        }
    }

    /// Peek up to `max` received descriptors into `out` as
    /// `(frame_addr, len)` pairs. The frame addresses are remembered for
    /// the next `recycle_frames`. When nothing arrived and the fill ring
    /// wants a wakeup, the socket is poked.
    pub fn receive(&mut self, max: u32, out: &mut Vec<(u64, u32)>) -> usize {
        out.clear();

        let (idx, got) = self.rx.peek(max);
        if got == 0 {
            if self.fill.needs_wakeup() {
                self.wake_fill();
            }
            return 0;
        }

        for i in 0..got {
            let desc = self.rx.read(idx + i);
            self.pending_recycle.push(desc.addr);
            out.push((extract_addr(desc.addr), desc.len));
        }
        self.rx.release(got);

        got as usize
    }

    /// Return the frames recorded by `receive` to the fill ring, as many
    /// as fit, and wake the fill side if asked to.
    pub fn recycle_frames(&mut self) {
        if self.pending_recycle.is_empty() {
            return;
        }

        let (idx, got) = self.fill.reserve(self.pending_recycle.len() as u32);
        if got > 0 {
            for i in 0..got {
                self.fill
                    .write(idx + i, extract_addr(self.pending_recycle[i as usize]));
            }
            self.fill.submit(got);
            if self.fill.needs_wakeup() {
                self.wake_fill();
            }
        } else {
            warn!(
                frames = self.pending_recycle.len(),
                "fill ring full, dropping recycle batch"
            );
        }
        self.pending_recycle.clear();
    }

    /// Drain outstanding TX for a bounded time, scrub this socket's
    /// entries from the classifier map, then close the socket. Safe to
    /// call twice.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        // Anything already peeked counts toward the drain.
        if self.cached_completions > 0 {
            self.completion.release(self.cached_completions);
            self.outstanding_tx = self.outstanding_tx.saturating_sub(self.cached_completions);
            self.cached_completions = 0;
        }

        let mut retries = 10;
        while self.outstanding_tx > 0 && retries > 0 {
            let (_, completed) = self.completion.peek(self.outstanding_tx);
            if completed > 0 {
                self.completion.release(completed);
                self.outstanding_tx -= completed;
            }
            if self.outstanding_tx > 0 {
                self.request_driver_poll();
                std::thread::sleep(Duration::from_millis(1));
                retries -= 1;
            }
        }
        if self.outstanding_tx > 0 {
            warn!(
                outstanding = self.outstanding_tx,
                queue_id = self.queue_id,
                "closing socket with unfinished TX"
            );
        }

        // Remove our own entries from the classifier map. When the kernel
        // does not support userspace lookups on XSKMAP, fall back to
        // deleting the slot we registered.
        if let Some((map, registered_queue)) = self.xsks_map.take() {
            let own = self.raw_fd() as u32;
            let mut scanned = false;
            for key in 0..SOCKET_MAP_ENTRIES {
                match map.get(key) {
                    Ok(Some(fd)) if fd == own => {
                        let _ = map.delete(key);
                        scanned = true;
                    }
                    Ok(_) => scanned = true,
                    Err(_) => break,
                }
            }
            if !scanned {
                let _ = map.delete(registered_queue);
            }
            debug!(queue_id = registered_queue, "removed socket from classifier map");
        }

        // Close the socket before the UMEM goes away (at drop).
        self.fd = None;
    }
}

impl Drop for XskSocket {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Mock kernel
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::atomic::{AtomicI32, Ordering};

    use super::*;
    use crate::ring;

    /// The kernel side of a mock socket's rings: consumes fill and TX,
    /// produces RX and completion, and reads/writes the UMEM directly.
    pub struct MockKernel {
        pub fill: ConsumerRing<u64>,
        pub completion: ProducerRing<u64>,
        pub rx: ProducerRing<FrameDesc>,
        pub tx: ConsumerRing<FrameDesc>,
        umem_base: *mut u8,
        umem_len: usize,
    }

    impl MockKernel {
        /// Deposit a frame into a fill-ring slot and publish an RX
        /// descriptor for it. Returns false when no fill entry or RX slot
        /// is available.
        pub fn inject(&mut self, bytes: &[u8]) -> bool {
            let (idx, got) = self.fill.peek(1);
            if got == 0 {
                return false;
            }
            let addr = extract_addr(self.fill.read(idx));
            self.fill.release(1);

            assert!(addr as usize + bytes.len() <= self.umem_len);
            unsafe {
                ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    self.umem_base.add(addr as usize),
                    bytes.len(),
                );
            }

            let (ridx, rgot) = self.rx.reserve(1);
            if rgot == 0 {
                return false;
            }
            self.rx.write(
                ridx,
                FrameDesc {
                    addr,
                    len: bytes.len() as u32,
                    options: 0,
                },
            );
            self.rx.submit(1);
            true
        }

        /// Consume submitted TX descriptors without completing them.
        pub fn take_tx(&mut self) -> Vec<(u64, Vec<u8>)> {
            let mut out = Vec::new();
            loop {
                let (idx, got) = self.tx.peek(64);
                if got == 0 {
                    break;
                }
                for i in 0..got {
                    let desc = self.tx.read(idx + i);
                    let addr = extract_addr(desc.addr) as usize;
                    assert!(addr + desc.len as usize <= self.umem_len);
                    let bytes = unsafe {
                        std::slice::from_raw_parts(self.umem_base.add(addr), desc.len as usize)
                    }
                    .to_vec();
                    out.push((desc.addr, bytes));
                }
                self.tx.release(got);
            }
            out
        }

        /// Hand TX frame addresses back through the completion ring.
        pub fn complete(&mut self, addrs: &[u64]) {
            let (idx, got) = self.completion.reserve(addrs.len() as u32);
            assert_eq!(got as usize, addrs.len(), "completion ring full");
            for (i, &addr) in addrs.iter().enumerate() {
                self.completion.write(idx + i as u32, addr);
            }
            self.completion.submit(got);
        }

        /// Fill-ring entries currently donated to the kernel.
        pub fn fill_level(&mut self) -> u32 {
            self.fill.pending()
        }
    }

    /// A socket over heap rings and a real (anonymous) UMEM, plus the
    /// kernel half of its rings.
    pub fn mock_socket(
        frame_size: u32,
        tx_frames: u32,
        rx_frames: u32,
        tx_ring: u32,
        rx_ring: u32,
    ) -> (XskSocket, MockKernel) {
        static NEXT_FD: AtomicI32 = AtomicI32::new(1000);

        let umem = Umem::with_layout(frame_size, tx_frames, rx_frames, 0).unwrap();
        let umem_base = umem.as_ptr();
        let umem_len = umem.len();

        let (fill_user, fill_kernel) = ring::heap_pair::<u64>((rx_frames * 2).next_power_of_two());
        let (comp_user, comp_kernel) =
            ring::heap_pair_rev::<u64>((tx_frames * 2).next_power_of_two());
        let (rx_user, rx_kernel) = ring::heap_pair_rev::<FrameDesc>(rx_ring);
        let (tx_user, tx_kernel) = ring::heap_pair::<FrameDesc>(tx_ring);

        let mut sock = XskSocket {
            fd: Some(XskFd::Mock(NEXT_FD.fetch_add(1, Ordering::Relaxed))),
            umem,
            fill: fill_user,
            completion: comp_user,
            rx: rx_user,
            tx: tx_user,
            queue_id: 0,
            next_tx_frame: 0,
            outstanding_tx: 0,
            cached_completions: 0,
            pending_recycle: Vec::new(),
            xsks_map: None,
            closed: false,
        };
        sock.prefill();

        let kernel = MockKernel {
            fill: fill_kernel,
            completion: comp_kernel,
            rx: rx_kernel,
            tx: tx_kernel,
            umem_base,
            umem_len,
        };
        (sock, kernel)
    }
}

#[cfg(test)]
mod tests {
    use super::mock::mock_socket;
    use super::*;

    #[test]
    fn rx_frames_cycle_through_fill_and_back() {
        let (mut sock, mut kernel) = mock_socket(2048, 8, 8, 8, 8);
        assert_eq!(kernel.fill_level(), 8);

        assert!(kernel.inject(&[0xaa; 100]));
        assert_eq!(kernel.fill_level(), 7);

        let mut batch = Vec::new();
        assert_eq!(sock.receive(64, &mut batch), 1);
        let (addr, len) = batch[0];
        assert_eq!(len, 100);
        // The frame lives in the RX region and is held by the worker now.
        assert!(addr >= sock.umem.rx_base());
        assert_eq!(sock.frame(addr, len).unwrap(), &[0xaa; 100][..]);
        assert_eq!(kernel.fill_level(), 7);

        sock.recycle_frames();
        assert_eq!(kernel.fill_level(), 8);

        // The same frame address is usable again.
        assert!(kernel.inject(&[0xbb; 50]));
        assert_eq!(sock.receive(64, &mut batch), 1);
        assert_eq!(sock.frame(batch[0].0, 50).unwrap(), &[0xbb; 50][..]);
    }

    #[test]
    fn receive_returns_descriptors_in_ring_order() {
        let (mut sock, mut kernel) = mock_socket(2048, 8, 8, 8, 8);
        for i in 0..4u8 {
            assert!(kernel.inject(&[i; 10]));
        }
        let mut batch = Vec::new();
        assert_eq!(sock.receive(64, &mut batch), 4);
        for (i, &(addr, len)) in batch.iter().enumerate() {
            assert_eq!(sock.frame(addr, len).unwrap(), &[i as u8; 10][..]);
        }
    }

    #[test]
    fn tx_cursor_wraps_within_tx_region() {
        let (mut sock, _kernel) = mock_socket(2048, 4, 4, 4, 4);
        let frames: Vec<u32> = (0..6).map(|_| sock.next_tx_frame()).collect();
        assert_eq!(frames, vec![0, 1, 2, 3, 0, 1]);
    }

    #[test]
    fn outstanding_tx_tracks_submissions_minus_completions() {
        let (mut sock, mut kernel) = mock_socket(2048, 8, 8, 8, 8);

        for i in 0..4 {
            let frame_nb = sock.next_tx_frame();
            let addr = sock.tx_frame_addr(frame_nb);
            sock.tx_frame_mut(frame_nb)[..4].copy_from_slice(&[i as u8; 4]);
            assert_eq!(sock.send_one(addr, 60), 1);
        }
        assert_eq!(sock.outstanding_tx(), 4);

        let sent = kernel.take_tx();
        assert_eq!(sent.len(), 4);
        let addrs: Vec<u64> = sent.iter().map(|(a, _)| *a).collect();
        kernel.complete(&addrs);

        // Threshold for an 8-deep ring is 8 completions; 4 are cached but
        // not yet released.
        sock.poll_completions();
        assert_eq!(sock.outstanding_tx(), 4);

        for _ in 0..4 {
            let frame_nb = sock.next_tx_frame();
            let addr = sock.tx_frame_addr(frame_nb);
            assert_eq!(sock.send_one(addr, 60), 1);
        }
        let sent = kernel.take_tx();
        let addrs: Vec<u64> = sent.iter().map(|(a, _)| *a).collect();
        kernel.complete(&addrs);

        sock.poll_completions();
        assert_eq!(sock.outstanding_tx(), 0);
    }

    #[test]
    fn tx_back_pressure_refuses_then_recovers() {
        // 8-slot TX ring with a stalled completion consumer: the 9th send
        // must be refused, and draining completions unblocks the path.
        let (mut sock, mut kernel) = mock_socket(2048, 16, 16, 8, 16);

        for i in 0..8 {
            let frame_nb = sock.next_tx_frame();
            let addr = sock.tx_frame_addr(frame_nb);
            assert_eq!(sock.send_one(addr, 60), 1, "send {i} should fit the ring");
        }
        assert_eq!(sock.outstanding_tx(), 8);

        let frame_nb = sock.next_tx_frame();
        let addr = sock.tx_frame_addr(frame_nb);
        assert_eq!(sock.send_one(addr, 60), 0, "9th send must be refused");

        // The kernel drains the ring and completes everything.
        let sent = kernel.take_tx();
        assert_eq!(sent.len(), 8);
        let addrs: Vec<u64> = sent.iter().map(|(a, _)| *a).collect();
        kernel.complete(&addrs);

        sock.poll_completions();
        assert_eq!(sock.outstanding_tx(), 0);

        assert_eq!(sock.send_one(addr, 60), 1);
    }

    #[test]
    fn manual_reserve_set_submit_reaches_the_kernel() {
        let (mut sock, mut kernel) = mock_socket(2048, 8, 8, 8, 8);

        let (idx, got) = sock.reserve_tx(2);
        assert_eq!(got, 2);
        let a = sock.tx_frame_addr(0);
        let b = sock.tx_frame_addr(1);
        sock.set_tx_desc(idx, a, 60);
        sock.set_tx_desc(idx + 1, b, 61);
        sock.submit_tx(2);
        assert_eq!(sock.outstanding_tx(), 2);

        let sent = kernel.take_tx();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, a);
        assert_eq!(sent[1].0, b);
        assert_eq!(sent[1].1.len(), 61);
    }

    #[test]
    fn send_batch_clamps_and_submits_in_order() {
        let (mut sock, mut kernel) = mock_socket(2048, 8, 8, 8, 8);
        let offsets: Vec<u64> = (0..3).map(|i| sock.tx_frame_addr(i)).collect();
        let lens = [60u32, 61, 62];
        assert_eq!(sock.send_batch(&offsets, &lens, 3), 3);

        let sent = kernel.take_tx();
        assert_eq!(sent.len(), 3);
        for (i, (addr, _)) in sent.iter().enumerate() {
            assert_eq!(*addr, offsets[i]);
        }
    }

    #[test]
    fn classifier_map_entry_lives_and_dies_with_the_socket() {
        let (mut sock, _kernel) = mock_socket(2048, 8, 8, 8, 8);
        let map = XskMapHandle::mock();

        sock.register_in_classifier(map.clone(), 2).unwrap();
        assert_eq!(map.get(2).unwrap(), Some(sock.raw_fd() as u32));

        sock.close();
        assert_eq!(map.get(2).unwrap(), None);

        // Idempotent.
        sock.close();
    }

    #[test]
    fn close_scrubs_only_its_own_entries() {
        let (mut a, _ka) = mock_socket(2048, 8, 8, 8, 8);
        let (mut b, _kb) = mock_socket(2048, 8, 8, 8, 8);
        let map = XskMapHandle::mock();

        a.register_in_classifier(map.clone(), 0).unwrap();
        b.register_in_classifier(map.clone(), 1).unwrap();

        a.close();
        assert_eq!(map.get(0).unwrap(), None);
        assert_eq!(map.get(1).unwrap(), Some(b.raw_fd() as u32));
    }

    #[test]
    fn close_drains_completed_tx() {
        let (mut sock, mut kernel) = mock_socket(2048, 8, 8, 8, 8);
        for _ in 0..3 {
            let frame_nb = sock.next_tx_frame();
            let addr = sock.tx_frame_addr(frame_nb);
            assert_eq!(sock.send_one(addr, 60), 1);
        }
        let sent = kernel.take_tx();
        let addrs: Vec<u64> = sent.iter().map(|(a, _)| *a).collect();
        kernel.complete(&addrs);

        sock.close();
        assert_eq!(sock.outstanding_tx(), 0);
    }

    #[test]
    fn send_after_close_is_refused() {
        let (mut sock, _kernel) = mock_socket(2048, 8, 8, 8, 8);
        sock.close();
        assert_eq!(sock.send_one(0, 60), 0);
    }
}
