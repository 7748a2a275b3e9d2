//! Classifier lifecycle manager.
//!
//! Loads the XDP classifier ELF, attaches it to the capture interface,
//! writes the target (ip, port) tuple into `config_map`, and hands out
//! handles to `xsks_map` so each socket wrapper can register and later
//! scrub its own entry. Detaches when dropped; the process holds exactly
//! one of these.

use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use aya::maps::{Array, Map};
use aya::programs::{Xdp, XdpFlags};
use aya::Ebpf;
use tracing::{debug, info, warn};

use replicator_common::FilterConfig;

pub use replicator_common::SOCKET_MAP_ENTRIES;

/// Program symbol inside the classifier ELF.
const PROGRAM_NAME: &str = "unicast_filter";

pub struct Classifier {
    bpf: Ebpf,
    attached: Option<String>,
}

impl Classifier {
    /// Load the classifier from its compiled ELF bytes.
    pub fn load(ebpf_bytes: &[u8]) -> Result<Self> {
        let mut bpf = Ebpf::load(ebpf_bytes).context("loading XDP classifier")?;

        if let Err(e) = aya_log::EbpfLogger::init(&mut bpf) {
            debug!("classifier logging not available: {e}");
        }

        Ok(Self {
            bpf,
            attached: None,
        })
    }

    /// Attach to a network interface.
    ///
    /// In native mode the driver hook is tried first with an SKB (generic)
    /// fallback; otherwise SKB mode is used directly. Attaching replaces
    /// any prior program on the hook, so a stale attachment from a crashed
    /// run does not block startup.
    pub fn attach(&mut self, iface: &str, native: bool) -> Result<()> {
        let program: &mut Xdp = self
            .bpf
            .program_mut(PROGRAM_NAME)
            .with_context(|| format!("XDP program '{PROGRAM_NAME}' not found"))?
            .try_into()
            .context("program type mismatch (expected Xdp)")?;

        program.load().context("loading XDP classifier program")?;

        if native {
            match program.attach(iface, XdpFlags::default()) {
                Ok(_link_id) => {
                    info!(interface = iface, mode = "native", "attached classifier");
                }
                Err(native_err) => {
                    warn!(
                        interface = iface,
                        error = %native_err,
                        "native XDP attach failed, trying SKB mode"
                    );
                    program.attach(iface, XdpFlags::SKB_MODE).with_context(|| {
                        format!(
                            "attaching classifier to {} (both native and SKB failed; native error: {})",
                            iface, native_err
                        )
                    })?;
                    info!(interface = iface, mode = "skb", "attached classifier");
                }
            }
        } else {
            program
                .attach(iface, XdpFlags::SKB_MODE)
                .with_context(|| format!("attaching classifier to {} in SKB mode", iface))?;
            info!(interface = iface, mode = "skb", "attached classifier");
        }

        self.attached = Some(iface.to_string());
        Ok(())
    }

    /// Write the target tuple into `config_map[0]`.
    ///
    /// A missing map is a soft error: the classifier then matches nothing
    /// and all traffic stays on the kernel path.
    pub fn configure(&mut self, target_ip: Ipv4Addr, target_port: u16) -> Result<()> {
        let Some(map) = self.bpf.map_mut("config_map") else {
            warn!("config_map not found; classifier will not redirect any traffic");
            return Ok(());
        };
        let mut config: Array<_, FilterConfig> =
            map.try_into().context("config_map type mismatch")?;

        let record = FilterConfig {
            target_ip: u32::from(target_ip).to_be(),
            target_port: target_port.to_be(),
            _pad: 0,
        };
        config
            .set(0, record, 0)
            .context("updating classifier config_map")?;

        info!(
            target_ip = %target_ip,
            target_port,
            "configured classifier filter"
        );
        Ok(())
    }

    /// Handle to `xsks_map`, located by name.
    pub fn socket_map(&self) -> Result<XskMapHandle> {
        let map = self
            .bpf
            .map("xsks_map")
            .context("xsks_map not found (classifier not loaded?)")?;
        let Map::XskMap(data) = map else {
            bail!("xsks_map has unexpected map type");
        };
        let fd = data
            .fd()
            .as_fd()
            .try_clone_to_owned()
            .context("cloning xsks_map fd")?;
        Ok(XskMapHandle::Bpf(Arc::new(fd)))
    }

    /// Detach from the interface. Dropping the classifier has the same
    /// effect; this exists so main can order it after worker shutdown and
    /// log it.
    pub fn detach(self) -> Result<()> {
        if let Some(ref iface) = self.attached {
            info!(interface = %iface, "detaching classifier");
        }
        // The Ebpf object is dropped here, which detaches the program.
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Socket map handle
// ---------------------------------------------------------------------------

/// A shareable reference to `xsks_map`. Each socket wrapper keeps one so it
/// can remove its own entry at close time, after the classifier has moved
/// on.
#[derive(Clone)]
pub enum XskMapHandle {
    Bpf(Arc<OwnedFd>),
    #[cfg(test)]
    Mock(Arc<std::sync::Mutex<std::collections::BTreeMap<u32, u32>>>),
}

impl XskMapHandle {
    #[cfg(test)]
    pub fn mock() -> Self {
        Self::Mock(Arc::new(std::sync::Mutex::new(
            std::collections::BTreeMap::new(),
        )))
    }

    pub fn set(&self, queue_id: u32, sock_fd: RawFd) -> io::Result<()> {
        match self {
            Self::Bpf(fd) => bpf_map_update(fd.as_raw_fd(), queue_id, sock_fd as u32),
            #[cfg(test)]
            Self::Mock(map) => {
                map.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(queue_id, sock_fd as u32);
                Ok(())
            }
        }
    }

    pub fn get(&self, queue_id: u32) -> io::Result<Option<u32>> {
        match self {
            Self::Bpf(fd) => bpf_map_lookup(fd.as_raw_fd(), queue_id),
            #[cfg(test)]
            Self::Mock(map) => Ok(map
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&queue_id)
                .copied()),
        }
    }

    /// Remove an entry. A missing key is not an error.
    pub fn delete(&self, queue_id: u32) -> io::Result<()> {
        match self {
            Self::Bpf(fd) => bpf_map_delete(fd.as_raw_fd(), queue_id),
            #[cfg(test)]
            Self::Mock(map) => {
                map.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&queue_id);
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Raw bpf(2) map operations
// ---------------------------------------------------------------------------
//
// aya covers registration through its typed maps, but removing a single
// entry from an XSKMAP at socket close time needs the plain map syscalls
// on the raw fd.

const BPF_MAP_LOOKUP_ELEM: libc::c_long = 1;
const BPF_MAP_UPDATE_ELEM: libc::c_long = 2;
const BPF_MAP_DELETE_ELEM: libc::c_long = 3;
const BPF_ANY: u64 = 0;

/// The map-element subset of `union bpf_attr`. `key` and `value` are
/// userspace pointers.
#[repr(C)]
#[derive(Default)]
struct BpfMapAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

fn bpf_map_op(cmd: libc::c_long, attr: &BpfMapAttr) -> io::Result<()> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *const BpfMapAttr,
            mem::size_of::<BpfMapAttr>() as libc::c_ulong,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn bpf_map_update(map_fd: RawFd, key: u32, value: u32) -> io::Result<()> {
    let attr = BpfMapAttr {
        map_fd: map_fd as u32,
        key: &key as *const u32 as u64,
        value: &value as *const u32 as u64,
        flags: BPF_ANY,
        ..Default::default()
    };
    bpf_map_op(BPF_MAP_UPDATE_ELEM, &attr)
}

fn bpf_map_lookup(map_fd: RawFd, key: u32) -> io::Result<Option<u32>> {
    let mut value = 0u32;
    let attr = BpfMapAttr {
        map_fd: map_fd as u32,
        key: &key as *const u32 as u64,
        value: &mut value as *mut u32 as u64,
        ..Default::default()
    };
    match bpf_map_op(BPF_MAP_LOOKUP_ELEM, &attr) {
        Ok(()) => Ok(Some(value)),
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(None),
        Err(e) => Err(e),
    }
}

fn bpf_map_delete(map_fd: RawFd, key: u32) -> io::Result<()> {
    let attr = BpfMapAttr {
        map_fd: map_fd as u32,
        key: &key as *const u32 as u64,
        ..Default::default()
    };
    match bpf_map_op(BPF_MAP_DELETE_ELEM, &attr) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
        Err(e) => Err(e),
    }
}
