//! Process-level resource and scheduling setup: memory-lock limits, worker
//! CPU pinning and realtime priority, and the root check.

use std::io;

use anyhow::{bail, Result};
use nix::sys::resource::{setrlimit, Resource, RLIM_INFINITY};
use tracing::{debug, info, warn};

/// AF_XDP pins the UMEM, which counts against RLIMIT_MEMLOCK. Raise it to
/// unlimited; failure is survivable until UMEM registration actually hits
/// the limit, so only warn.
pub fn raise_memlock_limit() {
    match setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY) {
        Ok(()) => debug!("RLIMIT_MEMLOCK raised to unlimited"),
        Err(e) => warn!(
            error = %e,
            "failed to raise RLIMIT_MEMLOCK; UMEM registration may fail"
        ),
    }
}

/// Pin the calling worker thread to its queue's core. Workers start at
/// core 1; core 0 is left to interrupt handling.
pub fn pin_to_core(queue_id: usize) -> bool {
    let Some(cores) = core_affinity::get_core_ids() else {
        debug!("CPU core enumeration unavailable, leaving worker unpinned");
        return false;
    };
    let wanted = queue_id + 1;
    match cores.into_iter().find(|core| core.id == wanted) {
        Some(core) => {
            let pinned = core_affinity::set_for_current(core);
            if pinned {
                info!(queue_id, core = wanted, "worker pinned to CPU core");
            } else {
                warn!(queue_id, core = wanted, "failed to pin worker to CPU core");
            }
            pinned
        }
        None => {
            debug!(queue_id, core = wanted, "not enough cores, leaving worker unpinned");
            false
        }
    }
}

/// Best-effort SCHED_FIFO for the calling worker thread.
pub fn try_set_realtime_priority() {
    let param = libc::sched_param { sched_priority: 10 };
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret == 0 {
        info!("worker scheduled with SCHED_FIFO");
    } else {
        debug!(
            error = %io::Error::last_os_error(),
            "SCHED_FIFO unavailable, keeping default scheduling"
        );
    }
}

/// AF_XDP socket creation and classifier attachment need root.
pub fn require_root() -> Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        bail!("must be run as root for AF_XDP access (try sudo)");
    }
    Ok(())
}
