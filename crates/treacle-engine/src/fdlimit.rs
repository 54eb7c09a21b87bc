//! File-descriptor budget.
//!
//! The pool wants one descriptor per connection plus a fixed reserve for
//! stdio, the poll instance, the probe socket, and the report files. At
//! startup the soft `RLIMIT_NOFILE` is raised as far as the hard limit
//! allows; when even that cannot carry the requested pool, the target is
//! shrunk and the adjustment logged. Nothing here is fatal: a limit that
//! cannot be raised just means connects fail later and the ramp-up stops
//! early on its own.

use std::io;

use tracing::{info, warn};

/// Descriptors kept out of the pool budget: stdio, the poll instance, the
/// probe socket, report files, and spare.
pub const RESERVED_FDS: usize = 10;

/// Caps a requested pool size to what `hard_limit` descriptors can carry.
pub fn effective_connection_target(requested: usize, hard_limit: usize) -> usize {
    if hard_limit >= requested + RESERVED_FDS {
        requested
    } else {
        hard_limit.saturating_sub(RESERVED_FDS)
    }
}

/// Raises the soft open-files limit toward the hard one and returns the
/// connection target the budget supports.
pub fn apply_fd_budget(requested: usize) -> usize {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) } != 0 {
        warn!(
            error = %io::Error::last_os_error(),
            "cannot read the open-files limit"
        );
        return requested;
    }

    let needed = (requested + RESERVED_FDS) as libc::rlim_t;
    if lim.rlim_cur == libc::RLIM_INFINITY || lim.rlim_cur >= needed {
        return requested;
    }

    let effective = if lim.rlim_max == libc::RLIM_INFINITY || lim.rlim_max >= needed {
        lim.rlim_cur = needed;
        requested
    } else {
        lim.rlim_cur = lim.rlim_max;
        let shrunk = effective_connection_target(requested, lim.rlim_max as usize);
        info!(
            hard_limit = lim.rlim_max,
            target = shrunk,
            "hit the open-files limit, decreasing target connection number"
        );
        shrunk
    };

    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &lim) } != 0 {
        warn!(
            error = %io::Error::last_os_error(),
            "cannot raise the open-files limit"
        );
    } else {
        info!(limit = lim.rlim_cur, "open-files limit set");
    }
    effective
}
