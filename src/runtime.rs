//! Process-wide transport readiness
//!
//! The transport collaborator needs one-time process initialization before
//! any session can connect. This module owns that state as a single
//! idempotent guard: `startup` and `shutdown` may be called from any number
//! of call sites, in any order, as often as needed.
//!
//! While the runtime is shut down every channel reports itself as closed,
//! and channel I/O fails with [`SshError::ChannelClosed`](crate::SshError).

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

static READY: AtomicBool = AtomicBool::new(false);

/// Initialize the transport runtime. Returns `true` if this call performed
/// the initialization, `false` if it was already initialized.
pub fn startup() -> bool {
    let first = !READY.swap(true, Ordering::SeqCst);
    if first {
        debug!("SSH runtime initialized");
    }
    first
}

/// Tear down the transport runtime. Returns `true` if this call performed
/// the teardown, `false` if it was not initialized.
pub fn shutdown() -> bool {
    let was_ready = READY.swap(false, Ordering::SeqCst);
    if was_ready {
        debug!("SSH runtime shut down");
    }
    was_ready
}

/// Whether the transport runtime is currently initialized.
#[must_use]
pub fn is_ready() -> bool {
    READY.load(Ordering::SeqCst)
}
