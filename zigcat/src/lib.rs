//! zigcat core: a single thread per listening endpoint drives a non-blocking
//! event loop; exec sessions shuttle bytes between a socket and a child
//! process through platform-specific backends.

pub mod config;
pub mod exec;
pub mod net;
pub mod shared;

/// Process-wide graceful-shutdown flag. Signal handling sets it; every event
/// loop observes it at the top of each iteration.
pub mod shutdown {
    use std::sync::atomic::{AtomicBool, Ordering};

    static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

    pub fn request() {
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    pub fn requested() -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Test hook; production code never clears the flag.
    pub fn reset() {
        SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
    }
}
