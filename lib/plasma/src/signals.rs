use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Installs process signal handling: `SIGINT`/`SIGTERM` request a graceful
/// shutdown (picked up by the reactor on its next tick), `SIGPIPE` is
/// ignored so peer resets surface as write errors instead of killing the
/// process.
pub fn install() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        let handler = on_terminate as extern "C" fn(libc::c_int);
        libc::signal(libc::SIGINT, handler as usize);
        libc::signal(libc::SIGTERM, handler as usize);
    }
}

/// True once a termination signal arrived.
#[inline]
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Test hook; also lets a supervisor re-arm after a handled shutdown.
pub fn reset() {
    SHUTDOWN.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_roundtrip() {
        reset();
        assert!(!shutdown_requested());
        on_terminate(libc::SIGTERM);
        assert!(shutdown_requested());
        reset();
        assert!(!shutdown_requested());
    }
}
