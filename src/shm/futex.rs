//! Cross-process wait/wake on a 32-bit word in shared memory
//!
//! On Linux this is a shared (non-private) futex so that waiters in other
//! processes mapping the same file are woken. Elsewhere waiters poll with a
//! short sleep; wakes are no-ops.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Upper bound of a single kernel wait. Waiters re-check their condition at
/// least this often even if a wake is missed.
pub const MAX_WAIT_SLICE: Duration = Duration::from_millis(50);

/// Block while `word` still holds `expected`, for at most `timeout`
/// (capped to [`MAX_WAIT_SLICE`]). Spurious returns are allowed; callers
/// loop on their own condition.
pub fn wait(word: &AtomicU32, expected: u32, timeout: Duration) {
    let timeout = timeout.min(MAX_WAIT_SLICE);
    if word.load(Ordering::Acquire) != expected {
        return;
    }
    sys::wait(word, expected, timeout);
}

/// Wake every waiter blocked on `word`
pub fn wake_all(word: &AtomicU32) {
    sys::wake_all(word);
}

#[cfg(target_os = "linux")]
mod sys {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    pub fn wait(word: &AtomicU32, expected: u32, timeout: Duration) {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        // SAFETY: `word` points to a live, 4-byte aligned u32 for the duration
        // of the call. EAGAIN, EINTR and ETIMEDOUT are all treated as a wakeup.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicU32 as *const u32,
                libc::FUTEX_WAIT,
                expected,
                &ts as *const libc::timespec,
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    pub fn wake_all(word: &AtomicU32) {
        // SAFETY: `word` points to a live, 4-byte aligned u32.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicU32 as *const u32,
                libc::FUTEX_WAKE,
                i32::MAX,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        if ret < 0 {
            tracing::warn!("futex wake failed: {}", std::io::Error::last_os_error());
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    pub fn wait(_word: &AtomicU32, _expected: u32, timeout: Duration) {
        std::thread::sleep(timeout.min(Duration::from_micros(200)));
    }

    pub fn wake_all(_word: &AtomicU32) {}
}
