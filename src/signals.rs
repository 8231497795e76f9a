use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{pthread_sigmask, sigaction};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};

use crate::errors::{Result, TraceError};

// One latch per OS thread: the event loop and every tracer worker observe
// only signals addressed to them via pthread_kill/tgkill.
thread_local! {
    static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);
}

extern "C" fn latch(signum: libc::c_int) {
    LAST_SIGNAL.with(|last| last.store(signum, Ordering::Relaxed));
}

/// Install the latch handler for `handle` and block `block` on the calling
/// thread. Handled signals are unblocked in case the thread inherited a mask
/// that hides them.
pub fn handle_signals(handle: &[Signal], block: &[Signal]) -> Result<()> {
    // fault in the TLS slot before the handler can ever run
    reset_last_signal();

    let mut to_block = SigSet::empty();
    for signal in block {
        to_block.add(*signal);
    }
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&to_block), None).map_err(TraceError::fatal)?;

    let mut to_unblock = SigSet::empty();
    let action = SigAction::new(SigHandler::Handler(latch), SaFlags::empty(), SigSet::empty());
    for signal in handle {
        unsafe { sigaction(*signal, &action) }.map_err(TraceError::fatal)?;
        to_unblock.add(*signal);
    }
    pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&to_unblock), None).map_err(TraceError::fatal)?;
    Ok(())
}

/// The last signal latched on this thread, if any.
pub fn last_signal() -> Option<Signal> {
    let signum = LAST_SIGNAL.with(|last| last.load(Ordering::Relaxed));
    if signum == 0 {
        None
    } else {
        Signal::from_c_int(signum).ok()
    }
}

pub fn reset_last_signal() {
    LAST_SIGNAL.with(|last| last.store(0, Ordering::Relaxed));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_records_a_self_directed_signal() {
        handle_signals(&[Signal::SIGUSR2], &[]).unwrap();
        assert_eq!(last_signal(), None);

        unsafe {
            libc::pthread_kill(libc::pthread_self(), libc::SIGUSR2);
        }
        assert_eq!(last_signal(), Some(Signal::SIGUSR2));

        reset_last_signal();
        assert_eq!(last_signal(), None);
    }

    #[test]
    fn latch_is_per_thread() {
        handle_signals(&[Signal::SIGUSR1], &[]).unwrap();
        unsafe {
            libc::pthread_kill(libc::pthread_self(), libc::SIGUSR1);
        }
        assert_eq!(last_signal(), Some(Signal::SIGUSR1));

        let observed = std::thread::spawn(last_signal).join().unwrap();
        assert_eq!(observed, None);
        reset_last_signal();
    }
}
