//! Host-OS signal to task-trigger bridge.
//!
//! `bind_signal(signum, task)` installs a `sigaction` handler whose only
//! action is writing the signal number to a process-wide wake pipe (the one
//! async-signal-safe thing it can do; it touches no locks). A dedicated
//! bridge thread drains the pipe and calls the trigger path for the bound
//! task. Delivery is best-effort: triggers for tasks removed after binding
//! are logged and dropped.
//!
//! The handler and pipe are process-global, so one bridge serves every
//! scheduler in the process; bindings remember which scheduler to trigger.
#![allow(unsafe_code)]

use crate::error::{Error, ErrorKind, Result};
use crate::scheduler::{trigger_by_core, Core};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

/// Write end of the wake pipe; -1 until the first bind.
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

static BRIDGE: OnceLock<Bridge> = OnceLock::new();

struct Bridge {
    /// signum -> (scheduler, task name).
    bindings: Mutex<HashMap<i32, (Weak<Core>, String)>>,
}

/// Routes `signum` to `trigger_task(name)` on the given scheduler core.
pub(crate) fn bind(core: &Arc<Core>, signum: i32, name: &str) -> Result<()> {
    // SIGKILL and SIGSTOP cannot be caught; 0 is not a real signal.
    if !(1..64).contains(&signum) || signum == libc::SIGKILL || signum == libc::SIGSTOP {
        return Err(
            Error::new(ErrorKind::InvalidSignal).with_context(format!("signal {signum}"))
        );
    }
    let bridge = bridge();
    install_handler(signum)?;
    bridge
        .bindings
        .lock()
        .expect("signal bindings poisoned")
        .insert(signum, (Arc::downgrade(core), name.to_string()));
    tracing::info!(signum, task = %name, "signal bound");
    Ok(())
}

/// Lazily creates the wake pipe and spawns the drain thread.
fn bridge() -> &'static Bridge {
    BRIDGE.get_or_init(|| {
        let mut fds = [0i32; 2];
        // SAFETY: fds is a valid two-element array for pipe(2).
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "failed to create signal wake pipe");
        WAKE_FD.store(fds[1], Ordering::Release);
        let read_fd = fds[0];
        std::thread::Builder::new()
            .name("rtsched-signal".into())
            .spawn(move || drain_loop(read_fd))
            .expect("failed to spawn signal bridge thread");
        Bridge {
            bindings: Mutex::new(HashMap::new()),
        }
    })
}

/// The bridge thread: blocks on the pipe and triggers bound tasks.
fn drain_loop(read_fd: i32) {
    let mut buf = [0u8; 64];
    loop {
        // SAFETY: buf is a valid writable buffer for read(2).
        let n = unsafe { libc::read(read_fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n <= 0 {
            let errno = std::io::Error::last_os_error();
            if n < 0 && errno.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            tracing::warn!(%errno, "signal wake pipe closed, bridge exiting");
            return;
        }
        for &byte in &buf[..n as usize] {
            dispatch(i32::from(byte));
        }
    }
}

fn dispatch(signum: i32) {
    let target = bridge()
        .bindings
        .lock()
        .expect("signal bindings poisoned")
        .get(&signum)
        .cloned();
    let Some((core, name)) = target else {
        tracing::debug!(signum, "signal with no binding, ignored");
        return;
    };
    let Some(core) = core.upgrade() else {
        tracing::debug!(signum, task = %name, "signal bound to a dropped scheduler");
        return;
    };
    if let Err(err) = trigger_by_core(&core, &name) {
        tracing::warn!(signum, task = %name, %err, "signal trigger failed");
    }
}

/// The installed handler. Must stay async-signal-safe: one write, no locks,
/// no allocation.
extern "C" fn on_signal(signum: libc::c_int) {
    let fd = WAKE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signum as u8;
        // SAFETY: write(2) of one byte from a live stack slot.
        unsafe {
            let _ = libc::write(fd, std::ptr::addr_of!(byte).cast(), 1);
        }
    }
}

fn install_handler(signum: i32) -> Result<()> {
    // SAFETY: a zeroed sigaction is a valid starting point; the handler is
    // async-signal-safe and SA_RESTART keeps interrupted syscalls quiet.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        let handler: extern "C" fn(libc::c_int) = on_signal;
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
            return Err(Error::new(ErrorKind::InvalidSignal)
                .with_context(format!("sigaction failed for signal {signum}"))
                .with_source(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Scheduler, Task};

    #[test]
    fn rejects_uncatchable_signals() {
        let sched = Scheduler::builder().parallelism(1).build();
        sched
            .add_task(Task::new("e", || {}).event_driven())
            .unwrap();
        for signum in [0, -1, 64, libc::SIGKILL, libc::SIGSTOP] {
            let err = sched.bind_signal(signum, "e").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidSignal, "signum {signum}");
        }
    }

    #[test]
    fn rejects_unknown_task() {
        let sched = Scheduler::builder().parallelism(1).build();
        let err = sched.bind_signal(libc::SIGUSR2, "ghost").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownTask);
    }
}
