use std::io;
use std::os::fd::RawFd;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, geteuid, ForkResult, Pid};

use crate::platform::{Fork, ProcessControl, ProcessOutcome};

/// [`ProcessControl`] backed by the host's POSIX calls.
#[derive(Clone, Copy, Debug, Default)]
pub struct Posix;

impl ProcessControl for Posix {
    fn is_privileged(&self) -> bool {
        geteuid().is_root()
    }

    fn daemonize(&self) -> io::Result<()> {
        daemon()
    }

    fn fork(&self) -> io::Result<Fork> {
        // The child only closes a descriptor, spawns the script and `_exit`s.
        match unsafe { fork() }? {
            ForkResult::Child => Ok(Fork::Child),
            ForkResult::Parent { child } => Ok(Fork::Parent(child)),
        }
    }

    fn wait(&self, child: Pid) -> io::Result<(Pid, ProcessOutcome)> {
        loop {
            match waitpid(child, None) {
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
                Ok(status) => {
                    if let Some(reaped) = reaped(status) {
                        return Ok(reaped);
                    }
                }
            }
        }
    }

    fn try_wait(&self, child: Pid) -> io::Result<Option<(Pid, ProcessOutcome)>> {
        loop {
            match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
                Ok(status) => return Ok(reaped(status)),
            }
        }
    }

    fn kill(&self, child: Pid) -> io::Result<()> {
        Ok(kill(child, Signal::SIGKILL)?)
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        Ok(nix::unistd::close(fd)?)
    }

    fn exit(&self, code: i32) -> ! {
        unsafe { libc::_exit(code) }
    }
}

/// `None` for states that do not end the child.
fn reaped(status: WaitStatus) -> Option<(Pid, ProcessOutcome)> {
    match status {
        WaitStatus::Exited(pid, code) => Some((pid, ProcessOutcome::exited(code))),
        WaitStatus::Signaled(pid, signal, _) => {
            Some((pid, ProcessOutcome::signaled(signal as i32)))
        }
        _ => None,
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_vendor = "apple")] {
        fn daemon() -> io::Result<()> {
            #[allow(deprecated)]
            match unsafe { libc::daemon(1, 0) } {
                0 => Ok(()),
                _ => Err(io::Error::last_os_error()),
            }
        }
    } else {
        fn daemon() -> io::Result<()> {
            Ok(nix::unistd::daemon(true, false)?)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reaped_states() {
        let pid = Pid::from_raw(42);
        assert_eq!(
            reaped(WaitStatus::Exited(pid, 3)),
            Some((pid, ProcessOutcome::exited(3)))
        );
        assert_eq!(
            reaped(WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            Some((pid, ProcessOutcome::signaled(libc::SIGTERM)))
        );
        assert_eq!(reaped(WaitStatus::StillAlive), None);
        assert_eq!(reaped(WaitStatus::Continued(pid)), None);
    }
}
