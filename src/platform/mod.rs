use std::io;
use std::os::fd::RawFd;

pub use nix::unistd::Pid;

pub mod posix;
pub use self::posix::Posix;

/// Which side of a fork the caller is on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Fork {
    Child,
    Parent(Pid),
}

/// How a reaped child ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProcessOutcome {
    /// `false` when the child was killed by a signal.
    pub exited: bool,
    /// Exit code, or the signal number when `exited` is `false`.
    pub code: i32,
}

impl ProcessOutcome {
    pub fn exited(code: i32) -> Self {
        ProcessOutcome { exited: true, code }
    }
    pub fn signaled(signal: i32) -> Self {
        ProcessOutcome {
            exited: false,
            code: signal,
        }
    }
    pub fn success(&self) -> bool {
        self.exited && self.code == 0
    }
}

/// Process and privilege primitives used by the local setup.
pub trait ProcessControl {
    /// Whether the effective user is the superuser.
    fn is_privileged(&self) -> bool;
    /// Detach from the controlling terminal and keep running in the background.
    fn daemonize(&self) -> io::Result<()>;
    fn fork(&self) -> io::Result<Fork>;
    /// Block until `child` changes state; yields the pid that was actually reaped.
    fn wait(&self, child: Pid) -> io::Result<(Pid, ProcessOutcome)>;
    /// Like [`ProcessControl::wait`] but returns `None` while `child` is still running.
    fn try_wait(&self, child: Pid) -> io::Result<Option<(Pid, ProcessOutcome)>>;
    fn kill(&self, child: Pid) -> io::Result<()>;
    fn close(&self, fd: RawFd) -> io::Result<()>;
    /// Terminate the current process immediately, without unwinding.
    fn exit(&self, code: i32) -> !;
}

impl<T: ProcessControl + ?Sized> ProcessControl for &T {
    fn is_privileged(&self) -> bool {
        (**self).is_privileged()
    }
    fn daemonize(&self) -> io::Result<()> {
        (**self).daemonize()
    }
    fn fork(&self) -> io::Result<Fork> {
        (**self).fork()
    }
    fn wait(&self, child: Pid) -> io::Result<(Pid, ProcessOutcome)> {
        (**self).wait(child)
    }
    fn try_wait(&self, child: Pid) -> io::Result<Option<(Pid, ProcessOutcome)>> {
        (**self).try_wait(child)
    }
    fn kill(&self, child: Pid) -> io::Result<()> {
        (**self).kill(child)
    }
    fn close(&self, fd: RawFd) -> io::Result<()> {
        (**self).close(fd)
    }
    fn exit(&self, code: i32) -> ! {
        (**self).exit(code)
    }
}
