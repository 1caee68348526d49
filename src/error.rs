use std::time::Duration;

use crate::configuration::TunnelMode;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("must be root to configure the tunnel interface")]
    NotPrivileged,

    #[error("unable to detach from the controlling terminal")]
    Daemonize(#[source] std::io::Error),

    #[error("tunnel mode {0} is not supported on this platform")]
    UnsupportedMode(TunnelMode),

    #[error("unable to fork")]
    Fork(#[source] std::io::Error),

    #[error("unable to wait for the configuration script")]
    Wait(#[source] std::io::Error),

    #[error("wait returned pid {found}, expected {expected}")]
    WaitMismatch { expected: i32, found: i32 },

    #[error("script terminated abnormally")]
    ScriptAbnormal,

    #[error("script failed to execute correctly (exit code {0})")]
    ScriptFailed(i32),

    #[error("script did not finish within {0:?}")]
    ScriptTimeout(Duration),

    #[error("unknown tunnel mode {0:?}")]
    UnknownMode(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    ParseNum(#[from] std::num::ParseIntError),

    #[error(transparent)]
    AddrParse(#[from] std::net::AddrParseError),

    #[error(transparent)]
    PrefixParse(#[from] ipnet::AddrParseError),
}

impl Error {
    /// Every failure of the local setup collapses to the same flat code;
    /// the cause is only visible through the log line emitted with it.
    pub fn status(&self) -> Status {
        Status::InterfaceSetupFailed
    }
}

/// Flat status code reported to the tunnel main loop.
///
/// The numeric value doubles as the exit code of the configuration child.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(i32)]
pub enum Status {
    NoError = 0,
    InterfaceSetupFailed = 1,
    KeepaliveTimeout = 2,
    KeepaliveError = 3,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }
    pub fn is_ok(self) -> bool {
        self == Status::NoError
    }
}

impl From<&Error> for Status {
    fn from(err: &Error) -> Self {
        err.status()
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::NoError => "no error",
            Status::InterfaceSetupFailed => "interface setup failed",
            Status::KeepaliveTimeout => "keepalive timeout",
            Status::KeepaliveError => "keepalive error",
        };
        f.write_str(s)
    }
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = Error> = ::std::result::Result<T, E>;
