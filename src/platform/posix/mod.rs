mod sockaddr;
pub(crate) use sockaddr::sockaddr_in6;

mod fd;
pub(crate) use self::fd::Fd;

mod process;
pub use self::process::Posix;
