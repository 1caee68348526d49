use std::io;
use std::net::Ipv6Addr;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::time::Duration;

use libc::{self, fcntl, FD_CLOEXEC, F_GETFD, F_SETFD};

use crate::platform::posix::sockaddr_in6;

/// Owned POSIX descriptor, closed on drop.
pub(crate) struct Fd {
    pub(crate) inner: RawFd,
}

impl Fd {
    pub fn new(value: RawFd) -> io::Result<Self> {
        if value < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self::new_uncheck(value))
    }
    pub fn new_uncheck(value: RawFd) -> Self {
        Fd { inner: value }
    }

    /// Raw ICMPv6 socket, close-on-exec from the start.
    pub fn icmpv6() -> io::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_INET6, libc::SOCK_RAW, libc::IPPROTO_ICMPV6) };
        let fd = Fd::new(fd)?;
        fd.set_cloexec()?;
        Ok(fd)
    }

    /// Keep this descriptor out of any program exec'd later.
    pub fn set_cloexec(&self) -> io::Result<()> {
        match unsafe { fcntl(self.inner, F_SETFD, fcntl(self.inner, F_GETFD) | FD_CLOEXEC) } {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }

    pub fn set_recv_timeout(&self, timeout: Duration) -> io::Result<()> {
        // A zero timeval means "block forever" to the kernel.
        let timeout = timeout.max(Duration::from_millis(1));
        let tv = libc::timeval {
            tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let rc = unsafe {
            libc::setsockopt(
                self.inner,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn bind_v6(&self, addr: Ipv6Addr) -> io::Result<()> {
        let sa = sockaddr_in6(addr, 0);
        let rc = unsafe {
            libc::bind(
                self.inner,
                &sa as *const libc::sockaddr_in6 as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[inline]
    pub fn send_to_v6(&self, buf: &[u8], addr: Ipv6Addr) -> io::Result<usize> {
        let sa = sockaddr_in6(addr, 0);
        let amount = unsafe {
            libc::sendto(
                self.inner,
                buf.as_ptr() as *const _,
                buf.len(),
                0,
                &sa as *const libc::sockaddr_in6 as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        };
        if amount < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(amount as usize)
    }

    #[inline]
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.as_raw_fd();
        let amount = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        if amount < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(amount as usize)
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner
    }
}

impl IntoRawFd for Fd {
    fn into_raw_fd(mut self) -> RawFd {
        let fd = self.inner;
        self.inner = -1;
        fd
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        if self.inner >= 0 {
            unsafe { libc::close(self.inner) };
        }
    }
}
