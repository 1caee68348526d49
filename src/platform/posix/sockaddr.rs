use std::net::Ipv6Addr;

/// Build a `sockaddr_in6` for `addr`, port 0 unless given.
pub(crate) fn sockaddr_in6(addr: Ipv6Addr, port: u16) -> libc::sockaddr_in6 {
    let mut sa: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    {
        sa.sin6_len = std::mem::size_of::<libc::sockaddr_in6>() as u8;
    }
    sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    sa.sin6_port = port.to_be();
    sa.sin6_addr = libc::in6_addr {
        s6_addr: addr.octets(),
    };
    sa
}
