use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::Ipv6Net;

use crate::configuration::{TunnelDescriptor, TunnelMode};
use crate::error::{Error, Result};

type IPV4 = (Result<Ipv4Addr>, Result<Ipv4Addr>);
type IPV6 = (Result<Ipv6Addr>, Result<Ipv6Addr>);

/// Builder for a [`TunnelDescriptor`].
///
/// Address conversion errors are kept until [`DescriptorBuilder::build`].
#[derive(Default)]
pub struct DescriptorBuilder {
    mode: Option<Result<TunnelMode>>,
    ipv4: Option<IPV4>,
    ipv6: Option<IPV6>,
    keepalive_address: Option<Result<Ipv6Addr>>,
    keepalive_interval: Option<String>,
    prefix: Option<Result<Ipv6Net>>,
}

impl DescriptorBuilder {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn mode(mut self, mode: TunnelMode) -> Self {
        self.mode = Some(Ok(mode));
        self
    }
    /// Set the mode from the broker's string, e.g. `"v6udpv4"`.
    pub fn mode_str(mut self, mode: &str) -> Self {
        self.mode = Some(mode.parse());
        self
    }
    /// Tunnel endpoints on the IPv4 side.
    pub fn ipv4<IPv4: ToIpv4Address>(mut self, client: IPv4, server: IPv4) -> Self {
        self.ipv4 = Some((client.ipv4(), server.ipv4()));
        self
    }
    /// Tunnel endpoints on the IPv6 side.
    pub fn ipv6<IPv6: ToIpv6Address>(mut self, client: IPv6, server: IPv6) -> Self {
        self.ipv6 = Some((client.ipv6(), server.ipv6()));
        self
    }
    /// Raw keepalive interval in seconds, unparsed.
    pub fn keepalive<S: Into<String>>(mut self, interval: S) -> Self {
        self.keepalive_interval = Some(interval.into());
        self
    }
    /// Defaults to the server IPv6 address.
    pub fn keepalive_address<IPv6: ToIpv6Address>(mut self, address: IPv6) -> Self {
        self.keepalive_address = Some(address.ipv6());
        self
    }
    pub fn prefix<IPv6: ToIpv6Address>(mut self, prefix: IPv6, len: u8) -> Self {
        self.prefix = Some(prefix.ipv6().and_then(|ip| {
            Ipv6Net::new(ip, len)
                .map_err(|_| Error::InvalidConfig(format!("prefix length {len} out of range")))
        }));
        self
    }
    /// Prefix in CIDR notation, e.g. `"2001:db8:100::/48"`.
    pub fn prefix_str(mut self, prefix: &str) -> Self {
        self.prefix = Some(prefix.trim().parse::<Ipv6Net>().map_err(Error::from));
        self
    }
    pub fn build(self) -> Result<TunnelDescriptor> {
        let mode = self
            .mode
            .ok_or_else(|| Error::InvalidConfig("tunnel mode is required".into()))??;
        let (client_v4, server_v4) = self
            .ipv4
            .ok_or_else(|| Error::InvalidConfig("IPv4 endpoints are required".into()))?;
        let (client_v6, server_v6) = self
            .ipv6
            .ok_or_else(|| Error::InvalidConfig("IPv6 endpoints are required".into()))?;
        let server_address_ipv6 = endpoint("server IPv6", server_v6)?;
        let keepalive_address_ipv6 = match self.keepalive_address {
            Some(address) => endpoint("keepalive address", address)?,
            None => server_address_ipv6,
        };
        Ok(TunnelDescriptor {
            mode,
            client_address_ipv4: endpoint("client IPv4", client_v4)?,
            server_address_ipv4: endpoint("server IPv4", server_v4)?,
            client_address_ipv6: endpoint("client IPv6", client_v6)?,
            server_address_ipv6,
            keepalive_address_ipv6,
            keepalive_interval: self.keepalive_interval,
            prefix: self.prefix.transpose()?,
        })
    }
}

/// Something that names an IPv4 endpoint.
pub trait ToIpv4Address {
    fn ipv4(&self) -> Result<Ipv4Addr>;
}
impl ToIpv4Address for Ipv4Addr {
    fn ipv4(&self) -> Result<Ipv4Addr> {
        Ok(*self)
    }
}
impl ToIpv4Address for IpAddr {
    fn ipv4(&self) -> Result<Ipv4Addr> {
        match self {
            IpAddr::V4(ip) => Ok(*ip),
            IpAddr::V6(ip) => Err(Error::InvalidConfig(format!("{ip} is not an IPv4 address"))),
        }
    }
}
impl ToIpv4Address for &str {
    fn ipv4(&self) -> Result<Ipv4Addr> {
        Ok(self.trim().parse()?)
    }
}

/// Something that names an IPv6 endpoint.
pub trait ToIpv6Address {
    fn ipv6(&self) -> Result<Ipv6Addr>;
}
impl ToIpv6Address for Ipv6Addr {
    fn ipv6(&self) -> Result<Ipv6Addr> {
        Ok(*self)
    }
}
impl ToIpv6Address for IpAddr {
    fn ipv6(&self) -> Result<Ipv6Addr> {
        match self {
            IpAddr::V6(ip) => Ok(*ip),
            IpAddr::V4(ip) => Err(Error::InvalidConfig(format!("{ip} is not an IPv6 address"))),
        }
    }
}
impl ToIpv6Address for &str {
    fn ipv6(&self) -> Result<Ipv6Addr> {
        Ok(self.trim().parse()?)
    }
}

/// Name the endpoint that failed to convert.
fn endpoint<T>(what: &str, value: Result<T>) -> Result<T> {
    value.map_err(|e| Error::InvalidConfig(format!("{what}: {e}")))
}
