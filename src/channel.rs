use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::wire::message::{FIXED_ID_LEN, FIXED_STRING_LEN};
use crate::wire::frame_header::NO_SHARD;

/// The identity of a channel, and at the same time of the links serving it on either side
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);
impl ChannelId {
    pub fn new(id: impl Into<String>) -> ChannelId {
        ChannelId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        ChannelId::new(value)
    }
}

/// Static configuration of a channel: primary and secondary endpoints for TCP (login and
///  snapshot), UDP data and UDP resend traffic, plus login credentials and an optional shard
///  filter.
///
/// Secondary endpoints are optional, and IP and port fall back to their primary counterparts
///  independently. A descriptor is immutable once handed to an engine - changing a channel
///  means handing the engine a new descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub id: ChannelId,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub shard_id: Option<u8>,

    pub tcp_ip: Ipv4Addr,
    #[serde(default)]
    pub tcp_ip2: Option<Ipv4Addr>,
    pub tcp_port: u16,
    #[serde(default)]
    pub tcp_port2: Option<u16>,
    #[serde(default)]
    pub tcp_username: String,
    #[serde(default)]
    pub tcp_password: String,

    pub udp_ip: Ipv4Addr,
    #[serde(default)]
    pub udp_ip2: Option<Ipv4Addr>,
    pub udp_port: u16,
    #[serde(default)]
    pub udp_port2: Option<u16>,

    pub resend_ip: Ipv4Addr,
    #[serde(default)]
    pub resend_ip2: Option<Ipv4Addr>,
    pub resend_port: u16,
    #[serde(default)]
    pub resend_port2: Option<u16>,
}

fn default_enabled() -> bool {
    true
}

impl ChannelDescriptor {
    pub fn new(id: impl Into<ChannelId>, tcp: SocketAddrV4, udp: SocketAddrV4, resend: SocketAddrV4) -> ChannelDescriptor {
        ChannelDescriptor {
            id: id.into(),
            enabled: true,
            shard_id: None,
            tcp_ip: *tcp.ip(),
            tcp_ip2: None,
            tcp_port: tcp.port(),
            tcp_port2: None,
            tcp_username: String::new(),
            tcp_password: String::new(),
            udp_ip: *udp.ip(),
            udp_ip2: None,
            udp_port: udp.port(),
            udp_port2: None,
            resend_ip: *resend.ip(),
            resend_ip2: None,
            resend_port: resend.port(),
            resend_port2: None,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> ChannelDescriptor {
        self.tcp_username = username.to_string();
        self.tcp_password = password.to_string();
        self
    }

    pub fn with_shard(mut self, shard_id: u8) -> ChannelDescriptor {
        self.shard_id = Some(shard_id);
        self
    }

    pub fn with_secondary(mut self, tcp: SocketAddrV4, udp: SocketAddrV4, resend: SocketAddrV4) -> ChannelDescriptor {
        self.tcp_ip2 = Some(*tcp.ip());
        self.tcp_port2 = Some(tcp.port());
        self.udp_ip2 = Some(*udp.ip());
        self.udp_port2 = Some(udp.port());
        self.resend_ip2 = Some(*resend.ip());
        self.resend_port2 = Some(resend.port());
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id.as_str().is_empty() {
            bail!("channel id must not be empty");
        }
        if self.id.as_str().len() > FIXED_ID_LEN {
            bail!("channel id {} exceeds {} bytes", self.id, FIXED_ID_LEN);
        }
        if self.tcp_port == 0 || self.udp_port == 0 || self.resend_port == 0 {
            bail!("channel {}: TCP, UDP and resend ports must be configured", self.id);
        }
        if [self.tcp_port2, self.udp_port2, self.resend_port2].contains(&Some(0)) {
            bail!("channel {}: secondary ports must not be 0", self.id);
        }
        if self.tcp_username.len() > FIXED_STRING_LEN || self.tcp_password.len() > FIXED_STRING_LEN {
            bail!("channel {}: credentials exceed {} bytes", self.id, FIXED_STRING_LEN);
        }
        if self.shard_id == Some(NO_SHARD) {
            bail!("channel {}: shard {} is reserved for 'no shard'", self.id, NO_SHARD);
        }
        Ok(())
    }

    /// The endpoint triple to use for a connection attempt. `secondary` is derived from the
    ///  parity of the link's reconnect counter, so successive attempts alternate.
    pub fn endpoints(&self, secondary: bool) -> Endpoints {
        if !secondary {
            return Endpoints {
                tcp: SocketAddrV4::new(self.tcp_ip, self.tcp_port),
                udp: SocketAddrV4::new(self.udp_ip, self.udp_port),
                resend: SocketAddrV4::new(self.resend_ip, self.resend_port),
            };
        }

        Endpoints {
            tcp: SocketAddrV4::new(
                self.tcp_ip2.unwrap_or(self.tcp_ip),
                self.tcp_port2.unwrap_or(self.tcp_port),
            ),
            udp: SocketAddrV4::new(
                self.udp_ip2.unwrap_or(self.udp_ip),
                self.udp_port2.unwrap_or(self.udp_port),
            ),
            resend: SocketAddrV4::new(
                self.resend_ip2.unwrap_or(self.resend_ip),
                self.resend_port2.unwrap_or(self.resend_port),
            ),
        }
    }

    /// Resend replies are told apart from live traffic by their source IP
    pub fn is_resend_ip(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(ip) => ip == self.resend_ip || Some(ip) == self.resend_ip2,
            IpAddr::V6(_) => false,
        }
    }

    pub fn credentials_match(&self, username: &str, password: &str) -> bool {
        self.tcp_username == username && self.tcp_password == password
    }

    /// Shard filter for frames on the data path. A channel without a shard accepts everything,
    ///  and frames without a shard pass every filter.
    pub fn accepts_shard(&self, shard: u8) -> bool {
        match self.shard_id {
            None => true,
            Some(_) if shard == NO_SHARD => true,
            Some(s) => s == shard,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Endpoints {
    pub tcp: SocketAddrV4,
    pub udp: SocketAddrV4,
    pub resend: SocketAddrV4,
}
impl Endpoints {
    pub fn resend_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.resend)
    }
}

impl Display for Endpoints {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TCP {} UDP {} Resend {}", self.tcp, self.udp, self.resend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn addr(a: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, a), port)
    }

    fn descriptor() -> ChannelDescriptor {
        ChannelDescriptor::new("md1", addr(1, 9000), addr(2, 9001), addr(3, 9002))
    }

    #[test]
    fn test_endpoints_primary() {
        let d = descriptor().with_secondary(addr(11, 9100), addr(12, 9101), addr(13, 9102));
        assert_eq!(d.endpoints(false), Endpoints { tcp: addr(1, 9000), udp: addr(2, 9001), resend: addr(3, 9002) });
        assert_eq!(d.endpoints(true), Endpoints { tcp: addr(11, 9100), udp: addr(12, 9101), resend: addr(13, 9102) });
    }

    #[test]
    fn test_endpoints_secondary_falls_back_per_component() {
        let mut d = descriptor();
        d.tcp_ip2 = Some(Ipv4Addr::new(10, 0, 0, 11));
        d.udp_port2 = Some(9201);

        let secondary = d.endpoints(true);
        assert_eq!(secondary.tcp, addr(11, 9000));
        assert_eq!(secondary.udp, addr(2, 9201));
        assert_eq!(secondary.resend, addr(3, 9002));
    }

    #[rstest]
    #[case::primary(Ipv4Addr::new(10, 0, 0, 3), true)]
    #[case::secondary(Ipv4Addr::new(10, 0, 0, 13), true)]
    #[case::data_sender(Ipv4Addr::new(10, 0, 0, 2), false)]
    fn test_is_resend_ip(#[case] ip: Ipv4Addr, #[case] expected: bool) {
        let d = descriptor().with_secondary(addr(11, 9100), addr(12, 9101), addr(13, 9102));
        assert_eq!(d.is_resend_ip(IpAddr::V4(ip)), expected);
    }

    #[rstest]
    #[case::valid(descriptor(), true)]
    #[case::empty_id(ChannelDescriptor { id: ChannelId::new(""), ..descriptor() }, false)]
    #[case::long_id(ChannelDescriptor { id: ChannelId::new("123456789"), ..descriptor() }, false)]
    #[case::no_tcp_port(ChannelDescriptor { tcp_port: 0, ..descriptor() }, false)]
    #[case::zero_secondary_port(ChannelDescriptor { resend_port2: Some(0), ..descriptor() }, false)]
    #[case::reserved_shard(descriptor().with_shard(NO_SHARD), false)]
    #[case::shard(descriptor().with_shard(3), true)]
    #[case::long_password(descriptor().with_credentials("user", &"x".repeat(33)), false)]
    fn test_validate(#[case] d: ChannelDescriptor, #[case] expected: bool) {
        assert_eq!(d.validate().is_ok(), expected);
    }

    #[rstest]
    #[case::unfiltered(None, 7, true)]
    #[case::unfiltered_no_shard(None, NO_SHARD, true)]
    #[case::matching(Some(7), 7, true)]
    #[case::other(Some(7), 8, false)]
    #[case::no_shard(Some(7), NO_SHARD, true)]
    fn test_accepts_shard(#[case] shard_id: Option<u8>, #[case] shard: u8, #[case] expected: bool) {
        let d = ChannelDescriptor { shard_id, ..descriptor() };
        assert_eq!(d.accepts_shard(shard), expected);
    }
}
