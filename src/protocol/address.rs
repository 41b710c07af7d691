//! Destination addresses
//!
//! Wire form: address-type byte, then the address body, then a big-endian
//! port. 0x01 IPv4, 0x02 length-prefixed domain, 0x03 IPv6.

use bytes::{BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::lookup_host;

use crate::error::CodecError;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x02;
const ATYP_IPV6: u8 = 0x03;

/// A destination: IP or domain plus port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    IPv4(Ipv4Addr, u16),
    IPv6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::IPv4(ip, port) => write!(f, "{}:{}", ip, port),
            Address::IPv6(ip, port) => write!(f, "[{}]:{}", ip, port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl Address {
    /// Decode an address from the front of `buf`, returning it together
    /// with the number of bytes consumed. `NeedMoreData` when the buffer
    /// is too short to decide.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let Some(&atyp) = buf.first() else {
            return Err(CodecError::NeedMoreData);
        };
        match atyp {
            ATYP_IPV4 => {
                if buf.len() < 7 {
                    return Err(CodecError::NeedMoreData);
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&buf[1..5]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok((Address::IPv4(Ipv4Addr::from(octets), port), 7))
            }
            ATYP_IPV6 => {
                if buf.len() < 19 {
                    return Err(CodecError::NeedMoreData);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok((Address::IPv6(Ipv6Addr::from(octets), port), 19))
            }
            ATYP_DOMAIN => {
                let Some(&len) = buf.get(1) else {
                    return Err(CodecError::NeedMoreData);
                };
                let len = len as usize;
                if len == 0 {
                    return Err(CodecError::Malformed("empty domain"));
                }
                let total = 2 + len + 2;
                if buf.len() < total {
                    return Err(CodecError::NeedMoreData);
                }
                let domain = std::str::from_utf8(&buf[2..2 + len])
                    .map_err(|_| CodecError::Malformed("invalid domain encoding"))?
                    .to_string();
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Ok((Address::Domain(domain, port), total))
            }
            _ => Err(CodecError::Malformed("invalid address type")),
        }
    }

    /// Append the wire form to `buf`
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        match self {
            Address::IPv4(ip, port) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&ip.octets());
                buf.put_u16(*port);
            }
            Address::IPv6(ip, port) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&ip.octets());
                buf.put_u16(*port);
            }
            Address::Domain(domain, port) => {
                // One-byte length prefix; anything longer would encode a
                // header that disagrees with its own length
                if domain.is_empty() || domain.len() > u8::MAX as usize {
                    return Err(CodecError::Malformed("invalid domain length"));
                }
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
        Ok(())
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::IPv4(_, port) | Address::IPv6(_, port) | Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::IPv4(ip, _) => ip.to_string(),
            Address::IPv6(ip, _) => ip.to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Resolve to a socket address, performing DNS for domains
    pub async fn to_socket_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            Address::IPv4(ip, port) => Ok(SocketAddr::new(IpAddr::V4(*ip), *port)),
            Address::IPv6(ip, port) => Ok(SocketAddr::new(IpAddr::V6(*ip), *port)),
            Address::Domain(domain, port) => {
                let mut addrs = lookup_host((domain.as_str(), *port)).await?;
                addrs.next().ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no addresses found for {}", domain),
                    )
                })
            }
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::IPv4(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => Address::IPv6(*v6.ip(), v6.port()),
        }
    }
}
