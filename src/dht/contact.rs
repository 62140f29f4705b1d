use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use super::bits::Bitmap;
use super::error::DhtError;
use crate::constants::{COMPACT_CONTACT_LENGTH, NODE_ID_LENGTH};

/// A peer on the network: its id and UDP endpoint.
///
/// Identity is the id alone; every collection in the crate (buckets, the
/// contact store, lookup shortlists) keys contacts by `id`, so one id maps
/// to at most one endpoint at a time.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Contact {
    pub id: Bitmap,
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Contact {
    pub fn new(id: Bitmap, ip: Ipv4Addr, port: u16) -> Self {
        Self { id, ip, port }
    }

    /// Builds a contact from an observed packet source. The transport is
    /// IPv4-only; a v6 source is a protocol violation.
    pub fn from_addr(id: Bitmap, addr: SocketAddr) -> Result<Self, DhtError> {
        match addr.ip() {
            IpAddr::V4(ip) => Ok(Self::new(id, ip, addr.port())),
            IpAddr::V6(_) => Err(DhtError::MalformedMessage("ipv6 sender".into())),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.port)
    }

    /// Decodes the 54-byte compact form: id, IPv4 octets, big-endian port.
    pub fn from_compact(data: &[u8]) -> Result<Self, DhtError> {
        if data.len() != COMPACT_CONTACT_LENGTH {
            return Err(DhtError::MalformedMessage(format!(
                "compact contact is {} bytes, want {}",
                data.len(),
                COMPACT_CONTACT_LENGTH
            )));
        }

        let id = Bitmap::from_bytes(&data[..NODE_ID_LENGTH])?;
        let ip = Ipv4Addr::new(
            data[NODE_ID_LENGTH],
            data[NODE_ID_LENGTH + 1],
            data[NODE_ID_LENGTH + 2],
            data[NODE_ID_LENGTH + 3],
        );
        let port = u16::from_be_bytes([data[NODE_ID_LENGTH + 4], data[NODE_ID_LENGTH + 5]]);

        Ok(Self::new(id, ip, port))
    }

    pub fn to_compact(&self) -> [u8; COMPACT_CONTACT_LENGTH] {
        let mut compact = [0u8; COMPACT_CONTACT_LENGTH];
        compact[..NODE_ID_LENGTH].copy_from_slice(self.id.as_bytes());
        compact[NODE_ID_LENGTH..NODE_ID_LENGTH + 4].copy_from_slice(&self.ip.octets());
        compact[NODE_ID_LENGTH + 4..].copy_from_slice(&self.port.to_be_bytes());
        compact
    }
}

impl fmt::Debug for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}:{}", self.id, self.ip, self.port)
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.ip, self.port)
    }
}
