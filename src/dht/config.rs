use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::sync::mpsc;

use super::bits::Bitmap;
use super::error::DhtError;
use crate::constants::{
    DEFAULT_ANNOUNCE_RATE, DEFAULT_EXPIRE_TIME, DEFAULT_PEER_PORT, DEFAULT_PORT,
    DEFAULT_REANNOUNCE_TIME, DEFAULT_REFRESH_TIME, DEFAULT_SEED_NODES,
    DEFAULT_TOKEN_ROTATION_INTERVAL, DEFAULT_UDP_RETRY, DEFAULT_UDP_TIMEOUT,
};

/// Emitted on the configured channel after each announce completes.
#[derive(Debug, Clone)]
pub struct AnnounceNotification {
    pub blob_hash: Bitmap,
    /// How many peers accepted the store.
    pub stored: usize,
}

/// Node configuration.
///
/// Every field has a working default; `Config::default()` matches the
/// standard production configuration. Timing fields exist mainly so tests
/// can shrink them.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address advertised to other peers.
    pub external_ip: Ipv4Addr,
    /// Address the UDP socket binds to.
    pub interface_ip: Ipv4Addr,
    /// UDP port; 0 picks an ephemeral port.
    pub dht_port: u16,
    /// `host:port` seeds contacted on start.
    pub seed_nodes: Vec<String>,
    /// Hex-encoded 48-byte node id; random when `None`.
    pub node_id: Option<String>,
    /// Periodic diagnostic logging of table and store sizes; `None` disables.
    pub print_state: Option<Duration>,
    /// Advertised TCP port peers can download blobs from.
    pub peer_protocol_port: u16,
    /// How often announced hashes are republished. Must stay below
    /// `expire_time` or holders would drop out of the index between rounds.
    pub reannounce_time: Duration,
    /// Cap on announces per second during republication.
    pub announce_rate: u32,
    /// Optional sink for announce results.
    pub announce_notifications: Option<mpsc::Sender<AnnounceNotification>>,

    /// Per-attempt RPC timeout.
    pub udp_timeout: Duration,
    /// Retransmits after the first timed-out attempt.
    pub udp_retry: u32,
    /// Idle time after which a bucket is refreshed.
    pub refresh_time: Duration,
    /// TTL of stored announcements.
    pub expire_time: Duration,
    /// Rotation period of the store-token secret.
    pub token_rotation_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            external_ip: Ipv4Addr::UNSPECIFIED,
            interface_ip: Ipv4Addr::UNSPECIFIED,
            dht_port: DEFAULT_PORT,
            seed_nodes: DEFAULT_SEED_NODES.iter().map(|s| s.to_string()).collect(),
            node_id: None,
            print_state: None,
            peer_protocol_port: DEFAULT_PEER_PORT,
            reannounce_time: DEFAULT_REANNOUNCE_TIME,
            announce_rate: DEFAULT_ANNOUNCE_RATE,
            announce_notifications: None,
            udp_timeout: DEFAULT_UDP_TIMEOUT,
            udp_retry: DEFAULT_UDP_RETRY,
            refresh_time: DEFAULT_REFRESH_TIME,
            expire_time: DEFAULT_EXPIRE_TIME,
            token_rotation_interval: DEFAULT_TOKEN_ROTATION_INTERVAL,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<(), DhtError> {
        if self.expire_time <= self.reannounce_time {
            return Err(DhtError::InvalidConfig(
                "expire_time must exceed reannounce_time".into(),
            ));
        }
        if self.announce_rate == 0 {
            return Err(DhtError::InvalidConfig("announce_rate must be > 0".into()));
        }
        if self.token_rotation_interval.is_zero() {
            return Err(DhtError::InvalidConfig(
                "token_rotation_interval must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Parses the configured node id, or generates a random one.
    pub(crate) fn node_id(&self) -> Result<Bitmap, DhtError> {
        match &self.node_id {
            Some(hex) => Bitmap::from_hex(hex),
            None => Ok(Bitmap::random()),
        }
    }
}
