//! Protocol constants and default tuning parameters.
//!
//! Sizes and message shapes here are fixed by the wire protocol. Timing
//! values are defaults only; every one of them can be overridden through
//! [`crate::dht::Config`], which tests rely on.

use std::time::Duration;

// ============================================================================
// Identifier sizes (fixed by the protocol)
// ============================================================================

/// Node id / blob hash length in bytes.
pub const NODE_ID_LENGTH: usize = 48;

/// Node id length in bits; also the number of routing table buckets.
pub const NODE_ID_BITS: usize = NODE_ID_LENGTH * 8;

/// Message id length in bytes.
pub const MESSAGE_ID_LENGTH: usize = 20;

/// Compact contact encoding: id, 4-byte IPv4, 2-byte big-endian port.
pub const COMPACT_CONTACT_LENGTH: usize = NODE_ID_LENGTH + 6;

// ============================================================================
// Kademlia parameters
// ============================================================================

/// Bucket size (the constant k).
pub const BUCKET_SIZE: usize = 8;

/// Lookup parallelism (the constant alpha).
pub const ALPHA: usize = 3;

/// Consecutive RPC failures before a peer is dropped from its bucket.
pub const MAX_PEER_FAILS: u8 = 3;

// ============================================================================
// Transport
// ============================================================================

/// Largest packet we will send or accept. A findValue response can carry
/// well over k contacts when a hash is popular, so this is sized generously.
pub const UDP_MAX_MESSAGE_LENGTH: usize = 4096;

/// Per-attempt RPC timeout.
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(5);

/// Retransmits after the first timed-out attempt.
pub const DEFAULT_UDP_RETRY: u32 = 1;

// ============================================================================
// Ports and seeds
// ============================================================================

/// Default UDP port for DHT traffic.
pub const DEFAULT_PORT: u16 = 4444;

/// Default advertised TCP port for blob downloads.
pub const DEFAULT_PEER_PORT: u16 = 3333;

/// Seed nodes contacted when joining the network.
pub const DEFAULT_SEED_NODES: &[&str] = &[
    "lbrynet1.lbry.io:4444",
    "lbrynet2.lbry.io:4444",
    "lbrynet3.lbry.io:4444",
];

// ============================================================================
// Maintenance timing (defaults)
// ============================================================================

/// How often the maintenance tick runs: bucket staleness scan and stored
/// contact expiration.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// A bucket untouched for this long gets refreshed with a lookup.
pub const DEFAULT_REFRESH_TIME: Duration = Duration::from_secs(60 * 60);

/// Stored announcements expire after this long. Must exceed the reannounce
/// time or holders would flicker out of the index between republications.
pub const DEFAULT_EXPIRE_TIME: Duration = Duration::from_secs(24 * 60 * 60);

/// How often the original publisher re-announces everything it holds.
pub const DEFAULT_REANNOUNCE_TIME: Duration = Duration::from_secs(50 * 60);

/// Upper bound on announces per second during republication.
pub const DEFAULT_ANNOUNCE_RATE: u32 = 10;

// ============================================================================
// Store tokens
// ============================================================================

/// Token secret length in bytes.
pub const TOKEN_SECRET_LENGTH: usize = 64;

/// How often the token-generating secret rotates.
pub const DEFAULT_TOKEN_ROTATION_INTERVAL: Duration = Duration::from_secs(5 * 60);
