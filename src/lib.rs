//! rdht - a Kademlia DHT for content-addressed blob announcement
//!
//! This library implements the overlay network peers use to advertise and
//! discover which nodes hold particular content-addressed blobs. It speaks
//! a bencoded wire protocol over UDP; nothing is persisted and no blob data
//! ever moves through the DHT — only "who holds what".
//!
//! # Modules
//!
//! - [`bencode`] - wire serialization format
//! - [`dht`] - the node: routing table, iterative lookups, announce
//!   scheduling, token-authenticated stores, bootstrap support
//! - [`constants`] - protocol constants and default tuning parameters

pub mod bencode;
pub mod constants;
pub mod dht;

pub use bencode::{decode, encode, BencodeError, Value};
pub use dht::{
    AnnounceNotification, Bitmap, BootstrapNode, Config, Contact, ContactStore, DhtError, Message,
    Node, RoutingTable, TokenManager,
};
