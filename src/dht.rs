//! Kademlia-style distributed hash table.
//!
//! The DHT maps content-addressed blob hashes to the peers that announced
//! them. Every participant is a [`Node`] bound to one UDP endpoint; ids and
//! hashes share the 384-bit [`Bitmap`] space and proximity is measured by
//! XOR distance.
//!
//! # Getting started
//!
//! ```no_run
//! use rdht::dht::{Bitmap, Config, Node};
//!
//! # async fn example() -> Result<(), rdht::dht::DhtError> {
//! let node = Node::start(Config::default()).await?;
//!
//! // Announce that we serve a blob, then look up who else does.
//! let hash = Bitmap::random();
//! node.announce(hash).await?;
//! let holders = node.get(hash).await?;
//!
//! for contact in holders {
//!     println!("{} holds the blob", contact);
//! }
//!
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Operations
//!
//! - **ping** - liveness probe
//! - **findNode** - contacts closest to a target id
//! - **findValue** - peers that announced a blob hash
//! - **store** - record an announcement (token-authenticated)
//!
//! # Architecture
//!
//! - [`Node`] - the full participant: socket, request handlers, iterative
//!   lookups, announce scheduling, and periodic maintenance
//! - [`RoutingTable`] - 384 k-buckets indexed by shared-prefix length
//! - [`ContactStore`] - announced hashes with TTL expiration
//! - [`TokenManager`] - rotating secrets behind store authorization
//! - [`BootstrapNode`] - flat-list variant that only seeds joiners

mod bits;
mod bootstrap;
mod config;
mod contact;
mod error;
mod lookup;
mod message;
mod node;
mod routing;
mod store;
mod token;

pub use bits::Bitmap;
pub use bootstrap::BootstrapNode;
pub use config::{AnnounceNotification, Config};
pub use contact::Contact;
pub use error::DhtError;
pub use message::{Message, MessageId, Request, ResponsePayload};
pub use node::Node;
pub use routing::{InsertOutcome, RoutingTable};
pub use store::ContactStore;
pub use token::TokenManager;

#[cfg(test)]
mod tests;
