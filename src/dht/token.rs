use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::Rng as _;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::debug;

use super::bits::Bitmap;
use crate::constants::TOKEN_SECRET_LENGTH;

struct Secrets {
    current: [u8; TOKEN_SECRET_LENGTH],
    previous: [u8; TOKEN_SECRET_LENGTH],
}

impl Secrets {
    fn fresh() -> Self {
        let mut secrets = Secrets {
            current: [0u8; TOKEN_SECRET_LENGTH],
            previous: [0u8; TOKEN_SECRET_LENGTH],
        };
        rand::rng().fill(&mut secrets.current[..]);
        rand::rng().fill(&mut secrets.previous[..]);
        secrets
    }

    fn rotate(&mut self) {
        self.previous = self.current;
        rand::rng().fill(&mut self.current[..]);
    }
}

/// Issues and verifies the tokens that authorize `store` requests.
///
/// A token binds the requesting node's id and observed address to a server
/// secret, so a store is only accepted from a peer that recently spoke to
/// us from that address. Secrets rotate on an interval; a token stays valid
/// for one full rotation (current or previous secret) but not two.
pub struct TokenManager {
    secrets: Arc<RwLock<Secrets>>,
    rotation: Mutex<Option<JoinHandle<()>>>,
}

impl TokenManager {
    pub fn new() -> Self {
        Self {
            secrets: Arc::new(RwLock::new(Secrets::fresh())),
            rotation: Mutex::new(None),
        }
    }

    /// Spawns the background rotation task. Replaces any earlier task.
    pub fn start(&self, interval: Duration) {
        let secrets = Arc::clone(&self.secrets);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await; // immediate first tick

            loop {
                tick.tick().await;
                secrets.write().rotate();
                debug!("rotated store token secret");
            }
        });

        if let Some(old) = self.rotation.lock().replace(handle) {
            old.abort();
        }
    }

    /// Stops the rotation task.
    pub fn stop(&self) {
        if let Some(handle) = self.rotation.lock().take() {
            handle.abort();
        }
    }

    /// Forces a rotation now.
    pub fn rotate(&self) {
        self.secrets.write().rotate();
    }

    /// The token `(node_id, addr)` may use to store with us right now.
    pub fn get(&self, node_id: &Bitmap, addr: SocketAddr) -> Bytes {
        gen_token(&self.secrets.read().current, node_id, addr)
    }

    /// Whether `token` was issued to `(node_id, addr)` under the current or
    /// previous secret.
    pub fn verify(&self, token: &[u8], node_id: &Bitmap, addr: SocketAddr) -> bool {
        let secrets = self.secrets.read();
        gen_token(&secrets.current, node_id, addr).as_ref() == token
            || gen_token(&secrets.previous, node_id, addr).as_ref() == token
    }
}

impl Drop for TokenManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn gen_token(secret: &[u8], node_id: &Bitmap, addr: SocketAddr) -> Bytes {
    let mut hasher = Sha256::new();
    hasher.update(node_id.as_bytes());
    match addr.ip() {
        IpAddr::V4(ip) => hasher.update(ip.octets()),
        IpAddr::V6(ip) => hasher.update(ip.octets()),
    }
    hasher.update(addr.port().to_string().as_bytes());
    hasher.update(secret);

    Bytes::copy_from_slice(&hasher.finalize())
}
