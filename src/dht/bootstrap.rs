use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom as _;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::bits::Bitmap;
use super::contact::Contact;
use super::error::DhtError;
use super::message::{new_message_id, Message, MessageId, Request, ResponsePayload};
use crate::constants::{BUCKET_SIZE, DEFAULT_UDP_TIMEOUT, UDP_MAX_MESSAGE_LENGTH};

const ERROR_METHOD_NOT_SUPPORTED: i64 = 501;

struct Entry {
    contact: Contact,
    last_seen: Instant,
}

/// A stripped-down network participant that seeds new joiners.
///
/// Speaks the normal wire protocol but keeps no routing table: just a flat,
/// bounded list of peers that recently talked to it. `findNode` answers
/// with a random subset of that list — a bootstrap node hands out entry
/// points, it does not participate in lookups. Entries that go quiet past
/// the refresh interval are pinged and evicted on failure.
pub struct BootstrapNode {
    id: Bitmap,
    max_contacts: usize,
    refresh_interval: Duration,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    contacts: RwLock<Vec<Entry>>,
    pending: Mutex<HashMap<(MessageId, SocketAddr), mpsc::Sender<()>>>,
    shutdown: watch::Sender<bool>,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl BootstrapNode {
    /// Binds `bind_addr` and starts serving.
    pub async fn start(
        id: Bitmap,
        bind_addr: SocketAddr,
        max_contacts: usize,
        refresh_interval: Duration,
    ) -> Result<Arc<Self>, DhtError> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;
        info!("bootstrap node {:?} listening on {}", id, local_addr);

        let (shutdown, _) = watch::channel(false);

        let node = Arc::new(Self {
            id,
            max_contacts,
            refresh_interval,
            socket: Arc::new(socket),
            local_addr,
            contacts: RwLock::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            shutdown,
            run_task: Mutex::new(None),
        });

        let run = tokio::spawn({
            let node = Arc::clone(&node);
            let signal = node.shutdown.subscribe();
            async move { node.run(signal).await }
        });
        *node.run_task.lock() = Some(run);

        Ok(node)
    }

    pub fn id(&self) -> Bitmap {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn contact_count(&self) -> usize {
        self.contacts.read().len()
    }

    /// Pings `host:port` seeds; the ones that answer join the contact list.
    pub async fn connect(&self, seeds: &[String]) {
        let mut alive = 0usize;
        for seed in seeds {
            match tokio::net::lookup_host(seed.as_str()).await {
                Ok(addrs) => {
                    for addr in addrs.filter(|a| a.is_ipv4()) {
                        if self.ping(addr).await {
                            alive += 1;
                        }
                    }
                }
                Err(e) => warn!("failed to resolve seed node {}: {}", seed, e),
            }
        }
        info!("contacted {}/{} bootstrap seeds", alive, seeds.len());
    }

    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("shutting down bootstrap node {:?}", self.id);
        self.pending.lock().clear();

        let run = self.run_task.lock().take();
        if let Some(run) = run {
            let _ = run.await;
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = [0u8; UDP_MAX_MESSAGE_LENGTH + 1];

        let mut maintenance = tokio::time::interval(self.refresh_interval);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        maintenance.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, from)) => Self::handle_packet(&self, &buf[..len], from),
                    Err(e) => warn!("udp receive error: {}", e),
                },
                _ = maintenance.tick() => {
                    let node = Arc::clone(&self);
                    tokio::spawn(async move { node.check_stale().await });
                }
            }
        }
    }

    fn handle_packet(node: &Arc<Self>, data: &[u8], from: SocketAddr) {
        if data.len() > UDP_MAX_MESSAGE_LENGTH {
            warn!("dropping oversize packet from {}", from);
            return;
        }

        let message = match Message::parse(data) {
            Ok(message) => message,
            Err(e) => {
                debug!("dropping malformed packet from {}: {}", from, e);
                return;
            }
        };

        match message {
            Message::Request {
                message_id,
                node_id,
                request,
            } => {
                if let Ok(sender) = Contact::from_addr(node_id, from) {
                    node.upsert(sender);
                }
                let node = Arc::clone(node);
                tokio::spawn(async move { node.handle_request(message_id, from, request).await });
            }
            Message::Response {
                message_id,
                node_id,
                ..
            } => {
                if let Ok(responder) = Contact::from_addr(node_id, from) {
                    node.upsert(responder);
                }
                // The only requests we originate are liveness pings.
                let pending = node.pending.lock();
                if let Some(sender) = pending.get(&(message_id, from)) {
                    let _ = sender.try_send(());
                }
            }
            Message::Error { .. } => {}
        }
    }

    async fn handle_request(&self, message_id: MessageId, from: SocketAddr, request: Request) {
        let payload = match request {
            Request::Ping => ResponsePayload::Pong,
            Request::FindNode { .. } => ResponsePayload::Contacts(self.random_contacts(from)),
            Request::FindValue { .. } => ResponsePayload::CloserContacts {
                contacts: self.random_contacts(from),
                token: Bytes::new(),
            },
            Request::Store { .. } => {
                let frame = Message::Error {
                    message_id,
                    node_id: self.id,
                    code: ERROR_METHOD_NOT_SUPPORTED,
                    text: "bootstrap nodes do not store".to_string(),
                    extra: Vec::new(),
                }
                .encode();
                let _ = self.socket.send_to(&frame, from).await;
                return;
            }
        };

        let frame = Message::Response {
            message_id,
            node_id: self.id,
            payload,
        }
        .encode();
        if frame.len() > UDP_MAX_MESSAGE_LENGTH {
            warn!("not sending oversize frame to {}", from);
            return;
        }
        if let Err(e) = self.socket.send_to(&frame, from).await {
            warn!("failed to send to {}: {}", from, e);
        }
    }

    fn upsert(&self, contact: Contact) {
        if contact.id == self.id {
            return;
        }

        let mut contacts = self.contacts.write();
        if let Some(entry) = contacts.iter_mut().find(|e| e.contact.id == contact.id) {
            entry.contact = contact;
            entry.last_seen = Instant::now();
        } else if contacts.len() < self.max_contacts {
            contacts.push(Entry {
                contact,
                last_seen: Instant::now(),
            });
        }
    }

    /// Up to k random known contacts, excluding the asker itself.
    fn random_contacts(&self, asker: SocketAddr) -> Vec<Contact> {
        let mut picks: Vec<Contact> = self
            .contacts
            .read()
            .iter()
            .map(|e| e.contact)
            .filter(|c| c.addr() != asker)
            .collect();
        picks.shuffle(&mut rand::rng());
        picks.truncate(BUCKET_SIZE);
        picks
    }

    /// Pings entries that have gone quiet; drops the ones that fail.
    async fn check_stale(&self) {
        let stale: Vec<Contact> = self
            .contacts
            .read()
            .iter()
            .filter(|e| e.last_seen.elapsed() > self.refresh_interval)
            .map(|e| e.contact)
            .collect();

        for contact in stale {
            if self.is_shutdown() {
                return;
            }
            if self.ping(contact.addr()).await {
                let mut contacts = self.contacts.write();
                if let Some(entry) = contacts.iter_mut().find(|e| e.contact.id == contact.id) {
                    entry.last_seen = Instant::now();
                }
            } else {
                debug!("dropping stale bootstrap contact {:?}", contact);
                self.contacts.write().retain(|e| e.contact.id != contact.id);
            }
        }
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn ping(&self, addr: SocketAddr) -> bool {
        let message_id = new_message_id();
        let frame = Message::Request {
            message_id,
            node_id: self.id,
            request: Request::Ping,
        }
        .encode();

        let (tx, mut rx) = mpsc::channel(1);
        self.pending.lock().insert((message_id, addr), tx);

        let alive = match self.socket.send_to(&frame, addr).await {
            Ok(_) => timeout(DEFAULT_UDP_TIMEOUT, rx.recv())
                .await
                .ok()
                .flatten()
                .is_some(),
            Err(_) => false,
        };

        self.pending.lock().remove(&(message_id, addr));
        alive
    }
}
