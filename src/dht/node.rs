use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::bits::Bitmap;
use super::config::{AnnounceNotification, Config};
use super::contact::Contact;
use super::error::DhtError;
use super::lookup::LookupKind;
use super::message::{new_message_id, Message, MessageId, Request, ResponsePayload};
use super::routing::{InsertOutcome, RoutingTable};
use super::store::ContactStore;
use super::token::TokenManager;
use crate::constants::{BUCKET_SIZE, MAINTENANCE_INTERVAL, UDP_MAX_MESSAGE_LENGTH};

const ERROR_INVALID_TOKEN: i64 = 203;

/// A reply frame routed back to the task awaiting it.
#[derive(Debug)]
pub(crate) enum Reply {
    Response {
        node_id: Bitmap,
        payload: ResponsePayload,
    },
    Error {
        code: i64,
        text: String,
    },
}

/// A DHT node: one UDP endpoint participating in the overlay.
///
/// `start` binds the socket, spawns the receive loop and maintenance
/// timers, and joins the network through the configured seeds. All
/// operations refuse with [`DhtError::ShuttingDown`] once [`Node::shutdown`]
/// has run.
pub struct Node {
    id: Bitmap,
    config: Config,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    routing_table: RoutingTable,
    store: ContactStore,
    tokens: TokenManager,
    /// In-flight outgoing requests, keyed by correlation id and the peer
    /// expected to answer.
    pending: Mutex<HashMap<(MessageId, SocketAddr), mpsc::Sender<Reply>>>,
    /// Hashes we have announced, with the advertised TCP port, for the
    /// republisher.
    announced: RwLock<HashMap<Bitmap, u16>>,
    shutdown: watch::Sender<bool>,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Binds the socket and brings the node online: token rotation, the
    /// receive loop, seed pings, a self lookup, and an initial refresh of
    /// every populated bucket.
    pub async fn start(config: Config) -> Result<Arc<Self>, DhtError> {
        config.validate()?;
        let id = config.node_id()?;

        let socket =
            UdpSocket::bind(SocketAddrV4::new(config.interface_ip, config.dht_port)).await?;
        let local_addr = socket.local_addr()?;
        info!("dht node {:?} listening on {}", id, local_addr);

        let (shutdown, _) = watch::channel(false);

        let node = Arc::new(Self {
            id,
            store: ContactStore::new(config.expire_time),
            config,
            socket: Arc::new(socket),
            local_addr,
            routing_table: RoutingTable::new(id),
            tokens: TokenManager::new(),
            pending: Mutex::new(HashMap::new()),
            announced: RwLock::new(HashMap::new()),
            shutdown,
            run_task: Mutex::new(None),
        });

        node.tokens.start(node.config.token_rotation_interval);

        let run = tokio::spawn({
            let node = Arc::clone(&node);
            let signal = node.shutdown.subscribe();
            async move { node.run(signal).await }
        });
        *node.run_task.lock() = Some(run);

        node.join_network().await;

        Ok(node)
    }

    pub fn id(&self) -> Bitmap {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    /// Hashes this node has announced and will republish.
    pub fn announced_hashes(&self) -> Vec<Bitmap> {
        self.announced.read().keys().copied().collect()
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stops every background task, cancels in-flight requests, and closes
    /// the socket. Idempotent; operations started afterwards fail with
    /// [`DhtError::ShuttingDown`].
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("shutting down dht node {:?}", self.id);

        self.tokens.stop();
        // Dropping the reply senders resolves every in-flight request with
        // a ShuttingDown error.
        self.pending.lock().clear();

        let run = self.run_task.lock().take();
        if let Some(run) = run {
            let _ = run.await;
        }
    }

    // === Public operations ===

    /// Sends a single ping and waits for the pong.
    pub async fn ping(&self, addr: SocketAddr) -> Result<(), DhtError> {
        match self.send_request(addr, Request::Ping).await? {
            (_, ResponsePayload::Pong) => Ok(()),
            _ => Err(DhtError::MalformedMessage("expected pong".into())),
        }
    }

    /// Iteratively finds the k contacts closest to `target`.
    pub async fn find_node(&self, target: Bitmap) -> Result<Vec<Contact>, DhtError> {
        let result = self.iterative_find(target, LookupKind::Node).await?;
        Ok(result.closest)
    }

    /// Iteratively finds peers that announced `blob_hash`.
    pub async fn get(&self, blob_hash: Bitmap) -> Result<Vec<Contact>, DhtError> {
        let result = self.iterative_find(blob_hash, LookupKind::Value).await?;
        Ok(result.found)
    }

    /// Announces that this node serves `blob_hash` on its peer-protocol
    /// port: looks up the k closest contacts and stores with each, using
    /// the tokens gathered during the lookup. Returns how many peers
    /// accepted the store.
    pub async fn announce(&self, blob_hash: Bitmap) -> Result<usize, DhtError> {
        let port = self.config.peer_protocol_port;
        let result = self.iterative_find(blob_hash, LookupKind::Value).await?;

        let mut stored = 0;

        // We may ourselves sit among the k closest ids to the hash, in
        // which case we are part of the target set and index it locally.
        let self_is_close = result.closest.len() < BUCKET_SIZE
            || result
                .closest
                .last()
                .is_some_and(|farthest| self.id.closer_to(&farthest.id, &blob_hash));
        if self_is_close {
            self.store.upsert(
                blob_hash,
                Contact::new(self.id, self.config.external_ip, port),
            );
            stored += 1;
        }

        let stores = result.closest.iter().map(|contact| {
            let token = result
                .tokens
                .get(&contact.id)
                .cloned()
                .unwrap_or_else(Bytes::new);
            let request = Request::Store {
                blob_hash,
                token,
                port,
                node_id: self.id,
                self_store: contact.id == self.id,
            };
            async move {
                matches!(
                    self.send_request(contact.addr(), request).await,
                    Ok((_, ResponsePayload::StoreOk))
                )
            }
        });
        stored += join_all(stores).await.into_iter().filter(|ok| *ok).count();

        self.announced.write().insert(blob_hash, port);

        if let Some(notify) = &self.config.announce_notifications {
            let _ = notify
                .send(AnnounceNotification { blob_hash, stored })
                .await;
        }

        debug!("announced {:?}, stored by {} peers", blob_hash, stored);
        Ok(stored)
    }

    // === RPC engine ===

    /// Sends `request` and waits for the matching reply, retransmitting on
    /// timeout up to the retry budget.
    pub(crate) async fn send_request(
        &self,
        addr: SocketAddr,
        request: Request,
    ) -> Result<(Bitmap, ResponsePayload), DhtError> {
        if self.is_shutdown() {
            return Err(DhtError::ShuttingDown);
        }

        let message_id = new_message_id();
        let frame = Message::Request {
            message_id,
            node_id: self.id,
            request,
        }
        .encode();
        if frame.len() > UDP_MAX_MESSAGE_LENGTH {
            return Err(DhtError::MessageTooLarge(frame.len()));
        }

        let (tx, mut rx) = mpsc::channel(1);
        self.pending.lock().insert((message_id, addr), tx);

        let result = self.exchange(&frame, addr, &mut rx).await;
        self.pending.lock().remove(&(message_id, addr));
        result
    }

    async fn exchange(
        &self,
        frame: &[u8],
        addr: SocketAddr,
        rx: &mut mpsc::Receiver<Reply>,
    ) -> Result<(Bitmap, ResponsePayload), DhtError> {
        let attempts = 1 + self.config.udp_retry;

        for attempt in 0..attempts {
            self.socket.send_to(frame, addr).await?;

            match timeout(self.config.udp_timeout, rx.recv()).await {
                Ok(Some(Reply::Response { node_id, payload })) => return Ok((node_id, payload)),
                Ok(Some(Reply::Error { code, text })) => {
                    return Err(DhtError::Remote { code, text })
                }
                // The pending entry was dropped out from under us.
                Ok(None) => return Err(DhtError::ShuttingDown),
                Err(_) if attempt + 1 < attempts => {
                    debug!("request to {} timed out, retrying", addr);
                }
                Err(_) => break,
            }
        }

        Err(DhtError::Timeout)
    }

    // === Receive loop ===

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = [0u8; UDP_MAX_MESSAGE_LENGTH + 1];

        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
        let mut republish = tokio::time::interval(self.config.reannounce_time);
        let mut print_state = tokio::time::interval(
            self.config
                .print_state
                .unwrap_or(Duration::from_secs(60 * 60)),
        );
        for tick in [&mut maintenance, &mut republish, &mut print_state] {
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        }
        // consume the immediate first tick of each interval
        maintenance.tick().await;
        republish.tick().await;
        print_state.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, from)) => Self::handle_packet(&self, &buf[..len], from),
                    Err(e) => warn!("udp receive error: {}", e),
                },
                _ = maintenance.tick() => {
                    self.store.remove_expired();
                    let node = Arc::clone(&self);
                    tokio::spawn(async move { node.refresh_buckets(false).await });
                }
                _ = republish.tick() => {
                    let node = Arc::clone(&self);
                    tokio::spawn(async move { node.republish().await });
                }
                _ = print_state.tick(), if self.config.print_state.is_some() => {
                    self.log_state();
                }
            }
        }
    }

    fn handle_packet(node: &Arc<Self>, data: &[u8], from: SocketAddr) {
        if data.len() > UDP_MAX_MESSAGE_LENGTH {
            error!(
                "dropping {}-byte packet from {}: exceeds {}-byte cap",
                data.len(),
                from,
                UDP_MAX_MESSAGE_LENGTH
            );
            return;
        }

        let message = match Message::parse(data) {
            Ok(message) => message,
            Err(e) => {
                debug!("dropping malformed packet from {}: {}", from, e);
                return;
            }
        };

        // Every valid frame is evidence the sender is alive.
        if let Ok(sender) = Contact::from_addr(*message.node_id(), from) {
            let node = Arc::clone(node);
            tokio::spawn(async move { node.add_contact(sender).await });
        }

        match message {
            Message::Request {
                message_id,
                node_id,
                request,
            } => {
                let node = Arc::clone(node);
                tokio::spawn(async move {
                    node.handle_request(message_id, node_id, from, request).await;
                });
            }
            Message::Response {
                message_id,
                node_id,
                payload,
            } => {
                node.deliver_reply((message_id, from), Reply::Response { node_id, payload });
            }
            Message::Error {
                message_id,
                code,
                text,
                ..
            } => {
                node.deliver_reply((message_id, from), Reply::Error { code, text });
            }
        }
    }

    fn deliver_reply(&self, key: (MessageId, SocketAddr), reply: Reply) {
        let pending = self.pending.lock();
        match pending.get(&key) {
            Some(sender) => {
                let _ = sender.try_send(reply);
            }
            None => debug!("discarding unexpected reply from {}", key.1),
        }
    }

    // === Request handlers ===

    async fn handle_request(
        &self,
        message_id: MessageId,
        sender_id: Bitmap,
        from: SocketAddr,
        request: Request,
    ) {
        let payload = match request {
            Request::Ping => ResponsePayload::Pong,

            Request::FindNode { target } => {
                ResponsePayload::Contacts(self.routing_table.closest(&target, BUCKET_SIZE))
            }

            Request::FindValue { blob_hash } => {
                let token = self.tokens.get(&sender_id, from);
                let stored = self.store.get(&blob_hash);
                if stored.is_empty() {
                    ResponsePayload::CloserContacts {
                        contacts: self.routing_table.closest(&blob_hash, BUCKET_SIZE),
                        token,
                    }
                } else {
                    ResponsePayload::Value {
                        blob_hash,
                        contacts: stored,
                        token,
                    }
                }
            }

            Request::Store {
                blob_hash,
                token,
                port,
                node_id,
                self_store,
            } => {
                if !self.tokens.verify(&token, &sender_id, from) {
                    warn!("rejecting store from {}: invalid token", from);
                    self.send_error(message_id, from, ERROR_INVALID_TOKEN, "invalid token")
                        .await;
                    return;
                }

                let IpAddr::V4(ip) = from.ip() else {
                    return;
                };
                let announced_id = if self_store { sender_id } else { node_id };
                self.store
                    .upsert(blob_hash, Contact::new(announced_id, ip, port));
                debug!("stored {:?} as holder of {:?}", announced_id, blob_hash);
                ResponsePayload::StoreOk
            }
        };

        self.send_response(message_id, from, payload).await;
    }

    async fn send_response(&self, message_id: MessageId, to: SocketAddr, payload: ResponsePayload) {
        let frame = Message::Response {
            message_id,
            node_id: self.id,
            payload,
        }
        .encode();
        self.send_frame(&frame, to).await;
    }

    async fn send_error(&self, message_id: MessageId, to: SocketAddr, code: i64, text: &str) {
        let frame = Message::Error {
            message_id,
            node_id: self.id,
            code,
            text: text.to_string(),
            extra: Vec::new(),
        }
        .encode();
        self.send_frame(&frame, to).await;
    }

    async fn send_frame(&self, frame: &[u8], to: SocketAddr) {
        if frame.len() > UDP_MAX_MESSAGE_LENGTH {
            error!(
                "not sending {}-byte frame to {}: exceeds {}-byte cap",
                frame.len(),
                to,
                UDP_MAX_MESSAGE_LENGTH
            );
            return;
        }
        if let Err(e) = self.socket.send_to(frame, to).await {
            warn!("failed to send to {}: {}", to, e);
        }
    }

    // === Routing table upkeep ===

    /// Folds a heard-from contact into the routing table, arbitrating a
    /// full bucket by pinging its least recently seen entry: if that entry
    /// still answers it stays and the newcomer waits in backup, otherwise
    /// the newcomer takes its place.
    pub(crate) async fn add_contact(&self, contact: Contact) {
        match self.routing_table.insert(contact) {
            InsertOutcome::Added | InsertOutcome::Refreshed | InsertOutcome::Ignored => {}
            InsertOutcome::Full { oldest } => {
                match self.send_request(oldest.addr(), Request::Ping).await {
                    Ok(_) | Err(DhtError::Remote { .. }) => self.routing_table.touch(&oldest.id),
                    Err(DhtError::Timeout) => {
                        debug!("evicting unresponsive {:?} for {:?}", oldest, contact);
                        self.routing_table.replace(&oldest.id, &contact);
                    }
                    Err(_) => {}
                }
            }
        }
    }

    // === Background maintenance ===

    async fn join_network(&self) {
        let mut seeds: Vec<SocketAddr> = Vec::new();
        for seed in &self.config.seed_nodes {
            match lookup_host(seed.as_str()).await {
                Ok(addrs) => seeds.extend(addrs.filter(|a| a.is_ipv4())),
                Err(e) => warn!("failed to resolve seed node {}: {}", seed, e),
            }
        }

        if !seeds.is_empty() {
            let pings = seeds.iter().map(|addr| self.ping(*addr));
            let alive = join_all(pings)
                .await
                .into_iter()
                .filter(|r| r.is_ok())
                .count();
            info!("contacted {}/{} seed nodes", alive, seeds.len());
        }

        if !self.routing_table.is_empty() {
            if let Err(e) = self.find_node(self.id).await {
                debug!("self lookup failed: {}", e);
            }
            self.refresh_buckets(true).await;
        }
    }

    /// Runs a find-node lookup toward a random id in each bucket needing a
    /// refresh — every populated bucket when `all` is set, otherwise the
    /// ones untouched past the configured refresh time.
    async fn refresh_buckets(&self, all: bool) {
        let buckets = if all {
            self.routing_table.active_buckets()
        } else {
            self.routing_table
                .stale_buckets(self.config.refresh_time)
        };
        if buckets.is_empty() {
            return;
        }

        debug!("refreshing {} buckets", buckets.len());
        let lookups = buckets.into_iter().map(|index| {
            let target = self.routing_table.refresh_target(index);
            async move {
                if let Err(e) = self.find_node(target).await {
                    debug!("bucket refresh lookup failed: {}", e);
                }
            }
        });
        join_all(lookups).await;
    }

    /// Re-announces everything we hold, paced at the configured announce
    /// rate.
    async fn republish(&self) {
        let hashes = self.announced_hashes();
        if hashes.is_empty() {
            return;
        }

        info!("republishing {} announced hashes", hashes.len());
        let period = Duration::from_secs_f64(1.0 / f64::from(self.config.announce_rate));
        let mut spacing = tokio::time::interval(period);

        for hash in hashes {
            spacing.tick().await;
            if self.is_shutdown() {
                return;
            }
            if let Err(e) = self.announce(hash).await {
                debug!("republish of {:?} failed: {}", hash, e);
            }
        }
    }

    fn log_state(&self) {
        let occupancy = self.routing_table.occupancy();
        info!(
            "node {:?}: {} contacts across {} buckets, {} stored hashes",
            self.id,
            self.routing_table.len(),
            occupancy.len(),
            self.store.hash_count()
        );
    }

    pub(crate) fn contact_store(&self) -> &ContactStore {
        &self.store
    }
}
