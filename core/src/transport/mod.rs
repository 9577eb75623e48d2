//! Cross-kernel transport.
//!
//! Each kernel publishes on one TCP endpoint and subscribes to the endpoints
//! of its peers. Subscribers tell the publisher which topic prefixes they want
//! (an empty prefix means everything); the topic of a data message is the text
//! of its context id. Messages coming from peers are funnelled into a single
//! poll loop that decodes them and hands events to a delivery worker, which
//! materialises missing spaces through the [`SpaceDirectory`] before the local
//! fan-out.

pub mod codec;
pub mod envelope;
pub mod frame;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{endpoint, KernelConfig};
use crate::directory::SpaceDirectory;
use crate::event::Event;
use crate::ids::{ContextId, SpaceId};
use crate::scope::Scope;
use crate::space::SpaceNetwork;
use crate::{KernelError, Result};

pub use envelope::{Envelope, EnvelopeCodec, Inbound};
use frame::{read_frame, Frame, FrameKind};

/// Transport statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportStats {
    pub published: u64,
    pub received: u64,
    pub delivered: u64,
    pub discovery_messages: u64,
    pub malformed: u64,
    pub materialized_spaces: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    received: AtomicU64,
    delivered: AtomicU64,
    discovery_messages: AtomicU64,
    malformed: AtomicU64,
    materialized_spaces: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TransportStats {
        TransportStats {
            published: self.published.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            discovery_messages: self.discovery_messages.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            materialized_spaces: self.materialized_spaces.load(Ordering::Relaxed),
        }
    }
}

type Outbox = mpsc::UnboundedSender<Arc<[u8]>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remote kernel subscribed to our publisher.
struct Subscriber {
    remote: SocketAddr,
    topics: Arc<RwLock<HashSet<Vec<u8>>>>,
    outbox: Outbox,
    reader: Option<JoinHandle<()>>,
}

impl Subscriber {
    fn wants(&self, topic: &[u8]) -> bool {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|prefix| topic.starts_with(prefix))
    }
}

/// Remote publisher we subscribe to.
struct Peer {
    outbox: Outbox,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Peer {
    fn close(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

struct Settings {
    connect_timeout: Duration,
    poll_timeout: Duration,
    shutdown_grace: Duration,
    subscribe_all: bool,
}

struct Shared {
    local_uri: String,
    settings: Settings,
    codec: EnvelopeCodec,
    directory: OnceLock<Weak<SpaceDirectory>>,
    listener: Mutex<Option<TcpListener>>,
    inbound_tx: mpsc::UnboundedSender<Vec<Vec<u8>>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<Vec<u8>>>>>,
    /// Context topic to the number of local spaces interested in it.
    topics: Mutex<HashMap<Vec<u8>, usize>>,
    subscribers: DashMap<u64, Subscriber>,
    next_subscriber: AtomicU64,
    peers: DashMap<String, Peer>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    counters: Counters,
}

/// Cheaply cloneable handle on the kernel's transport.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

impl Transport {
    /// Binds the publish endpoint. Nothing runs until [`Transport::start`].
    pub async fn bind(config: &KernelConfig) -> Result<Self> {
        let addr = endpoint(&config.publish_uri)?;
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| KernelError::Connection {
                uri: config.publish_uri.clone(),
                reason: e.to_string(),
            })?;
        let local_uri = format!("tcp://{}", listener.local_addr()?);
        let codec = EnvelopeCodec::new(
            config.serializer,
            config.encryption_key.as_deref(),
            local_uri.clone(),
        )?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        info!(target: "transport", uri = %local_uri, serializer = config.serializer.as_str(), encrypted = config.encryption_key.is_some(), "Transport bound");

        Ok(Self {
            shared: Arc::new(Shared {
                local_uri,
                settings: Settings {
                    connect_timeout: config.connect_timeout(),
                    poll_timeout: config.poll_timeout(),
                    shutdown_grace: config.shutdown_grace(),
                    subscribe_all: config.subscribe_all,
                },
                codec,
                directory: OnceLock::new(),
                listener: Mutex::new(Some(listener)),
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                topics: Mutex::new(HashMap::new()),
                subscribers: DashMap::new(),
                next_subscriber: AtomicU64::new(0),
                peers: DashMap::new(),
                shutdown,
                tasks: Mutex::new(Vec::new()),
                counters: Counters::default(),
            }),
        })
    }

    /// Actual publish endpoint, with the port the OS picked.
    pub fn local_uri(&self) -> &str {
        &self.shared.local_uri
    }

    pub fn stats(&self) -> TransportStats {
        self.shared.counters.snapshot()
    }

    /// Starts accepting subscribers and delivering inbound messages into `directory`.
    pub fn start(&self, directory: &Arc<SpaceDirectory>) -> Result<()> {
        let listener = lock(&self.shared.listener)
            .take()
            .ok_or_else(|| KernelError::Config("transport already started".into()))?;
        let inbound = lock(&self.shared.inbound_rx)
            .take()
            .ok_or_else(|| KernelError::Config("transport already started".into()))?;
        let _ = self.shared.directory.set(Arc::downgrade(directory));

        let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
        let tasks = vec![
            tokio::spawn(accept_loop(
                self.shared.clone(),
                listener,
                self.shared.shutdown.subscribe(),
            )),
            tokio::spawn(poll_loop(
                self.shared.clone(),
                inbound,
                deliveries_tx,
                self.shared.shutdown.subscribe(),
            )),
            tokio::spawn(delivery_worker(self.shared.clone(), deliveries_rx)),
        ];
        lock(&self.shared.tasks).extend(tasks);

        info!(target: "transport", uri = %self.shared.local_uri, "Transport started");
        Ok(())
    }

    /// Subscribes to a remote publisher, replaying the topics of interest.
    ///
    /// Connecting to a peer already connected is a no-op.
    #[tracing::instrument(skip(self), fields(kernel = %self.shared.local_uri))]
    pub async fn connect_peer(&self, uri: &str) -> Result<()> {
        if let Some(peer) = self.shared.peers.get(uri) {
            if !peer.reader.is_finished() {
                debug!(target: "transport", peer = %uri, "Already connected");
                return Ok(());
            }
        }

        let addr = endpoint(uri)?;
        let stream = match tokio::time::timeout(
            self.shared.settings.connect_timeout,
            TcpStream::connect(&addr),
        )
        .await
        {
            Err(_) => {
                return Err(KernelError::Connection {
                    uri: uri.to_string(),
                    reason: format!(
                        "timed out after {} ms",
                        self.shared.settings.connect_timeout.as_millis()
                    ),
                })
            }
            Ok(Err(e)) => {
                return Err(KernelError::Connection {
                    uri: uri.to_string(),
                    reason: e.to_string(),
                })
            }
            Ok(Ok(stream)) => stream,
        };
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        let (outbox, rx) = mpsc::unbounded_channel::<Arc<[u8]>>();
        for topic in self.shared.interest() {
            let _ = outbox.send(Frame::subscribe(&topic).encode().into());
        }

        let peer = Peer {
            outbox,
            writer: tokio::spawn(write_loop(writer, rx, uri.to_string())),
            reader: tokio::spawn(read_publisher(self.shared.clone(), reader, uri.to_string())),
        };
        if let Some(old) = self.shared.peers.insert(uri.to_string(), peer) {
            old.close();
        }
        info!(target: "transport", peer = %uri, "Connected to peer");
        Ok(())
    }

    pub async fn disconnect_peer(&self, uri: &str) -> Result<()> {
        let (_, peer) = self
            .shared
            .peers
            .remove(uri)
            .ok_or_else(|| KernelError::PeerNotConnected(uri.to_string()))?;
        peer.close();
        info!(target: "transport", peer = %uri, "Disconnected from peer");
        Ok(())
    }

    pub fn connected_peers(&self) -> Vec<String> {
        self.shared
            .peers
            .iter()
            .filter(|p| !p.reader.is_finished())
            .map(|p| p.key().clone())
            .collect()
    }

    /// Whether some remote kernel currently subscribes to the topic of `context_id`.
    pub fn has_subscribers_for(&self, context_id: ContextId) -> bool {
        let topic = context_id.topic();
        self.shared.subscribers.iter().any(|s| s.wants(&topic))
    }

    /// Stops the loops, closes every connection and waits briefly for the tasks.
    pub async fn shutdown(&self) {
        let _ = self.shared.shutdown.send(true);

        let peers: Vec<String> = self.shared.peers.iter().map(|p| p.key().clone()).collect();
        for uri in peers {
            if let Some((_, peer)) = self.shared.peers.remove(&uri) {
                peer.close();
            }
        }
        let subscribers: Vec<u64> = self.shared.subscribers.iter().map(|s| *s.key()).collect();
        for id in subscribers {
            if let Some((_, subscriber)) = self.shared.subscribers.remove(&id) {
                debug!(target: "transport", subscriber = %subscriber.remote, "Closing subscriber");
                if let Some(reader) = subscriber.reader {
                    reader.abort();
                }
            }
        }

        let tasks: Vec<JoinHandle<()>> = lock(&self.shared.tasks).drain(..).collect();
        let grace = self.shared.settings.shutdown_grace;
        for mut task in tasks {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!(target: "transport", "Transport task did not stop in time, aborting");
                task.abort();
            }
        }
        info!(target: "transport", uri = %self.shared.local_uri, "Transport stopped");
    }
}

impl SpaceNetwork for Transport {
    fn register(&self, space: &SpaceId) {
        let topic = space.context_id.topic();
        let first = {
            let mut topics = lock(&self.shared.topics);
            let count = topics.entry(topic.clone()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if first && !self.shared.settings.subscribe_all {
            self.shared.send_to_peers(Frame::subscribe(&topic));
        }
        self.shared.announce(space);
    }

    fn unregister(&self, space: &SpaceId) {
        let topic = space.context_id.topic();
        let last = {
            let mut topics = lock(&self.shared.topics);
            match topics.get_mut(&topic) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    topics.remove(&topic);
                    true
                }
                None => false,
            }
        };
        if last && !self.shared.settings.subscribe_all {
            self.shared.send_to_peers(Frame::unsubscribe(&topic));
        }
    }

    fn publish(&self, space: &SpaceId, scope: &Scope, event: &Event) -> Result<()> {
        let frame = Frame::message(self.shared.codec.encode(space, scope, event)?);
        frame.check()?;
        let sent = self.shared.broadcast(frame);
        Counters::add(&self.shared.counters.published, 1);
        debug!(target: "transport", space = %space, event_id = %event.id, subscribers = sent, "Published");
        Ok(())
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("uri", &self.shared.local_uri)
            .field("peers", &self.shared.peers.len())
            .field("subscribers", &self.shared.subscribers.len())
            .finish()
    }
}

impl Shared {
    fn directory(&self) -> Option<Arc<SpaceDirectory>> {
        self.directory.get().and_then(Weak::upgrade)
    }

    /// Topics to ask each peer for.
    fn interest(&self) -> Vec<Vec<u8>> {
        if self.settings.subscribe_all {
            vec![Vec::new()]
        } else {
            lock(&self.topics).keys().cloned().collect()
        }
    }

    fn send_to_peers(&self, frame: Frame) {
        let bytes: Arc<[u8]> = frame.encode().into();
        for peer in self.peers.iter() {
            let _ = peer.outbox.send(bytes.clone());
        }
    }

    /// Sends a message frame to every subscriber of its topic.
    fn broadcast(&self, frame: Frame) -> usize {
        let bytes: Arc<[u8]> = frame.encode().into();
        let topic = frame.topic();
        let mut sent = 0;
        for subscriber in self.subscribers.iter() {
            if subscriber.wants(topic) && subscriber.outbox.send(bytes.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    fn announce(&self, space: &SpaceId) {
        match self.codec.encode_discovery(space) {
            Ok(parts) => {
                let sent = self.broadcast(Frame::message(parts));
                debug!(target: "transport", space = %space, subscribers = sent, "Announced space");
            }
            Err(e) => warn!(target: "transport", space = %space, error = %e, "Could not encode space announcement"),
        }
    }

    /// Announces local spaces under `prefix` to a subscriber that just asked for it.
    fn announce_existing(&self, prefix: &[u8], outbox: &Outbox) {
        let Some(directory) = self.directory() else {
            return;
        };
        for context in directory.contexts() {
            if !context.id().topic().starts_with(prefix) {
                continue;
            }
            for space in context.spaces() {
                match self.codec.encode_discovery(space.id()) {
                    Ok(parts) => {
                        let _ = outbox.send(Frame::message(parts).encode().into());
                    }
                    Err(e) => warn!(target: "transport", space = %space.id(), error = %e, "Could not encode space announcement"),
                }
            }
        }
    }

    fn on_discovery(&self, space_id: &SpaceId) {
        Counters::add(&self.counters.discovery_messages, 1);
        let Some(directory) = self.directory() else {
            return;
        };
        if directory.contains_context(space_id.context_id) && directory.space(space_id).is_none() {
            directory.ensure_space(space_id);
            Counters::add(&self.counters.materialized_spaces, 1);
            info!(target: "transport", space = %space_id, "Materialised announced space");
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Arc<[u8]>>, remote: String) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            debug!(target: "transport", remote = %remote, error = %e, "Write failed, closing connection");
            break;
        }
    }
}

/// Reads the frames a remote publisher sends us.
async fn read_publisher(shared: Arc<Shared>, mut reader: OwnedReadHalf, uri: String) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) if frame.kind == FrameKind::Message => {
                if shared.inbound_tx.send(frame.parts).is_err() {
                    break;
                }
            }
            Ok(Some(frame)) => {
                debug!(target: "transport", peer = %uri, kind = ?frame.kind, "Ignoring control frame from publisher");
            }
            Ok(None) => {
                info!(target: "transport", peer = %uri, "Peer closed the connection");
                break;
            }
            Err(e @ KernelError::FrameTooLarge { .. }) => {
                Counters::add(&shared.counters.malformed, 1);
                warn!(target: "transport", peer = %uri, error = %e, "Dropped oversized frame");
            }
            Err(e) => {
                Counters::add(&shared.counters.malformed, 1);
                warn!(target: "transport", peer = %uri, error = %e, "Unreadable frame, dropping connection");
                break;
            }
        }
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => serve_subscriber(&shared, stream, remote),
                Err(e) => warn!(target: "transport", error = %e, "Accept failed"),
            }
        }
    }
    debug!(target: "transport", "Accept loop stopped");
}

fn serve_subscriber(shared: &Arc<Shared>, stream: TcpStream, remote: SocketAddr) {
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();
    let (outbox, rx) = mpsc::unbounded_channel::<Arc<[u8]>>();
    let topics = Arc::new(RwLock::new(HashSet::new()));
    let id = shared.next_subscriber.fetch_add(1, Ordering::Relaxed);

    shared.subscribers.insert(
        id,
        Subscriber {
            remote,
            topics: topics.clone(),
            outbox: outbox.clone(),
            reader: None,
        },
    );
    tokio::spawn(write_loop(writer, rx, remote.to_string()));

    let task_shared = shared.clone();
    let reader_task = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => match frame.kind {
                    FrameKind::Subscribe => {
                        let topic = frame.topic().to_vec();
                        debug!(target: "transport", subscriber = %remote, topic = %String::from_utf8_lossy(&topic), "Subscribed");
                        topics
                            .write()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(topic.clone());
                        task_shared.announce_existing(&topic, &outbox);
                    }
                    FrameKind::Unsubscribe => {
                        topics
                            .write()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(frame.topic());
                    }
                    FrameKind::Message => {
                        warn!(target: "transport", subscriber = %remote, "Subscriber sent a data message, ignoring");
                    }
                },
                Ok(None) => break,
                Err(e @ KernelError::FrameTooLarge { .. }) => {
                    Counters::add(&task_shared.counters.malformed, 1);
                    warn!(target: "transport", subscriber = %remote, error = %e, "Dropped oversized frame from subscriber");
                }
                Err(e) => {
                    Counters::add(&task_shared.counters.malformed, 1);
                    warn!(target: "transport", subscriber = %remote, error = %e, "Unreadable frame from subscriber");
                    break;
                }
            }
        }
        task_shared.subscribers.remove(&id);
        debug!(target: "transport", subscriber = %remote, "Subscriber gone");
    });

    if let Some(mut subscriber) = shared.subscribers.get_mut(&id) {
        subscriber.reader = Some(reader_task);
    }
    info!(target: "transport", subscriber = %remote, "Subscriber connected");
}

async fn poll_loop(
    shared: Arc<Shared>,
    mut inbound: mpsc::UnboundedReceiver<Vec<Vec<u8>>>,
    deliveries: mpsc::UnboundedSender<Envelope>,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let parts = match tokio::time::timeout(shared.settings.poll_timeout, inbound.recv()).await {
            Err(_) => continue,
            Ok(None) => break,
            Ok(Some(parts)) => parts,
        };

        match shared.codec.decode(&parts) {
            Ok(Inbound::Message(envelope)) => {
                Counters::add(&shared.counters.received, 1);
                if envelope.headers.get(envelope::headers::KERNEL) == Some(&shared.local_uri) {
                    continue;
                }
                if deliveries.send(envelope).is_err() {
                    break;
                }
            }
            Ok(Inbound::Discovery { space_id, .. }) => shared.on_discovery(&space_id),
            Err(e) => {
                Counters::add(&shared.counters.malformed, 1);
                warn!(target: "transport", error = %e, parts = parts.len(), "Dropping malformed envelope");
            }
        }
    }
    debug!(target: "transport", "Poll loop stopped");
}

async fn delivery_worker(shared: Arc<Shared>, mut deliveries: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = deliveries.recv().await {
        let Some(directory) = shared.directory() else {
            warn!(target: "transport", space = %envelope.space_id, "No directory, dropping event");
            continue;
        };
        let space = match directory.space(&envelope.space_id) {
            Some(space) => space,
            None => {
                Counters::add(&shared.counters.materialized_spaces, 1);
                info!(target: "transport", space = %envelope.space_id, "Materialising space on demand");
                directory.ensure_space(&envelope.space_id)
            }
        };
        let delivered = space.deliver_from_network(&envelope.scope, envelope.event);
        Counters::add(&shared.counters.delivered, delivered as u64);
    }
    debug!(target: "transport", "Delivery worker stopped");
}
