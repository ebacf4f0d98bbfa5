// Copyright (c) 2025 linklocal-xmpp contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The link-local session manager.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};

use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::jid::Jid;
use xmpp_parsers::message::{Message, MessageType};
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};

use crate::chat::Chat;
use crate::collector::{BoxFilter, CollectorInner, PacketCollector};
use crate::config::Config;
use crate::discovery::{Discovery, DiscoveryEvent, DnsSdDiscovery};
use crate::error::{Error, ProtocolError};
use crate::presence::{LlPresence, Mode, PresenceStore};
use crate::stanza::{make_id, Stanza};
use crate::stream::{self, Direction, StreamEvent, StreamHandle};
use crate::xmlstream::{StreamHeader, XmlReader, XmlWriter};

/// Out-of-band notification from a [`LinkLocalService`].
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// Our advertised service name changed after a collision.
    ServiceNameChanged {
        /// The name we gave up.
        old: String,
        /// The name we advertise now.
        new: String,
    },

    /// A stream died from an I/O or protocol error (not an orderly close).
    ConnectionClosedOnError {
        /// The peer the stream belonged to.
        remote: String,
        /// Description of what went wrong.
        error: String,
    },

    /// A message arrived from a service name with no known presence. The
    /// message is not delivered to any chat.
    UnknownOriginMessage(Message),
}

struct ListenerEntry {
    id: u64,
    filter: BoxFilter,
    tx: mpsc::UnboundedSender<Stanza>,
}

/// Receiving side of a registered packet listener.
///
/// Listeners observe stanzas from every stream of the service, including
/// streams opened after registration. Dropping the listener unregisters it.
pub struct PacketListener {
    id: u64,
    rx: mpsc::UnboundedReceiver<Stanza>,
    registry: Weak<Mutex<Vec<ListenerEntry>>>,
}

impl PacketListener {
    /// Wait for the next stanza accepted by this listener's filter.
    ///
    /// Returns `None` once the service is gone.
    pub async fn recv(&mut self) -> Option<Stanza> {
        self.rx.recv().await
    }
}

impl Drop for PacketListener {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().unwrap().retain(|entry| entry.id != self.id);
        }
    }
}

/// A serverless XMPP service on the local link.
///
/// The service advertises the local presence over DNS-SD, tracks the
/// presence of the other peers on the link, and exchanges stanzas with them
/// over direct TCP streams: dialing on demand, accepting at any time, and
/// reaping streams that have gone idle.
///
/// Cloning is cheap and hands out another handle to the same service.
#[derive(Clone)]
pub struct LinkLocalService {
    inner: Arc<ServiceInner>,
}

pub(crate) struct ServiceInner {
    config: Config,
    local: Mutex<LlPresence>,
    store: PresenceStore,
    discovery: Mutex<Box<dyn Discovery>>,
    inbound: Mutex<HashMap<String, Arc<StreamHandle>>>,
    outbound: Mutex<HashMap<String, Arc<StreamHandle>>>,
    chats: Mutex<HashMap<String, Arc<Chat>>>,
    listeners: Arc<Mutex<Vec<ListenerEntry>>>,
    collectors: Arc<Mutex<Vec<Arc<CollectorInner>>>>,
    events: broadcast::Sender<ServiceEvent>,
    stream_events: mpsc::Sender<StreamEvent>,
    shutdown: watch::Sender<bool>,
    next_id: AtomicU64,
    closed: AtomicBool,
    local_addr: SocketAddr,
}

impl LinkLocalService {
    /// Start a service advertising `local` over mDNS.
    pub async fn new(local: LlPresence, config: Config) -> Result<Self, Error> {
        let discovery = DnsSdDiscovery::new(&config)?;
        Self::with_discovery(Box::new(discovery), local, config).await
    }

    /// Start a service on a caller-provided [`Discovery`] implementation.
    pub async fn with_discovery(
        mut discovery: Box<dyn Discovery>,
        mut local: LlPresence,
        config: Config,
    ) -> Result<Self, Error> {
        let listener = bind_in_range(&config).await?;
        let local_addr = listener.local_addr()?;
        local.set_port(local_addr.port());
        log::debug!("listening on {}", local_addr);

        let (registered_name, discovery_rx) = discovery.start(&local)?;
        let old_name = local.service_name().to_owned();
        let renamed = registered_name != old_name;
        if renamed {
            log::info!(
                "advertised name collided; adopting {:?}",
                registered_name
            );
            local.set_service_name(registered_name.clone());
        }

        let (stream_events, stream_rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(64);
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(ServiceInner {
            config,
            local: Mutex::new(local),
            store: PresenceStore::new(),
            discovery: Mutex::new(discovery),
            inbound: Mutex::new(HashMap::new()),
            outbound: Mutex::new(HashMap::new()),
            chats: Mutex::new(HashMap::new()),
            listeners: Arc::new(Mutex::new(Vec::new())),
            collectors: Arc::new(Mutex::new(Vec::new())),
            events,
            stream_events,
            shutdown,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            local_addr,
        });

        tokio::spawn(acceptor(inner.clone(), listener));
        tokio::spawn(dispatcher(inner.clone(), stream_rx, discovery_rx));

        if renamed {
            let _ = inner.events.send(ServiceEvent::ServiceNameChanged {
                old: old_name,
                new: registered_name,
            });
        }
        Ok(Self { inner })
    }

    /// The service name currently advertised for the local peer.
    pub fn service_name(&self) -> String {
        self.inner.local_name()
    }

    /// Snapshot of the local presence.
    pub fn local_presence(&self) -> LlPresence {
        self.inner.local.lock().unwrap().clone()
    }

    /// The port our listener is bound to.
    pub fn port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    /// The store of remote presences on the link.
    pub fn presence_store(&self) -> &PresenceStore {
        &self.inner.store
    }

    /// Wait up to `timeout` for `remote` to appear on the link.
    ///
    /// Returns the peer's presence as soon as discovery has resolved it, or
    /// `None` when the window elapses first.
    pub async fn wait_for_peer(
        &self,
        remote: &str,
        timeout: core::time::Duration,
    ) -> Option<LlPresence> {
        let mut events = self.inner.store.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(presence) = self.inner.store.get(remote) {
                return Some(presence);
            }
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                    return self.inner.store.get(remote);
                }
            }
        }
    }

    /// Subscribe to out-of-band service notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    /// Change the advertised availability and re-announce it.
    pub fn set_presence(&self, status: Mode, msg: Option<String>) -> Result<(), Error> {
        let snapshot = {
            let mut local = self.inner.local.lock().unwrap();
            local.set_status(status, msg);
            local.clone()
        };
        self.inner.discovery.lock().unwrap().update(&snapshot)
    }

    /// Re-broadcast the current advertisement without changing it.
    pub fn reannounce(&self) -> Result<(), Error> {
        self.inner.discovery.lock().unwrap().reannounce()
    }

    /// The chat for `remote`, created on first use.
    pub fn chat(&self, remote: &str) -> Arc<Chat> {
        self.inner.chat(remote)
    }

    /// Obtain a usable stream to `remote`, dialing one if necessary.
    ///
    /// Of the two streams a concurrent dial can produce, the outbound one
    /// is preferred; both peers thereby converge on the same-direction
    /// stream for new traffic.
    pub async fn connect_to(&self, remote: &str) -> Result<Arc<StreamHandle>, Error> {
        self.inner.connection_for(remote).await
    }

    /// Send a stanza to the peer in its `to` attribute.
    ///
    /// The stanza's `from` is stamped with the local service name no matter
    /// what it held before, and an id is assigned if missing. If the stream
    /// died under us, a single transparent re-dial is attempted.
    pub async fn send_stanza(&self, stanza: Stanza) -> Result<(), Error> {
        self.inner.send_stanza(stanza).await
    }

    /// Register a packet listener.
    ///
    /// The listener observes every stanza accepted by `filter`, from all
    /// current and future streams.
    pub fn add_packet_listener(
        &self,
        filter: impl Fn(&Stanza) -> bool + Send + Sync + 'static,
    ) -> PacketListener {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().unwrap().push(ListenerEntry {
            id,
            filter: Box::new(filter),
            tx,
        });
        PacketListener {
            id,
            rx,
            registry: Arc::downgrade(&self.inner.listeners),
        }
    }

    /// Create a collector gathering every stanza accepted by `filter`, from
    /// all current and future streams.
    pub fn create_collector(
        &self,
        filter: impl Fn(&Stanza) -> bool + Send + Sync + 'static,
    ) -> PacketCollector {
        let inner = Arc::new(CollectorInner::new(Box::new(filter)));
        self.inner.collectors.lock().unwrap().push(inner.clone());
        PacketCollector::new(inner, Arc::downgrade(&self.inner.collectors))
    }

    /// Send an IQ request and wait for the matching reply.
    ///
    /// The reply is matched on `id` and type `result`/`error` through a
    /// collector, so it is found even if it travels on a different stream
    /// than the request. Fails with [`Error::Timeout`] after the configured
    /// reply window.
    pub async fn send_iq(&self, mut iq: Iq) -> Result<Iq, Error> {
        if iq.id.is_empty() {
            iq.id = make_id();
        }
        let id = iq.id.clone();
        let collector = self.create_collector(move |stanza| match stanza {
            Stanza::Iq(reply) => {
                reply.id == id
                    && matches!(reply.payload, IqType::Result(_) | IqType::Error(_))
            }
            _ => false,
        });
        self.inner.send_stanza(Stanza::Iq(iq)).await?;
        match collector.next(self.inner.config.reply_timeout).await {
            Some(Stanza::Iq(reply)) => Ok(reply),
            _ => Err(Error::Timeout),
        }
    }

    /// Shut the service down.
    ///
    /// Withdraws the DNS-SD advertisement, stops accepting, closes every
    /// stream (draining writer queues best-effort), and cancels in-flight
    /// collectors.
    pub async fn close(&self) {
        self.inner.close().await
    }
}

impl ServiceInner {
    fn local_name(&self) -> String {
        self.local.lock().unwrap().service_name().to_owned()
    }

    pub(crate) fn chat(self: &Arc<Self>, remote: &str) -> Arc<Chat> {
        let mut chats = self.chats.lock().unwrap();
        chats
            .entry(remote.to_owned())
            .or_insert_with(|| {
                Arc::new(Chat::new(
                    remote.to_owned(),
                    Arc::downgrade(self),
                    self.config.chat_backlog,
                ))
            })
            .clone()
    }

    fn spawn_stream<R, W>(
        &self,
        direction: Direction,
        remote: String,
        reader: XmlReader<R>,
        writer: XmlWriter<W>,
    ) -> Arc<StreamHandle>
    where
        R: tokio::io::AsyncBufRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        stream::spawn(
            id,
            direction,
            remote,
            reader,
            writer,
            &self.config,
            self.stream_events.clone(),
        )
    }

    async fn connection_for(self: &Arc<Self>, remote: &str) -> Result<Arc<StreamHandle>, Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Disconnected);
        }
        if let Some(handle) = self.outbound.lock().unwrap().get(remote) {
            if handle.is_open() {
                return Ok(handle.clone());
            }
        }
        if let Some(handle) = self.inbound.lock().unwrap().get(remote) {
            if handle.is_open() {
                return Ok(handle.clone());
            }
        }
        let presence = self
            .store
            .get(remote)
            .ok_or_else(|| Error::PeerUnavailable(remote.to_owned()))?;
        self.dial(&presence).await
    }

    async fn dial(self: &Arc<Self>, presence: &LlPresence) -> Result<Arc<StreamHandle>, Error> {
        let remote = presence.service_name().to_owned();
        let addr = peer_addr(presence)?;
        log::debug!("dialing {} at {}", remote, addr);
        let socket = TcpStream::connect(addr).await?;
        let (read_half, write_half) = socket.into_split();
        let mut reader = XmlReader::new(BufReader::new(read_half));
        let mut writer = XmlWriter::new(write_half);

        writer
            .send_header(&StreamHeader {
                from: Some(self.local_name()),
                to: Some(remote.clone()),
            })
            .await?;
        let header = reader.recv_header().await?;
        if let Some(from) = &header.from {
            if *from != remote {
                log::debug!("peer {:?} answered for {:?}", from, remote);
            }
        }

        let handle = self.spawn_stream(Direction::Initiator, remote.clone(), reader, writer);
        let mut outbound = self.outbound.lock().unwrap();
        if let Some(existing) = outbound.get(&remote) {
            if existing.is_open() {
                // A concurrent local dial won the race; keep its stream.
                let existing = existing.clone();
                drop(outbound);
                handle.close();
                return Ok(existing);
            }
        }
        outbound.insert(remote, handle.clone());
        Ok(handle)
    }

    pub(crate) async fn send_stanza(self: &Arc<Self>, stanza: Stanza) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Disconnected);
        }
        let remote = stanza
            .to()
            .ok_or(ProtocolError::MissingAddressee)?
            .to_string();
        let mut stanza = stanza;
        stanza.set_from(Jid::new(&self.local_name())?);
        stanza.ensure_id();

        // A dead stream is pruned and dialed once more, transparently.
        for _ in 0..2 {
            let handle = self.connection_for(&remote).await?;
            match handle.tx.send(stanza).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(rejected)) => {
                    stanza = rejected;
                    self.prune(&remote, handle.id);
                }
            }
        }
        Err(Error::Io(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "stream closed while sending",
        )))
    }

    /// Drop a specific stream from whichever map still holds it.
    fn prune(&self, remote: &str, id: u64) {
        for map in [&self.inbound, &self.outbound] {
            let mut map = map.lock().unwrap();
            if map.get(remote).is_some_and(|handle| handle.id == id) {
                map.remove(remote);
            }
        }
    }

    /// Dispatch one inbound stanza: collectors first, then listeners, then
    /// chat routing, and finally the auto-error for unhandled IQ requests.
    /// Runs on the single dispatcher task so listener notification order is
    /// consistent across streams.
    fn dispatch_stanza(self: &Arc<Self>, remote: String, stanza: Stanza) {
        let mut matched = false;

        {
            let collectors = self.collectors.lock().unwrap();
            for collector in collectors.iter() {
                if collector.offer(&stanza) {
                    matched = true;
                }
            }
        }

        {
            let mut listeners = self.listeners.lock().unwrap();
            listeners.retain(|listener| {
                if (listener.filter)(&stanza) {
                    if listener.tx.send(stanza.clone()).is_ok() {
                        matched = true;
                        true
                    } else {
                        false
                    }
                } else {
                    !listener.tx.is_closed()
                }
            });
        }

        match &stanza {
            Stanza::Message(message)
                if matches!(
                    message.type_,
                    MessageType::Chat | MessageType::Normal | MessageType::Error
                ) =>
            {
                let Some(sender) = message.from.as_ref().map(|jid| jid.to_string()) else {
                    log::debug!("dropping message without a sender from {}", remote);
                    return;
                };
                if sender != remote {
                    log::debug!("message from {:?} on {}'s stream", sender, remote);
                }
                if self.store.get(&sender).is_some() {
                    self.chat(&sender).deliver(message.clone());
                } else {
                    log::debug!("message from unknown origin {:?}", sender);
                    let _ = self
                        .events
                        .send(ServiceEvent::UnknownOriginMessage(message.clone()));
                }
            }
            Stanza::Iq(iq) if !matched => {
                if let IqType::Get(_) | IqType::Set(_) = iq.payload {
                    let Some(requester) = iq.from.clone() else {
                        return;
                    };
                    let reply = Iq::from_error(
                        iq.id.clone(),
                        StanzaError::new(
                            ErrorType::Cancel,
                            DefinedCondition::FeatureNotImplemented,
                            "en",
                            "no handler registered for this request",
                        ),
                    )
                    .with_to(requester);
                    let inner = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = inner.send_stanza(Stanza::Iq(reply)).await {
                            log::debug!("could not send feature-not-implemented: {}", e);
                        }
                    });
                }
            }
            _ => (),
        }
    }

    fn stream_closed(&self, id: u64, remote: String, direction: Direction, error: Option<Error>) {
        let map = match direction {
            Direction::Responder => &self.inbound,
            Direction::Initiator => &self.outbound,
        };
        {
            let mut map = map.lock().unwrap();
            // Only drop the entry if it still is this stream; it may have
            // been replaced already.
            if map.get(&remote).is_some_and(|handle| handle.id == id) {
                map.remove(&remote);
            }
        }
        match error {
            Some(error) => {
                log::debug!("stream to {} closed on error: {}", remote, error);
                let _ = self.events.send(ServiceEvent::ConnectionClosedOnError {
                    remote,
                    error: error.to_string(),
                });
            }
            None => log::debug!("stream to {} closed", remote),
        }
    }

    fn apply_discovery(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Resolved(presence) => {
                if presence.service_name() == self.local_name() {
                    return;
                }
                log::debug!(
                    "peer {} at {:?}:{}",
                    presence.service_name(),
                    presence.host(),
                    presence.port()
                );
                self.store.insert(presence);
            }
            DiscoveryEvent::Removed(name) => {
                self.store.remove(&name);
            }
            DiscoveryEvent::NameChanged { old, new } => {
                self.local.lock().unwrap().set_service_name(new.clone());
                let _ = self
                    .events
                    .send(ServiceEvent::ServiceNameChanged { old, new });
            }
        }
    }

    pub(crate) async fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("closing link-local service {:?}", self.local_name());
        // Withdraw the advertisement first so peers see us leave promptly.
        self.discovery.lock().unwrap().shutdown();
        self.shutdown.send_replace(true);

        let handles: Vec<Arc<StreamHandle>> = {
            let mut handles = Vec::new();
            handles.extend(self.inbound.lock().unwrap().drain().map(|(_, h)| h));
            handles.extend(self.outbound.lock().unwrap().drain().map(|(_, h)| h));
            handles
        };
        for handle in &handles {
            handle.close();
        }
        for handle in &handles {
            let _ = tokio::time::timeout(self.config.shutdown_drain * 2, handle.closed()).await;
        }

        for collector in self.collectors.lock().unwrap().drain(..) {
            collector.cancel();
        }
    }
}

async fn bind_in_range(config: &Config) -> Result<TcpListener, Error> {
    let first = *config.port_range.start();
    let last = *config.port_range.end();
    for port in config.port_range.clone() {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => log::trace!("port {} unavailable: {}", port, e),
        }
    }
    Err(Error::BindFailed { first, last })
}

fn peer_addr(presence: &LlPresence) -> Result<SocketAddr, Error> {
    let addresses = presence.addresses();
    let ip = addresses
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addresses.first())
        .copied()
        .ok_or_else(|| Error::PeerUnavailable(presence.service_name().to_owned()))?;
    Ok(SocketAddr::new(ip, presence.port()))
}

async fn acceptor(inner: Arc<ServiceInner>, listener: TcpListener) {
    let mut shutdown = inner.shutdown.subscribe();
    while !*shutdown.borrow() {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    log::debug!("inbound connection from {}", addr);
                    let inner = inner.clone();
                    // Per-stream task: a slow header exchange must not block
                    // other inbound dials.
                    tokio::spawn(async move {
                        if let Err(e) = accept_stream(inner, socket).await {
                            log::debug!("inbound stream rejected: {}", e);
                        }
                    });
                }
                Err(e) => log::warn!("accept failed: {}", e),
            }
        }
    }
}

async fn accept_stream(inner: Arc<ServiceInner>, socket: TcpStream) -> Result<(), Error> {
    let (read_half, write_half) = socket.into_split();
    let mut reader = XmlReader::new(BufReader::new(read_half));
    let mut writer = XmlWriter::new(write_half);

    // The initiator speaks first.
    let header = reader.recv_header().await?;
    let Some(remote) = header.from else {
        return Err(ProtocolError::BadStreamHeader("missing `from` on inbound header").into());
    };
    let local_name = inner.local_name();
    if let Some(to) = &header.to {
        if *to != local_name {
            log::debug!(
                "inbound stream addressed to {:?}, we are {:?}",
                to,
                local_name
            );
        }
    }
    // Unknown peers are turned away before we answer with a header.
    if inner.store.get(&remote).is_none() {
        return Err(Error::PeerUnavailable(remote));
    }

    writer
        .send_header(&StreamHeader {
            from: Some(local_name),
            to: Some(remote.clone()),
        })
        .await?;

    let handle = inner.spawn_stream(Direction::Responder, remote.clone(), reader, writer);
    let replaced = inner.inbound.lock().unwrap().insert(remote, handle);
    if let Some(old) = replaced {
        // A second inbound stream for the same peer supersedes the first.
        old.close();
    }
    Ok(())
}

/// The single dispatcher per service: every stanza and every lifecycle
/// event funnels through here, which gives listeners a consistent
/// notification order across streams.
async fn dispatcher(
    inner: Arc<ServiceInner>,
    mut stream_rx: mpsc::Receiver<StreamEvent>,
    mut discovery_rx: mpsc::UnboundedReceiver<DiscoveryEvent>,
) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut discovery_open = true;
    while !*shutdown.borrow() {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            event = stream_rx.recv() => match event {
                Some(StreamEvent::Stanza { remote, stanza, .. }) => {
                    inner.dispatch_stanza(remote, stanza);
                }
                Some(StreamEvent::Closed { id, remote, direction, error }) => {
                    inner.stream_closed(id, remote, direction, error);
                }
                None => break,
            },
            event = discovery_rx.recv(), if discovery_open => match event {
                Some(event) => inner.apply_discovery(event),
                None => discovery_open = false,
            },
        }
    }
}

#[cfg(test)]
mod tests;
