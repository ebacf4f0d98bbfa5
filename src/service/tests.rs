// Copyright (c) 2025 linklocal-xmpp contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::time::Duration;
use std::net::{IpAddr, Ipv4Addr};

use xmpp_parsers::ping::Ping;

use super::*;
use crate::discovery::next_service_name;

/// An in-memory "link": endpoints see each other instantly, with collision
/// renaming resolved at registration time. Lets two services talk over
/// loopback TCP without multicast.
#[derive(Clone)]
struct TestLink {
    inner: Arc<Mutex<LinkInner>>,
}

struct LinkInner {
    peers: HashMap<String, LlPresence>,
    taps: Vec<mpsc::UnboundedSender<DiscoveryEvent>>,
}

struct TestEndpoint {
    link: Arc<Mutex<LinkInner>>,
    registered: Option<String>,
}

impl TestLink {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LinkInner {
                peers: HashMap::new(),
                taps: Vec::new(),
            })),
        }
    }

    fn endpoint(&self) -> TestEndpoint {
        TestEndpoint {
            link: self.inner.clone(),
            registered: None,
        }
    }

    /// Simulate a peer's records expiring from everyone's caches.
    fn remove(&self, name: &str) {
        let mut link = self.inner.lock().unwrap();
        link.peers.remove(name);
        for tap in &link.taps {
            let _ = tap.send(DiscoveryEvent::Removed(name.to_owned()));
        }
    }
}

impl Discovery for TestEndpoint {
    fn start(
        &mut self,
        local: &LlPresence,
    ) -> Result<(String, mpsc::UnboundedReceiver<DiscoveryEvent>), Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut link = self.link.lock().unwrap();

        let mut name = local.service_name().to_owned();
        while link.peers.contains_key(&name) {
            name = next_service_name(&name);
        }
        let mut presence = local.clone();
        presence.set_service_name(name.clone());
        presence.set_host(format!("{}.local.", name));
        presence.set_addresses(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);

        for tap in &link.taps {
            let _ = tap.send(DiscoveryEvent::Resolved(presence.clone()));
        }
        for peer in link.peers.values() {
            let _ = tx.send(DiscoveryEvent::Resolved(peer.clone()));
        }
        link.peers.insert(name.clone(), presence);
        link.taps.push(tx);
        self.registered = Some(name.clone());
        Ok((name, rx))
    }

    fn update(&mut self, local: &LlPresence) -> Result<(), Error> {
        let mut link = self.link.lock().unwrap();
        let Some(name) = self.registered.clone() else {
            return Err(Error::Disconnected);
        };
        let snapshot = match link.peers.get_mut(&name) {
            Some(stored) => {
                stored.apply_txt(local.to_txt());
                stored.clone()
            }
            None => return Ok(()),
        };
        for tap in &link.taps {
            let _ = tap.send(DiscoveryEvent::Resolved(snapshot.clone()));
        }
        Ok(())
    }

    fn reannounce(&mut self) -> Result<(), Error> {
        let link = self.link.lock().unwrap();
        if let Some(stored) = self
            .registered
            .as_ref()
            .and_then(|name| link.peers.get(name))
        {
            for tap in &link.taps {
                let _ = tap.send(DiscoveryEvent::Resolved(stored.clone()));
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        let Some(name) = self.registered.take() else {
            return;
        };
        let mut link = self.link.lock().unwrap();
        link.peers.remove(&name);
        for tap in &link.taps {
            let _ = tap.send(DiscoveryEvent::Removed(name.clone()));
        }
    }
}

fn test_config() -> Config {
    Config {
        // Port 0 lets the OS pick, so parallel tests never collide.
        port_range: 0..=0,
        reply_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

/// Config with timeouts short enough to watch idle eviction happen.
fn quick_config() -> Config {
    Config {
        idle_timeout: Duration::from_millis(400),
        watchdog_tick: Duration::from_millis(150),
        ..test_config()
    }
}

async fn start_service(link: &TestLink, name: &str, config: Config) -> LinkLocalService {
    let _ = env_logger::builder().is_test(true).try_init();
    LinkLocalService::with_discovery(Box::new(link.endpoint()), LlPresence::new(name), config)
        .await
        .expect("service starts")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached in time");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn pair(config: Config) -> (TestLink, LinkLocalService, LinkLocalService) {
    let link = TestLink::new();
    let a = start_service(&link, "alice@host-a", config.clone()).await;
    let b = start_service(&link, "bob@host-b", config).await;
    {
        let (a, b) = (a.clone(), b.clone());
        wait_until(move || {
            a.presence_store().get("bob@host-b").is_some()
                && b.presence_store().get("alice@host-a").is_some()
        })
        .await;
    }
    (link, a, b)
}

fn alice() -> Jid {
    Jid::new("alice@host-a").unwrap()
}

#[tokio::test]
async fn peers_discover_each_other() {
    let (_link, a, b) = pair(test_config()).await;

    let bob = a.presence_store().get("bob@host-b").unwrap();
    assert_eq!(bob.port(), b.port());
    assert_eq!(bob.status(), Mode::Avail);
    assert_eq!(bob.host(), Some("bob@host-b.local."));

    let alice = b.presence_store().get("alice@host-a").unwrap();
    assert_eq!(alice.port(), a.port());

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn chat_messages_are_delivered() {
    let (_link, a, b) = pair(test_config()).await;

    let mut inbox = a.chat("bob@host-b").attach();
    b.chat("alice@host-a").send_message("hi").await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
        .await
        .expect("message in time")
        .unwrap();
    assert_eq!(message.bodies[""].0, "hi");
    assert_eq!(message.from.unwrap().to_string(), "bob@host-b");

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn idle_streams_close_and_revive() {
    let (_link, a, b) = pair(quick_config()).await;

    let mut inbox = a.chat("bob@host-b").attach();
    b.chat("alice@host-a").send_message("one").await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), inbox.recv())
        .await
        .expect("first message")
        .unwrap();

    // Idle past the timeout: the streams on both sides get reaped.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(matches!(
        b.connect_to("alice@host-a").await,
        Ok(handle) if handle.is_open()
    ));

    // ... and the stream above came from a fresh dial; sending still works.
    b.chat("alice@host-a").send_message("two").await.unwrap();
    let message = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
        .await
        .expect("second message")
        .unwrap();
    assert_eq!(message.bodies[""].0, "two");

    a.close().await;
    b.close().await;
}

/// Spawn a trivial IQ responder on `service`: every `get` is answered with
/// an empty result.
fn answer_iq_gets(service: &LinkLocalService) {
    let mut listener = service.add_packet_listener(|stanza| {
        matches!(stanza, Stanza::Iq(iq) if matches!(iq.payload, IqType::Get(_)))
    });
    let service = service.clone();
    tokio::spawn(async move {
        while let Some(stanza) = listener.recv().await {
            let Stanza::Iq(request) = stanza else {
                continue;
            };
            let Some(from) = request.from else {
                continue;
            };
            let reply = Iq {
                from: None,
                to: Some(from),
                id: request.id,
                payload: IqType::Result(None),
            };
            let _ = service.send_stanza(Stanza::Iq(reply)).await;
        }
    });
}

#[tokio::test]
async fn iq_replies_survive_stream_changes() {
    let (_link, a, b) = pair(quick_config()).await;
    answer_iq_gets(&a);

    // Concurrent dial: two live streams between the same two peers.
    let (from_a, from_b) = tokio::join!(
        a.connect_to("bob@host-b"),
        b.connect_to("alice@host-a")
    );
    assert!(from_a.unwrap().is_open());
    assert!(from_b.unwrap().is_open());

    // The request leaves on b's outbound stream; the reply prefers a's own
    // outbound stream, i.e. a different TCP connection.
    let reply = b
        .send_iq(Iq::from_get("q-1", Ping).with_to(alice()))
        .await
        .expect("reply within the window");
    assert!(matches!(reply.payload, IqType::Result(None)));

    // After an idle close the correlation still holds across the re-dial.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let reply = b
        .send_iq(Iq::from_get("q-2", Ping).with_to(alice()))
        .await
        .expect("reply after idle close");
    assert!(matches!(reply.payload, IqType::Result(None)));

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn unhandled_iq_requests_earn_feature_not_implemented() {
    let (_link, a, b) = pair(test_config()).await;

    let reply = b
        .send_iq(Iq::from_get("q-nope", Ping).with_to(alice()))
        .await
        .expect("error reply arrives");
    match reply.payload {
        IqType::Error(error) => {
            assert_eq!(
                error.defined_condition,
                DefinedCondition::FeatureNotImplemented
            );
        }
        other => panic!("expected an error reply, got {:?}", other),
    }

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn concurrent_dial_delivers_exactly_once() {
    let (_link, a, b) = pair(test_config()).await;

    let mut inbox_a = a.chat("bob@host-b").attach();
    let mut inbox_b = b.chat("alice@host-a").attach();

    let (from_a, from_b) = tokio::join!(
        a.connect_to("bob@host-b"),
        b.connect_to("alice@host-a")
    );
    from_a.unwrap();
    from_b.unwrap();

    a.chat("bob@host-b").send_message("a to b").await.unwrap();
    b.chat("alice@host-a").send_message("b to a").await.unwrap();

    let to_a = tokio::time::timeout(Duration::from_secs(2), inbox_a.recv())
        .await
        .expect("b's message")
        .unwrap();
    assert_eq!(to_a.bodies[""].0, "b to a");
    let to_b = tokio::time::timeout(Duration::from_secs(2), inbox_b.recv())
        .await
        .expect("a's message")
        .unwrap();
    assert_eq!(to_b.bodies[""].0, "a to b");

    // No duplicates across the dual streams.
    assert!(
        tokio::time::timeout(Duration::from_millis(300), inbox_a.recv())
            .await
            .is_err()
    );
    assert!(
        tokio::time::timeout(Duration::from_millis(300), inbox_b.recv())
            .await
            .is_err()
    );

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn second_registrant_is_renamed() {
    let link = TestLink::new();
    let a = start_service(&link, "alice@host", test_config()).await;
    let b = start_service(&link, "alice@host", test_config()).await;

    assert_eq!(a.service_name(), "alice@host");
    assert_eq!(b.service_name(), "alice-2@host");

    // Both are fully usable under their final names.
    {
        let (a, b) = (a.clone(), b.clone());
        wait_until(move || {
            a.presence_store().get("alice-2@host").is_some()
                && b.presence_store().get("alice@host").is_some()
        })
        .await;
    }

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn outbound_from_is_always_the_local_name() {
    let (_link, a, b) = pair(test_config()).await;

    let mut listener =
        a.add_packet_listener(|stanza| matches!(stanza, Stanza::Message(_)));

    let mut forged = Message::new(Some(alice()));
    forged.type_ = MessageType::Chat;
    forged.from = Some(Jid::new("mallory@elsewhere").unwrap());
    b.send_stanza(forged.into()).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(2), listener.recv())
        .await
        .expect("stanza in time")
        .unwrap();
    assert_eq!(received.from().unwrap().to_string(), "bob@host-b");

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn message_from_vanished_peer_is_flagged() {
    let (link, a, b) = pair(test_config()).await;

    let mut inbox = a.chat("bob@host-b").attach();
    let mut events = a.subscribe_events();

    b.chat("alice@host-a").send_message("known").await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), inbox.recv())
        .await
        .expect("message while known")
        .unwrap();

    // b's records expire from a's view; the stream stays open.
    link.remove("bob@host-b");
    {
        let a = a.clone();
        wait_until(move || a.presence_store().get("bob@host-b").is_none()).await;
    }

    b.chat("alice@host-a").send_message("ghost").await.unwrap();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event in time")
            .unwrap();
        if let ServiceEvent::UnknownOriginMessage(message) = event {
            assert_eq!(message.bodies[""].0, "ghost");
            break;
        }
    }
    // The chat saw only the first message.
    assert!(
        tokio::time::timeout(Duration::from_millis(300), inbox.recv())
            .await
            .is_err()
    );

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn unknown_initiators_are_turned_away() {
    let link = TestLink::new();
    let a = start_service(&link, "alice@host-a", test_config()).await;

    let socket = TcpStream::connect((Ipv4Addr::LOCALHOST, a.port()))
        .await
        .unwrap();
    let (read_half, write_half) = socket.into_split();
    let mut reader = XmlReader::new(BufReader::new(read_half));
    let mut writer = XmlWriter::new(write_half);
    writer
        .send_header(&StreamHeader {
            from: Some("stranger@nowhere".to_owned()),
            to: Some("alice@host-a".to_owned()),
        })
        .await
        .unwrap();

    // No presence for the stranger: no answering header, just a closed
    // connection.
    assert!(reader.recv_header().await.is_err());

    a.close().await;
}

#[tokio::test]
async fn exhausted_port_range_fails_to_bind() {
    let link = TestLink::new();
    let a = start_service(&link, "alice@host-a", test_config()).await;
    let taken = a.port();

    let result = LinkLocalService::with_discovery(
        Box::new(link.endpoint()),
        LlPresence::new("bob@host-b"),
        Config {
            port_range: taken..=taken,
            ..Config::default()
        },
    )
    .await;
    assert!(matches!(
        result,
        Err(Error::BindFailed { first, last }) if first == taken && last == taken
    ));

    a.close().await;
}

#[tokio::test]
async fn name_is_reusable_after_close() {
    let link = TestLink::new();
    let a = start_service(&link, "alice@host", test_config()).await;
    a.close().await;

    // Register, unregister, register again: same advertised name.
    let b = start_service(&link, "alice@host", test_config()).await;
    assert_eq!(b.service_name(), "alice@host");
    b.close().await;
}

#[tokio::test]
async fn wait_for_peer_sees_late_arrivals() {
    let link = TestLink::new();
    let a = start_service(&link, "alice@host-a", test_config()).await;

    let waiter = {
        let a = a.clone();
        tokio::spawn(async move { a.wait_for_peer("bob@host-b", Duration::from_secs(5)).await })
    };
    let b = start_service(&link, "bob@host-b", test_config()).await;

    let presence = waiter.await.unwrap().expect("peer appears in time");
    assert_eq!(presence.service_name(), "bob@host-b");
    assert!(a
        .wait_for_peer("nobody@host-x", Duration::from_millis(100))
        .await
        .is_none());

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn sending_to_unknown_peer_fails() {
    let link = TestLink::new();
    let a = start_service(&link, "alice@host-a", test_config()).await;

    let result = a
        .send_stanza(Message::new(Some(Jid::new("nobody@nowhere").unwrap())).into())
        .await;
    assert!(matches!(result, Err(Error::PeerUnavailable(name)) if name == "nobody@nowhere"));

    a.close().await;
}

#[tokio::test]
async fn one_chat_per_peer() {
    let link = TestLink::new();
    let a = start_service(&link, "alice@host-a", test_config()).await;

    let first = a.chat("carol@host-c");
    let second = a.chat("carol@host-c");
    assert!(Arc::ptr_eq(&first, &second));

    a.close().await;
}

#[tokio::test]
async fn close_cancels_collectors_and_sends() {
    let (_link, a, b) = pair(test_config()).await;

    let collector = a.create_collector(|_| true);
    a.close().await;
    // Idempotent.
    a.close().await;

    let started = tokio::time::Instant::now();
    assert!(collector.next(Duration::from_secs(5)).await.is_none());
    assert!(started.elapsed() < Duration::from_secs(1));

    assert!(matches!(
        a.send_stanza(Message::new(Some(Jid::new("bob@host-b").unwrap())).into())
            .await,
        Err(Error::Disconnected)
    ));

    b.close().await;
}

#[tokio::test]
async fn presence_update_reaches_peers() {
    let (_link, a, b) = pair(test_config()).await;

    a.set_presence(Mode::Dnd, Some("busy".to_owned())).unwrap();
    {
        let b = b.clone();
        wait_until(move || {
            b.presence_store()
                .get("alice@host-a")
                .is_some_and(|p| p.status() == Mode::Dnd)
        })
        .await;
    }
    let presence = b.presence_store().get("alice@host-a").unwrap();
    assert_eq!(presence.msg(), Some("busy"));

    a.close().await;
    b.close().await;
}
