// Copyright (c) 2025 linklocal-xmpp contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Link-local presence records and the store of peers on the link.

use core::fmt;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;

use tokio::sync::broadcast;

use crate::txt::TxtRecords;

/// Availability advertised in the `status` TXT field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Available for conversation.
    #[default]
    Avail,
    /// Away from the machine.
    Away,
    /// Do not disturb.
    Dnd,
}

impl Mode {
    /// Parse a `status` TXT value. Anything unknown is logged and mapped to
    /// [`Mode::Avail`].
    pub fn from_txt(value: &str) -> Mode {
        match value {
            "avail" => Mode::Avail,
            "away" => Mode::Away,
            "dnd" => Mode::Dnd,
            other => {
                log::warn!("unknown presence status {:?}, treating as avail", other);
                Mode::Avail
            }
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Mode::Avail => "avail",
            Mode::Away => "away",
            Mode::Dnd => "dnd",
        })
    }
}

/// The advertised identity and status of one peer on the link.
///
/// A presence is identified by its *service name*, the DNS-SD instance label
/// (for example `alice@host`). Two presences are considered equal iff their
/// service names and hosts are equal; the port is deliberately excluded
/// because collision renaming can move it.
#[derive(Debug, Clone, Default)]
pub struct LlPresence {
    service_name: String,
    host: Option<String>,
    port: u16,
    addresses: Vec<IpAddr>,
    status: Mode,
    msg: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    nick: Option<String>,
    email: Option<String>,
    jid: Option<String>,
    hash: Option<String>,
    node: Option<String>,
    ver: Option<String>,
    extras: TxtRecords,
}

impl LlPresence {
    /// Create a presence for the given service name.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// The DNS-SD instance label identifying this peer.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub(crate) fn set_service_name(&mut self, name: String) {
        self.service_name = name;
    }

    /// The A-record target this presence resolves to, if known.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Set the host label (e.g. `machine.local.`).
    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = Some(host.into());
    }

    /// The SRV target port.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    /// Resolved addresses for the host, most preferred first.
    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    /// Replace the resolved address list.
    pub fn set_addresses(&mut self, addresses: Vec<IpAddr>) {
        self.addresses = addresses;
    }

    /// Current availability.
    pub fn status(&self) -> Mode {
        self.status
    }

    /// Free-form status message, if any.
    pub fn msg(&self) -> Option<&str> {
        self.msg.as_deref()
    }

    /// Update availability and status message.
    pub fn set_status(&mut self, status: Mode, msg: Option<String>) {
        self.status = status;
        self.msg = msg;
    }

    /// Nickname from the `nick` TXT field.
    pub fn nick(&self) -> Option<&str> {
        self.nick.as_deref()
    }

    /// Set the advertised nickname.
    pub fn set_nick(&mut self, nick: impl Into<String>) {
        self.nick = Some(nick.into());
    }

    /// First/last name from the `1st`/`last` TXT fields.
    pub fn name(&self) -> (Option<&str>, Option<&str>) {
        (self.first_name.as_deref(), self.last_name.as_deref())
    }

    /// Set first and last name.
    pub fn set_name(&mut self, first: Option<String>, last: Option<String>) {
        self.first_name = first;
        self.last_name = last;
    }

    /// Additional TXT records beyond the well-known keys.
    pub fn extras(&self) -> &TxtRecords {
        &self.extras
    }

    /// Mutable access to the additional TXT records.
    pub fn extras_mut(&mut self) -> &mut TxtRecords {
        &mut self.extras
    }

    /// Build the TXT record set advertised for this presence.
    ///
    /// `txtvers=1` is always emitted first, and `port.p2pj` echoes the SRV
    /// port for legacy consumers.
    pub fn to_txt(&self) -> TxtRecords {
        let mut txt = TxtRecords::new();
        txt.set("txtvers", "1");
        if let Some(v) = &self.first_name {
            txt.set("1st", v.clone());
        }
        if let Some(v) = &self.last_name {
            txt.set("last", v.clone());
        }
        if let Some(v) = &self.nick {
            txt.set("nick", v.clone());
        }
        if let Some(v) = &self.email {
            txt.set("email", v.clone());
        }
        if let Some(v) = &self.jid {
            txt.set("jid", v.clone());
        }
        txt.set("status", self.status.to_string());
        if let Some(v) = &self.msg {
            txt.set("msg", v.clone());
        }
        if let Some(v) = &self.hash {
            txt.set("hash", v.clone());
        }
        if let Some(v) = &self.node {
            txt.set("node", v.clone());
        }
        if let Some(v) = &self.ver {
            txt.set("ver", v.clone());
        }
        txt.set("port.p2pj", self.port.to_string());
        for (k, v) in self.extras.iter() {
            txt.set(k, v);
        }
        txt
    }

    /// Populate the presence from a decoded TXT record set.
    ///
    /// Unknown keys are preserved in [`extras`][`Self::extras`]. The
    /// `port.p2pj` echo is dropped; the SRV port is authoritative.
    pub fn apply_txt(&mut self, txt: TxtRecords) {
        self.extras = TxtRecords::new();
        for (key, value) in txt.iter() {
            match key {
                "txtvers" => {
                    if value != "1" {
                        log::warn!("peer {} advertises txtvers={}", self.service_name, value);
                    }
                }
                "1st" => self.first_name = Some(value.to_owned()),
                "last" => self.last_name = Some(value.to_owned()),
                "nick" => self.nick = Some(value.to_owned()),
                "email" => self.email = Some(value.to_owned()),
                "jid" => self.jid = Some(value.to_owned()),
                "status" => self.status = Mode::from_txt(value),
                "msg" => self.msg = Some(value.to_owned()),
                "hash" => self.hash = Some(value.to_owned()),
                "node" => self.node = Some(value.to_owned()),
                "ver" => self.ver = Some(value.to_owned()),
                "port.p2pj" => (),
                _ => self.extras.set(key, value),
            }
        }
    }
}

impl PartialEq for LlPresence {
    fn eq(&self, other: &Self) -> bool {
        self.service_name == other.service_name && self.host == other.host
    }
}

impl Eq for LlPresence {}

/// Change notification from a [`PresenceStore`].
#[derive(Debug, Clone)]
pub enum PresenceEvent {
    /// A peer appeared on the link.
    New(LlPresence),
    /// An already-known peer changed its advertised data.
    Updated(LlPresence),
    /// A peer withdrew its service (or its records expired).
    Removed(String),
}

/// All remote presences currently visible on the link, keyed by service
/// name.
///
/// The discovery adapter is the single writer; readers take snapshots. A
/// presence only enters the store once the service has fully resolved
/// (host, port and TXT data known).
pub struct PresenceStore {
    inner: RwLock<HashMap<String, LlPresence>>,
    events: broadcast::Sender<PresenceEvent>,
}

impl PresenceStore {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Look up a peer by service name.
    pub fn get(&self, service_name: &str) -> Option<LlPresence> {
        self.inner.read().unwrap().get(service_name).cloned()
    }

    /// Snapshot of every known peer.
    pub fn snapshot(&self) -> Vec<LlPresence> {
        self.inner.read().unwrap().values().cloned().collect()
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    /// True when no peer is known.
    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }

    /// Subscribe to presence change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    pub(crate) fn insert(&self, presence: LlPresence) {
        let event = {
            let mut map = self.inner.write().unwrap();
            match map.insert(presence.service_name().to_owned(), presence.clone()) {
                Some(_) => PresenceEvent::Updated(presence),
                None => PresenceEvent::New(presence),
            }
        };
        let _ = self.events.send(event);
    }

    pub(crate) fn remove(&self, service_name: &str) {
        let removed = self.inner.write().unwrap().remove(service_name).is_some();
        if removed {
            let _ = self
                .events
                .send(PresenceEvent::Removed(service_name.to_owned()));
        }
    }
}
