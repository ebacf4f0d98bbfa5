// Copyright (c) 2025 linklocal-xmpp contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-peer chat channels.

use std::collections::VecDeque;
use std::sync::{Mutex, Weak};

use tokio::sync::mpsc;

use xmpp_parsers::jid::Jid;
use xmpp_parsers::message::{Body, Message, MessageType};

use crate::error::Error;
use crate::service::ServiceInner;
use crate::stanza::Stanza;

/// A message channel to one remote peer.
///
/// A service keeps at most one chat per remote service name, created on the
/// first inbound or outbound message and kept for the lifetime of the
/// service. Messages which arrive while nobody listens are buffered (up to
/// a bound) and replayed, in order, to the first listener that attaches;
/// later listeners only see new messages.
pub struct Chat {
    remote: String,
    service: Weak<ServiceInner>,
    backlog_cap: usize,
    inner: Mutex<ChatInner>,
}

struct ChatInner {
    backlog: VecDeque<Message>,
    listeners: Vec<mpsc::UnboundedSender<Message>>,
}

impl Chat {
    pub(crate) fn new(remote: String, service: Weak<ServiceInner>, backlog_cap: usize) -> Self {
        Self {
            remote,
            service,
            backlog_cap,
            inner: Mutex::new(ChatInner {
                backlog: VecDeque::new(),
                listeners: Vec::new(),
            }),
        }
    }

    /// The remote peer's service name.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Attach a listener to this chat.
    ///
    /// If this is the first (live) listener, any buffered messages are
    /// replayed to it in FIFO order.
    pub fn attach(&self) -> ChatMessages {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        inner.listeners.retain(|listener| !listener.is_closed());
        if inner.listeners.is_empty() {
            for message in inner.backlog.drain(..) {
                let _ = tx.send(message);
            }
        }
        inner.listeners.push(tx);
        ChatMessages { rx }
    }

    /// Send a chat message to this peer.
    ///
    /// The message is stamped `type="chat"` and addressed to the remote
    /// service name before it is handed to the service.
    pub async fn send_message(&self, body: &str) -> Result<(), Error> {
        let mut message = Message::new(None::<Jid>);
        message
            .bodies
            .insert(String::new(), Body(body.to_owned()));
        self.send(message).await
    }

    /// Send a full `<message/>` stanza (subject, thread, payloads) to this
    /// peer. `to` and `type` are overwritten with this chat's addressing.
    pub async fn send(&self, mut message: Message) -> Result<(), Error> {
        let service = self.service.upgrade().ok_or(Error::Disconnected)?;
        message.to = Some(Jid::new(&self.remote)?);
        message.type_ = MessageType::Chat;
        service.send_stanza(Stanza::Message(message)).await
    }

    /// Deliver an inbound message: fan out to listeners, or buffer it when
    /// none is attached.
    pub(crate) fn deliver(&self, message: Message) {
        let mut inner = self.inner.lock().unwrap();
        inner.listeners.retain(|listener| !listener.is_closed());
        if inner.listeners.is_empty() {
            if inner.backlog.len() == self.backlog_cap {
                log::warn!(
                    "chat backlog for {} full, dropping oldest message",
                    self.remote
                );
                inner.backlog.pop_front();
            }
            inner.backlog.push_back(message);
            return;
        }
        for listener in &inner.listeners {
            let _ = listener.send(message.clone());
        }
    }
}

/// Receiving side of a chat listener.
pub struct ChatMessages {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl ChatMessages {
    /// Wait for the next message on this chat.
    ///
    /// Returns `None` once the chat is gone (service closed).
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}
