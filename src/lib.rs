// Copyright (c) 2025 linklocal-xmpp contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Serverless [XMPP](https://xmpp.org/) messaging for the local link
//! ([XEP-0174](https://xmpp.org/extensions/xep-0174.html)) with
//! asynchronous I/O using [tokio](https://tokio.rs/).
//!
//! Peers advertise themselves as a `_presence._tcp.local.` DNS-SD service
//! over mDNS, discover each other without any server, and exchange XMPP
//! stanzas over direct TCP streams. This crate provides the session engine:
//! the advertised local presence, the store of peers on the link, the
//! per-peer stream lifecycle (listen, dial, idle eviction, teardown), and
//! stanza dispatch into chats, listeners and cross-stream collectors.
//!
//! # Getting started
//!
//! ```no_run
//! use core::time::Duration;
//!
//! use linklocal_xmpp::{Config, LinkLocalService, LlPresence};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), linklocal_xmpp::Error> {
//!     let mut presence = LlPresence::new("alice@example");
//!     presence.set_nick("Alice");
//!     let service = LinkLocalService::new(presence, Config::default()).await?;
//!
//!     // Talk to a peer once discovery has seen it.
//!     if let Some(peer) = service.wait_for_peer("bob@example", Duration::from_secs(5)).await {
//!         let chat = service.chat(peer.service_name());
//!         chat.send_message("hello over the link!").await?;
//!
//!         let mut inbox = chat.attach();
//!         while let Some(message) = inbox.recv().await {
//!             println!("bob says: {:?}", message.bodies.values().next());
//!         }
//!     }
//!     service.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # What this crate is not
//!
//! Streams are plaintext TCP between mutually-trusting peers on the same
//! link, per XEP-0174: no TLS, no SASL, no server roster, no offline
//! storage, no routing beyond the link.

#![deny(unsafe_code, bare_trait_objects)]

extern crate alloc;

pub use xmpp_parsers as parsers;
pub use xmpp_parsers::{jid, minidom};

pub mod chat;
pub mod collector;
mod config;
pub mod discovery;
/// Detailed error types
pub mod error;
pub mod presence;
pub mod service;
mod stanza;
pub mod stream;
pub mod txt;
pub mod xmlstream;

pub use crate::chat::{Chat, ChatMessages};
pub use crate::collector::PacketCollector;
pub use crate::config::Config;
#[doc(inline)]
pub use crate::error::Error;
pub use crate::presence::{LlPresence, Mode, PresenceEvent, PresenceStore};
pub use crate::service::{LinkLocalService, PacketListener, ServiceEvent};
pub use crate::stanza::Stanza;
