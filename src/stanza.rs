// Copyright (c) 2025 linklocal-xmpp contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use rand::{thread_rng, Rng};
use xmpp_parsers::{
    iq::Iq, jid::Jid, message::Message, presence::Presence, stream::StreamError,
};
use xso::{AsXml, FromXml};

pub(crate) fn make_id() -> String {
    let id: u64 = thread_rng().gen();
    format!("{}", id)
}

/// A stanza sent/received over a link-local stream.
#[derive(FromXml, AsXml, Debug, Clone)]
#[xml()]
pub enum Stanza {
    /// IQ stanza
    #[xml(transparent)]
    Iq(Iq),

    /// Message stanza
    #[xml(transparent)]
    Message(Message),

    /// Presence stanza
    #[xml(transparent)]
    Presence(Presence),
}

impl Stanza {
    /// Assign a random ID to the stanza, if no ID has been assigned yet.
    pub fn ensure_id(&mut self) -> &str {
        match self {
            Self::Iq(iq) => {
                if iq.id.len() == 0 {
                    iq.id = make_id();
                }
                &iq.id
            }
            Self::Message(message) => message.id.get_or_insert_with(make_id),
            Self::Presence(presence) => presence.id.get_or_insert_with(make_id),
        }
    }

    /// The stanza's `id`, if it has one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Iq(iq) => Some(&iq.id),
            Self::Message(message) => message.id.as_deref(),
            Self::Presence(presence) => presence.id.as_deref(),
        }
    }

    /// The addressee of the stanza.
    pub fn to(&self) -> Option<&Jid> {
        match self {
            Self::Iq(iq) => iq.to.as_ref(),
            Self::Message(message) => message.to.as_ref(),
            Self::Presence(presence) => presence.to.as_ref(),
        }
    }

    /// The sender of the stanza.
    pub fn from(&self) -> Option<&Jid> {
        match self {
            Self::Iq(iq) => iq.from.as_ref(),
            Self::Message(message) => message.from.as_ref(),
            Self::Presence(presence) => presence.from.as_ref(),
        }
    }

    /// Overwrite the sender of the stanza.
    pub fn set_from(&mut self, from: Jid) {
        match self {
            Self::Iq(iq) => iq.from = Some(from),
            Self::Message(message) => message.from = Some(from),
            Self::Presence(presence) => presence.from = Some(from),
        }
    }
}

impl From<Iq> for Stanza {
    fn from(other: Iq) -> Self {
        Self::Iq(other)
    }
}

impl From<Message> for Stanza {
    fn from(other: Message) -> Self {
        Self::Message(other)
    }
}

impl From<Presence> for Stanza {
    fn from(other: Presence) -> Self {
        Self::Presence(other)
    }
}

impl TryFrom<Stanza> for Iq {
    type Error = Stanza;

    fn try_from(other: Stanza) -> Result<Self, Self::Error> {
        match other {
            Stanza::Iq(st) => Ok(st),
            other => Err(other),
        }
    }
}

impl TryFrom<Stanza> for Message {
    type Error = Stanza;

    fn try_from(other: Stanza) -> Result<Self, Self::Error> {
        match other {
            Stanza::Message(st) => Ok(st),
            other => Err(other),
        }
    }
}

impl TryFrom<Stanza> for Presence {
    type Error = Stanza;

    fn try_from(other: Stanza) -> Result<Self, Self::Error> {
        match other {
            Stanza::Presence(st) => Ok(st),
            other => Err(other),
        }
    }
}

/// Any valid top-level element of a link-local stream.
#[derive(FromXml, AsXml, Debug)]
#[xml()]
pub(crate) enum StreamElement {
    /// IQ stanza
    #[xml(transparent)]
    Iq(Iq),

    /// Message stanza
    #[xml(transparent)]
    Message(Message),

    /// Presence stanza
    #[xml(transparent)]
    Presence(Presence),

    /// Stream-level error; terminates the stream
    #[xml(transparent)]
    StreamError(StreamError),
}

impl From<Stanza> for StreamElement {
    fn from(other: Stanza) -> Self {
        match other {
            Stanza::Iq(st) => Self::Iq(st),
            Stanza::Message(st) => Self::Message(st),
            Stanza::Presence(st) => Self::Presence(st),
        }
    }
}

impl TryFrom<StreamElement> for Stanza {
    type Error = StreamError;

    fn try_from(other: StreamElement) -> Result<Self, Self::Error> {
        match other {
            StreamElement::Iq(st) => Ok(Self::Iq(st)),
            StreamElement::Message(st) => Ok(Self::Message(st)),
            StreamElement::Presence(st) => Ok(Self::Presence(st)),
            StreamElement::StreamError(e) => Err(e),
        }
    }
}
