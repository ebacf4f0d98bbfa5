// Copyright (c) 2025 linklocal-xmpp contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;

use crate::jid;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// I/O error on a stream or the listening socket
    Io(IoError),
    /// No presence is known for the target service name
    PeerUnavailable(String),
    /// No free port in the configured listener range
    BindFailed {
        /// First port that was tried
        first: u16,
        /// Last port that was tried
        last: u16,
    },
    /// Error from the DNS-SD layer
    Discovery(Box<dyn StdError + Send + Sync>),
    /// Protocol-level error on a stream or in presence data
    Protocol(ProtocolError),
    /// Error parsing a service name as Jabber-Id
    JidParse(jid::Error),
    /// A reply did not arrive within the configured window
    Timeout,
    /// The service has been closed
    Disconnected,
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(fmt, "IO error: {}", e),
            Error::PeerUnavailable(name) => write!(fmt, "no presence known for {}", name),
            Error::BindFailed { first, last } => {
                write!(fmt, "no free port in range [{}, {}]", first, last)
            }
            Error::Discovery(e) => write!(fmt, "discovery error: {}", e),
            Error::Protocol(e) => write!(fmt, "protocol error: {}", e),
            Error::JidParse(e) => write!(fmt, "jid parse error: {}", e),
            Error::Timeout => write!(fmt, "timed out waiting for a reply"),
            Error::Disconnected => write!(fmt, "service closed"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Protocol(e) => Some(e),
            Error::JidParse(e) => Some(e),
            Error::Discovery(e) => Some(&**e),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<jid::Error> for Error {
    fn from(e: jid::Error) -> Self {
        Error::JidParse(e)
    }
}

impl From<mdns_sd::Error> for Error {
    fn from(e: mdns_sd::Error) -> Self {
        Error::Discovery(Box::new(e))
    }
}

/// XMPP protocol-level error
#[derive(Debug)]
pub enum ProtocolError {
    /// Error with expected stanza schema
    Parse(xso::error::Error),
    /// The inbound stream header was unusable
    BadStreamHeader(&'static str),
    /// The inbound stream header carried an unsupported version
    UnsupportedVersion(String),
    /// The peer reported a stream-level error
    StreamError(String),
    /// An outbound stanza carried no `to` attribute
    MissingAddressee,
    /// A TXT record was not valid UTF-8
    InvalidTxtUtf8,
    /// A TXT record length prefix pointed past the end of the payload
    TxtTruncated,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::Parse(e) => write!(fmt, "error with expected stanza schema: {}", e),
            ProtocolError::BadStreamHeader(what) => {
                write!(fmt, "unusable stream header: {}", what)
            }
            ProtocolError::UnsupportedVersion(v) => {
                write!(fmt, "unsupported stream version: {}", v)
            }
            ProtocolError::StreamError(e) => write!(fmt, "stream error from peer: {}", e),
            ProtocolError::MissingAddressee => write!(fmt, "stanza has no `to` attribute"),
            ProtocolError::InvalidTxtUtf8 => write!(fmt, "TXT record is not valid UTF-8"),
            ProtocolError::TxtTruncated => write!(fmt, "TXT record length overruns the payload"),
        }
    }
}

impl StdError for ProtocolError {}

impl From<xso::error::Error> for ProtocolError {
    fn from(e: xso::error::Error) -> Self {
        ProtocolError::Parse(e)
    }
}

impl From<xso::error::Error> for Error {
    fn from(e: xso::error::Error) -> Self {
        ProtocolError::Parse(e).into()
    }
}
