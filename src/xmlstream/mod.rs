// Copyright (c) 2025 linklocal-xmpp contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Link-local XML streams
//!
//! **Note:** this is a low-level API; most users want
//! [`LinkLocalService`][`crate::LinkLocalService`] instead.
//!
//! A link-local stream is the XEP-0174 flavour of an RFC 6120 XML stream:
//! no stream features, no negotiation, just a `<stream:stream>` header in
//! each direction followed by stanzas. Because there is nothing to
//! negotiate, each TCP stream can be split into an independent
//! [`XmlReader`] and [`XmlWriter`] half right away:
//!
//! - The **initiator** sends its header (`to`, `from`, `version="1.0"`)
//!   through the writer, then awaits the responder's header on the reader.
//! - The **responder** awaits the initiator's header first. `from` carries
//!   the remote service name; only if that name is known may the responder
//!   answer with its own header.
//!
//! After the headers are exchanged, [`XmlReader::read_element`] yields the
//! top-level children of the stream until the footer arrives.

mod common;
#[cfg(test)]
mod tests;

pub use self::common::{ReadError, StreamHeader, XmlReader, XmlWriter};
