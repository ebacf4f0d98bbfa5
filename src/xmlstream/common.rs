// Copyright (c) 2025 linklocal-xmpp contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use alloc::borrow::Cow;
use core::pin::Pin;
use std::io;

use bytes::BytesMut;
use futures::future::poll_fn;

use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};

use xso::{
    exports::rxml::{self, writer::TrackNamespace, xml_ncname, Event, Namespace},
    AsXml, FromEventsBuilder, FromXml, Item,
};

use xmpp_parsers::ns::{JABBER_CLIENT, STREAM as XML_STREAM_NS};

use crate::error::{Error, ProtocolError};

/// Contents of a `<stream:stream>` header.
///
/// XEP-0174 makes `to` and `from` mandatory on the wire; they stay optional
/// here so that the responder can inspect what actually arrived.
#[derive(Debug, Clone, Default)]
pub struct StreamHeader {
    /// The `from` attribute: the sender's service name.
    pub from: Option<String>,

    /// The `to` attribute: the receiver's service name.
    pub to: Option<String>,
}

/// A non-success result while reading an element from the stream.
#[derive(Debug)]
pub enum ReadError {
    /// I/O or XML well-formedness error. Fatal for the stream.
    Io(io::Error),

    /// The XML was well-formed but did not match the expected element.
    ///
    /// The offending subtree has been consumed entirely, so the reader is
    /// back at stream level.
    Parse(xso::error::Error),
}

impl From<io::Error> for ReadError {
    fn from(other: io::Error) -> Self {
        Self::Io(other)
    }
}

/// Reading half of a link-local XML stream.
pub struct XmlReader<Io> {
    inner: rxml::AsyncReader<Io>,
}

impl<Io: AsyncBufRead + Unpin> XmlReader<Io> {
    /// Wrap a buffered reader in a fresh XML parser.
    pub fn new(io: Io) -> Self {
        Self {
            inner: rxml::AsyncReader::wrap(io, rxml::Parser::default()),
        }
    }

    fn set_text_buffering(&mut self, enabled: bool) {
        Pin::new(&mut self.inner)
            .parser_pinned()
            .set_text_buffering(enabled);
    }

    async fn next_event(&mut self) -> io::Result<Option<Event>> {
        loop {
            // Nobody wants to hear about the XML declaration.
            match poll_fn(|cx| Pin::new(&mut self.inner).poll_read(cx)).await? {
                Some(Event::XmlDeclaration(_, _)) => continue,
                other => return Ok(other),
            }
        }
    }

    /// Receive the peer's stream header.
    ///
    /// The header must be a `<stream:stream>` element; a `version`
    /// attribute, when present, must be `1.0` (legacy XEP-0174 peers omit
    /// it). Unknown attributes are ignored.
    pub async fn recv_header(&mut self) -> Result<StreamHeader, Error> {
        loop {
            match self.next_event().await? {
                Some(Event::StartElement(_, (ns, name), mut attrs)) => {
                    if ns != XML_STREAM_NS || name != "stream" {
                        return Err(ProtocolError::BadStreamHeader("unknown root element").into());
                    }

                    if let Some(version) = attrs.remove(Namespace::none(), "version") {
                        if version != "1.0" {
                            return Err(
                                ProtocolError::UnsupportedVersion(version.to_string()).into()
                            );
                        }
                    }

                    let from = attrs.remove(Namespace::none(), "from");
                    let to = attrs.remove(Namespace::none(), "to");

                    return Ok(StreamHeader {
                        from: from.map(|v| v.to_string()),
                        to: to.map(|v| v.to_string()),
                    });
                }
                Some(Event::Text(_, _)) | Some(Event::EndElement(_)) => {
                    return Err(
                        ProtocolError::BadStreamHeader("content before stream header").into(),
                    );
                }
                Some(Event::XmlDeclaration(_, _)) => (),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "eof before stream header",
                    )
                    .into())
                }
            }
        }
    }

    /// Read the next child element of the stream root.
    ///
    /// XML whitespace between elements is discarded. Returns `Ok(None)` when
    /// the peer closed the stream with `</stream:stream>`.
    pub async fn read_element<T: FromXml>(&mut self) -> Result<Option<T>, ReadError> {
        // Keep text buffering off before the start event so that whitespace
        // keepalives cannot accumulate.
        self.set_text_buffering(false);
        let mut builder = loop {
            match self.next_event().await? {
                Some(Event::Text(_, data)) => {
                    if xso::is_xml_whitespace(data.as_bytes()) {
                        continue;
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "non-whitespace text content between stanzas",
                    )
                    .into());
                }
                Some(Event::StartElement(_, name, attrs)) => {
                    break <Result<T, xso::error::Error> as FromXml>::from_events(name, attrs)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                }
                // The stream footer.
                Some(Event::EndElement(_)) => return Ok(None),
                Some(Event::XmlDeclaration(_, _)) => (),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "eof between stanzas",
                    )
                    .into())
                }
            }
        };

        self.set_text_buffering(true);
        loop {
            let ev = match self.next_event().await? {
                Some(ev) => ev,
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "eof in the middle of a stanza",
                    )
                    .into())
                }
            };
            match builder.feed(ev) {
                // XML nesting errors are not recoverable.
                Err(err) => {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, err).into());
                }
                Ok(Some(Err(err))) => return Err(ReadError::Parse(err)),
                Ok(Some(Ok(value))) => return Ok(Some(value)),
                Ok(None) => (),
            }
        }
    }
}

/// Writing half of a link-local XML stream.
///
/// Serialised data is staged in an internal buffer; every send method
/// flushes it to the underlying writer before returning.
pub struct XmlWriter<Io> {
    io: Io,
    writer: rxml::writer::Encoder<rxml::writer::SimpleNamespaces>,
    buf: BytesMut,
}

impl<Io: AsyncWrite + Unpin> XmlWriter<Io> {
    /// Wrap a writer in a fresh XML encoder.
    ///
    /// The `stream` prefix is bound to the RFC 6120 streams namespace and
    /// the default namespace to `jabber:client`, so both end up declared on
    /// the stream header.
    pub fn new(io: Io) -> Self {
        let mut writer = rxml::writer::Encoder::new();
        writer
            .ns_tracker_mut()
            .declare_fixed(Some(xml_ncname!("stream")), XML_STREAM_NS.into());
        writer
            .ns_tracker_mut()
            .declare_fixed(None, JABBER_CLIENT.into());
        Self {
            io,
            writer,
            buf: BytesMut::new(),
        }
    }

    fn encode(&mut self, item: &Item<'_>) -> io::Result<()> {
        self.writer
            .encode_into_bytes(item.as_rxml_item(), &mut self.buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }

    fn encode_xso<T: AsXml>(&mut self, xso: &T) -> io::Result<()> {
        let prev_len = self.buf.len();
        match self.try_encode_xso(xso) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Failed half-way through: rewind so the wire never sees a
                // partial element.
                self.buf.truncate(prev_len);
                Err(e)
            }
        }
    }

    fn try_encode_xso<T: AsXml>(&mut self, xso: &T) -> io::Result<()> {
        let iter = xso
            .as_xml_iter()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        for item in iter {
            let item = item.map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            self.encode(&item)?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            self.io.write_all(&self.buf).await?;
            self.buf.clear();
        }
        self.io.flush().await
    }

    /// Send our stream header, opening the `<stream:stream>` element.
    pub async fn send_header(&mut self, header: &StreamHeader) -> io::Result<()> {
        self.encode(&Item::XmlDeclaration(rxml::XmlVersion::V1_0))?;
        self.encode(&Item::ElementHeadStart(
            Namespace::from(XML_STREAM_NS),
            Cow::Borrowed(xml_ncname!("stream")),
        ))?;
        if let Some(from) = &header.from {
            self.encode(&Item::Attribute(
                Namespace::NONE,
                Cow::Borrowed(xml_ncname!("from")),
                Cow::Borrowed(from.as_str()),
            ))?;
        }
        if let Some(to) = &header.to {
            self.encode(&Item::Attribute(
                Namespace::NONE,
                Cow::Borrowed(xml_ncname!("to")),
                Cow::Borrowed(to.as_str()),
            ))?;
        }
        self.encode(&Item::Attribute(
            Namespace::NONE,
            Cow::Borrowed(xml_ncname!("version")),
            Cow::Borrowed("1.0"),
        ))?;
        self.encode(&Item::ElementHeadEnd)?;
        self.flush().await
    }

    /// Serialise one element and flush it to the wire.
    pub async fn send_element<T: AsXml>(&mut self, xso: &T) -> io::Result<()> {
        self.encode_xso(xso)?;
        self.flush().await
    }

    /// Close the stream with `</stream:stream>`.
    pub async fn send_footer(&mut self) -> io::Result<()> {
        self.encode(&Item::ElementFoot)?;
        self.flush().await
    }

    /// Flush and shut down the underlying writer.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.flush().await?;
        self.io.shutdown().await
    }
}
