// Copyright (c) 2025 linklocal-xmpp contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use tokio::io::{AsyncWriteExt, BufReader};

use xso::{AsXml, FromXml};

use super::*;
use crate::error::{Error, ProtocolError};

#[derive(FromXml, AsXml, Debug, PartialEq)]
#[xml(namespace = "jabber:client", name = "data")]
struct Data {
    #[xml(text)]
    contents: String,
}

#[derive(FromXml, AsXml, Debug, PartialEq)]
#[xml(namespace = "jabber:client", name = "probe")]
struct Probe;

type Pair = (
    XmlReader<BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>>,
    XmlWriter<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
);

fn pair() -> (Pair, Pair) {
    let (lhs, rhs) = tokio::io::duplex(65536);
    let (lr, lw) = tokio::io::split(lhs);
    let (rr, rw) = tokio::io::split(rhs);
    (
        (XmlReader::new(BufReader::new(lr)), XmlWriter::new(lw)),
        (XmlReader::new(BufReader::new(rr)), XmlWriter::new(rw)),
    )
}

#[tokio::test]
async fn test_header_exchange() {
    let ((mut lr, mut lw), (mut rr, mut rw)) = pair();

    let initiator = async {
        lw.send_header(&StreamHeader {
            from: Some("alice@host-a".to_owned()),
            to: Some("bob@host-b".to_owned()),
        })
        .await
        .expect("send header");
        lr.recv_header().await.expect("recv header")
    };
    let responder = async {
        let header = rr.recv_header().await.expect("recv header");
        assert_eq!(header.from.as_deref(), Some("alice@host-a"));
        assert_eq!(header.to.as_deref(), Some("bob@host-b"));
        rw.send_header(&StreamHeader {
            from: Some("bob@host-b".to_owned()),
            to: Some("alice@host-a".to_owned()),
        })
        .await
        .expect("send header");
    };
    let (header, ()) = tokio::join!(initiator, responder);
    assert_eq!(header.from.as_deref(), Some("bob@host-b"));
    assert_eq!(header.to.as_deref(), Some("alice@host-a"));
}

#[tokio::test]
async fn test_exchange_elements() {
    let ((mut lr, mut lw), (mut rr, mut rw)) = pair();

    lw.send_header(&StreamHeader::default()).await.unwrap();
    rr.recv_header().await.unwrap();
    rw.send_header(&StreamHeader::default()).await.unwrap();
    lr.recv_header().await.unwrap();

    lw.send_element(&Data {
        contents: "hello".to_owned(),
    })
    .await
    .unwrap();
    lw.send_element(&Data {
        contents: "world".to_owned(),
    })
    .await
    .unwrap();

    let first: Data = rr.read_element().await.unwrap().unwrap();
    assert_eq!(first.contents, "hello");
    let second: Data = rr.read_element().await.unwrap().unwrap();
    assert_eq!(second.contents, "world");
}

#[tokio::test]
async fn test_footer_ends_stream() {
    let ((_lr, mut lw), (mut rr, _rw)) = pair();

    lw.send_header(&StreamHeader::default()).await.unwrap();
    rr.recv_header().await.unwrap();
    lw.send_footer().await.unwrap();

    let end: Option<Data> = rr.read_element().await.unwrap();
    assert!(end.is_none());
}

#[tokio::test]
async fn test_whitespace_keepalive_is_skipped() {
    let (lhs, rhs) = tokio::io::duplex(65536);
    let (_lr, mut lw) = tokio::io::split(lhs);
    let (rr, _rw) = tokio::io::split(rhs);
    let mut rr = XmlReader::new(BufReader::new(rr));

    lw.write_all(
        b"<stream:stream xmlns='jabber:client' \
          xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>\n \
          \n<data xmlns='jabber:client'>ping</data>",
    )
    .await
    .unwrap();

    rr.recv_header().await.unwrap();
    let data: Data = rr.read_element().await.unwrap().unwrap();
    assert_eq!(data.contents, "ping");
}

#[tokio::test]
async fn test_unsupported_version_is_rejected() {
    let (lhs, rhs) = tokio::io::duplex(65536);
    let (_lr, mut lw) = tokio::io::split(lhs);
    let (rr, _rw) = tokio::io::split(rhs);
    let mut rr = XmlReader::new(BufReader::new(rr));

    lw.write_all(
        b"<stream:stream xmlns='jabber:client' \
          xmlns:stream='http://etherx.jabber.org/streams' version='2.0'>",
    )
    .await
    .unwrap();

    match rr.recv_header().await {
        Err(Error::Protocol(ProtocolError::UnsupportedVersion(v))) => assert_eq!(v, "2.0"),
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_missing_version_is_tolerated() {
    let (lhs, rhs) = tokio::io::duplex(65536);
    let (_lr, mut lw) = tokio::io::split(lhs);
    let (rr, _rw) = tokio::io::split(rhs);
    let mut rr = XmlReader::new(BufReader::new(rr));

    lw.write_all(
        b"<stream:stream xmlns='jabber:client' \
          xmlns:stream='http://etherx.jabber.org/streams' \
          from='old@ichat' to='bob@host-b'>",
    )
    .await
    .unwrap();

    let header = rr.recv_header().await.expect("legacy header");
    assert_eq!(header.from.as_deref(), Some("old@ichat"));
}

#[tokio::test]
async fn test_parse_error_is_recoverable() {
    let ((mut lr, mut lw), (mut rr, mut rw)) = pair();

    lw.send_header(&StreamHeader::default()).await.unwrap();
    rr.recv_header().await.unwrap();
    rw.send_header(&StreamHeader::default()).await.unwrap();
    lr.recv_header().await.unwrap();

    // Well-formed XML which is not a <data/> element.
    lw.send_element(&Probe).await.unwrap();
    lw.send_element(&Data {
        contents: "after".to_owned(),
    })
    .await
    .unwrap();

    match rr.read_element::<Data>().await {
        Err(ReadError::Parse(_)) => (),
        other => panic!("expected parse error, got {:?}", other.map(|_| ())),
    }
    // The reader is back at stream level and can carry on.
    let next: Data = rr.read_element().await.unwrap().unwrap();
    assert_eq!(next.contents, "after");
}
