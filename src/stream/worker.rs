// Copyright (c) 2025 linklocal-xmpp contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::time::Duration;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::error::{Error, ProtocolError};
use crate::stanza::{Stanza, StreamElement};
use crate::stream::{Direction, StreamEvent, StreamShared, StreamState};
use crate::xmlstream::{ReadError, XmlReader, XmlWriter};

/// Drain the outbound queue onto the wire, in enqueue order.
pub(super) async fn writer_task<W: AsyncWrite + Unpin>(
    mut writer: XmlWriter<W>,
    mut rx: mpsc::Receiver<Stanza>,
    shared: Arc<StreamShared>,
    drain: Duration,
) {
    let mut shutdown = shared.subscribe_shutdown();
    while !*shutdown.borrow() {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            item = rx.recv() => match item {
                Some(stanza) => {
                    if let Err(e) = writer.send_element(&stanza).await {
                        log::debug!("stream write failed: {}", e);
                        shared.begin_close(Some(Error::Io(e)));
                        return;
                    }
                    shared.activity.bump();
                }
                // All senders dropped; the service let go of the stream.
                None => break,
            }
        }
    }

    // Closing: flush what is still queued, best effort, then the footer.
    let deadline = tokio::time::Instant::now() + drain;
    while let Ok(stanza) = rx.try_recv() {
        match tokio::time::timeout_at(deadline, writer.send_element(&stanza)).await {
            Ok(Ok(())) => shared.activity.bump(),
            Ok(Err(_)) | Err(_) => return,
        }
    }
    let _ = tokio::time::timeout(drain, async {
        let _ = writer.send_footer().await;
        let _ = writer.shutdown().await;
    })
    .await;
}

/// Pull top-level elements off the wire and forward stanzas to the
/// dispatcher. The reader is also the task which publishes the stream's
/// terminal state, exactly once.
pub(super) async fn reader_task<R: AsyncBufRead + Unpin>(
    mut reader: XmlReader<R>,
    shared: Arc<StreamShared>,
    events: mpsc::Sender<StreamEvent>,
    id: u64,
    remote: String,
    direction: Direction,
) {
    let mut shutdown = shared.subscribe_shutdown();
    while !*shutdown.borrow() {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            element = reader.read_element::<StreamElement>() => match element {
                Ok(Some(element)) => {
                    shared.activity.bump();
                    match Stanza::try_from(element) {
                        Ok(stanza) => {
                            let event = StreamEvent::Stanza {
                                id,
                                remote: remote.clone(),
                                stanza,
                            };
                            if events.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(stream_error) => {
                            log::debug!(
                                "peer {} reported stream error: {:?}",
                                remote,
                                stream_error.condition
                            );
                            shared.begin_close(Some(
                                ProtocolError::StreamError(format!(
                                    "{:?}",
                                    stream_error.condition
                                ))
                                .into(),
                            ));
                            break;
                        }
                    }
                }
                // </stream:stream>: the peer wants an orderly close.
                Ok(None) => {
                    shared.begin_close(None);
                    break;
                }
                Err(ReadError::Parse(e)) => {
                    shared.begin_close(Some(ProtocolError::Parse(e).into()));
                    break;
                }
                Err(ReadError::Io(e)) => {
                    shared.begin_close(Some(Error::Io(e)));
                    break;
                }
            }
        }
    }

    shared.begin_close(None);
    let error = shared.take_reason();
    let state = if error.is_some() {
        StreamState::ClosedErr
    } else {
        StreamState::Closed
    };
    shared.state.send_replace(state);
    let _ = events
        .send(StreamEvent::Closed {
            id,
            remote,
            direction,
            error,
        })
        .await;
}

/// Close the stream once it has been quiet for longer than `idle`.
///
/// The watchdog exits on the shared shutdown flag; it never inspects the
/// other tasks directly.
pub(super) async fn watchdog_task(shared: Arc<StreamShared>, tick: Duration, idle: Duration) {
    let mut shutdown = shared.subscribe_shutdown();
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
    while !*shutdown.borrow() {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = interval.tick() => {
                let quiet = shared.activity.idle_for();
                if quiet > idle {
                    log::debug!("stream idle for {:?}, closing", quiet);
                    shared.begin_close(None);
                    return;
                }
            }
        }
    }
}
