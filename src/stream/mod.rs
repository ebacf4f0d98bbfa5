// Copyright (c) 2025 linklocal-xmpp contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Per-peer stream engine
//!
//! One [`StreamHandle`] stands for one TCP connection to one remote peer,
//! after the stream headers have been exchanged. Behind the handle run
//! three tasks:
//!
//! - a **reader** task pulling stanzas off the wire and forwarding them to
//!   the service's dispatcher,
//! - a **writer** task draining the bounded outbound queue in order,
//! - an **idle watchdog** which tears the stream down once it has seen
//!   neither a read nor a write for longer than the configured idle
//!   timeout.
//!
//! Teardown is coordinated through a shutdown flag rather than through the
//! tasks observing each other; whichever task (or external caller) closes
//! the stream first records the reason, and the reader publishes the final
//! state exactly once.

use core::time::Duration;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::{mpsc, watch};

use crate::config::Config;
use crate::error::Error;
use crate::stanza::Stanza;
use crate::xmlstream::{XmlReader, XmlWriter};

mod worker;


/// Which side opened the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialed the peer.
    Initiator,
    /// The peer dialed us.
    Responder,
}

/// Lifecycle of a link-local stream.
///
/// The TCP connect and header exchange run to completion before a
/// [`StreamHandle`] is created, so a handle starts out [`Open`][`Self::Open`];
/// a dial or accept that fails during the handshake surfaces as an error to
/// its caller instead of a short-lived stream object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Headers exchanged; stanzas flow.
    Open,
    /// Orderly teardown started (footer sent/being sent).
    Closing,
    /// The stream ended cleanly.
    Closed,
    /// The stream ended due to an I/O or protocol error.
    ClosedErr,
}

/// Notification from a stream to its owning service.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    /// A stanza arrived on the stream.
    Stanza {
        id: u64,
        remote: String,
        stanza: Stanza,
    },

    /// The stream reached a terminal state.
    Closed {
        id: u64,
        remote: String,
        direction: Direction,
        error: Option<Error>,
    },
}

/// Wall-clock of the most recent successful read or write.
pub(crate) struct Activity {
    epoch: tokio::time::Instant,
    millis: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            epoch: tokio::time::Instant::now(),
            millis: AtomicU64::new(0),
        }
    }

    pub(crate) fn bump(&self) {
        self.millis
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.millis.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

/// State shared between the stream's tasks and its handle.
pub(crate) struct StreamShared {
    state: watch::Sender<StreamState>,
    shutdown: watch::Sender<bool>,
    reason: Mutex<Option<Error>>,
    pub(crate) activity: Activity,
}

impl StreamShared {
    fn new() -> Self {
        let (state, _) = watch::channel(StreamState::Open);
        let (shutdown, _) = watch::channel(false);
        Self {
            state,
            shutdown,
            reason: Mutex::new(None),
            activity: Activity::new(),
        }
    }

    /// Ask all tasks of this stream to wind down.
    ///
    /// The first recorded `reason` wins; `None` means an orderly close. Safe
    /// to call any number of times from any task.
    pub(crate) fn begin_close(&self, reason: Option<Error>) {
        if let Some(reason) = reason {
            self.reason.lock().unwrap().get_or_insert(reason);
        }
        self.state.send_if_modified(|state| {
            if *state == StreamState::Open {
                *state = StreamState::Closing;
                true
            } else {
                false
            }
        });
        self.shutdown.send_replace(true);
    }

    fn take_reason(&self) -> Option<Error> {
        self.reason.lock().unwrap().take()
    }

    fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

/// Handle to an open stream, held by the session manager.
pub struct StreamHandle {
    pub(crate) id: u64,
    direction: Direction,
    remote: String,
    pub(crate) tx: mpsc::Sender<Stanza>,
    shared: Arc<StreamShared>,
}

impl StreamHandle {
    /// Which side opened this stream.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The remote peer's service name.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        *self.shared.state.borrow()
    }

    /// True while stanzas can still be enqueued.
    pub fn is_open(&self) -> bool {
        self.state() == StreamState::Open
    }

    /// Start an orderly close.
    pub(crate) fn close(&self) {
        self.shared.begin_close(None);
    }

    /// Wait until the stream reaches a terminal state.
    pub(crate) async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        loop {
            if matches!(
                *state.borrow(),
                StreamState::Closed | StreamState::ClosedErr
            ) {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Start the tasks for a stream whose headers have been exchanged.
pub(crate) fn spawn<R, W>(
    id: u64,
    direction: Direction,
    remote: String,
    reader: XmlReader<R>,
    writer: XmlWriter<W>,
    config: &Config,
    events: mpsc::Sender<StreamEvent>,
) -> Arc<StreamHandle>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.queue_depth);
    let shared = Arc::new(StreamShared::new());

    tokio::spawn(worker::writer_task(
        writer,
        rx,
        shared.clone(),
        config.shutdown_drain,
    ));
    tokio::spawn(worker::reader_task(
        reader,
        shared.clone(),
        events,
        id,
        remote.clone(),
        direction,
    ));
    tokio::spawn(worker::watchdog_task(
        shared.clone(),
        config.watchdog_tick,
        config.idle_timeout,
    ));

    Arc::new(StreamHandle {
        id,
        direction,
        remote,
        tx,
        shared,
    })
}
