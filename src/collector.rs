// Copyright (c) 2025 linklocal-xmpp contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Cross-stream stanza collectors.
//!
//! A collector aggregates every stanza matching a filter, regardless of
//! which stream delivered it. That property is what makes request/response
//! correlation survive a reply arriving on a different TCP connection than
//! the one that carried the request, either because the original stream
//! idle-closed in between or because a concurrent dial produced two streams
//! to the same peer.

use core::time::Duration;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;

use crate::stanza::Stanza;

/// Predicate deciding whether a collector or listener wants a stanza.
pub(crate) type BoxFilter = Box<dyn Fn(&Stanza) -> bool + Send + Sync>;

pub(crate) struct CollectorInner {
    filter: BoxFilter,
    queue: Mutex<VecDeque<Stanza>>,
    waiter: Notify,
    cancelled: AtomicBool,
}

impl CollectorInner {
    pub(crate) fn new(filter: BoxFilter) -> Self {
        Self {
            filter,
            queue: Mutex::new(VecDeque::new()),
            waiter: Notify::new(),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Offer a stanza; only matches are enqueued. Returns whether the
    /// stanza was taken.
    pub(crate) fn offer(&self, stanza: &Stanza) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        if !(self.filter)(stanza) {
            return false;
        }
        self.queue.lock().unwrap().push_back(stanza.clone());
        self.waiter.notify_one();
        true
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.waiter.notify_waiters();
    }
}

/// Aggregator for stanzas matching a filter, across all streams of a
/// service.
///
/// Obtained from
/// [`LinkLocalService::create_collector`][`crate::LinkLocalService::create_collector`].
/// Dropping the collector cancels it.
pub struct PacketCollector {
    inner: Arc<CollectorInner>,
    registry: Weak<Mutex<Vec<Arc<CollectorInner>>>>,
}

impl PacketCollector {
    pub(crate) fn new(
        inner: Arc<CollectorInner>,
        registry: Weak<Mutex<Vec<Arc<CollectorInner>>>>,
    ) -> Self {
        Self { inner, registry }
    }

    /// Wait up to `timeout` for the next matching stanza.
    ///
    /// Returns `None` on timeout or after the collector was cancelled. A
    /// zero timeout returns an already-queued stanza immediately, if any.
    pub async fn next(&self, timeout: Duration) -> Option<Stanza> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(stanza) = self.inner.queue.lock().unwrap().pop_front() {
                return Some(stanza);
            }
            if self.inner.cancelled.load(Ordering::SeqCst) {
                return None;
            }
            let notified = self.inner.waiter.notified();
            match tokio::time::timeout_at(deadline, notified).await {
                Ok(()) => continue,
                // One final look: the stanza may have raced the deadline.
                Err(_) => return self.inner.queue.lock().unwrap().pop_front(),
            }
        }
    }

    /// Stop collecting and remove the collector from its service.
    pub fn cancel(&self) {
        self.inner.cancel();
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap()
                .retain(|c| !Arc::ptr_eq(c, &self.inner));
        }
    }
}

impl Drop for PacketCollector {
    fn drop(&mut self) {
        self.cancel();
    }
}
