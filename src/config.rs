// Copyright (c) 2025 linklocal-xmpp contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::ops::RangeInclusive;
use core::time::Duration;

/// Tunables for a [`LinkLocalService`][`crate::LinkLocalService`].
///
/// The defaults implement the constants from XEP-0174 deployments: a
/// listener in `[2300, 2400]`, a 15 second idle timeout checked every 14
/// seconds, and a 5 second IQ reply window.
#[derive(Debug, Clone)]
pub struct Config {
    /// DNS-SD service type advertised and browsed.
    pub service_type: String,

    /// Candidate ports for the TCP listener, tried in order.
    pub port_range: RangeInclusive<u16>,

    /// Maximum silence on a stream before it is torn down.
    ///
    /// Link-local peers may disappear without a TCP FIN (suspend, Wi-Fi
    /// roam); this bounds the lifetime of zombie connections.
    pub idle_timeout: Duration,

    /// How often each stream's idle watchdog wakes up.
    pub watchdog_tick: Duration,

    /// How long [`send_iq`][`crate::LinkLocalService::send_iq`] waits for
    /// the matching `result`/`error`.
    pub reply_timeout: Duration,

    /// Capacity of the per-stream outbound stanza queue. Enqueueing blocks
    /// while the queue is full.
    pub queue_depth: usize,

    /// How many messages a chat buffers before the first listener attaches.
    pub chat_backlog: usize,

    /// How long shutdown waits for writer queues to flush, best effort.
    pub shutdown_drain: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_type: "_presence._tcp.local.".to_owned(),
            port_range: 2300..=2400,
            idle_timeout: Duration::new(15, 0),
            watchdog_tick: Duration::new(14, 0),
            reply_timeout: Duration::new(5, 0),
            queue_depth: 500,
            chat_backlog: 128,
            shutdown_drain: Duration::from_millis(150),
        }
    }
}
