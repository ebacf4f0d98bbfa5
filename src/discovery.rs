// Copyright (c) 2025 linklocal-xmpp contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! DNS-SD discovery of link-local peers.
//!
//! The session engine only consumes the small [`Discovery`] interface:
//! publish the local presence, re-announce it after changes, and feed a
//! stream of resolve/remove events. [`DnsSdDiscovery`] binds that interface
//! to the `mdns-sd` crate; tests and exotic deployments can plug in their
//! own implementation.

use core::time::Duration;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::Error;
use crate::presence::LlPresence;
use crate::txt::TxtRecords;

/// Notification from the discovery layer.
#[derive(Debug)]
pub enum DiscoveryEvent {
    /// A peer's service fully resolved (host, port and TXT data known).
    ///
    /// Also sent when an already-known peer re-announces with new data.
    Resolved(LlPresence),

    /// A peer withdrew its service, or its records expired.
    Removed(String),

    /// Our own registration was renamed after a name collision.
    NameChanged {
        /// The service name we lost.
        old: String,
        /// The service name we now advertise.
        new: String,
    },
}

/// The discovery boundary the session engine consumes.
///
/// Implementations own their mDNS/DNS-SD handle; nothing here is process
/// global, so several services (or a test harness) can run side by side.
pub trait Discovery: Send + 'static {
    /// Publish `local` and start browsing for peers.
    ///
    /// Returns the service name actually registered (implementations which
    /// detect a collision synchronously may return a renamed label) and the
    /// feed of discovery events. Later renames are reported via
    /// [`DiscoveryEvent::NameChanged`].
    fn start(
        &mut self,
        local: &LlPresence,
    ) -> Result<(String, mpsc::UnboundedReceiver<DiscoveryEvent>), Error>;

    /// Replace the advertised TXT data and re-announce.
    fn update(&mut self, local: &LlPresence) -> Result<(), Error>;

    /// Re-broadcast the current advertisement unchanged.
    fn reannounce(&mut self) -> Result<(), Error>;

    /// Withdraw the service.
    fn shutdown(&mut self);
}

struct Registration {
    local: LlPresence,
    hostname: String,
    fullname: String,
}

/// [`Discovery`] over the `mdns-sd` crate.
pub struct DnsSdDiscovery {
    daemon: ServiceDaemon,
    service_type: String,
    shared: Arc<Mutex<Registration>>,
}

impl DnsSdDiscovery {
    /// Create a daemon for the configured service type.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let daemon = ServiceDaemon::new()?;
        Ok(Self {
            daemon,
            service_type: config.service_type.clone(),
            shared: Arc::new(Mutex::new(Registration {
                local: LlPresence::default(),
                hostname: String::new(),
                fullname: String::new(),
            })),
        })
    }
}

impl Discovery for DnsSdDiscovery {
    fn start(
        &mut self,
        local: &LlPresence,
    ) -> Result<(String, mpsc::UnboundedReceiver<DiscoveryEvent>), Error> {
        let hostname = local
            .host()
            .map(str::to_owned)
            .unwrap_or_else(default_hostname);
        let info = service_info(&self.service_type, local, &hostname)?;
        let fullname = info.get_fullname().to_string();
        {
            let mut registration = self.shared.lock().unwrap();
            registration.local = local.clone();
            registration.hostname = hostname;
            registration.fullname = fullname;
        }
        self.daemon.register(info)?;
        log::info!(
            "registered {:?} as {}",
            local.service_name(),
            self.service_type
        );

        let browse_rx = self.daemon.browse(&self.service_type)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let daemon = self.daemon.clone();
        let service_type = self.service_type.clone();
        let shared = self.shared.clone();
        // mdns-sd hands out events over a blocking channel; pump it on a
        // blocking thread and marshal into the tokio channel.
        tokio::task::spawn_blocking(move || {
            browse_loop(daemon, service_type, shared, browse_rx, tx)
        });

        Ok((local.service_name().to_owned(), rx))
    }

    fn update(&mut self, local: &LlPresence) -> Result<(), Error> {
        let mut registration = self.shared.lock().unwrap();
        registration.local = local.clone();
        let info = service_info(&self.service_type, &registration.local, &registration.hostname)?;
        registration.fullname = info.get_fullname().to_string();
        // Re-registering the same instance re-announces it with the new
        // TXT data.
        self.daemon.register(info)?;
        Ok(())
    }

    fn reannounce(&mut self) -> Result<(), Error> {
        let registration = self.shared.lock().unwrap();
        let info = service_info(
            &self.service_type,
            &registration.local,
            &registration.hostname,
        )?;
        self.daemon.register(info)?;
        Ok(())
    }

    fn shutdown(&mut self) {
        let fullname = self.shared.lock().unwrap().fullname.clone();
        match self.daemon.unregister(&fullname) {
            Ok(rx) => {
                let _ = rx.recv_timeout(Duration::from_secs(1));
            }
            Err(e) => log::debug!("failed to unregister {:?}: {}", fullname, e),
        }
        match self.daemon.shutdown() {
            Ok(rx) => {
                let _ = rx.recv_timeout(Duration::from_secs(1));
            }
            Err(e) => log::debug!("failed to shut down mDNS daemon: {}", e),
        }
    }
}

fn browse_loop(
    daemon: ServiceDaemon,
    service_type: String,
    shared: Arc<Mutex<Registration>>,
    browse_rx: mdns_sd::Receiver<ServiceEvent>,
    tx: mpsc::UnboundedSender<DiscoveryEvent>,
) {
    while let Ok(event) = browse_rx.recv() {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let Some(instance) = instance_name(info.get_fullname(), &service_type) else {
                    continue;
                };
                let instance = instance.to_owned();

                let (our_name, our_host) = {
                    let registration = shared.lock().unwrap();
                    (
                        registration.local.service_name().to_owned(),
                        registration.hostname.clone(),
                    )
                };
                if instance == our_name {
                    let their_host = info.get_hostname();
                    if !their_host.eq_ignore_ascii_case(&our_host) {
                        // Somebody else on the link claims our instance
                        // name.
                        handle_collision(&daemon, &service_type, &shared, their_host, &tx);
                    }
                    continue;
                }

                match presence_from_info(instance, &info) {
                    Ok(presence) => {
                        if tx.send(DiscoveryEvent::Resolved(presence)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!(
                            "ignoring mis-encoded presence {:?}: {}",
                            info.get_fullname(),
                            e
                        );
                    }
                }
            }
            ServiceEvent::ServiceRemoved(_, fullname) => {
                let Some(instance) = instance_name(&fullname, &service_type) else {
                    continue;
                };
                let our_name = shared.lock().unwrap().local.service_name().to_owned();
                if instance == our_name {
                    continue;
                }
                if tx.send(DiscoveryEvent::Removed(instance.to_owned())).is_err() {
                    break;
                }
            }
            ServiceEvent::ServiceFound(_, fullname) => {
                // Only the PTR record so far; SRV/TXT/A resolution follows
                // and surfaces as ServiceResolved.
                log::debug!("found {:?}, awaiting resolution", fullname);
            }
            ServiceEvent::SearchStarted(_) | ServiceEvent::SearchStopped(_) => (),
        }
    }
    log::debug!("mDNS browse loop ended");
}

/// Resolve a name collision deterministically: of the two registrants, the
/// one whose host sorts lexicographically greater gives way and renames.
/// Both sides reach the same verdict without negotiating.
fn handle_collision(
    daemon: &ServiceDaemon,
    service_type: &str,
    shared: &Arc<Mutex<Registration>>,
    their_host: &str,
    tx: &mpsc::UnboundedSender<DiscoveryEvent>,
) {
    let mut registration = shared.lock().unwrap();
    let our_host = registration.hostname.to_ascii_lowercase();
    if our_host <= their_host.to_ascii_lowercase() {
        log::debug!(
            "instance name claimed by {:?} as well; they are expected to rename",
            their_host
        );
        return;
    }

    let old_name = registration.local.service_name().to_owned();
    let old_fullname = registration.fullname.clone();
    let new_name = next_service_name(&old_name);
    log::warn!(
        "service name collision on {:?} with {:?}; renaming to {:?}",
        old_name,
        their_host,
        new_name
    );

    match daemon.unregister(&old_fullname) {
        Ok(rx) => {
            let _ = rx.recv_timeout(Duration::from_millis(500));
        }
        Err(e) => log::debug!("failed to withdraw {:?}: {}", old_fullname, e),
    }
    registration.local.set_service_name(new_name.clone());
    match service_info(service_type, &registration.local, &registration.hostname) {
        Ok(info) => {
            registration.fullname = info.get_fullname().to_string();
            if let Err(e) = daemon.register(info) {
                log::error!("failed to re-register as {:?}: {}", new_name, e);
            }
        }
        Err(e) => log::error!("failed to build renamed service info: {}", e),
    }
    drop(registration);

    // The mDNS cache may keep ghost entries for the name we just gave up;
    // trigger verification so they are evicted instead of resolving to us.
    if let Err(e) = daemon.verify(old_fullname.clone(), Duration::from_secs(3)) {
        log::debug!("failed to verify stale records for {:?}: {}", old_fullname, e);
    }

    let _ = tx.send(DiscoveryEvent::NameChanged {
        old: old_name,
        new: new_name,
    });
}

fn service_info(
    service_type: &str,
    presence: &LlPresence,
    hostname: &str,
) -> Result<ServiceInfo, Error> {
    let info = ServiceInfo::new(
        service_type,
        presence.service_name(),
        hostname,
        "",
        presence.port(),
        presence.to_txt().to_properties(),
    )?
    .enable_addr_auto();
    Ok(info)
}

fn presence_from_info(instance: String, info: &ServiceInfo) -> Result<LlPresence, Error> {
    let txt = TxtRecords::from_txt_properties(info.get_properties())?;
    let mut presence = LlPresence::new(instance);
    presence.set_host(info.get_hostname());
    presence.set_port(info.get_port());
    let mut addresses: Vec<IpAddr> = info
        .get_addresses()
        .iter()
        .copied()
        .filter(|addr| !is_ipv6_link_local(addr))
        .collect();
    // Prefer IPv4: IPv6 link-local scopes need zone ids std::net cannot
    // express.
    addresses.sort_by_key(|addr| !addr.is_ipv4());
    presence.set_addresses(addresses);
    presence.apply_txt(txt);
    Ok(presence)
}

fn instance_name<'x>(fullname: &'x str, service_type: &str) -> Option<&'x str> {
    fullname
        .strip_suffix(service_type)?
        .strip_suffix('.')
}

/// The next candidate label after a collision.
///
/// Renamed labels must stay valid JIDs because they travel in stanza
/// addressing, so the counter goes into the user part: `alice@host` becomes
/// `alice-2@host`, then `alice-3@host`.
pub(crate) fn next_service_name(name: &str) -> String {
    let (user, host) = match name.split_once('@') {
        Some((user, host)) => (user, Some(host)),
        None => (name, None),
    };
    let (stem, count) = match user
        .rsplit_once('-')
        .and_then(|(stem, n)| n.parse::<u32>().ok().map(|n| (stem, n)))
    {
        Some((stem, n)) => (stem, n + 1),
        None => (user, 2),
    };
    match host {
        Some(host) => format!("{}-{}@{}", stem, count, host),
        None => format!("{}-{}", stem, count),
    }
}

fn default_hostname() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "linklocal".to_owned());
    format!("{}.local.", host)
}

/// IPv6 link-local addresses (fe80::/10) need a zone id `std::net` cannot
/// carry, so they always fail to connect.
fn is_ipv6_link_local(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
        IpAddr::V4(_) => false,
    }
}
