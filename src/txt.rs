// Copyright (c) 2025 linklocal-xmpp contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! DNS TXT record data for link-local presence.
//!
//! The raw mDNS TXT payload is a concatenation of length-prefixed records:
//! one byte carrying the length `N`, followed by `N` bytes of UTF-8
//! `key=value` (or just `key`). [`TxtRecords`] keeps the records in their
//! original order so that a decoded payload re-encodes byte-identically.

use std::collections::HashMap;

use crate::error::ProtocolError;

/// Upper bound on a single `key=value` record, per the DNS TXT format.
pub const TXT_RECORD_LIMIT: usize = 255;

/// An ordered key/value view of a DNS-SD TXT payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxtRecords {
    entries: Vec<(String, String)>,
}

impl TxtRecords {
    /// Create an empty record set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set `key` to `value`, replacing an existing entry in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Remove `key`, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    /// Iterate over the records in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there are no records.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode into the raw length-prefixed TXT payload.
    ///
    /// Each record is emitted as `key=value` and truncated to
    /// [`TXT_RECORD_LIMIT`] bytes (on a character boundary, so the result
    /// stays valid UTF-8).
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (key, value) in &self.entries {
            let mut record = format!("{}={}", key, value);
            if record.len() > TXT_RECORD_LIMIT {
                let mut cut = TXT_RECORD_LIMIT;
                while !record.is_char_boundary(cut) {
                    cut -= 1;
                }
                record.truncate(cut);
            }
            out.push(record.len() as u8);
            out.extend_from_slice(record.as_bytes());
        }
        out
    }

    /// Decode a raw length-prefixed TXT payload.
    ///
    /// Records that are not valid UTF-8 are a hard failure: they mean the
    /// peer mis-encoded its presence. Records without a `=` are silently
    /// dropped, and a length prefix pointing past the end of the payload is
    /// rejected.
    pub fn from_payload(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut entries = Vec::new();
        let mut rest = data;
        while let Some((&len, tail)) = rest.split_first() {
            let len = len as usize;
            if len > tail.len() {
                return Err(ProtocolError::TxtTruncated);
            }
            let (record, tail) = tail.split_at(len);
            rest = tail;
            let record = core::str::from_utf8(record).map_err(|_| ProtocolError::InvalidTxtUtf8)?;
            match record.split_once('=') {
                Some((key, value)) => entries.push((key.to_owned(), value.to_owned())),
                None => log::debug!("dropping TXT record without value: {:?}", record),
            }
        }
        Ok(Self { entries })
    }

    /// Convert into the property map `mdns-sd` registers.
    pub(crate) fn to_properties(&self) -> HashMap<String, String> {
        self.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect()
    }

    /// Build from the properties of a resolved `mdns-sd` service.
    pub(crate) fn from_txt_properties(
        props: &mdns_sd::TxtProperties,
    ) -> Result<Self, ProtocolError> {
        let mut records = Self::new();
        for prop in props.iter() {
            let Some(val) = prop.val() else {
                log::debug!("dropping TXT record without value: {:?}", prop.key());
                continue;
            };
            let val = core::str::from_utf8(val).map_err(|_| ProtocolError::InvalidTxtUtf8)?;
            records.set(prop.key(), val);
        }
        Ok(records)
    }
}

impl FromIterator<(String, String)> for TxtRecords {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut records = Self::new();
        for (k, v) in iter {
            records.set(k, v);
        }
        records
    }
}
