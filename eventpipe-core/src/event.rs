// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Timestamp;
use crate::serde::{deserialize_hex, serialize_hex};

/// Domain event as it was fetched from upstream.
///
/// Events are immutable once fetched. The `uid` is expected to be globally unique and serves as
/// the key of the event within a source's pending items.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier of the event.
    pub uid: String,

    /// Type of the event (for example "payment.settled").
    #[serde(rename = "type")]
    pub event_type: String,

    /// Opaque payload, the pipeline never decodes it.
    #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_hex")]
    pub payload: Vec<u8>,

    /// Free-form metadata attached by upstream.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    pub domain: String,

    pub address: String,

    /// Time the event was emitted upstream (unix milliseconds).
    pub timestamp: Timestamp,
}

impl Event {
    pub fn new(uid: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            event_type: event_type.into(),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }
}
