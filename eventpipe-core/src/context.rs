// SPDX-License-Identifier: MIT OR Apache-2.0

//! Free-form key/value map threaded between stages and across retries.
use std::collections::BTreeMap;
use std::collections::btree_map::Iter;

use ciborium::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Processing context of a pending event.
///
/// The pipeline never interprets the contents of this map. Stages use it to record their own
/// progress (for example "which stage last succeeded for this event"), since every retry starts
/// again at the first stage of the chain.
///
/// Values are stored as generic CBOR values, which keeps the map self-describing and makes an
/// in-memory context indistinguishable from one which was read back from disk.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessingContext(BTreeMap<String, Value>);

impl ProcessingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize and insert a value under the given key, returning `true` if it replaced an
    /// existing value.
    pub fn insert<T>(&mut self, key: impl Into<String>, value: &T) -> Result<bool, ContextError>
    where
        T: Serialize + ?Sized,
    {
        let key = key.into();
        let value =
            Value::serialized(value).map_err(|err| ContextError::Serialize(key.clone(), err))?;
        Ok(self.0.insert(key, value).is_some())
    }

    /// Look up and deserialize the value stored under the given key.
    pub fn get<T>(&self, key: &str) -> Result<Option<T>, ContextError>
    where
        T: DeserializeOwned,
    {
        match self.0.get(key) {
            Some(value) => value
                .deserialized()
                .map(Some)
                .map_err(|err| ContextError::Deserialize(key.to_string(), err)),
            None => Ok(None),
        }
    }

    /// Raw CBOR value stored under the given key.
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, String, Value> {
        self.0.iter()
    }
}

impl From<BTreeMap<String, Value>> for ProcessingContext {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Self(value)
    }
}

impl From<ProcessingContext> for BTreeMap<String, Value> {
    fn from(value: ProcessingContext) -> Self {
        value.0
    }
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("could not serialize context value '{0}': {1}")]
    Serialize(String, ciborium::value::Error),

    #[error("could not deserialize context value '{0}': {1}")]
    Deserialize(String, ciborium::value::Error),
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use crate::cbor::{decode_cbor, encode_cbor};

    use super::ProcessingContext;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Progress {
        stage: String,
        attempts: u32,
    }

    #[test]
    fn typed_values() {
        let mut context = ProcessingContext::new();
        assert!(!context.insert("attempts", &3u32).unwrap());
        assert!(context.insert("attempts", &4u32).unwrap());
        context
            .insert(
                "progress",
                &Progress {
                    stage: "enrich".into(),
                    attempts: 2,
                },
            )
            .unwrap();

        assert_eq!(context.get::<u32>("attempts").unwrap(), Some(4));
        assert_eq!(
            context.get::<Progress>("progress").unwrap(),
            Some(Progress {
                stage: "enrich".into(),
                attempts: 2,
            })
        );
        assert_eq!(context.get::<u32>("missing").unwrap(), None);

        // Asking for the wrong type is an error, not a silent `None`.
        assert!(context.get::<String>("attempts").is_err());
    }

    #[test]
    fn survives_cbor() {
        let mut context = ProcessingContext::new();
        context.insert("done", &vec!["a", "b"]).unwrap();
        context.insert("ratio", &0.5f64).unwrap();
        context.insert("flag", &true).unwrap();

        let bytes = encode_cbor(&context).unwrap();
        let context_again: ProcessingContext = decode_cbor(&bytes[..]).unwrap();
        assert_eq!(context, context_again);
        assert_eq!(
            context_again.get::<Vec<String>>("done").unwrap(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }
}
