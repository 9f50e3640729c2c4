//! `Upload-Metadata` key/value pairs.
//!
//! On the wire the metadata is a comma-separated list of `key base64value`
//! pairs, where the value may be omitted. Keys are unique ASCII tokens
//! without spaces or commas.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Client-supplied metadata attached to an upload at creation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadMetadata(BTreeMap<String, Option<String>>);

impl UploadMetadata {
    /// Empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an `Upload-Metadata` header value.
    pub fn parse(header: &str) -> crate::Result<Self> {
        let mut entries = BTreeMap::new();

        for pair in header.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }

            let mut parts = pair.split(' ').filter(|p| !p.is_empty());
            let key = parts.next().unwrap_or_default();
            let value = parts.next();
            if parts.next().is_some() {
                return Err(crate::Error::InvalidMetadata(format!(
                    "too many tokens in pair: {pair}"
                )));
            }
            if !key.is_ascii() || key.chars().any(|c| c.is_ascii_control()) {
                return Err(crate::Error::InvalidMetadata(format!("invalid key: {key}")));
            }

            let value = match value {
                Some(encoded) => {
                    let bytes = STANDARD.decode(encoded).map_err(|e| {
                        crate::Error::InvalidMetadata(format!("value for {key} is not base64: {e}"))
                    })?;
                    let text = String::from_utf8(bytes).map_err(|_| {
                        crate::Error::InvalidMetadata(format!("value for {key} is not UTF-8"))
                    })?;
                    Some(text)
                }
                None => None,
            };

            if entries.insert(key.to_string(), value).is_some() {
                return Err(crate::Error::InvalidMetadata(format!("duplicate key: {key}")));
            }
        }

        Ok(Self(entries))
    }

    /// Encode back into the header form. Keys come out sorted.
    pub fn to_header(&self) -> String {
        self.0
            .iter()
            .map(|(key, value)| match value {
                Some(v) => format!("{key} {}", STANDARD.encode(v)),
                None => key.clone(),
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Look up a value. Returns `None` for missing keys and for keys without a value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_deref())
    }

    /// Check if a key is present, with or without a value.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Insert a key/value pair.
    pub fn insert(&mut self, key: impl Into<String>, value: Option<String>) {
        self.0.insert(key.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }
}
