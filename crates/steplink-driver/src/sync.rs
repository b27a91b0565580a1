use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::error::{DriverError, Result};

/// Device status event carried by `SYN:NA` broadcasts.
///
/// Wire text is `<type> key=value key=value ...`; values may themselves
/// contain `=`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub entries: BTreeMap<String, String>,
}

impl SyncMessage {
    pub fn parse(text: &str) -> Result<Self> {
        let mut parts = text.trim().split(' ');
        let kind = match parts.next() {
            Some(kind) if !kind.is_empty() => kind.to_string(),
            _ => return Err(DriverError::InvalidSync(text.to_string())),
        };
        let mut entries = BTreeMap::new();
        for entry in parts {
            let (key, value) = entry.split_once('=').unwrap_or((entry, ""));
            if key.is_empty() {
                tracing::warn!(entry, "invalid sync entry");
                continue;
            }
            entries.insert(key.to_string(), value.to_string());
        }
        Ok(Self { kind, entries })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }
}

impl fmt::Display for SyncMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.kind)?;
        for (key, value) in &self.entries {
            write!(f, " {key}={value}")?;
        }
        Ok(())
    }
}
