//! Store key derivation.

use crate::config::WindowConfig;

/// Derives the two store keys used for one logical key.
///
/// The namespace prefix is applied exactly once to each key:
///
/// - event buffer: `<prefix>:<key>`
/// - block marker: `<prefix>:block:<key>`
///
/// With hash tags enabled the logical key is wrapped in braces
/// (`<prefix>:{<key>}`) so both keys hash to the same Redis Cluster slot and
/// can be touched by a single script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
    hash_tag: bool,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>, hash_tag: bool) -> Self {
        Self {
            prefix: prefix.into(),
            hash_tag,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Key of the event-time buffer.
    pub fn events(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, self.tagged(key))
    }

    /// Key of the block marker.
    pub fn marker(&self, key: &str) -> String {
        format!("{}:block:{}", self.prefix, self.tagged(key))
    }

    fn tagged(&self, key: &str) -> String {
        if self.hash_tag {
            format!("{{{}}}", key)
        } else {
            key.to_string()
        }
    }
}

impl From<&WindowConfig> for KeySpace {
    fn from(config: &WindowConfig) -> Self {
        Self::new(config.prefix.clone(), config.hash_tag)
    }
}
