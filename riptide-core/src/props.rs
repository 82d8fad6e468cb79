//! Per-connection property bag.
//!
//! Hosts attach session state (user name, auth scopes, room role) to a
//! connector without owning a side table keyed by conn id. Values are a
//! small tagged variant; the bag is guarded by a reader-writer lock so
//! callbacks on different tasks can read while a handler writes.

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::RwLock;

/// Tagged property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
}

impl PropValue {
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for PropValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for PropValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for PropValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Bytes> for PropValue {
    fn from(v: Bytes) -> Self {
        Self::Bytes(v)
    }
}

/// Thread-safe string-keyed bag of [`PropValue`].
#[derive(Debug, Default)]
pub struct PropBag {
    inner: RwLock<HashMap<String, PropValue>>,
}

impl PropBag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a property. Returns a clone; values are small.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<PropValue> {
        self.inner.read().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<PropValue>) {
        self.inner.write().insert(key.into(), value.into());
    }

    /// Remove a property, returning the previous value if any.
    pub fn remove(&self, key: &str) -> Option<PropValue> {
        self.inner.write().remove(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
