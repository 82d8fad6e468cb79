//! URI pattern parsing and matching.
//!
//! Registered routers use exact paths (`/chat`); dynamic registries use
//! patterns with variable segments (`/room/{groupId}`). Matching happens
//! once per upgrade, so the representation favors clarity over speed:
//! patterns are pre-split into literal and parameter segments.

use crate::error::{Result, RiptideError};
use std::collections::HashMap;

/// Reserved path variable appended to every dynamic registration.
pub const GROUP_ID_PARA: &str = "groupId";

/// Optional query parameter overriding the shard pick on router entry.
pub const BUCKET_ID_PARA: &str = "bucketId";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A parsed URI pattern, e.g. `/room/{groupId}`.
#[derive(Debug, Clone)]
pub struct UriPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl UriPattern {
    /// Parse a pattern. Must start with `/`; `{name}` segments capture the
    /// corresponding path segment under `name`.
    pub fn parse(pattern: &str) -> Result<Self> {
        if !pattern.starts_with('/') || pattern.len() < 2 {
            return Err(RiptideError::InvalidParameter(
                "uri pattern must start with '/' and be non-empty",
            ));
        }

        let mut segments = Vec::new();
        for seg in pattern.trim_matches('/').split('/') {
            if seg.is_empty() {
                return Err(RiptideError::InvalidParameter(
                    "uri pattern has an empty segment",
                ));
            }
            if let Some(name) = seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                if name.is_empty() {
                    return Err(RiptideError::InvalidParameter(
                        "uri pattern has an unnamed parameter",
                    ));
                }
                segments.push(Segment::Param(name.to_owned()));
            } else {
                segments.push(Segment::Literal(seg.to_owned()));
            }
        }

        Ok(Self {
            raw: pattern.to_owned(),
            segments,
        })
    }

    /// The pattern as registered.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Match a concrete request path, returning captured path variables.
    #[must_use]
    pub fn match_path(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut paras = HashMap::new();
        for (seg, part) in self.segments.iter().zip(parts) {
            match seg {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    if part.is_empty() {
                        return None;
                    }
                    paras.insert(name.clone(), part.to_owned());
                }
            }
        }
        Some(paras)
    }
}

/// Parse a query string (`a=1&b=two`) into a map. Later keys win; keys
/// without `=` map to the empty string. No percent-decoding: riptide hands
/// values to the host as they appear on the request line.
#[must_use]
pub fn parse_query(query: &str) -> HashMap<String, String> {
    let mut paras = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((k, v)) => paras.insert(k.to_owned(), v.to_owned()),
            None => paras.insert(pair.to_owned(), String::new()),
        };
    }
    paras
}
