//! Event-name pattern matching.
//!
//! The pattern language is deliberately small and total:
//!
//! 1. A literal name matches only itself.
//! 2. A trailing `*` matches any name starting with the characters before it
//!    (`agent:*` matches `agent:spawn`).
//! 3. A bare `*` matches every name.
//!
//! Wildcard patterns are compiled once at subscription time; literal patterns
//! are matched by map lookup in the dispatcher and never compiled.

use globset::{Glob, GlobMatcher};

use crate::error::KsiError;

/// A compiled subscription pattern.
#[derive(Debug, Clone)]
pub enum EventPattern {
    /// Exact event name.
    Literal(String),
    /// Prefix glob ending in `*` (a bare `*` has an empty prefix).
    Wildcard { raw: String, matcher: GlobMatcher },
}

impl EventPattern {
    /// Parse and compile a pattern string.
    ///
    /// A `*` is only meaningful as the final character; any other placement
    /// is rejected so that subscriptions stay unambiguous.
    pub fn parse(raw: &str) -> Result<Self, KsiError> {
        if raw.is_empty() {
            return Err(KsiError::bad_request("empty event pattern"));
        }
        match raw.find('*') {
            None => Ok(Self::Literal(raw.to_string())),
            Some(pos) if pos == raw.len() - 1 => {
                let prefix = &raw[..pos];
                // Escape the prefix so that only our trailing `*` is
                // interpreted by the glob engine.
                let glob = format!("{}*", globset::escape(prefix));
                let matcher = Glob::new(&glob)
                    .map_err(|e| KsiError::bad_request(format!("invalid pattern {raw:?}: {e}")))?
                    .compile_matcher();
                Ok(Self::Wildcard {
                    raw: raw.to_string(),
                    matcher,
                })
            }
            Some(_) => Err(KsiError::bad_request(format!(
                "pattern {raw:?}: '*' is only allowed as the final character"
            ))),
        }
    }

    /// Whether an event name matches this pattern.
    pub fn matches(&self, event: &str) -> bool {
        match self {
            Self::Literal(name) => name == event,
            Self::Wildcard { matcher, .. } => matcher.is_match(event),
        }
    }

    /// The original pattern string.
    pub fn raw(&self) -> &str {
        match self {
            Self::Literal(name) => name,
            Self::Wildcard { raw, .. } => raw,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }
}

/// Parse a list of pattern strings, as accepted by monitor queries and
/// subscription requests. An empty input matches nothing.
pub fn parse_patterns(raw: &[String]) -> Result<Vec<EventPattern>, KsiError> {
    raw.iter().map(|p| EventPattern::parse(p)).collect()
}

/// Whether any pattern in the set matches the event name.
pub fn any_match(patterns: &[EventPattern], event: &str) -> bool {
    patterns.iter().any(|p| p.matches(event))
}
