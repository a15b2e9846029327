//! Test specification grammar.
//!
//! A spec names what to run: `Package`, `Package.Class` or
//! `Package.Class:Method`. Callers may or may not send the leading `:`
//! marker the host's test manager expects; [`normalize`] is the single
//! place that adds it, and it is idempotent.
//!
//! Qualifiers are the `/flag/noflag` strings passed alongside a spec.

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Marker prefixed to every normalized spec.
pub const SPEC_MARKER: char = ':';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("test spec is empty")]
    Empty,
    #[error("invalid name segment `{segment}` in test spec `{spec}`")]
    InvalidSegment { spec: String, segment: String },
    #[error("invalid method name `{method}` in test spec `{spec}`")]
    InvalidMethod { spec: String, method: String },
    #[error("invalid qualifiers `{0}`: expected `/flag` tokens")]
    InvalidQualifiers(String),
}

/// Canonical form of a raw spec string: surrounding whitespace removed and
/// exactly the caller's leading marker kept, or one added.
pub fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with(SPEC_MARKER) {
        trimmed.to_string()
    } else {
        format!("{}{}", SPEC_MARKER, trimmed)
    }
}

/// A parsed spec. `target` is either a package or a class; only the host
/// can tell which, so the manager resolves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestSpec {
    pub target: String,
    pub method: Option<String>,
}

impl TestSpec {
    pub fn parse(raw: &str) -> Result<Self, SpecError> {
        let normalized = normalize(raw);
        let body = &normalized[SPEC_MARKER.len_utf8()..];
        if body.is_empty() {
            return Err(SpecError::Empty);
        }

        let (target, method) = match body.split_once(SPEC_MARKER) {
            Some((target, method)) => (target, Some(method)),
            None => (body, None),
        };

        for segment in target.split('.') {
            if !is_identifier(segment) {
                return Err(SpecError::InvalidSegment {
                    spec: normalized.clone(),
                    segment: segment.to_string(),
                });
            }
        }

        if let Some(method) = method {
            if !is_identifier(method) {
                return Err(SpecError::InvalidMethod {
                    spec: normalized.clone(),
                    method: method.to_string(),
                });
            }
            // A method needs a class, and a class lives in a package.
            if !target.contains('.') {
                return Err(SpecError::InvalidSegment {
                    spec: normalized.clone(),
                    segment: target.to_string(),
                });
            }
        }

        Ok(Self {
            target: target.to_string(),
            method: method.map(str::to_string),
        })
    }

    /// Package part of the target when it is read as `Package.Class`.
    pub fn parent_package(&self) -> Option<&str> {
        self.target.rsplit_once('.').map(|(pkg, _)| pkg)
    }
}

impl fmt::Display for TestSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", SPEC_MARKER, self.target)?;
        if let Some(method) = &self.method {
            write!(f, "{}{}", SPEC_MARKER, method)?;
        }
        Ok(())
    }
}

fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() || c == '_' || c == '%' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parsed `/flag/noflag` qualifier string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Qualifiers {
    flags: BTreeMap<String, bool>,
}

impl Qualifiers {
    pub fn parse(raw: &str) -> Result<Self, SpecError> {
        let raw = raw.trim();
        let mut flags = BTreeMap::new();
        if raw.is_empty() {
            return Ok(Self { flags });
        }

        let rest = raw
            .strip_prefix('/')
            .ok_or_else(|| SpecError::InvalidQualifiers(raw.to_string()))?;

        for token in rest.split('/') {
            if token.is_empty() || !token.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(SpecError::InvalidQualifiers(raw.to_string()));
            }
            let token = token.to_ascii_lowercase();
            match token.strip_prefix("no") {
                Some(flag) if !flag.is_empty() => flags.insert(flag.to_string(), false),
                _ => flags.insert(token, true),
            };
        }

        Ok(Self { flags })
    }

    pub fn is_enabled(&self, flag: &str, default: bool) -> bool {
        self.flags.get(flag).copied().unwrap_or(default)
    }

    pub fn recursive(&self) -> bool {
        self.is_enabled("recursive", true)
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

impl fmt::Display for Qualifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (flag, enabled) in &self.flags {
            if *enabled {
                write!(f, "/{}", flag)?;
            } else {
                write!(f, "/no{}", flag)?;
            }
        }
        Ok(())
    }
}
