//! URI template compilation and path matching.
//!
//! Templates are ordered segment sequences: `/chat/{room}` has a literal
//! segment and a variable segment.  Matching is whole-path: a request path
//! with a different segment count never matches.  Variable segments capture
//! the request segment verbatim; any percent decoding is the handshake
//! collaborator's job.

use std::collections::HashMap;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(String),
}

/// A compiled path pattern with `{name}` placeholders.
#[derive(Debug, Clone)]
pub struct UriTemplate {
    path: String,
    segments: Vec<Segment>,
}

impl UriTemplate {
    /// Compile a pattern.  A missing leading `/` is normalized to present;
    /// duplicate variable names are rejected.
    pub fn parse(pattern: &str) -> Result<Self, ConfigError> {
        let path = if pattern.starts_with('/') {
            pattern.to_owned()
        } else {
            format!("/{pattern}")
        };

        let mut segments = Vec::new();
        let mut seen = HashMap::new();
        for part in path.split('/').skip(1) {
            if part.len() > 2 && part.starts_with('{') && part.ends_with('}') {
                let name = part[1..part.len() - 1].to_owned();
                if seen.insert(name.clone(), ()).is_some() {
                    return Err(ConfigError::DuplicatePathVariable(name));
                }
                segments.push(Segment::Variable(name));
            } else {
                segments.push(Segment::Literal(part.to_owned()));
            }
        }
        Ok(UriTemplate { path, segments })
    }

    /// The normalized pattern this template was compiled from.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Key for duplicate-endpoint detection: variable names do not
    /// distinguish templates, their positions do.
    pub(crate) fn normalized_key(&self) -> String {
        let mut key = String::new();
        for segment in &self.segments {
            key.push('/');
            match segment {
                Segment::Literal(text) => key.push_str(text),
                Segment::Variable(_) => key.push_str("{}"),
            }
        }
        key
    }

    /// Whether the template declares a variable with this name.
    pub fn has_variable(&self, name: &str) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Variable(v) if v == name))
    }

    /// Match a concrete request path, yielding captured path parameters.
    pub fn matches(&self, path: &str) -> Option<PathParams> {
        let normalized;
        let path = if path.starts_with('/') {
            path
        } else {
            normalized = format!("/{path}");
            &normalized
        };

        let parts: Vec<&str> = path.split('/').skip(1).collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut captured = HashMap::new();
        for (segment, part) in self.segments.iter().zip(&parts) {
            match segment {
                Segment::Literal(text) => {
                    if text != part {
                        return None;
                    }
                }
                Segment::Variable(name) => {
                    captured.insert(name.clone(), (*part).to_owned());
                }
            }
        }
        Some(PathParams { values: captured })
    }
}

/// Immutable variable-name → matched-substring mapping, captured once per
/// connection at handshake time.
#[derive(Debug, Clone, Default)]
pub struct PathParams {
    values: HashMap<String, String>,
}

impl PathParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
