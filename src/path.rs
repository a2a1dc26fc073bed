//! Segmented attribute paths.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Identifies one attribute of a run: an ordered, non-empty sequence of
/// string segments, rendered as `a/b/c`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributePath(Vec<String>);

impl AttributePath {
    pub fn new(segments: Vec<String>) -> Result<Self> {
        if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return Err(Error::InternalClient(
                "attribute path must contain at least one non-empty segment".into(),
            ));
        }
        Ok(AttributePath(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

impl FromStr for AttributePath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        AttributePath::new(s.split('/').map(str::to_owned).collect())
    }
}
