//! Destination allow/deny policy.
//!
//! The server consults a [`Filter`] before issuing a sid and again before
//! dialing. [`GlobFilter`] matches `host:port` strings against glob
//! patterns: a deny match always wins, an empty allow list allows
//! everything else.

use std::fmt;

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::{Error, Result};

/// Decides whether a destination may be reached.
pub trait Filter: Send + Sync + fmt::Debug {
    /// True if `host:port` may be dialed.
    fn allows(&self, host: &str, port: u16) -> bool;
}

/// Glob-based [`Filter`] over `host:port`.
#[derive(Debug, Clone)]
pub struct GlobFilter {
    allow: GlobSet,
    allow_all: bool,
    deny: GlobSet,
}

impl GlobFilter {
    /// Compile the patterns.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] naming the first pattern that does not compile.
    pub fn new(allow: &[String], deny: &[String]) -> Result<Self> {
        Ok(Self {
            allow: build(allow)?,
            allow_all: allow.is_empty(),
            deny: build(deny)?,
        })
    }
}

fn build(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::Config(format!("bad destination pattern {pattern:?}: {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::Config(format!("destination patterns: {e}")))
}

impl Filter for GlobFilter {
    fn allows(&self, host: &str, port: u16) -> bool {
        let destination = format!("{host}:{port}");
        if self.deny.is_match(&destination) {
            return false;
        }
        self.allow_all || self.allow.is_match(&destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_style_allow_list() {
        let filter =
            GlobFilter::new(&patterns(&["localhost:22", "127.0.0.1:22"]), &[]).unwrap();
        assert!(filter.allows("localhost", 22));
        assert!(filter.allows("127.0.0.1", 22));
        assert!(!filter.allows("localhost", 2222));
        assert!(!filter.allows("example.com", 22));
    }

    #[test]
    fn test_wildcards() {
        let filter = GlobFilter::new(&patterns(&["*.internal:*", "db-?:5432"]), &[]).unwrap();
        assert!(filter.allows("build.internal", 8080));
        assert!(filter.allows("db-1", 5432));
        assert!(!filter.allows("db-10", 5432));
    }

    #[test]
    fn test_deny_wins() {
        let filter = GlobFilter::new(
            &patterns(&["*.internal:*"]),
            &patterns(&["vault.internal:*"]),
        )
        .unwrap();
        assert!(filter.allows("build.internal", 22));
        assert!(!filter.allows("vault.internal", 22));
    }

    #[test]
    fn test_empty_allow_means_everything_not_denied() {
        let filter = GlobFilter::new(&[], &patterns(&["*:25"])).unwrap();
        assert!(filter.allows("anything.example", 443));
        assert!(!filter.allows("mail.example", 25));
    }

    #[test]
    fn test_bad_pattern_is_config_error() {
        let err = GlobFilter::new(&patterns(&["[unclosed:22"]), &[]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
