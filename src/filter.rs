//! Per-subscription title filters.
//!
//! A filter is a regular expression matched against an entry's full title
//! as an unanchored search. The dialect supports inline modifiers like
//! `(?i)` and negative lookahead, which is why this uses `fancy-regex`
//! rather than the linear-time `regex` crate.
//!
//! Compilation happens when a user sets the filter; a stored pattern has
//! always compiled successfully at least once.
use thiserror::Error;

/// A pattern the user supplied failed to compile.
#[derive(Debug, Error)]
#[error("Invalid filter pattern: {0}")]
pub struct FilterError(String);

/// A compiled title filter.
#[derive(Debug, Clone)]
pub struct EntryFilter {
    pattern: String,
    regex: fancy_regex::Regex,
}

impl EntryFilter {
    /// Compile a pattern, rejecting it before it can be stored anywhere.
    pub fn compile(pattern: &str) -> Result<Self, FilterError> {
        let regex = fancy_regex::Regex::new(pattern).map_err(|e| FilterError(e.to_string()))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// The source pattern, as the user wrote it.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Unanchored search against the full title.
    ///
    /// A runtime error (the backtracking limit) excludes the entry and
    /// logs a warning rather than failing the delivery pipeline.
    pub fn is_match(&self, title: &str) -> bool {
        match self.regex.is_match(title) {
            Ok(matched) => matched,
            Err(e) => {
                tracing::warn!(pattern = %self.pattern, error = %e, "Filter evaluation failed, excluding entry");
                false
            }
        }
    }
}

/// Evaluate an optional filter: absence means include everything.
pub fn includes(filter: Option<&EntryFilter>, title: &str) -> bool {
    filter.map_or(true, |f| f.is_match(title))
}
