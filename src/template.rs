//! Notification templates.
//!
//! A template is plain text with `$name` (or `${name}`) variables, rendered
//! with entry and feed fields in a single pass. Values substituted in are
//! never rescanned, so feed-controlled text cannot smuggle further tokens
//! in. Unrecognized tokens stay verbatim; `$$` escapes a literal `$`.
use chrono::{TimeZone, Utc};

use crate::feed::FetchedEntry;

/// Names a template may reference and their values for one delivery.
///
/// Feed fields the source never supplied render as the empty string.
#[derive(Debug, Clone, Default)]
pub struct Bindings<'a> {
    pub feed_url: &'a str,
    pub feed_link: &'a str,
    pub feed_title: &'a str,
    pub feed_subtitle: &'a str,
    pub id: &'a str,
    pub date: String,
    pub title: &'a str,
    pub summary: &'a str,
    pub link: &'a str,
}

impl<'a> Bindings<'a> {
    /// Bindings for one entry of one feed. `feed_*` values come from the
    /// subscribe-time feed record.
    pub fn for_entry(
        feed_url: &'a str,
        feed_title: &'a str,
        feed_subtitle: &'a str,
        feed_link: &'a str,
        entry: &'a FetchedEntry,
    ) -> Self {
        Self {
            feed_url,
            feed_link,
            feed_title,
            feed_subtitle,
            id: &entry.id,
            date: format_date(entry.published),
            title: &entry.title,
            summary: entry.summary.as_deref().unwrap_or(""),
            link: entry.link.as_deref().unwrap_or(""),
        }
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        match name {
            "feed_url" => Some(self.feed_url),
            "feed_link" => Some(self.feed_link),
            "feed_title" => Some(self.feed_title),
            "feed_subtitle" => Some(self.feed_subtitle),
            "id" => Some(self.id),
            "date" => Some(&self.date),
            "title" => Some(self.title),
            "summary" => Some(self.summary),
            "link" => Some(self.link),
            _ => None,
        }
    }
}

fn format_date(published: Option<i64>) -> String {
    published
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_default()
}

/// Render a template against a set of bindings.
///
/// One pass, left to right:
/// - `$$` → `$`
/// - `$name` / `${name}` with a known name → its value
/// - anything else (unknown name, unterminated brace, bare `$`) → verbatim
pub fn render(template: &str, bindings: &Bindings<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + 1..];

        if let Some(tail) = rest.strip_prefix('$') {
            out.push('$');
            rest = tail;
            continue;
        }

        if let Some(tail) = rest.strip_prefix('{') {
            match tail.find('}') {
                Some(end) if is_identifier(&tail[..end]) => {
                    match bindings.lookup(&tail[..end]) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push_str("${");
                            out.push_str(&tail[..end]);
                            out.push('}');
                        }
                    }
                    rest = &tail[end + 1..];
                }
                _ => {
                    // Unterminated or malformed brace form stays verbatim
                    out.push('$');
                }
            }
            continue;
        }

        let end = identifier_len(rest);
        if end == 0 {
            out.push('$');
            continue;
        }

        match bindings.lookup(&rest[..end]) {
            Some(value) => out.push_str(value),
            None => {
                out.push('$');
                out.push_str(&rest[..end]);
            }
        }
        rest = &rest[end..];
    }

    out.push_str(rest);
    out
}

fn identifier_len(s: &str) -> usize {
    let mut chars = s.char_indices();
    match chars.next() {
        Some((_, c)) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return 0,
    }
    for (idx, c) in chars {
        if !(c.is_ascii_alphanumeric() || c == '_') {
            return idx;
        }
    }
    s.len()
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && identifier_len(s) == s.len()
}
