//! RSS/Atom normalization on top of `feed-rs`.
//!
//! Both feed formats collapse into one shape: feed-level metadata plus an
//! entry list in feed-native order. Entries without a usable feed-supplied
//! identifier get a derived one so the seen-entry cursor always has a key.
use anyhow::Result;
use feed_rs::parser;
use sha2::{Digest, Sha256};

/// Feed-level metadata plus the entry list from one fetch.
///
/// Order of `entries` is whatever the feed served; callers must not assume
/// it is stable across fetches.
#[derive(Debug, Clone)]
pub struct FetchedFeed {
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub link: Option<String>,
    pub entries: Vec<FetchedEntry>,
}

/// One normalized entry from a fetch. Ephemeral — only `id` outlives the
/// fetch, via the cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedEntry {
    /// Feed-supplied id/guid, or a derived sha256 when the feed omits one.
    pub id: String,
    pub title: String,
    pub summary: Option<String>,
    pub link: Option<String>,
    /// Unix seconds; `published` falling back to `updated`.
    pub published: Option<i64>,
}

/// Parse raw feed bytes into a [`FetchedFeed`].
///
/// Accepts both RSS and Atom. Fails only when the body is not a feed at
/// all; individual entries missing fields are normalized, not dropped.
pub fn parse_feed(bytes: &[u8]) -> Result<FetchedFeed> {
    let parsed = parser::parse(bytes)?;

    let title = parsed.title.map(|t| t.content);
    let subtitle = parsed.description.map(|d| d.content);
    let link = parsed.links.first().map(|l| l.href.clone());

    let entries = parsed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry.links.first().map(|l| l.href.clone());
            let published = entry.published.or(entry.updated).map(|dt| dt.timestamp());
            let summary = entry
                .summary
                .map(|s| s.content)
                .or_else(|| entry.content.and_then(|c| c.body));
            let title = entry
                .title
                .map(|t| t.content)
                .unwrap_or_else(|| "Untitled".to_string());

            let existing_id = if entry.id.is_empty() {
                None
            } else {
                Some(entry.id.as_str())
            };
            let id = entry_id(existing_id, link.as_deref(), &title, published);

            FetchedEntry {
                id,
                title,
                summary,
                link,
                published,
            }
        })
        .collect();

    Ok(FetchedFeed {
        title,
        subtitle,
        link,
        entries,
    })
}

/// Resolve an entry identifier: feed-supplied when present and non-blank,
/// otherwise a sha256 over link, title, and date.
fn entry_id(
    existing: Option<&str>,
    link: Option<&str>,
    title: &str,
    published: Option<i64>,
) -> String {
    if let Some(id) = existing {
        let trimmed = id.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!(
        "{}|{}|{}",
        link.unwrap_or(""),
        title,
        published.map(|p| p.to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}
