use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Number of leading content characters folded into a fallback id.
pub const CONTENT_PREFIX_CHARS: usize = 100;

/// One post in the feed as extracted by the driver. Produced fresh on every
/// extraction; only `id` is carried across extractions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    pub author: String,
    pub content: String,
    pub link: Option<String>,
    pub feed_position: usize,
}

impl ContentItem {
    pub fn new(
        author: impl Into<String>,
        content: impl Into<String>,
        link: Option<String>,
        feed_position: usize,
    ) -> Self {
        let author = author.into();
        let content = content.into();
        let id = compute_item_id(link.as_deref(), &author, &content);
        Self {
            id,
            author,
            content,
            link,
            feed_position,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTarget {
    pub id: String,
    pub author: String,
    pub content: String,
}

pub fn compute_item_id(link: Option<&str>, author: &str, content: &str) -> String {
    if let Some(canonical) = link.and_then(canonical_link) {
        return format!("link:{canonical}");
    }
    format!("hash:{}", content_fingerprint(author, content))
}

/// Canonical form of a post link, or `None` when nothing usable remains.
/// Query string and fragment never contribute to identity.
pub fn canonical_link(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(mut parsed) = Url::parse(trimmed) {
        if parsed.cannot_be_a_base() {
            return None;
        }
        parsed.set_query(None);
        parsed.set_fragment(None);
        let mut host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
        if let Some(port) = parsed.port() {
            host.push_str(&format!(":{port}"));
        }
        let path = parsed.path().trim_end_matches('/');
        return Some(format!("{}://{host}{path}", parsed.scheme()));
    }

    let without_fragment = trimmed.split('#').next().unwrap_or_default();
    let without_query = without_fragment.split('?').next().unwrap_or_default();
    let path = without_query.trim_end_matches('/');
    if path.is_empty() {
        return None;
    }
    Some(path.to_string())
}

pub fn content_fingerprint(author: &str, content: &str) -> String {
    let prefix = normalize_text(content)
        .chars()
        .take(CONTENT_PREFIX_CHARS)
        .collect::<String>();
    let mut digest = Sha256::new();
    digest.update(normalize_text(author).as_bytes());
    digest.update(b"\n");
    digest.update(prefix.as_bytes());
    let bytes = digest.finalize();
    let mut out = String::with_capacity(32);
    for byte in bytes.iter().take(16) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub fn normalize_text(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::{canonical_link, compute_item_id, normalize_text, ContentItem};

    #[test]
    fn normalization_contract_is_stable() {
        assert_eq!(normalize_text("  Hello   World \n"), "hello world");
        assert_eq!(normalize_text("\tA\tB"), "a b");
    }

    #[test]
    fn link_ids_ignore_query_fragment_case_and_trailing_slash() {
        let a = compute_item_id(Some("https://Social.Example/user/status/42/?s=20#top"), "x", "y");
        let b = compute_item_id(Some("https://social.example/user/status/42"), "other", "text");
        assert_eq!(a, b);
        assert_eq!(a, "link:https://social.example/user/status/42");
    }

    #[test]
    fn relative_links_are_canonicalized_without_parsing() {
        assert_eq!(
            canonical_link("/user/status/42/?ref=home"),
            Some("/user/status/42".to_string())
        );
        assert_eq!(canonical_link("   "), None);
        assert_eq!(canonical_link("?only=query"), None);
    }

    #[test]
    fn fallback_hash_is_stable_across_whitespace_and_long_tails() {
        let head = "word ".repeat(20);
        let a = compute_item_id(None, "Alice", &format!("{head} tail one"));
        let b = compute_item_id(None, " alice ", &format!("{}   tail two", head.trim()));
        assert_eq!(a, b);
        assert!(a.starts_with("hash:"));
        assert_eq!(a.len(), "hash:".len() + 32);
    }

    #[test]
    fn fallback_hash_distinguishes_authors() {
        let a = compute_item_id(None, "alice", "same words");
        let b = compute_item_id(None, "bob", "same words");
        assert_ne!(a, b);
    }

    #[test]
    fn feed_position_does_not_affect_identity() {
        let first = ContentItem::new("alice", "post", None, 0);
        let again = ContentItem::new("alice", "post", None, 7);
        assert_eq!(first.id, again.id);
    }
}
