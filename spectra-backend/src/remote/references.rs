//! Local extraction of candidate references from message text
//!
//! Only candidates found here are sent to the remote service for
//! resolution; a sample without any candidate costs no resolve call.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

use super::RemoteItem;

/// Link paths that are never entity handles
const RESERVED_PATHS: &[&str] = &["c", "s", "addstickers", "addemoji", "share", "proxy", "socks", "iv", "login"];

fn mention_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?:^|[^\w@/])@([A-Za-z][A-Za-z0-9_]{4,31})\b").expect("valid mention pattern")
    })
}

fn link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(?:https?://)?(?:www\.)?(?:t|telegram)\.me/(?:s/)?(joinchat/|\+)?([A-Za-z0-9_-]+)")
            .expect("valid link pattern")
    })
}

/// Candidate handles in `text`, in order of first appearance.
/// Usernames are lowercased; invite hashes keep their case and a `+` prefix.
#[cfg(test)]
pub fn extract_candidates(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();
    collect(text, &mut seen, &mut found);
    found
}

/// Candidates across a content sample
pub fn extract_from_items(items: &[RemoteItem]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();
    for text in items.iter().filter_map(|item| item.text.as_deref()) {
        collect(text, &mut seen, &mut found);
    }
    found
}

fn collect(text: &str, seen: &mut HashSet<String>, found: &mut Vec<String>) {
    for caps in link_pattern().captures_iter(text) {
        let candidate = match (caps.get(1), caps.get(2)) {
            (Some(_), Some(hash)) => format!("+{}", hash.as_str()),
            (None, Some(name)) => {
                let name = name.as_str().to_lowercase();
                if RESERVED_PATHS.contains(&name.as_str()) || name.len() < 5 {
                    continue;
                }
                name
            }
            _ => continue,
        };
        if seen.insert(candidate.clone()) {
            found.push(candidate);
        }
    }

    for caps in mention_pattern().captures_iter(text) {
        if let Some(name) = caps.get(1) {
            let candidate = name.as_str().to_lowercase();
            if seen.insert(candidate.clone()) {
                found.push(candidate);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_mentions_and_links() {
        let text = "join @SomeChannel and https://t.me/other_group or t.me/joinchat/AbC123xyz, also t.me/+Zq9_kk";
        assert_eq!(
            extract_candidates(text),
            vec!["other_group", "+AbC123xyz", "+Zq9_kk", "somechannel"]
        );
    }

    #[test]
    fn skips_short_names_emails_and_reserved_paths() {
        let text = "mail me at person@example_domain.org, see @abc and t.me/c/12345/6 or t.me/share/url";
        assert!(extract_candidates(text).is_empty());
    }

    #[test]
    fn dedups_across_items() {
        use chrono::Utc;
        let item = |id, text: &str| RemoteItem {
            id,
            date: Utc::now(),
            edit_date: None,
            text: Some(text.to_string()),
            sender: None,
            media: None,
            reply_to: None,
        };
        let items = vec![item(1, "@alpha_chat"), item(2, "again @Alpha_Chat and t.me/alpha_chat"), item(3, "")];
        assert_eq!(extract_from_items(&items), vec!["alpha_chat"]);
    }
}
