//! External feed streaming parser (spec §4.E strategy 3, testable
//! property 8, scenario S6): incrementally parses a JSON feed of the
//! shape `{"items":[...]}`, yielding one object per matched item without
//! first materializing the whole structure.
//!
//! Grounded on `original_source/services/sniper/connectors/wechat.py`'s
//! streaming feed reader. Per SPEC_FULL.md §B.3 this utility is shared
//! rather than living inside one connector, and is wired into
//! [`crate::connectors::video_sharing`]'s `search_and_extract` (spec's
//! three-platform module boundary takes precedence over the source's
//! placement of this logic inside the messaging-article connector).

use serde_json::Value;

/// Walks `feed` character by character looking for the literal
/// `"items":[`, then extracts each top-level object in the array by
/// brace-depth counting with string-state tracking (so `{` inside a
/// quoted string, or an escaped `\"`, does not perturb the count).
/// Applies `keyword` as a case-insensitive substring filter over
/// title+description+channel, and stops at `limit` matches.
pub fn parse_feed(feed: &str, keyword: Option<&str>, limit: usize) -> Vec<Value> {
    let mut results = Vec::new();
    if limit == 0 {
        return results;
    }

    let Some(items_start) = find_items_array_start(feed) else {
        return results;
    };

    let bytes = feed.as_bytes();
    let mut i = items_start;
    let keyword_lower = keyword.map(|k| k.to_lowercase());

    while i < bytes.len() {
        // Skip whitespace / commas between items.
        while i < bytes.len() && (bytes[i] as char).is_whitespace() || (i < bytes.len() && bytes[i] == b',') {
            i += 1;
        }
        if i >= bytes.len() || bytes[i] == b']' {
            break;
        }
        if bytes[i] != b'{' {
            // Not an object start; feed is malformed from here on.
            break;
        }

        let Some(end) = find_object_end(bytes, i) else {
            break;
        };
        let raw = &feed[i..=end];
        if let Ok(item) = serde_json::from_str::<Value>(raw) {
            if matches_keyword(&item, keyword_lower.as_deref()) {
                results.push(item);
                if results.len() >= limit {
                    break;
                }
            }
        }
        i = end + 1;
    }

    results
}

fn find_items_array_start(feed: &str) -> Option<usize> {
    const NEEDLE: &str = "\"items\":[";
    let idx = feed.find(NEEDLE)?;
    Some(idx + NEEDLE.len())
}

/// Given the byte index of a `{`, finds the index of its matching `}` by
/// counting brace depth, tracking whether we're inside a quoted string
/// and honoring backslash escapes.
fn find_object_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn matches_keyword(item: &Value, keyword_lower: Option<&str>) -> bool {
    let Some(keyword) = keyword_lower else {
        return true;
    };
    let haystack = [
        item.get("title").and_then(Value::as_str).unwrap_or(""),
        item.get("description").and_then(Value::as_str).unwrap_or(""),
        item.get("channel").and_then(Value::as_str).unwrap_or(""),
    ]
    .join(" ")
    .to_lowercase();
    haystack.contains(keyword)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_matching_items_in_file_order_and_respects_limit() {
        let feed = r#"{"items":[
            {"title":"A","description":"","channel":"c"},
            {"title":"B foo","description":"","channel":"c"},
            {"title":"plain","description":"has foo inside","channel":"c"}
        ]}"#;
        let results = parse_feed(feed, Some("foo"), 10);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["title"], "B foo");
        assert_eq!(results[1]["title"], "plain");
    }

    #[test]
    fn early_exits_at_limit() {
        let feed = r#"{"items":[{"title":"foo 1"},{"title":"foo 2"},{"title":"foo 3"}]}"#;
        let results = parse_feed(feed, Some("foo"), 2);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn tolerates_braces_inside_quoted_strings() {
        let feed = r#"{"items":[{"title":"has a { brace } inside", "description":"foo"}]}"#;
        let results = parse_feed(feed, Some("foo"), 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["title"], "has a { brace } inside");
    }

    #[test]
    fn no_keyword_matches_everything() {
        let feed = r#"{"items":[{"title":"x"},{"title":"y"}]}"#;
        let results = parse_feed(feed, None, 10);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn missing_items_array_yields_nothing() {
        let feed = r#"{"other":[]}"#;
        assert!(parse_feed(feed, Some("foo"), 10).is_empty());
    }
}
