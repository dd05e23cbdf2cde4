//! Ephemeral cache-marker extraction and prefix fingerprinting.

use sha2::{Digest, Sha256};

use crate::protocol::anthropic::{MessageContent, Request, Role, SystemBlock};

/// Cache-relevant annotations extracted from a request.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheMarkers {
    /// Whether any system block carries an ephemeral marker.
    pub has_system_cache: bool,
    /// Concatenated text of cache-marked system blocks, in original order.
    pub system_cache_text: String,
    /// Number of ephemeral-marked blocks across user messages.
    pub user_cacheable_block_count: usize,
    /// Stable fingerprint of the system sequence, or `None` when the
    /// request has no system prompt at all.
    pub fingerprint: Option<String>,
}

/// Inspect a request for ephemeral cache markers and derive a fingerprint
/// of its cacheable prefix.
///
/// Only markers whose mode is `ephemeral` count. Assistant-role content is
/// ignored entirely. A string system prompt is normalized to a single text
/// block before inspection.
pub fn extract_cache_markers(request: &Request) -> CacheMarkers {
    let system_blocks = request.system.as_ref().map(|system| system.normalized());

    let mut has_system_cache = false;
    let mut system_cache_text = String::new();

    if let Some(blocks) = &system_blocks {
        for block in blocks {
            let SystemBlock::Text(text) = block else {
                continue;
            };

            if text.cache_control.as_ref().is_some_and(|marker| marker.is_ephemeral()) {
                has_system_cache = true;
                system_cache_text.push_str(&text.text);
            }
        }
    }

    let user_cacheable_block_count = request
        .messages
        .iter()
        .filter(|message| message.role == Role::User)
        .map(|message| match &message.content {
            MessageContent::Text(_) => 0,
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter(|block| block.cache_control().is_some_and(|marker| marker.is_ephemeral()))
                .count(),
        })
        .sum();

    CacheMarkers {
        has_system_cache,
        system_cache_text,
        user_cacheable_block_count,
        fingerprint: system_blocks.as_deref().map(fingerprint),
    }
}

/// SHA-256 over a canonical serialization of the system block sequence,
/// rendered as 64 lowercase hex characters.
///
/// The canonical form is one line per block,
/// `<index>:<type>:<marker>:<text>`, so fingerprints are order-sensitive
/// and marker-sensitive. An empty sequence hashes the empty canonical form.
pub fn fingerprint(blocks: &[SystemBlock]) -> String {
    let mut hasher = Sha256::new();

    for (index, block) in blocks.iter().enumerate() {
        match block {
            SystemBlock::Text(text) => {
                let marker = if text.cache_control.as_ref().is_some_and(|marker| marker.is_ephemeral()) {
                    "ephemeral"
                } else {
                    "0"
                };

                hasher.update(format!("{index}:text:{marker}:"));
                hasher.update(text.text.as_bytes());
            }
            SystemBlock::Unknown(value) => {
                hasher.update(format!("{index}:unknown:0:"));
                hasher.update(value.to_string());
            }
        }
        hasher.update(b"\n");
    }

    let digest = hasher.finalize();
    let mut rendered = String::with_capacity(digest.len() * 2);
    for byte in digest {
        rendered.push_str(&format!("{byte:02x}"));
    }
    rendered
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn request(value: serde_json::Value) -> Request {
        serde_json::from_value(value).unwrap()
    }

    fn base(system: serde_json::Value) -> Request {
        request(json!({
            "model": "qwen-7b",
            "max_tokens": 128,
            "system": system,
            "messages": [],
        }))
    }

    #[test]
    fn fingerprint_is_64_lowercase_hex() {
        let markers = extract_cache_markers(&base(json!("hello")));

        let fingerprint = markers.fingerprint.unwrap();
        assert_eq!(fingerprint.len(), 64);
        assert!(fingerprint.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn canonical_form_is_stable_across_releases() {
        let markers = extract_cache_markers(&base(json!("hello")));

        insta::assert_snapshot!(
            markers.fingerprint.unwrap(),
            @"f01499a07534d4418d25e0f5181beabf83e3df9865091db614373cbe1ca932b6"
        );
    }

    #[test]
    fn identical_inputs_fingerprint_identically() {
        let a = extract_cache_markers(&base(json!([
            { "type": "text", "text": "one", "cache_control": { "type": "ephemeral" } },
            { "type": "text", "text": "two" },
        ])));
        let b = extract_cache_markers(&base(json!([
            { "type": "text", "text": "one", "cache_control": { "type": "ephemeral" } },
            { "type": "text", "text": "two" },
        ])));

        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn block_order_changes_the_fingerprint() {
        let a = extract_cache_markers(&base(json!([
            { "type": "text", "text": "one" },
            { "type": "text", "text": "two" },
        ])));
        let b = extract_cache_markers(&base(json!([
            { "type": "text", "text": "two" },
            { "type": "text", "text": "one" },
        ])));

        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn cache_marker_presence_changes_the_fingerprint() {
        let unmarked = extract_cache_markers(&base(json!([{ "type": "text", "text": "one" }])));
        let marked = extract_cache_markers(&base(json!([
            { "type": "text", "text": "one", "cache_control": { "type": "ephemeral" } },
        ])));

        assert_ne!(unmarked.fingerprint, marked.fingerprint);
    }

    #[test]
    fn string_system_matches_its_normalized_block_form() {
        let as_string = extract_cache_markers(&base(json!("be terse")));
        let as_blocks = extract_cache_markers(&base(json!([{ "type": "text", "text": "be terse" }])));

        assert_eq!(as_string.fingerprint, as_blocks.fingerprint);
    }

    #[test]
    fn absent_system_has_no_fingerprint_but_empty_list_does() {
        let absent = extract_cache_markers(&request(json!({
            "model": "qwen-7b",
            "max_tokens": 128,
            "messages": [],
        })));
        assert_eq!(absent.fingerprint, None);

        let empty = extract_cache_markers(&base(json!([])));
        assert!(empty.fingerprint.is_some());
    }

    #[test]
    fn only_ephemeral_markers_count() {
        let markers = extract_cache_markers(&base(json!([
            { "type": "text", "text": "sticky", "cache_control": { "type": "persistent" } },
            { "type": "text", "text": "cached", "cache_control": { "type": "ephemeral" } },
        ])));

        assert!(markers.has_system_cache);
        assert_eq!(markers.system_cache_text, "cached");
    }

    #[test]
    fn system_cache_text_preserves_block_order() {
        let markers = extract_cache_markers(&base(json!([
            { "type": "text", "text": "first ", "cache_control": { "type": "ephemeral" } },
            { "type": "text", "text": "skipped" },
            { "type": "text", "text": "second", "cache_control": { "type": "ephemeral" } },
        ])));

        assert_eq!(markers.system_cache_text, "first second");
    }

    #[test]
    fn user_blocks_count_but_assistant_blocks_do_not() {
        let markers = extract_cache_markers(&request(json!({
            "model": "qwen-7b",
            "max_tokens": 128,
            "messages": [
                {
                    "role": "user",
                    "content": [
                        { "type": "text", "text": "a", "cache_control": { "type": "ephemeral" } },
                        { "type": "text", "text": "b" },
                    ],
                },
                {
                    "role": "assistant",
                    "content": [
                        { "type": "text", "text": "c", "cache_control": { "type": "ephemeral" } },
                    ],
                },
            ],
        })));

        assert_eq!(markers.user_cacheable_block_count, 1);
        assert!(!markers.has_system_cache);
        assert_eq!(markers.fingerprint, None);
    }
}
