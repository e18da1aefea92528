//! Label-safe tokens for Alertmanager group keys.
//!
//! Group keys look like `{}/{severity="critical"}:{alertname="KubePodCrashLooping"}`
//! and cannot be used as Kubernetes label values directly. They are hashed with
//! 64-bit xxh3 and rendered in base36, prefixed with `g` so the token always
//! starts with a letter.
//!
//! Two distinct group keys map to the same token with probability about
//! `n^2 / 2^65` for `n` concurrently active groups (roughly 1 in 10^14 for a
//! thousand groups). A collision only causes a false dedup hit: the second
//! group's alert is recorded without a job while the first group's job is active.

use xxhash_rust::xxh3::xxh3_64;

/// Label key carrying the hashed group key on every dispatched job.
pub const GROUP_KEY_LABEL: &str = "openfero.io/group-key";

/// Maximum length of a Kubernetes label value.
pub const MAX_LABEL_LENGTH: usize = 63;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Hash a group key into a label-safe token. The empty key maps to the empty
/// token, which means "no dedup requested".
pub fn hash_group_key(group_key: &str) -> String {
    if group_key.is_empty() {
        return String::new();
    }

    let mut token = String::with_capacity(14);
    token.push('g');
    token.push_str(&to_base36(xxh3_64(group_key.as_bytes())));
    token.truncate(MAX_LABEL_LENGTH);
    token
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::with_capacity(13);
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    // digits are ASCII
    String::from_utf8(digits).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_empty_group_key_maps_to_empty() {
        assert_eq!(hash_group_key(""), "");
    }

    #[test]
    fn test_hash_is_deterministic() {
        let key = r#"{}:{alertname="KubeQuotaExceeded"}"#;
        assert_eq!(hash_group_key(key), hash_group_key(key));
        assert_eq!(hash_group_key("test-group-123"), hash_group_key("test-group-123"));
    }

    #[test]
    fn test_hash_is_label_safe() {
        for key in ["a", "test-group-123", &"x".repeat(4096), "{}/{foo=\"bar\"}:{}"] {
            let token = hash_group_key(key);
            assert!(token.starts_with('g'));
            assert!(token.len() <= MAX_LABEL_LENGTH);
            assert!(token.len() > 1);
            assert!(token
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_distinct_keys_produce_distinct_tokens() {
        let tokens: HashSet<String> = (0..10_000)
            .map(|i| hash_group_key(&format!("{{}}:{{alertname=\"Alert{}\"}}", i)))
            .collect();
        assert_eq!(tokens.len(), 10_000);
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(u64::MAX), "3w5e11264sgsf");
    }
}
