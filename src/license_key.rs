//! License key generation and format validation.
//!
//! Keys are 16-character strings drawn uniformly from `A-Z0-9`. They are
//! opaque identifiers, not signed artifacts; uniqueness is enforced by the
//! caller checking the store before committing a key.

use rand::Rng;
use regex::Regex;
use std::sync::OnceLock;

use crate::errors::{ServiceError, ServiceResult};

/// Character set for license key generation.
const LICENSE_KEY_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Compiled key format pattern.
static KEY_FORMAT: OnceLock<Regex> = OnceLock::new();

/// Fixed length of every license key.
pub const LICENSE_KEY_LENGTH: usize = 16;

/// Maximum attempts when searching for an unused key.
///
/// Over a 36^16 key space a single retry is already vanishingly unlikely;
/// the ceiling exists so a broken uniqueness check cannot spin forever.
pub const MAX_KEY_GENERATION_ATTEMPTS: u32 = 32;

/// Generate a random license key.
pub fn generate_license_key() -> String {
    let mut rng = rand::rng();
    (0..LICENSE_KEY_LENGTH)
        .map(|_| {
            let idx = rng.random_range(0..LICENSE_KEY_CHARSET.len());
            LICENSE_KEY_CHARSET[idx] as char
        })
        .collect()
}

/// Check that a key is exactly 16 characters of `A-Z0-9`.
pub fn is_valid_key_format(key: &str) -> bool {
    KEY_FORMAT
        .get_or_init(|| Regex::new(r"^[A-Z0-9]{16}$").expect("static key format pattern"))
        .is_match(key)
}

/// Generate a license key that does not yet exist in storage.
///
/// `exists_fn` is an async uniqueness probe (typically a wrapper around
/// the store's key lookup). Generation retries on collision and gives up
/// after [`MAX_KEY_GENERATION_ATTEMPTS`].
pub async fn generate_unique_license_key<F, Fut>(exists_fn: F) -> ServiceResult<String>
where
    F: Fn(String) -> Fut,
    Fut: std::future::Future<Output = ServiceResult<bool>>,
{
    for _ in 0..MAX_KEY_GENERATION_ATTEMPTS {
        let key = generate_license_key();
        if !exists_fn(key.clone()).await? {
            return Ok(key);
        }
    }

    Err(ServiceError::Storage(format!(
        "failed to generate unique license key after {MAX_KEY_GENERATION_ATTEMPTS} attempts"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn generated_key_has_correct_format() {
        for _ in 0..100 {
            let key = generate_license_key();
            assert_eq!(key.len(), 16);
            assert!(is_valid_key_format(&key), "bad key: {key}");
        }
    }

    #[test]
    fn format_accepts_full_charset() {
        assert!(is_valid_key_format("ZZZZZZZZZZZZZZZ1"));
        assert!(is_valid_key_format("ABCDEFGHIJ012345"));
        assert!(is_valid_key_format("0000000000000000"));
    }

    #[test]
    fn format_rejects_wrong_length() {
        assert!(!is_valid_key_format("short"));
        assert!(!is_valid_key_format(""));
        assert!(!is_valid_key_format("ZZZZZZZZZZZZZZZ")); // 15 chars
        assert!(!is_valid_key_format("ZZZZZZZZZZZZZZZ12")); // 17 chars
    }

    #[test]
    fn format_rejects_invalid_characters() {
        assert!(!is_valid_key_format("abcdefghij012345")); // lowercase
        assert!(!is_valid_key_format("ABCDEFGH-J012345")); // separator
        assert!(!is_valid_key_format("ABCDEFGHIJ01234 ")); // whitespace
    }

    #[test]
    fn generated_keys_are_unique() {
        let mut keys = HashSet::new();
        for _ in 0..1000 {
            let key = generate_license_key();
            assert!(keys.insert(key.clone()), "duplicate key generated: {key}");
        }
    }

    #[test]
    fn unique_generation_returns_first_free_key() {
        let key = tokio_test::block_on(generate_unique_license_key(|_| async { Ok(false) }))
            .unwrap();
        assert!(is_valid_key_format(&key));
    }

    #[test]
    fn unique_generation_retries_on_collision() {
        let calls = AtomicU32::new(0);
        let key = tokio_test::block_on(generate_unique_license_key(|_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(n < 3) }
        }))
        .unwrap();

        assert!(is_valid_key_format(&key));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn unique_generation_gives_up_eventually() {
        let result = tokio_test::block_on(generate_unique_license_key(|_| async { Ok(true) }));
        assert!(result.is_err());
    }
}
