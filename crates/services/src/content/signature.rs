//! Signature tags ("tripcodes").
//!
//! A signature request of the form `name ##secret` yields a secure tag
//! `name!!digest` keyed by the installation salt; `name #secret` yields a
//! plain tag `name!digest`. Any other request is digested whole.

#[cfg(feature = "auth-tripcode")]
use base64::{engine::general_purpose, Engine as _};
#[cfg(feature = "auth-tripcode")]
use hmac::{Hmac, Mac};
#[cfg(feature = "auth-tripcode")]
use sha2::{Digest, Sha256};

pub const SECURE_DELIMITER: &str = " ##";
pub const PLAIN_DELIMITER: &str = " #";

const NAME_LIMIT: usize = 32;
#[cfg(feature = "auth-tripcode")]
const DIGEST_CHARS: usize = 10;

#[cfg(feature = "auth-tripcode")]
type HmacSha256 = Hmac<Sha256>;

/// Derives the public signature tag for a (cleaned) signature request.
#[cfg(feature = "auth-tripcode")]
pub fn derive_tag(request: &str, salt: &str) -> String {
    if let Some((name, secret)) = request.split_once(SECURE_DELIMITER) {
        return format!("{}!!{}", limit_name(name), secure_digest(secret, salt));
    }
    if let Some((name, secret)) = request.split_once(PLAIN_DELIMITER) {
        return format!("{}!{}", limit_name(name), plain_digest(secret));
    }
    plain_digest(request)
}

/// Without tripcode support only the name part is kept; the secret is
/// dropped.
#[cfg(not(feature = "auth-tripcode"))]
pub fn derive_tag(request: &str, _salt: &str) -> String {
    let name = request.split_once(PLAIN_DELIMITER).map_or(request, |(name, _)| name);
    limit_name(name).to_string()
}

fn limit_name(name: &str) -> &str {
    match name.char_indices().nth(NAME_LIMIT) {
        Some((idx, _)) => &name[..idx],
        None => name,
    }
}

#[cfg(feature = "auth-tripcode")]
fn plain_digest(secret: &str) -> String {
    let hash = Sha256::digest(secret.as_bytes());
    shorten(general_purpose::STANDARD.encode(hash))
}

#[cfg(feature = "auth-tripcode")]
fn secure_digest(secret: &str, salt: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(salt.as_bytes())
        .expect("HMAC can take a key of any size");
    mac.update(secret.as_bytes());
    shorten(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

#[cfg(feature = "auth-tripcode")]
fn shorten(mut encoded: String) -> String {
    encoded.truncate(DIGEST_CHARS);
    encoded
}

#[cfg(all(test, feature = "auth-tripcode"))]
mod tests {
    use super::*;

    #[test]
    fn plain_tags_are_stable_and_salt_independent() {
        let a = derive_tag("Anon #hunter2", "salt-one");
        let b = derive_tag("Anon #hunter2", "salt-two");
        assert_eq!(a, b);
        assert!(a.starts_with("Anon!"));
        assert_eq!(a.len(), "Anon!".len() + DIGEST_CHARS);
        assert_ne!(a, derive_tag("Anon #hunter3", "salt-one"));
    }

    #[test]
    fn secure_tags_depend_on_the_salt() {
        let a = derive_tag("Mod ##letmein", "salt-one");
        let b = derive_tag("Mod ##letmein", "salt-two");
        assert!(a.starts_with("Mod!!"));
        assert_ne!(a, b);
        assert_eq!(a, derive_tag("Mod ##letmein", "salt-one"));
    }

    #[test]
    fn secure_delimiter_wins_over_plain() {
        let tag = derive_tag("Mod ##secret #x", "salt");
        assert!(tag.starts_with("Mod!!"));
    }

    #[test]
    fn requests_without_delimiter_are_digested_whole() {
        let tag = derive_tag("justasecret", "salt");
        assert_eq!(tag.len(), DIGEST_CHARS);
        assert!(!tag.contains("justasecret"));
    }
}

#[cfg(all(test, not(feature = "auth-tripcode")))]
mod name_only_tests {
    use super::*;

    #[test]
    fn secrets_never_reach_the_tag() {
        assert_eq!(derive_tag("Name ##secret", "salt"), "Name");
        assert_eq!(derive_tag("Name #secret", "salt"), "Name");
        assert_eq!(derive_tag("Name", "salt"), "Name");
        assert_eq!(derive_tag(&"x".repeat(40), "salt").len(), 32);
    }
}
