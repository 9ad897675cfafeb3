//! Inbound payload authenticity checks.
//!
//! Hosts prove origin in one of three ways: an HMAC-SHA256 or HMAC-SHA1
//! signature over the raw body carried in a header, or by echoing the shared
//! token back in a header or query parameter.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

const SHA256_PREFIX: &str = "sha256=";
const SHA1_PREFIX: &str = "sha1=";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    HmacSha256,
    HmacSha1,
    TokenEcho,
}

/// Checks a `sha256=<64 hex>` header against the body. Any other length or
/// prefix is rejected before hashing.
pub fn verify_hmac_sha256(secret: &[u8], signature: &str, body: &[u8]) -> bool {
    let Some(digest) = strict_digest(signature, SHA256_PREFIX, 32) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&digest).is_ok()
}

/// Checks a `sha1=<40 hex>` header against the body.
pub fn verify_hmac_sha1(secret: &[u8], signature: &str, body: &[u8]) -> bool {
    let Some(digest) = strict_digest(signature, SHA1_PREFIX, 20) else {
        return false;
    };
    let Ok(mut mac) = HmacSha1::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&digest).is_ok()
}

/// Token echo: the host repeats the shared secret verbatim.
pub fn verify_token(expected: &str, presented: Option<&str>) -> bool {
    match presented {
        Some(presented) => !expected.is_empty() && presented == expected,
        None => false,
    }
}

/// Produces the header value a host would send for `body`.
#[cfg(test)]
pub fn sign_sha256(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).unwrap();
    mac.update(body);
    format!("{SHA256_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

fn strict_digest(signature: &str, prefix: &str, digest_len: usize) -> Option<Vec<u8>> {
    if signature.len() != prefix.len() + digest_len * 2 {
        return None;
    }
    let encoded = signature.strip_prefix(prefix)?;
    hex::decode(encoded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"5f0c2c49-1b0e-4b8e";
    const BODY: &[u8] = br#"{"ref":"refs/heads/main"}"#;

    fn sign_sha1(secret: &[u8], body: &[u8]) -> String {
        let mut mac = HmacSha1::new_from_slice(secret).unwrap();
        mac.update(body);
        format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_sha256_signature_is_accepted() {
        let signature = sign_sha256(SECRET, BODY);
        assert_eq!(signature.len(), 71);
        assert!(verify_hmac_sha256(SECRET, &signature, BODY));
    }

    #[test]
    fn any_single_byte_body_mutation_is_rejected() {
        let signature = sign_sha256(SECRET, BODY);
        for i in 0..BODY.len() {
            let mut mutated = BODY.to_vec();
            mutated[i] ^= 0x01;
            assert!(!verify_hmac_sha256(SECRET, &signature, &mutated), "byte {i}");
        }
    }

    #[test]
    fn any_single_char_signature_mutation_is_rejected() {
        let signature = sign_sha256(SECRET, BODY);
        for i in SHA256_PREFIX.len()..signature.len() {
            let mut mutated = signature.clone().into_bytes();
            mutated[i] = if mutated[i] == b'0' { b'1' } else { b'0' };
            let mutated = String::from_utf8(mutated).unwrap();
            assert!(!verify_hmac_sha256(SECRET, &mutated, BODY), "char {i}");
        }
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let signature = sign_sha256(SECRET, BODY);
        let digest = &signature[SHA256_PREFIX.len()..];
        assert!(!verify_hmac_sha256(SECRET, digest, BODY));
        assert!(!verify_hmac_sha256(SECRET, &format!("sha512={digest}"), BODY));
        assert!(!verify_hmac_sha256(SECRET, &signature[..70], BODY));
        assert!(!verify_hmac_sha256(SECRET, &format!("{signature}0"), BODY));
        assert!(!verify_hmac_sha256(SECRET, &format!("sha256={}", "z".repeat(64)), BODY));
        assert!(!verify_hmac_sha256(b"other", &signature, BODY));
    }

    #[test]
    fn sha1_signatures() {
        let signature = sign_sha1(SECRET, BODY);
        assert!(verify_hmac_sha1(SECRET, &signature, BODY));
        assert!(!verify_hmac_sha1(SECRET, &signature, b"{}"));
        assert!(!verify_hmac_sha1(SECRET, &sign_sha256(SECRET, BODY), BODY));
    }

    #[test]
    fn token_echo() {
        assert!(verify_token("t0k3n", Some("t0k3n")));
        assert!(!verify_token("t0k3n", Some("t0k3N")));
        assert!(!verify_token("t0k3n", None));
        assert!(!verify_token("", Some("")));
    }
}
