//! Constant-time HMAC-SHA256 verification of inbound webhook payloads.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SHA256_PREFIX: &str = "sha256=";

/// Verifies `signature` (`"sha256=<hex>"`) against `body` using `secret`.
/// Comparison is constant-time per the length of the decoded digest
/// (`Mac::verify_slice` does not short-circuit on the first differing byte).
pub fn verify(secret: &str, body: &[u8], signature: &str) -> bool {
    let Some(hex_sig) = signature.strip_prefix(SHA256_PREFIX) else {
        return false;
    };

    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };

    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    format!("{SHA256_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_a_correctly_signed_body() {
        let body = b"{\"hello\":\"world\"}";
        let sig = sign("topsecret", body);
        assert!(verify("topsecret", body, &sig));
    }

    #[test]
    fn rejects_any_single_bit_flip_of_the_payload() {
        let body = b"{\"hello\":\"world\"}";
        let sig = sign("topsecret", body);

        for i in 0..body.len() {
            let mut flipped = body.to_vec();
            flipped[i] ^= 0x01;
            assert!(!verify("topsecret", &flipped, &sig), "bit flip at byte {i} was accepted");
        }
    }

    #[test]
    fn rejects_wrong_secret() {
        let body = b"payload";
        let sig = sign("right-secret", body);
        assert!(!verify("wrong-secret", body, &sig));
    }

    #[test]
    fn rejects_malformed_signature_header() {
        assert!(!verify("s", b"body", "not-a-signature"));
        assert!(!verify("s", b"body", "sha256=not-hex"));
    }
}
