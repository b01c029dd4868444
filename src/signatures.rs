use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// Verifies the marketplace `x-signature` header: HMAC-SHA256 over the raw
/// request body, hex encoded, with or without a `sha256=` prefix. The
/// comparison runs over the decoded MAC bytes in constant time.
pub fn verify_signature(secret: &str, payload: &[u8], signature_header: &str) -> bool {
    let Some(provided) = decode_signature_header(signature_header) else {
        return false;
    };

    let expected = hmac_sha256(secret, payload);
    if provided.len() != expected.len() {
        return false;
    }
    provided.as_slice().ct_eq(expected.as_slice()).into()
}

pub fn compute_hmac_sha256_hex(secret: &str, payload: &[u8]) -> String {
    hex::encode(hmac_sha256(secret, payload))
}

fn hmac_sha256(secret: &str, payload: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts variable-length keys");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Header values arrive as `sha256=<hex>` or bare hex, any case, sometimes
/// padded with whitespace. Undecodable values fail verification outright.
fn decode_signature_header(raw: &str) -> Option<Vec<u8>> {
    let trimmed = raw.trim();
    let hex_part = trimmed.strip_prefix("sha256=").unwrap_or(trimmed).trim();
    hex::decode(hex_part).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_signature_with_and_without_prefix() {
        let secret = "marketplace-secret";
        let payload = br#"{"topic":"questions","resource":"/questions/123"}"#;
        let digest = compute_hmac_sha256_hex(secret, payload);

        assert!(verify_signature(secret, payload, &digest));
        assert!(verify_signature(secret, payload, &format!("sha256={digest}")));
    }

    #[test]
    fn rejects_wrong_signature_and_wrong_secret() {
        let secret = "marketplace-secret";
        let payload = br#"{"topic":"orders_v2"}"#;
        let digest = compute_hmac_sha256_hex(secret, payload);

        assert!(!verify_signature(secret, payload, "sha256=deadbeef"));
        assert!(!verify_signature("other-secret", payload, &digest));
    }

    #[test]
    fn rejects_undecodable_signature_header() {
        let secret = "marketplace-secret";
        let payload = b"body";

        assert!(!verify_signature(secret, payload, "sha256=not-hex-at-all"));
        assert!(!verify_signature(secret, payload, ""));
    }

    #[test]
    fn normalizes_case_and_whitespace() {
        let secret = "marketplace-secret";
        let payload = b"body";
        let digest = compute_hmac_sha256_hex(secret, payload).to_ascii_uppercase();

        assert!(verify_signature(secret, payload, &format!("  sha256={digest}  ")));
    }
}
