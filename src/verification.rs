//! Svix-style webhook signature verification.
//!
//! Fellow delivers webhooks through Svix. Every delivery carries three headers:
//! `svix-id`, `svix-timestamp` (Unix seconds) and `svix-signature`, the latter
//! holding one or more space-separated `v1,<base64>` tokens. The signature is
//! an HMAC-SHA256 over `"{id}.{timestamp}.{body}"` keyed with the
//! base64-decoded endpoint secret (minus its `whsec_` prefix).

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::{Choice, ConstantTimeEq};

type HmacSha256 = Hmac<Sha256>;

/// Marker tag the provider puts in front of endpoint secrets.
pub const SECRET_PREFIX: &str = "whsec_";

/// Maximum distance, in either direction, between a delivery timestamp and
/// the local clock.
pub const TIMESTAMP_TOLERANCE_SECS: u64 = 300;

// Secrets are sometimes handed around without trailing padding.
const SECRET_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Verify a delivery against the current wall clock.
pub fn verify_svix(
    secret: &str,
    msg_id: &str,
    timestamp: &str,
    body: &[u8],
    signature_header: &str,
) -> bool {
    verify_svix_at(secret, msg_id, timestamp, body, signature_header, Utc::now().timestamp())
}

/// Verify a delivery against an explicit `now` (Unix seconds).
pub fn verify_svix_at(
    secret: &str,
    msg_id: &str,
    timestamp: &str,
    body: &[u8],
    signature_header: &str,
    now: i64,
) -> bool {
    let Ok(sent_at) = timestamp.parse::<i64>() else {
        return false;
    };
    if now.abs_diff(sent_at) > TIMESTAMP_TOLERANCE_SECS {
        return false;
    }

    let Some(key) = decode_secret(secret) else {
        return false;
    };
    let Some(expected) = compute_signature(&key, msg_id, timestamp, body) else {
        return false;
    };

    // Every candidate is compared; during key rotation the valid one can sit
    // anywhere in the header.
    let mut matched = Choice::from(0);
    for candidate in candidate_signatures(signature_header) {
        let Ok(provided) = STANDARD.decode(candidate) else {
            continue;
        };
        if provided.len() != expected.len() {
            continue;
        }
        matched |= provided.ct_eq(&expected);
    }
    matched.into()
}

/// Strip the optional `whsec_` marker and decode the remainder into key bytes.
pub fn decode_secret(secret: &str) -> Option<Vec<u8>> {
    let encoded = secret.strip_prefix(SECRET_PREFIX).unwrap_or(secret);
    SECRET_ENGINE.decode(encoded).ok()
}

fn compute_signature(key: &[u8], msg_id: &str, timestamp: &str, body: &[u8]) -> Option<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).ok()?;
    mac.update(msg_id.as_bytes());
    mac.update(b".");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    Some(mac.finalize().into_bytes().to_vec())
}

/// Split a `svix-signature` header into bare signature values.
/// Tokens that are not exactly `<version>,<signature>` yield an empty string.
fn candidate_signatures(header: &str) -> impl Iterator<Item = &str> {
    header.split(' ').map(|token| {
        let mut parts = token.split(',');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(_), Some(sig), None) => sig,
            _ => "",
        }
    })
}

/// Produce a `v1,<base64>` token the way the provider does.
#[cfg(test)]
pub(crate) fn sign(secret: &str, msg_id: &str, timestamp: &str, body: &[u8]) -> String {
    let key = decode_secret(secret).expect("test secret must be base64");
    let sig = compute_signature(&key, msg_id, timestamp, body).expect("hmac");
    format!("v1,{}", STANDARD.encode(sig))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_735_689_600;

    fn secret() -> String {
        format!("{SECRET_PREFIX}{}", STANDARD.encode("test-secret-key"))
    }

    fn ts(offset: i64) -> String {
        (NOW + offset).to_string()
    }

    #[test]
    fn accepts_valid_signature() {
        let body = br#"{"type":"ai_note.generated","data":{"note_id":"123"}}"#;
        let sig = sign(&secret(), "msg_12345", &ts(0), body);
        assert!(verify_svix_at(&secret(), "msg_12345", &ts(0), body, &sig, NOW));
    }

    #[test]
    fn documented_scenario() {
        let secret = format!("whsec_{}", STANDARD.encode("k"));
        let sig = sign(&secret, "msg_1", &ts(0), br#"{"a":1}"#);
        assert!(verify_svix_at(&secret, "msg_1", &ts(0), br#"{"a":1}"#, &sig, NOW));
        assert!(!verify_svix_at(&secret, "msg_1", &ts(0), br#"{"a":2}"#, &sig, NOW));
    }

    #[test]
    fn rejects_any_tampered_input() {
        let body = br#"{"type":"test","value":"original"}"#;
        let sig = sign(&secret(), "msg_12345", &ts(0), body);
        let other_secret = format!("{SECRET_PREFIX}{}", STANDARD.encode("wrong-secret"));

        assert!(!verify_svix_at(&other_secret, "msg_12345", &ts(0), body, &sig, NOW));
        assert!(!verify_svix_at(&secret(), "msg_67890", &ts(0), body, &sig, NOW));
        assert!(!verify_svix_at(&secret(), "msg_12345", &ts(1), body, &sig, NOW));
        assert!(!verify_svix_at(
            &secret(),
            "msg_12345",
            &ts(0),
            br#"{"type":"test","value":"tampered"}"#,
            &sig,
            NOW
        ));
    }

    #[test]
    fn timestamp_window() {
        let body = b"{}";
        for (offset, ok) in [(-240, true), (-300, true), (-360, false), (300, true), (360, false)] {
            let sig = sign(&secret(), "msg", &ts(offset), body);
            assert_eq!(
                verify_svix_at(&secret(), "msg", &ts(offset), body, &sig, NOW),
                ok,
                "offset {offset}"
            );
        }
    }

    #[test]
    fn rejects_unparseable_timestamp_even_with_matching_signature() {
        let body = b"{}";
        for bad in ["", "abc", "12.5", " 1735689600", "1735689600s"] {
            let sig = sign(&secret(), "msg", bad, body);
            assert!(!verify_svix_at(&secret(), "msg", bad, body, &sig, NOW), "{bad:?}");
        }
    }

    #[test]
    fn valid_signature_at_any_position() {
        let body = br#"{"type":"test"}"#;
        let valid = sign(&secret(), "msg", &ts(0), body);
        let decoy = format!("v1,{}", STANDARD.encode([7u8; 32]));

        for header in [
            format!("{valid} {decoy} {decoy}"),
            format!("{decoy} {valid} {decoy}"),
            format!("{decoy} {decoy} {valid}"),
        ] {
            assert!(verify_svix_at(&secret(), "msg", &ts(0), body, &header, NOW), "{header}");
        }

        let none = format!("{decoy} v1,fake_second_signature {decoy}");
        assert!(!verify_svix_at(&secret(), "msg", &ts(0), body, &none, NOW));
    }

    #[test]
    fn malformed_tokens_are_not_errors() {
        let body = b"{}";
        let valid = sign(&secret(), "msg", &ts(0), body);
        for header in ["", " ", "v1", "v1,a,b", "v1,!!!notbase64", ",,"] {
            assert!(!verify_svix_at(&secret(), "msg", &ts(0), body, header, NOW), "{header:?}");
        }
        let mixed = format!("garbage v1,a,b  {valid}");
        assert!(verify_svix_at(&secret(), "msg", &ts(0), body, &mixed, NOW));
    }

    #[test]
    fn empty_body_verifies() {
        let sig = sign(&secret(), "msg", &ts(0), b"");
        assert!(verify_svix_at(&secret(), "msg", &ts(0), b"", &sig, NOW));
    }

    #[test]
    fn prefix_is_optional() {
        let bare = STANDARD.encode("test-secret-key");
        assert_eq!(decode_secret(&secret()), decode_secret(&bare));

        let body = b"{\"x\":true}";
        let sig = sign(&secret(), "msg", &ts(0), body);
        assert!(verify_svix_at(&bare, "msg", &ts(0), body, &sig, NOW));
        assert!(verify_svix_at(&secret(), "msg", &ts(0), body, &sig, NOW));
    }

    #[test]
    fn raw_bytes_are_signed_not_reserialized() {
        let raw = b"{ \"a\" : 1 }";
        let sig = sign(&secret(), "msg", &ts(0), raw);
        assert!(verify_svix_at(&secret(), "msg", &ts(0), raw, &sig, NOW));
        assert!(!verify_svix_at(&secret(), "msg", &ts(0), br#"{"a":1}"#, &sig, NOW));
    }

    #[test]
    fn undecodable_secret_rejects() {
        let sig = sign(&secret(), "msg", &ts(0), b"{}");
        assert!(!verify_svix_at("whsec_***", "msg", &ts(0), b"{}", &sig, NOW));
    }

    #[test]
    fn wall_clock_entry_point() {
        let now = Utc::now().timestamp().to_string();
        let sig = sign(&secret(), "msg", &now, b"{}");
        assert!(verify_svix(&secret(), "msg", &now, b"{}", &sig));
    }
}
