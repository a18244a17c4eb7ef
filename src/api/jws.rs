//! Detached-payload JWS verification for signed API files.
//!
//! Signed endpoints (`*.jws.json`) wrap their JSON payload in an envelope:
//!
//! ```text
//! {
//!   "payload": "<raw JSON text>",
//!   "signatures": [
//!     { "header": { "kid": "homebrew-1" }, "protected": "<b64url header>", "signature": "<b64url>" }
//!   ]
//! }
//! ```
//!
//! Only the signature whose key id matches the trusted key is considered. Its
//! protected header must pin `PS512` with `b64: false`, and the signature is an
//! RSA-PSS/SHA-512 signature (salt length = digest length) over
//! `protected + "." + payload`.

use crate::error::IntegrityError;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pss, RsaPublicKey};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha512};

/// Key id of the signing key shipped with this build.
pub const TRUSTED_KEY_ID: &str = "homebrew-1";

const PINNED_ALGORITHM: &str = "PS512";

const EMBEDDED_PUBLIC_KEY: &str = include_str!("homebrew-1.pem");

/// A public key paired with the key id it answers to.
#[derive(Debug, Clone)]
pub struct TrustedKey {
    pub id: String,
    key: RsaPublicKey,
}

impl TrustedKey {
    /// The key embedded at build time.
    pub fn embedded() -> Result<Self, IntegrityError> {
        Self::from_pem(TRUSTED_KEY_ID, EMBEDDED_PUBLIC_KEY)
    }

    /// Parse an SPKI (`BEGIN PUBLIC KEY`) PEM document.
    pub fn from_pem(id: &str, pem: &str) -> Result<Self, IntegrityError> {
        let key = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| IntegrityError::MalformedEnvelope(format!("invalid public key: {e}")))?;
        Ok(Self {
            id: id.to_string(),
            key,
        })
    }
}

#[derive(Deserialize)]
struct Envelope {
    payload: String,
    #[serde(default)]
    signatures: Vec<SignatureEntry>,
}

#[derive(Deserialize)]
struct SignatureEntry {
    #[serde(default)]
    header: Option<SignatureHeader>,
    protected: String,
    signature: String,
}

#[derive(Deserialize)]
struct SignatureHeader {
    kid: Option<String>,
}

#[derive(Deserialize)]
struct ProtectedHeader {
    alg: Option<String>,
    b64: Option<bool>,
}

/// Verify `envelope` against `key` and return the parsed payload.
pub fn verify_and_parse(envelope: &Value, key: &TrustedKey) -> Result<Value, IntegrityError> {
    let envelope: Envelope = serde_json::from_value(envelope.clone())
        .map_err(|e| IntegrityError::MalformedEnvelope(e.to_string()))?;

    let signature = envelope
        .signatures
        .iter()
        .find(|sig| {
            sig.header
                .as_ref()
                .and_then(|h| h.kid.as_deref())
                .is_some_and(|kid| kid == key.id)
        })
        .ok_or(IntegrityError::KeyNotFound)?;

    let header: ProtectedHeader = decode_b64url(&signature.protected)
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .ok_or(IntegrityError::UnsupportedAlgorithm)?;

    // A missing `b64` means base64-encoded content, which is not what we sign.
    if header.alg.as_deref() != Some(PINNED_ALGORITHM) || header.b64 != Some(false) {
        return Err(IntegrityError::UnsupportedAlgorithm);
    }

    let signature_bytes =
        decode_b64url(&signature.signature).ok_or(IntegrityError::SignatureMismatch)?;
    let signing_input = format!("{}.{}", signature.protected, envelope.payload);
    let digest = Sha512::digest(signing_input.as_bytes());

    key.key
        .verify(
            Pss::new_with_salt::<Sha512>(<Sha512 as Digest>::output_size()),
            &digest,
            &signature_bytes,
        )
        .map_err(|_| IntegrityError::SignatureMismatch)?;

    serde_json::from_str(&envelope.payload)
        .map_err(|e| IntegrityError::MalformedEnvelope(format!("payload is not JSON: {e}")))
}

/// URL-safe base64, with or without padding.
fn decode_b64url(input: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(input.trim_end_matches('=')).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = include_str!("../../tests/fixtures/jws/test-key.pub.pem");
    const SIGNED_FORMULAE: &str = include_str!("../../tests/fixtures/jws/formula.jws.json");

    fn test_key() -> TrustedKey {
        TrustedKey::from_pem(TRUSTED_KEY_ID, TEST_KEY).unwrap()
    }

    fn envelope() -> Value {
        serde_json::from_str(SIGNED_FORMULAE).unwrap()
    }

    #[test]
    fn test_valid_envelope_verifies() {
        let payload = verify_and_parse(&envelope(), &test_key()).unwrap();
        let names: Vec<&str> = payload
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|f| f["name"].as_str())
            .collect();
        assert_eq!(names, ["foo", "bar", "python@3.12"]);
    }

    #[test]
    fn test_embedded_key_parses() {
        let key = TrustedKey::embedded().unwrap();
        assert_eq!(key.id, "homebrew-1");
    }

    #[test]
    fn test_embedded_key_rejects_test_signature() {
        let key = TrustedKey::embedded().unwrap();
        assert_eq!(
            verify_and_parse(&envelope(), &key),
            Err(IntegrityError::SignatureMismatch)
        );
    }

    #[test]
    fn test_missing_key_id() {
        let key = TrustedKey::from_pem("homebrew-2", TEST_KEY).unwrap();
        assert_eq!(
            verify_and_parse(&envelope(), &key),
            Err(IntegrityError::KeyNotFound)
        );
    }

    #[test]
    fn test_tampered_payload_byte() {
        let mut env = envelope();
        let payload = env["payload"].as_str().unwrap().replacen("1.2.3", "1.2.4", 1);
        env["payload"] = Value::String(payload);
        assert_eq!(
            verify_and_parse(&env, &test_key()),
            Err(IntegrityError::SignatureMismatch)
        );
    }

    #[test]
    fn test_tampered_signature_byte() {
        let mut env = envelope();
        let sig = env["signatures"][1]["signature"].as_str().unwrap().to_string();
        let mut bytes = decode_b64url(&sig).unwrap();
        bytes[10] ^= 0x01;
        env["signatures"][1]["signature"] = Value::String(URL_SAFE_NO_PAD.encode(bytes));
        assert_eq!(
            verify_and_parse(&env, &test_key()),
            Err(IntegrityError::SignatureMismatch)
        );
    }

    #[test]
    fn test_declared_algorithm_is_pinned() {
        for header in [
            r#"{"alg":"RS512","b64":false,"crit":["b64"]}"#,
            r#"{"alg":"PS512"}"#,
            r#"{"alg":"PS512","b64":true}"#,
        ] {
            let mut env = envelope();
            env["signatures"][1]["protected"] =
                Value::String(URL_SAFE_NO_PAD.encode(header.as_bytes()));
            assert_eq!(
                verify_and_parse(&env, &test_key()),
                Err(IntegrityError::UnsupportedAlgorithm),
                "header {header} must be rejected"
            );
        }
    }

    #[test]
    fn test_padded_base64_is_accepted() {
        assert_eq!(decode_b64url("YQ==").unwrap(), b"a");
        assert_eq!(decode_b64url("YQ").unwrap(), b"a");
    }
}
