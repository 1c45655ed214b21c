//! Join-token codec: sign/verify short-lived bearer credentials binding
//! `(userId, roomId, optional name)` to an expiry.
//!
//! Deliberately hand-rolled rather than built on a general JWT crate: callers
//! need to distinguish `bad-signature` from `bad-header` from `expired`
//! to respond correctly, and a generic library collapses those into one
//! opaque decode error.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
struct Header {
    alg: &'static str,
    typ: &'static str,
}

const HEADER: Header = Header {
    alg: "HS256",
    typ: "JWT",
};

/// Claims carried by a join token, as described in the data model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub room: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub iat: i64,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("bad signature")]
    BadSignature,
    #[error("bad header")]
    BadHeader,
    #[error("bad payload")]
    BadPayload,
    #[error("expired")]
    Expired,
    #[error("room mismatch")]
    RoomMismatch,
}

/// Options for `verify`.
pub struct VerifyOptions<'a> {
    pub expected_room: Option<&'a str>,
    pub now: i64,
}

/// Signs `claims` into `base64url(header).base64url(payload).base64url(hmac)`.
pub fn sign(claims: &Claims, secret: &[u8]) -> String {
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&HEADER).expect("header encodes"));
    let payload_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).expect("claims encode"));
    let signing_input = format!("{header_b64}.{payload_b64}");

    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(signing_input.as_bytes());
    let sig_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    format!("{signing_input}.{sig_b64}")
}

/// Verifies a token and returns its claims, or the specific failure kind.
pub fn verify(token: &str, secret: &[u8], opts: VerifyOptions<'_>) -> Result<Claims, TokenError> {
    let mut parts = token.split('.');
    let (header_b64, payload_b64, sig_b64) = match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s)) if parts.next().is_none() => (h, p, s),
        _ => return Err(TokenError::Malformed),
    };

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|_| TokenError::Malformed)?;
    let header: Header = serde_json::from_slice(&header_bytes).map_err(|_| TokenError::BadHeader)?;
    if header.alg != "HS256" {
        return Err(TokenError::BadHeader);
    }

    let expected_sig = {
        let signing_input = format!("{header_b64}.{payload_b64}");
        let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
        mac.update(signing_input.as_bytes());
        mac.finalize().into_bytes()
    };
    let given_sig = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| TokenError::Malformed)?;
    if expected_sig.as_slice().ct_eq(&given_sig).unwrap_u8() != 1 {
        return Err(TokenError::BadSignature);
    }

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| TokenError::Malformed)?;
    let claims: Claims =
        serde_json::from_slice(&payload_bytes).map_err(|_| TokenError::BadPayload)?;

    if claims.exp <= opts.now {
        return Err(TokenError::Expired);
    }
    if let Some(expected_room) = opts.expected_room {
        if claims.room != expected_room {
            return Err(TokenError::RoomMismatch);
        }
    }

    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(room: &str, exp: i64) -> Claims {
        Claims {
            sub: "alice".to_string(),
            room: room.to_string(),
            name: Some("alice".to_string()),
            iat: 0,
            exp,
            jti: None,
        }
    }

    #[test]
    fn round_trips() {
        let secret = b"super-secret";
        let c = claims("R", 1_000);
        let token = sign(&c, secret);
        let verified = verify(
            &token,
            secret,
            VerifyOptions {
                expected_room: Some("R"),
                now: 500,
            },
        )
        .expect("verifies");
        assert_eq!(verified, c);
    }

    #[test]
    fn rejects_expired() {
        let secret = b"super-secret";
        let token = sign(&claims("R", 100), secret);
        let err = verify(
            &token,
            secret,
            VerifyOptions {
                expected_room: None,
                now: 1_000,
            },
        )
        .unwrap_err();
        assert_eq!(err, TokenError::Expired);
    }

    #[test]
    fn rejects_room_mismatch() {
        let secret = b"super-secret";
        let token = sign(&claims("R", 1_000), secret);
        let err = verify(
            &token,
            secret,
            VerifyOptions {
                expected_room: Some("other"),
                now: 0,
            },
        )
        .unwrap_err();
        assert_eq!(err, TokenError::RoomMismatch);
    }

    #[test]
    fn rejects_bad_signature() {
        let token = sign(&claims("R", 1_000), b"secret-a");
        let err = verify(
            &token,
            b"secret-b",
            VerifyOptions {
                expected_room: None,
                now: 0,
            },
        )
        .unwrap_err();
        assert_eq!(err, TokenError::BadSignature);
    }

    #[test]
    fn rejects_malformed() {
        let err = verify(
            "not-a-token",
            b"secret",
            VerifyOptions {
                expected_room: None,
                now: 0,
            },
        )
        .unwrap_err();
        assert_eq!(err, TokenError::Malformed);
    }

    #[test]
    fn rejects_tampered_payload() {
        let secret = b"super-secret";
        let token = sign(&claims("R", 1_000), secret);
        let mut parts: Vec<&str> = token.split('.').collect();
        let tampered_payload =
            URL_SAFE_NO_PAD.encode(br#"{"sub":"mallory","room":"R","iat":0,"exp":1000}"#);
        parts[1] = &tampered_payload;
        let tampered = parts.join(".");
        let err = verify(
            &tampered,
            secret,
            VerifyOptions {
                expected_room: None,
                now: 0,
            },
        )
        .unwrap_err();
        assert_eq!(err, TokenError::BadSignature);
    }
}
