//! Ephemeral TURN credential minting, per the short-term-credential scheme
//! used by coturn and friends: `username = "<expiresAt>:<userId>"`,
//! `credential = base64(HMAC-SHA1(sharedSecret, username))`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnCredentials {
    pub username: String,
    pub credential: String,
    pub ttl_seconds: u64,
}

/// Mints a `(username, credential, ttl)` triple for `user_id`, or `None` if
/// no shared secret is configured.
pub fn mint(user_id: &str, shared_secret: Option<&str>, ttl_seconds: u64, now_unix: i64) -> Option<TurnCredentials> {
    let secret = shared_secret?;
    let expires_at = now_unix + ttl_seconds as i64;
    let username = format!("{expires_at}:{user_id}");

    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(username.as_bytes());
    let credential = STANDARD.encode(mac.finalize().into_bytes());

    Some(TurnCredentials {
        username,
        credential,
        ttl_seconds,
    })
}
