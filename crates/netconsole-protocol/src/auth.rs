//! Rotating-key authentication of client-carried session state.
//!
//! The tag is HMAC-SHA256 over the session code followed by the raw state
//! bytes, keyed with the session's current 128-bit key. Keys never leave the
//! server and are replaced after every authenticated transaction.

use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use hmac::{Hmac, Mac};
use netconsole_store::SessionCode;
use rand::{RngCore, rngs::OsRng};
use sha2::Sha256;

use crate::transaction::ProtocolError;

type HmacSha256 = Hmac<Sha256>;

/// Rotating key length in bytes.
pub const KEY_BYTES: usize = 16;

/// Draw a fresh rotating key from the OS CSPRNG, base64 encoded.
#[must_use]
pub fn generate_key() -> String {
    let mut key = [0u8; KEY_BYTES];
    OsRng.fill_bytes(&mut key);
    STANDARD.encode(key)
}

fn mac(key: &str, code: SessionCode, state: &[u8]) -> Result<HmacSha256, ProtocolError> {
    let key = STANDARD
        .decode(key)
        .map_err(|e| ProtocolError::Internal(format!("corrupt rotating key: {e}")))?;
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| ProtocolError::Internal(format!("invalid hmac key: {e}")))?;
    mac.update(&code.to_bytes());
    mac.update(state);
    Ok(mac)
}

/// Tag `state` for `code` under `key`.
///
/// # Errors
/// Returns error if `key` is not valid base64.
pub fn sign(key: &str, code: SessionCode, state: &[u8]) -> Result<String, ProtocolError> {
    Ok(URL_SAFE_NO_PAD.encode(mac(key, code, state)?.finalize().into_bytes()))
}

/// Check `tag` in constant time. Any malformed input fails verification.
#[must_use]
pub fn verify(key: &str, code: SessionCode, state: &[u8], tag: &str) -> bool {
    let Ok(tag) = URL_SAFE_NO_PAD.decode(tag) else {
        return false;
    };
    mac(key, code, state).is_ok_and(|mac| mac.verify_slice(&tag).is_ok())
}
