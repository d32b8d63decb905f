//! Authentication digest wrapper (C3).
//!
//! Treat MD5 and HMAC-SHA1 as building blocks, not as things to design:
//! this module is a thin wrapper over `md5`/`hmac`+`sha1` exposing only
//! the two operations RMCP/RMCP+ actually need — the legacy RMCP
//! password digest and the RAKP key-exchange HMAC.

use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Legacy RMCP "straight password" / MD5 challenge digest:
/// `MD5(password || session_id || challenge || session_seq || password)`.
pub fn rmcp_md5_digest(password: &[u8; 16], session_id: u32, challenge: &[u8], session_seq: u32) -> [u8; 16] {
    let mut ctx = md5::Context::new();
    ctx.consume(password);
    ctx.consume(session_id.to_le_bytes());
    ctx.consume(challenge);
    ctx.consume(session_seq.to_le_bytes());
    ctx.consume(password);
    ctx.compute().0
}

/// RAKP HMAC-SHA1, used to derive SIK/K1/K2 and to check RAKP message
/// integrity. `key` is the key-exchange key (Kg, or the user's password
/// when Kg is not configured); `data` is the message-specific input.
pub fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Verify a 20-byte (or truncated, per the integrity algorithm in use)
/// HMAC-SHA1 tag in constant time.
pub fn hmac_sha1_verify(key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.verify_truncated_left(tag).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_digest_is_deterministic() {
        let pw = [0u8; 16];
        let a = rmcp_md5_digest(&pw, 1, b"challenge", 1);
        let b = rmcp_md5_digest(&pw, 1, b"challenge", 1);
        assert_eq!(a, b);
    }

    #[test]
    fn hmac_round_trips_through_verify() {
        let key = b"session integrity key";
        let data = b"RAKP message 3 payload";
        let tag = hmac_sha1(key, data);
        assert!(hmac_sha1_verify(key, data, &tag));
        assert!(!hmac_sha1_verify(key, data, &[0u8; 20]));
    }
}
