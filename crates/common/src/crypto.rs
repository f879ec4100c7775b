//! crypto helpers for the calendar core: SHA-256 hashing, hex/utf8 value
//! decoding, and the minute-window HMAC used to authenticate node updates.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// compute sha-256 raw bytes (32 bytes)
pub fn sha256_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// compute sha-256 hex string of bytes
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256_bytes(data))
}

/// double sha-256 (bitcoin tx/header hashing), raw bytes
pub fn sha256d_bytes(data: &[u8]) -> [u8; 32] {
    sha256_bytes(&sha256_bytes(data))
}

/// True when `s` is non-empty, even-length, and all hex digits.
pub fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.len() % 2 == 0 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Decode a proof/block value: hex bytes when the string parses as hex,
/// UTF-8 bytes otherwise. The same rule applies to block `data_val` and to
/// `l`/`r` proof operation values, so proofs replay against block hashes.
pub fn decode_value(s: &str) -> Vec<u8> {
    if is_hex(s) {
        hex::decode(s).unwrap_or_else(|_| s.as_bytes().to_vec())
    } else {
        s.as_bytes().to_vec()
    }
}

/// Minute-resolution key material suffix, UTC: `YYYYMMDDHHmm`.
pub fn minute_key(t: DateTime<Utc>) -> String {
    t.format("%Y%m%d%H%M").to_string()
}

/// HMAC-SHA256 over `tnt_addr || public_uri || minute_key(t)`, hex encoded.
///
/// `hmac_key_hex` is the node's 32-byte hex key as stored in the registry.
pub fn update_hmac(
    hmac_key_hex: &str,
    tnt_addr: &str,
    public_uri: &str,
    t: DateTime<Utc>,
) -> Result<String, crate::CoreError> {
    let key = hex::decode(hmac_key_hex)
        .map_err(|e| crate::CoreError::Validation(format!("bad hmac key: {}", e)))?;
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| crate::CoreError::Validation(format!("bad hmac key length: {}", e)))?;
    mac.update(tnt_addr.as_bytes());
    mac.update(public_uri.as_bytes());
    mac.update(minute_key(t).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a node-supplied HMAC against the three acceptable minute-keyed
/// values at `{t-1, t, t+1}` minutes UTC. Bounded clock skew between the
/// node and this service is tolerated; anything further is rejected.
pub fn verify_update_hmac(
    hmac_key_hex: &str,
    tnt_addr: &str,
    public_uri: &str,
    provided_hex: &str,
    now: DateTime<Utc>,
) -> bool {
    for offset in [-1i64, 0, 1] {
        let t = now + Duration::minutes(offset);
        if let Ok(expected) = update_hmac(hmac_key_hex, tnt_addr, public_uri, t) {
            if constant_time_eq(expected.as_bytes(), provided_hex.as_bytes()) {
                return true;
            }
        }
    }
    false
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const KEY: &str = "aabbccddeeff00112233445566778899aabbccddeeff00112233445566778899";
    const ADDR: &str = "0x1234567890abcdef1234567890abcdef12345678";
    const URI: &str = "http://65.21.22.245";

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn hex_detection() {
        assert!(is_hex("aabb"));
        assert!(is_hex("AABB00"));
        assert!(!is_hex("aab")); // odd length
        assert!(!is_hex("xyz1"));
        assert!(!is_hex(""));
    }

    #[test]
    fn decode_value_hex_vs_utf8() {
        assert_eq!(decode_value("aabb"), vec![0xaa, 0xbb]);
        assert_eq!(decode_value("1:2:3"), b"1:2:3".to_vec());
    }

    #[test]
    fn minute_key_format() {
        let t = Utc.with_ymd_and_hms(2024, 3, 7, 9, 5, 59).unwrap();
        assert_eq!(minute_key(t), "202403070905");
    }

    #[test]
    fn hmac_window_accepts_adjacent_minutes_only() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 7, 9, 5, 10).unwrap();
        let mac = update_hmac(KEY, ADDR, URI, t0).unwrap();

        // exact minute
        assert!(verify_update_hmac(KEY, ADDR, URI, &mac, t0));
        // one minute either side
        assert!(verify_update_hmac(KEY, ADDR, URI, &mac, t0 + Duration::minutes(1)));
        assert!(verify_update_hmac(KEY, ADDR, URI, &mac, t0 - Duration::minutes(1)));
        // two minutes out is rejected
        assert!(!verify_update_hmac(KEY, ADDR, URI, &mac, t0 + Duration::minutes(2)));
        assert!(!verify_update_hmac(KEY, ADDR, URI, &mac, t0 - Duration::minutes(2)));
    }

    #[test]
    fn hmac_binds_addr_and_uri() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 7, 9, 5, 10).unwrap();
        let mac = update_hmac(KEY, ADDR, URI, t0).unwrap();
        assert!(!verify_update_hmac(KEY, ADDR, "http://1.2.3.4", &mac, t0));
        assert!(!verify_update_hmac(
            KEY,
            "0x0000000000000000000000000000000000000000",
            URI,
            &mac,
            t0
        ));
    }
}
