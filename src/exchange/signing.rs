//! Request signing.
//!
//! Every function here is pure: output depends only on the secret, the
//! canonicalized request content and the timestamp passed in.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};

/// Join parameters as `k=v&k=v` in the given order, URL-encoding values.
pub fn canonical_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// HMAC-SHA256, hex encoded (Binance).
pub fn hmac_sha256_hex(secret: &str, payload: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// HMAC-SHA512, hex encoded (Gate.io).
pub fn hmac_sha512_hex(secret: &str, payload: &str) -> String {
    let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Plain SHA-512 of a request body, hex encoded.
pub fn sha512_hex(body: &str) -> String {
    hex::encode(Sha512::digest(body.as_bytes()))
}

/// Gate.io v4 signature string.
pub fn gate_sign_payload(
    method: &str,
    path: &str,
    query: &str,
    body: &str,
    timestamp_secs: i64,
) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}",
        method.to_ascii_uppercase(),
        path,
        query,
        sha512_hex(body),
        timestamp_secs
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binance_reference_signature() {
        // Example from the Binance API documentation.
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let payload = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            hmac_sha256_hex(secret, payload),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_signing_is_deterministic() {
        let a = hmac_sha512_hex("secret", "payload");
        let b = hmac_sha512_hex("secret", "payload");
        assert_eq!(a, b);
        assert_eq!(a.len(), 128);
        assert_ne!(a, hmac_sha512_hex("secret", "payload2"));
    }

    #[test]
    fn test_canonical_query_encodes_values() {
        let q = canonical_query(&[
            ("symbol", "BTCUSDT".to_string()),
            ("newClientOrderId", "a b/c".to_string()),
        ]);
        assert_eq!(q, "symbol=BTCUSDT&newClientOrderId=a%20b%2Fc");
    }

    #[test]
    fn test_gate_payload_layout() {
        let payload = gate_sign_payload("post", "/api/v4/spot/orders", "", "{}", 1700000000);
        let lines: Vec<&str> = payload.split('\n').collect();
        assert_eq!(lines[0], "POST");
        assert_eq!(lines[1], "/api/v4/spot/orders");
        assert_eq!(lines[2], "");
        assert_eq!(lines[3], sha512_hex("{}"));
        assert_eq!(lines[4], "1700000000");
    }
}
