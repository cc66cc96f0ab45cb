//! Request signing and response decryption for the JM app api.
//!
//! Every request carries `token = md5hex(timestamp + secret)` and
//! `tokenparam = "{timestamp},{app_version}"`. Response payloads are
//! `base64(AES-256-ECB(json))`, keyed with the ascii bytes of
//! `md5hex(timestamp + data_secret)`.

use aes::Aes256;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, block_padding::Pkcs7};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use log::{debug, trace};
use serde::de::DeserializeOwned;

use crate::api::hosts::normalize_host;
use crate::errors::{JmError, Result};

type Aes256EcbDec = ecb::Decryptor<Aes256>;
type Aes256EcbEnc = ecb::Encryptor<Aes256>;

pub fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// The `token` and `tokenparam` headers of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeaders {
    pub token: String,
    pub tokenparam: String,
}

impl AuthHeaders {
    pub fn new(timestamp: i64, secret: &str, app_version: &str) -> Self {
        Self {
            token: md5_hex(&format!("{timestamp}{secret}")),
            tokenparam: format!("{timestamp},{app_version}"),
        }
    }
}

/// Decrypts a payload into text.
///
/// `key_prefix` is the request timestamp for api payloads and empty for
/// the host directory. Anything that doesn't decrypt cleanly is reported
/// as [`JmError::PayloadNotFound`]; the api answers unknown ids with junk.
pub fn decrypt_text(data_b64: &str, key_prefix: &str, secret: &str) -> Result<String> {
    let key = md5_hex(&format!("{key_prefix}{secret}")).into_bytes();

    let mut ciphertext = STANDARD.decode(data_b64.trim()).map_err(|e| {
        debug!("payload isn't base64: {e}");
        JmError::PayloadNotFound
    })?;

    if ciphertext.is_empty() {
        return Err(JmError::PayloadNotFound);
    }

    let cipher = Aes256EcbDec::new_from_slice(&key).map_err(|_| JmError::PayloadNotFound)?;
    let plaintext = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut ciphertext)
        .map_err(|e| {
            debug!("payload didn't decrypt: {e}");
            JmError::PayloadNotFound
        })?;

    String::from_utf8(plaintext.to_vec()).map_err(|_| JmError::PayloadNotFound)
}

/// Decrypts an api payload and parses it as JSON.
pub fn decrypt_payload<T: DeserializeOwned>(data_b64: &str, timestamp: i64, secret: &str) -> Result<T> {
    let text = decrypt_text(data_b64, &timestamp.to_string(), secret)?;
    trace!("decrypted payload: {text}");

    serde_json::from_str(&text).map_err(|e| {
        debug!("decrypted payload isn't the expected json: {e}");
        JmError::PayloadNotFound
    })
}

/// The inverse of [`decrypt_text`].
///
/// The client never needs this; it exists so fixtures can be built the way
/// the api builds its responses.
pub fn encrypt_text(plaintext: &str, key_prefix: &str, secret: &str) -> String {
    let key = md5_hex(&format!("{key_prefix}{secret}")).into_bytes();
    let cipher = Aes256EcbEnc::new_from_slice(&key).expect("md5 hex is always 32 bytes");

    let msg_len = plaintext.len();
    let mut buf = vec![0u8; msg_len + 16];
    buf[..msg_len].copy_from_slice(plaintext.as_bytes());

    let ciphertext = cipher
        .encrypt_padded_mut::<Pkcs7>(&mut buf, msg_len)
        .expect("buffer has room for a full padding block");

    STANDARD.encode(ciphertext)
}

/// Decodes the host directory into a list of normalised api base urls.
///
/// Failures here get their own error kind so a change in the directory's
/// format can't be mistaken for a missing album.
pub fn decode_host_directory(body: &str, secret: &str) -> Result<Vec<String>> {
    // the directory has been seen with a BOM and stray non-ascii in front
    let cleaned = body.trim_start_matches(|c: char| !c.is_ascii()).trim();

    let text = decrypt_text(cleaned, "", secret)
        .map_err(|_| JmError::HostDirectory("payload didn't decrypt".into()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| JmError::HostDirectory(format!("payload isn't json: {e}")))?;

    let server = value
        .get("Server")
        .ok_or_else(|| JmError::HostDirectory("missing `Server` field".into()))?;

    let raw: Vec<&str> = match server {
        serde_json::Value::Array(items) => items.iter().filter_map(|v| v.as_str()).collect(),
        serde_json::Value::String(s) => s.split([',', ' ', '\n']).collect(),
        _ => Vec::new(),
    };

    let mut hosts: Vec<String> = Vec::with_capacity(raw.len());
    for host in raw.into_iter().filter_map(normalize_host) {
        if !hosts.contains(&host) {
            hosts.push(host);
        }
    }

    if hosts.is_empty() {
        return Err(JmError::HostDirectory("directory lists no hosts".into()));
    }

    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "185Hcomic3PAPP7R";

    #[test]
    fn auth_headers() {
        let h = AuthHeaders::new(1_700_000_000, "18comicAPP", "1.7.9");

        assert_eq!(h.token, md5_hex("170000000018comicAPP"));
        assert_eq!(h.token.len(), 32);
        assert_eq!(h.tokenparam, "1700000000,1.7.9");
    }

    #[test]
    fn md5_reference() {
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn decrypts_api_payload() {
        let ts = 1_700_000_123;
        let data = encrypt_text(r#"{"name":"abc","id":1}"#, &ts.to_string(), SECRET);

        let v: serde_json::Value = decrypt_payload(&data, ts, SECRET).unwrap();
        assert_eq!(v["name"], "abc");
    }

    #[test]
    fn wrong_timestamp_is_not_found() {
        let data = encrypt_text(r#"{"name":"abc"}"#, "1", SECRET);

        assert!(matches!(
            decrypt_payload::<serde_json::Value>(&data, 2, SECRET),
            Err(JmError::PayloadNotFound)
        ));
    }

    #[test]
    fn empty_and_garbage_are_not_found() {
        for data in ["", "%%%", "aGVsbG8="] {
            assert!(matches!(
                decrypt_payload::<serde_json::Value>(data, 1, SECRET),
                Err(JmError::PayloadNotFound)
            ));
        }
    }

    #[test]
    fn host_directory() {
        let secret = "diosfjckwpqpdfjkvnqQjsik";
        let body = encrypt_text(
            r#"{"Server":["www.a.vip","https://www.b.cc/","www.a.vip"]}"#,
            "",
            secret,
        );

        let hosts = decode_host_directory(&format!("\u{feff}{body}\n"), secret).unwrap();
        assert_eq!(hosts, vec!["https://www.a.vip", "https://www.b.cc"]);
    }

    #[test]
    fn host_directory_errors_are_distinct() {
        let secret = "diosfjckwpqpdfjkvnqQjsik";

        assert!(matches!(
            decode_host_directory("nonsense", secret),
            Err(JmError::HostDirectory(_))
        ));

        let body = encrypt_text(r#"{"Other":[]}"#, "", secret);
        assert!(matches!(
            decode_host_directory(&body, secret),
            Err(JmError::HostDirectory(_))
        ));
    }
}
