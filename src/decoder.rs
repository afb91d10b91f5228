//! Secret decoder (C2): a pure `decode(bytes, key) -> DataEntry` function.
//!
//! No I/O, no state — every record file handed to [`decode`] is an
//! AES-256-GCM envelope wrapping a BSON document, the way `crypto.rs`
//! wraps ciphertext for on-disk secrets, except the plaintext here is BSON
//! rather than JSON and the envelope itself is binary: 12 nonce bytes
//! followed directly by the AEAD ciphertext, matching the `*.json.bson`
//! spool file's own framing rather than the JSON-wrapped envelope used
//! elsewhere.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use bson::Bson;

use crate::error::DecodeFailure;

const NONCE_SIZE: usize = 12;

/// A decoded spool record, with the fields the ingest pipeline cares about.
///
/// Unknown fields present in the source document are discarded (§4.2).
#[derive(Debug, Clone, PartialEq)]
pub struct DataEntry {
    pub id: String,
    pub cctv_id: i64,
    pub device_id: String,
    pub device_timestamp: String,
    /// Unix epoch seconds, matching the outbound payload's `float` field
    /// (§6) rather than an RFC3339 string.
    pub device_timestamp_utc: f64,
    pub in_count: i64,
    pub out_count: i64,
    pub start_time: String,
    pub sync_status: bool,
}

/// Decrypt and decode a spool record file's contents.
///
/// `bytes` is the raw file contents: a 12-byte nonce followed by the
/// AES-256-GCM ciphertext. The key is supplied by the caller at ingest
/// construction time, from process configuration — this function never
/// reads configuration or touches the filesystem itself.
pub fn decode(bytes: &[u8], key: &[u8; 32]) -> Result<DataEntry, DecodeFailure> {
    let plaintext = decrypt(bytes, key)?;
    parse_record(&plaintext)
}

fn decrypt(bytes: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, DecodeFailure> {
    if bytes.len() < NONCE_SIZE {
        return Err(DecodeFailure::Decrypt(format!(
            "envelope too short: {} bytes",
            bytes.len()
        )));
    }
    let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| DecodeFailure::Decrypt(format!("invalid key: {e}")))?;

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| DecodeFailure::Decrypt("authentication failed".to_string()))
}

fn parse_record(plaintext: &[u8]) -> Result<DataEntry, DecodeFailure> {
    let doc = bson::from_slice::<bson::Document>(plaintext)
        .map_err(|e| DecodeFailure::Decode(format!("not a valid BSON document: {e}")))?;

    let id = required_string(&doc, "id")?;
    let cctv_id = optional_int(&doc, "cctv_id");
    let device_id = required_string(&doc, "device_id")?;
    let device_timestamp = optional_string(&doc, "device_timestamp");
    let device_timestamp_utc = doc
        .get("device_timestamp_utc")
        .and_then(bson_to_epoch_seconds)
        .unwrap_or(0.0);
    let in_count = optional_int(&doc, "in_count");
    let out_count = optional_int(&doc, "out_count");
    let start_time = optional_string(&doc, "start_time");
    let sync_status = doc.get_bool("sync_status").unwrap_or(false);

    Ok(DataEntry {
        id,
        cctv_id,
        device_id,
        device_timestamp,
        device_timestamp_utc,
        in_count,
        out_count,
        start_time,
        sync_status,
    })
}

fn required_string(doc: &bson::Document, field: &str) -> Result<String, DecodeFailure> {
    doc.get_str(field)
        .map(str::to_string)
        .map_err(|_| DecodeFailure::Decode(format!("missing or non-string field `{field}`")))
}

fn optional_string(doc: &bson::Document, field: &str) -> String {
    doc.get_str(field).unwrap_or_default().to_string()
}

fn optional_int(doc: &bson::Document, field: &str) -> i64 {
    match doc.get(field) {
        Some(Bson::Int32(n)) => *n as i64,
        Some(Bson::Int64(n)) => *n,
        Some(Bson::Double(n)) => *n as i64,
        _ => 0,
    }
}

fn bson_to_epoch_seconds(value: &Bson) -> Option<f64> {
    match value {
        Bson::Double(n) => Some(*n),
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::DateTime(dt) => Some(dt.timestamp_millis() as f64 / 1000.0),
        Bson::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis() as f64 / 1000.0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use rand::RngCore;

    fn seal(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
        let cipher = Aes256Gcm::new_from_slice(key).unwrap();
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher.encrypt(nonce, plaintext).unwrap();
        [nonce_bytes.to_vec(), ciphertext].concat()
    }

    #[test]
    fn decodes_a_well_formed_record() {
        let key = [9u8; 32];
        let document = doc! {
            "id": "evt-1",
            "cctv_id": 7i32,
            "device_id": "dev-42",
            "device_timestamp": "2024-01-15T08:00:00",
            "in_count": 3i32,
            "out_count": 1i32,
            "start_time": "2024-01-15T07:55:00",
            "sync_status": true,
        };
        let plaintext = bson::to_vec(&document).unwrap();
        let envelope = seal(&key, &plaintext);

        let entry = decode(&envelope, &key).unwrap();
        assert_eq!(entry.id, "evt-1");
        assert_eq!(entry.device_id, "dev-42");
        assert_eq!(entry.in_count, 3);
        assert_eq!(entry.out_count, 1);
        assert_eq!(entry.cctv_id, 7);
        assert!(entry.sync_status);
    }

    #[test]
    fn unknown_fields_are_discarded() {
        let key = [3u8; 32];
        let document = doc! {
            "id": "evt-2",
            "device_id": "dev-1",
            "some_future_field": "irrelevant",
        };
        let plaintext = bson::to_vec(&document).unwrap();
        let envelope = seal(&key, &plaintext);

        let entry = decode(&envelope, &key).unwrap();
        assert_eq!(entry.id, "evt-2");
        assert_eq!(entry.cctv_id, 0);
    }

    #[test]
    fn wrong_key_is_a_decrypt_failure() {
        let key = [1u8; 32];
        let wrong_key = [2u8; 32];
        let document = doc! { "id": "evt-3", "device_id": "dev-1" };
        let plaintext = bson::to_vec(&document).unwrap();
        let envelope = seal(&key, &plaintext);

        let err = decode(&envelope, &wrong_key).unwrap_err();
        assert!(matches!(err, DecodeFailure::Decrypt(_)));
    }

    #[test]
    fn missing_required_field_is_a_decode_failure() {
        let key = [5u8; 32];
        let document = doc! { "device_id": "dev-1" };
        let plaintext = bson::to_vec(&document).unwrap();
        let envelope = seal(&key, &plaintext);

        let err = decode(&envelope, &key).unwrap_err();
        assert!(matches!(err, DecodeFailure::Decode(_)));
    }

    #[test]
    fn truncated_envelope_is_a_decrypt_failure() {
        let key = [6u8; 32];
        let err = decode(&[1, 2, 3], &key).unwrap_err();
        assert!(matches!(err, DecodeFailure::Decrypt(_)));
    }
}
