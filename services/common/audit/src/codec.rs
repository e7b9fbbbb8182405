use crate::{AuditRecord, DecodeError};

/// Decode one queued payload. Pure; a failure only concerns this payload.
pub fn decode(payload: &[u8]) -> Result<AuditRecord, DecodeError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Empty);
    }
    serde_json::from_slice(payload).map_err(|e| DecodeError::Malformed(e.to_string()))
}

/// Encode a record the way the authorization server enqueues it.
pub fn encode(record: &AuditRecord) -> Vec<u8> {
    // Only string and integer fields; serialization cannot fail.
    serde_json::to_vec(record).unwrap_or_default()
}

/// Decode a snapshot, keeping source order and dropping payloads that do not
/// decode. Returns the records and the number of payloads dropped.
pub fn decode_batch<I, P>(payloads: I) -> (Vec<AuditRecord>, usize)
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    let mut records = Vec::new();
    let mut dropped = 0;
    for (index, payload) in payloads.into_iter().enumerate() {
        match decode(payload.as_ref()) {
            Ok(record) => records.push(record),
            Err(err) => {
                dropped += 1;
                tracing::warn!(index, error = %err, "dropping undecodable audit payload");
            }
        }
    }
    (records, dropped)
}
