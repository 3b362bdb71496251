//! Checksummed record codec.
//!
//! Each persisted value is a [`StoredRecord`]: a format version, the
//! prost-encoded payload, and the SHA-256 of that payload. A record whose
//! checksum does not match is refused on load.

use prost::Message;
use sha2::{Digest, Sha256};
use vigil_session::{ContestConfig, Session};
use vigil_wire::{ConfigProto, SessionProto, StoredRecord};

use crate::StoreError;

/// Current record format version.
pub const RECORD_FORMAT_VERSION: u32 = 1;

fn seal(payload: Vec<u8>) -> Vec<u8> {
    let checksum = Sha256::digest(&payload).to_vec();
    StoredRecord {
        format_version: RECORD_FORMAT_VERSION,
        payload,
        checksum,
    }
    .encode_to_vec()
}

fn open(bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
    let record = StoredRecord::decode(bytes)?;
    if record.format_version != RECORD_FORMAT_VERSION {
        return Err(StoreError::UnsupportedVersion(record.format_version));
    }
    let actual = Sha256::digest(&record.payload);
    if actual.as_slice() != record.checksum.as_slice() {
        return Err(StoreError::ChecksumMismatch);
    }
    Ok(record.payload)
}

pub fn encode_session(session: &Session) -> Vec<u8> {
    seal(SessionProto::from(session).encode_to_vec())
}

pub fn decode_session(bytes: &[u8]) -> Result<Session, StoreError> {
    let payload = open(bytes)?;
    let proto = SessionProto::decode(payload.as_slice())?;
    Ok(Session::try_from(proto)?)
}

pub fn encode_config(config: &ContestConfig) -> Vec<u8> {
    seal(ConfigProto::from(config).encode_to_vec())
}

pub fn decode_config(bytes: &[u8]) -> Result<ContestConfig, StoreError> {
    let payload = open(bytes)?;
    let proto = ConfigProto::decode(payload.as_slice())?;
    Ok(ContestConfig::try_from(proto)?)
}
