use serde::{Serialize, de::DeserializeOwned};
use serde_cbor::{from_slice, to_vec};
use std::panic::{AssertUnwindSafe, catch_unwind};
use thiserror::Error as ThisError;

///
/// CONSTANTS
///

/// Upper bound on one encoded row.
pub const MAX_ROW_BYTES: usize = 4 * 1024 * 1024;

///
/// SerializeError
///

#[derive(Debug, ThisError)]
pub enum SerializeError {
    #[error("serialize error: {0}")]
    Serialize(String),

    #[error("deserialize error: {0}")]
    Deserialize(String),
}

/// Serialize a value into CBOR bytes.
pub fn serialize<T>(value: &T) -> Result<Vec<u8>, SerializeError>
where
    T: Serialize,
{
    let bytes = to_vec(value).map_err(|e| SerializeError::Serialize(e.to_string()))?;
    if bytes.len() > MAX_ROW_BYTES {
        return Err(SerializeError::Serialize(format!(
            "payload of {} bytes exceeds maximum of {MAX_ROW_BYTES}",
            bytes.len()
        )));
    }

    Ok(bytes)
}

/// Deserialize CBOR bytes produced by [`serialize`].
///
/// Input size is bounded before decode, and a panic inside the decoder is
/// reported as a deserialize error rather than escaping.
pub fn deserialize<T>(bytes: &[u8]) -> Result<T, SerializeError>
where
    T: DeserializeOwned,
{
    if bytes.len() > MAX_ROW_BYTES {
        return Err(SerializeError::Deserialize(
            "payload exceeds maximum allowed size".into(),
        ));
    }

    match catch_unwind(AssertUnwindSafe(|| from_slice(bytes))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(SerializeError::Deserialize(err.to_string())),
        Err(_) => Err(SerializeError::Deserialize(
            "panic during CBOR deserialization".into(),
        )),
    }
}
