//! Plaintext key record layout.
//!
//! ```text
//! [ 4 bytes: private key length, little-endian u32 ][ private key ][ public key ]
//! ```
//!
//! The public key takes whatever remains after the private key. The whole
//! record is sealed before it reaches storage; this module only deals in
//! plaintext and hands every buffer back in a [`Zeroizing`] wrapper.

use thiserror::Error;
use zeroize::Zeroizing;

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("key record truncated: {0} bytes")]
    Truncated(usize),

    #[error("key record declares a {declared}-byte private key but holds {available} bytes")]
    LengthOutOfBounds { declared: usize, available: usize },

    #[error("key record has an empty private or public key")]
    EmptyKey,
}

/// Serialize a keypair into the record layout.
pub fn encode(private_key: &[u8], public_key: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut record = Zeroizing::new(Vec::with_capacity(
        LENGTH_PREFIX + private_key.len() + public_key.len(),
    ));
    record.extend_from_slice(&(private_key.len() as u32).to_le_bytes());
    record.extend_from_slice(private_key);
    record.extend_from_slice(public_key);
    record
}

/// Split a record back into `(private, public)`.
pub fn decode(record: &[u8]) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>), RecordError> {
    if record.len() < LENGTH_PREFIX {
        return Err(RecordError::Truncated(record.len()));
    }
    let (prefix, rest) = record.split_at(LENGTH_PREFIX);
    let mut len_bytes = [0u8; LENGTH_PREFIX];
    len_bytes.copy_from_slice(prefix);
    let declared = u32::from_le_bytes(len_bytes) as usize;

    if declared > rest.len() {
        return Err(RecordError::LengthOutOfBounds {
            declared,
            available: rest.len(),
        });
    }
    let (private_key, public_key) = rest.split_at(declared);
    if private_key.is_empty() || public_key.is_empty() {
        return Err(RecordError::EmptyKey);
    }
    Ok((Zeroizing::new(private_key.to_vec()), public_key.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let record = encode(&[0xAA; 32], &[0xBB; 32]);
        assert_eq!(record.len(), 68);
        assert_eq!(&record[..4], &[32, 0, 0, 0]);
        assert_eq!(&record[4..36], &[0xAA; 32]);
        assert_eq!(&record[36..], &[0xBB; 32]);
    }

    #[test]
    fn test_decode_recovers_both_halves() {
        let record = encode(&[1, 2, 3], &[4, 5]);
        let (private_key, public_key) = decode(&record).unwrap();
        assert_eq!(private_key.as_slice(), &[1, 2, 3]);
        assert_eq!(public_key, vec![4, 5]);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert_eq!(decode(&[1, 0]), Err(RecordError::Truncated(2)));
        assert_eq!(
            decode(&[200, 0, 0, 0, 1, 2]),
            Err(RecordError::LengthOutOfBounds {
                declared: 200,
                available: 2
            })
        );
        assert_eq!(decode(&[2, 0, 0, 0, 1, 2]), Err(RecordError::EmptyKey));
        assert_eq!(decode(&[0, 0, 0, 0, 1, 2]), Err(RecordError::EmptyKey));
    }
}
