//! Wire encoding for stored embeddings.
//!
//! The backend keeps `vector_embedding` as a base64 string wrapping a packed
//! little-endian `f32` array.

use base64::{engine::general_purpose::STANDARD, Engine as _};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Base64: {0:?}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload of {0} bytes is not a whole number of f32 values")]
    Misaligned(usize),

    #[error("empty embedding")]
    Empty,
}

/// Encode a vector the way the backend stores it.
pub fn encode_vector(vector: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    STANDARD.encode(bytes)
}

/// Decode a backend `vector_embedding` string into floats.
pub fn decode_vector(encoded: &str) -> Result<Vec<f32>, CodecError> {
    let bytes = STANDARD.decode(encoded.trim())?;

    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }
    if bytes.len() % 4 != 0 {
        return Err(CodecError::Misaligned(bytes.len()));
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    #[test]
    fn test_round_trip_is_bit_exact() {
        let original = vec![
            0.0f32,
            -0.0,
            1.0,
            -1.5,
            f32::MIN_POSITIVE,
            f32::MAX,
            std::f32::consts::PI,
            1.0e-40, // subnormal
        ];

        let decoded = decode_vector(&encode_vector(&original)).unwrap();

        assert_eq!(decoded.len(), original.len());
        for (a, b) in original.iter().zip(decoded.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_decode_known_bytes() {
        // 1.0f32 LE = 00 00 80 3F
        let encoded = STANDARD.encode([0x00, 0x00, 0x80, 0x3F]);
        assert_eq!(decode_vector(&encoded).unwrap(), vec![1.0]);
    }

    #[test]
    fn test_decode_rejects_misaligned_payload() {
        let encoded = STANDARD.encode([1u8, 2, 3]);
        assert!(matches!(
            decode_vector(&encoded),
            Err(CodecError::Misaligned(3))
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_vector("not base64!!"),
            Err(CodecError::Base64(_))
        ));
        assert!(matches!(decode_vector(""), Err(CodecError::Empty)));
    }
}
