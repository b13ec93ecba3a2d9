//! Safety limits — crafted inputs must be rejected, not allocated.

#[cfg(test)]
mod tests {
    use crate::encoding::*;

    #[test]
    fn oversized_byte_length_is_rejected() {
        // Length prefix claims u32::MAX bytes with a 4-byte payload.
        let mut buf = u32::MAX.to_le_bytes().to_vec();
        buf.extend_from_slice(&[1, 2, 3, 4]);
        let err = decode_from_slice::<Vec<u8>>(&buf).unwrap_err();
        assert!(matches!(err, EncodingError::LengthOverflow(_)));
    }

    #[test]
    fn oversized_vec_count_is_rejected() {
        let buf = u32::MAX.to_le_bytes().to_vec();
        let err = decode_vec::<u64>(&buf).unwrap_err();
        assert!(matches!(err, EncodingError::LengthOverflow(_)));
    }

    #[test]
    fn oversized_map_count_is_rejected() {
        let buf = u32::MAX.to_le_bytes().to_vec();
        let err = decode_string_map(&buf).unwrap_err();
        assert!(matches!(err, EncodingError::LengthOverflow(_)));
    }

    #[test]
    fn length_prefix_beyond_buffer_is_eof_not_panic() {
        // Claims 100 bytes, provides 2.
        let mut buf = 100u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[1, 2]);
        let err = decode_from_slice::<Vec<u8>>(&buf).unwrap_err();
        assert!(matches!(err, EncodingError::UnexpectedEof { .. }));
    }
}
