//! Primitive round-trips and wire-format exactness.

#[cfg(test)]
mod tests {
    use crate::encoding::*;

    fn roundtrip<T: Encode + Decode + PartialEq + std::fmt::Debug>(value: T) {
        let bytes = encode_to_vec(&value).unwrap();
        let (decoded, consumed) = decode_from_slice::<T>(&bytes).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn unsigned_roundtrip() {
        roundtrip(0u8);
        roundtrip(255u8);
        roundtrip(0u32);
        roundtrip(u32::MAX);
        roundtrip(0u64);
        roundtrip(u64::MAX);
    }

    #[test]
    fn signed_roundtrip() {
        roundtrip(0i64);
        roundtrip(i64::MIN);
        roundtrip(i64::MAX);
        roundtrip(-1i64);
    }

    #[test]
    fn float_roundtrip_is_bit_exact() {
        roundtrip(0.0f64);
        roundtrip(-0.0f64);
        roundtrip(std::f64::consts::PI);
        roundtrip(f64::INFINITY);
        roundtrip(f64::NEG_INFINITY);

        // NaN is not PartialEq-comparable; check the bit pattern instead.
        let bytes = encode_to_vec(&f64::NAN).unwrap();
        let (decoded, _) = decode_from_slice::<f64>(&bytes).unwrap();
        assert_eq!(decoded.to_bits(), f64::NAN.to_bits());
    }

    #[test]
    fn integers_are_little_endian() {
        let bytes = encode_to_vec(&0x0102_0304u32).unwrap();
        assert_eq!(bytes, vec![0x04, 0x03, 0x02, 0x01]);

        let bytes = encode_to_vec(&1i64).unwrap();
        assert_eq!(bytes, vec![1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn bool_roundtrip_and_rejection() {
        roundtrip(true);
        roundtrip(false);

        let err = decode_from_slice::<bool>(&[0x02]).unwrap_err();
        assert!(matches!(err, EncodingError::InvalidBool(0x02)));
    }

    #[test]
    fn fixed_array_has_no_length_prefix() {
        let bytes = encode_to_vec(&*b"SSTB").unwrap();
        assert_eq!(bytes, b"SSTB");
        roundtrip(*b"SSTB");
    }

    #[test]
    fn truncated_input_reports_eof() {
        let err = decode_from_slice::<u64>(&[1, 2, 3]).unwrap_err();
        match err {
            EncodingError::UnexpectedEof { needed, available } => {
                assert_eq!(needed, 8);
                assert_eq!(available, 3);
            }
            other => panic!("expected UnexpectedEof, got {other:?}"),
        }
    }
}
