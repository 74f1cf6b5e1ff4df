//! Payload masking (RFC 6455 Section 5.3).

/// Mask or unmask `buf` in place: byte `i` is XORed with `key[i % 4]`.
///
/// Masking is its own inverse, so the same call unmasks.
#[inline]
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    let word = u32::from_ne_bytes(key);
    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let masked = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ word;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }
    // the tail starts at a multiple of 4, so the key lines up again at index 0
    for (byte, k) in chunks.into_remainder().iter_mut().zip(key) {
        *byte ^= k;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply_mask_bytewise(buf: &mut [u8], key: [u8; 4]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte ^= key[i & 3];
        }
    }

    #[test]
    fn test_matches_bytewise_for_all_lengths() {
        let keys = [
            [0x00, 0x00, 0x00, 0x00],
            [0xFF, 0xFF, 0xFF, 0xFF],
            [0x6d, 0xb6, 0xb2, 0x80],
            [0x12, 0x34, 0x56, 0x78],
        ];

        for key in keys {
            for size in 0..=67 {
                let data: Vec<u8> = (0..size).map(|i| (i * 7) as u8).collect();

                let mut expected = data.clone();
                apply_mask_bytewise(&mut expected, key);

                let mut actual = data.clone();
                apply_mask(&mut actual, key);

                assert_eq!(expected, actual, "key {key:?} size {size}");
            }
        }
    }

    #[test]
    fn test_mask_unmask_identity() {
        let key = [0xAA, 0xBB, 0xCC, 0xDD];
        let original = b"Hello, World! This is a test message with various lengths.";

        let mut data = original.to_vec();
        apply_mask(&mut data, key);
        assert_ne!(&data[..], &original[..]);

        apply_mask(&mut data, key);
        assert_eq!(&data[..], &original[..]);
    }

    #[test]
    fn test_mask_short_buffers() {
        let key = [0x12, 0x34, 0x56, 0x78];

        let mut empty: Vec<u8> = vec![];
        apply_mask(&mut empty, key);
        assert!(empty.is_empty());

        let mut three = vec![0xAB, 0xCD, 0xEF];
        apply_mask(&mut three, key);
        assert_eq!(three, vec![0xAB ^ 0x12, 0xCD ^ 0x34, 0xEF ^ 0x56]);
    }

    #[test]
    fn test_mask_unaligned_subslice() {
        let key = [0x01, 0x02, 0x03, 0x04];
        let mut buffer: Vec<u8> = (0..40).collect();
        let original = buffer.clone();

        apply_mask(&mut buffer[3..], key);

        assert_eq!(&buffer[..3], &original[..3]);
        for (i, &byte) in buffer[3..].iter().enumerate() {
            assert_eq!(byte, original[i + 3] ^ key[i % 4], "index {i}");
        }
    }
}
