//! Unsigned base-128 varints, as used by every STP/1 record.
//!
//! Each byte carries 7 value bits, least significant group first.  The high bit is set iff
//! another byte follows.  Zero encodes as the single byte `0x00`.
//!
//! Decoding works over a streaming buffer: running out of bytes is not an error, it is reported
//! as `Ok(None)` so the caller can wait for the next read and try again from the same cursor.
//!
//! ```
//! use scopekeeper_internal::varint;
//!
//! let bytes = varint::encode(300);
//! assert_eq!(bytes, vec![0xac, 0x02]);
//! assert_eq!(varint::decode(&bytes, 0), Ok(Some((300, 2))));
//! // a truncated varint asks for more data
//! assert_eq!(varint::decode(&bytes[..1], 0), Ok(None));
//! ```

use unsigned_varint::{decode as uvi_decode, encode as uvi_encode};

/// The longest encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Errors produced while decoding a varint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VarintError {
    /// More than ten bytes, a tenth byte that would overflow 64 bits, or a non-minimal encoding.
    #[error("malformed varint")]
    MalformedVarint,
}

/// Encodes `value` into a fresh buffer.
pub fn encode(value: u64) -> Vec<u8> {
    uvi_encode::u64(value, &mut uvi_encode::u64_buffer()).to_vec()
}

/// Appends the encoding of `value` to `out`.
pub fn encode_into(value: u64, out: &mut Vec<u8>) {
    out.extend_from_slice(uvi_encode::u64(value, &mut uvi_encode::u64_buffer()));
}

/// Decodes one varint starting at `cursor`.
///
/// Returns `Ok(Some((value, new_cursor)))` on success, `Ok(None)` if the buffer ends before the
/// varint does, and `Err(MalformedVarint)` if the encoding runs past ten bytes or overflows.
pub fn decode(buf: &[u8], cursor: usize) -> Result<Option<(u64, usize)>, VarintError> {
    let input = buf.get(cursor..).unwrap_or_default();
    match uvi_decode::u64(input) {
        Ok((value, rest)) => {
            let len = input.len() - rest.len();
            // the tenth byte only has room for the top bit of a u64
            if len == MAX_VARINT_LEN && input[len - 1] > 1 {
                return Err(VarintError::MalformedVarint);
            }
            Ok(Some((value, cursor + len)))
        }
        Err(uvi_decode::Error::Insufficient) => Ok(None),
        Err(_) => Err(VarintError::MalformedVarint),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded_len(value: u64) -> usize {
        let bits = 64 - value.leading_zeros() as usize;
        bits.div_ceil(7).max(1)
    }

    const SAMPLES: &[u64] = &[
        0,
        1,
        127,
        128,
        255,
        300,
        16_383,
        16_384,
        u32::MAX as u64,
        1 << 35,
        (1 << 56) - 1,
        1 << 63,
        u64::MAX,
    ];

    #[test]
    fn zero_is_one_byte() {
        assert_eq!(encode(0), vec![0x00]);
        assert_eq!(encoded_len(0), 1);
    }

    #[test]
    fn known_encodings() {
        assert_eq!(encode(1), vec![0x01]);
        assert_eq!(encode(127), vec![0x7f]);
        assert_eq!(encode(128), vec![0x80, 0x01]);
        assert_eq!(encode(300), vec![0xac, 0x02]);
        assert_eq!(encode(u64::MAX).len(), MAX_VARINT_LEN);
        assert_eq!(*encode(u64::MAX).last().unwrap(), 0x01);
    }

    #[test]
    fn round_trip() {
        for &value in SAMPLES {
            let bytes = encode(value);
            assert_eq!(bytes.len(), encoded_len(value), "length of {value}");
            assert_eq!(decode(&bytes, 0), Ok(Some((value, bytes.len()))));
        }
    }

    #[test]
    fn every_prefix_needs_more_data() {
        for &value in SAMPLES {
            let bytes = encode(value);
            for cut in 0..bytes.len() {
                assert_eq!(decode(&bytes[..cut], 0), Ok(None), "{value} cut at {cut}");
            }
        }
    }

    #[test]
    fn split_reads_match_whole_reads() {
        for &value in SAMPLES {
            let bytes = encode(value);
            for cut in 0..=bytes.len() {
                let mut stream = bytes[..cut].to_vec();
                let first = decode(&stream, 0).unwrap();
                if cut < bytes.len() {
                    assert_eq!(first, None);
                }
                stream.extend_from_slice(&bytes[cut..]);
                assert_eq!(decode(&stream, 0), Ok(Some((value, bytes.len()))));
            }
        }
    }

    #[test]
    fn decodes_from_cursor() {
        let mut bytes = vec![0xff, 0xff];
        bytes.extend(encode(300));
        bytes.push(0x05);
        assert_eq!(decode(&bytes, 2), Ok(Some((300, 4))));
        assert_eq!(decode(&bytes, 4), Ok(Some((5, 5))));
        assert_eq!(decode(&bytes, 5), Ok(None));
    }

    #[test]
    fn too_many_continuation_bytes() {
        let bytes = [0xff; 11];
        assert_eq!(decode(&bytes, 0), Err(VarintError::MalformedVarint));
        let mut ten = vec![0x80; 9];
        ten.push(0x02);
        assert_eq!(decode(&ten, 0), Err(VarintError::MalformedVarint));
    }

    #[test]
    fn padded_encoding_is_rejected() {
        assert_eq!(decode(&[0x80, 0x00], 0), Err(VarintError::MalformedVarint));
        assert_eq!(decode(&[0x00], 0), Ok(Some((0, 1))));
    }

    #[test]
    fn cursor_past_the_end_needs_more_data() {
        assert_eq!(decode(&[0x01], 3), Ok(None));
    }
}
