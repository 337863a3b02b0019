//! 16-bit little-endian PCM helpers.

/// Serialise `samples` as little-endian bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Decode little-endian 16-bit samples into `out`, returning how many were written.
///
/// Stops at whichever runs out first; an odd trailing byte is ignored.
pub fn bytes_to_samples_into(bytes: &[u8], out: &mut [i16]) -> usize {
    let mut written = 0;
    for (slot, pair) in out.iter_mut().zip(bytes.chunks_exact(2)) {
        *slot = i16::from_le_bytes([pair[0], pair[1]]);
        written += 1;
    }
    written
}

/// Convert a 16-bit sample to f32 in [-1.0, 1.0).
#[inline]
pub fn sample_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Convert an f32 sample to 16-bit, clamping out-of-range values.
#[inline]
pub fn f32_to_sample(value: f32) -> i16 {
    (value.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_little_endian() {
        assert_eq!(samples_to_bytes(&[0x0102, -1]), vec![0x02, 0x01, 0xff, 0xff]);
    }

    #[test]
    fn odd_trailing_byte_is_ignored() {
        let mut out = [0i16; 4];
        let n = bytes_to_samples_into(&[0x10, 0x00, 0x20, 0x00, 0x7f], &mut out);
        assert_eq!(n, 2);
        assert_eq!(&out[..2], &[16, 32]);
    }

    #[test]
    fn decode_stops_when_output_is_full() {
        let mut out = [0i16; 1];
        assert_eq!(bytes_to_samples_into(&[1, 0, 2, 0], &mut out), 1);
        assert_eq!(out[0], 1);
    }

    #[test]
    fn float_conversion_clamps() {
        assert_eq!(f32_to_sample(2.0), i16::MAX);
        assert_eq!(f32_to_sample(-2.0), -i16::MAX);
        assert!((sample_to_f32(16384) - 0.5).abs() < 1e-6);
    }
}
