//! s16le chunk handling between the decoder pipe and the output.

/// Gain factor for a 0..=100 volume percentage.
pub fn gain_for_volume(percent: u8) -> f32 {
    (percent.min(100) as f32 / 100.0).clamp(0.0, 1.0)
}

/// Scale one sample, truncating toward zero and saturating at the i16 range.
pub fn scale_sample(sample: i16, gain: f32) -> i16 {
    let scaled = (sample as f32 * gain) as i32;
    scaled.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

/// Reassembles little-endian i16 samples from arbitrarily sized byte reads.
///
/// Pipe reads may split a sample across two chunks; the odd byte is carried
/// over to the next call.
#[derive(Debug, Default)]
pub struct SampleAssembler {
    carry: Option<u8>,
}

impl SampleAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `bytes` into `out` (cleared first), applying `gain`, or writing
    /// silence of the same length when `muted`.
    pub fn convert(&mut self, bytes: &[u8], gain: f32, muted: bool, out: &mut Vec<i16>) {
        out.clear();
        let mut rest = bytes;
        if let Some(lo) = self.carry.take() {
            match rest.split_first() {
                Some((hi, tail)) => {
                    out.push(i16::from_le_bytes([lo, *hi]));
                    rest = tail;
                }
                None => {
                    self.carry = Some(lo);
                    return;
                }
            }
        }

        let mut pairs = rest.chunks_exact(2);
        for pair in &mut pairs {
            out.push(i16::from_le_bytes([pair[0], pair[1]]));
        }
        if let [odd] = pairs.remainder() {
            self.carry = Some(*odd);
        }

        if muted {
            out.fill(0);
        } else if gain < 1.0 {
            for s in out.iter_mut() {
                *s = scale_sample(*s, gain);
            }
        }
    }
}
