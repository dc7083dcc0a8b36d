//! Capture post filter (speech super resolution).
//!
//! When a filter is enabled the read step lands PCM in a side ring and the
//! filter moves it into the capture ring, usually at a higher rate. The
//! shipped [`LinearUpsampler`] is a plain interpolating stand-in with the
//! same shape as a model-based filter: 8 kHz or 16 kHz in, 24 kHz out.

use tracing::debug;

use crate::codec::HfpCodec;
use crate::ring::ByteRing;

/// Output rate of the speech post filter.
pub const POST_FILTER_OUTPUT_RATE: u32 = 24000;

/// Filter between the side ring and the capture ring.
pub trait SpeechPostFilter: Send {
    // ---
    fn input_rate(&self) -> u32;

    fn output_rate(&self) -> u32;

    /// Consumes what it can from `input` and appends the result to
    /// `output`. Returns bytes appended.
    fn process(&mut self, input: &mut ByteRing, output: &mut ByteRing) -> usize;
}

/// Streaming linear-interpolation upsampler over 16-bit mono PCM.
#[derive(Debug, Clone)]
pub struct LinearUpsampler {
    // ---
    from_rate: u32,
    to_rate: u32,
    // Rates reduced by their gcd; positions are counted in 1/to units.
    step: u32,
    span: u32,
    phase: u32,
    prev: i16,
}

impl LinearUpsampler {
    // ---
    /// Upsampler from the codec's rate to [`POST_FILTER_OUTPUT_RATE`].
    pub fn for_codec(codec: HfpCodec) -> Self {
        Self::new(codec.sample_rate(), POST_FILTER_OUTPUT_RATE)
    }

    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        // ---
        assert!(from_rate > 0 && to_rate >= from_rate, "upsampler only");
        let g = gcd(from_rate, to_rate);
        let step = from_rate / g;
        Self {
            from_rate,
            to_rate,
            step,
            span: to_rate / g,
            phase: step,
            prev: 0,
        }
    }

    /// Most output samples one input sample can produce.
    fn max_out_per_in(&self) -> usize {
        self.span.div_ceil(self.step) as usize
    }
}

impl SpeechPostFilter for LinearUpsampler {
    // ---
    fn input_rate(&self) -> u32 {
        self.from_rate
    }

    fn output_rate(&self) -> u32 {
        self.to_rate
    }

    fn process(&mut self, input: &mut ByteRing, output: &mut ByteRing) -> usize {
        // ---
        let need = self.max_out_per_in() * 2;
        let mut produced = 0;
        let mut sample = [0u8; 2];

        while input.queued() >= 2 && output.available() >= need {
            input.read(&mut sample);
            let cur = i16::from_le_bytes(sample);

            // Emit every output instant in (prev, cur].
            while self.phase <= self.span {
                let s0 = i64::from(self.prev);
                let s1 = i64::from(cur);
                let interpolated =
                    (s0 + (s1 - s0) * i64::from(self.phase) / i64::from(self.span)) as i16;
                produced += output.write(&interpolated.to_le_bytes());
                self.phase += self.step;
            }
            self.phase -= self.span;
            self.prev = cur;
        }

        if produced > 0 {
            debug!(produced, left = input.queued(), "post filter pass");
        }
        produced
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    // ---
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn pcm(samples: &[i16]) -> ByteRing {
        // ---
        let mut ring = ByteRing::new(1024);
        for s in samples {
            ring.write(&s.to_le_bytes());
        }
        ring
    }

    fn drain(ring: &mut ByteRing) -> Vec<i16> {
        // ---
        let mut bytes = vec![0u8; ring.queued()];
        ring.read(&mut bytes);
        bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn narrowband_triples_rate() {
        // ---
        let mut up = LinearUpsampler::for_codec(HfpCodec::Cvsd);
        let mut input = pcm(&[300, 600]);
        let mut output = ByteRing::new(1024);

        assert_eq!(up.process(&mut input, &mut output), 12);
        assert_eq!(drain(&mut output), vec![100, 200, 300, 400, 500, 600]);
        assert!(input.is_empty());
    }

    #[test]
    fn wideband_is_three_halves() {
        // ---
        let mut up = LinearUpsampler::for_codec(HfpCodec::Msbc);
        let mut input = pcm(&[0; 120]);
        let mut output = ByteRing::new(4096);

        assert_eq!(up.process(&mut input, &mut output), 180 * 2);
    }

    #[test]
    fn stops_when_output_is_full() {
        // ---
        let mut up = LinearUpsampler::new(8000, 24000);
        let mut input = pcm(&[1; 10]);
        let mut output = ByteRing::new(16);

        assert_eq!(up.process(&mut input, &mut output), 12);
        assert_eq!(input.queued(), 16);
    }
}
