//! Packet-loss concealment for wideband capture.
//!
//! Replays the last good block with a gain that drops on every consecutive
//! loss, reaching silence after a handful of frames. When audio comes back
//! the first good block is cross-faded from the concealed signal so the
//! seam does not click.

use crate::codec::{Concealer, MSBC_CODE_SIZE};

const BLOCK_SAMPLES: usize = MSBC_CODE_SIZE / 2;

/// Gain, in percent, lost per consecutive concealed frame.
const ATTENUATION_STEP_PCT: i32 = 20;

/// Samples at the start of a recovered block that blend in.
const CROSSFADE_SAMPLES: usize = 32;

/// Repeat-and-fade concealer.
#[derive(Debug, Clone)]
pub struct FadingConcealer {
    // ---
    history: [i16; BLOCK_SAMPLES],
    consecutive_losses: u32,
}

impl Default for FadingConcealer {
    fn default() -> Self {
        // ---
        Self::new()
    }
}

impl FadingConcealer {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            history: [0; BLOCK_SAMPLES],
            consecutive_losses: 0,
        }
    }

    /// Losses since the last good block.
    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses
    }

    fn gain_pct(losses: u32) -> i32 {
        // ---
        let losses = losses.min(100) as i32;
        (100 - ATTENUATION_STEP_PCT * losses).max(0)
    }
}

impl Concealer for FadingConcealer {
    // ---
    fn handle_bad_frame(&mut self, out: &mut [u8]) -> usize {
        // ---
        self.consecutive_losses = self.consecutive_losses.saturating_add(1);
        let gain = Self::gain_pct(self.consecutive_losses);

        let mut produced = 0;
        for (chunk, &sample) in out.chunks_exact_mut(2).zip(self.history.iter()) {
            let s = (sample as i32 * gain / 100) as i16;
            chunk.copy_from_slice(&s.to_le_bytes());
            produced += 2;
        }
        produced
    }

    fn handle_good_frame(&mut self, pcm: &mut [u8]) {
        // ---
        if self.consecutive_losses > 0 {
            // Continue the concealed signal one more frame and fade out of it.
            let gain = Self::gain_pct(self.consecutive_losses.saturating_add(1));
            let span = CROSSFADE_SAMPLES as i32 + 1;
            for (i, chunk) in pcm
                .chunks_exact_mut(2)
                .take(CROSSFADE_SAMPLES)
                .enumerate()
            {
                let w = i as i32 + 1;
                let good = i16::from_le_bytes([chunk[0], chunk[1]]) as i32;
                let concealed = self.history[i] as i32 * gain / 100;
                let mixed = ((good * w + concealed * (span - w)) / span) as i16;
                chunk.copy_from_slice(&mixed.to_le_bytes());
            }
        }

        for (slot, chunk) in self.history.iter_mut().zip(pcm.chunks_exact(2)) {
            *slot = i16::from_le_bytes([chunk[0], chunk[1]]);
        }
        self.consecutive_losses = 0;
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn block_of(value: i16) -> Vec<u8> {
        // ---
        std::iter::repeat(value.to_le_bytes())
            .take(BLOCK_SAMPLES)
            .flatten()
            .collect()
    }

    fn samples(bytes: &[u8]) -> Vec<i16> {
        // ---
        bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn silence_before_any_history() {
        // ---
        let mut plc = FadingConcealer::new();
        let mut out = vec![0x55u8; MSBC_CODE_SIZE];
        assert_eq!(plc.handle_bad_frame(&mut out), MSBC_CODE_SIZE);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn repeats_with_decaying_gain() {
        // ---
        let mut plc = FadingConcealer::new();
        let mut good = block_of(1000);
        plc.handle_good_frame(&mut good);

        let mut out = vec![0u8; MSBC_CODE_SIZE];
        plc.handle_bad_frame(&mut out);
        assert_eq!(samples(&out)[0], 800);
        plc.handle_bad_frame(&mut out);
        assert_eq!(samples(&out)[0], 600);

        for _ in 0..10 {
            plc.handle_bad_frame(&mut out);
        }
        assert!(samples(&out).iter().all(|&s| s == 0));
        assert_eq!(plc.consecutive_losses(), 12);
    }

    #[test]
    fn recovery_crossfades_then_passes_through() {
        // ---
        let mut plc = FadingConcealer::new();
        plc.handle_good_frame(&mut block_of(0));

        let mut out = vec![0u8; MSBC_CODE_SIZE];
        plc.handle_bad_frame(&mut out);

        let mut good = block_of(3000);
        plc.handle_good_frame(&mut good);
        let s = samples(&good);
        assert!(s[0] < 3000);
        assert_eq!(s[CROSSFADE_SAMPLES], 3000);
        assert_eq!(plc.consecutive_losses(), 0);

        // No losses in between: untouched.
        let mut next = block_of(-42);
        plc.handle_good_frame(&mut next);
        assert!(samples(&next).iter().all(|&x| x == -42));
    }
}
