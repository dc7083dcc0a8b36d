//! Codec and concealment primitives used by the wideband path.
//!
//! The session treats mSBC as a black box with fixed block sizes: 240 bytes
//! of 16-bit mono PCM in, 57 payload bytes out, and the inverse. Whatever
//! implements [`FrameCodec`] and [`Concealer`] is handed in through a
//! [`CodecFactory`] when a wideband call starts.

use crate::error::Result;
use crate::plc::FadingConcealer;

/// PCM bytes in one mSBC block (120 samples, 16-bit mono, 7.5 ms at 16 kHz).
pub const MSBC_CODE_SIZE: usize = 240;

/// Encoded mSBC payload bytes per block.
pub const MSBC_FRAME_LEN: usize = 57;

/// Bytes of H2 header in front of each payload.
pub const MSBC_H2_HEADER_LEN: usize = 2;

/// One framed air packet: H2 header, payload, trailing pad byte.
pub const MSBC_PKT_SIZE: usize = 60;

/// Minimum window the frame scan needs: header plus payload (no pad).
pub const MSBC_FRAME_SIZE: usize = MSBC_H2_HEADER_LEN + MSBC_FRAME_LEN;

/// First byte of every mSBC payload.
pub const MSBC_SYNC_WORD: u8 = 0xAD;

/// Bytes per PCM frame on both directions (16-bit mono).
pub const HFP_FORMAT_BYTES: usize = 2;

/// Audio codec negotiated for the call, with its HFP codec id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HfpCodec {
    // ---
    /// Narrowband, 8 kHz; PCM goes over the air unmodified.
    Cvsd = 1,
    /// Wideband, 16 kHz; mSBC framed with H2 headers.
    Msbc = 2,
}

impl HfpCodec {
    // ---
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        // ---
        match id {
            1 => Some(HfpCodec::Cvsd),
            2 => Some(HfpCodec::Msbc),
            _ => None,
        }
    }

    pub fn is_wideband(self) -> bool {
        self == HfpCodec::Msbc
    }

    /// PCM sample rate carried by this codec.
    pub fn sample_rate(self) -> u32 {
        // ---
        match self {
            HfpCodec::Cvsd => 8000,
            HfpCodec::Msbc => 16000,
        }
    }
}

/// Block codec: one call converts at most one block.
///
/// Both methods return `(consumed, produced)` byte counts. A decoder that
/// cannot make sense of its input returns an error; the session counts that
/// as a lost frame.
pub trait FrameCodec: Send {
    // ---
    fn encode(&mut self, pcm: &[u8], out: &mut [u8]) -> Result<(usize, usize)>;

    fn decode(&mut self, payload: &[u8], pcm: &mut [u8]) -> Result<(usize, usize)>;
}

/// Packet-loss concealment state.
pub trait Concealer: Send {
    // ---
    /// Synthesizes one replacement block into `out` from history. Returns
    /// bytes produced.
    fn handle_bad_frame(&mut self, out: &mut [u8]) -> usize;

    /// Feeds a freshly decoded block. May rewrite it in place to smooth the
    /// transition out of a concealed run.
    fn handle_good_frame(&mut self, pcm: &mut [u8]);
}

/// Creates the per-call codec state for a wideband start.
pub trait CodecFactory: Send + Sync {
    // ---
    /// One instance is created for each direction.
    fn create_codec(&self) -> Box<dyn FrameCodec>;

    fn create_concealer(&self) -> Box<dyn Concealer> {
        Box::new(FadingConcealer::new())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn codec_ids_match_hfp_numbering() {
        // ---
        assert_eq!(HfpCodec::Cvsd.id(), 1);
        assert_eq!(HfpCodec::Msbc.id(), 2);
        assert_eq!(HfpCodec::from_id(2), Some(HfpCodec::Msbc));
        assert_eq!(HfpCodec::from_id(3), None);
    }

    #[test]
    fn framing_sizes_add_up() {
        // ---
        assert_eq!(MSBC_H2_HEADER_LEN + MSBC_FRAME_LEN + 1, MSBC_PKT_SIZE);
        assert_eq!(MSBC_FRAME_SIZE, 59);
        assert_eq!(MSBC_CODE_SIZE / HFP_FORMAT_BYTES, 120);
    }
}
