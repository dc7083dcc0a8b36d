//! Wideband packet-status history for feedback reports.
//!
//! One bit per mSBC frame slot, `0` for a frame received and decoded, `1` for
//! a frame lost or concealed. The ring holds the most recent 512 slots
//! (64 bytes), which at one frame per 7.5 ms is just under four seconds.
//!
//! Nothing in the data path reads this back; it exists to be dumped.

use std::fmt::Write as _;
use std::time::{Duration, Instant};

/// Bytes of status storage.
pub const PACKET_STATUS_LEN_BYTES: usize = 64;

/// Duration of one mSBC frame on the air.
pub const WBS_FRAME_DURATION: Duration = Duration::from_micros(7500);

/// Dump line width. 32, 40 and 64 character runs of hex get scrubbed by
/// the feedback redaction tool, so lines stop at 50.
pub const PACKET_STATUS_LOG_LINE_WRAP: usize = 50;

/// Ring of per-frame good/lost bits.
#[derive(Debug, Clone)]
pub struct PacketStatusLogger {
    // ---
    data: [u8; PACKET_STATUS_LEN_BYTES],
    size: usize,
    wp: usize,
    num_wraps: usize,
    ts: Instant,
}

impl Default for PacketStatusLogger {
    fn default() -> Self {
        // ---
        Self::new()
    }
}

impl PacketStatusLogger {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            data: [0; PACKET_STATUS_LEN_BYTES],
            size: PACKET_STATUS_LEN_BYTES * 8,
            wp: 0,
            num_wraps: 0,
            ts: Instant::now(),
        }
    }

    /// Clears history and restarts the clock. Called at each wideband start.
    pub fn reset(&mut self) {
        // ---
        *self = Self::new();
    }

    /// Records the next frame slot. `lost == true` logs a `1`.
    pub fn update(&mut self, lost: bool) {
        // ---
        if self.wp == 0 {
            self.ts = Instant::now();
        }

        let mask = 1u8 << (self.wp % 8);
        if lost {
            self.data[self.wp / 8] |= mask;
        } else {
            self.data[self.wp / 8] &= !mask;
        }

        self.wp += 1;
        if self.wp >= self.size {
            self.wp %= self.size;
            self.num_wraps += 1;
        }
    }

    /// Total bits of storage.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Position of the next bit to be written.
    pub fn wp(&self) -> usize {
        self.wp
    }

    pub fn num_wraps(&self) -> usize {
        self.num_wraps
    }

    /// Number of slots currently holding history.
    pub fn len(&self) -> usize {
        if self.num_wraps > 0 {
            self.size
        } else {
            self.wp
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Status bit of the `i`-th oldest recorded slot.
    pub fn get(&self, i: usize) -> Option<bool> {
        // ---
        if i >= self.len() {
            return None;
        }
        let head = if self.num_wraps > 0 { self.wp } else { 0 };
        let j = (head + i) % self.size;
        Some((self.data[j / 8] >> (j % 8)) & 1 == 1)
    }

    /// Time of the oldest slot still held.
    ///
    /// Before the first wrap this is when bit 0 was written. After it, the
    /// oldest slot sits `size - wp` frames before that point.
    pub fn begin_ts(&self) -> Instant {
        // ---
        if self.num_wraps == 0 {
            return self.ts;
        }
        let back = WBS_FRAME_DURATION * (self.size - self.wp) as u32;
        self.ts.checked_sub(back).unwrap_or(self.ts)
    }

    /// Time just past the newest slot: bit-0 time plus `wp` frames.
    pub fn end_ts(&self) -> Instant {
        // ---
        self.ts + WBS_FRAME_DURATION * self.wp as u32
    }

    /// Hex dump, oldest byte first, wrapped at
    /// [`PACKET_STATUS_LOG_LINE_WRAP`] characters.
    ///
    /// Bits at and after `wp` in the partially written byte are masked off,
    /// since they belong to the previous lap (or were never written).
    pub fn dump_hex(&self) -> String {
        // ---
        let mut hex = String::new();
        let partial = self.wp % 8;
        let mut i = self.wp / 8;

        if self.num_wraps > 0 {
            if partial != 0 {
                let _ = write!(hex, "{:02x}", self.data[i] & (0xffu8 << partial));
                i += 1;
            }
            for byte in &self.data[i..] {
                let _ = write!(hex, "{byte:02x}");
            }
        }
        for byte in &self.data[..self.wp / 8] {
            let _ = write!(hex, "{byte:02x}");
        }
        if partial != 0 {
            let _ = write!(hex, "{:02x}", self.data[self.wp / 8] & !(0xffu8 << partial));
        }

        wrap_lines(&hex, None)
    }

    /// One `0`/`1` character per slot, oldest first, wrapped at
    /// [`PACKET_STATUS_LOG_LINE_WRAP`]. A short last line is padded with `D`.
    pub fn dump_binary(&self) -> String {
        // ---
        let bits: String = (0..self.len())
            .filter_map(|i| self.get(i))
            .map(|lost| if lost { '1' } else { '0' })
            .collect();

        wrap_lines(&bits, Some('D'))
    }
}

fn wrap_lines(s: &str, pad: Option<char>) -> String {
    // ---
    let mut out = String::with_capacity(s.len() + s.len() / PACKET_STATUS_LOG_LINE_WRAP + 2);
    let chars: Vec<char> = s.chars().collect();

    for line in chars.chunks(PACKET_STATUS_LOG_LINE_WRAP) {
        out.extend(line.iter());
        if let Some(pad) = pad {
            for _ in line.len()..PACKET_STATUS_LOG_LINE_WRAP {
                out.push(pad);
            }
        }
        out.push('\n');
    }
    out
}
