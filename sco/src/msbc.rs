//! Wideband speech over SCO: mSBC frames wrapped in H2 headers.
//!
//! ```text
//! offset 0      0x01                      sync
//! offset 1      0x08 | 0x38 | 0xC8 | 0xF8 sequence number mod 4
//! offset 2..59  57 bytes mSBC             payload[0] == 0xAD
//! offset 59     0x00                      pad
//! ```
//!
//! The link may carry these 60-byte frames in packets of 24, 48, 60 or 72
//! bytes, so each direction keeps a scratch buffer sized to the common
//! multiple of the two and slices frames out of (or into) it.

use tracing::{debug, error, info, warn};

use crate::codec::{
    Concealer, FrameCodec, MSBC_CODE_SIZE, MSBC_FRAME_LEN, MSBC_FRAME_SIZE, MSBC_H2_HEADER_LEN,
    MSBC_PKT_SIZE, MSBC_SYNC_WORD,
};
use crate::error::{Result, ScoError};
use crate::packet_status::PacketStatusLogger;
use crate::ring::ByteRing;
use crate::transport::{recv_with_status_retrying, send_retrying, PacketStatus, ScoTransport};

/// First byte of every H2 header.
pub const H2_HEADER_0: u8 = 0x01;

/// Second H2 header byte for sequence numbers 0 through 3.
pub const H2_HEADER_FRAMES_COUNT: [u8; 4] = [0x08, 0x38, 0xC8, 0xF8];

/// Transport packet sizes the framing supports, paired with the scratch
/// buffer size each needs. The first entry is the fallback.
const WBS_PACKET_SIZES: [(usize, usize); 4] = [(60, 60), (24, 120), (48, 240), (72, 360)];

/// Maps a requested packet size onto the supported table.
///
/// Returns `(packet_size, scratch_size)`. Sizes outside the table fall back
/// to one full frame per packet.
pub fn supported_packet_size(size: usize) -> (usize, usize) {
    // ---
    match WBS_PACKET_SIZES.iter().find(|(ps, _)| *ps == size) {
        Some(&entry) => entry,
        None => {
            error!(size, "unsupported wideband packet size, using {}", MSBC_PKT_SIZE);
            WBS_PACKET_SIZES[0]
        }
    }
}

/// Whether `size` is one of the supported transport packet sizes.
pub fn is_supported_packet_size(size: usize) -> bool {
    WBS_PACKET_SIZES.iter().any(|(ps, _)| *ps == size)
}

/// H2 header for the `n`-th outgoing frame.
pub fn h2_header(frame_count: u64) -> [u8; MSBC_H2_HEADER_LEN] {
    [H2_HEADER_0, H2_HEADER_FRAMES_COUNT[(frame_count % 4) as usize]]
}

/// Sequence number encoded by the second header byte.
pub fn h2_header_seq(byte: u8) -> Option<u8> {
    // ---
    H2_HEADER_FRAMES_COUNT
        .iter()
        .position(|&b| b == byte)
        .map(|i| i as u8)
}

/// Locates the first complete frame head in `input`.
///
/// A head is the sync byte, a valid sequence byte, then the payload sync
/// word. Returns the head's offset and its sequence number.
pub fn extract_msbc_frame(input: &[u8]) -> Option<(usize, u8)> {
    // ---
    let mut rp = 0;
    while input.len() - rp >= MSBC_FRAME_SIZE {
        if input[rp] != H2_HEADER_0 || input[rp + 2] != MSBC_SYNC_WORD {
            rp += 1;
            continue;
        }
        match h2_header_seq(input[rp + 1]) {
            Some(seq) => return Some((rp, seq)),
            None => rp += 1,
        }
    }
    None
}

/// Whether a freshly received packet starts on a frame boundary.
fn starts_with_frame_head(pkt: &[u8]) -> bool {
    // ---
    pkt.len() > 2
        && pkt[0] == H2_HEADER_0
        && h2_header_seq(pkt[1]).is_some()
        && pkt[2] == MSBC_SYNC_WORD
}

/// Read-side framing state, advanced on every received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSync {
    /// Packets land on frame boundaries; extraction runs normally.
    Aligned,
    /// Joined mid-stream; packets are dropped until one starts with a head.
    AwaitingSync,
    /// The link flagged the frame now being assembled as bad; the next
    /// extraction counts it lost without scanning.
    PacketCorrupted,
}

/// Scratch framing bytes with consumed/produced offsets.
///
/// Invariant: `rp <= wp <= len`. Both offsets snap back to zero whenever
/// everything produced has been consumed.
#[derive(Debug, Clone)]
pub struct ScratchBuf {
    // ---
    data: Vec<u8>,
    rp: usize,
    wp: usize,
}

impl ScratchBuf {
    // ---
    pub fn new(size: usize) -> Self {
        // ---
        Self {
            data: vec![0u8; size],
            rp: 0,
            wp: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rp == self.wp
    }

    pub fn rp(&self) -> usize {
        self.rp
    }

    pub fn wp(&self) -> usize {
        self.wp
    }

    /// Unconsumed bytes.
    pub fn pending(&self) -> &[u8] {
        &self.data[self.rp..self.wp]
    }

    pub fn clear(&mut self) {
        // ---
        self.rp = 0;
        self.wp = 0;
    }

    /// Makes `n` bytes writable at `wp`, moving pending bytes to the front
    /// and growing only if that is not enough.
    pub fn reserve(&mut self, n: usize) {
        // ---
        if self.wp + n <= self.data.len() {
            return;
        }
        if self.rp > 0 {
            self.data.copy_within(self.rp..self.wp, 0);
            self.wp -= self.rp;
            self.rp = 0;
        }
        if self.wp + n > self.data.len() {
            self.data.resize(self.wp + n, 0);
        }
    }

    /// Resizes to `size`, keeping pending bytes.
    pub fn resize(&mut self, size: usize) {
        // ---
        let pending = self.wp - self.rp;
        self.data.copy_within(self.rp..self.wp, 0);
        self.rp = 0;
        self.wp = pending;
        self.data.resize(size.max(pending), 0);
    }

    fn spare_mut(&mut self, n: usize) -> &mut [u8] {
        &mut self.data[self.wp..self.wp + n]
    }

    fn commit(&mut self, n: usize) {
        self.wp += n;
    }

    fn consume(&mut self, n: usize) {
        // ---
        self.rp = (self.rp + n).min(self.wp);
        if self.rp == self.wp {
            self.clear();
        }
    }
}

/// Frame counters for one wideband call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsbcCounters {
    // ---
    /// Frames encoded and queued for sending.
    pub out_frames: u64,
    /// Frame slots consumed on the read side, good or lost.
    pub in_frames: u64,
    /// Slots filled by concealment.
    pub lost_frames: u64,
    /// Raw bytes taken off the transport, including discarded packets.
    pub bytes_received: u64,
}

impl MsbcCounters {
    /// Slots that carried a decoded frame.
    pub fn decoded_frames(&self) -> u64 {
        self.in_frames - self.lost_frames
    }
}

/// Per-call wideband state: codecs, concealer, framing buffers, counters.
pub struct MsbcLink {
    // ---
    encoder: Box<dyn FrameCodec>,
    decoder: Box<dyn FrameCodec>,
    plc: Box<dyn Concealer>,
    write_buf: ScratchBuf,
    read_buf: ScratchBuf,
    sync: ReadSync,
    counters: MsbcCounters,
}

impl std::fmt::Debug for MsbcLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // ---
        f.debug_struct("MsbcLink")
            .field("write_buf", &self.write_buf)
            .field("read_buf", &self.read_buf)
            .field("sync", &self.sync)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl MsbcLink {
    // ---
    /// Fresh state for a call running at `packet_size`, which must already
    /// be one of the supported sizes.
    pub fn new(
        packet_size: usize,
        encoder: Box<dyn FrameCodec>,
        decoder: Box<dyn FrameCodec>,
        plc: Box<dyn Concealer>,
    ) -> Self {
        // ---
        let (_, scratch) = supported_packet_size(packet_size);
        let sync = if packet_size == MSBC_PKT_SIZE {
            ReadSync::Aligned
        } else {
            ReadSync::AwaitingSync
        };

        Self {
            encoder,
            decoder,
            plc,
            write_buf: ScratchBuf::new(scratch),
            read_buf: ScratchBuf::new(scratch),
            sync,
            counters: MsbcCounters::default(),
        }
    }

    pub fn counters(&self) -> MsbcCounters {
        self.counters
    }

    pub fn sync(&self) -> ReadSync {
        self.sync
    }

    pub fn write_buf(&self) -> &ScratchBuf {
        &self.write_buf
    }

    pub fn read_buf(&self) -> &ScratchBuf {
        &self.read_buf
    }

    /// Re-sizes the scratch buffers after the packet size changed.
    pub fn packet_size_changed(&mut self, packet_size: usize) {
        // ---
        let (_, scratch) = supported_packet_size(packet_size);
        self.write_buf.resize(scratch);
        self.read_buf.resize(scratch);
    }

    /// Write step: encode one block when needed, send one packet when ready.
    ///
    /// Returns bytes sent, or 0 while not enough framed bytes are ready.
    pub fn write(
        &mut self,
        transport: &mut dyn ScoTransport,
        playback: &mut ByteRing,
        packet_size: usize,
    ) -> Result<usize> {
        // ---
        if self.write_buf.pending().len() < packet_size {
            self.encode_block(playback)?;
            if self.write_buf.pending().len() < packet_size {
                return Ok(0);
            }
        }

        let pkt = &self.write_buf.pending()[..packet_size];
        let sent = match send_retrying(transport, pkt) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        if sent != packet_size {
            error!(sent, packet_size, "partial mSBC write");
            return Err(ScoError::ShortWrite {
                sent,
                expected: packet_size,
            });
        }
        self.write_buf.consume(packet_size);
        Ok(sent)
    }

    fn encode_block(&mut self, playback: &mut ByteRing) -> Result<()> {
        // ---
        // The stream must not stall on a partial block: top up with silence.
        if playback.queued() < MSBC_CODE_SIZE {
            playback.fill_zeros(MSBC_CODE_SIZE - playback.queued());
            if playback.queued() < MSBC_CODE_SIZE {
                return Err(ScoError::InvalidState("playback ring cannot hold one mSBC block"));
            }
        }

        let mut block = [0u8; MSBC_CODE_SIZE];
        playback.peek(&mut block);

        self.write_buf.reserve(MSBC_PKT_SIZE);
        let header = h2_header(self.counters.out_frames);
        let frame = self.write_buf.spare_mut(MSBC_PKT_SIZE);
        frame[..MSBC_H2_HEADER_LEN].copy_from_slice(&header);
        let (consumed, _) = self
            .encoder
            .encode(&block, &mut frame[MSBC_H2_HEADER_LEN..MSBC_FRAME_SIZE])?;
        frame[MSBC_FRAME_SIZE] = 0;

        playback.advance_read(consumed);
        self.write_buf.commit(MSBC_PKT_SIZE);
        self.counters.out_frames += 1;
        Ok(())
    }

    /// Read step: receive at most one packet, then decode or conceal at
    /// most one frame slot into `capture`.
    ///
    /// Returns PCM bytes written to `capture`. `packet_size` is corrected in
    /// place when the first short read reveals the adapter's real size.
    pub fn read(
        &mut self,
        transport: &mut dyn ScoTransport,
        capture: &mut ByteRing,
        packet_size: &mut usize,
        mtu: usize,
        logger: Option<&mut PacketStatusLogger>,
    ) -> Result<usize> {
        // ---
        if self.read_buf.pending().len() < MSBC_PKT_SIZE {
            let ps = *packet_size;
            self.read_buf.reserve(ps);
            let (n, status) =
                match recv_with_status_retrying(transport, self.read_buf.spare_mut(ps)) {
                    Ok(r) => r,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(0),
                    Err(e) => {
                        error!("HCI SCO packet read error: {e}");
                        return Err(e.into());
                    }
                };

            self.counters.bytes_received += n as u64;

            let mut adjusted = false;
            if n != ps {
                if n > 0 && ps == mtu && is_supported_packet_size(n) {
                    info!(from = ps, to = n, "adjusting mSBC packet size");
                    *packet_size = n;
                    adjusted = true;
                } else {
                    error!(received = n, expected = ps, "partial mSBC read");
                    return Err(ScoError::ShortRead {
                        received: n,
                        expected: ps,
                    });
                }
            }

            if self.sync == ReadSync::AwaitingSync {
                let start = self.read_buf.wp();
                if !starts_with_frame_head(&self.read_buf.data[start..start + n]) {
                    debug!("waiting for valid mSBC frame head");
                    if adjusted {
                        self.packet_size_changed(n);
                    }
                    return Ok(0);
                }
                self.sync = ReadSync::Aligned;
            }
            self.read_buf.commit(n);
            if adjusted {
                self.packet_size_changed(n);
            }

            // Status only describes the current frame if this packet did
            // not carry bytes of the next one.
            if self.read_buf.rp() + MSBC_PKT_SIZE >= self.read_buf.wp() {
                self.note_packet_status(status);
            }

            if self.read_buf.pending().len() < MSBC_PKT_SIZE {
                return Ok(0);
            }
        }

        self.extract_and_decode(capture, logger)
    }

    fn note_packet_status(&mut self, status: PacketStatus) {
        // ---
        if status.is_bad() && self.sync == ReadSync::Aligned {
            self.sync = ReadSync::PacketCorrupted;
        }
    }

    fn extract_and_decode(
        &mut self,
        capture: &mut ByteRing,
        mut logger: Option<&mut PacketStatusLogger>,
    ) -> Result<usize> {
        // ---
        let head = if self.sync == ReadSync::PacketCorrupted {
            debug!("mSBC frame corrupted from packet status");
            self.sync = ReadSync::Aligned;
            None
        } else {
            let found = extract_msbc_frame(self.read_buf.pending());
            if found.is_none() {
                debug!("failed to extract mSBC frame");
            }
            found
        };

        let mut payload = [0u8; MSBC_FRAME_LEN];
        let seq = head.map(|(offset, seq)| {
            let start = offset + MSBC_H2_HEADER_LEN;
            payload.copy_from_slice(&self.read_buf.pending()[start..start + MSBC_FRAME_LEN]);
            seq
        });
        self.read_buf.consume(MSBC_PKT_SIZE);

        let Some(seq) = seq else {
            return Ok(self.handle_packet_loss(capture, logger.as_deref_mut()));
        };

        let mut produced = 0;
        while u64::from(seq) != self.counters.in_frames % 4 {
            debug!(seq, expected = self.counters.in_frames % 4, "SCO packet seq mismatch");
            produced += self.handle_packet_loss(capture, logger.as_deref_mut());
        }

        let dst = capture.acquire_write(MSBC_CODE_SIZE);
        if dst.len() < MSBC_CODE_SIZE {
            return Ok(produced);
        }

        match self.decoder.decode(&payload, dst) {
            Ok((_, decoded)) => {
                let decoded = decoded.min(dst.len());
                self.plc.handle_good_frame(&mut dst[..decoded]);
                capture.advance_write(decoded);
                self.counters.in_frames += 1;
                if let Some(logger) = logger {
                    logger.update(false);
                }
                Ok(produced + decoded)
            }
            Err(e) => {
                warn!("mSBC decode failed: {e}");
                Ok(produced + self.handle_packet_loss(capture, logger))
            }
        }
    }

    /// Fills one lost frame slot. The slot is always counted; the concealed
    /// block is dropped when the capture ring has no room for it.
    fn handle_packet_loss(
        &mut self,
        capture: &mut ByteRing,
        logger: Option<&mut PacketStatusLogger>,
    ) -> usize {
        // ---
        self.counters.in_frames += 1;
        self.counters.lost_frames += 1;
        if let Some(logger) = logger {
            logger.update(true);
        }

        let dst = capture.acquire_write(MSBC_CODE_SIZE);
        if dst.len() < MSBC_CODE_SIZE {
            return 0;
        }
        let produced = self.plc.handle_bad_frame(dst);
        capture.advance_write(produced)
    }
}
