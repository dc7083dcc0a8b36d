//! Replays a capture through a real [`ScoSession`].

use anyhow::{Context, Result};
use hfp_sco_common::MetricsContext;
use sco::codec::{CodecFactory, FrameCodec, MSBC_CODE_SIZE, MSBC_FRAME_LEN, MSBC_SYNC_WORD};
use sco::msbc::is_supported_packet_size;
use sco::{
    AudioFormat, Direction, Dispatch, EventSource, HfpCodec, MsbcCounters, NullLink,
    PacketStatus, PollEvents, ScoConfig, ScoError, ScoSession, ScoTransport,
};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::capture::CapturedPacket;

#[derive(Debug, Default)]
struct ReplayState {
    inbound: VecDeque<(Vec<u8>, PacketStatus)>,
    packets_sent: u64,
    bytes_sent: u64,
}

/// Transport that serves captured packets and swallows whatever the
/// session sends back.
#[derive(Debug, Clone, Default)]
pub struct ReplayTransport {
    // ---
    state: Arc<Mutex<ReplayState>>,
}

impl ReplayTransport {
    // ---
    /// Queues `packets` re-cut into `packet_size` chunks.
    ///
    /// A chunk is flagged when any of its bytes came from a flagged packet.
    /// A trailing partial chunk is dropped.
    pub fn new(packets: &[CapturedPacket], packet_size: usize) -> Self {
        // ---
        let mut inbound = VecDeque::new();
        let mut chunk = Vec::with_capacity(packet_size);
        let mut status = PacketStatus::GOOD;

        for pkt in packets {
            let mut data = pkt.data.as_slice();
            while !data.is_empty() && packet_size > 0 {
                let take = (packet_size - chunk.len()).min(data.len());
                chunk.extend_from_slice(&data[..take]);
                if pkt.status.is_bad() {
                    status = pkt.status;
                }
                data = &data[take..];

                if chunk.len() == packet_size {
                    inbound.push_back((std::mem::take(&mut chunk), status));
                    status = PacketStatus::GOOD;
                }
            }
        }
        if !chunk.is_empty() {
            debug!(bytes = chunk.len(), "dropping trailing partial packet");
        }

        Self {
            state: Arc::new(Mutex::new(ReplayState {
                inbound,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReplayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Packets not yet read by the session.
    pub fn remaining(&self) -> usize {
        self.lock().inbound.len()
    }

    /// Packets and bytes the session sent back.
    pub fn sent(&self) -> (u64, u64) {
        // ---
        let state = self.lock();
        (state.packets_sent, state.bytes_sent)
    }
}

impl ScoTransport for ReplayTransport {
    // ---
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        // ---
        let mut state = self.lock();
        state.packets_sent += 1;
        state.bytes_sent += buf.len() as u64;
        Ok(buf.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.recv_with_status(buf)?.0)
    }

    fn recv_with_status(&mut self, buf: &mut [u8]) -> io::Result<(usize, PacketStatus)> {
        // ---
        match self.lock().inbound.pop_front() {
            Some((pkt, status)) => {
                let n = pkt.len().min(buf.len());
                buf[..n].copy_from_slice(&pkt[..n]);
                Ok((n, status))
            }
            None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }
}

/// Frame checker standing in for an mSBC codec.
///
/// Decoding accepts any payload starting with the mSBC sync word and yields
/// silence, so replays measure framing and loss rather than audio. Encoding
/// produces silent frames for the keep-alive direction.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncCheckCodec;

impl FrameCodec for SyncCheckCodec {
    // ---
    fn encode(&mut self, pcm: &[u8], out: &mut [u8]) -> sco::Result<(usize, usize)> {
        // ---
        if pcm.len() < MSBC_CODE_SIZE || out.len() < MSBC_FRAME_LEN {
            return Err(ScoError::Codec("short buffer".into()));
        }
        out[..MSBC_FRAME_LEN].fill(0);
        out[0] = MSBC_SYNC_WORD;
        Ok((MSBC_CODE_SIZE, MSBC_FRAME_LEN))
    }

    fn decode(&mut self, payload: &[u8], pcm: &mut [u8]) -> sco::Result<(usize, usize)> {
        // ---
        if payload.first() != Some(&MSBC_SYNC_WORD) {
            return Err(ScoError::Codec("missing mSBC sync word".into()));
        }
        let n = MSBC_CODE_SIZE.min(pcm.len());
        pcm[..n].fill(0);
        Ok((MSBC_FRAME_LEN, n))
    }
}

impl CodecFactory for SyncCheckCodec {
    fn create_codec(&self) -> Box<dyn FrameCodec> {
        Box::new(SyncCheckCodec)
    }
}

/// How to replay a capture.
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    // ---
    /// Codec negotiated for the call
    pub codec: HfpCodec,

    /// MTU reported by the adapter. Defaults to the packet size.
    pub mtu: Option<usize>,

    /// Re-cut the captured stream into packets of this size. Defaults to
    /// the size of the first captured packet.
    pub packet_size: Option<usize>,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        // ---
        Self {
            codec: HfpCodec::Msbc,
            mtu: None,
            packet_size: None,
        }
    }
}

/// Outcome of one replay.
#[derive(Debug, Clone)]
pub struct ReplayReport {
    // ---
    pub codec: HfpCodec,

    /// Packets in the capture
    pub captured_packets: usize,

    /// Captured packets carrying a bad HCI status
    pub flagged_packets: usize,

    /// Packets fed to the session after re-cutting
    pub replayed_packets: usize,

    /// Packet size the session ended with
    pub packet_size: usize,

    /// Wideband frame counters; all zero for narrowband
    pub counters: MsbcCounters,

    /// Whether the session survived the whole capture
    pub completed: bool,

    /// Packet-status dumps, wideband only
    pub status_hex: Option<String>,
    pub status_binary: Option<String>,

    /// Capture PCM, 16-bit little-endian mono
    pub pcm: Vec<u8>,
}

impl ReplayReport {
    // ---
    pub fn sample_rate(&self) -> u32 {
        self.codec.sample_rate()
    }

    /// Lost frames over frames read; zero when nothing was read.
    pub fn loss_ratio(&self) -> f64 {
        // ---
        match self.counters.in_frames {
            0 => 0.0,
            n => self.counters.lost_frames as f64 / n as f64,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        self.pcm.len() as f64 / 2.0 / f64::from(self.sample_rate())
    }
}

impl fmt::Display for ReplayReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        writeln!(f, "codec:            {:?}", self.codec)?;
        writeln!(
            f,
            "packets:          {} captured, {} with erroneous status",
            self.captured_packets, self.flagged_packets
        )?;
        writeln!(
            f,
            "replayed:         {} packets of {} bytes{}",
            self.replayed_packets,
            self.packet_size,
            if self.completed { "" } else { " (session failed)" }
        )?;
        if self.codec.is_wideband() {
            writeln!(
                f,
                "frames:           {} read, {} decoded, {} lost ({:.2}%)",
                self.counters.in_frames,
                self.counters.decoded_frames(),
                self.counters.lost_frames,
                self.loss_ratio() * 100.0
            )?;
        }
        write!(f, "audio:            {:.2}s", self.duration_secs())
    }
}

/// Moves everything queued in capture to `pcm`. Returns bytes moved.
fn drain_capture(session: &mut ScoSession, pcm: &mut Vec<u8>) -> usize {
    // ---
    let mut moved = 0;
    loop {
        let frames = session.buf_queued(Direction::Input);
        if frames == 0 {
            return moved;
        }
        let buf = session.buf_acquire(Direction::Input, frames);
        pcm.extend_from_slice(buf);
        moved += buf.len();
        let released = buf.len() / 2;
        session.buf_release(Direction::Input, released);
    }
}

/// Feeds `packets` to a fresh session one read event at a time.
///
/// # Errors
///
/// Returns error when the capture is empty, the wideband packet size is
/// not one the framing supports, or the session refuses to start.
pub fn replay(
    packets: &[CapturedPacket],
    options: &ReplayOptions,
    metrics: Option<MetricsContext>,
) -> Result<ReplayReport> {
    // ---
    let packet_size = options
        .packet_size
        .or_else(|| packets.first().map(|p| p.data.len()))
        .filter(|&ps| ps > 0)
        .context("capture holds no packets")?;
    if options.codec.is_wideband() && !is_supported_packet_size(packet_size) {
        return Err(ScoError::UnsupportedPacketSize(packet_size).into());
    }
    let mtu = options.mtu.unwrap_or(packet_size);

    let transport = ReplayTransport::new(packets, packet_size);
    let replayed_packets = transport.remaining();

    let mut session = ScoSession::new(ScoConfig::default(), Box::new(NullLink))
        .with_codec_factory(Arc::new(SyncCheckCodec));
    if let Some(metrics) = metrics {
        session = session.with_metrics(metrics);
    }
    session
        .set_transport(Box::new(transport.clone()))
        .context("failed to attach replay transport")?;
    session
        .start(mtu, options.codec)
        .context("failed to start SCO session")?;
    session
        .add_iodev(Direction::Input, &AudioFormat::for_codec(options.codec))
        .context("failed to attach capture device")?;

    info!(
        "Replaying {} packets of {} bytes (mtu {})",
        replayed_packets, packet_size, mtu
    );

    let mut pcm = Vec::new();
    let mut completed = true;
    loop {
        let remaining = transport.remaining();
        let verdict = session.on_ready(PollEvents::IN);
        let moved = drain_capture(&mut session, &mut pcm);
        if verdict == Dispatch::Remove {
            warn!(remaining, "session ended before the capture did");
            completed = false;
            break;
        }
        if remaining == 0 && moved == 0 {
            break;
        }
    }

    let counters = session.msbc_counters();
    let wideband = options.codec.is_wideband();
    let logger = session.packet_status_logger().filter(|_| wideband);
    let status_hex = logger.map(|l| l.dump_hex());
    let status_binary = logger.map(|l| l.dump_binary());
    let packet_size = session.packet_size();
    if session.is_running() {
        session.stop();
    }

    let (sent_packets, sent_bytes) = transport.sent();
    debug!(sent_packets, sent_bytes, "keep-alive traffic");

    Ok(ReplayReport {
        codec: options.codec,
        captured_packets: packets.len(),
        flagged_packets: packets.iter().filter(|p| p.status.is_bad()).count(),
        replayed_packets,
        packet_size,
        counters,
        completed,
        status_hex,
        status_binary,
        pcm,
    })
}
