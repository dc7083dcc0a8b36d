//! One SCO audio session per Bluetooth voice call.
//!
//! The session owns the SCO transport and two PCM rings. The iodev side
//! produces into the playback ring and consumes from the capture ring
//! through the `buf_*` calls; the socket side runs from
//! [`EventSource::on_ready`], moving one packet each way per wake-up.
//!
//! Narrowband (CVSD) PCM crosses the link untouched. Wideband PCM goes
//! through [`MsbcLink`], which frames, encodes, decodes and conceals.
//!
//! The session is not internally synchronized. Callers share it as
//! `Arc<Mutex<ScoSession>>` between the control side, the iodevs and the
//! audio thread's [`crate::PollLoop`].

use std::os::fd::RawFd;
use std::sync::Arc;

use hfp_sco_common::MetricsContext;
use tracing::{debug, error, info, warn};

use crate::codec::{CodecFactory, HfpCodec, HFP_FORMAT_BYTES};
use crate::error::{Result, ScoError};
use crate::event::{Dispatch, EventSource, PollEvents};
use crate::msbc::{supported_packet_size, MsbcCounters, MsbcLink};
use crate::packet_status::PacketStatusLogger;
use crate::post_filter::SpeechPostFilter;
use crate::ring::ByteRing;
use crate::transport::{recv_retrying, send_retrying, ScoTransport};

/// Capacity of each PCM ring: 600 ms of 24 kHz 16-bit mono, a multiple of
/// every supported packet size and of one mSBC block.
pub const MAX_HFP_BUF_SIZE_BYTES: usize = 28800;

/// Session construction parameters.
#[derive(Debug, Clone)]
pub struct ScoConfig {
    // ---
    /// Bytes in each of the capture and playback rings.
    pub buffer_size_bytes: usize,

    /// Keep a wideband packet-status history for feedback reports.
    pub packet_status_log: bool,
}

impl Default for ScoConfig {
    fn default() -> Self {
        // ---
        Self {
            buffer_size_bytes: MAX_HFP_BUF_SIZE_BYTES,
            packet_status_log: true,
        }
    }
}

/// Stream direction as seen from the local audio pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Headset microphone towards the host (capture ring).
    Input,
    /// Host towards the headset speaker (playback ring).
    Output,
}

/// PCM format an iodev attaches with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    // ---
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    // ---
    /// 16-bit mono at the codec's rate.
    pub fn for_codec(codec: HfpCodec) -> Self {
        // ---
        Self {
            sample_rate: codec.sample_rate(),
            channels: 1,
            bits_per_sample: (HFP_FORMAT_BYTES * 8) as u16,
        }
    }

    /// Bytes per frame (all channels).
    pub fn frame_bytes(&self) -> usize {
        usize::from(self.channels) * usize::from(self.bits_per_sample).div_ceil(8)
    }
}

/// Upward hook into the Bluetooth profile layer.
pub trait ProfileLink: Send {
    // ---
    /// Asks for the audio connection to be re-established after the peer
    /// hung up the SCO socket.
    fn request_reconnect(&mut self);
}

/// Profile link for sessions with nobody to reconnect them.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLink;

impl ProfileLink for NullLink {
    fn request_reconnect(&mut self) {
        debug!("reconnect requested with no profile attached");
    }
}

/// Coarse lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not started.
    Idle,
    /// Started, no transfer completed yet.
    Started,
    /// At least one dispatch moved data.
    Running,
    /// The peer hung up and a reconnect was requested. The transport is
    /// still held but no poll loop drives the session any more.
    HungUp,
}

/// Handle returned when registering a packet-size listener.
pub type ListenerId = u64;

type PacketSizeListener = Box<dyn FnMut(usize) + Send>;

struct PostFilterStage {
    filter: Box<dyn SpeechPostFilter>,
    side: ByteRing,
}

/// SCO session state.
pub struct ScoSession {
    // ---
    config: ScoConfig,
    link: Box<dyn ProfileLink>,
    transport: Option<Box<dyn ScoTransport>>,
    codec_factory: Option<Arc<dyn CodecFactory>>,
    metrics: Option<MetricsContext>,

    started: bool,
    running: bool,
    hung_up: bool,
    codec: HfpCodec,
    mtu: usize,
    packet_size: usize,

    capture: ByteRing,
    playback: ByteRing,
    input_format_bytes: usize,
    output_format_bytes: usize,

    msbc: Option<MsbcLink>,
    last_counters: MsbcCounters,
    logger: Option<PacketStatusLogger>,
    post_filter: Option<PostFilterStage>,
    narrowband_pkt: Vec<u8>,

    listeners: Vec<(ListenerId, PacketSizeListener)>,
    next_listener_id: ListenerId,
}

impl std::fmt::Debug for ScoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // ---
        f.debug_struct("ScoSession")
            .field("started", &self.started)
            .field("codec", &self.codec)
            .field("mtu", &self.mtu)
            .field("packet_size", &self.packet_size)
            .field("capture_queued", &self.capture.queued())
            .field("playback_queued", &self.playback.queued())
            .field("msbc", &self.msbc)
            .finish_non_exhaustive()
    }
}

impl ScoSession {
    // ---
    pub fn new(config: ScoConfig, link: Box<dyn ProfileLink>) -> Self {
        // ---
        let logger = config.packet_status_log.then(PacketStatusLogger::new);
        Self {
            capture: ByteRing::new(config.buffer_size_bytes),
            playback: ByteRing::new(config.buffer_size_bytes),
            config,
            link,
            transport: None,
            codec_factory: None,
            metrics: None,
            started: false,
            running: false,
            hung_up: false,
            codec: HfpCodec::Cvsd,
            mtu: 0,
            packet_size: 0,
            input_format_bytes: 0,
            output_format_bytes: 0,
            msbc: None,
            last_counters: MsbcCounters::default(),
            logger,
            post_filter: None,
            narrowband_pkt: Vec::new(),
            listeners: Vec::new(),
            next_listener_id: 1,
        }
    }

    /// Supplies mSBC codec instances for wideband starts.
    pub fn with_codec_factory(mut self, factory: Arc<dyn CodecFactory>) -> Self {
        self.codec_factory = Some(factory);
        self
    }

    pub fn set_codec_factory(&mut self, factory: Arc<dyn CodecFactory>) {
        self.codec_factory = Some(factory);
    }

    /// Reports traffic into `metrics`.
    pub fn with_metrics(mut self, metrics: MetricsContext) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ScoConfig {
        &self.config
    }

    // ----- transport -------------------------------------------------------

    /// Hands the connected transport to the session.
    pub fn set_transport(&mut self, transport: Box<dyn ScoTransport>) -> Result<()> {
        // ---
        if self.transport.is_some() {
            return Err(ScoError::InvalidState("transport already set"));
        }
        self.transport = Some(transport);
        Ok(())
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// Descriptor to register with the poll loop, if the transport has one.
    pub fn transport_fd(&self) -> Option<RawFd> {
        self.transport.as_ref().and_then(|t| t.raw_fd())
    }

    /// Stops the session if needed and closes the transport.
    pub fn close_transport(&mut self) -> Result<()> {
        // ---
        if self.transport.is_none() {
            return Err(ScoError::InvalidState("no transport to close"));
        }
        if self.started {
            self.stop();
        }
        self.transport = None;
        Ok(())
    }

    // ----- lifecycle -------------------------------------------------------

    /// Starts transferring over the transport with the negotiated `mtu` and
    /// `codec`. The caller registers the session with its poll loop after
    /// this returns.
    pub fn start(&mut self, mtu: usize, codec: HfpCodec) -> Result<()> {
        // ---
        if self.transport.is_none() {
            return Err(ScoError::InvalidState("start without transport"));
        }
        if self.started {
            return Err(ScoError::InvalidState("session already started"));
        }
        if mtu == 0 {
            return Err(ScoError::InvalidState("zero MTU"));
        }

        let msbc = match codec {
            HfpCodec::Msbc => {
                let factory = self
                    .codec_factory
                    .as_ref()
                    .ok_or(ScoError::InvalidState("no mSBC codec available"))?;
                let (packet_size, _) = supported_packet_size(mtu);
                Some(MsbcLink::new(
                    packet_size,
                    factory.create_codec(),
                    factory.create_codec(),
                    factory.create_concealer(),
                ))
            }
            HfpCodec::Cvsd => None,
        };

        self.mtu = mtu;
        self.packet_size = match codec {
            HfpCodec::Msbc => supported_packet_size(mtu).0,
            HfpCodec::Cvsd => mtu,
        };
        self.playback.reset();
        self.capture.reset();
        if let Some(stage) = self.post_filter.as_mut() {
            stage.side.reset();
        }
        if codec.is_wideband() {
            if let Some(logger) = self.logger.as_mut() {
                logger.reset();
            }
        }

        self.codec = codec;
        self.msbc = msbc;
        self.last_counters = MsbcCounters::default();
        self.started = true;
        self.running = false;
        self.hung_up = false;

        info!(mtu, packet_size = self.packet_size, ?codec, "SCO session started");
        Ok(())
    }

    /// Stops transferring and drops per-call codec state. The transport is
    /// kept. Stopping a stopped session only logs.
    pub fn stop(&mut self) {
        // ---
        if !self.started {
            warn!("stop on a session that is not started");
            return;
        }
        self.started = false;
        self.running = false;
        self.hung_up = false;
        self.release_call_state();
        info!(
            in_frames = self.last_counters.in_frames,
            lost_frames = self.last_counters.lost_frames,
            "SCO session stopped"
        );
    }

    fn release_call_state(&mut self) {
        // ---
        if let Some(msbc) = self.msbc.take() {
            self.last_counters = msbc.counters();
            let counters = self.last_counters;
            if counters.in_frames > 0 {
                if let Some(m) = &self.metrics {
                    m.hfp_packet_loss_ratio
                        .observe(counters.lost_frames as f64 / counters.in_frames as f64);
                }
            }
        }
    }

    /// Whether the session is started. Stays true after a hang-up until
    /// the owner stops or restarts the call.
    pub fn is_running(&self) -> bool {
        self.started
    }

    /// Started but no longer polled after the peer hung up.
    pub fn is_hung_up(&self) -> bool {
        self.started && self.hung_up
    }

    pub fn state(&self) -> SessionState {
        // ---
        match (self.started, self.hung_up, self.running) {
            (false, _, _) => SessionState::Idle,
            (true, true, _) => SessionState::HungUp,
            (true, false, false) => SessionState::Started,
            (true, false, true) => SessionState::Running,
        }
    }

    pub fn codec(&self) -> HfpCodec {
        self.codec
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Bytes moved per socket call. Starts at the MTU (or the supported
    /// wideband size) and may be corrected once by the first short read.
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Wideband frame counters, live while started and frozen after stop.
    pub fn msbc_counters(&self) -> MsbcCounters {
        // ---
        self.msbc
            .as_ref()
            .map(MsbcLink::counters)
            .unwrap_or(self.last_counters)
    }

    pub fn packet_status_logger(&self) -> Option<&PacketStatusLogger> {
        self.logger.as_ref()
    }

    // ----- iodev contract --------------------------------------------------

    /// Registers the device consuming (input) or producing (output) PCM.
    pub fn add_iodev(&mut self, direction: Direction, format: &AudioFormat) -> Result<()> {
        // ---
        let frame_bytes = format.frame_bytes();
        if frame_bytes == 0 {
            return Err(ScoError::InvalidState("zero-sized audio format"));
        }
        match direction {
            Direction::Output => {
                if self.output_format_bytes != 0 {
                    return Err(ScoError::InvalidState("output device already attached"));
                }
                self.output_format_bytes = frame_bytes;
                self.playback.reset();
            }
            Direction::Input => {
                if self.input_format_bytes != 0 {
                    return Err(ScoError::InvalidState("input device already attached"));
                }
                self.input_format_bytes = frame_bytes;
                self.capture.reset();
            }
        }
        Ok(())
    }

    /// Detaches the device of `direction`. Playback is silenced so a later
    /// keep-alive never replays stale audio.
    pub fn rm_iodev(&mut self, direction: Direction) -> Result<()> {
        // ---
        match direction {
            Direction::Output if self.output_format_bytes != 0 => {
                self.playback.zero_contents();
                self.output_format_bytes = 0;
            }
            Direction::Input if self.input_format_bytes != 0 => {
                self.input_format_bytes = 0;
            }
            _ => return Err(ScoError::InvalidState("no device attached in that direction")),
        }
        Ok(())
    }

    pub fn has_iodev(&self) -> bool {
        self.input_format_bytes != 0 || self.output_format_bytes != 0
    }

    fn format_bytes(&self, direction: Direction) -> usize {
        // ---
        match direction {
            Direction::Input => self.input_format_bytes,
            Direction::Output => self.output_format_bytes,
        }
    }

    /// Contiguous region of up to `frames` frames: writable playback space
    /// for output, readable capture data for input. Empty when no device is
    /// attached in that direction.
    pub fn buf_acquire(&mut self, direction: Direction, frames: usize) -> &mut [u8] {
        // ---
        let fb = self.format_bytes(direction);
        if fb == 0 {
            return &mut [];
        }
        let max = frames.saturating_mul(fb);
        let region = match direction {
            Direction::Output => self.playback.acquire_write(max),
            Direction::Input => self.capture.acquire_read_mut(max),
        };
        let whole = region.len() / fb * fb;
        &mut region[..whole]
    }

    /// Commits `frames` frames acquired with [`ScoSession::buf_acquire`].
    pub fn buf_release(&mut self, direction: Direction, frames: usize) {
        // ---
        let fb = self.format_bytes(direction);
        if fb == 0 {
            return;
        }
        match direction {
            Direction::Output => self.playback.advance_write(frames * fb),
            Direction::Input => self.capture.advance_read(frames * fb),
        };
    }

    /// Frames buffered for `direction`.
    pub fn buf_queued(&self, direction: Direction) -> usize {
        // ---
        match direction {
            Direction::Output if self.output_format_bytes != 0 => {
                self.playback.queued() / self.output_format_bytes
            }
            Direction::Input if self.input_format_bytes != 0 => {
                self.capture.queued() / self.input_format_bytes
            }
            _ => 0,
        }
    }

    /// Ring capacity in frames for `direction`.
    pub fn buf_size(&self, direction: Direction) -> usize {
        // ---
        match direction {
            Direction::Output if self.output_format_bytes != 0 => {
                self.playback.capacity() / self.output_format_bytes
            }
            Direction::Input if self.input_format_bytes != 0 => {
                self.capture.capacity() / self.input_format_bytes
            }
            _ => 0,
        }
    }

    /// Appends up to `frames` frames of silence to playback. Returns frames
    /// written, fewer when the ring fills.
    pub fn fill_output_with_zeros(&mut self, frames: usize) -> usize {
        // ---
        let fb = self.output_format_bytes;
        if fb == 0 {
            return 0;
        }
        self.playback.fill_zeros(frames.saturating_mul(fb)) / fb
    }

    /// Sets the playback level to exactly `frames`. Used right after a
    /// full zero fill when leaving underrun.
    pub fn force_output_level(&mut self, frames: usize) {
        // ---
        let fb = self.output_format_bytes;
        if fb == 0 {
            return;
        }
        let level = frames.saturating_mul(fb).min(self.playback.capacity());
        self.playback.adjust_readable(level);
    }

    // ----- post filter and listeners ---------------------------------------

    /// Routes capture through `filter`. Replaces any filter already set.
    pub fn enable_post_filter(&mut self, filter: Box<dyn SpeechPostFilter>) {
        // ---
        info!(
            from = filter.input_rate(),
            to = filter.output_rate(),
            "capture post filter enabled"
        );
        self.post_filter = Some(PostFilterStage {
            filter,
            side: ByteRing::new(self.config.buffer_size_bytes),
        });
    }

    pub fn disable_post_filter(&mut self) -> Option<Box<dyn SpeechPostFilter>> {
        self.post_filter.take().map(|stage| stage.filter)
    }

    pub fn post_filter_enabled(&self) -> bool {
        self.post_filter.is_some()
    }

    /// Calls `listener` with the new packet size whenever it self-corrects.
    pub fn add_packet_size_listener(
        &mut self,
        listener: impl FnMut(usize) + Send + 'static,
    ) -> ListenerId {
        // ---
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn remove_packet_size_listener(&mut self, id: ListenerId) -> bool {
        // ---
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        before != self.listeners.len()
    }

    fn packet_size_changed(&mut self) {
        // ---
        if let Some(m) = &self.metrics {
            m.sco_packet_size_adjustments_total.inc();
        }
        let size = self.packet_size;
        for (_, listener) in self.listeners.iter_mut() {
            listener(size);
        }
    }

    // ----- socket side -----------------------------------------------------

    /// One read step. Returns PCM bytes added to the capture ring.
    fn read_step(&mut self) -> Result<usize> {
        // ---
        let before = self.packet_size;

        if let Some(stage) = self.post_filter.as_mut() {
            std::mem::swap(&mut self.capture, &mut stage.side);
        }
        let read = self.read_into_capture();
        let produced = match self.post_filter.as_mut() {
            Some(stage) => {
                std::mem::swap(&mut self.capture, &mut stage.side);
                read.map(|_| stage.filter.process(&mut stage.side, &mut self.capture))
            }
            None => read,
        };

        if self.packet_size != before {
            self.packet_size_changed();
        }
        produced
    }

    fn read_into_capture(&mut self) -> Result<usize> {
        // ---
        let transport = self
            .transport
            .as_deref_mut()
            .ok_or(ScoError::InvalidState("no transport"))?;

        match self.msbc.as_mut() {
            Some(msbc) => msbc.read(
                transport,
                &mut self.capture,
                &mut self.packet_size,
                self.mtu,
                self.logger.as_mut(),
            ),
            None => read_narrowband(
                transport,
                &mut self.capture,
                &mut self.narrowband_pkt,
                &mut self.packet_size,
                self.mtu,
            ),
        }
    }

    /// One write step. Returns bytes sent.
    fn write_step(&mut self) -> Result<usize> {
        // ---
        let transport = self
            .transport
            .as_deref_mut()
            .ok_or(ScoError::InvalidState("no transport"))?;

        match self.msbc.as_mut() {
            Some(msbc) => msbc.write(transport, &mut self.playback, self.packet_size),
            None => write_narrowband(
                transport,
                &mut self.playback,
                &mut self.narrowband_pkt,
                self.packet_size,
            ),
        }
    }

    /// Fatal transfer error: close the transport and stop.
    fn teardown(&mut self, err: &ScoError) {
        // ---
        error!("SCO transfer failed, closing transport: {err}");
        if let Some(m) = &self.metrics {
            m.sco_fatal_errors_total.inc();
        }
        self.transport = None;
        self.started = false;
        self.running = false;
        self.hung_up = false;
        self.release_call_state();
    }

    fn record_step(&self, before: MsbcCounters, read: usize, sent: usize) {
        // ---
        let Some(m) = &self.metrics else {
            return;
        };
        let after = self.msbc_counters();
        m.msbc_frames_decoded_total
            .inc_by(after.decoded_frames() - before.decoded_frames());
        m.msbc_frames_lost_total
            .inc_by(after.lost_frames - before.lost_frames);
        m.msbc_frames_encoded_total
            .inc_by(after.out_frames - before.out_frames);
        let received = if self.msbc.is_some() {
            after.bytes_received - before.bytes_received
        } else {
            read as u64
        };
        m.sco_bytes_received_total.inc_by(received);
        m.sco_bytes_sent_total.inc_by(sent as u64);
        m.capture_buffer_level_bytes.set(self.capture.queued() as i64);
        m.playback_buffer_level_bytes.set(self.playback.queued() as i64);
    }
}

impl EventSource for ScoSession {
    // ---
    fn on_ready(&mut self, events: PollEvents) -> Dispatch {
        // ---
        let _timer = self
            .metrics
            .as_ref()
            .map(|m| m.sco_dispatch_seconds.start_timer());

        if !self.started {
            return Dispatch::Remove;
        }
        let before = self.msbc_counters();

        // A final read is allowed before acting on hang-up or error.
        let hangup = events.contains(PollEvents::HUP);
        let mut read = 0;
        if events.contains(PollEvents::IN) {
            match self.read_step() {
                Ok(n) => read = n,
                // End of stream from a closed peer arrives with HUP.
                Err(ScoError::ShortRead { received: 0, .. }) if hangup => {}
                Err(e) => {
                    self.teardown(&e);
                    return Dispatch::Remove;
                }
            }
        }

        // Nobody consumes capture: drop what was just read.
        if self.input_format_bytes == 0 {
            self.capture.advance_read(read);
        }

        if events.contains(PollEvents::ERR) {
            self.teardown(&ScoError::Io(std::io::Error::other(format!(
                "poll error on SCO socket, revents {:?}",
                events
            ))));
            return Dispatch::Remove;
        }
        if hangup {
            warn!("SCO socket hung up, requesting profile reconnect");
            self.hung_up = true;
            self.link.request_reconnect();
            return Dispatch::Remove;
        }

        // Some headsets only start sending once they receive, so keep
        // the far end fed with silence when nothing is playing.
        if self.output_format_bytes == 0 {
            let keep_alive = if self.msbc.is_some() {
                read
            } else {
                self.packet_size
            };
            self.playback.fill_zeros(keep_alive);
        }

        let sent = match self.write_step() {
            Ok(n) => n,
            Err(e) => {
                self.teardown(&e);
                return Dispatch::Remove;
            }
        };

        if read > 0 || sent > 0 {
            self.running = true;
        }
        self.record_step(before, read, sent);
        Dispatch::Continue
    }
}

/// Narrowband read: one packet straight into the capture ring.
fn read_narrowband(
    transport: &mut dyn ScoTransport,
    capture: &mut ByteRing,
    pkt: &mut Vec<u8>,
    packet_size: &mut usize,
    mtu: usize,
) -> Result<usize> {
    // ---
    let ps = *packet_size;
    if capture.available() < ps {
        return Ok(0);
    }

    pkt.resize(ps, 0);
    let n = match recv_retrying(transport, &mut pkt[..ps]) {
        Ok(n) => n,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(0),
        Err(e) => {
            error!("SCO read error: {e}");
            return Err(e.into());
        }
    };

    if n != ps {
        // Some adapters report an MTU but send a smaller packet. Follow
        // the first one; after that a mismatch is an error.
        if n > 0 && ps == mtu {
            info!(from = ps, to = n, "adjusting SCO packet size");
            *packet_size = n;
        } else {
            error!(received = n, expected = ps, "partial SCO read");
            return Err(ScoError::ShortRead {
                received: n,
                expected: ps,
            });
        }
    }

    Ok(capture.write(&pkt[..n]))
}

/// Narrowband write: exactly one packet or nothing.
fn write_narrowband(
    transport: &mut dyn ScoTransport,
    playback: &mut ByteRing,
    pkt: &mut Vec<u8>,
    packet_size: usize,
) -> Result<usize> {
    // ---
    if playback.queued() < packet_size {
        return Ok(0);
    }

    pkt.resize(packet_size, 0);
    playback.peek(&mut pkt[..packet_size]);
    let sent = match send_retrying(transport, &pkt[..packet_size]) {
        Ok(n) => n,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    if sent != packet_size {
        error!(sent, packet_size, "partial SCO write");
        return Err(ScoError::ShortWrite {
            sent,
            expected: packet_size,
        });
    }

    playback.advance_read(sent);
    Ok(sent)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Wire {
        inbound: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
    }

    #[derive(Clone, Default)]
    struct MockTransport(Arc<Mutex<Wire>>);

    impl ScoTransport for MockTransport {
        fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
            // ---
            self.0.lock().unwrap().sent.push(buf.to_vec());
            Ok(buf.len())
        }

        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            // ---
            match self.0.lock().unwrap().inbound.pop_front() {
                Some(pkt) => {
                    let n = pkt.len().min(buf.len());
                    buf[..n].copy_from_slice(&pkt[..n]);
                    Ok(n)
                }
                None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            }
        }
    }

    #[derive(Default, Clone)]
    struct CountingLink(Arc<Mutex<usize>>);

    impl ProfileLink for CountingLink {
        fn request_reconnect(&mut self) {
            *self.0.lock().unwrap() += 1;
        }
    }

    fn narrowband_session(mtu: usize) -> (ScoSession, MockTransport) {
        // ---
        let wire = MockTransport::default();
        let mut session = ScoSession::new(ScoConfig::default(), Box::new(NullLink));
        session.set_transport(Box::new(wire.clone())).unwrap();
        session.start(mtu, HfpCodec::Cvsd).unwrap();
        (session, wire)
    }

    fn cvsd_format() -> AudioFormat {
        AudioFormat::for_codec(HfpCodec::Cvsd)
    }

    #[test]
    fn start_requires_transport() {
        // ---
        let mut session = ScoSession::new(ScoConfig::default(), Box::new(NullLink));
        assert!(matches!(
            session.start(48, HfpCodec::Cvsd),
            Err(ScoError::InvalidState(_))
        ));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn wideband_start_needs_codec() {
        // ---
        let mut session = ScoSession::new(ScoConfig::default(), Box::new(NullLink));
        session
            .set_transport(Box::new(MockTransport::default()))
            .unwrap();
        assert!(session.start(60, HfpCodec::Msbc).is_err());
        assert!(!session.is_running());
    }

    #[test]
    fn second_transport_is_refused() {
        // ---
        let (mut session, _) = narrowband_session(48);
        assert!(session
            .set_transport(Box::new(MockTransport::default()))
            .is_err());
        session.close_transport().unwrap();
        assert!(!session.is_running());
        assert!(session.close_transport().is_err());
    }

    #[test]
    fn attach_is_exclusive_per_direction() {
        // ---
        let (mut session, _) = narrowband_session(48);
        session.add_iodev(Direction::Output, &cvsd_format()).unwrap();
        session.fill_output_with_zeros(10);

        let err = session.add_iodev(Direction::Output, &cvsd_format());
        assert!(matches!(err, Err(ScoError::InvalidState(_))));
        assert_eq!(session.buf_queued(Direction::Output), 10);

        session.add_iodev(Direction::Input, &cvsd_format()).unwrap();
        assert!(session.has_iodev());
        session.rm_iodev(Direction::Output).unwrap();
        session.rm_iodev(Direction::Input).unwrap();
        assert!(!session.has_iodev());
        assert!(session.rm_iodev(Direction::Input).is_err());
    }

    #[test]
    fn acquire_clamps_to_ring_space() {
        // ---
        let (mut session, _) = narrowband_session(48);
        assert!(session.buf_acquire(Direction::Output, 100).is_empty());

        session.add_iodev(Direction::Output, &cvsd_format()).unwrap();
        let frames = session.buf_size(Direction::Output);
        assert_eq!(frames, MAX_HFP_BUF_SIZE_BYTES / 2);

        let buf = session.buf_acquire(Direction::Output, frames * 4);
        assert_eq!(buf.len(), MAX_HFP_BUF_SIZE_BYTES);
        session.buf_release(Direction::Output, frames - 5);
        assert_eq!(session.buf_acquire(Direction::Output, 100).len(), 10);
    }

    #[test]
    fn zero_fill_and_forced_level() {
        // ---
        let (mut session, _) = narrowband_session(48);
        assert_eq!(session.fill_output_with_zeros(10), 0);

        session.add_iodev(Direction::Output, &cvsd_format()).unwrap();
        let size = session.buf_size(Direction::Output);
        assert_eq!(session.fill_output_with_zeros(size + 100), size);
        session.force_output_level(240);
        assert_eq!(session.buf_queued(Direction::Output), 240);

        session.force_output_level(0);
        assert_eq!(session.fill_output_with_zeros(usize::MAX), size);
    }

    #[test]
    fn output_detach_silences_playback() {
        // ---
        let (mut session, wire) = narrowband_session(48);
        session.add_iodev(Direction::Output, &cvsd_format()).unwrap();
        let buf = session.buf_acquire(Direction::Output, 48);
        buf.fill(0x5a);
        session.buf_release(Direction::Output, 48);

        session.rm_iodev(Direction::Output).unwrap();
        assert_eq!(session.buf_queued(Direction::Output), 0);

        // Queued bytes still go out, as keep-alive silence.
        session.on_ready(PollEvents::OUT);
        let sent = wire.0.lock().unwrap().sent.clone();
        assert_eq!(sent, vec![vec![0u8; 48]]);
    }

    #[test]
    fn narrowband_short_write_tears_down() {
        // ---
        struct HalfSend;

        impl ScoTransport for HalfSend {
            fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
                Ok(buf.len() / 2)
            }

            fn recv(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            }
        }

        let mut session = ScoSession::new(ScoConfig::default(), Box::new(NullLink));
        session.set_transport(Box::new(HalfSend)).unwrap();
        session.start(48, HfpCodec::Cvsd).unwrap();

        assert_eq!(session.on_ready(PollEvents::OUT), Dispatch::Remove);
        assert!(!session.has_transport());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn narrowband_write_waits_for_full_packet() {
        // ---
        let (mut session, wire) = narrowband_session(48);
        session.add_iodev(Direction::Output, &cvsd_format()).unwrap();

        let buf = session.buf_acquire(Direction::Output, 20);
        buf.fill(0x5a);
        session.buf_release(Direction::Output, 20);
        assert_eq!(session.on_ready(PollEvents::OUT), Dispatch::Continue);
        assert!(wire.0.lock().unwrap().sent.is_empty());

        let buf = session.buf_acquire(Direction::Output, 4);
        buf.fill(0x5a);
        session.buf_release(Direction::Output, 4);
        session.on_ready(PollEvents::OUT);
        let sent = wire.0.lock().unwrap().sent.clone();
        assert_eq!(sent, vec![vec![0x5a; 48]]);
        assert_eq!(session.state(), SessionState::Running);
    }

    #[test]
    fn short_read_corrects_packet_size_once() {
        // ---
        let (mut session, wire) = narrowband_session(64);
        session.add_iodev(Direction::Input, &cvsd_format()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        session.add_packet_size_listener(move |ps| seen_in.lock().unwrap().push(ps));

        wire.0.lock().unwrap().inbound.push_back(vec![1; 48]);
        session.on_ready(PollEvents::IN);
        assert_eq!(session.packet_size(), 48);
        assert_eq!(session.buf_queued(Direction::Input), 24);
        assert_eq!(*seen.lock().unwrap(), vec![48]);

        // Already corrected: a second mismatch is fatal.
        wire.0.lock().unwrap().inbound.push_back(vec![1; 24]);
        assert_eq!(session.on_ready(PollEvents::IN), Dispatch::Remove);
        assert!(!session.is_running());
        assert!(!session.has_transport());
    }

    #[test]
    fn keep_alive_silence_without_output_device() {
        // ---
        let (mut session, wire) = narrowband_session(48);
        session.on_ready(PollEvents::OUT);
        assert_eq!(wire.0.lock().unwrap().sent, vec![vec![0u8; 48]]);
    }

    #[test]
    fn capture_is_dropped_without_input_device() {
        // ---
        let (mut session, wire) = narrowband_session(48);
        wire.0.lock().unwrap().inbound.push_back(vec![7; 48]);
        session.on_ready(PollEvents::IN);
        session.add_iodev(Direction::Input, &cvsd_format()).unwrap();
        assert_eq!(session.buf_queued(Direction::Input), 0);
    }

    #[test]
    fn hangup_requests_reconnect_and_keeps_transport() {
        // ---
        let link = CountingLink::default();
        let mut session = ScoSession::new(ScoConfig::default(), Box::new(link.clone()));
        session
            .set_transport(Box::new(MockTransport::default()))
            .unwrap();
        session.start(48, HfpCodec::Cvsd).unwrap();

        assert_eq!(session.on_ready(PollEvents::HUP), Dispatch::Remove);
        assert_eq!(*link.0.lock().unwrap(), 1);
        assert!(session.has_transport());
        assert_eq!(session.state(), SessionState::HungUp);
        assert!(session.is_running());

        session.stop();
        assert!(!session.is_hung_up());
    }

    #[test]
    fn end_of_stream_with_hangup_is_not_fatal() {
        // ---
        let link = CountingLink::default();
        let wire = MockTransport::default();
        let mut session = ScoSession::new(ScoConfig::default(), Box::new(link.clone()));
        session.set_transport(Box::new(wire.clone())).unwrap();
        session.start(48, HfpCodec::Cvsd).unwrap();

        // A closed peer reads as a zero-length packet.
        wire.0.lock().unwrap().inbound.push_back(Vec::new());
        let events = PollEvents::IN | PollEvents::HUP;
        assert_eq!(session.on_ready(events), Dispatch::Remove);
        assert_eq!(*link.0.lock().unwrap(), 1);
        assert!(session.has_transport());
        assert!(session.is_hung_up());
        assert!(wire.0.lock().unwrap().sent.is_empty());
    }

    #[test]
    fn end_of_stream_without_hangup_is_fatal() {
        // ---
        let link = CountingLink::default();
        let wire = MockTransport::default();
        let mut session = ScoSession::new(ScoConfig::default(), Box::new(link.clone()));
        session.set_transport(Box::new(wire.clone())).unwrap();
        session.start(48, HfpCodec::Cvsd).unwrap();

        wire.0.lock().unwrap().inbound.push_back(Vec::new());
        assert_eq!(session.on_ready(PollEvents::IN), Dispatch::Remove);
        assert_eq!(*link.0.lock().unwrap(), 0);
        assert!(!session.has_transport());
    }

    #[test]
    fn poll_error_tears_down() {
        // ---
        let (mut session, _) = narrowband_session(48);
        assert_eq!(session.on_ready(PollEvents::ERR), Dispatch::Remove);
        assert!(!session.has_transport());
        assert_eq!(session.state(), SessionState::Idle);
        // Dispatch after teardown just unregisters.
        assert_eq!(session.on_ready(PollEvents::IN), Dispatch::Remove);
    }

    #[test]
    fn stop_twice_is_harmless() {
        // ---
        let (mut session, _) = narrowband_session(48);
        session.stop();
        session.stop();
        assert!(session.has_transport());
        session.start(60, HfpCodec::Cvsd).unwrap();
        assert_eq!(session.packet_size(), 60);
    }
}
