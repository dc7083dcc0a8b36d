//! Audio device facade over a shared SCO session.
//!
//! One [`HfpIodev`] exists per direction. Both share the call's
//! [`ScoSession`]: the first device to open connects SCO and starts the
//! session, the last one to close stops it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use crate::codec::{HfpCodec, HFP_FORMAT_BYTES};
use crate::error::{Result, ScoError};
use crate::event::{PollEvents, PollLoop, SharedSource};
use crate::session::{AudioFormat, Direction, ScoSession};
use crate::transport::ScoTransport;

/// Capabilities the audio thread needs from any device.
pub trait AudioDevice {
    // ---
    fn direction(&self) -> Direction;

    /// Sets the PCM format. Must precede [`AudioDevice::open`].
    fn configure(&mut self, format: AudioFormat) -> Result<()>;

    fn open(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Frames buffered and not yet consumed by the other side.
    fn frames_queued(&self) -> Result<usize>;

    /// Borrows up to `frames` frames of device buffer.
    fn get_buffer(&mut self, frames: usize) -> Result<AudioArea<'_>>;

    /// Commits frames written to (output) or read from (input) the buffer
    /// last returned by [`AudioDevice::get_buffer`].
    fn put_buffer(&mut self, frames: usize) -> Result<()>;

    /// Called when the device has no stream attached. Output devices keep
    /// the link fed with silence.
    fn no_stream(&mut self, enable: bool) -> Result<()>;

    /// Called after the audio thread missed a playback deadline.
    fn output_underrun(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Device buffer lent out by [`AudioDevice::get_buffer`].
///
/// Holds the session lock while alive.
pub struct AudioArea<'a> {
    // ---
    session: MutexGuard<'a, ScoSession>,
    direction: Direction,
    frames: usize,
    frame_bytes: usize,
}

impl AudioArea<'_> {
    // ---
    /// Frames available in this area.
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.session.buf_acquire(self.direction, self.frames)
    }
}

/// A freshly connected SCO link.
pub struct ScoConnection {
    // ---
    pub transport: Box<dyn ScoTransport>,
    pub mtu: usize,
    pub codec: HfpCodec,
}

/// Opens the SCO link for a call. Implemented by the Bluetooth transport.
pub trait ScoConnector: Send {
    // ---
    fn connect(&mut self) -> Result<ScoConnection>;
}

/// Packets of silence kept queued while no stream plays.
const NO_STREAM_PACKETS: usize = 2;

/// HFP audio device for one direction of a call.
pub struct HfpIodev {
    // ---
    direction: Direction,
    session: Arc<Mutex<ScoSession>>,
    connector: Box<dyn ScoConnector>,
    poll_loop: Option<Arc<Mutex<PollLoop>>>,
    format: Option<AudioFormat>,
    opened: bool,
}

impl HfpIodev {
    // ---
    pub fn new(
        direction: Direction,
        session: Arc<Mutex<ScoSession>>,
        connector: Box<dyn ScoConnector>,
    ) -> Self {
        // ---
        Self {
            direction,
            session,
            connector,
            poll_loop: None,
            format: None,
            opened: false,
        }
    }

    /// Registers the session's socket with `poll_loop` when this device
    /// starts the call.
    pub fn with_poll_loop(mut self, poll_loop: Arc<Mutex<PollLoop>>) -> Self {
        self.poll_loop = Some(poll_loop);
        self
    }

    pub fn session(&self) -> &Arc<Mutex<ScoSession>> {
        &self.session
    }

    pub fn format(&self) -> Option<AudioFormat> {
        self.format
    }

    fn lock(&self) -> MutexGuard<'_, ScoSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn running_session(&self) -> Result<MutexGuard<'_, ScoSession>> {
        // ---
        let session = self.lock();
        if !session.is_running() {
            return Err(ScoError::InvalidState("SCO session not running"));
        }
        Ok(session)
    }

    /// Connects and starts the session. Returns the fd to poll, if any.
    fn start_call(&mut self) -> Result<Option<std::os::fd::RawFd>> {
        // ---
        let conn = self.connector.connect()?;
        let mut session = self.lock();
        if session.has_transport() {
            session.close_transport()?;
        }
        session.set_transport(conn.transport)?;
        session.start(conn.mtu, conn.codec)?;
        Ok(session.transport_fd())
    }

    fn min_output_frames(&self, session: &ScoSession) -> usize {
        // ---
        let fb = self
            .format
            .map(|f| f.frame_bytes())
            .unwrap_or(HFP_FORMAT_BYTES);
        NO_STREAM_PACKETS * session.packet_size() / fb
    }
}

impl AudioDevice for HfpIodev {
    // ---
    fn direction(&self) -> Direction {
        self.direction
    }

    fn configure(&mut self, format: AudioFormat) -> Result<()> {
        // ---
        if format.channels != 1 || usize::from(format.bits_per_sample) != HFP_FORMAT_BYTES * 8 {
            return Err(ScoError::InvalidState("HFP devices are 16-bit mono"));
        }
        self.format = Some(format);
        Ok(())
    }

    fn open(&mut self) -> Result<()> {
        // ---
        let format = self
            .format
            .ok_or(ScoError::InvalidState("format not configured"))?;

        // A hung-up session is no longer polled; reconnect it like a new call.
        let needs_call = {
            let session = self.lock();
            !session.is_running() || session.is_hung_up()
        };
        if needs_call {
            let fd = self.start_call()?;
            // Session lock is released here; the loop locks sessions while
            // polling.
            if let (Some(fd), Some(poll_loop)) = (fd, self.poll_loop.as_ref()) {
                let source: SharedSource = self.session.clone();
                poll_loop
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .add(fd, PollEvents::sco_interest(), source);
            }
        }

        self.lock().add_iodev(self.direction, &format)?;
        self.opened = true;
        info!(direction = ?self.direction, "HFP iodev opened");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.opened && self.lock().is_running()
    }

    fn frames_queued(&self) -> Result<usize> {
        Ok(self.running_session()?.buf_queued(self.direction))
    }

    fn get_buffer(&mut self, frames: usize) -> Result<AudioArea<'_>> {
        // ---
        let frame_bytes = self.format.map(|f| f.frame_bytes()).unwrap_or(0);
        let direction = self.direction;
        let mut session = self.running_session()?;
        let available = match frame_bytes {
            0 => 0,
            fb => session.buf_acquire(direction, frames).len() / fb,
        };
        Ok(AudioArea {
            session,
            direction,
            frames: available,
            frame_bytes,
        })
    }

    fn put_buffer(&mut self, frames: usize) -> Result<()> {
        // ---
        self.running_session()?.buf_release(self.direction, frames);
        Ok(())
    }

    fn no_stream(&mut self, enable: bool) -> Result<()> {
        // ---
        if self.direction != Direction::Output || !enable {
            return Ok(());
        }
        let mut session = self.running_session()?;
        let target = self.min_output_frames(&session);
        let queued = session.buf_queued(Direction::Output);
        if queued < target {
            session.fill_output_with_zeros(target - queued);
        }
        Ok(())
    }

    fn output_underrun(&mut self) -> Result<()> {
        // ---
        if self.direction != Direction::Output {
            return Ok(());
        }
        let mut session = self.running_session()?;
        let size = session.buf_size(Direction::Output);
        session.fill_output_with_zeros(size);
        let level = self.min_output_frames(&session);
        session.force_output_level(level);
        warn!(level, "HFP output underrun, playback reset to silence");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // ---
        self.opened = false;
        let fd = {
            let mut session = self.lock();
            session.rm_iodev(self.direction)?;
            if !session.is_running() || session.has_iodev() {
                return Ok(());
            }
            session.stop();
            session.transport_fd()
        };

        if let (Some(fd), Some(poll_loop)) = (fd, self.poll_loop.as_ref()) {
            poll_loop
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(fd);
        }
        info!(direction = ?self.direction, "HFP iodev closed, call stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::session::{NullLink, ScoConfig};
    use std::io;

    struct SinkTransport;

    impl ScoTransport for SinkTransport {
        fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn recv(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }
    }

    #[derive(Clone, Default)]
    struct Connector {
        connects: Arc<Mutex<usize>>,
    }

    impl ScoConnector for Connector {
        fn connect(&mut self) -> Result<ScoConnection> {
            // ---
            *self.connects.lock().unwrap() += 1;
            Ok(ScoConnection {
                transport: Box::new(SinkTransport),
                mtu: 48,
                codec: HfpCodec::Cvsd,
            })
        }
    }

    fn pair() -> (HfpIodev, HfpIodev) {
        // ---
        let session = Arc::new(Mutex::new(ScoSession::new(
            ScoConfig::default(),
            Box::new(NullLink),
        )));
        let out = HfpIodev::new(
            Direction::Output,
            session.clone(),
            Box::new(Connector::default()),
        );
        let inp = HfpIodev::new(Direction::Input, session, Box::new(Connector::default()));
        (out, inp)
    }

    #[test]
    fn open_requires_format() {
        // ---
        let (mut out, _) = pair();
        assert!(out.open().is_err());
        assert!(out
            .configure(AudioFormat {
                sample_rate: 8000,
                channels: 2,
                bits_per_sample: 16
            })
            .is_err());
    }

    #[test]
    fn first_open_starts_last_close_stops() {
        // ---
        let (mut out, mut inp) = pair();
        let fmt = AudioFormat::for_codec(HfpCodec::Cvsd);
        out.configure(fmt).unwrap();
        inp.configure(fmt).unwrap();

        out.open().unwrap();
        inp.open().unwrap();
        assert!(out.is_open() && inp.is_open());

        out.close().unwrap();
        assert!(inp.is_open());
        inp.close().unwrap();
        assert!(!inp.session().lock().unwrap().is_running());
    }

    #[test]
    fn open_after_hangup_reconnects() {
        // ---
        use crate::event::EventSource;

        let (mut out, _) = pair();
        let connector = Connector::default();
        let mut inp = HfpIodev::new(
            Direction::Input,
            out.session().clone(),
            Box::new(connector.clone()),
        );
        let fmt = AudioFormat::for_codec(HfpCodec::Cvsd);
        out.configure(fmt).unwrap();
        inp.configure(fmt).unwrap();
        out.open().unwrap();

        out.session().lock().unwrap().on_ready(PollEvents::HUP);
        assert!(out.session().lock().unwrap().is_hung_up());

        inp.open().unwrap();
        assert_eq!(*connector.connects.lock().unwrap(), 1);
        let session = inp.session().lock().unwrap();
        assert!(session.is_running());
        assert!(!session.is_hung_up());
    }

    #[test]
    fn buffers_flow_through_session() {
        // ---
        let (mut out, _) = pair();
        out.configure(AudioFormat::for_codec(HfpCodec::Cvsd)).unwrap();
        out.open().unwrap();

        {
            let mut area = out.get_buffer(100).unwrap();
            assert_eq!(area.frames(), 100);
            area.as_mut_slice().fill(3);
        }
        out.put_buffer(100).unwrap();
        assert_eq!(out.frames_queued().unwrap(), 100);
    }

    #[test]
    fn underrun_resets_to_minimum_level() {
        // ---
        let (mut out, _) = pair();
        out.configure(AudioFormat::for_codec(HfpCodec::Cvsd)).unwrap();
        out.open().unwrap();

        out.output_underrun().unwrap();
        // Two 48-byte packets of 16-bit frames.
        assert_eq!(out.frames_queued().unwrap(), 48);

        out.no_stream(true).unwrap();
        assert_eq!(out.frames_queued().unwrap(), 48);
    }
}
