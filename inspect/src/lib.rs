//! SCO capture inspection.
//!
//! Replays SCO packets captured from a Bluetooth call through a real
//! [`sco::ScoSession`] and reports what the session made of them: frames
//! decoded and concealed, the packet-status history, and the capture audio.

pub mod capture;
pub mod replay;
pub mod wav;

pub use capture::{parse_capture, read_capture, CapturedPacket};
pub use replay::{replay, ReplayOptions, ReplayReport, ReplayTransport, SyncCheckCodec};
pub use wav::write_wav;
