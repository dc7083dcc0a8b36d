//! HFP SCO audio session library
//!
//! Moves voice PCM between a Bluetooth hands-free headset and the local
//! audio pipeline over a SCO link: raw CVSD for narrowband calls, H2-framed
//! mSBC with packet-loss concealment for wideband calls.
//!
//! The pieces, leaves first: [`ByteRing`] buffers, the
//! [`PacketStatusLogger`], codec and concealer traits, the [`MsbcLink`]
//! framing state machine, the [`ScoSession`] that owns a call, the
//! [`PollLoop`] that drives it, and [`HfpIodev`] devices on top.

pub mod codec;
pub mod error;
pub mod event;
pub mod iodev;
pub mod msbc;
pub mod packet_status;
pub mod plc;
pub mod post_filter;
pub mod ring;
pub mod session;
pub mod transport;

pub use codec::{CodecFactory, Concealer, FrameCodec, HfpCodec};
pub use error::{Result, ScoError};
pub use event::{Dispatch, EventSource, PollEvents, PollLoop, SharedSource};
pub use iodev::{AudioArea, AudioDevice, HfpIodev, ScoConnection, ScoConnector};
pub use msbc::{MsbcCounters, MsbcLink, ReadSync};
pub use packet_status::PacketStatusLogger;
pub use plc::FadingConcealer;
pub use post_filter::{LinearUpsampler, SpeechPostFilter};
pub use ring::ByteRing;
pub use session::{
    AudioFormat, Direction, ListenerId, NullLink, ProfileLink, ScoConfig, ScoSession,
    SessionState,
};
pub use transport::{PacketStatus, ScoSocket, ScoTransport};
