#![warn(rust_2018_idioms)]

//! The WebRTC core: DTLS/SRTP-protected RTP/RTCP transport with NACK, PLI
//! and TWCC feedback, plus the RTP↔AV frame bridges into the live hub.

pub mod classify;
pub mod dtls;
pub mod frame;
pub mod jitter;
pub mod nack;
pub mod pli;
pub mod rtcp;
pub mod rtp;
pub mod sdp;
pub mod session;
pub mod source;
pub mod srtp;
pub mod stun;
pub mod track;
pub mod transport;
pub mod twcc;

pub use classify::{classify, PacketKind};
pub use jitter::{RtcSeqJitter, RtcTsJitter};
pub use rtp::RtpPacket;
pub use session::{RtcConnection, RtcSessionManager, RtcSessionState};
pub use source::{RtcSource, RtcSourceManager};
