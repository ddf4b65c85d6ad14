#![warn(rust_2018_idioms)]

//! Wire formats of the origin engine. Pure, sans-io: every codec reads from
//! and writes to byte buffers, never sockets.

pub mod aac;
pub mod amf0;
pub mod avc;
pub mod flv;
pub mod fmp4;
pub mod format;
pub mod hevc;
pub mod mpegts;

pub use amf0::Amf0Value;
pub use format::{AudioCodecId, Format, VideoCodecId};
