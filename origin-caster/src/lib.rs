#![warn(rust_2018_idioms)]

//! Stream casters: adapters that ingest MPEG-TS transports (raw UDP, SRT)
//! and feed the live hub as RTMP-shaped messages.

pub mod dedup;
pub mod srt;
pub mod streamid;
pub mod ts_adapter;

pub use dedup::AvDedupQueue;
pub use streamid::{parse_streamid, streamid_to_request, SrtMode, SrtRequest};
pub use ts_adapter::TsToRtmp;
