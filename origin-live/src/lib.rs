#![warn(rust_2018_idioms)]

//! The live source hub: one publisher in, many consumers out.
//!
//! A [source::LiveSource] deduplicates a publisher's stream into per-consumer
//! queues, caches the sequence headers and the current GOP for instant
//! startup, and fans out to the origin-hub collaborators (HLS, DASH,
//! forwarders) and protocol bridges.

pub mod bridge;
pub mod gop;
pub mod hub;
pub mod jitter;
pub mod message;
pub mod meta;
pub mod mix;
pub mod queue;
pub mod source;

pub use bridge::StreamBridge;
pub use gop::GopCache;
pub use hub::{HubChild, OriginHub};
pub use jitter::{JitterAlgorithm, RtmpJitter};
pub use message::{MessageHeader, MessageType, SharedMessage};
pub use meta::MetaCache;
pub use mix::MixQueue;
pub use queue::{Consumer, MessageQueue};
pub use source::{LiveSource, SourceConfig, SourceManager, StreamKey};
