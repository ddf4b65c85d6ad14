#![warn(rust_2018_idioms)]

//! RTMP: the chunked protocol (AMF0 flavor) and the server-side session.
//!
//! The chunk and packet codecs are sans-io; [server::RtmpServer] drives them
//! over a [runtime::TcpFd] with the engine's timeout discipline.

pub mod chunk;
pub mod client;
pub mod handshake;
pub mod packet;
pub mod request;
pub mod server;

pub use chunk::{ChunkDecoder, ChunkEncoder, RtmpMessage};
pub use client::RtmpClient;
pub use request::RtmpRequest;
pub use server::{ClientType, RtmpServer};

/// Chunk sizes bounded by the protocol.
pub const MIN_CHUNK_SIZE: u32 = 128;
pub const MAX_CHUNK_SIZE: u32 = 65536;
/// Protocol default until a SetChunkSize arrives.
pub const PROTOCOL_CHUNK_SIZE: u32 = 128;
/// Our preferred outbound chunk size.
pub const SERVER_CHUNK_SIZE: u32 = 60000;

/// Default RTMP I/O timeout.
pub const RTMP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub const DEFAULT_VHOST: &str = "__defaultVhost__";
pub const DEFAULT_PORT: u16 = 1935;
