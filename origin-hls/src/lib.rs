#![warn(rust_2018_idioms)]

//! HLS segmenter: demuxes the live stream into MPEG-TS segments, maintains
//! the sliding window and regenerates the M3U8 atomically on every reap.

pub mod muxer;

pub use muxer::{HlsConfig, HlsMuxer, HlsReapEvent};

use live::{HubChild, SharedMessage};
use shared::error::Result;

/// Hub child wrapper so the origin hub can drive the muxer.
pub struct Hls {
    muxer: HlsMuxer,
}

impl Hls {
    pub fn new(config: HlsConfig) -> Self {
        Self {
            muxer: HlsMuxer::new(config),
        }
    }

    pub fn muxer_mut(&mut self) -> &mut HlsMuxer {
        &mut self.muxer
    }
}

impl HubChild for Hls {
    fn name(&self) -> &str {
        "hls"
    }

    fn on_publish(&mut self, vhost: &str, app: &str, stream: &str) -> Result<()> {
        self.muxer.on_publish(vhost, app, stream)
    }

    fn on_audio(&mut self, msg: &SharedMessage) -> Result<()> {
        self.muxer.on_audio(msg)
    }

    fn on_video(&mut self, msg: &SharedMessage) -> Result<()> {
        self.muxer.on_video(msg)
    }

    fn on_unpublish(&mut self) {
        self.muxer.on_unpublish();
    }
}
