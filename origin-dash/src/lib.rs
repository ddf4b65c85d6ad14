#![warn(rust_2018_idioms)]

//! DASH segmenter: init.mp4 + numbered m4s fragments per track, and the
//! dynamic MPD that anchors wall-clock playback.

pub mod controller;
pub mod mpd;

pub use controller::{DashConfig, DashController};

use live::{HubChild, SharedMessage};
use shared::error::Result;

/// Hub child wrapper so the origin hub can drive the controller.
pub struct Dash {
    controller: DashController,
}

impl Dash {
    pub fn new(config: DashConfig) -> Self {
        Self {
            controller: DashController::new(config),
        }
    }
}

impl HubChild for Dash {
    fn name(&self) -> &str {
        "dash"
    }

    fn on_publish(&mut self, vhost: &str, app: &str, stream: &str) -> Result<()> {
        self.controller.on_publish(vhost, app, stream)
    }

    fn on_audio(&mut self, msg: &SharedMessage) -> Result<()> {
        self.controller.on_audio(msg)
    }

    fn on_video(&mut self, msg: &SharedMessage) -> Result<()> {
        self.controller.on_video(msg)
    }

    fn on_unpublish(&mut self) {
        self.controller.on_unpublish();
    }
}
