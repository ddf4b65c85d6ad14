//! The origin hub: couples a publishing source with its origin-only
//! collaborators (HLS, DASH, forwarders). Children are isolated; one
//! failing never stops the pipeline for the rest.

use crate::message::SharedMessage;
use shared::error::Result;

/// One collaborator of the hub.
pub trait HubChild: Send {
    fn name(&self) -> &str;

    fn on_publish(&mut self, vhost: &str, app: &str, stream: &str) -> Result<()>;

    fn on_meta_data(&mut self, msg: &SharedMessage) -> Result<()> {
        let _ = msg;
        Ok(())
    }

    fn on_audio(&mut self, msg: &SharedMessage) -> Result<()>;

    fn on_video(&mut self, msg: &SharedMessage) -> Result<()>;

    fn on_unpublish(&mut self);
}

#[derive(Default)]
pub struct OriginHub {
    children: Vec<Box<dyn HubChild>>,
    active: bool,
}

impl OriginHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, child: Box<dyn HubChild>) {
        self.children.push(child);
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn on_publish(&mut self, vhost: &str, app: &str, stream: &str) {
        self.active = true;
        for child in self.children.iter_mut() {
            if let Err(e) = child.on_publish(vhost, app, stream) {
                log::warn!("hub child {} publish failed: {}", child.name(), e);
            }
        }
    }

    pub fn on_unpublish(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        for child in self.children.iter_mut() {
            child.on_unpublish();
        }
    }

    pub fn on_meta_data(&mut self, msg: &SharedMessage) {
        self.dispatch(msg, |child, m| child.on_meta_data(m));
    }

    pub fn on_audio(&mut self, msg: &SharedMessage) {
        self.dispatch(msg, |child, m| child.on_audio(m));
    }

    pub fn on_video(&mut self, msg: &SharedMessage) {
        self.dispatch(msg, |child, m| child.on_video(m));
    }

    /// Restarts one child kind in place, for narrow reloads (e.g. hls-only).
    pub fn restart_child(&mut self, name: &str, vhost: &str, app: &str, stream: &str) {
        for child in self.children.iter_mut() {
            if child.name() != name {
                continue;
            }
            child.on_unpublish();
            if self.active {
                if let Err(e) = child.on_publish(vhost, app, stream) {
                    log::warn!("hub child {} restart failed: {}", child.name(), e);
                }
            }
        }
    }

    fn dispatch<F>(&mut self, msg: &SharedMessage, f: F)
    where
        F: Fn(&mut Box<dyn HubChild>, &SharedMessage) -> Result<()>,
    {
        if !self.active {
            return;
        }
        for child in self.children.iter_mut() {
            if let Err(e) = f(child, msg) {
                log::warn!("hub child {} failed: {}, isolate it", child.name(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use shared::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Child {
        name: String,
        fail: bool,
        frames: Arc<AtomicUsize>,
    }

    impl HubChild for Child {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_publish(&mut self, _: &str, _: &str, _: &str) -> Result<()> {
            Ok(())
        }

        fn on_audio(&mut self, _: &SharedMessage) -> Result<()> {
            self.count()
        }

        fn on_video(&mut self, _: &SharedMessage) -> Result<()> {
            self.count()
        }

        fn on_unpublish(&mut self) {}
    }

    impl Child {
        fn count(&self) -> Result<()> {
            if self.fail {
                return Err(Error::Other("boom".to_string()));
            }
            self.frames.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_failed_child_is_isolated() {
        let frames = Arc::new(AtomicUsize::new(0));
        let mut hub = OriginHub::new();
        hub.attach(Box::new(Child {
            name: "hls".to_string(),
            fail: true,
            frames: frames.clone(),
        }));
        hub.attach(Box::new(Child {
            name: "dash".to_string(),
            fail: false,
            frames: frames.clone(),
        }));
        hub.on_publish("v", "a", "s");
        let msg = SharedMessage::video(0, Bytes::from_static(&[0x17, 0x01]));
        hub.on_video(&msg);
        // The healthy child still got the frame.
        assert_eq!(frames.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_inactive_hub_drops_frames() {
        let frames = Arc::new(AtomicUsize::new(0));
        let mut hub = OriginHub::new();
        hub.attach(Box::new(Child {
            name: "hls".to_string(),
            fail: false,
            frames: frames.clone(),
        }));
        let msg = SharedMessage::video(0, Bytes::from_static(&[0x17, 0x01]));
        hub.on_video(&msg);
        assert_eq!(frames.load(Ordering::SeqCst), 0);
    }
}
