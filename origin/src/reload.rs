//! Reload dispatcher: diffs a freshly parsed config against the running one
//! and fires narrowly scoped events, so unrelated subsystems never restart.

use crate::config::Config;
use shared::context::{generate_cid, ContextId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadEvent {
    ListenChanged,
    VhostAdded(String),
    /// Includes "disabled ⇒ removed".
    VhostRemoved(String),
    VhostPlayChanged(String),
    VhostForwardChanged(String),
    VhostHlsChanged(String),
    VhostDashChanged(String),
    VhostRtcChanged(String),
    VhostSrtChanged(String),
    VhostHooksChanged(String),
    BreakerChanged,
}

/// Reload outcome register, queried by the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReloadState {
    #[default]
    Init,
    Success,
    Error,
}

pub trait ReloadHandler: Send {
    /// Which events this handler cares about; others are never delivered.
    fn interested(&self, event: &ReloadEvent) -> bool;

    fn on_reload(&mut self, event: &ReloadEvent);
}

/// Computes the directive-level diff between two config trees.
pub fn diff(old: &Config, new: &Config) -> Vec<ReloadEvent> {
    let mut events = Vec::new();

    if old.server != new.server {
        events.push(ReloadEvent::ListenChanged);
    }
    if old.breaker != new.breaker {
        events.push(ReloadEvent::BreakerChanged);
    }

    for (name, new_vhost) in &new.vhosts {
        match old.vhosts.get(name) {
            None => {
                if new_vhost.is_enabled() {
                    events.push(ReloadEvent::VhostAdded(name.clone()));
                }
            }
            Some(old_vhost) => {
                // Disabling a vhost is removal, not a field change.
                if old_vhost.is_enabled() && !new_vhost.is_enabled() {
                    events.push(ReloadEvent::VhostRemoved(name.clone()));
                    continue;
                }
                if !old_vhost.is_enabled() && new_vhost.is_enabled() {
                    events.push(ReloadEvent::VhostAdded(name.clone()));
                    continue;
                }
                if old_vhost.play != new_vhost.play {
                    events.push(ReloadEvent::VhostPlayChanged(name.clone()));
                }
                if old_vhost.forward != new_vhost.forward {
                    events.push(ReloadEvent::VhostForwardChanged(name.clone()));
                }
                if old_vhost.hls != new_vhost.hls {
                    events.push(ReloadEvent::VhostHlsChanged(name.clone()));
                }
                if old_vhost.dash != new_vhost.dash {
                    events.push(ReloadEvent::VhostDashChanged(name.clone()));
                }
                if old_vhost.rtc != new_vhost.rtc {
                    events.push(ReloadEvent::VhostRtcChanged(name.clone()));
                }
                if old_vhost.srt != new_vhost.srt {
                    events.push(ReloadEvent::VhostSrtChanged(name.clone()));
                }
                if old_vhost.http_hooks != new_vhost.http_hooks {
                    events.push(ReloadEvent::VhostHooksChanged(name.clone()));
                }
            }
        }
    }
    for name in old.vhosts.keys() {
        if !new.vhosts.contains_key(name) && old.vhosts[name].is_enabled() {
            events.push(ReloadEvent::VhostRemoved(name.clone()));
        }
    }
    events
}

/// Owns the running config and the subscriber list.
pub struct ReloadDispatcher {
    config: Config,
    handlers: Vec<Box<dyn ReloadHandler>>,
    state: ReloadState,
    last_reload_cid: Option<ContextId>,
}

impl ReloadDispatcher {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            handlers: Vec::new(),
            state: ReloadState::Init,
            last_reload_cid: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> ReloadState {
        self.state
    }

    pub fn last_reload_cid(&self) -> Option<&ContextId> {
        self.last_reload_cid.as_ref()
    }

    pub fn subscribe(&mut self, handler: Box<dyn ReloadHandler>) {
        self.handlers.push(handler);
    }

    /// Applies a new config text: on parse failure the previous config is
    /// retained and the state register reports the error.
    pub fn reload(&mut self, text: &str) -> Vec<ReloadEvent> {
        let cid = generate_cid();
        let new = match Config::parse(text) {
            Ok(c) => c,
            Err(e) => {
                log::error!("reload [{}] failed, keep previous config: {}", cid, e);
                self.state = ReloadState::Error;
                self.last_reload_cid = Some(cid);
                return Vec::new();
            }
        };
        let events = diff(&self.config, &new);
        for event in &events {
            for handler in self.handlers.iter_mut() {
                if handler.interested(event) {
                    handler.on_reload(event);
                }
            }
        }
        log::info!("reload [{}] ok, {} events", cid, events.len());
        self.config = new;
        self.state = ReloadState::Success;
        self.last_reload_cid = Some(cid);
        events
    }
}
