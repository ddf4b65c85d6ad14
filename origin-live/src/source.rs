//! The per-stream live source and the manager map that owns every source.

use crate::bridge::StreamBridge;
use crate::gop::GopCache;
use crate::hub::{HubChild, OriginHub};
use crate::jitter::JitterAlgorithm;
use crate::message::SharedMessage;
use crate::meta::MetaCache;
use crate::mix::MixQueue;
use crate::queue::Consumer;
use codec::format::Format;
use shared::context::ContextId;
use shared::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// vhost/app/stream triple identifying one source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub vhost: String,
    pub app: String,
    pub stream: String,
}

impl StreamKey {
    pub fn new(vhost: &str, app: &str, stream: &str) -> Self {
        Self {
            vhost: vhost.to_string(),
            app: app.to_string(),
            stream: stream.to_string(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.vhost, self.app, self.stream)
    }
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub gop_cache: bool,
    pub gop_cache_max_frames: usize,
    /// Consumer queue duration budget, ms.
    pub queue_size_ms: i64,
    pub mix_correct: bool,
    pub atc: bool,
    pub jitter: JitterAlgorithm,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            gop_cache: true,
            gop_cache_max_frames: 2500,
            queue_size_ms: 30_000,
            mix_correct: false,
            atc: false,
            jitter: JitterAlgorithm::Full,
        }
    }
}

struct SourceState {
    format: Format,
    meta: MetaCache,
    gop: GopCache,
    mix: MixQueue,
    hub: OriginHub,
    bridges: Vec<Box<dyn StreamBridge>>,
    consumers: Vec<Weak<Consumer>>,
    publishing: bool,
    /// The publisher coroutine's context id; doubles as the source id that
    /// consumers report on change.
    source_id: Option<ContextId>,
    last_active: Instant,
}

/// The hub for one stream: deduplicates the publisher into every consumer
/// queue, keeps the caches hot, and feeds the origin hub and bridges.
pub struct LiveSource {
    key: StreamKey,
    config: SourceConfig,
    state: Mutex<SourceState>,
}

impl LiveSource {
    fn new(key: StreamKey, config: SourceConfig) -> Arc<Self> {
        let mut gop = GopCache::new();
        gop.set(config.gop_cache);
        gop.set_max_frames(config.gop_cache_max_frames);
        Arc::new(Self {
            key,
            config,
            state: Mutex::new(SourceState {
                format: Format::new(),
                meta: MetaCache::new(),
                gop,
                mix: MixQueue::new(),
                hub: OriginHub::new(),
                bridges: Vec::new(),
                consumers: Vec::new(),
                publishing: false,
                source_id: None,
                last_active: Instant::now(),
            }),
        })
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    /// Snapshot of the current codec descriptor.
    pub fn format(&self) -> Format {
        self.state.lock().unwrap().format.clone()
    }

    pub fn source_id(&self) -> Option<ContextId> {
        self.state.lock().unwrap().source_id.clone()
    }

    pub fn attach_hub_child(&self, child: Box<dyn HubChild>) {
        self.state.lock().unwrap().hub.attach(child);
    }

    pub fn attach_bridge(&self, bridge: Box<dyn StreamBridge>) {
        self.state.lock().unwrap().bridges.push(bridge);
    }

    /// False while another publisher holds the stream.
    pub fn can_publish(&self) -> bool {
        !self.state.lock().unwrap().publishing
    }

    pub fn is_publishing(&self) -> bool {
        self.state.lock().unwrap().publishing
    }

    pub fn consumer_count(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.consumers.retain(|c| c.upgrade().is_some());
        state.consumers.len()
    }

    pub fn on_publish(&self, publisher: ContextId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.publishing {
            return Err(Error::ErrSourceBusy.wrap(format!("publish {}", self.key)));
        }
        log::info!("new publisher of {}, source_id={}", self.key, publisher);
        state.publishing = true;
        state.source_id = Some(publisher);
        state.last_active = Instant::now();
        // A fresh publisher must not inherit stale headers.
        state.meta.update_previous_and_clear();
        state.mix.clear();
        let key = self.key.clone();
        state.hub.on_publish(&key.vhost, &key.app, &key.stream);
        for bridge in state.bridges.iter_mut() {
            if let Err(e) = bridge.on_publish() {
                log::warn!("bridge {} publish failed: {}", bridge.name(), e);
            }
        }
        for consumer in state.consumers.iter().filter_map(|c| c.upgrade()) {
            consumer.update_source_id();
        }
        Ok(())
    }

    pub fn on_unpublish(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.publishing {
            return;
        }
        log::info!("publisher of {} gone", self.key);
        state.publishing = false;
        state.last_active = Instant::now();
        state.gop.clear();
        state.mix.clear();
        state.hub.on_unpublish();
        for bridge in state.bridges.iter_mut() {
            bridge.on_unpublish();
        }
        // Wake parked play sessions so they can notice the teardown.
        for consumer in state.consumers.iter().filter_map(|c| c.upgrade()) {
            consumer.wakeup();
        }
    }

    pub fn on_meta_data(&self, msg: SharedMessage) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.meta.update_data(&msg);
        state.hub.on_meta_data(&msg);
        Self::deliver(&mut state, &msg, &self.config);
        Ok(())
    }

    pub fn on_audio(&self, msg: SharedMessage) -> Result<()> {
        self.on_av(msg)
    }

    pub fn on_video(&self, msg: SharedMessage) -> Result<()> {
        self.on_av(msg)
    }

    fn on_av(&self, msg: SharedMessage) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.last_active = Instant::now();

        if !self.config.mix_correct {
            return Self::ingest(&mut state, msg, &self.config, &self.key);
        }

        // Mix-correct: stage through the DTS-ordered queue and drain
        // whatever it releases.
        state.mix.push(msg);
        while let Some(m) = state.mix.pop() {
            Self::ingest(&mut state, m, &self.config, &self.key)?;
        }
        Ok(())
    }

    fn ingest(
        state: &mut SourceState,
        msg: SharedMessage,
        config: &SourceConfig,
        key: &StreamKey,
    ) -> Result<()> {
        // Sequence headers update the format and the cache; the format
        // ignores everything else by contract.
        let r = if msg.is_video() {
            state.format.on_video(&msg.payload)
        } else {
            state.format.on_audio(&msg.payload)
        };
        if let Err(e) = r {
            e.wrap(format!("parse {}", key)).reset("ingest keeps flowing");
        }
        if msg.is_video_sequence_header() {
            state.meta.update_vsh(&msg);
        }
        if msg.is_audio_sequence_header() {
            state.meta.update_ash(&msg);
        }

        state.gop.cache(&msg);

        if msg.is_audio() {
            state.hub.on_audio(&msg);
        } else {
            state.hub.on_video(&msg);
        }
        for bridge in state.bridges.iter_mut() {
            if let Err(e) = bridge.on_frame(&msg) {
                log::warn!("bridge {} frame failed: {}", bridge.name(), e);
            }
        }

        state.consumers.retain(|c| c.upgrade().is_some());
        for consumer in state.consumers.iter().filter_map(|c| c.upgrade()) {
            consumer.enqueue(msg.clone(), config.atc, config.jitter);
        }
        Ok(())
    }

    fn deliver(state: &mut SourceState, msg: &SharedMessage, config: &SourceConfig) {
        state.consumers.retain(|c| c.upgrade().is_some());
        for consumer in state.consumers.iter().filter_map(|c| c.upgrade()) {
            consumer.enqueue(msg.clone(), config.atc, config.jitter);
        }
    }

    /// Creates and registers a consumer queue for one subscriber.
    pub fn create_consumer(&self) -> Arc<Consumer> {
        let consumer = Arc::new(Consumer::new(self.config.queue_size_ms));
        let mut state = self.state.lock().unwrap();
        state.consumers.push(Arc::downgrade(&consumer));
        state.last_active = Instant::now();
        consumer
    }

    /// The subscriber bootstrap: metadata, video sh, audio sh, then the
    /// cached GOP, strictly in that order, before any live message.
    pub fn consumer_dumps(
        &self,
        consumer: &Consumer,
        dump_sh: bool,
        dump_meta: bool,
        dump_gop: bool,
    ) {
        let state = self.state.lock().unwrap();
        for msg in state.meta.dumps(dump_meta, dump_sh) {
            consumer.enqueue(msg, self.config.atc, self.config.jitter);
        }
        if dump_gop {
            for msg in state.gop.dump() {
                consumer.enqueue(msg.clone(), self.config.atc, self.config.jitter);
            }
        }
        log::info!(
            "consumer bootstrap of {}: sh={} meta={} gop={} (gop_start={}ms)",
            self.key,
            dump_sh,
            dump_meta,
            dump_gop,
            state.gop.start_time()
        );
    }

    /// Narrow reload: restart one hub child kind in place (e.g. hls-only),
    /// leaving every other collaborator running.
    pub fn restart_hub_child(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        let key = self.key.clone();
        state
            .hub
            .restart_child(name, &key.vhost, &key.app, &key.stream);
    }

    /// True when neither publisher nor consumers have touched the source
    /// within the die window.
    fn expired(&self, now: Instant, die_window: Duration) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.publishing {
            return false;
        }
        state.consumers.retain(|c| c.upgrade().is_some());
        if !state.consumers.is_empty() {
            return false;
        }
        now.duration_since(state.last_active) >= die_window
    }
}

/// Owns every live source, keyed by vhost/app/stream. The map lives behind
/// a mutex: lookups come from listener coroutines and from admin threads.
pub struct SourceManager {
    sources: Mutex<HashMap<StreamKey, Arc<LiveSource>>>,
    die_window: Duration,
}

impl SourceManager {
    pub fn new(die_window: Duration) -> Self {
        Self {
            sources: Mutex::new(HashMap::new()),
            die_window,
        }
    }

    /// Fetches the source, creating it on first publish or subscribe.
    pub fn fetch_or_create(&self, key: &StreamKey, config: SourceConfig) -> Arc<LiveSource> {
        let mut sources = self.sources.lock().unwrap();
        sources
            .entry(key.clone())
            .or_insert_with(|| {
                log::info!("create live source {}", key);
                LiveSource::new(key.clone(), config)
            })
            .clone()
    }

    pub fn fetch(&self, key: &StreamKey) -> Option<Arc<LiveSource>> {
        self.sources.lock().unwrap().get(key).cloned()
    }

    /// Snapshot of every live source, e.g. for reload fan-out.
    pub fn all(&self) -> Vec<Arc<LiveSource>> {
        self.sources.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sources.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.lock().unwrap().is_empty()
    }

    /// Disposes sources idle past the die window; run on a timer.
    pub fn cleanup(&self, now: Instant) {
        let mut sources = self.sources.lock().unwrap();
        sources.retain(|key, source| {
            let dead = source.expired(now, self.die_window);
            if dead {
                log::info!("dispose idle source {}", key);
            }
            !dead
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use shared::context::generate_cid;

    fn key() -> StreamKey {
        StreamKey::new("__defaultVhost__", "live", "livestream")
    }

    fn metadata() -> SharedMessage {
        SharedMessage::amf0_data(Bytes::from_static(b"onMetaData"))
    }

    fn vsh() -> SharedMessage {
        SharedMessage::video(0, Bytes::from_static(&[0x17, 0x00, 0, 0, 0, 1]))
    }

    fn ash() -> SharedMessage {
        SharedMessage::audio(0, Bytes::from_static(&[0xaf, 0x00, 0x12, 0x10]))
    }

    fn keyframe(ts: i64) -> SharedMessage {
        SharedMessage::video(ts, Bytes::from_static(&[0x17, 0x01, 0, 0, 0]))
    }

    fn inter(ts: i64) -> SharedMessage {
        SharedMessage::video(ts, Bytes::from_static(&[0x27, 0x01, 0, 0, 0]))
    }

    fn audio(ts: i64) -> SharedMessage {
        SharedMessage::audio(ts, Bytes::from_static(&[0xaf, 0x01, 0xff]))
    }

    fn publish_some(source: &Arc<LiveSource>) {
        source.on_publish(generate_cid()).unwrap();
        source.on_meta_data(metadata()).unwrap();
        source.on_video(vsh()).unwrap();
        source.on_audio(ash()).unwrap();
        source.on_video(keyframe(100)).unwrap();
        source.on_video(inter(140)).unwrap();
        source.on_audio(audio(150)).unwrap();
    }

    #[test]
    fn test_publisher_exclusivity() {
        let manager = SourceManager::new(Duration::from_secs(10));
        let source = manager.fetch_or_create(&key(), SourceConfig::default());
        assert!(source.can_publish());
        source.on_publish(generate_cid()).unwrap();
        assert!(!source.can_publish());
        let err = source.on_publish(generate_cid()).unwrap_err();
        assert_eq!(err.root_cause(), &Error::ErrSourceBusy);
        source.on_unpublish();
        assert!(source.can_publish());
    }

    #[test]
    fn test_consumer_bootstrap_order() {
        let manager = SourceManager::new(Duration::from_secs(10));
        let source = manager.fetch_or_create(
            &key(),
            SourceConfig {
                jitter: JitterAlgorithm::Off,
                ..Default::default()
            },
        );
        publish_some(&source);

        let consumer = source.create_consumer();
        source.consumer_dumps(&consumer, true, true, true);
        let msgs = consumer.dump_packets(0);

        // metadata, vsh, ash, then the cached GOP in order.
        assert!(msgs.len() >= 5);
        assert!(!msgs[0].is_av());
        assert!(msgs[1].is_video_sequence_header());
        assert!(msgs[2].is_audio_sequence_header());
        assert!(msgs[3].is_video_keyframe());
        // No live frame precedes the headers it depends on.
        assert!(msgs[..3]
            .iter()
            .all(|m| !m.is_av() || m.is_video_sequence_header() || m.is_audio_sequence_header()));
    }

    #[test]
    fn test_live_fanout_reaches_all_consumers() {
        let manager = SourceManager::new(Duration::from_secs(10));
        let source = manager.fetch_or_create(
            &key(),
            SourceConfig {
                jitter: JitterAlgorithm::Off,
                ..Default::default()
            },
        );
        publish_some(&source);
        let a = source.create_consumer();
        let b = source.create_consumer();
        source.on_video(inter(180)).unwrap();
        assert_eq!(a.dump_packets(0).len(), 1);
        assert_eq!(b.dump_packets(0).len(), 1);
    }

    #[test]
    fn test_dropped_consumer_is_pruned() {
        let manager = SourceManager::new(Duration::from_secs(10));
        let source = manager.fetch_or_create(&key(), SourceConfig::default());
        publish_some(&source);
        let a = source.create_consumer();
        assert_eq!(source.consumer_count(), 1);
        drop(a);
        assert_eq!(source.consumer_count(), 0);
    }

    #[test]
    fn test_mix_correct_orders_dts() {
        let manager = SourceManager::new(Duration::from_secs(10));
        let source = manager.fetch_or_create(
            &key(),
            SourceConfig {
                mix_correct: true,
                jitter: JitterAlgorithm::Off,
                ..Default::default()
            },
        );
        source.on_publish(generate_cid()).unwrap();
        let consumer = source.create_consumer();

        // Feed interleaved out of order.
        source.on_video(inter(80)).unwrap();
        source.on_audio(audio(20)).unwrap();
        source.on_video(inter(40)).unwrap();
        source.on_audio(audio(60)).unwrap();
        source.on_video(inter(120)).unwrap();
        source.on_audio(audio(100)).unwrap();

        let out = consumer.dump_packets(0);
        let ts: Vec<i64> = out.iter().map(|m| m.header.timestamp).collect();
        let mut sorted = ts.clone();
        sorted.sort_unstable();
        assert_eq!(ts, sorted);
    }

    #[test]
    fn test_source_dies_after_window() {
        let manager = SourceManager::new(Duration::from_millis(0));
        let source = manager.fetch_or_create(&key(), SourceConfig::default());
        publish_some(&source);
        assert_eq!(manager.len(), 1);
        // Still publishing: never disposed.
        manager.cleanup(Instant::now());
        assert_eq!(manager.len(), 1);
        source.on_unpublish();
        drop(source);
        manager.cleanup(Instant::now() + Duration::from_secs(1));
        assert_eq!(manager.len(), 0);
    }

    #[test]
    fn test_new_publisher_clears_current_headers() {
        let manager = SourceManager::new(Duration::from_secs(10));
        let source = manager.fetch_or_create(&key(), SourceConfig::default());
        publish_some(&source);
        source.on_unpublish();
        source.on_publish(generate_cid()).unwrap();

        // A consumer joining before the new headers arrive sees none.
        let consumer = source.create_consumer();
        source.consumer_dumps(&consumer, true, true, false);
        assert!(consumer.dump_packets(0).is_empty());
    }
}
