//! The RTC source: RTP-domain counterpart of the live hub, plus the
//! bridges between domains.

use crate::frame::{RtcFrame, RtpPacketizer};
use crate::rtp::RtpPacket;
use live::{LiveSource, SharedMessage, StreamBridge, StreamKey};
use shared::error::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;

/// One track advertised by an RTC publisher.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackDesc {
    pub ssrc: u32,
    pub payload_type: u8,
    pub is_video: bool,
    /// Retransmission SSRC when the peer negotiates rtx.
    pub rtx_ssrc: Option<u32>,
    pub twcc_id: Option<u8>,
}

/// Per-subscriber RTP queue.
pub struct RtcConsumer {
    queue: Mutex<VecDeque<RtpPacket>>,
    notify: Notify,
    capacity: usize,
}

impl RtcConsumer {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    fn enqueue(&self, packet: RtpPacket) {
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(packet);
        self.notify.notify_one();
    }

    pub fn dump(&self, max: usize) -> Vec<RtpPacket> {
        let mut queue = self.queue.lock().unwrap();
        let n = if max == 0 { queue.len() } else { max.min(queue.len()) };
        queue.drain(..n).collect()
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

struct RtcSourceState {
    tracks: Vec<TrackDesc>,
    consumers: Vec<Weak<RtcConsumer>>,
    publishing: bool,
}

/// Holds RTP packets and track descriptions for one stream in the RTC
/// domain.
pub struct RtcSource {
    key: StreamKey,
    state: Mutex<RtcSourceState>,
}

impl RtcSource {
    fn new(key: StreamKey) -> Arc<Self> {
        Arc::new(Self {
            key,
            state: Mutex::new(RtcSourceState {
                tracks: Vec::new(),
                consumers: Vec::new(),
                publishing: false,
            }),
        })
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn can_publish(&self) -> bool {
        !self.state.lock().unwrap().publishing
    }

    pub fn on_publish(&self, tracks: Vec<TrackDesc>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.publishing {
            return Err(Error::ErrSourceBusy.wrap(format!("rtc publish {}", self.key)));
        }
        state.publishing = true;
        state.tracks = tracks;
        Ok(())
    }

    pub fn on_unpublish(&self) {
        let mut state = self.state.lock().unwrap();
        state.publishing = false;
        state.tracks.clear();
    }

    pub fn tracks(&self) -> Vec<TrackDesc> {
        self.state.lock().unwrap().tracks.clone()
    }

    pub fn create_consumer(&self) -> Arc<RtcConsumer> {
        let consumer = Arc::new(RtcConsumer::new(2048));
        self.state
            .lock()
            .unwrap()
            .consumers
            .push(Arc::downgrade(&consumer));
        consumer
    }

    pub fn consumer_count(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.consumers.retain(|c| c.upgrade().is_some());
        state.consumers.len()
    }

    /// Fans one RTP packet out to every consumer.
    pub fn on_rtp(&self, packet: &RtpPacket) {
        let mut state = self.state.lock().unwrap();
        state.consumers.retain(|c| c.upgrade().is_some());
        for consumer in state.consumers.iter().filter_map(|c| c.upgrade()) {
            consumer.enqueue(packet.clone());
        }
    }
}

/// The map of RTC sources, parallel to the live source manager.
#[derive(Default)]
pub struct RtcSourceManager {
    sources: Mutex<HashMap<StreamKey, Arc<RtcSource>>>,
}

impl RtcSourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fetch_or_create(&self, key: &StreamKey) -> Arc<RtcSource> {
        let mut sources = self.sources.lock().unwrap();
        sources
            .entry(key.clone())
            .or_insert_with(|| {
                log::info!("create rtc source {}", key);
                RtcSource::new(key.clone())
            })
            .clone()
    }

    pub fn fetch(&self, key: &StreamKey) -> Option<Arc<RtcSource>> {
        self.sources.lock().unwrap().get(key).cloned()
    }
}

/// Bridges an RTMP-domain stream into the RTC domain: AV messages are
/// packetized into RTP and fanned out to RTC consumers.
pub struct RtmpToRtcBridge {
    source: Arc<RtcSource>,
    packetizer: RtpPacketizer,
    video_ssrc: u32,
}

impl RtmpToRtcBridge {
    pub fn new(source: Arc<RtcSource>, video_ssrc: u32, video_pt: u8) -> Self {
        Self {
            packetizer: RtpPacketizer::new(video_ssrc, video_pt),
            video_ssrc,
            source,
        }
    }
}

impl StreamBridge for RtmpToRtcBridge {
    fn name(&self) -> &str {
        "rtmp-to-rtc"
    }

    fn on_publish(&mut self) -> Result<()> {
        self.source.on_publish(vec![TrackDesc {
            ssrc: self.video_ssrc,
            payload_type: 102,
            is_video: true,
            rtx_ssrc: None,
            twcc_id: None,
        }])
    }

    fn on_frame(&mut self, msg: &SharedMessage) -> Result<()> {
        if !msg.is_video() {
            // Opus transcoding is out of scope; audio stays in its domain.
            return Ok(());
        }
        for packet in self.packetizer.packetize_video(msg)? {
            self.source.on_rtp(&packet);
        }
        Ok(())
    }

    fn on_unpublish(&mut self) {
        self.source.on_unpublish();
    }
}

/// Bridges RTC publisher frames into the live (RTMP-shaped) hub.
pub struct RtcToLiveBridge {
    source: Arc<LiveSource>,
}

impl RtcToLiveBridge {
    pub fn new(source: Arc<LiveSource>) -> Self {
        Self { source }
    }

    /// Feeds one frame produced by a publish track.
    pub fn on_frame(&self, frame: &RtcFrame) -> Result<()> {
        match frame {
            RtcFrame::Video(msg) => self.source.on_video(msg.clone()),
            // Raw opus cannot enter the RTMP domain without a transcoder.
            RtcFrame::OpusAudio { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::rtp::RtpHeader;

    fn key() -> StreamKey {
        StreamKey::new("__defaultVhost__", "live", "rtcstream")
    }

    #[test]
    fn test_publisher_exclusivity() {
        let mgr = RtcSourceManager::new();
        let source = mgr.fetch_or_create(&key());
        source.on_publish(vec![]).unwrap();
        assert!(!source.can_publish());
        assert!(source.on_publish(vec![]).is_err());
        source.on_unpublish();
        assert!(source.can_publish());
    }

    #[test]
    fn test_rtp_fanout() {
        let mgr = RtcSourceManager::new();
        let source = mgr.fetch_or_create(&key());
        let a = source.create_consumer();
        let b = source.create_consumer();
        let pkt = RtpPacket {
            header: RtpHeader {
                ssrc: 1,
                sequence_number: 4,
                ..Default::default()
            },
            payload: Bytes::from_static(&[1, 2, 3]),
        };
        source.on_rtp(&pkt);
        assert_eq!(a.dump(0).len(), 1);
        assert_eq!(b.dump(0).len(), 1);
        drop(a);
        assert_eq!(source.consumer_count(), 1);
    }

    #[test]
    fn test_consumer_queue_bounded() {
        let mgr = RtcSourceManager::new();
        let source = mgr.fetch_or_create(&key());
        let c = source.create_consumer();
        for seq in 0..3000u16 {
            source.on_rtp(&RtpPacket {
                header: RtpHeader {
                    sequence_number: seq,
                    ..Default::default()
                },
                payload: Bytes::new(),
            });
        }
        let dumped = c.dump(0);
        assert!(dumped.len() <= 2048);
        // The oldest packets were dropped, not the newest.
        assert_eq!(dumped.last().unwrap().header.sequence_number, 2999);
    }

    #[test]
    fn test_rtmp_to_rtc_bridge_packetizes() {
        use codec::{avc, flv};
        let mgr = RtcSourceManager::new();
        let source = mgr.fetch_or_create(&key());
        let consumer = source.create_consumer();
        let mut bridge = RtmpToRtcBridge::new(source.clone(), 7777, 102);
        bridge.on_publish().unwrap();

        let sh = SharedMessage::video(
            0,
            avc::mux_avc2flv(
                &avc::mux_sequence_header(&[0x67, 0x42, 0xc0, 0x1f], &[0x68, 0xcb]),
                flv::FRAME_TYPE_KEYFRAME,
                flv::AVC_PACKET_SEQUENCE_HEADER,
                0,
            ),
        );
        bridge.on_frame(&sh).unwrap();
        let kf = SharedMessage::video(
            40,
            avc::mux_avc2flv(
                &avc::mux_ipb_frame(&[0x65, 1, 2, 3]),
                flv::FRAME_TYPE_KEYFRAME,
                flv::AVC_PACKET_NALU,
                0,
            ),
        );
        bridge.on_frame(&kf).unwrap();

        let packets = consumer.dump(0);
        assert!(!packets.is_empty());
        assert!(packets.iter().all(|p| p.header.ssrc == 7777));
        // Audio is ignored without a transcoder.
        let audio = SharedMessage::audio(50, Bytes::from_static(&[0xaf, 0x01, 0xff]));
        bridge.on_frame(&audio).unwrap();
        assert!(consumer.dump(0).is_empty());
    }
}
