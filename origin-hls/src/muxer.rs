//! The HLS muxer: one TS segment at a time, reaped on keyframes.

use bytes::{BufMut, Bytes, BytesMut};
use codec::aac::AdtsCodec;
use codec::format::{Format, VideoCodecId};
use codec::mpegts::{
    TsWriter, PID_AUDIO, PID_VIDEO, SID_AUDIO, SID_VIDEO, STREAM_TYPE_AAC, STREAM_TYPE_H264,
    STREAM_TYPE_H265,
};
use codec::{aac, avc, hevc};
use live::SharedMessage;
use shared::error::{Error, Result, WrapExt};
use shared::fragment::{Fragment, FragmentWindow};
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct HlsConfig {
    /// Root directory segments and playlists are written under.
    pub path: PathBuf,
    /// Target fragment duration, ms.
    pub fragment_ms: i64,
    /// Total duration budget of the sliding window, ms.
    pub window_ms: i64,
    /// Delete segments that slide out of the window.
    pub cleanup: bool,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./html"),
            fragment_ms: 10_000,
            window_ms: 60_000,
            cleanup: true,
        }
    }
}

/// Fired after each reap so the hook layer can post `on_hls`.
#[derive(Debug, Clone)]
pub struct HlsReapEvent {
    pub vhost: String,
    pub app: String,
    pub stream: String,
    pub path: PathBuf,
    pub m3u8_path: PathBuf,
    pub sequence_no: u64,
    pub duration_ms: i64,
}

struct CurrentSegment {
    fragment: Fragment,
    file: File,
}

pub struct HlsMuxer {
    config: HlsConfig,
    format: Format,
    writer: TsWriter,
    current: Option<CurrentSegment>,
    window: FragmentWindow,
    sequence_no: u64,
    vhost: String,
    app: String,
    stream: String,
    on_reap: Option<Box<dyn Fn(HlsReapEvent) + Send>>,
}

impl HlsMuxer {
    pub fn new(config: HlsConfig) -> Self {
        Self {
            config,
            format: Format::new(),
            writer: TsWriter::new(STREAM_TYPE_H264, STREAM_TYPE_AAC),
            current: None,
            window: FragmentWindow::new(),
            sequence_no: 0,
            vhost: String::new(),
            app: String::new(),
            stream: String::new(),
            on_reap: None,
        }
    }

    /// Installs the reap callback, e.g. the on_hls hook dispatcher.
    pub fn set_on_reap(&mut self, f: Box<dyn Fn(HlsReapEvent) + Send>) {
        self.on_reap = Some(f);
    }

    pub fn on_publish(&mut self, vhost: &str, app: &str, stream: &str) -> Result<()> {
        self.vhost = vhost.to_string();
        self.app = app.to_string();
        self.stream = stream.to_string();
        self.sequence_no = 0;
        self.format = Format::new();
        fs::create_dir_all(self.segment_dir())
            .map_err(|e| Error::Io(e.to_string()))
            .wrap("create hls home")?;
        log::info!("hls: publish {}/{}/{}", vhost, app, stream);
        Ok(())
    }

    pub fn on_unpublish(&mut self) {
        // Reap whatever is in flight so the tail is playable.
        if self.current.is_some() {
            if let Err(e) = self.reap_segment() {
                e.reset("hls unpublish");
            }
        }
        self.window.dispose(self.config.cleanup);
        if self.config.cleanup {
            let _ = fs::remove_file(self.m3u8_path());
        }
        log::info!("hls: unpublish {}/{}", self.app, self.stream);
    }

    pub fn on_video(&mut self, msg: &SharedMessage) -> Result<()> {
        self.format.on_video(&msg.payload).wrap("hls video sh")?;
        if msg.is_video_sequence_header() {
            return Ok(());
        }
        let Some(video) = self.format.video.clone() else {
            return Ok(());
        };
        let keyframe = msg.is_video_keyframe();
        let dts = msg.header.timestamp;

        // Reap before writing the next GOP's first frame.
        if keyframe && self.current_duration(dts) >= self.config.fragment_ms {
            self.reap_segment()?;
        }
        self.ensure_segment(dts)?;

        let annexb = match video.id {
            Some(VideoCodecId::Hevc) => self.hevc_annexb(msg, keyframe, &video)?,
            _ => self.avc_annexb(msg, keyframe, &video)?,
        };
        if annexb.is_empty() {
            return Ok(());
        }

        let cts = if msg.payload.len() >= 5 {
            ((msg.payload[2] as u32) << 16) | ((msg.payload[3] as u32) << 8) | msg.payload[4] as u32
        } else {
            0
        };
        let pts = (dts as u64 + cts as u64) * 90;
        let mut out = BytesMut::new();
        self.writer
            .write_pes(&mut out, PID_VIDEO, SID_VIDEO, &annexb, pts, dts as u64 * 90, keyframe);
        self.append_current(&out, dts)
    }

    pub fn on_audio(&mut self, msg: &SharedMessage) -> Result<()> {
        self.format.on_audio(&msg.payload).wrap("hls audio sh")?;
        if msg.is_audio_sequence_header() {
            return Ok(());
        }
        let Some(audio) = self.format.audio.clone() else {
            return Ok(());
        };
        if msg.payload.len() < 2 {
            return Ok(());
        }
        let dts = msg.header.timestamp;

        // Pure-audio streams reap on duration alone.
        if self.format.video.is_none() && self.current_duration(dts) >= self.config.fragment_ms {
            self.reap_segment()?;
        }
        self.ensure_segment(dts)?;

        let codec = AdtsCodec {
            protection_absent: 1,
            aac_object: audio.object,
            sampling_frequency_index: audio.sampling_frequency_index,
            channel_configuration: audio.channels,
            frame_length: 0,
            sound_rate: codec::aac::FlvSoundRate::R44100,
            sound_type: 1,
            sound_size: 1,
        };
        let adts = aac::mux_adts(&codec, &msg.payload[2..]);
        let mut out = BytesMut::new();
        self.writer.write_pes(
            &mut out,
            PID_AUDIO,
            SID_AUDIO,
            &adts,
            dts as u64 * 90,
            dts as u64 * 90,
            false,
        );
        self.append_current(&out, dts)
    }

    fn avc_annexb(
        &self,
        msg: &SharedMessage,
        keyframe: bool,
        video: &codec::format::VideoCodec,
    ) -> Result<Bytes> {
        let nalus = avc::demux_avcc(&msg.payload).wrap("hls avcc")?;
        let mut out = BytesMut::new();
        if keyframe && !video.sps.is_empty() {
            // Parameter sets in-band so every segment is self-contained.
            put_annexb(&mut out, &video.sps);
            put_annexb(&mut out, &video.pps);
        }
        for nalu in nalus {
            put_annexb(&mut out, &nalu);
        }
        Ok(out.freeze())
    }

    fn hevc_annexb(
        &self,
        msg: &SharedMessage,
        keyframe: bool,
        video: &codec::format::VideoCodec,
    ) -> Result<Bytes> {
        let nalus = avc::demux_avcc(&msg.payload).wrap("hls hvcc")?;
        let mut out = BytesMut::new();
        if keyframe && !video.sps.is_empty() {
            put_annexb(&mut out, &video.vps);
            put_annexb(&mut out, &video.sps);
            put_annexb(&mut out, &video.pps);
        }
        for nalu in nalus {
            if hevc::nalu_type(&nalu).is_some() {
                put_annexb(&mut out, &nalu);
            }
        }
        Ok(out.freeze())
    }

    fn segment_dir(&self) -> PathBuf {
        self.config.path.join(&self.app)
    }

    fn m3u8_path(&self) -> PathBuf {
        self.segment_dir().join(format!("{}.m3u8", self.stream))
    }

    fn current_duration(&self, dts: i64) -> i64 {
        self.current
            .as_ref()
            .map(|c| (dts - c.fragment.start_dts).max(c.fragment.duration))
            .unwrap_or(0)
    }

    fn ensure_segment(&mut self, dts: i64) -> Result<()> {
        if self.current.is_some() {
            return Ok(());
        }
        let number = self.sequence_no;
        self.sequence_no += 1;
        let path = self
            .segment_dir()
            .join(format!("{}-{}.ts", self.stream, number));
        let fragment = Fragment::new(path, number, dts);
        let file = File::create(fragment.tmppath())
            .map_err(|e| Error::Io(e.to_string()))
            .wrap("open ts segment")?;
        self.current = Some(CurrentSegment { fragment, file });

        // Fresh PSI (and counters) at the front of every segment.
        let has_video = self.format.video.is_some();
        let is_hevc = self
            .format
            .video
            .as_ref()
            .map(|v| v.id == Some(VideoCodecId::Hevc))
            .unwrap_or(false);
        self.writer = TsWriter::new(
            if is_hevc {
                STREAM_TYPE_H265
            } else {
                STREAM_TYPE_H264
            },
            STREAM_TYPE_AAC,
        );
        let mut psi = BytesMut::new();
        self.writer
            .write_pat_pmt(&mut psi, has_video, self.format.audio.is_some());
        let current = self.current.as_mut().unwrap();
        current
            .file
            .write_all(&psi)
            .map_err(|e| Error::Io(e.to_string()))?;
        Ok(())
    }

    fn append_current(&mut self, data: &[u8], dts: i64) -> Result<()> {
        let Some(current) = self.current.as_mut() else {
            return Ok(());
        };
        current
            .file
            .write_all(data)
            .map_err(|e| Error::Io(e.to_string()))
            .wrap("write ts segment")?;
        current.fragment.append(dts);
        Ok(())
    }

    /// Closes the in-flight segment, publishes it, refreshes the playlist
    /// and trims the window.
    fn reap_segment(&mut self) -> Result<()> {
        let Some(current) = self.current.take() else {
            return Ok(());
        };
        let CurrentSegment { fragment, file } = current;
        drop(file);
        fragment.rename().wrap("reap ts segment")?;
        log::info!(
            "hls: reap segment {}, duration={}ms",
            fragment.path().display(),
            fragment.duration
        );
        let event = HlsReapEvent {
            vhost: self.vhost.clone(),
            app: self.app.clone(),
            stream: self.stream.clone(),
            path: fragment.path().to_path_buf(),
            m3u8_path: self.m3u8_path(),
            sequence_no: fragment.number,
            duration_ms: fragment.duration,
        };
        self.window.append(fragment);
        self.window.shrink(self.config.window_ms, self.config.cleanup);
        self.refresh_m3u8()?;
        if let Some(on_reap) = &self.on_reap {
            on_reap(event);
        }
        Ok(())
    }

    /// Regenerates the playlist: write to `.tmp`, then rename.
    fn refresh_m3u8(&self) -> Result<()> {
        let path = self.m3u8_path();
        let tmp = path.with_extension("m3u8.tmp");

        let target = self
            .window
            .iter()
            .map(|f| (f.duration + 999) / 1000)
            .max()
            .unwrap_or(0);
        let first = self.window.first().map(|f| f.number).unwrap_or(0);

        let mut m3u8 = String::new();
        m3u8.push_str("#EXTM3U\n");
        m3u8.push_str("#EXT-X-VERSION:3\n");
        m3u8.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", first));
        m3u8.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", target));
        for f in self.window.iter() {
            m3u8.push_str(&format!("#EXTINF:{:.3}, no desc\n", f.duration as f64 / 1000.0));
            let uri = f
                .path()
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            m3u8.push_str(&uri);
            m3u8.push('\n');
        }

        fs::write(&tmp, m3u8).map_err(|e| Error::Io(e.to_string()))?;
        fs::rename(&tmp, &path).map_err(|e| Error::Io(e.to_string()))?;
        Ok(())
    }
}

fn put_annexb(out: &mut BytesMut, nalu: &[u8]) {
    if nalu.is_empty() {
        return;
    }
    out.put_slice(&[0, 0, 0, 1]);
    out.put_slice(nalu);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use codec::flv;

    fn sh_payload() -> Bytes {
        // AVC sequence header with tiny SPS/PPS.
        let record = avc::mux_sequence_header(&[0x67, 0x42, 0xc0, 0x1f], &[0x68, 0xcb]);
        avc::mux_avc2flv(
            &record,
            flv::FRAME_TYPE_KEYFRAME,
            flv::AVC_PACKET_SEQUENCE_HEADER,
            0,
        )
    }

    fn keyframe(ts: i64) -> SharedMessage {
        let payload = avc::mux_avc2flv(
            &avc::mux_ipb_frame(&[0x65, 1, 2, 3]),
            flv::FRAME_TYPE_KEYFRAME,
            flv::AVC_PACKET_NALU,
            0,
        );
        SharedMessage::video(ts, payload)
    }

    fn inter(ts: i64) -> SharedMessage {
        let payload = avc::mux_avc2flv(
            &avc::mux_ipb_frame(&[0x41, 9, 9]),
            flv::FRAME_TYPE_INTER,
            flv::AVC_PACKET_NALU,
            0,
        );
        SharedMessage::video(ts, payload)
    }

    fn muxer(dir: &std::path::Path, fragment_ms: i64, window_ms: i64, cleanup: bool) -> HlsMuxer {
        let mut m = HlsMuxer::new(HlsConfig {
            path: dir.to_path_buf(),
            fragment_ms,
            window_ms,
            cleanup,
        });
        m.on_publish("__defaultVhost__", "live", "stream").unwrap();
        m.on_video(&SharedMessage::video(0, sh_payload())).unwrap();
        m
    }

    fn feed(m: &mut HlsMuxer, upto_ms: i64) {
        let mut ts = 0;
        while ts <= upto_ms {
            if ts % 1000 == 0 {
                m.on_video(&keyframe(ts)).unwrap();
            } else {
                m.on_video(&inter(ts)).unwrap();
            }
            ts += 500;
        }
    }

    #[test]
    fn test_reap_writes_segments_and_m3u8() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = muxer(dir.path(), 2000, 60_000, false);
        feed(&mut m, 5000);

        let m3u8 = fs::read_to_string(dir.path().join("live/stream.m3u8")).unwrap();
        assert!(m3u8.starts_with("#EXTM3U"));
        assert!(m3u8.contains("#EXT-X-TARGETDURATION"));

        // Every URI in the playlist corresponds to a file on disk.
        for line in m3u8.lines().filter(|l| l.ends_with(".ts")) {
            assert!(dir.path().join("live").join(line).exists(), "{line} missing");
        }
        // No half-written playlist left behind.
        assert!(!dir.path().join("live/stream.m3u8.tmp").exists());
    }

    #[test]
    fn test_segments_are_monotonic_and_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = muxer(dir.path(), 2000, 60_000, false);
        feed(&mut m, 9000);

        let m3u8 = fs::read_to_string(dir.path().join("live/stream.m3u8")).unwrap();
        let mut numbers = Vec::new();
        for line in m3u8.lines().filter(|l| l.ends_with(".ts")) {
            let n: u64 = line
                .trim_start_matches("stream-")
                .trim_end_matches(".ts")
                .parse()
                .unwrap();
            numbers.push(n);
            // Segment bytes are whole TS packets.
            let bytes = fs::read(dir.path().join("live").join(line)).unwrap();
            assert_eq!(bytes.len() % 188, 0);
            assert_eq!(bytes[0], 0x47);
        }
        let mut sorted = numbers.clone();
        sorted.sort_unstable();
        assert_eq!(numbers, sorted);
        assert!(numbers.len() >= 2);
    }

    #[test]
    fn test_window_trims_and_cleanup_deletes() {
        let dir = tempfile::tempdir().unwrap();
        // Window budget of one fragment: old segments slide out fast.
        let mut m = muxer(dir.path(), 1000, 1000, true);
        feed(&mut m, 8000);

        let m3u8 = fs::read_to_string(dir.path().join("live/stream.m3u8")).unwrap();
        let listed: Vec<&str> = m3u8.lines().filter(|l| l.ends_with(".ts")).collect();
        assert!(listed.len() <= 2);
        // The very first segment slid out and was deleted from disk.
        assert!(!dir.path().join("live/stream-0.ts").exists());
    }

    #[test]
    fn test_unpublish_reaps_tail() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = muxer(dir.path(), 10_000, 60_000, false);
        m.on_video(&keyframe(0)).unwrap();
        m.on_video(&inter(500)).unwrap();
        m.on_unpublish();
        // The in-flight segment was published despite never reaching the
        // fragment duration.
        assert!(dir.path().join("live/stream-0.ts").exists());
    }

    #[test]
    fn test_reap_callback_fires() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        let dir = tempfile::tempdir().unwrap();
        let mut m = muxer(dir.path(), 1000, 60_000, false);
        let reaps = Arc::new(AtomicUsize::new(0));
        let r2 = reaps.clone();
        m.set_on_reap(Box::new(move |ev| {
            assert_eq!(ev.stream, "stream");
            assert!(ev.duration_ms > 0);
            r2.fetch_add(1, Ordering::SeqCst);
        }));
        feed(&mut m, 4000);
        assert!(reaps.load(Ordering::SeqCst) >= 2);
    }
}
