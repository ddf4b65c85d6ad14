//! The DASH controller: per-track fragmenters with aligned reaps.

use bytes::Bytes;
use codec::fmp4::{Fmp4Encoder, Fmp4Sample, Mp4InitEncoder, TRACK_AUDIO, TRACK_VIDEO};
use codec::format::Format;
use live::SharedMessage;
use shared::error::{Error, Result, WrapExt};
use shared::fragment::{Fragment, FragmentWindow};
use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::mpd::{MpdTrackView, MpdWriter};

#[derive(Debug, Clone)]
pub struct DashConfig {
    /// Root directory; files land under `<path>/<app>/<stream>/`.
    pub path: PathBuf,
    /// Target fragment duration, ms.
    pub fragment_ms: i64,
    /// Fragments advertised per track.
    pub window_size: usize,
    pub cleanup: bool,
}

impl Default for DashConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./html"),
            fragment_ms: 4000,
            window_size: 5,
            cleanup: true,
        }
    }
}

struct PendingSample {
    dts: i64,
    cts: u32,
    keyframe: bool,
    data: Bytes,
}

struct TrackFragmenter {
    track_id: u32,
    name: &'static str,
    sequence: u64,
    start_dts: Option<i64>,
    samples: Vec<PendingSample>,
    window: FragmentWindow,
}

impl TrackFragmenter {
    fn new(track_id: u32, name: &'static str) -> Self {
        Self {
            track_id,
            name,
            sequence: 1,
            start_dts: None,
            samples: Vec::new(),
            window: FragmentWindow::new(),
        }
    }

    fn append(&mut self, dts: i64, cts: u32, keyframe: bool, data: Bytes) {
        self.start_dts.get_or_insert(dts);
        self.samples.push(PendingSample {
            dts,
            cts,
            keyframe,
            data,
        });
    }

    fn duration(&self, current_dts: i64) -> i64 {
        self.start_dts.map(|s| current_dts - s).unwrap_or(0)
    }

    /// Writes the buffered samples as one `<name>-<number>.m4s`.
    fn reap(&mut self, end_dts: i64, dir: &PathBuf) -> Result<Option<Fragment>> {
        if self.samples.is_empty() {
            return Ok(None);
        }
        let start_dts = self.start_dts.take().unwrap_or(0);
        let number = self.sequence;
        self.sequence += 1;

        // Per-sample durations from DTS deltas; the tail runs to end_dts.
        let samples: Vec<Fmp4Sample> = self
            .samples
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let next = self
                    .samples
                    .get(i + 1)
                    .map(|n| n.dts)
                    .unwrap_or(end_dts.max(s.dts + 1));
                Fmp4Sample {
                    duration: (next - s.dts).max(1) as u32,
                    cts: s.cts,
                    keyframe: s.keyframe,
                    data: s.data.clone(),
                }
            })
            .collect();
        self.samples.clear();

        let mut fragment = Fragment::new(
            dir.join(format!("{}-{}.m4s", self.name, number)),
            number,
            start_dts,
        );
        fragment.append(end_dts.max(start_dts + 1));

        let data = Fmp4Encoder::write_fragment(self.track_id, number as u32, start_dts as u64, &samples)
            .wrap("encode m4s")?;
        fs::write(fragment.tmppath(), &data).map_err(|e| Error::Io(e.to_string()))?;
        fragment.rename().wrap("publish m4s")?;
        log::info!(
            "dash: reap {} fragment #{}, duration={}ms",
            self.name,
            number,
            fragment.duration
        );
        Ok(Some(fragment))
    }
}

pub struct DashController {
    config: DashConfig,
    format: Format,
    video: TrackFragmenter,
    audio: TrackFragmenter,
    /// Set by a video reap, consumed by the next audio frame so the audio
    /// fragment boundary aligns with the video one.
    video_reaped: bool,
    video_init_written: bool,
    audio_init_written: bool,
    availability_start: Option<SystemTime>,
    app: String,
    stream: String,
}

impl DashController {
    pub fn new(config: DashConfig) -> Self {
        Self {
            config,
            format: Format::new(),
            video: TrackFragmenter::new(TRACK_VIDEO, "video"),
            audio: TrackFragmenter::new(TRACK_AUDIO, "audio"),
            video_reaped: false,
            video_init_written: false,
            audio_init_written: false,
            availability_start: None,
            app: String::new(),
            stream: String::new(),
        }
    }

    pub fn on_publish(&mut self, _vhost: &str, app: &str, stream: &str) -> Result<()> {
        self.app = app.to_string();
        self.stream = stream.to_string();
        self.format = Format::new();
        self.video = TrackFragmenter::new(TRACK_VIDEO, "video");
        self.audio = TrackFragmenter::new(TRACK_AUDIO, "audio");
        self.video_reaped = false;
        self.video_init_written = false;
        self.audio_init_written = false;
        self.availability_start = None;
        fs::create_dir_all(self.fragment_dir())
            .map_err(|e| Error::Io(e.to_string()))
            .wrap("create dash home")?;
        log::info!("dash: publish {}/{}", app, stream);
        Ok(())
    }

    pub fn on_unpublish(&mut self) {
        let end_v = self.video.samples.last().map(|s| s.dts + 1).unwrap_or(0);
        if let Err(e) = self.reap_video(end_v) {
            e.reset("dash unpublish video");
        }
        let end_a = self.audio.samples.last().map(|s| s.dts + 1).unwrap_or(0);
        if let Err(e) = self.reap_audio(end_a) {
            e.reset("dash unpublish audio");
        }
        self.video.window.dispose(self.config.cleanup);
        self.audio.window.dispose(self.config.cleanup);
        log::info!("dash: unpublish {}/{}", self.app, self.stream);
    }

    pub fn on_video(&mut self, msg: &SharedMessage) -> Result<()> {
        self.format.on_video(&msg.payload).wrap("dash video sh")?;
        if msg.is_video_sequence_header() {
            return self.write_video_init();
        }
        if !self.video_init_written || msg.payload.len() < 5 {
            return Ok(());
        }
        let dts = msg.header.timestamp;
        self.anchor_availability(dts);
        let keyframe = msg.is_video_keyframe();

        if keyframe && self.video.duration(dts) >= self.config.fragment_ms {
            self.reap_video(dts)?;
        }

        let cts = ((msg.payload[2] as u32) << 16)
            | ((msg.payload[3] as u32) << 8)
            | msg.payload[4] as u32;
        self.video
            .append(dts, cts, keyframe, msg.payload.slice(5..));
        Ok(())
    }

    pub fn on_audio(&mut self, msg: &SharedMessage) -> Result<()> {
        self.format.on_audio(&msg.payload).wrap("dash audio sh")?;
        if msg.is_audio_sequence_header() {
            return self.write_audio_init();
        }
        if !self.audio_init_written || msg.payload.len() < 2 {
            return Ok(());
        }
        let dts = msg.header.timestamp;
        self.anchor_availability(dts);

        // Align with video, or reap on duration for pure-audio streams.
        let aligned = std::mem::take(&mut self.video_reaped);
        if aligned
            || (self.format.video.is_none() && self.audio.duration(dts) >= self.config.fragment_ms)
        {
            self.reap_audio(dts)?;
        }

        self.audio.append(dts, 0, true, msg.payload.slice(2..));
        Ok(())
    }

    fn anchor_availability(&mut self, first_dts: i64) {
        if self.availability_start.is_none() {
            // Wall clock minus the stream's own epoch: fragments at DTS t
            // become available at availability_start + t.
            self.availability_start =
                Some(SystemTime::now() - std::time::Duration::from_millis(first_dts.max(0) as u64));
        }
    }

    fn write_video_init(&mut self) -> Result<()> {
        let Some(video) = self.format.video.as_ref() else {
            return Ok(());
        };
        let init = Mp4InitEncoder::write_video(video).wrap("video init")?;
        let path = self.fragment_dir().join("video-init.mp4");
        let tmp = path.with_extension("mp4.tmp");
        fs::write(&tmp, &init).map_err(|e| Error::Io(e.to_string()))?;
        fs::rename(&tmp, &path).map_err(|e| Error::Io(e.to_string()))?;
        self.video_init_written = true;
        Ok(())
    }

    fn write_audio_init(&mut self) -> Result<()> {
        let Some(audio) = self.format.audio.as_ref() else {
            return Ok(());
        };
        let init = Mp4InitEncoder::write_audio(audio).wrap("audio init")?;
        let path = self.fragment_dir().join("audio-init.mp4");
        let tmp = path.with_extension("mp4.tmp");
        fs::write(&tmp, &init).map_err(|e| Error::Io(e.to_string()))?;
        fs::rename(&tmp, &path).map_err(|e| Error::Io(e.to_string()))?;
        self.audio_init_written = true;
        Ok(())
    }

    fn reap_video(&mut self, end_dts: i64) -> Result<()> {
        let dir = self.fragment_dir();
        if let Some(fragment) = self.video.reap(end_dts, &dir)? {
            self.video.window.append(fragment);
            self.shrink(true);
            self.video_reaped = true;
            self.refresh_mpd()?;
        }
        Ok(())
    }

    fn reap_audio(&mut self, end_dts: i64) -> Result<()> {
        let dir = self.fragment_dir();
        if let Some(fragment) = self.audio.reap(end_dts, &dir)? {
            self.audio.window.append(fragment);
            self.shrink(false);
            self.refresh_mpd()?;
        }
        Ok(())
    }

    fn shrink(&mut self, video: bool) {
        let track = if video { &mut self.video } else { &mut self.audio };
        if track.window.len() > self.config.window_size {
            let budget = 2 * self.config.window_size as i64 * self.config.fragment_ms;
            track.window.shrink(budget, self.config.cleanup);
        }
    }

    fn refresh_mpd(&self) -> Result<()> {
        let writer = MpdWriter {
            stream: &self.stream,
            window_size: self.config.window_size,
            availability_start: self.availability_start.unwrap_or_else(SystemTime::now),
            video: self.format.video.as_ref().map(|v| MpdTrackView {
                window: &self.video.window,
                width: v.width,
                height: v.height,
            }),
            audio: self.format.audio.as_ref().map(|_| MpdTrackView {
                window: &self.audio.window,
                width: 0,
                height: 0,
            }),
        };
        let mpd = writer.render();
        let path = self.mpd_path();
        let tmp = path.with_extension("mpd.tmp");
        fs::write(&tmp, mpd).map_err(|e| Error::Io(e.to_string()))?;
        fs::rename(&tmp, &path).map_err(|e| Error::Io(e.to_string()))?;
        Ok(())
    }

    fn fragment_dir(&self) -> PathBuf {
        self.config.path.join(&self.app).join(&self.stream)
    }

    fn mpd_path(&self) -> PathBuf {
        self.config
            .path
            .join(&self.app)
            .join(format!("{}.mpd", self.stream))
    }
}
