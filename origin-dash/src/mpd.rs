//! The dynamic MPD writer.

use chrono::{DateTime, SecondsFormat, Utc};
use shared::fragment::FragmentWindow;
use std::fmt::Write;
use std::time::SystemTime;

pub struct MpdTrackView<'a> {
    pub window: &'a FragmentWindow,
    pub width: u32,
    pub height: u32,
}

pub struct MpdWriter<'a> {
    pub stream: &'a str,
    pub window_size: usize,
    pub availability_start: SystemTime,
    pub video: Option<MpdTrackView<'a>>,
    pub audio: Option<MpdTrackView<'a>>,
}

fn utc(t: SystemTime) -> String {
    DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl MpdWriter<'_> {
    pub fn render(&self) -> String {
        // The live edge dictates the buffer windows.
        let last_duration_ms = [
            self.video.as_ref().and_then(|t| t.window.last()),
            self.audio.as_ref().and_then(|t| t.window.last()),
        ]
        .into_iter()
        .flatten()
        .map(|f| f.duration)
        .max()
        .unwrap_or(0);
        let last_duration = last_duration_ms as f64 / 1000.0;

        let mut out = String::new();
        let _ = writeln!(out, "<?xml version=\"1.0\" encoding=\"utf-8\"?>");
        let _ = writeln!(
            out,
            "<MPD profiles=\"urn:mpeg:dash:profile:isoff-live:2011,http://dashif.org/guidelines/dash-if-simple\" "
        );
        let _ = writeln!(
            out,
            "    ns1:schemaLocation=\"urn:mpeg:dash:schema:mpd:2011 DASH-MPD.xsd\" "
        );
        let _ = writeln!(
            out,
            "    xmlns=\"urn:mpeg:dash:schema:mpd:2011\" xmlns:ns1=\"http://www.w3.org/2001/XMLSchema-instance\" "
        );
        let _ = writeln!(out, "    type=\"dynamic\" ");
        let _ = writeln!(
            out,
            "    minimumUpdatePeriod=\"PT{:.3}S\" ",
            last_duration
        );
        let _ = writeln!(
            out,
            "    timeShiftBufferDepth=\"PT{:.3}S\" ",
            last_duration * self.window_size as f64
        );
        let _ = writeln!(
            out,
            "    availabilityStartTime=\"{}\" ",
            utc(self.availability_start)
        );
        let _ = writeln!(out, "    publishTime=\"{}\" ", utc(SystemTime::now()));
        let _ = writeln!(out, "    minBufferTime=\"PT{:.3}S\" >", 2.0 * last_duration);
        let _ = writeln!(out, "    <BaseURL>{}/</BaseURL>", self.stream);
        let _ = writeln!(out, "    <Period start=\"PT0S\">");

        if let Some(audio) = &self.audio {
            if !audio.window.is_empty() {
                self.render_adaptation_set(
                    &mut out,
                    audio,
                    "audio/mp4",
                    "audio",
                    "bandwidth=\"48000\" codecs=\"mp4a.40.2\"",
                );
            }
        }
        if let Some(video) = &self.video {
            if !video.window.is_empty() {
                let attrs = format!(
                    "bandwidth=\"800000\" codecs=\"avc1.64001e\" width=\"{}\" height=\"{}\"",
                    video.width, video.height
                );
                self.render_adaptation_set(&mut out, video, "video/mp4", "video", &attrs);
            }
        }
        let _ = writeln!(out, "    </Period>");
        let _ = writeln!(out, "</MPD>");
        out
    }

    fn render_adaptation_set(
        &self,
        out: &mut String,
        track: &MpdTrackView<'_>,
        mime: &str,
        id: &str,
        representation_attrs: &str,
    ) {
        let in_window: Vec<_> = {
            let all: Vec<_> = track.window.iter().collect();
            let start = all.len().saturating_sub(self.window_size);
            all[start..].to_vec()
        };
        let start_number = in_window.first().map(|f| f.number).unwrap_or(1);

        let _ = writeln!(
            out,
            "        <AdaptationSet mimeType=\"{}\" segmentAlignment=\"true\" startWithSAP=\"1\">",
            mime
        );
        let _ = writeln!(
            out,
            "            <Representation id=\"{}\" {}>",
            id, representation_attrs
        );
        let _ = writeln!(
            out,
            "                <SegmentTemplate initialization=\"$RepresentationID$-init.mp4\" media=\"$RepresentationID$-$Number$.m4s\" startNumber=\"{}\" timescale=\"1000\">",
            start_number
        );
        let _ = writeln!(out, "                    <SegmentTimeline>");
        for f in &in_window {
            let _ = writeln!(
                out,
                "                        <S t=\"{}\" d=\"{}\" />",
                f.start_dts, f.duration
            );
        }
        let _ = writeln!(out, "                    </SegmentTimeline>");
        let _ = writeln!(out, "                </SegmentTemplate>");
        let _ = writeln!(out, "            </Representation>");
        let _ = writeln!(out, "        </AdaptationSet>");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::fragment::Fragment;
    use std::path::PathBuf;

    fn window(count: u64, start_number: u64) -> FragmentWindow {
        let mut w = FragmentWindow::new();
        for i in 0..count {
            let n = start_number + i;
            let mut f = Fragment::new(PathBuf::from(format!("video-{n}.m4s")), n, n as i64 * 4000);
            f.append(n as i64 * 4000 + 4000);
            w.append(f);
        }
        w
    }

    #[test]
    fn test_mpd_shape() {
        let vw = window(3, 4);
        let aw = window(3, 4);
        let writer = MpdWriter {
            stream: "stream",
            window_size: 5,
            availability_start: SystemTime::UNIX_EPOCH,
            video: Some(MpdTrackView {
                window: &vw,
                width: 1280,
                height: 720,
            }),
            audio: Some(MpdTrackView {
                window: &aw,
                width: 0,
                height: 0,
            }),
        };
        let mpd = writer.render();
        assert!(mpd.contains("type=\"dynamic\""));
        assert!(mpd.contains("availabilityStartTime=\"1970-01-01T00:00:00.000Z\""));
        assert!(mpd.contains("<Period start=\"PT0S\">"));
        assert!(mpd.contains("codecs=\"avc1.64001e\" width=\"1280\" height=\"720\""));
        assert!(mpd.contains("codecs=\"mp4a.40.2\""));
        // startNumber is the first in-window number.
        assert!(mpd.contains("startNumber=\"4\""));
        // timeShiftBufferDepth = last duration x window size.
        assert!(mpd.contains("timeShiftBufferDepth=\"PT20.000S\""));
        // minBufferTime = 2 x last duration.
        assert!(mpd.contains("minBufferTime=\"PT8.000S\""));
        // One S element per fragment.
        assert_eq!(mpd.matches("<S t=").count(), 6);
    }

    #[test]
    fn test_mpd_limits_timeline_to_window() {
        let vw = window(8, 1);
        let writer = MpdWriter {
            stream: "s",
            window_size: 5,
            availability_start: SystemTime::UNIX_EPOCH,
            video: Some(MpdTrackView {
                window: &vw,
                width: 640,
                height: 480,
            }),
            audio: None,
        };
        let mpd = writer.render();
        assert_eq!(mpd.matches("<S t=").count(), 5);
        // Numbers 1..3 slid out of the advertised window.
        assert!(mpd.contains("startNumber=\"4\""));
    }
}
