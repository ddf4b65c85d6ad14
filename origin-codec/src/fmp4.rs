//! Fragmented MP4 writer for the DASH segmenter: init segments
//! (`ftyp`+`moov`) and media fragments (`moof`+`mdat`), one track per file.

use bytes::{BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};

use crate::format::{AudioCodec, VideoCodec};

/// Both tracks run on a millisecond timescale.
pub const MP4_TIMESCALE: u32 = 1000;

pub const TRACK_VIDEO: u32 = 1;
pub const TRACK_AUDIO: u32 = 2;

fn mp4_box(name: &[u8; 4], payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(8 + payload.len());
    buf.put_u32(8 + payload.len() as u32);
    buf.put_slice(name);
    buf.put_slice(payload);
    buf
}

fn full_box(name: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> BytesMut {
    let mut body = BytesMut::with_capacity(4 + payload.len());
    body.put_u8(version);
    body.put_u8((flags >> 16) as u8);
    body.put_u8((flags >> 8) as u8);
    body.put_u8(flags as u8);
    body.put_slice(payload);
    mp4_box(name, &body)
}

fn ftyp() -> BytesMut {
    let mut p = BytesMut::new();
    p.put_slice(b"iso5");
    p.put_u32(512);
    p.put_slice(b"iso5");
    p.put_slice(b"iso6");
    p.put_slice(b"mp41");
    mp4_box(b"ftyp", &p)
}

fn mvhd() -> BytesMut {
    let mut p = BytesMut::new();
    p.put_u32(0); // creation_time
    p.put_u32(0); // modification_time
    p.put_u32(MP4_TIMESCALE);
    p.put_u32(0); // duration: unknown for live
    p.put_u32(0x0001_0000); // rate 1.0
    p.put_u16(0x0100); // volume 1.0
    p.put_u16(0);
    p.put_u64(0);
    for v in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        p.put_u32(v);
    }
    for _ in 0..6 {
        p.put_u32(0); // pre_defined
    }
    p.put_u32(0xffff_ffff); // next_track_ID
    full_box(b"mvhd", 0, 0, &p)
}

fn tkhd(track_id: u32, width: u32, height: u32) -> BytesMut {
    let mut p = BytesMut::new();
    p.put_u32(0);
    p.put_u32(0);
    p.put_u32(track_id);
    p.put_u32(0); // reserved
    p.put_u32(0); // duration
    p.put_u64(0);
    p.put_u16(0); // layer
    p.put_u16(0); // alternate_group
    p.put_u16(if track_id == TRACK_AUDIO { 0x0100 } else { 0 });
    p.put_u16(0);
    for v in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        p.put_u32(v);
    }
    p.put_u32(width << 16);
    p.put_u32(height << 16);
    // flags: enabled | in_movie | in_preview
    full_box(b"tkhd", 0, 0x07, &p)
}

fn mdhd() -> BytesMut {
    let mut p = BytesMut::new();
    p.put_u32(0);
    p.put_u32(0);
    p.put_u32(MP4_TIMESCALE);
    p.put_u32(0);
    p.put_u16(0x55c4); // language: und
    p.put_u16(0);
    full_box(b"mdhd", 0, 0, &p)
}

fn hdlr(video: bool) -> BytesMut {
    let mut p = BytesMut::new();
    p.put_u32(0);
    p.put_slice(if video { b"vide" } else { b"soun" });
    p.put_u32(0);
    p.put_u32(0);
    p.put_u32(0);
    p.put_slice(if video {
        b"VideoHandler\0"
    } else {
        b"SoundHandler\0"
    });
    full_box(b"hdlr", 0, 0, &p)
}

fn dinf() -> BytesMut {
    let url = full_box(b"url ", 0, 1, &[]);
    let mut dref_p = BytesMut::new();
    dref_p.put_u32(1);
    dref_p.put_slice(&url);
    let dref = full_box(b"dref", 0, 0, &dref_p);
    mp4_box(b"dinf", &dref)
}

fn avc1(codec: &VideoCodec) -> Result<BytesMut> {
    let mut p = BytesMut::new();
    p.put_slice(&[0u8; 6]);
    p.put_u16(1); // data_reference_index
    p.put_u16(0); // pre_defined
    p.put_u16(0); // reserved
    p.put_slice(&[0u8; 12]); // pre_defined
    p.put_u16(codec.width as u16);
    p.put_u16(codec.height as u16);
    p.put_u32(0x0048_0000); // horizresolution 72dpi
    p.put_u32(0x0048_0000);
    p.put_u32(0);
    p.put_u16(1); // frame_count
    p.put_slice(&[0u8; 32]); // compressorname
    p.put_u16(0x0018); // depth
    p.put_u16(0xffff); // pre_defined -1
    if codec.sps.is_empty() || codec.pps.is_empty() {
        return Err(Error::ErrMp4Box);
    }
    let record = crate::avc::mux_sequence_header(&codec.sps, &codec.pps);
    p.put_slice(&mp4_box(b"avcC", &record));
    Ok(mp4_box(b"avc1", &p))
}

fn esds(asc: &[u8]) -> BytesMut {
    let mut p = BytesMut::new();
    // ES_Descriptor: ES_ID + flags, then the decoder config and SL config.
    p.put_u8(0x03);
    p.put_u8((23 + asc.len()) as u8);
    p.put_u16(0x0001); // ES_ID
    p.put_u8(0x00);
    // DecoderConfigDescriptor, with the DecoderSpecificInfo inside.
    p.put_u8(0x04);
    p.put_u8((15 + asc.len()) as u8);
    p.put_u8(0x40); // AAC
    p.put_u8(0x15); // audio stream
    p.put_slice(&[0x00, 0x00, 0x00]); // buffer size
    p.put_u32(0); // max bitrate
    p.put_u32(0); // avg bitrate
    // DecoderSpecificInfo: the AudioSpecificConfig
    p.put_u8(0x05);
    p.put_u8(asc.len() as u8);
    p.put_slice(asc);
    // SLConfigDescriptor
    p.put_u8(0x06);
    p.put_u8(0x01);
    p.put_u8(0x02);
    full_box(b"esds", 0, 0, &p)
}

fn mp4a(codec: &AudioCodec) -> BytesMut {
    let mut p = BytesMut::new();
    p.put_slice(&[0u8; 6]);
    p.put_u16(1); // data_reference_index
    p.put_u64(0); // reserved
    p.put_u16(codec.channels as u16);
    p.put_u16(16); // samplesize
    p.put_u16(0);
    p.put_u16(0);
    p.put_u32(codec.sample_rate << 16);
    p.put_slice(&esds(&codec.asc));
    mp4_box(b"mp4a", &p)
}

fn stbl(sample_entry: &[u8]) -> BytesMut {
    let mut stsd_p = BytesMut::new();
    stsd_p.put_u32(1);
    stsd_p.put_slice(sample_entry);
    let stsd = full_box(b"stsd", 0, 0, &stsd_p);

    let mut empty4 = BytesMut::new();
    empty4.put_u32(0);
    let stts = full_box(b"stts", 0, 0, &empty4);
    let stsc = full_box(b"stsc", 0, 0, &empty4);
    let mut stsz_p = BytesMut::new();
    stsz_p.put_u32(0);
    stsz_p.put_u32(0);
    let stsz = full_box(b"stsz", 0, 0, &stsz_p);
    let stco = full_box(b"stco", 0, 0, &empty4);

    let mut p = BytesMut::new();
    p.put_slice(&stsd);
    p.put_slice(&stts);
    p.put_slice(&stsc);
    p.put_slice(&stsz);
    p.put_slice(&stco);
    mp4_box(b"stbl", &p)
}

fn trex(track_id: u32) -> BytesMut {
    let mut p = BytesMut::new();
    p.put_u32(track_id);
    p.put_u32(1); // default_sample_description_index
    p.put_u32(0);
    p.put_u32(0);
    p.put_u32(0);
    full_box(b"trex", 0, 0, &p)
}

/// Writes the init segment for one track.
pub struct Mp4InitEncoder;

impl Mp4InitEncoder {
    pub fn write_video(codec: &VideoCodec) -> Result<Bytes> {
        Self::write(TRACK_VIDEO, avc1(codec)?, codec.width, codec.height)
    }

    pub fn write_audio(codec: &AudioCodec) -> Result<Bytes> {
        Self::write(TRACK_AUDIO, mp4a(codec), 0, 0)
    }

    fn write(track_id: u32, sample_entry: BytesMut, width: u32, height: u32) -> Result<Bytes> {
        let video = track_id == TRACK_VIDEO;
        let vmhd_smhd = if video {
            let mut p = BytesMut::new();
            p.put_u64(0);
            full_box(b"vmhd", 0, 1, &p)
        } else {
            let mut p = BytesMut::new();
            p.put_u32(0);
            full_box(b"smhd", 0, 0, &p)
        };

        let mut minf_p = BytesMut::new();
        minf_p.put_slice(&vmhd_smhd);
        minf_p.put_slice(&dinf());
        minf_p.put_slice(&stbl(&sample_entry));
        let minf = mp4_box(b"minf", &minf_p);

        let mut mdia_p = BytesMut::new();
        mdia_p.put_slice(&mdhd());
        mdia_p.put_slice(&hdlr(video));
        mdia_p.put_slice(&minf);
        let mdia = mp4_box(b"mdia", &mdia_p);

        let mut trak_p = BytesMut::new();
        trak_p.put_slice(&tkhd(track_id, width, height));
        trak_p.put_slice(&mdia);
        let trak = mp4_box(b"trak", &trak_p);

        let mvex = mp4_box(b"mvex", &trex(track_id));

        let mut moov_p = BytesMut::new();
        moov_p.put_slice(&mvhd());
        moov_p.put_slice(&trak);
        moov_p.put_slice(&mvex);
        let moov = mp4_box(b"moov", &moov_p);

        let mut out = BytesMut::new();
        out.put_slice(&ftyp());
        out.put_slice(&moov);
        Ok(out.freeze())
    }
}

/// One sample of a media fragment, timescale milliseconds.
#[derive(Debug, Clone)]
pub struct Fmp4Sample {
    pub duration: u32,
    pub cts: u32,
    pub keyframe: bool,
    pub data: Bytes,
}

/// Writes `moof`+`mdat` media fragments.
pub struct Fmp4Encoder;

impl Fmp4Encoder {
    /// `sequence` is the fragment number, `base_dts` the decode time of the
    /// first sample in timescale units.
    pub fn write_fragment(
        track_id: u32,
        sequence: u32,
        base_dts: u64,
        samples: &[Fmp4Sample],
    ) -> Result<Bytes> {
        if samples.is_empty() {
            return Err(Error::ErrMp4Box);
        }
        let mut mfhd_p = BytesMut::new();
        mfhd_p.put_u32(sequence);
        let mfhd = full_box(b"mfhd", 0, 0, &mfhd_p);

        // tfhd: default-base-is-moof.
        let mut tfhd_p = BytesMut::new();
        tfhd_p.put_u32(track_id);
        let tfhd = full_box(b"tfhd", 0, 0x020000, &tfhd_p);

        let mut tfdt_p = BytesMut::new();
        tfdt_p.put_u64(base_dts);
        let tfdt = full_box(b"tfdt", 1, 0, &tfdt_p);

        // trun flags: data-offset | sample-duration | sample-size |
        // sample-flags | sample-composition-time-offset.
        let mut trun_p = BytesMut::new();
        trun_p.put_u32(samples.len() as u32);
        trun_p.put_u32(0); // data_offset placeholder, patched below
        for s in samples {
            trun_p.put_u32(s.duration);
            trun_p.put_u32(s.data.len() as u32);
            let flags: u32 = if s.keyframe { 0x0200_0000 } else { 0x0101_0000 };
            trun_p.put_u32(flags);
            trun_p.put_u32(s.cts);
        }
        let trun = full_box(b"trun", 0, 0x000f01, &trun_p);

        let mut traf_p = BytesMut::new();
        traf_p.put_slice(&tfhd);
        traf_p.put_slice(&tfdt);
        traf_p.put_slice(&trun);
        let traf = mp4_box(b"traf", &traf_p);

        let mut moof_p = BytesMut::new();
        moof_p.put_slice(&mfhd);
        moof_p.put_slice(&traf);
        let mut moof = mp4_box(b"moof", &moof_p);

        // Patch trun data_offset: first mdat payload byte relative to the
        // start of moof.
        let data_offset = moof.len() as u32 + 8;
        let trun_offset = 8 + mfhd.len() + 8 + tfhd.len() + tfdt.len() + 8 + 4 + 4;
        moof[trun_offset..trun_offset + 4].copy_from_slice(&data_offset.to_be_bytes());

        let mut mdat_p = BytesMut::new();
        for s in samples {
            mdat_p.put_slice(&s.data);
        }
        let mdat = mp4_box(b"mdat", &mdat_p);

        let mut out = BytesMut::with_capacity(moof.len() + mdat.len());
        out.put_slice(&moof);
        out.put_slice(&mdat);
        Ok(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{AudioCodecId, VideoCodecId};

    fn walk_boxes(data: &[u8]) -> Vec<(String, usize)> {
        let mut out = Vec::new();
        let mut i = 0;
        while i + 8 <= data.len() {
            let size = u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]) as usize;
            let name = String::from_utf8_lossy(&data[i + 4..i + 8]).to_string();
            out.push((name, size));
            if size < 8 {
                break;
            }
            i += size;
        }
        out
    }

    fn video_codec() -> VideoCodec {
        VideoCodec {
            id: Some(VideoCodecId::Avc),
            sps: Bytes::from_static(&[0x67, 0x42, 0xc0, 0x1f]),
            pps: Bytes::from_static(&[0x68, 0xcb]),
            vps: Bytes::new(),
            width: 1280,
            height: 720,
            profile: 0x42,
            level: 0x1f,
        }
    }

    #[test]
    fn test_init_video_box_layout() {
        let init = Mp4InitEncoder::write_video(&video_codec()).unwrap();
        let boxes = walk_boxes(&init);
        let names: Vec<&str> = boxes.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["ftyp", "moov"]);
        // Sizes must tile the buffer exactly.
        let total: usize = boxes.iter().map(|(_, s)| s).sum();
        assert_eq!(total, init.len());
    }

    #[test]
    fn test_init_audio_contains_esds() {
        let codec = AudioCodec {
            id: Some(AudioCodecId::Aac),
            asc: Bytes::from_static(&[0x12, 0x10]),
            object: 2,
            sampling_frequency_index: 4,
            sample_rate: 44100,
            channels: 2,
        };
        let init = Mp4InitEncoder::write_audio(&codec).unwrap();
        let hay = init.as_ref();
        assert!(hay.windows(4).any(|w| w == b"mp4a"));
        assert!(hay.windows(4).any(|w| w == b"esds"));
        // The ASC rides inside the esds.
        assert!(hay.windows(2).any(|w| w == [0x12, 0x10]));
    }

    #[test]
    fn test_init_video_requires_parameter_sets() {
        let mut codec = video_codec();
        codec.sps = Bytes::new();
        assert!(Mp4InitEncoder::write_video(&codec).is_err());
    }

    #[test]
    fn test_fragment_layout_and_data_offset() {
        let samples = vec![
            Fmp4Sample {
                duration: 40,
                cts: 0,
                keyframe: true,
                data: Bytes::from_static(&[1, 2, 3, 4]),
            },
            Fmp4Sample {
                duration: 40,
                cts: 10,
                keyframe: false,
                data: Bytes::from_static(&[5, 6]),
            },
        ];
        let frag = Fmp4Encoder::write_fragment(TRACK_VIDEO, 7, 123_000, &samples).unwrap();
        let boxes = walk_boxes(&frag);
        let names: Vec<&str> = boxes.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["moof", "mdat"]);

        let moof_size = boxes[0].1;
        // mfhd sequence number.
        let mfhd_seq = u32::from_be_bytes([frag[20], frag[21], frag[22], frag[23]]);
        assert_eq!(mfhd_seq, 7);

        // data_offset points at the first mdat payload byte.
        let mdat_payload = &frag[moof_size + 8..];
        assert_eq!(&mdat_payload[..4], &[1, 2, 3, 4]);
        let trun_pos = frag
            .windows(4)
            .position(|w| w == b"trun")
            .unwrap();
        let data_offset = u32::from_be_bytes([
            frag[trun_pos + 12],
            frag[trun_pos + 13],
            frag[trun_pos + 14],
            frag[trun_pos + 15],
        ]);
        assert_eq!(data_offset as usize, moof_size + 8);
    }

    #[test]
    fn test_fragment_rejects_empty() {
        assert!(Fmp4Encoder::write_fragment(TRACK_VIDEO, 1, 0, &[]).is_err());
    }
}
