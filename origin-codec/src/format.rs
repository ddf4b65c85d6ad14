//! Codec descriptors for a published stream. Updated only on sequence
//! headers; identity is preserved across re-publishes until teardown.

use bytes::{Buf, Bytes};
use shared::error::{Error, Result};

use crate::{aac, flv, hevc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodecId {
    Avc = 7,
    Hevc = 12,
}

impl VideoCodecId {
    pub fn from_u8(v: u8) -> Option<VideoCodecId> {
        match v {
            7 => Some(VideoCodecId::Avc),
            12 => Some(VideoCodecId::Hevc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodecId {
    Mp3 = 2,
    Aac = 10,
    Opus = 13,
}

impl AudioCodecId {
    pub fn from_u8(v: u8) -> Option<AudioCodecId> {
        match v {
            2 => Some(AudioCodecId::Mp3),
            10 => Some(AudioCodecId::Aac),
            13 => Some(AudioCodecId::Opus),
            _ => None,
        }
    }
}

/// Video parameters, from the AVCC/HVCC sequence header.
#[derive(Debug, Clone, Default)]
pub struct VideoCodec {
    pub id: Option<VideoCodecId>,
    pub sps: Bytes,
    pub pps: Bytes,
    pub vps: Bytes,
    pub width: u32,
    pub height: u32,
    pub profile: u8,
    pub level: u8,
}

/// Audio parameters, from the AudioSpecificConfig.
#[derive(Debug, Clone, Default)]
pub struct AudioCodec {
    pub id: Option<AudioCodecId>,
    pub asc: Bytes,
    pub object: u8,
    pub sampling_frequency_index: u8,
    pub sample_rate: u32,
    pub channels: u8,
}

/// The per-stream format descriptor: current codec ids and parameters.
#[derive(Debug, Clone, Default)]
pub struct Format {
    pub video: Option<VideoCodec>,
    pub audio: Option<AudioCodec>,
}

impl Format {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one video payload; only sequence headers mutate the format.
    pub fn on_video(&mut self, payload: &[u8]) -> Result<()> {
        if !flv::video::is_sequence_header(payload) {
            return Ok(());
        }
        let id = flv::video::codec_id(payload).ok_or(Error::ErrFlvTagType(0))?;
        let mut codec = VideoCodec {
            id: Some(id),
            ..Default::default()
        };
        match id {
            VideoCodecId::Avc => demux_avcc_config(&payload[5..], &mut codec)?,
            VideoCodecId::Hevc => demux_hvcc_config(&payload[5..], &mut codec)?,
        }
        self.video = Some(codec);
        Ok(())
    }

    /// Feeds one audio payload; only the AAC sequence header mutates it.
    pub fn on_audio(&mut self, payload: &[u8]) -> Result<()> {
        if !flv::audio::is_sequence_header(payload) {
            return Ok(());
        }
        let asc = &payload[2..];
        if asc.len() < 2 {
            return Err(Error::ErrBufferShort);
        }
        let object = (asc[0] >> 3) & 0x1f;
        let sfi = ((asc[0] & 0x07) << 1) | ((asc[1] >> 7) & 0x01);
        let channels = (asc[1] >> 3) & 0x0f;
        self.audio = Some(AudioCodec {
            id: Some(AudioCodecId::Aac),
            asc: Bytes::copy_from_slice(asc),
            object,
            sampling_frequency_index: sfi,
            sample_rate: aac::AAC_SAMPLE_RATES[(sfi & 0x0f) as usize],
            channels,
        });
        Ok(())
    }
}

fn demux_avcc_config(data: &[u8], codec: &mut VideoCodec) -> Result<()> {
    if data.len() < 7 {
        return Err(Error::ErrBufferShort);
    }
    codec.profile = data[1];
    codec.level = data[3];
    let mut buf = Bytes::copy_from_slice(&data[5..]);
    let nb_sps = (buf.get_u8() & 0x1f) as usize;
    for _ in 0..nb_sps {
        if buf.remaining() < 2 {
            return Err(Error::ErrBufferShort);
        }
        let len = buf.get_u16() as usize;
        if buf.remaining() < len {
            return Err(Error::ErrBufferShort);
        }
        codec.sps = buf.split_to(len);
    }
    if buf.remaining() >= 1 {
        let nb_pps = buf.get_u8() as usize;
        for _ in 0..nb_pps {
            if buf.remaining() < 2 {
                return Err(Error::ErrBufferShort);
            }
            let len = buf.get_u16() as usize;
            if buf.remaining() < len {
                return Err(Error::ErrBufferShort);
            }
            codec.pps = buf.split_to(len);
        }
    }
    if !codec.sps.is_empty() {
        if let Ok((w, h)) = parse_sps_dimensions(&codec.sps) {
            codec.width = w;
            codec.height = h;
        }
    }
    Ok(())
}

fn demux_hvcc_config(data: &[u8], codec: &mut VideoCodec) -> Result<()> {
    if data.len() < 23 {
        return Err(Error::ErrBufferShort);
    }
    codec.profile = data[1] & 0x1f;
    codec.level = data[12];
    let mut buf = Bytes::copy_from_slice(&data[22..]);
    if buf.remaining() < 1 {
        return Err(Error::ErrBufferShort);
    }
    let nb_arrays = buf.get_u8() as usize;
    for _ in 0..nb_arrays {
        if buf.remaining() < 3 {
            return Err(Error::ErrBufferShort);
        }
        let nal_type = buf.get_u8() & 0x3f;
        let nb_nalus = buf.get_u16() as usize;
        for _ in 0..nb_nalus {
            if buf.remaining() < 2 {
                return Err(Error::ErrBufferShort);
            }
            let len = buf.get_u16() as usize;
            if buf.remaining() < len {
                return Err(Error::ErrBufferShort);
            }
            let nalu = buf.split_to(len);
            match nal_type {
                hevc::NALU_TYPE_VPS => codec.vps = nalu,
                hevc::NALU_TYPE_SPS => codec.sps = nalu,
                hevc::NALU_TYPE_PPS => codec.pps = nalu,
                _ => {}
            }
        }
    }
    Ok(())
}

/// Exp-Golomb bit reader over an RBSP (emulation bytes removed first).
struct BitReader<'a> {
    data: &'a [u8],
    bit: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, bit: 0 }
    }

    fn read_bit(&mut self) -> Result<u32> {
        let byte = self.bit / 8;
        if byte >= self.data.len() {
            return Err(Error::ErrBufferShort);
        }
        let b = (self.data[byte] >> (7 - (self.bit % 8))) & 0x01;
        self.bit += 1;
        Ok(b as u32)
    }

    fn read_bits(&mut self, n: usize) -> Result<u32> {
        let mut v = 0;
        for _ in 0..n {
            v = (v << 1) | self.read_bit()?;
        }
        Ok(v)
    }

    fn read_ue(&mut self) -> Result<u32> {
        let mut zeros = 0;
        while self.read_bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                return Err(Error::Parse("ue(v) overflow".to_string()));
            }
        }
        if zeros == 0 {
            return Ok(0);
        }
        let rest = self.read_bits(zeros)?;
        Ok((1 << zeros) - 1 + rest)
    }

    fn read_se(&mut self) -> Result<i32> {
        let ue = self.read_ue()? as i64;
        let v = if ue % 2 == 0 { -(ue / 2) } else { (ue + 1) / 2 };
        Ok(v as i32)
    }
}

fn strip_emulation(nalu: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nalu.len());
    let mut zeros = 0;
    for &b in nalu {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(b);
    }
    out
}

/// Width and height from an H.264 SPS.
pub fn parse_sps_dimensions(sps: &[u8]) -> Result<(u32, u32)> {
    if sps.len() < 4 {
        return Err(Error::ErrBufferShort);
    }
    let rbsp = strip_emulation(&sps[1..]);
    let mut r = BitReader::new(&rbsp);
    let profile_idc = r.read_bits(8)?;
    let _constraints = r.read_bits(8)?;
    let _level_idc = r.read_bits(8)?;
    let _sps_id = r.read_ue()?;

    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        let chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            let _separate_colour_plane = r.read_bit()?;
        }
        let _bit_depth_luma = r.read_ue()?;
        let _bit_depth_chroma = r.read_ue()?;
        let _qpprime = r.read_bit()?;
        let seq_scaling_matrix = r.read_bit()?;
        if seq_scaling_matrix == 1 {
            let count = if chroma_format_idc != 3 { 8 } else { 12 };
            for i in 0..count {
                if r.read_bit()? == 1 {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    let _log2_max_frame_num = r.read_ue()?;
    let pic_order_cnt_type = r.read_ue()?;
    if pic_order_cnt_type == 0 {
        let _log2_max_poc = r.read_ue()?;
    } else if pic_order_cnt_type == 1 {
        let _delta_always_zero = r.read_bit()?;
        let _offset_non_ref = r.read_se()?;
        let _offset_top_bottom = r.read_se()?;
        let n = r.read_ue()?;
        for _ in 0..n {
            let _ = r.read_se()?;
        }
    }
    let _max_num_ref_frames = r.read_ue()?;
    let _gaps_allowed = r.read_bit()?;
    let pic_width_in_mbs = r.read_ue()? + 1;
    let pic_height_in_map_units = r.read_ue()? + 1;
    let frame_mbs_only = r.read_bit()?;
    if frame_mbs_only == 0 {
        let _mbaff = r.read_bit()?;
    }
    let _direct_8x8 = r.read_bit()?;

    let mut width = pic_width_in_mbs * 16;
    let mut height = (2 - frame_mbs_only) * pic_height_in_map_units * 16;

    if r.read_bit()? == 1 {
        // frame cropping
        let left = r.read_ue()?;
        let right = r.read_ue()?;
        let top = r.read_ue()?;
        let bottom = r.read_ue()?;
        width = width.saturating_sub((left + right) * 2);
        height = height.saturating_sub((top + bottom) * 2);
    }
    Ok((width, height))
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Result<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}
