//! Raw H.265: Annex-B parameter-set sniffing and the HVCC sequence header,
//! parallel to the AVC path for the TS→RTMP bridge.

use bytes::{BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};

pub const NALU_TYPE_IDR_W_RADL: u8 = 19;
pub const NALU_TYPE_IDR_N_LP: u8 = 20;
pub const NALU_TYPE_CRA: u8 = 21;
pub const NALU_TYPE_VPS: u8 = 32;
pub const NALU_TYPE_SPS: u8 = 33;
pub const NALU_TYPE_PPS: u8 = 34;

pub fn nalu_type(frame: &[u8]) -> Option<u8> {
    frame.first().map(|b| (b >> 1) & 0x3f)
}

pub fn is_vps(frame: &[u8]) -> bool {
    nalu_type(frame) == Some(NALU_TYPE_VPS)
}

pub fn is_sps(frame: &[u8]) -> bool {
    nalu_type(frame) == Some(NALU_TYPE_SPS)
}

pub fn is_pps(frame: &[u8]) -> bool {
    nalu_type(frame) == Some(NALU_TYPE_PPS)
}

pub fn is_keyframe(frame: &[u8]) -> bool {
    matches!(
        nalu_type(frame),
        Some(NALU_TYPE_IDR_W_RADL) | Some(NALU_TYPE_IDR_N_LP) | Some(NALU_TYPE_CRA)
    )
}

/// Profile-tier-level bytes live at a fixed offset inside the SPS: after the
/// 2-byte NALU header, sps_video_parameter_set_id(4b),
/// sps_max_sub_layers_minus1(3b) and sps_temporal_id_nesting_flag(1b).
fn ptl_of_sps(sps: &[u8]) -> Option<&[u8]> {
    if sps.len() < 3 + 12 {
        return None;
    }
    Some(&sps[3..])
}

/// Builds the HEVCDecoderConfigurationRecord from VPS/SPS/PPS: a 23-byte
/// header, then three arrays each holding one NALU.
pub fn mux_sequence_header(vps: &[u8], sps: &[u8], pps: &[u8]) -> Result<Bytes> {
    if !is_vps(vps) || !is_sps(sps) || !is_pps(pps) {
        return Err(Error::ErrHevcNalu);
    }
    let ptl = ptl_of_sps(sps).ok_or(Error::ErrHevcNalu)?;

    let general_profile_space = (ptl[0] >> 6) & 0x03;
    let general_tier_flag = (ptl[0] >> 5) & 0x01;
    let general_profile_idc = ptl[0] & 0x1f;
    let compat = u32::from_be_bytes([ptl[1], ptl[2], ptl[3], ptl[4]]);
    let constraints = &ptl[5..11];
    let general_level_idc = ptl[11];

    let mut buf = BytesMut::with_capacity(23 + 5 * 3 + vps.len() + sps.len() + pps.len());
    buf.put_u8(0x01); // configurationVersion
    buf.put_u8((general_profile_space << 6) | (general_tier_flag << 5) | general_profile_idc);
    buf.put_u32(compat);
    buf.put_slice(constraints);
    buf.put_u8(general_level_idc);
    buf.put_u16(0xf000); // min_spatial_segmentation_idc, reserved bits set
    buf.put_u8(0xfc); // parallelismType
    buf.put_u8(0xfc | 0x01); // chromaFormat 4:2:0
    buf.put_u8(0xf8); // bitDepthLumaMinus8
    buf.put_u8(0xf8); // bitDepthChromaMinus8
    buf.put_u16(0); // avgFrameRate
    // constantFrameRate, numTemporalLayers, temporalIdNested,
    // lengthSizeMinusOne = 3.
    buf.put_u8(0x0f | 0xc0 | 0x38 | 0x04);

    buf.put_u8(3); // numOfArrays: vps, sps, pps
    for (nal_type, nalu) in [
        (NALU_TYPE_VPS, vps),
        (NALU_TYPE_SPS, sps),
        (NALU_TYPE_PPS, pps),
    ] {
        buf.put_u8(nal_type & 0x3f);
        buf.put_u16(1); // numNalus
        buf.put_u16(nalu.len() as u16);
        buf.put_slice(nalu);
    }
    Ok(buf.freeze())
}

/// Length-prefixes one NALU; identical framing to the AVC path.
pub fn mux_ipb_frame(frame: &[u8]) -> Bytes {
    crate::avc::mux_ipb_frame(frame)
}

/// Wraps HVCC data into an FLV video tag payload with codec id 12.
pub fn mux_hevc2flv(data: &[u8], frame_type: u8, packet_type: u8, cts: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + data.len());
    buf.put_u8((frame_type << 4) | 0x0c);
    buf.put_u8(packet_type);
    buf.put_u8((cts >> 16) as u8);
    buf.put_u8((cts >> 8) as u8);
    buf.put_u8(cts as u8);
    buf.put_slice(data);
    buf.freeze()
}
