//! The session transport: DTLS handshake plus SRTP protection, in three
//! flavors behind one interface.

use crate::dtls::{DtlsCertificate, DtlsEngine, DtlsRole};
use crate::srtp::SrtpContext;
use bytes::Bytes;
use shared::error::{Error, Result};
use std::time::Instant;

/// What a session needs from its transport.
pub trait RtcTransport: Send {
    /// Starts the handshake when we are the DTLS client.
    fn start(&mut self, now: Instant) -> Result<()>;

    /// Feeds one DTLS datagram.
    fn handle_dtls(&mut self, data: &[u8], now: Instant) -> Result<()>;

    /// Drains handshake datagrams to send.
    fn poll_outgoing(&mut self) -> Option<Bytes>;

    fn poll_timeout(&self) -> Option<Instant> {
        None
    }

    fn handle_timeout(&mut self, _now: Instant) -> Result<()> {
        Ok(())
    }

    /// True once keying completed (or immediately for plaintext).
    fn is_established(&self) -> bool;

    fn protect_rtp(&mut self, packet: &[u8]) -> Result<Bytes>;
    fn unprotect_rtp(&mut self, packet: &[u8]) -> Result<Bytes>;
    fn protect_rtcp(&mut self, packet: &[u8]) -> Result<Bytes>;
    fn unprotect_rtcp(&mut self, packet: &[u8]) -> Result<Bytes>;
}

fn build_srtp_pair(engine: &DtlsEngine, role: DtlsRole) -> Result<(SrtpContext, SrtpContext)> {
    let keys = engine.srtp_keys().ok_or(Error::ErrDtlsHandshake)?;
    let client = SrtpContext::new(keys.client_key, keys.client_salt);
    let server = SrtpContext::new(keys.server_key, keys.server_salt);
    // Our write direction follows our DTLS role.
    Ok(match role {
        DtlsRole::Active => (client, server),
        DtlsRole::Passive => (server, client),
    })
}

/// Full security: DTLS handshake, SRTP protect and unprotect both ways.
pub struct SecurityTransport {
    role: DtlsRole,
    dtls: DtlsEngine,
    tx: Option<SrtpContext>,
    rx: Option<SrtpContext>,
}

impl SecurityTransport {
    pub fn new(role: DtlsRole, cert: &DtlsCertificate) -> Result<Self> {
        Ok(Self {
            role,
            dtls: DtlsEngine::new(role, cert)?,
            tx: None,
            rx: None,
        })
    }

    pub fn set_expected_fingerprint(&mut self, fp: &str) {
        self.dtls.set_expected_fingerprint(fp);
    }

    fn setup_srtp(&mut self) -> Result<()> {
        if self.tx.is_none() && self.dtls.is_established() {
            let (tx, rx) = build_srtp_pair(&self.dtls, self.role)?;
            self.tx = Some(tx);
            self.rx = Some(rx);
        }
        Ok(())
    }
}

impl RtcTransport for SecurityTransport {
    fn start(&mut self, now: Instant) -> Result<()> {
        self.dtls.start(now)
    }

    fn handle_dtls(&mut self, data: &[u8], now: Instant) -> Result<()> {
        self.dtls.handle_datagram(data, now)?;
        self.setup_srtp()
    }

    fn poll_outgoing(&mut self) -> Option<Bytes> {
        self.dtls.poll_outgoing()
    }

    fn poll_timeout(&self) -> Option<Instant> {
        self.dtls.poll_timeout()
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        self.dtls.handle_timeout(now)
    }

    fn is_established(&self) -> bool {
        self.dtls.is_established()
    }

    fn protect_rtp(&mut self, packet: &[u8]) -> Result<Bytes> {
        self.tx
            .as_mut()
            .ok_or(Error::ErrDtlsHandshake)?
            .protect_rtp(packet)
    }

    fn unprotect_rtp(&mut self, packet: &[u8]) -> Result<Bytes> {
        self.rx
            .as_mut()
            .ok_or(Error::ErrDtlsHandshake)?
            .unprotect_rtp(packet)
    }

    fn protect_rtcp(&mut self, packet: &[u8]) -> Result<Bytes> {
        self.tx
            .as_mut()
            .ok_or(Error::ErrDtlsHandshake)?
            .protect_rtcp(packet)
    }

    fn unprotect_rtcp(&mut self, packet: &[u8]) -> Result<Bytes> {
        self.rx
            .as_mut()
            .ok_or(Error::ErrDtlsHandshake)?
            .unprotect_rtcp(packet)
    }
}

/// Semi security: the handshake runs and inbound SRTP is decrypted, but
/// outbound is left in the clear (integration diagnostics).
pub struct SemiSecurityTransport {
    inner: SecurityTransport,
}

impl SemiSecurityTransport {
    pub fn new(role: DtlsRole, cert: &DtlsCertificate) -> Result<Self> {
        Ok(Self {
            inner: SecurityTransport::new(role, cert)?,
        })
    }
}

impl RtcTransport for SemiSecurityTransport {
    fn start(&mut self, now: Instant) -> Result<()> {
        self.inner.start(now)
    }

    fn handle_dtls(&mut self, data: &[u8], now: Instant) -> Result<()> {
        self.inner.handle_dtls(data, now)
    }

    fn poll_outgoing(&mut self) -> Option<Bytes> {
        self.inner.poll_outgoing()
    }

    fn poll_timeout(&self) -> Option<Instant> {
        self.inner.poll_timeout()
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        self.inner.handle_timeout(now)
    }

    fn is_established(&self) -> bool {
        self.inner.is_established()
    }

    fn protect_rtp(&mut self, packet: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(packet))
    }

    fn unprotect_rtp(&mut self, packet: &[u8]) -> Result<Bytes> {
        self.inner.unprotect_rtp(packet)
    }

    fn protect_rtcp(&mut self, packet: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(packet))
    }

    fn unprotect_rtcp(&mut self, packet: &[u8]) -> Result<Bytes> {
        self.inner.unprotect_rtcp(packet)
    }
}

/// No crypto at all; for lab integration only.
#[derive(Default)]
pub struct PlaintextTransport;

impl PlaintextTransport {
    pub fn new() -> Self {
        Self
    }
}

impl RtcTransport for PlaintextTransport {
    fn start(&mut self, _now: Instant) -> Result<()> {
        Ok(())
    }

    fn handle_dtls(&mut self, _data: &[u8], _now: Instant) -> Result<()> {
        Ok(())
    }

    fn poll_outgoing(&mut self) -> Option<Bytes> {
        None
    }

    fn is_established(&self) -> bool {
        true
    }

    fn protect_rtp(&mut self, packet: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(packet))
    }

    fn unprotect_rtp(&mut self, packet: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(packet))
    }

    fn protect_rtcp(&mut self, packet: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(packet))
    }

    fn unprotect_rtcp(&mut self, packet: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(packet))
    }
}
