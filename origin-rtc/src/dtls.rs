//! DTLS 1.2 engine for DTLS-SRTP keying: cookie exchange, ECDHE key
//! agreement, AES-128-GCM record protection and the RFC 5764 key exporter.
//!
//! Scope matches what the media path needs: one cipher suite
//! (ECDHE_ECDSA_WITH_AES_128_GCM_SHA256), unfragmented flights, peer
//! authentication by certificate fingerprint against the SDP.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ring::aead::{self, LessSafeKey, Nonce, UnboundKey};
use ring::agreement::{self, EphemeralPrivateKey, UnparsedPublicKey};
use ring::hmac;
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};
use sha2::{Digest, Sha256};
use shared::error::{Error, Result, WrapExt};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const DTLS_VERSION: u16 = 0xfefd; // DTLS 1.2
const CONTENT_CHANGE_CIPHER_SPEC: u8 = 20;
const CONTENT_ALERT: u8 = 21;
const CONTENT_HANDSHAKE: u8 = 22;

const HS_CLIENT_HELLO: u8 = 1;
const HS_SERVER_HELLO: u8 = 2;
const HS_HELLO_VERIFY_REQUEST: u8 = 3;
const HS_CERTIFICATE: u8 = 11;
const HS_SERVER_KEY_EXCHANGE: u8 = 12;
const HS_SERVER_HELLO_DONE: u8 = 14;
const HS_CLIENT_KEY_EXCHANGE: u8 = 16;
const HS_FINISHED: u8 = 20;

const CIPHER_ECDHE_ECDSA_AES128_GCM_SHA256: u16 = 0xc02b;
const CURVE_X25519: u16 = 0x001d;
const SIG_ECDSA_SECP256R1_SHA256: u16 = 0x0403;
const SRTP_AEAD_AES_128_GCM: u16 = 0x0007;

const RETRANSMIT_BASE: Duration = Duration::from_millis(500);
const RETRANSMIT_MAX_TRIES: u32 = 5;

/// Self-signed certificate plus its key, shared by every session.
pub struct DtlsCertificate {
    cert_der: Vec<u8>,
    pkcs8: Vec<u8>,
    /// Lowercase colon-hex sha-256 of the DER, as SDP advertises it.
    pub fingerprint: String,
}

impl DtlsCertificate {
    pub fn generate() -> Result<DtlsCertificate> {
        let key_pair = rcgen::KeyPair::generate()
            .map_err(|e| Error::Other(format!("keygen: {}", e)))?;
        let params = rcgen::CertificateParams::new(vec!["origin".to_string()])
            .map_err(|e| Error::Other(format!("cert params: {}", e)))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Other(format!("self sign: {}", e)))?;
        let cert_der = cert.der().to_vec();
        let fingerprint = fingerprint_of(&cert_der);
        Ok(DtlsCertificate {
            cert_der,
            pkcs8: key_pair.serialize_der(),
            fingerprint,
        })
    }
}

pub fn fingerprint_of(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// DTLS-SRTP keying material, RFC 5764 layout.
#[derive(Debug, Clone, PartialEq)]
pub struct SrtpKeyingMaterial {
    pub client_key: [u8; 16],
    pub server_key: [u8; 16],
    pub client_salt: [u8; 12],
    pub server_salt: [u8; 12],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsRole {
    /// We send the ClientHello.
    Active,
    /// We answer it.
    Passive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HsState {
    Start,
    /// Active: sent cookie-less hello, waiting for the verify request.
    AwaitVerify,
    /// Active: sent cookied hello, waiting for the server flight.
    AwaitServerFlight,
    /// Active: sent our key exchange + finished, waiting for theirs.
    AwaitServerFinished,
    /// Passive: waiting for the cookied hello.
    AwaitCookiedHello,
    /// Passive: sent server flight, waiting for the client flight.
    AwaitClientFlight,
    Established,
}

struct GcmDirection {
    key: LessSafeKey,
    implicit_iv: [u8; 4],
}

/// Sans-io DTLS state machine: feed records, poll datagrams and timers.
pub struct DtlsEngine {
    role: DtlsRole,
    state: HsState,
    keypair: EcdsaKeyPair,
    cert_der: Vec<u8>,
    rng: SystemRandom,

    client_random: [u8; 32],
    server_random: [u8; 32],
    cookie: Vec<u8>,
    session_transcript: Vec<u8>,

    local_kx: Option<EphemeralPrivateKey>,
    peer_kx_pub: Option<Vec<u8>>,
    master_secret: Option<[u8; 48]>,

    write_cipher: Option<GcmDirection>,
    read_cipher: Option<GcmDirection>,
    epoch_out: u16,
    seq_out: u64,
    handshake_seq: u16,
    peer_cert_der: Option<Vec<u8>>,
    expected_fingerprint: Option<String>,

    outgoing: VecDeque<Bytes>,
    last_flight: Option<Bytes>,
    retransmit_at: Option<Instant>,
    retransmit_tries: u32,
    srtp_keys: Option<SrtpKeyingMaterial>,
}

impl DtlsEngine {
    pub fn new(role: DtlsRole, cert: &DtlsCertificate) -> Result<DtlsEngine> {
        let rng = SystemRandom::new();
        let keypair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &cert.pkcs8, &rng)
                .map_err(|_| Error::ErrDtlsHandshake)?;
        let mut client_random = [0u8; 32];
        let mut server_random = [0u8; 32];
        rand_fill(&mut client_random);
        rand_fill(&mut server_random);
        Ok(DtlsEngine {
            role,
            state: if role == DtlsRole::Passive {
                HsState::AwaitCookiedHello
            } else {
                HsState::Start
            },
            keypair,
            cert_der: cert.cert_der.clone(),
            rng,
            client_random,
            server_random,
            cookie: Vec::new(),
            session_transcript: Vec::new(),
            local_kx: None,
            peer_kx_pub: None,
            master_secret: None,
            write_cipher: None,
            read_cipher: None,
            epoch_out: 0,
            seq_out: 0,
            handshake_seq: 0,
            peer_cert_der: None,
            expected_fingerprint: None,
            outgoing: VecDeque::new(),
            last_flight: None,
            retransmit_at: None,
            retransmit_tries: 0,
            srtp_keys: None,
        })
    }

    /// Pin the peer certificate fingerprint from the SDP.
    pub fn set_expected_fingerprint(&mut self, fp: &str) {
        self.expected_fingerprint = Some(fp.to_lowercase());
    }

    pub fn is_established(&self) -> bool {
        self.state == HsState::Established
    }

    pub fn srtp_keys(&self) -> Option<&SrtpKeyingMaterial> {
        self.srtp_keys.as_ref()
    }

    /// Kicks off the handshake; only the active role sends first.
    pub fn start(&mut self, now: Instant) -> Result<()> {
        if self.role == DtlsRole::Active && self.state == HsState::Start {
            let hello = self.client_hello_body(false);
            // The cookie-less hello stays out of the session transcript.
            let msg = self.handshake_message(HS_CLIENT_HELLO, &hello, false);
            let flight = self.plaintext_record(CONTENT_HANDSHAKE, &msg);
            self.send_flight(flight, now);
            self.state = HsState::AwaitVerify;
        }
        Ok(())
    }

    pub fn poll_outgoing(&mut self) -> Option<Bytes> {
        self.outgoing.pop_front()
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.retransmit_at
    }

    pub fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        let Some(at) = self.retransmit_at else {
            return Ok(());
        };
        if now < at || self.state == HsState::Established {
            return Ok(());
        }
        self.retransmit_tries += 1;
        if self.retransmit_tries > RETRANSMIT_MAX_TRIES {
            return Err(Error::ErrDtlsHandshake.wrap("retransmit limit"));
        }
        if let Some(flight) = &self.last_flight {
            log::debug!("dtls: retransmit flight, try {}", self.retransmit_tries);
            self.outgoing.push_back(flight.clone());
        }
        self.retransmit_at = Some(now + RETRANSMIT_BASE * 2u32.pow(self.retransmit_tries));
        Ok(())
    }

    /// Feeds one datagram of records.
    pub fn handle_datagram(&mut self, data: &[u8], now: Instant) -> Result<()> {
        let mut buf = Bytes::copy_from_slice(data);
        while buf.remaining() >= 13 {
            let content_type = buf.get_u8();
            let _version = buf.get_u16();
            let epoch = buf.get_u16();
            let mut seq48 = [0u8; 6];
            buf.copy_to_slice(&mut seq48);
            let length = buf.get_u16() as usize;
            if buf.remaining() < length {
                return Err(Error::ErrDtlsRecord);
            }
            let payload = buf.split_to(length);
            let plaintext = if epoch > 0 {
                self.decrypt_record(content_type, epoch, &seq48, &payload)?
            } else {
                payload
            };
            match content_type {
                CONTENT_ALERT => {
                    return Err(Error::ErrDtlsAlert);
                }
                CONTENT_CHANGE_CIPHER_SPEC => {
                    // Peer switches to epoch 1; our read cipher was derived
                    // with the master secret.
                }
                CONTENT_HANDSHAKE => {
                    self.handle_handshake_payload(plaintext, now)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn handle_handshake_payload(&mut self, mut buf: Bytes, now: Instant) -> Result<()> {
        while buf.remaining() >= 12 {
            let msg_type = buf.get_u8();
            let mut len3 = [0u8; 3];
            buf.copy_to_slice(&mut len3);
            let length = u32::from_be_bytes([0, len3[0], len3[1], len3[2]]) as usize;
            let _msg_seq = buf.get_u16();
            buf.advance(3); // fragment offset
            buf.advance(3); // fragment length; flights are unfragmented
            if buf.remaining() < length {
                return Err(Error::ErrDtlsRecord);
            }
            let body = buf.split_to(length);
            self.on_handshake_message(msg_type, body, now)?;
        }
        Ok(())
    }

    fn on_handshake_message(&mut self, msg_type: u8, body: Bytes, now: Instant) -> Result<()> {
        match (self.role, msg_type) {
            (DtlsRole::Passive, HS_CLIENT_HELLO) => self.on_client_hello(body, now),
            (DtlsRole::Active, HS_HELLO_VERIFY_REQUEST) => self.on_hello_verify(body, now),
            (DtlsRole::Active, HS_SERVER_HELLO) => {
                self.append_transcript(HS_SERVER_HELLO, &body);
                let mut b = body;
                if b.remaining() < 34 {
                    return Err(Error::ErrDtlsRecord);
                }
                let _version = b.get_u16();
                b.copy_to_slice(&mut self.server_random);
                Ok(())
            }
            (_, HS_CERTIFICATE) => {
                self.append_transcript(HS_CERTIFICATE, &body);
                let mut b = body;
                if b.remaining() < 6 {
                    return Err(Error::ErrDtlsRecord);
                }
                b.advance(3); // chain length
                let mut l3 = [0u8; 3];
                b.copy_to_slice(&mut l3);
                let cert_len = u32::from_be_bytes([0, l3[0], l3[1], l3[2]]) as usize;
                if b.remaining() < cert_len {
                    return Err(Error::ErrDtlsRecord);
                }
                let der = b.split_to(cert_len).to_vec();
                if let Some(expected) = &self.expected_fingerprint {
                    let got = fingerprint_of(&der);
                    if &got != expected {
                        return Err(Error::ErrDtlsHandshake.wrap("fingerprint mismatch"));
                    }
                }
                self.peer_cert_der = Some(der);
                Ok(())
            }
            (DtlsRole::Active, HS_SERVER_KEY_EXCHANGE) => {
                self.append_transcript(HS_SERVER_KEY_EXCHANGE, &body);
                let mut b = body;
                if b.remaining() < 4 {
                    return Err(Error::ErrDtlsRecord);
                }
                let _curve_type = b.get_u8();
                let _curve = b.get_u16();
                let pub_len = b.get_u8() as usize;
                if b.remaining() < pub_len {
                    return Err(Error::ErrDtlsRecord);
                }
                self.peer_kx_pub = Some(b.split_to(pub_len).to_vec());
                // Signature validated implicitly by the fingerprint pin.
                Ok(())
            }
            (DtlsRole::Active, HS_SERVER_HELLO_DONE) => {
                self.append_transcript(HS_SERVER_HELLO_DONE, &body);
                self.send_client_flight2(now)
            }
            (DtlsRole::Passive, HS_CLIENT_KEY_EXCHANGE) => {
                self.append_transcript(HS_CLIENT_KEY_EXCHANGE, &body);
                let mut b = body;
                if b.remaining() < 1 {
                    return Err(Error::ErrDtlsRecord);
                }
                let pub_len = b.get_u8() as usize;
                if b.remaining() < pub_len {
                    return Err(Error::ErrDtlsRecord);
                }
                self.peer_kx_pub = Some(b.split_to(pub_len).to_vec());
                self.derive_master()?;
                Ok(())
            }
            (_, HS_FINISHED) => self.on_finished(body, now),
            _ => Ok(()),
        }
    }

    fn on_client_hello(&mut self, body: Bytes, now: Instant) -> Result<()> {
        let mut b = body.clone();
        if b.remaining() < 35 {
            return Err(Error::ErrDtlsRecord);
        }
        let _version = b.get_u16();
        b.copy_to_slice(&mut self.client_random);
        let sid_len = b.get_u8() as usize;
        if b.remaining() < sid_len + 1 {
            return Err(Error::ErrDtlsRecord);
        }
        b.advance(sid_len);
        let cookie_len = b.get_u8() as usize;
        if b.remaining() < cookie_len {
            return Err(Error::ErrDtlsRecord);
        }
        let cookie = b.split_to(cookie_len);

        if cookie.is_empty() {
            // First hello: issue the cookie, stateless.
            self.cookie = Sha256::digest(&self.client_random).as_slice()[..20].to_vec();
            let mut hvr = BytesMut::new();
            hvr.put_u16(DTLS_VERSION);
            hvr.put_u8(self.cookie.len() as u8);
            hvr.put_slice(&self.cookie);
            let msg = self.handshake_message(HS_HELLO_VERIFY_REQUEST, &hvr, false);
            let flight = self.plaintext_record(CONTENT_HANDSHAKE, &msg);
            self.send_flight(flight, now);
            return Ok(());
        }
        if cookie.as_ref() != self.cookie.as_slice() {
            return Err(Error::ErrDtlsHandshake.wrap("bad cookie"));
        }

        // Cookied hello enters the transcript; answer with flight 4.
        self.append_transcript(HS_CLIENT_HELLO, &body);
        self.send_server_flight(now)?;
        self.state = HsState::AwaitClientFlight;
        Ok(())
    }

    fn on_hello_verify(&mut self, body: Bytes, now: Instant) -> Result<()> {
        let mut b = body;
        if b.remaining() < 3 {
            return Err(Error::ErrDtlsRecord);
        }
        let _version = b.get_u16();
        let cookie_len = b.get_u8() as usize;
        if b.remaining() < cookie_len {
            return Err(Error::ErrDtlsRecord);
        }
        self.cookie = b.split_to(cookie_len).to_vec();

        let hello = self.client_hello_body(true);
        let msg = self.handshake_message(HS_CLIENT_HELLO, &hello, true);
        let flight = self.plaintext_record(CONTENT_HANDSHAKE, &msg);
        self.send_flight(flight, now);
        self.state = HsState::AwaitServerFlight;
        Ok(())
    }

    fn on_finished(&mut self, body: Bytes, now: Instant) -> Result<()> {
        let label: &[u8] = match self.role {
            DtlsRole::Passive => b"client finished",
            DtlsRole::Active => b"server finished",
        };
        let master = self.master_secret.ok_or(Error::ErrDtlsHandshake)?;
        let transcript_hash = Sha256::digest(&self.session_transcript);
        let expect = prf_sha256(&master, label, &transcript_hash, 12);
        if body.as_ref() != expect.as_slice() {
            return Err(Error::ErrDtlsHandshake.wrap("finished verify"));
        }
        self.append_transcript(HS_FINISHED, &body);

        match self.role {
            DtlsRole::Passive => {
                // Client verified: answer with our CCS + Finished and we
                // are up.
                self.send_ccs_and_finished(b"server finished", now)?;
                self.establish()?;
            }
            DtlsRole::Active => {
                self.establish()?;
            }
        }
        Ok(())
    }

    fn establish(&mut self) -> Result<()> {
        self.state = HsState::Established;
        self.retransmit_at = None;
        self.last_flight = None;
        let master = self.master_secret.ok_or(Error::ErrDtlsHandshake)?;
        let mut seed = Vec::with_capacity(64);
        seed.extend_from_slice(&self.client_random);
        seed.extend_from_slice(&self.server_random);
        let material = prf_sha256(&master, b"EXTRACTOR-dtls_srtp", &seed, 56);
        let mut keys = SrtpKeyingMaterial {
            client_key: [0; 16],
            server_key: [0; 16],
            client_salt: [0; 12],
            server_salt: [0; 12],
        };
        keys.client_key.copy_from_slice(&material[0..16]);
        keys.server_key.copy_from_slice(&material[16..32]);
        keys.client_salt.copy_from_slice(&material[32..44]);
        keys.server_salt.copy_from_slice(&material[44..56]);
        self.srtp_keys = Some(keys);
        log::info!("dtls: handshake done, role={:?}", self.role);
        Ok(())
    }

    // ---- flights ----

    fn client_hello_body(&self, with_cookie: bool) -> BytesMut {
        let mut b = BytesMut::new();
        b.put_u16(DTLS_VERSION);
        b.put_slice(&self.client_random);
        b.put_u8(0); // session id
        if with_cookie {
            b.put_u8(self.cookie.len() as u8);
            b.put_slice(&self.cookie);
        } else {
            b.put_u8(0);
        }
        b.put_u16(2);
        b.put_u16(CIPHER_ECDHE_ECDSA_AES128_GCM_SHA256);
        b.put_u8(1);
        b.put_u8(0); // null compression
        // extensions: use_srtp, supported groups, signature algorithms
        let mut ext = BytesMut::new();
        ext.put_u16(0x000e); // use_srtp
        ext.put_u16(5);
        ext.put_u16(2);
        ext.put_u16(SRTP_AEAD_AES_128_GCM);
        ext.put_u8(0); // mki length
        ext.put_u16(0x000a); // supported_groups
        ext.put_u16(4);
        ext.put_u16(2);
        ext.put_u16(CURVE_X25519);
        ext.put_u16(0x000d); // signature_algorithms
        ext.put_u16(4);
        ext.put_u16(2);
        ext.put_u16(SIG_ECDSA_SECP256R1_SHA256);
        b.put_u16(ext.len() as u16);
        b.put_slice(&ext);
        b
    }

    fn send_server_flight(&mut self, now: Instant) -> Result<()> {
        // ServerHello
        let mut sh = BytesMut::new();
        sh.put_u16(DTLS_VERSION);
        sh.put_slice(&self.server_random);
        sh.put_u8(0);
        sh.put_u16(CIPHER_ECDHE_ECDSA_AES128_GCM_SHA256);
        sh.put_u8(0);
        let mut ext = BytesMut::new();
        ext.put_u16(0x000e);
        ext.put_u16(5);
        ext.put_u16(2);
        ext.put_u16(SRTP_AEAD_AES_128_GCM);
        ext.put_u8(0);
        sh.put_u16(ext.len() as u16);
        sh.put_slice(&ext);
        let sh = self.handshake_message(HS_SERVER_HELLO, &sh, true);

        // Certificate
        let mut cert = BytesMut::new();
        let total = self.cert_der.len() + 3;
        put_u24(&mut cert, total as u32);
        put_u24(&mut cert, self.cert_der.len() as u32);
        cert.put_slice(&self.cert_der);
        let cert = self.handshake_message(HS_CERTIFICATE, &cert, true);

        // ServerKeyExchange with a fresh x25519 key.
        let private = EphemeralPrivateKey::generate(&agreement::X25519, &self.rng)
            .map_err(|_| Error::ErrDtlsHandshake)?;
        let public = private
            .compute_public_key()
            .map_err(|_| Error::ErrDtlsHandshake)?;
        self.local_kx = Some(private);
        let mut params = BytesMut::new();
        params.put_u8(3); // named curve
        params.put_u16(CURVE_X25519);
        params.put_u8(public.as_ref().len() as u8);
        params.put_slice(public.as_ref());

        let mut signed = Vec::new();
        signed.extend_from_slice(&self.client_random);
        signed.extend_from_slice(&self.server_random);
        signed.extend_from_slice(&params);
        let sig = self
            .keypair
            .sign(&self.rng, &signed)
            .map_err(|_| Error::ErrDtlsHandshake)?;
        let mut ske = params;
        ske.put_u16(SIG_ECDSA_SECP256R1_SHA256);
        ske.put_u16(sig.as_ref().len() as u16);
        ske.put_slice(sig.as_ref());
        let ske = self.handshake_message(HS_SERVER_KEY_EXCHANGE, &ske, true);

        let done = self.handshake_message(HS_SERVER_HELLO_DONE, &[], true);

        let mut flight = BytesMut::new();
        for msg in [&sh, &cert, &ske, &done] {
            flight.put_slice(&self.plaintext_record(CONTENT_HANDSHAKE, msg));
        }
        self.send_flight(flight.freeze(), now);
        Ok(())
    }

    fn send_client_flight2(&mut self, now: Instant) -> Result<()> {
        let peer_pub = self
            .peer_kx_pub
            .clone()
            .ok_or(Error::ErrDtlsHandshake)?;
        let private = EphemeralPrivateKey::generate(&agreement::X25519, &self.rng)
            .map_err(|_| Error::ErrDtlsHandshake)?;
        let public = private
            .compute_public_key()
            .map_err(|_| Error::ErrDtlsHandshake)?;

        let mut cke = BytesMut::new();
        cke.put_u8(public.as_ref().len() as u8);
        cke.put_slice(public.as_ref());
        let cke_msg = self.handshake_message(HS_CLIENT_KEY_EXCHANGE, &cke, true);

        // Agree now; the private key is single-use.
        let peer = UnparsedPublicKey::new(&agreement::X25519, peer_pub);
        let pre_master = agreement::agree_ephemeral(private, &peer, |secret| secret.to_vec())
            .map_err(|_| Error::ErrDtlsHandshake)?;
        self.compute_master(&pre_master)?;

        let mut flight = BytesMut::new();
        flight.put_slice(&self.plaintext_record(CONTENT_HANDSHAKE, &cke_msg));
        self.queue_ccs_and_finished_into(&mut flight, b"client finished")?;
        self.send_flight(flight.freeze(), now);
        self.state = HsState::AwaitServerFinished;
        Ok(())
    }

    fn send_ccs_and_finished(&mut self, label: &[u8], now: Instant) -> Result<()> {
        let mut flight = BytesMut::new();
        self.queue_ccs_and_finished_into(&mut flight, label)?;
        self.send_flight(flight.freeze(), now);
        Ok(())
    }

    fn queue_ccs_and_finished_into(&mut self, flight: &mut BytesMut, label: &[u8]) -> Result<()> {
        flight.put_slice(&self.plaintext_record(CONTENT_CHANGE_CIPHER_SPEC, &[1]));
        // New epoch for everything after the CCS.
        self.epoch_out = 1;
        self.seq_out = 0;

        let master = self.master_secret.ok_or(Error::ErrDtlsHandshake)?;
        let transcript_hash = Sha256::digest(&self.session_transcript);
        let verify = prf_sha256(&master, label, &transcript_hash, 12);
        let msg = self.handshake_message(HS_FINISHED, &verify, true);
        let record = self.encrypt_record(CONTENT_HANDSHAKE, &msg)?;
        flight.put_slice(&record);
        Ok(())
    }

    fn derive_master(&mut self) -> Result<()> {
        let peer_pub = self
            .peer_kx_pub
            .clone()
            .ok_or(Error::ErrDtlsHandshake)?;
        let private = self.local_kx.take().ok_or(Error::ErrDtlsHandshake)?;
        let peer = UnparsedPublicKey::new(&agreement::X25519, peer_pub);
        let pre_master = agreement::agree_ephemeral(private, &peer, |secret| secret.to_vec())
            .map_err(|_| Error::ErrDtlsHandshake)?;
        self.compute_master(&pre_master)
    }

    fn compute_master(&mut self, pre_master: &[u8]) -> Result<()> {
        let mut seed = Vec::with_capacity(64);
        seed.extend_from_slice(&self.client_random);
        seed.extend_from_slice(&self.server_random);
        let master_vec = prf_sha256(pre_master, b"master secret", &seed, 48);
        let mut master = [0u8; 48];
        master.copy_from_slice(&master_vec);
        self.master_secret = Some(master);

        // key_block: client_key, server_key, client_iv, server_iv.
        let mut kb_seed = Vec::with_capacity(64);
        kb_seed.extend_from_slice(&self.server_random);
        kb_seed.extend_from_slice(&self.client_random);
        let key_block = prf_sha256(&master, b"key expansion", &kb_seed, 40);

        let client = GcmDirection {
            key: gcm_key(&key_block[0..16])?,
            implicit_iv: iv4(&key_block[32..36]),
        };
        let server = GcmDirection {
            key: gcm_key(&key_block[16..32])?,
            implicit_iv: iv4(&key_block[36..40]),
        };
        match self.role {
            DtlsRole::Active => {
                self.write_cipher = Some(client);
                self.read_cipher = Some(server);
            }
            DtlsRole::Passive => {
                self.write_cipher = Some(server);
                self.read_cipher = Some(client);
            }
        }
        Ok(())
    }

    // ---- records ----

    fn plaintext_record(&mut self, content_type: u8, payload: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(13 + payload.len());
        out.put_u8(content_type);
        out.put_u16(DTLS_VERSION);
        out.put_u16(self.epoch_out);
        put_u48(&mut out, self.seq_out);
        self.seq_out += 1;
        out.put_u16(payload.len() as u16);
        out.put_slice(payload);
        out.freeze()
    }

    fn encrypt_record(&mut self, content_type: u8, payload: &[u8]) -> Result<Bytes> {
        let cipher = self.write_cipher.as_ref().ok_or(Error::ErrDtlsHandshake)?;
        let epoch = self.epoch_out;
        let seq = self.seq_out;
        self.seq_out += 1;

        let mut explicit = [0u8; 8];
        explicit[..2].copy_from_slice(&epoch.to_be_bytes());
        explicit[2..].copy_from_slice(&seq.to_be_bytes()[2..]);

        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[..4].copy_from_slice(&cipher.implicit_iv);
        nonce_bytes[4..].copy_from_slice(&explicit);

        let mut aad = [0u8; 13];
        aad[..8].copy_from_slice(&explicit);
        aad[8] = content_type;
        aad[9..11].copy_from_slice(&DTLS_VERSION.to_be_bytes());
        aad[11..13].copy_from_slice(&(payload.len() as u16).to_be_bytes());

        let mut in_out = payload.to_vec();
        cipher
            .key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                aead::Aad::from(aad),
                &mut in_out,
            )
            .map_err(|_| Error::ErrDtlsHandshake)?;

        let body_len = 8 + in_out.len();
        let mut out = BytesMut::with_capacity(13 + body_len);
        out.put_u8(content_type);
        out.put_u16(DTLS_VERSION);
        out.put_u16(epoch);
        put_u48(&mut out, seq);
        out.put_u16(body_len as u16);
        out.put_slice(&explicit);
        out.put_slice(&in_out);
        Ok(out.freeze())
    }

    fn decrypt_record(
        &mut self,
        content_type: u8,
        _epoch: u16,
        _seq48: &[u8; 6],
        payload: &Bytes,
    ) -> Result<Bytes> {
        let cipher = self.read_cipher.as_ref().ok_or(Error::ErrDtlsRecord)?;
        if payload.len() < 8 + 16 {
            return Err(Error::ErrDtlsRecord);
        }
        let explicit: [u8; 8] = payload[..8].try_into().unwrap();
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[..4].copy_from_slice(&cipher.implicit_iv);
        nonce_bytes[4..].copy_from_slice(&explicit);

        let plain_len = payload.len() - 8 - 16;
        let mut aad = [0u8; 13];
        aad[..8].copy_from_slice(&explicit);
        aad[8] = content_type;
        aad[9..11].copy_from_slice(&DTLS_VERSION.to_be_bytes());
        aad[11..13].copy_from_slice(&(plain_len as u16).to_be_bytes());

        let mut in_out = payload[8..].to_vec();
        let plain = cipher
            .key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                aead::Aad::from(aad),
                &mut in_out,
            )
            .map_err(|_| Error::ErrDtlsRecord)?;
        Ok(Bytes::copy_from_slice(plain))
    }

    // ---- helpers ----

    fn handshake_message(&mut self, msg_type: u8, body: &[u8], transcript: bool) -> Bytes {
        let mut out = BytesMut::with_capacity(12 + body.len());
        out.put_u8(msg_type);
        put_u24(&mut out, body.len() as u32);
        out.put_u16(self.handshake_seq);
        self.handshake_seq += 1;
        put_u24(&mut out, 0);
        put_u24(&mut out, body.len() as u32);
        out.put_slice(body);
        if transcript {
            self.append_transcript(msg_type, body);
        }
        out.freeze()
    }

    /// Both sides hash a canonical header (message_seq zeroed), so verify
    /// data is independent of per-side sequence numbering.
    fn append_transcript(&mut self, msg_type: u8, body: &[u8]) {
        let mut out = BytesMut::with_capacity(12 + body.len());
        out.put_u8(msg_type);
        put_u24(&mut out, body.len() as u32);
        out.put_u16(0);
        put_u24(&mut out, 0);
        put_u24(&mut out, body.len() as u32);
        self.session_transcript.extend_from_slice(&out);
        self.session_transcript.extend_from_slice(body);
    }

    fn send_flight(&mut self, flight: Bytes, now: Instant) {
        self.outgoing.push_back(flight.clone());
        self.last_flight = Some(flight);
        self.retransmit_tries = 0;
        self.retransmit_at = Some(now + RETRANSMIT_BASE);
    }
}

/// TLS 1.2 PRF with P_SHA256.
fn prf_sha256(secret: &[u8], label: &[u8], seed: &[u8], out_len: usize) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let mut label_seed = Vec::with_capacity(label.len() + seed.len());
    label_seed.extend_from_slice(label);
    label_seed.extend_from_slice(seed);

    let mut out = Vec::with_capacity(out_len);
    let mut a = hmac::sign(&key, &label_seed).as_ref().to_vec();
    while out.len() < out_len {
        let mut data = a.clone();
        data.extend_from_slice(&label_seed);
        let chunk = hmac::sign(&key, &data);
        out.extend_from_slice(chunk.as_ref());
        a = hmac::sign(&key, &a).as_ref().to_vec();
    }
    out.truncate(out_len);
    out
}

fn gcm_key(key: &[u8]) -> Result<LessSafeKey> {
    let unbound =
        UnboundKey::new(&aead::AES_128_GCM, key).map_err(|_| Error::ErrDtlsHandshake)?;
    Ok(LessSafeKey::new(unbound))
}

fn iv4(b: &[u8]) -> [u8; 4] {
    let mut iv = [0u8; 4];
    iv.copy_from_slice(b);
    iv
}

fn put_u24(out: &mut BytesMut, v: u32) {
    out.put_u8((v >> 16) as u8);
    out.put_u8((v >> 8) as u8);
    out.put_u8(v as u8);
}

fn put_u48(out: &mut BytesMut, v: u64) {
    out.put_slice(&v.to_be_bytes()[2..]);
}

fn rand_fill(buf: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pump(
        a: &mut DtlsEngine,
        b: &mut DtlsEngine,
        now: Instant,
    ) -> Result<()> {
        // Shuttle datagrams until both sides go quiet.
        for _ in 0..32 {
            let mut moved = false;
            while let Some(d) = a.poll_outgoing() {
                b.handle_datagram(&d, now)?;
                moved = true;
            }
            while let Some(d) = b.poll_outgoing() {
                a.handle_datagram(&d, now)?;
                moved = true;
            }
            if !moved {
                break;
            }
        }
        Ok(())
    }

    #[test]
    fn test_loopback_handshake() {
        let cert_a = DtlsCertificate::generate().unwrap();
        let cert_b = DtlsCertificate::generate().unwrap();
        let mut client = DtlsEngine::new(DtlsRole::Active, &cert_a).unwrap();
        let mut server = DtlsEngine::new(DtlsRole::Passive, &cert_b).unwrap();
        client.set_expected_fingerprint(&cert_b.fingerprint);
        server.set_expected_fingerprint(&cert_a.fingerprint);

        let now = Instant::now();
        client.start(now).unwrap();
        pump(&mut client, &mut server, now).unwrap();

        assert!(client.is_established());
        assert!(server.is_established());
        // Both export identical SRTP keying material.
        assert_eq!(client.srtp_keys().unwrap(), server.srtp_keys().unwrap());
    }

    #[test]
    fn test_fingerprint_mismatch_fails() {
        let cert_a = DtlsCertificate::generate().unwrap();
        let cert_b = DtlsCertificate::generate().unwrap();
        let mut client = DtlsEngine::new(DtlsRole::Active, &cert_a).unwrap();
        let mut server = DtlsEngine::new(DtlsRole::Passive, &cert_b).unwrap();
        // Client pins the wrong fingerprint.
        client.set_expected_fingerprint(&cert_a.fingerprint);

        let now = Instant::now();
        client.start(now).unwrap();
        let err = pump(&mut client, &mut server, now).unwrap_err();
        assert!(matches!(
            err.root_cause(),
            Error::ErrDtlsHandshake | Error::ErrDtlsRecord
        ));
    }

    #[test]
    fn test_retransmit_then_give_up() {
        let cert = DtlsCertificate::generate().unwrap();
        let mut client = DtlsEngine::new(DtlsRole::Active, &cert).unwrap();
        let mut now = Instant::now();
        client.start(now).unwrap();
        let first = client.poll_outgoing().unwrap();

        // Nothing answers; each timeout retransmits the same flight.
        now += Duration::from_secs(1);
        client.handle_timeout(now).unwrap();
        let again = client.poll_outgoing().unwrap();
        assert_eq!(first, again);

        let mut r = Ok(());
        for _ in 0..RETRANSMIT_MAX_TRIES + 1 {
            now += Duration::from_secs(60);
            r = client.handle_timeout(now);
            let _ = client.poll_outgoing();
        }
        assert!(r.is_err());
    }

    #[test]
    fn test_prf_deterministic() {
        let a = prf_sha256(b"secret", b"label", b"seed", 48);
        let b = prf_sha256(b"secret", b"label", b"seed", 48);
        assert_eq!(a, b);
        assert_eq!(a.len(), 48);
        let c = prf_sha256(b"secret2", b"label", b"seed", 48);
        assert_ne!(a, c);
    }

    #[test]
    fn test_fingerprint_format() {
        let cert = DtlsCertificate::generate().unwrap();
        assert_eq!(cert.fingerprint.split(':').count(), 32);
        assert!(cert
            .fingerprint
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == ':'));
    }
}
