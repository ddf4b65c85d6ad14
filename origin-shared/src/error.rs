use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("i/o timeout")]
    ErrTimeout,
    #[error("interrupted")]
    ErrInterrupted,
    #[error("eof")]
    ErrEof,
    #[error("buffer: short")]
    ErrBufferShort,
    #[error("buffer: full")]
    ErrBufferFull,
    #[error("stream is busy")]
    ErrSourceBusy,
    #[error("source not found")]
    ErrSourceNotFound,
    #[error("consumer gone")]
    ErrConsumerGone,
    #[error("mutex: relock by owner")]
    ErrMutexRelock,
    #[error("mutex: unlock by non-owner")]
    ErrMutexNotOwner,

    #[error("amf0: invalid marker {0}")]
    ErrAmf0Marker(u8),
    #[error("amf0: object eof required")]
    ErrAmf0ObjectEof,
    #[error("flv: invalid signature")]
    ErrFlvSignature,
    #[error("flv: invalid tag type {0}")]
    ErrFlvTagType(u8),
    #[error("adts: invalid header")]
    ErrAdtsHeader,
    #[error("annexb: no start code")]
    ErrAnnexbNoStartCode,
    #[error("avc: empty nalu")]
    ErrNaluEmpty,
    #[error("hevc: invalid nalu")]
    ErrHevcNalu,
    #[error("ts: lost sync byte")]
    ErrTsSync,
    #[error("ts: invalid packet")]
    ErrTsPacket,
    #[error("mp4: box overflow")]
    ErrMp4Box,

    #[error("rtmp: handshake failed")]
    ErrRtmpHandshake,
    #[error("rtmp: invalid chunk header")]
    ErrRtmpChunkHeader,
    #[error("rtmp: chunk size {0} out of [128, 65536]")]
    ErrRtmpChunkSize(u32),
    #[error("rtmp: unexpected message type {0}")]
    ErrRtmpMessageType(u8),
    #[error("rtmp: invalid command {0}")]
    ErrRtmpCommand(String),
    #[error("rtmp: invalid tcUrl {0}")]
    ErrRtmpTcUrl(String),

    #[error("srt: invalid streamid {0}")]
    ErrSrtStreamId(String),
    #[error("srt: handshake rejected")]
    ErrSrtHandshake,
    #[error("srt: invalid packet")]
    ErrSrtPacket,

    #[error("stun: invalid message")]
    ErrStunMessage,
    #[error("stun: integrity check failed")]
    ErrStunIntegrity,
    #[error("sdp: invalid line {0}")]
    ErrSdpLine(String),
    #[error("dtls: invalid record")]
    ErrDtlsRecord,
    #[error("dtls: alert received")]
    ErrDtlsAlert,
    #[error("dtls: handshake failed")]
    ErrDtlsHandshake,
    #[error("srtp: unprotect failed")]
    ErrSrtpUnprotect,
    #[error("srtp: replayed packet")]
    ErrSrtpReplay,
    #[error("rtp: invalid header")]
    ErrRtpHeader,
    #[error("rtcp: invalid packet")]
    ErrRtcpPacket,
    #[error("rtc: session not found")]
    ErrRtcSessionNotFound,
    #[error("rtc: invalid state for {0}")]
    ErrRtcState(String),

    #[error("hooks: rejected by {0}")]
    ErrHookRejected(String),
    #[error("config: invalid value for {0}")]
    ErrConfigInvalid(String),

    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("{0}")]
    Other(String),

    #[error("{context}: {source}")]
    Wrap {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Prepends context, keeping the cause chain intact.
    pub fn wrap<C: Into<String>>(self, context: C) -> Error {
        Error::Wrap {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error of a wrap chain.
    pub fn root_cause(&self) -> &Error {
        let mut e = self;
        while let Error::Wrap { source, .. } = e {
            e = source;
        }
        e
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root_cause(), Error::ErrTimeout)
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self.root_cause(), Error::ErrInterrupted)
    }

    pub fn is_eof(&self) -> bool {
        matches!(self.root_cause(), Error::ErrEof)
    }

    /// Intentionally discards the error; an explicit reset, logged at warn.
    pub fn reset(self, why: &str) {
        log::warn!("reset error, {}: {}", why, self);
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::ErrTimeout,
            io::ErrorKind::Interrupted => Error::ErrInterrupted,
            io::ErrorKind::UnexpectedEof => Error::ErrEof,
            _ => Error::Io(e.to_string()),
        }
    }
}

impl From<FromUtf8Error> for Error {
    fn from(e: FromUtf8Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(e: std::str::Utf8Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(e: std::num::ParseIntError) -> Self {
        Error::Parse(e.to_string())
    }
}

/// Context-prepending sugar for `Result`, mirroring the wrap policy: never
/// discard a cause, always say where it crossed a layer boundary.
pub trait WrapExt<T> {
    fn wrap<C: Into<String>>(self, context: C) -> Result<T>;
    fn with_wrap<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T>;
}

impl<T> WrapExt<T> for Result<T> {
    fn wrap<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|e| e.wrap(context))
    }

    fn with_wrap<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T> {
        self.map_err(|e| e.wrap(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_keeps_root_cause() {
        let e = Error::ErrTimeout
            .wrap("read c0c1")
            .wrap("rtmp handshake");
        assert!(e.is_timeout());
        assert_eq!(e.root_cause(), &Error::ErrTimeout);
        let s = e.to_string();
        assert!(s.starts_with("rtmp handshake: "));
        assert!(s.ends_with("i/o timeout"));
    }

    #[test]
    fn test_io_error_kinds() {
        let e: Error = io::Error::new(io::ErrorKind::TimedOut, "t").into();
        assert_eq!(e, Error::ErrTimeout);
        let e: Error = io::Error::new(io::ErrorKind::UnexpectedEof, "e").into();
        assert_eq!(e, Error::ErrEof);
        let e: Error = io::Error::new(io::ErrorKind::ConnectionReset, "r").into();
        assert!(matches!(e, Error::Io(_)));
    }

    #[test]
    fn test_wrap_ext() {
        let r: Result<()> = Err(Error::ErrSourceBusy);
        let e = r.wrap("publish live/stream").unwrap_err();
        assert_eq!(e.root_cause(), &Error::ErrSourceBusy);
    }
}
