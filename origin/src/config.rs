//! Typed configuration tree, loaded from TOML. Reload parses a parallel
//! tree and diffs it directive-by-directive (see [crate::reload]).

use serde::Deserialize;
use shared::error::{Error, Result, WrapExt};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_VHOST: &str = "__defaultVhost__";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub breaker: BreakerConfig,
    pub vhosts: BTreeMap<String, VhostConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let mut vhosts = BTreeMap::new();
        vhosts.insert(DEFAULT_VHOST.to_string(), VhostConfig::default());
        Self {
            server: ServerConfig::default(),
            breaker: BreakerConfig::default(),
            vhosts,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen_rtmp: String,
    pub listen_http: String,
    pub listen_rtc: String,
    pub listen_srt: String,
    pub listen_mpegts_udp: Option<String>,
    pub pid_file: PathBuf,
    /// Source die window after the last publisher and consumer leave, s.
    pub source_die_window_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_rtmp: "0.0.0.0:1935".to_string(),
            listen_http: "0.0.0.0:8080".to_string(),
            listen_rtc: "0.0.0.0:8000".to_string(),
            listen_srt: "0.0.0.0:10080".to_string(),
            listen_mpegts_udp: None,
            pid_file: PathBuf::from("./objs/origin.pid"),
            source_die_window_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerConfig {
    pub enabled: bool,
    pub high_threshold: u32,
    pub high_pulse: u32,
    pub critical_threshold: u32,
    pub critical_pulse: u32,
    pub dying_threshold: u32,
    pub dying_pulse: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            high_threshold: 90,
            high_pulse: 2,
            critical_threshold: 95,
            critical_pulse: 1,
            dying_threshold: 99,
            dying_pulse: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct VhostConfig {
    pub enabled: Option<bool>,
    pub play: PlayConfig,
    pub hls: HlsVhostConfig,
    pub dash: DashVhostConfig,
    pub rtc: RtcVhostConfig,
    pub srt: SrtVhostConfig,
    pub forward: ForwardConfig,
    pub http_hooks: HooksConfig,
}

impl VhostConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PlayConfig {
    pub gop_cache: bool,
    pub gop_cache_max_frames: usize,
    pub queue_length_ms: i64,
    pub mix_correct: bool,
    pub atc: bool,
    /// full | zero | off
    pub time_jitter: String,
}

impl Default for PlayConfig {
    fn default() -> Self {
        Self {
            gop_cache: true,
            gop_cache_max_frames: 2500,
            queue_length_ms: 30_000,
            mix_correct: false,
            atc: false,
            time_jitter: "full".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HlsVhostConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub fragment_secs: f64,
    pub window_secs: f64,
    pub cleanup: bool,
    /// Virtual session contexts on the HTTP surface.
    pub hls_ctx: bool,
}

impl Default for HlsVhostConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("./objs/nginx/html"),
            fragment_secs: 10.0,
            window_secs: 60.0,
            cleanup: true,
            hls_ctx: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DashVhostConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub fragment_secs: f64,
    pub window_size: usize,
    pub cleanup: bool,
}

impl Default for DashVhostConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("./objs/nginx/html"),
            fragment_secs: 4.0,
            window_size: 5,
            cleanup: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RtcVhostConfig {
    pub enabled: bool,
    /// full | semi | plaintext
    pub transport: String,
    pub from_rtmp: bool,
    pub to_rtmp: bool,
}

impl Default for RtcVhostConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            transport: "full".to_string(),
            from_rtmp: false,
            to_rtmp: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SrtVhostConfig {
    pub enabled: bool,
    pub to_rtmp: bool,
    pub latency_ms: u32,
    pub passphrase: String,
    pub pbkeylen: u8,
    pub peer_idle_timeout_secs: u64,
}

impl Default for SrtVhostConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            to_rtmp: true,
            latency_ms: 120,
            passphrase: String::new(),
            pbkeylen: 0,
            peer_idle_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ForwardConfig {
    pub enabled: bool,
    pub destinations: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HooksConfig {
    pub enabled: bool,
    pub on_connect: Vec<String>,
    pub on_close: Vec<String>,
    pub on_publish: Vec<String>,
    pub on_unpublish: Vec<String>,
    pub on_play: Vec<String>,
    pub on_stop: Vec<String>,
    pub on_hls: Vec<String>,
    pub on_hls_notify: Vec<String>,
    pub on_dvr: Vec<String>,
    pub on_forward: Vec<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Io(e.to_string()))
            .with_wrap(|| format!("read config {}", path.display()))?;
        Config::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config> {
        let config: Config = toml::from_str(text)
            .map_err(|e| Error::ErrConfigInvalid(e.to_string()))
            .wrap("parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, vhost) in &self.vhosts {
            match vhost.play.time_jitter.as_str() {
                "full" | "zero" | "off" => {}
                other => {
                    return Err(Error::ErrConfigInvalid(format!(
                        "vhost {} time_jitter {}",
                        name, other
                    )));
                }
            }
            match vhost.rtc.transport.as_str() {
                "full" | "semi" | "plaintext" => {}
                other => {
                    return Err(Error::ErrConfigInvalid(format!(
                        "vhost {} rtc transport {}",
                        name, other
                    )));
                }
            }
            if ![0u8, 16, 24, 32].contains(&vhost.srt.pbkeylen) {
                return Err(Error::ErrConfigInvalid(format!(
                    "vhost {} srt pbkeylen {}",
                    name, vhost.srt.pbkeylen
                )));
            }
            if vhost.hls.fragment_secs <= 0.0 || vhost.hls.window_secs <= 0.0 {
                return Err(Error::ErrConfigInvalid(format!("vhost {} hls window", name)));
            }
        }
        Ok(())
    }

    /// Resolves a vhost by name, falling back to the default vhost.
    pub fn vhost(&self, name: &str) -> &VhostConfig {
        static FALLBACK: std::sync::OnceLock<VhostConfig> = std::sync::OnceLock::new();
        self.vhosts
            .get(name)
            .filter(|v| v.is_enabled())
            .or_else(|| self.vhosts.get(DEFAULT_VHOST))
            .unwrap_or_else(|| FALLBACK.get_or_init(VhostConfig::default))
    }

    pub fn source_config(&self, vhost: &str) -> live::SourceConfig {
        let play = &self.vhost(vhost).play;
        live::SourceConfig {
            gop_cache: play.gop_cache,
            gop_cache_max_frames: play.gop_cache_max_frames,
            queue_size_ms: play.queue_length_ms,
            mix_correct: play.mix_correct,
            atc: play.atc,
            jitter: live::JitterAlgorithm::parse(&play.time_jitter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.listen_rtmp, "0.0.0.0:1935");
        let vhost = config.vhost(DEFAULT_VHOST);
        assert!(vhost.play.gop_cache);
        assert_eq!(vhost.play.queue_length_ms, 30_000);
        assert!(!vhost.hls.enabled);
    }

    #[test]
    fn test_parse_vhost_tree() {
        let text = r#"
[server]
listen_rtmp = "0.0.0.0:19350"

[vhosts."cdn.example.com".play]
gop_cache = false
mix_correct = true
time_jitter = "zero"

[vhosts."cdn.example.com".hls]
enabled = true
fragment_secs = 4.0
window_secs = 20.0
"#;
        let config = Config::parse(text).unwrap();
        assert_eq!(config.server.listen_rtmp, "0.0.0.0:19350");
        let vhost = config.vhost("cdn.example.com");
        assert!(!vhost.play.gop_cache);
        assert!(vhost.play.mix_correct);
        assert!(vhost.hls.enabled);
        let sc = config.source_config("cdn.example.com");
        assert_eq!(sc.jitter, live::JitterAlgorithm::Zero);
    }

    #[test]
    fn test_unknown_vhost_falls_back_to_default() {
        let config = Config::parse("").unwrap();
        let vhost = config.vhost("nosuch.example.com");
        assert!(vhost.play.gop_cache);
    }

    #[test]
    fn test_invalid_values_fail_load() {
        assert!(matches!(
            Config::parse("[vhosts.a.play]\ntime_jitter = \"bogus\"")
                .unwrap_err()
                .root_cause(),
            Error::ErrConfigInvalid(_)
        ));
        assert!(Config::parse("[vhosts.a.srt]\npbkeylen = 17").is_err());
        assert!(Config::parse("[vhosts.a]\nnot_a_key = 1").is_err());
    }
}
