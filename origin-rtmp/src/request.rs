//! The client request: who connects, to which vhost/app/stream.

use crate::{DEFAULT_PORT, DEFAULT_VHOST};

/// Parsed from the connect tcUrl plus the stream name of publish/play.
#[derive(Debug, Clone, PartialEq)]
pub struct RtmpRequest {
    pub tc_url: String,
    pub vhost: String,
    pub host: String,
    pub port: u16,
    pub app: String,
    pub stream: String,
    /// Raw query of the tcUrl or stream, e.g. `?vhost=x&token=y`.
    pub param: String,
    pub page_url: String,
}

impl RtmpRequest {
    /// Parses `rtmp://host[:port]/app[?params]`; the vhost defaults to the
    /// host and may be overridden by a `vhost=` query parameter.
    pub fn parse_tc_url(tc_url: &str) -> RtmpRequest {
        let mut host = String::new();
        let mut port = DEFAULT_PORT;
        let mut app = String::new();
        let mut param = String::new();

        let rest = tc_url
            .strip_prefix("rtmp://")
            .or_else(|| tc_url.strip_prefix("rtmps://"))
            .unwrap_or(tc_url);
        let (authority, path) = match rest.split_once('/') {
            Some((a, p)) => (a, p),
            None => (rest, ""),
        };
        if let Some((h, p)) = authority.split_once(':') {
            host = h.to_string();
            port = p.parse().unwrap_or(DEFAULT_PORT);
        } else {
            host = authority.to_string();
        }

        let path = path.trim_end_matches('/');
        if let Some((a, q)) = path.split_once('?') {
            app = a.to_string();
            param = q.to_string();
        } else {
            app = path.to_string();
        }

        let mut vhost = if host.is_empty() {
            DEFAULT_VHOST.to_string()
        } else {
            host.clone()
        };
        for kv in param.split('&') {
            if let Some((k, v)) = kv.split_once('=') {
                if k == "vhost" && !v.is_empty() {
                    vhost = v.to_string();
                }
            }
        }

        RtmpRequest {
            tc_url: tc_url.to_string(),
            vhost,
            host,
            port,
            app,
            stream: String::new(),
            param,
            page_url: String::new(),
        }
    }

    /// Applies the publish/play stream name, splitting off its query.
    pub fn set_stream(&mut self, stream: &str) {
        if let Some((s, q)) = stream.split_once('?') {
            self.stream = s.to_string();
            if self.param.is_empty() {
                self.param = q.to_string();
            } else {
                self.param = format!("{}&{}", self.param, q);
            }
            for kv in q.split('&') {
                if let Some((k, v)) = kv.split_once('=') {
                    if k == "vhost" && !v.is_empty() {
                        self.vhost = v.to_string();
                    }
                }
            }
        } else {
            self.stream = stream.to_string();
        }
    }
}
