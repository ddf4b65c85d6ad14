//! Outbound HTTP hooks: JSON POST callbacks with the `"0"`-or-`code==0`
//! reply contract. Gate hooks refuse the session on rejection; notify hooks
//! are fire-and-forget through the async worker.

use serde_json::{json, Value};
use shared::context::ContextId;
use shared::error::{Error, Result, WrapExt};
use std::time::Duration;

/// Default per-URL timeout.
pub const HOOK_TIMEOUT: Duration = Duration::from_secs(30);
/// on_hls_notify reads at most this many chunks of the reply body.
pub const NOTIFY_MAX_READS: usize = 32;
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity fields common to every hook body.
#[derive(Debug, Clone)]
pub struct HookClient {
    pub cid: ContextId,
    pub ip: String,
    pub vhost: String,
    pub app: String,
    pub stream: String,
}

impl HookClient {
    fn base(&self, action: &str) -> Value {
        json!({
            "action": action,
            "client_id": self.cid.as_str(),
            "ip": self.ip,
            "vhost": self.vhost,
            "app": self.app,
            "stream": self.stream,
        })
    }
}

/// A reply is valid when the body is exactly "0" or a JSON object with an
/// integer `code` of 0.
pub fn reply_accepted(body: &str) -> bool {
    let trimmed = body.trim();
    if trimmed == "0" {
        return true;
    }
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return false;
    };
    value.get("code").and_then(Value::as_i64) == Some(0)
}

pub struct HooksClient {
    http: reqwest::Client,
}

impl Default for HooksClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HooksClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(HOOK_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    async fn post(&self, url: &str, body: &Value) -> Result<String> {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Io(e.to_string()))
            .with_wrap(|| format!("hook {}", url))?;
        response
            .text()
            .await
            .map_err(|e| Error::Io(e.to_string()))
            .wrap("hook body")
    }

    /// Authoritative gate: every URL must accept, or the session is refused.
    pub async fn call_gate(&self, name: &str, urls: &[String], body: Value) -> Result<()> {
        for url in urls {
            let reply = self.post(url, &body).await?;
            if !reply_accepted(&reply) {
                return Err(Error::ErrHookRejected(name.to_string())
                    .wrap(format!("{} rejected by {}", name, url)));
            }
        }
        Ok(())
    }

    /// Fire-and-forget: failures are logged by the caller (async worker),
    /// never fatal.
    pub async fn call_notify(&self, name: &str, urls: &[String], body: Value) -> Result<()> {
        for url in urls {
            if let Err(e) = self.post(url, &body).await {
                e.wrap(format!("notify {}", name)).reset("hook is advisory");
            }
        }
        Ok(())
    }

    /// on_hls_notify: GET with `[app]`/`[stream]`/`[ts_url]`/`[param]`
    /// substitution, draining a bounded slice of the body.
    pub async fn call_hls_notify(
        &self,
        urls: &[String],
        client: &HookClient,
        ts_url: &str,
        param: &str,
    ) -> Result<()> {
        for url in urls {
            let resolved = url
                .replace("[app]", &client.app)
                .replace("[stream]", &client.stream)
                .replace("[ts_url]", ts_url)
                .replace("[param]", param);
            let request = self.http.get(&resolved).timeout(NOTIFY_TIMEOUT);
            match request.send().await {
                Ok(mut response) => {
                    let mut reads = 0;
                    while let Ok(Some(_chunk)) = response.chunk().await {
                        reads += 1;
                        if reads >= NOTIFY_MAX_READS {
                            break;
                        }
                    }
                }
                Err(e) => {
                    Error::Io(e.to_string())
                        .wrap(format!("hls notify {}", resolved))
                        .reset("notify is advisory");
                }
            }
        }
        Ok(())
    }
}

/// Body builders, one per hook.
pub mod body {
    use super::*;

    pub fn on_connect(client: &HookClient, tc_url: &str, page_url: &str) -> Value {
        let mut v = client.base("on_connect");
        v["tcUrl"] = json!(tc_url);
        v["pageUrl"] = json!(page_url);
        v
    }

    pub fn on_close(client: &HookClient, send_bytes: u64, recv_bytes: u64) -> Value {
        let mut v = client.base("on_close");
        v["send_bytes"] = json!(send_bytes);
        v["recv_bytes"] = json!(recv_bytes);
        v
    }

    pub fn on_publish(client: &HookClient, param: &str) -> Value {
        let mut v = client.base("on_publish");
        v["param"] = json!(param);
        v
    }

    pub fn on_unpublish(client: &HookClient) -> Value {
        client.base("on_unpublish")
    }

    pub fn on_play(client: &HookClient, param: &str, page_url: &str) -> Value {
        let mut v = client.base("on_play");
        v["param"] = json!(param);
        v["pageUrl"] = json!(page_url);
        v
    }

    pub fn on_stop(client: &HookClient) -> Value {
        client.base("on_stop")
    }

    pub fn on_hls(
        client: &HookClient,
        duration_secs: f64,
        file: &str,
        m3u8: &str,
        seq_no: u64,
    ) -> Value {
        let mut v = client.base("on_hls");
        v["duration"] = json!(duration_secs);
        v["cwd"] = json!(std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default());
        v["file"] = json!(file);
        v["url"] = json!(file);
        v["m3u8"] = json!(m3u8);
        v["m3u8_url"] = json!(m3u8);
        v["seq_no"] = json!(seq_no);
        v
    }

    pub fn on_forward(client: &HookClient, tc_url: &str) -> Value {
        let mut v = client.base("on_forward");
        v["tcUrl"] = json!(tc_url);
        v
    }

    pub fn on_dvr(client: &HookClient, file: &str) -> Value {
        let mut v = client.base("on_dvr");
        v["file"] = json!(file);
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::context::generate_cid;

    fn client() -> HookClient {
        HookClient {
            cid: generate_cid(),
            ip: "203.0.113.9".to_string(),
            vhost: "__defaultVhost__".to_string(),
            app: "live".to_string(),
            stream: "livestream".to_string(),
        }
    }

    #[test]
    fn test_reply_validation() {
        assert!(reply_accepted("0"));
        assert!(reply_accepted(" 0 "));
        assert!(reply_accepted(r#"{"code": 0}"#));
        assert!(reply_accepted(r#"{"code": 0, "data": {}}"#));
        assert!(!reply_accepted("1"));
        assert!(!reply_accepted(r#"{"code": 100}"#));
        assert!(!reply_accepted(r#"{"code": "0"}"#));
        assert!(!reply_accepted("ok"));
        assert!(!reply_accepted(""));
    }

    #[test]
    fn test_body_shapes() {
        let c = client();
        let v = body::on_connect(&c, "rtmp://h/live", "http://page");
        assert_eq!(v["action"], "on_connect");
        assert_eq!(v["vhost"], "__defaultVhost__");
        assert_eq!(v["tcUrl"], "rtmp://h/live");
        assert_eq!(v["client_id"], c.cid.as_str());

        let v = body::on_hls(&c, 10.5, "/path/seg-1.ts", "/path/x.m3u8", 7);
        assert_eq!(v["action"], "on_hls");
        assert_eq!(v["duration"], 10.5);
        assert_eq!(v["seq_no"], 7);

        let v = body::on_close(&c, 100, 200);
        assert_eq!(v["send_bytes"], 100);
        assert_eq!(v["recv_bytes"], 200);
    }
}
