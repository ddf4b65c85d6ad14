//! SRT streamid parsing: `#!::r=<app>/<stream>,m={publish|request}[,h=<vhost>][,k=v...]`.

use shared::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrtMode {
    /// The peer publishes to us.
    Push,
    /// The peer requests (plays) from us.
    Pull,
}

/// The resolved ingest/egress target of one SRT connection.
#[derive(Debug, Clone, PartialEq)]
pub struct SrtRequest {
    pub vhost: String,
    pub app: String,
    pub stream: String,
    pub param: String,
}

/// Splits a streamid into (mode, vhost, subpath). The subpath is
/// `app/stream[?params]` with extra keys folded into the query; the
/// compatible form `h=<vhost>/<app>/<stream>` is honored.
pub fn parse_streamid(streamid: &str) -> Result<(SrtMode, String, String)> {
    let Some(body) = streamid.strip_prefix("#!::") else {
        // Non-prefixed ids default to app "live".
        if streamid.is_empty() {
            return Err(Error::ErrSrtStreamId(streamid.to_string()));
        }
        return Ok((SrtMode::Push, String::new(), format!("live/{}", streamid)));
    };

    let mut mode = SrtMode::Pull;
    let mut vhost = String::new();
    let mut subpath = String::new();
    let mut params: Vec<String> = Vec::new();

    for kv in body.split(',') {
        let Some((k, v)) = kv.split_once('=') else {
            return Err(Error::ErrSrtStreamId(streamid.to_string()));
        };
        match k {
            "r" => subpath = v.to_string(),
            "h" => {
                if let Some((host, path)) = v.split_once('/') {
                    // Compatible form: vhost folded into the path; a bare
                    // app/stream has no dot-separated host part.
                    if host.contains('.') {
                        vhost = host.to_string();
                        subpath = path.to_string();
                    } else {
                        subpath = v.to_string();
                    }
                } else {
                    vhost = v.to_string();
                }
            }
            "m" => {
                mode = match v {
                    "publish" => SrtMode::Push,
                    "request" => SrtMode::Pull,
                    _ => return Err(Error::ErrSrtStreamId(streamid.to_string())),
                };
            }
            _ => params.push(format!("{}={}", k, v)),
        }
    }

    if subpath.is_empty() {
        return Err(Error::ErrSrtStreamId(streamid.to_string()));
    }

    let mut query: Vec<String> = Vec::new();
    if !vhost.is_empty() {
        query.push(format!("vhost={}", vhost));
    }
    query.extend(params);
    if !query.is_empty() {
        let sep = if subpath.contains('?') { '&' } else { '?' };
        subpath = format!("{}{}{}", subpath, sep, query.join("&"));
    }
    Ok((mode, vhost, subpath))
}

/// Resolves a streamid all the way to a request, defaulting the vhost.
pub fn streamid_to_request(streamid: &str, default_vhost: &str) -> Result<(SrtMode, SrtRequest)> {
    let (mode, vhost, subpath) = parse_streamid(streamid)?;
    let (path, param) = match subpath.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (subpath, String::new()),
    };
    let (app, stream) = path
        .rsplit_once('/')
        .ok_or_else(|| Error::ErrSrtStreamId(streamid.to_string()))?;
    Ok((
        mode,
        SrtRequest {
            vhost: if vhost.is_empty() {
                default_vhost.to_string()
            } else {
                vhost
            },
            app: app.to_string(),
            stream: stream.to_string(),
            param,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_with_params() {
        let (mode, vhost, subpath) =
            parse_streamid("#!::r=live/livestream,key1=value1,key2=value2").unwrap();
        assert_eq!(mode, SrtMode::Pull);
        assert_eq!(vhost, "");
        assert_eq!(subpath, "live/livestream?key1=value1&key2=value2");
    }

    #[test]
    fn test_vhost_key() {
        let (mode, vhost, subpath) =
            parse_streamid("#!::h=host.com,r=live/livestream,key1=value1,key2=value2").unwrap();
        assert_eq!(mode, SrtMode::Pull);
        assert_eq!(vhost, "host.com");
        assert_eq!(subpath, "live/livestream?vhost=host.com&key1=value1&key2=value2");
    }

    #[test]
    fn test_modes() {
        let (mode, _, subpath) = parse_streamid("#!::r=live/livestream,m=request").unwrap();
        assert_eq!(mode, SrtMode::Pull);
        assert_eq!(subpath, "live/livestream");
        let (mode, _, _) = parse_streamid("#!::r=live/livestream,m=publish").unwrap();
        assert_eq!(mode, SrtMode::Push);
    }

    #[test]
    fn test_compatible_h_forms() {
        // h carrying app/stream only.
        let (mode, vhost, subpath) = parse_streamid("#!::h=live/livestream,m=publish").unwrap();
        assert_eq!(mode, SrtMode::Push);
        assert_eq!(vhost, "");
        assert_eq!(subpath, "live/livestream");

        // h carrying vhost/app/stream.
        let (_, vhost, subpath) =
            parse_streamid("#!::h=srs.srt.com.cn/live/livestream,m=request").unwrap();
        assert_eq!(vhost, "srs.srt.com.cn");
        assert_eq!(subpath, "live/livestream?vhost=srs.srt.com.cn");

        // Query inside the path survives.
        let (_, vhost, subpath) =
            parse_streamid("#!::h=live/livestream?secret=d6d2be37,m=publish").unwrap();
        assert_eq!(vhost, "");
        assert_eq!(subpath, "live/livestream?secret=d6d2be37");
    }

    #[test]
    fn test_to_request() {
        let (mode, req) =
            streamid_to_request("#!::h=srs.srt.com.cn,r=live/livestream?key1=val1,key2=val2", "1.2.3.4")
                .unwrap();
        assert_eq!(mode, SrtMode::Pull);
        assert_eq!(req.vhost, "srs.srt.com.cn");
        assert_eq!(req.app, "live");
        assert_eq!(req.stream, "livestream");
        assert_eq!(req.param, "vhost=srs.srt.com.cn&key1=val1&key2=val2");

        let (_, req) = streamid_to_request("#!::r=live/livestream?key1=val1,key2=val2", "1.2.3.4").unwrap();
        assert_eq!(req.vhost, "1.2.3.4");
        assert_eq!(req.param, "key1=val1&key2=val2");
    }

    #[test]
    fn test_plain_id_defaults_to_live() {
        let (mode, req) = streamid_to_request("mystream", "v").unwrap();
        assert_eq!(mode, SrtMode::Push);
        assert_eq!(req.app, "live");
        assert_eq!(req.stream, "mystream");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(parse_streamid("#!::").is_err());
        assert!(parse_streamid("#!::m=publish").is_err());
        assert!(parse_streamid("#!::r=live/ls,m=bogus").is_err());
    }
}
