//! URL normalization boundary. The aggregation core only needs
//! `normalize(raw) -> (normalized_url, domain, channel_id)`; `BasicNormalizer`
//! is the built-in implementation.

use regex::Regex;
use std::sync::OnceLock;
use url::Url;

/// Result of normalizing one shared link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizedLink {
    pub normalized_url: String,
    pub domain: String,
    pub channel_id: Option<String>,
}

/// Pure link normalizer. An `Err` rejects the link; the caller skips it.
pub trait UrlNormalizer: Send + Sync {
    fn normalize(&self, raw: &str) -> Result<NormalizedLink, String>;
}

const YOUTUBE_HOSTS: &[&str] = &[
    "youtube.com",
    "youtu.be",
    "music.youtube.com",
    "gaming.youtube.com",
    "youtube-nocookie.com",
];

fn tracking_param_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(utm_[a-z]+|fbclid|gclid|igshid|s|ref_src)$").expect("static regex"))
}

fn channel_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^/channel/([A-Za-z0-9_-]{10,})").expect("static regex"))
}

/// Lowercases host, strips `www.`/`m.`, tracking params, fragments and trailing
/// slashes; collapses every YouTube host to `youtube.com`.
#[derive(Clone, Debug, Default)]
pub struct BasicNormalizer;

impl BasicNormalizer {
    fn strip_host(host: &str) -> &str {
        let host = host.strip_prefix("www.").unwrap_or(host);
        host.strip_prefix("m.").unwrap_or(host)
    }
}

impl UrlNormalizer for BasicNormalizer {
    fn normalize(&self, raw: &str) -> Result<NormalizedLink, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("empty link".into());
        }
        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("http://{trimmed}")
        };
        let url = Url::parse(&with_scheme).map_err(|e| e.to_string())?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!("unsupported scheme {}", url.scheme()));
        }
        let host = url.host_str().ok_or_else(|| "missing host".to_string())?.to_ascii_lowercase();
        let mut host = Self::strip_host(&host).to_string();
        if !host.contains('.') {
            return Err(format!("not a public host: {host}"));
        }
        let is_youtube = YOUTUBE_HOSTS.contains(&host.as_str());
        if is_youtube {
            host = "youtube.com".to_string();
        }

        let query: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| !tracking_param_re().is_match(k))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let path = url.path().trim_end_matches('/');
        let mut normalized = format!("{host}{path}");
        if !query.is_empty() {
            let q = query
                .iter()
                .map(|(k, v)| if v.is_empty() { k.clone() } else { format!("{k}={v}") })
                .collect::<Vec<_>>()
                .join("&");
            normalized.push('?');
            normalized.push_str(&q);
        }

        let channel_id = if is_youtube {
            channel_re().captures(url.path()).map(|c| c[1].to_string())
        } else {
            None
        };

        Ok(NormalizedLink { normalized_url: normalized, domain: host, channel_id })
    }
}
