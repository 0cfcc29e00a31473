//! WBI request signing.
//!
//! The signer fetches `img_key`/`sub_key` from the `nav` endpoint, derives the
//! 32-char mixin key and appends `wts` + `w_rid` to a query.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::{DanmakuError, Result};
use crate::http::DEFAULT_UA;

pub const DEFAULT_NAV_URL: &str = "https://api.bilibili.com/x/web-interface/nav";

const CACHE_TTL: Duration = Duration::from_secs(6 * 60 * 60);

const MIXIN_KEY_ENC_TAB: [usize; 64] = [
    46, 47, 18, 2, 53, 8, 23, 32, 15, 50, 10, 31, 58, 3, 45, 35, 27, 43, 5, 49, 33, 9, 42, 19, 29,
    28, 14, 39, 12, 38, 41, 13, 37, 48, 7, 16, 24, 55, 40, 61, 26, 17, 0, 1, 60, 51, 30, 4, 22, 25,
    54, 21, 56, 59, 6, 63, 57, 62, 11, 36, 20, 34, 44, 52,
];

#[derive(Deserialize)]
struct NavResponse {
    data: Option<NavData>,
}

#[derive(Deserialize)]
struct NavData {
    wbi_img: Option<WbiImg>,
}

#[derive(Deserialize)]
struct WbiImg {
    img_url: String,
    sub_url: String,
}

/// The two keys published by the `nav` endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WbiKeys {
    pub img_key: String,
    pub sub_key: String,
}

impl WbiKeys {
    pub fn new(img_key: impl Into<String>, sub_key: impl Into<String>) -> Self {
        Self {
            img_key: img_key.into(),
            sub_key: sub_key.into(),
        }
    }

    /// Permute `img_key + sub_key` through the encoding table.
    pub fn mixin_key(&self) -> String {
        let orig: Vec<char> = format!("{}{}", self.img_key, self.sub_key).chars().collect();
        MIXIN_KEY_ENC_TAB
            .iter()
            .filter_map(|&i| orig.get(i))
            .take(32)
            .collect()
    }
}

struct CachedKeys {
    keys: WbiKeys,
    fetched_at: Instant,
}

/// Signs queries with cached WBI keys.
///
/// Refreshes are serialized behind a single-permit semaphore so concurrent
/// callers trigger at most one `nav` request.
pub struct WbiSigner {
    client: Client,
    nav_url: String,
    cache: Mutex<Option<CachedKeys>>,
    refresh: Semaphore,
}

impl WbiSigner {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            nav_url: DEFAULT_NAV_URL.to_string(),
            cache: Mutex::new(None),
            refresh: Semaphore::new(1),
        }
    }

    pub fn with_nav_url(mut self, nav_url: impl Into<String>) -> Self {
        self.nav_url = nav_url.into();
        self
    }

    /// Seed the cache, e.g. with keys obtained elsewhere.
    pub fn with_keys(self, keys: WbiKeys) -> Self {
        *self.cache.lock() = Some(CachedKeys {
            keys,
            fetched_at: Instant::now(),
        });
        self
    }

    fn cached(&self) -> Option<WbiKeys> {
        self.cache
            .lock()
            .as_ref()
            .filter(|c| c.fetched_at.elapsed() < CACHE_TTL)
            .map(|c| c.keys.clone())
    }

    /// Return fresh keys, fetching them if the cache is empty or stale.
    pub async fn keys(&self, cookie: Option<&str>) -> Result<WbiKeys> {
        if let Some(keys) = self.cached() {
            return Ok(keys);
        }

        let _permit = self
            .refresh
            .acquire()
            .await
            .map_err(|_| DanmakuError::other("wbi refresh semaphore closed"))?;

        // Another caller may have refreshed while we waited.
        if let Some(keys) = self.cached() {
            return Ok(keys);
        }

        let keys = self.fetch_keys(cookie).await?;
        *self.cache.lock() = Some(CachedKeys {
            keys: keys.clone(),
            fetched_at: Instant::now(),
        });
        Ok(keys)
    }

    async fn fetch_keys(&self, cookie: Option<&str>) -> Result<WbiKeys> {
        debug!(url = %self.nav_url, "Fetching WBI keys");

        let mut request = self
            .client
            .get(&self.nav_url)
            .header(reqwest::header::USER_AGENT, DEFAULT_UA)
            .header(reqwest::header::REFERER, "https://www.bilibili.com");
        if let Some(cookie) = cookie.filter(|c| !c.is_empty()) {
            request = request.header(reqwest::header::COOKIE, cookie);
        }

        let nav: NavResponse = request.send().await?.json().await?;
        let img = nav
            .data
            .and_then(|d| d.wbi_img)
            .ok_or_else(|| DanmakuError::protocol("nav response has no wbi_img"))?;

        let img_key = take_filename(&img.img_url)
            .ok_or_else(|| DanmakuError::protocol(format!("bad img_url {}", img.img_url)))?;
        let sub_key = take_filename(&img.sub_url)
            .ok_or_else(|| DanmakuError::protocol(format!("bad sub_url {}", img.sub_url)))?;

        Ok(WbiKeys::new(img_key, sub_key))
    }

    /// Sign `params` with the current keys and wall-clock `wts`.
    pub async fn sign(&self, params: Vec<(String, String)>, cookie: Option<&str>) -> Result<String> {
        let keys = self.keys(cookie).await?;
        let wts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| DanmakuError::other("system time before UNIX epoch"))?
            .as_secs();
        Ok(sign_query(params, &keys, wts))
    }
}

/// Produce the signed query string `k=v&...&w_rid=<md5>`.
pub fn sign_query(mut params: Vec<(String, String)>, keys: &WbiKeys, wts: u64) -> String {
    params.retain(|(k, _)| k != "w_rid" && k != "wts");
    params.push(("wts".to_string(), wts.to_string()));
    params.sort_by(|a, b| a.0.cmp(&b.0));

    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", encode_component(k), encode_component(v)))
        .collect::<Vec<_>>()
        .join("&");

    let mut hasher = Md5::new();
    hasher.update(query.as_bytes());
    hasher.update(keys.mixin_key().as_bytes());
    let w_rid = format!("{:x}", hasher.finalize());

    format!("{query}&w_rid={w_rid}")
}

fn encode_component(s: &str) -> String {
    let mut encoded = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '~' => encoded.push(c),
            '!' | '\'' | '(' | ')' | '*' => {}
            _ => {
                let mut buf = [0; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    encoded.push_str(&format!("%{b:02X}"));
                }
            }
        }
    }
    encoded
}

fn take_filename(url: &str) -> Option<String> {
    url.rsplit_once('/')
        .and_then(|(_, s)| s.rsplit_once('.'))
        .map(|(s, _)| s.to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_keys() -> WbiKeys {
        WbiKeys::new(
            "7cd084941338484aae1ad9425b84077c",
            "4932caff0ff746eab6f01bf08b70ac45",
        )
    }

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_take_filename() {
        assert_eq!(
            take_filename("https://i0.hdslb.com/bfs/wbi/7cd084941338484aae1ad9425b84077c.png"),
            Some("7cd084941338484aae1ad9425b84077c".to_string())
        );
        assert_eq!(take_filename("no-slash"), None);
    }

    #[test]
    fn test_mixin_key() {
        assert_eq!(doc_keys().mixin_key(), "ea1db124af3c7062474693fa704f4ff8");
    }

    #[test]
    fn test_sign_query_reference_vector() {
        let signed = sign_query(
            params(&[("foo", "114"), ("bar", "514"), ("zab", "1919810")]),
            &doc_keys(),
            1702204169,
        );
        assert_eq!(
            signed,
            "bar=514&foo=114&wts=1702204169&zab=1919810&w_rid=8f6f2b5b3d485fe1886cec6a0be8c5d4"
        );
    }

    #[test]
    fn test_sign_query_replaces_existing_signature() {
        let signed = sign_query(
            params(&[
                ("foo", "114"),
                ("w_rid", "stale"),
                ("bar", "514"),
                ("zab", "1919810"),
            ]),
            &doc_keys(),
            1702204169,
        );
        assert!(signed.ends_with("w_rid=8f6f2b5b3d485fe1886cec6a0be8c5d4"));
        assert_eq!(signed.matches("w_rid=").count(), 1);
    }

    #[test]
    fn test_sign_query_is_deterministic_and_key_sensitive() {
        let base = params(&[("id", "1"), ("type", "0"), ("web_location", "444.8")]);
        let a = sign_query(base.clone(), &doc_keys(), 1700000000);
        let b = sign_query(base.clone(), &doc_keys(), 1700000000);
        assert_eq!(a, b);

        for skip in 0..base.len() {
            let mut reduced = base.clone();
            reduced.remove(skip);
            let c = sign_query(reduced, &doc_keys(), 1700000000);
            let rid = |s: &str| s.rsplit_once("w_rid=").map(|(_, r)| r.to_string());
            assert_ne!(rid(&a), rid(&c));
        }
    }

    #[test]
    fn test_encode_component() {
        assert_eq!(encode_component("a b"), "a%20b");
        assert_eq!(encode_component("it's (ok)*!"), "its%20ok");
        assert_eq!(encode_component("中"), "%E4%B8%AD");
    }

    #[tokio::test]
    async fn test_seeded_keys_skip_fetch() {
        crate::http::install_rustls_provider();
        let signer = WbiSigner::new(Client::new()).with_keys(doc_keys());
        assert_eq!(signer.keys(None).await.unwrap(), doc_keys());
    }
}
