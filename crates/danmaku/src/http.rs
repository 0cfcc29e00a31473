//! Shared HTTP helpers.

use std::sync::OnceLock;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;

pub const DEFAULT_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Install the process-wide rustls crypto provider (aws-lc-rs) once.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build an HTTP client with `timeout`, installing the crypto provider first.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    install_rustls_provider();
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// A response body read up to a byte limit.
#[derive(Debug, Clone, Default)]
pub struct LimitedBody {
    pub bytes: Vec<u8>,
    /// True when the server sent more than the limit.
    pub truncated: bool,
}

impl LimitedBody {
    /// Lossy UTF-8 view of the body.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Read at most `limit` bytes of the response body.
///
/// The response is dropped afterwards, which releases the connection even when
/// the body was not fully consumed.
pub async fn read_limited(mut response: reqwest::Response, limit: usize) -> Result<LimitedBody> {
    let mut body = LimitedBody::default();

    while let Some(chunk) = response.chunk().await? {
        let room = limit - body.bytes.len();
        if chunk.len() > room {
            body.bytes.extend_from_slice(&chunk[..room]);
            body.truncated = true;
            break;
        }
        body.bytes.extend_from_slice(&chunk);
    }

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_client_without_prior_install() {
        assert!(build_client(Duration::from_secs(5)).is_ok());
    }
}
