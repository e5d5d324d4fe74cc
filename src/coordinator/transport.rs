use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::{CoinJoinError, Result};

/// HTTP access to one coordinator, optionally through a Tor SOCKS5 port.
#[derive(Clone)]
pub struct CoordinatorTransport {
    base_url: String,
    prefix: &'static str,
    timeout: Duration,
    socks5: Option<SocketAddr>,
    client: reqwest::Client,
}

impl CoordinatorTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let timeout = config.request_timeout();
        Ok(Self {
            base_url: config.coordinator_url.trim_end_matches('/').to_string(),
            prefix: config.api_prefix(),
            timeout,
            socks5: config.tor_socks5,
            client: build_client(timeout, config.tor_socks5)?,
        })
    }

    /// Same coordinator, fresh client. Through Tor the random SOCKS
    /// credentials put every request made with it on a new circuit.
    pub fn isolated(&self) -> Result<Self> {
        Ok(Self {
            client: build_client(self.timeout, self.socks5)?,
            ..self.clone()
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}/{}", self.base_url, self.prefix, path.trim_start_matches('/'))
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.client.get(self.url(path)).send().await?;
        if !resp.status().is_success() {
            return Err(rejection(resp).await);
        }
        Ok(resp.json().await?)
    }

    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let resp = self.post(path, Some(body)).await?;
        if !resp.status().is_success() {
            return Err(rejection(resp).await);
        }
        Ok(resp.json().await?)
    }

    /// POST and hand back the raw response; the caller decides which
    /// statuses are acceptable.
    pub async fn post<B: Serialize + ?Sized>(&self, path: &str, body: Option<&B>) -> Result<Response> {
        let mut req = self.client.post(self.url(path));
        if let Some(body) = body {
            req = req.json(body);
        }
        Ok(req.send().await?)
    }
}

fn build_client(timeout: Duration, socks5: Option<SocketAddr>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(addr) = socks5 {
        let user: [u8; 8] = rand::random();
        let pass: [u8; 8] = rand::random();
        let proxy = reqwest::Proxy::all(format!(
            "socks5h://{}:{}@{}",
            hex::encode(user),
            hex::encode(pass),
            addr
        ))?;
        builder = builder.proxy(proxy);
    }
    Ok(builder.build()?)
}

/// Turn a non-success response into a rejection carrying the body text.
pub async fn rejection(resp: Response) -> CoinJoinError {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    // Coordinator error bodies are usually a bare JSON string.
    let message = serde_json::from_str::<String>(&text).unwrap_or(text);
    CoinJoinError::CoordinatorRejected {
        status: status.as_u16(),
        message: if message.is_empty() {
            status.canonical_reason().unwrap_or("").to_string()
        } else {
            message
        },
    }
}

pub fn is_conflict(resp: &Response) -> bool {
    resp.status() == StatusCode::CONFLICT
}
