//! Thin HTTP client for the daemon's loopback API.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use spire_core::config::SettingsManager;
use spire_types::api::ErrorBody;

pub struct ApiClient {
    base: String,
    http: reqwest::Client,
    key: Option<String>,
}

impl ApiClient {
    pub fn new() -> Result<Self> {
        let settings = SettingsManager::load().context("failed to load settings")?;
        Ok(Self {
            base: format!("http://127.0.0.1:{}", settings.port),
            http: reqwest::Client::new(),
            key: std::env::var("WEB_KEY").ok().filter(|k| !k.is_empty()),
        })
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("{}{}", self.base.replace("http://", "ws://"), path)
    }

    pub fn bearer(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let mut req = self.http.get(format!("{}{}", self.base, path));
        if let Some(key) = &self.key {
            req = req.bearer_auth(key);
        }
        let response = req.send().await.context("daemon not reachable (is spired running?)")?;
        Self::parse(response).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let mut req = self.http.post(format!("{}{}", self.base, path)).json(body);
        if let Some(key) = &self.key {
            req = req.bearer_auth(key);
        }
        let response = req.send().await.context("daemon not reachable (is spired running?)")?;
        Self::parse(response).await
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response.json().await.context("bad response body");
        }
        let body = response.text().await.unwrap_or_default();
        if let Ok(err) = serde_json::from_str::<ErrorBody>(&body) {
            if err.error.candidates.is_empty() {
                bail!("{} ({})", err.error.message, status);
            }
            bail!(
                "{} ({}); candidates: {}",
                err.error.message,
                status,
                err.error.candidates.join(", ")
            );
        }
        bail!("daemon returned {}: {}", status, body);
    }
}
