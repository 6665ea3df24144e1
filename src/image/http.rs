use async_trait::async_trait;
use anyhow::{Result, anyhow};
use reqwest::Client;
use crate::image::ImageStore;

/// Read-only source that fetches images over HTTP(S). The locator is the URL.
#[derive(Debug, Clone)]
pub struct HttpImageSource {
    client: Client,
}

impl HttpImageSource {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Default for HttpImageSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageStore for HttpImageSource {
    async fn read(&self, locator: &str) -> Result<Vec<u8>> {
        let response = self.client.get(locator).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("GET {} returned {}", locator, status));
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn write(&self, locator: &str, _bytes: &[u8]) -> Result<()> {
        Err(anyhow!("HTTP source is read-only: {}", locator))
    }

    async fn list(&self, _prefix: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn remove(&self, locator: &str) -> Result<()> {
        Err(anyhow!("HTTP source is read-only: {}", locator))
    }
}
