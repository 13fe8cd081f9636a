use crate::collectors::PublicIpSource;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// IP echo service answering `{"ip": "..."}`.
pub struct IpEcho {
    http: Client,
    url: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct EchoResponse {
    ip: Option<String>,
}

impl IpEcho {
    pub fn new(http: Client, url: String, timeout: Duration) -> Self {
        Self { http, url, timeout }
    }

    async fn fetch(&self) -> Result<Option<String>, reqwest::Error> {
        let body: EchoResponse = self
            .http
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body.ip.map(|ip| ip.trim().to_string()).filter(|ip| !ip.is_empty()))
    }
}

#[async_trait]
impl PublicIpSource for IpEcho {
    async fn public_ip(&self) -> Option<String> {
        match self.fetch().await {
            Ok(ip) => ip,
            Err(err) => {
                debug!(url = %self.url, error = %err, "public ip lookup failed");
                None
            }
        }
    }
}
