//! Fire-and-forget job submission to the downstream recognition service.

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RecognitionConfig;
use crate::error::{HarvestError, Result};

pub trait Recognizer: Send + Sync {
    /// Queues recognition for an uploaded interest; never waits for it.
    fn submit(&self, interest_name: &str);
}

#[derive(Debug, Serialize)]
struct RecognizeRequest<'a> {
    interest_name: &'a str,
}

#[derive(Clone)]
pub struct RecognitionClient {
    http: reqwest::Client,
    endpoint: String,
    login: Option<(String, String)>,
}

impl RecognitionClient {
    pub fn new(config: &RecognitionConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_sec))
            .build()
            .map_err(|e| HarvestError::ConfigError(format!("Failed to create recognition client: {}", e)))?;
        let login = config
            .credentials
            .is_set()
            .then(|| (config.credentials.login.clone(), config.credentials.password.clone()));
        Ok(Self {
            http,
            endpoint: format!("{}/recognize_webdav", config.url.trim_end_matches('/')),
            login,
        })
    }

    async fn send(&self, interest_name: &str) -> Result<()> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .json(&RecognizeRequest { interest_name });
        if let Some((user, password)) = &self.login {
            request = request.basic_auth(user, Some(password));
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(HarvestError::Http(format!("recognition HTTP {}", response.status())));
        }
        Ok(())
    }
}

impl Recognizer for RecognitionClient {
    fn submit(&self, interest_name: &str) {
        let client = self.clone();
        let name = interest_name.to_string();
        tokio::spawn(async move {
            match client.send(&name).await {
                Ok(()) => debug!(interest = %name, "Recognition queued"),
                Err(e) => warn!(interest = %name, "Recognition submit failed: {}", e),
            }
        });
    }
}
