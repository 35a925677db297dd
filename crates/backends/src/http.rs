//! HTTP-remote completion backend.
//!
//! Speaks the abstract completion contract only: `POST endpoint_url` with
//! `{model, prompt, context}`, expecting `{"completion": "..."}` back.
//! Provider-specific wire formats live behind operator-supplied shims.

use std::collections::HashMap;
use std::time::Duration;

use nacc_domain::config::{resolve_secret, BackendConfig, BackendKind};
use serde::Deserialize;

use crate::traits::{BackendContext, BackendError, CompletionBackend};

pub struct HttpBackend {
    client: reqwest::Client,
    endpoint: String,
    model: Option<String>,
    bearer: Option<String>,
    extra_headers: HashMap<String, String>,
    timeout: Duration,
}

#[derive(Deserialize)]
struct CompletionBody {
    completion: String,
}

impl HttpBackend {
    pub fn from_config(config: &BackendConfig) -> nacc_domain::Result<Self> {
        let endpoint = config
            .endpoint_url
            .clone()
            .ok_or_else(|| nacc_domain::Error::Config("http backend requires endpoint_url".into()))?;
        let bearer = config
            .bearer_token
            .as_deref()
            .map(resolve_secret)
            .transpose()?;
        let timeout = Duration::from_secs(config.timeout_seconds);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10).min(timeout))
            .build()
            .map_err(|e| nacc_domain::Error::Http(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            model: config.model_name.clone(),
            bearer,
            extra_headers: config.environment.clone(),
            timeout,
        })
    }
}

#[async_trait::async_trait]
impl CompletionBackend for HttpBackend {
    async fn complete(
        &self,
        prompt: &str,
        context: &BackendContext,
    ) -> Result<String, BackendError> {
        let mut request = self.client.post(&self.endpoint).json(&serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "context": context,
        }));
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }
        for (name, value) in &self.extra_headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout(format!("no response within {:?}", self.timeout))
            } else {
                BackendError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(BackendError::RateLimited(format!(
                "{} returned 429",
                self.endpoint
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Unavailable(format!(
                "{} returned {status}: {}",
                self.endpoint,
                body.chars().take(200).collect::<String>()
            )));
        }

        let body: CompletionBody = response
            .json()
            .await
            .map_err(|e| BackendError::Malformed(format!("bad completion body: {e}")))?;
        Ok(body.completion)
    }

    async fn probe(&self) -> Result<(), BackendError> {
        self.complete("ping", &BackendContext::new()).await.map(|_| ())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Http
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
