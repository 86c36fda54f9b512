//! HTTP Generate Backend
//!
//! Adapter for servers speaking the Ollama-style generate API:
//!
//! - `POST {endpoint}/api/generate` with `{"model", "prompt", "stream": false}`
//! - reply `{"response": "...", "prompt_eval_count": n, "eval_count": n}`
//!
//! Transport failures and non-2xx replies become [`BackendError`]s carrying
//! the status and body so the classifier can see them.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::traits::{Backend, BackendError, InvokeOptions, InvokeRequest, InvokeResponse, Usage};

/// Backend that calls a generate endpoint over HTTP
#[derive(Clone, Debug)]
pub struct GenerateBackend {
    /// Backend identifier
    id: String,
    /// Base URL, e.g. `http://localhost:11434`
    endpoint: String,
    /// Price per 1000 tokens, used to report a cost with each reply
    cost_per_unit: f64,
    /// HTTP client
    http_client: reqwest::Client,
}

impl GenerateBackend {
    /// Create a backend for `endpoint`
    ///
    /// The client-level timeout is a ceiling; the router applies the
    /// per-backend deadline around each call.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            id: id.into(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            cost_per_unit: 0.0,
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()?,
        })
    }

    /// Set the price used to derive reply cost
    #[must_use]
    pub fn with_cost_per_unit(mut self, cost_per_unit: f64) -> Self {
        self.cost_per_unit = cost_per_unit;
        self
    }

    /// Get generate endpoint URL
    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.endpoint)
    }

    /// Build the full prompt including the system prompt
    fn build_prompt(request: &InvokeRequest, options: &InvokeOptions) -> String {
        match options.system {
            Some(ref system) => format!("{system}\n\n{}", request.prompt),
            None => request.prompt.clone(),
        }
    }

    /// Build the JSON body
    fn build_body(request: &InvokeRequest, options: &InvokeOptions) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "prompt": Self::build_prompt(request, options),
            "stream": false,
        });

        let mut provider_options = serde_json::Map::new();
        if let Some(temperature) = options.temperature {
            provider_options.insert("temperature".to_string(), serde_json::json!(temperature));
        }
        if let Some(max_tokens) = options.max_tokens {
            provider_options.insert("num_predict".to_string(), serde_json::json!(max_tokens));
        }
        for (key, value) in &options.parameters {
            provider_options.insert(key.clone(), value.clone());
        }
        if !provider_options.is_empty() {
            body["options"] = serde_json::Value::Object(provider_options);
        }
        body
    }
}

fn transport_error(e: &reqwest::Error) -> BackendError {
    if e.is_timeout() {
        let mut err = BackendError::new(format!("timeout: {e}"));
        err.timed_out = true;
        return err;
    }
    match e.status() {
        Some(status) => BackendError::with_status(status.as_u16(), e.to_string()),
        None => BackendError::new(e.to_string()),
    }
}

#[async_trait]
impl Backend for GenerateBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(
        &self,
        request: &InvokeRequest,
        options: &InvokeOptions,
    ) -> Result<InvokeResponse, BackendError> {
        let start = Instant::now();

        let response = self
            .http_client
            .post(self.generate_url())
            .json(&Self::build_body(request, options))
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            let mut err = BackendError::with_status(status.as_u16(), body);
            err.retry_after = retry_after;
            return Err(err);
        }

        let data: serde_json::Value = response.json().await.map_err(|e| transport_error(&e))?;

        let content = data
            .get("response")
            .and_then(|r| r.as_str())
            .unwrap_or("")
            .to_string();

        let count = |field: &str| {
            data.get(field)
                .and_then(serde_json::Value::as_u64)
                .map(|c| u32::try_from(c).unwrap_or(u32::MAX))
        };
        let usage = match (count("prompt_eval_count"), count("eval_count")) {
            (None, None) => None,
            (p, c) => Some(Usage {
                prompt_tokens: p.unwrap_or(0),
                completion_tokens: c.unwrap_or(0),
            }),
        };

        let cost = usage.map(|u| f64::from(u.total()) / 1000.0 * self.cost_per_unit);

        Ok(InvokeResponse {
            content,
            usage,
            cost,
            latency: Some(start.elapsed()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_creation() {
        let backend = GenerateBackend::new("local", "http://localhost:11434/").unwrap();
        assert_eq!(backend.id(), "local");
        assert_eq!(backend.generate_url(), "http://localhost:11434/api/generate");
    }

    #[test]
    fn test_build_prompt() {
        let request = InvokeRequest::new("Hello", "test");
        assert_eq!(
            GenerateBackend::build_prompt(&request, &InvokeOptions::default()),
            "Hello"
        );

        let options = InvokeOptions {
            system: Some("Be helpful".to_string()),
            ..Default::default()
        };
        assert_eq!(
            GenerateBackend::build_prompt(&request, &options),
            "Be helpful\n\nHello"
        );
    }

    #[test]
    fn test_build_body_options() {
        let request = InvokeRequest::new("Hi", "m");
        let body = GenerateBackend::build_body(&request, &InvokeOptions::default());
        assert!(body.get("options").is_none());
        assert_eq!(body["stream"], serde_json::json!(false));

        let mut options = InvokeOptions {
            max_tokens: Some(64),
            ..Default::default()
        };
        options
            .parameters
            .insert("top_p".to_string(), serde_json::json!(0.9));
        let body = GenerateBackend::build_body(&request, &options);
        assert_eq!(body["options"]["num_predict"], serde_json::json!(64));
        assert_eq!(body["options"]["top_p"], serde_json::json!(0.9));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_error() {
        let backend = GenerateBackend::new("dead", "http://127.0.0.1:9").unwrap();
        let result = backend
            .invoke(&InvokeRequest::new("Hi", "m"), &InvokeOptions::default())
            .await;
        assert!(result.is_err());
    }
}
