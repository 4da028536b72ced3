//! Vision-LLM augmentation: a local Ollama endpoint re-transcribes the
//! preprocessed page as a cross-check on OCR. Clients live in a bounded pool
//! with timed acquisition so a stalled model cannot wedge the extractor.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::VisionConfig;

use super::super::ExtractError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    error: Option<String>,
}

/// One connection to the vision endpoint.
#[derive(Debug)]
pub struct VisionClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl VisionClient {
    fn new(cfg: &VisionConfig) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send a prompt plus the base64 JPEG of the preprocessed image.
    pub async fn analyze(
        &self,
        cancel: &CancellationToken,
        jpeg: &[u8],
        prompt: &str,
    ) -> Result<String, ExtractError> {
        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "images": [BASE64_STANDARD.encode(jpeg)],
            "stream": false,
            "options": {
                "num_predict": self.max_tokens,
                "temperature": self.temperature,
            },
        });

        let response = tokio::select! {
            sent = self.http.post(format!("{}/api/generate", self.endpoint)).json(&body).send() => {
                sent.map_err(|err| ExtractError::Provider(err.to_string()))?
            }
            () = cancel.cancelled() => return Err(ExtractError::Cancelled),
        };

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ExtractError::Provider(format!(
                "vision endpoint returned {status}: {detail}"
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|err| ExtractError::Provider(err.to_string()))?;
        if let Some(error) = parsed.error {
            return Err(ExtractError::Provider(error));
        }

        Ok(parsed.response)
    }
}

/// Bounded pool of idle clients. `get` blocks up to the configured timeout;
/// `close` drains the pool so every client is torn down exactly once.
#[derive(Debug)]
pub struct VisionPool {
    idle: Mutex<Vec<VisionClient>>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl VisionPool {
    pub fn new(cfg: &VisionConfig) -> Self {
        let size = cfg.max_pool_size.max(1);
        let mut idle = Vec::with_capacity(size);
        for _ in 0..size {
            idle.push(VisionClient::new(cfg));
        }
        Self {
            idle: Mutex::new(idle),
            permits: Arc::new(Semaphore::new(size)),
            timeout: cfg.pool_timeout(),
        }
    }

    pub async fn get(&self) -> Result<PooledClient<'_>, ExtractError> {
        let permit = tokio::time::timeout(self.timeout, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| {
                ExtractError::Provider("timeout waiting for available vision client".to_string())
            })?
            .map_err(|_| ExtractError::Provider("vision pool closed".to_string()))?;

        let client = self
            .idle
            .lock()
            .expect("vision pool lock poisoned")
            .pop()
            .ok_or_else(|| ExtractError::Provider("vision pool closed".to_string()))?;

        Ok(PooledClient {
            pool: self,
            client: Some(client),
            _permit: permit,
        })
    }

    pub fn close(&self) {
        self.permits.close();
        let drained = {
            let mut idle = self.idle.lock().expect("vision pool lock poisoned");
            idle.drain(..).count()
        };
        if drained > 0 {
            tracing::debug!(drained, "vision pool closed");
        }
    }

    fn put_back(&self, client: VisionClient) {
        let mut idle = self.idle.lock().expect("vision pool lock poisoned");
        idle.push(client);
    }
}

/// Checked-out client; returns to the pool on drop.
#[derive(Debug)]
pub struct PooledClient<'a> {
    pool: &'a VisionPool,
    client: Option<VisionClient>,
    _permit: OwnedSemaphorePermit,
}

impl std::ops::Deref for PooledClient<'_> {
    type Target = VisionClient;

    fn deref(&self) -> &Self::Target {
        self.client.as_ref().expect("client present until drop")
    }
}

impl Drop for PooledClient<'_> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.put_back(client);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_config(size: usize, timeout_ms: u64) -> VisionConfig {
        VisionConfig {
            enabled: true,
            endpoint: "http://127.0.0.1:11434".to_string(),
            model: "llava".to_string(),
            max_tokens: 256,
            temperature: 0.2,
            max_pool_size: size,
            pool_timeout_ms: timeout_ms,
        }
    }

    #[tokio::test]
    async fn acquisition_times_out_when_pool_is_exhausted() {
        let pool = VisionPool::new(&pool_config(1, 100));

        let held = pool.get().await.expect("first checkout");
        let start = std::time::Instant::now();
        let err = pool.get().await.expect_err("second checkout must time out");
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(matches!(err, ExtractError::Provider(_)));
        drop(held);

        // The client is back; acquisition succeeds immediately.
        let _again = pool.get().await.expect("checkout after return");
    }

    #[tokio::test]
    async fn dropped_clients_return_to_the_pool() {
        let pool = VisionPool::new(&pool_config(2, 1_000));
        {
            let _a = pool.get().await.expect("a");
            let _b = pool.get().await.expect("b");
        }
        let _c = pool.get().await.expect("c");
        let _d = pool.get().await.expect("d");
    }

    #[tokio::test]
    async fn closed_pool_rejects_checkout() {
        let pool = VisionPool::new(&pool_config(1, 50));
        pool.close();
        assert!(pool.get().await.is_err());
    }
}
