use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One prompt-shaped request to the external text-generation API. Built by
/// the stage executor; one request per stage attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Correlation tag (stage + item) carried through for logging.
    pub request_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerationUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResponse {
    pub content: String,
    pub usage: GenerationUsage,
}

/// Failure of one generation call, categorized so the caller can decide
/// whether a retry makes sense.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenerationError {
    #[error("Generation call timed out: {0}")]
    Timeout(String),
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Server error: {0}")]
    Server(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Content policy rejection: {0}")]
    PolicyRejection(String),
}

impl GenerationError {
    /// Transient failures worth retrying. Malformed requests, auth failures
    /// and policy rejections never succeed on a second attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerationError::Timeout(_)
            | GenerationError::RateLimited(_)
            | GenerationError::Network(_)
            | GenerationError::Server(_) => true,
            GenerationError::BadRequest(_)
            | GenerationError::Auth(_)
            | GenerationError::PolicyRejection(_) => false,
        }
    }
}

/// The external text-generation API, reduced to a single async call.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn invoke(&self, request: GenerationRequest) -> Result<GenerationResponse, GenerationError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// Scripted outcome for one mock invocation.
    #[derive(Debug, Clone)]
    pub enum MockOutcome {
        Succeed(String),
        Fail(GenerationError),
        /// Sleep this long before succeeding, to exercise attempt timeouts.
        Stall(Duration, String),
    }

    /// Programmable mock client. Outcomes are scripted per request tag and
    /// consumed front to back; once a script runs dry the default outcome
    /// applies. Also tracks the peak number of concurrent invocations.
    pub struct MockGenerationClient {
        scripts: Mutex<HashMap<String, Vec<MockOutcome>>>,
        default_content: String,
        call_delay: Duration,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
        total_calls: AtomicUsize,
    }

    impl MockGenerationClient {
        pub fn new(default_content: impl Into<String>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(HashMap::new()),
                default_content: default_content.into(),
                call_delay: Duration::from_millis(5),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                total_calls: AtomicUsize::new(0),
            })
        }

        pub fn with_delay(default_content: impl Into<String>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(HashMap::new()),
                default_content: default_content.into(),
                call_delay: delay,
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                total_calls: AtomicUsize::new(0),
            })
        }

        pub async fn script(&self, request_tag: &str, outcomes: Vec<MockOutcome>) {
            let mut scripts = self.scripts.lock().await;
            scripts.insert(request_tag.to_string(), outcomes);
        }

        pub fn total_calls(&self) -> usize {
            self.total_calls.load(Ordering::SeqCst)
        }

        pub fn peak_in_flight(&self) -> usize {
            self.peak_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GenerationClient for MockGenerationClient {
        async fn invoke(
            &self,
            request: GenerationRequest,
        ) -> Result<GenerationResponse, GenerationError> {
            self.total_calls.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

            let outcome = {
                let mut scripts = self.scripts.lock().await;
                scripts
                    .get_mut(&request.request_tag)
                    .and_then(|queue| if queue.is_empty() { None } else { Some(queue.remove(0)) })
            };

            let result = match outcome {
                None => {
                    tokio::time::sleep(self.call_delay).await;
                    Ok(GenerationResponse {
                        content: self.default_content.clone(),
                        usage: GenerationUsage {
                            prompt_tokens: 100,
                            completion_tokens: 200,
                        },
                    })
                }
                Some(MockOutcome::Succeed(content)) => {
                    tokio::time::sleep(self.call_delay).await;
                    Ok(GenerationResponse {
                        content,
                        usage: GenerationUsage {
                            prompt_tokens: 100,
                            completion_tokens: 200,
                        },
                    })
                }
                Some(MockOutcome::Fail(err)) => {
                    tokio::time::sleep(self.call_delay).await;
                    Err(err)
                }
                Some(MockOutcome::Stall(duration, content)) => {
                    tokio::time::sleep(duration).await;
                    Ok(GenerationResponse {
                        content,
                        usage: GenerationUsage::default(),
                    })
                }
            };

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_taxonomy() {
        assert!(GenerationError::Timeout("t".into()).is_retryable());
        assert!(GenerationError::RateLimited("r".into()).is_retryable());
        assert!(GenerationError::Server("s".into()).is_retryable());
        assert!(!GenerationError::Auth("a".into()).is_retryable());
        assert!(!GenerationError::BadRequest("b".into()).is_retryable());
        assert!(!GenerationError::PolicyRejection("p".into()).is_retryable());
    }
}
