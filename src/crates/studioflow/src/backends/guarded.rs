//! Circuit-breaker decorator for the video generator
//!
//! Clip submissions go through the breaker, so nothing reaches the provider while
//! the circuit is open.

use super::{ClipRequest, VideoGenerator};
use crate::circuit_breaker::CircuitBreaker;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub struct CircuitBreakingVideoGenerator {
    inner: Arc<dyn VideoGenerator>,
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakingVideoGenerator {
    pub fn new(inner: Arc<dyn VideoGenerator>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

#[async_trait]
impl VideoGenerator for CircuitBreakingVideoGenerator {
    async fn submit_clip(&self, request: &ClipRequest) -> Result<String> {
        self.breaker.call(|| self.inner.submit_clip(request)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SimulatedStudio;
    use crate::circuit_breaker::CircuitState;
    use crate::config::CircuitBreakerConfig;
    use crate::error::StudioflowError;

    fn request(n: usize) -> ClipRequest {
        ClipRequest {
            idempotency_key: format!("run-1:production:{n}"),
            run_id: "run-1".to_string(),
            prompt: "a skyline at dusk".to_string(),
            duration_seconds: 5,
        }
    }

    #[tokio::test]
    async fn test_open_circuit_blocks_submissions() {
        let studio = Arc::new(SimulatedStudio::new());
        let breaker = Arc::new(CircuitBreaker::new(
            "video",
            CircuitBreakerConfig {
                failure_threshold: 2,
                recovery_timeout_ms: 60_000,
                half_open_max_calls: 1,
            },
        ));
        let video = CircuitBreakingVideoGenerator::new(studio.clone(), breaker.clone());

        studio.fail_next_video_calls(2);
        assert!(video.submit_clip(&request(0)).await.is_err());
        assert!(video.submit_clip(&request(0)).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        let calls_before = studio.video_calls();
        assert!(matches!(
            video.submit_clip(&request(1)).await,
            Err(StudioflowError::CircuitOpen(_))
        ));
        assert_eq!(studio.video_calls(), calls_before);
    }
}
