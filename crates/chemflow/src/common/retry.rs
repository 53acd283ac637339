use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Errors that may disappear when the same operation is attempted again.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Bounded backoff for calls to the store and to the compute backend.
///
/// The operation is attempted once, then once more after each of the configured delays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(with = "crate::common::serde_duration::list")]
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::from_millis(100),
                Duration::from_millis(500),
                Duration::from_secs(2),
            ],
        }
    }
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn no_delay(attempts: usize) -> Self {
        Self::new(vec![Duration::ZERO; attempts.saturating_sub(1)])
    }

    pub fn max_attempts(&self) -> usize {
        self.delays.len() + 1
    }

    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + std::fmt::Display,
    {
        let mut delays = self.delays.iter();
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() => match delays.next() {
                    Some(delay) => {
                        log::warn!("{operation} failed, retrying in {delay:?}: {error}");
                        tokio::time::sleep(*delay).await;
                    }
                    None => {
                        log::error!(
                            "{operation} failed after {} attempts: {error}",
                            self.max_attempts()
                        );
                        return Err(error);
                    }
                },
                Err(error) => return Err(error),
            }
        }
    }
}
