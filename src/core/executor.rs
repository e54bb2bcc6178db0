//! Command executors: drive one logical command to a reply.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::core::command::Cmd;
use crate::core::provider::ConnectionProvider;
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// Executes commands and returns their replies.
///
/// Every deployment shape (single node, cluster, Sentinel, multi-endpoint)
/// is one implementation of this trait; the [`crate::Client`] facade only
/// talks to a `dyn CommandExecutor`.
#[async_trait]
pub trait CommandExecutor: Send + Sync + fmt::Debug {
    /// Executes `cmd` and returns the reply.
    async fn execute(&self, cmd: &Cmd) -> Result<Frame>;

    /// Releases the executor's providers and background tasks.
    fn close(&self);
}

/// One attempt per command, no retries.
#[derive(Debug, Clone)]
pub struct SimpleExecutor {
    provider: Arc<dyn ConnectionProvider>,
}

impl SimpleExecutor {
    /// Creates an executor over `provider`.
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl CommandExecutor for SimpleExecutor {
    async fn execute(&self, cmd: &Cmd) -> Result<Frame> {
        let mut conn = self.provider.connection(cmd).await?;
        conn.execute(cmd).await
    }

    fn close(&self) {
        self.provider.close();
    }
}

/// Retries connection failures within an attempt and time budget.
///
/// After two consecutive connection failures the executor sleeps for a
/// random back-off that shrinks as the deadline approaches. Any other error
/// is returned immediately.
#[derive(Debug, Clone)]
pub struct RetryingExecutor {
    provider: Arc<dyn ConnectionProvider>,
    max_attempts: u32,
    max_total_retries_duration: Duration,
}

impl RetryingExecutor {
    /// Creates an executor over `provider`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `max_attempts` is zero.
    pub fn new(
        provider: Arc<dyn ConnectionProvider>,
        max_attempts: u32,
        max_total_retries_duration: Duration,
    ) -> Result<Self> {
        if max_attempts == 0 {
            return Err(Error::InvalidArgument {
                message: "max_attempts must be greater than 0".to_string(),
            });
        }
        Ok(Self {
            provider,
            max_attempts,
            max_total_retries_duration,
        })
    }

    async fn attempt(&self, cmd: &Cmd) -> Result<Frame> {
        let mut conn = self.provider.connection(cmd).await?;
        conn.execute(cmd).await
    }
}

#[async_trait]
impl CommandExecutor for RetryingExecutor {
    #[instrument(level = "trace", skip_all, fields(cmd = %cmd.name()))]
    async fn execute(&self, cmd: &Cmd) -> Result<Frame> {
        let deadline = Instant::now() + self.max_total_retries_duration;
        let mut consecutive_failures = 0u32;
        let mut last_error = None;

        for attempts_left in (1..=self.max_attempts).rev() {
            match self.attempt(cmd).await {
                Ok(frame) => return Ok(frame),
                Err(e) if e.is_connection_error() => {
                    debug!(error = %e, attempts_left, "connection failure, retrying");
                    consecutive_failures += 1;
                    last_error = Some(e);
                    if consecutive_failures >= 2 {
                        tokio::time::sleep(backoff_sleep(attempts_left - 1, deadline)?).await;
                        consecutive_failures = 0;
                    }
                }
                Err(e) => return Err(e),
            }
            if Instant::now() > deadline {
                return Err(Error::DeadlineExceeded {
                    source: last_error.map(Box::new),
                });
            }
        }

        Err(Error::AttemptsExhausted {
            source: last_error.map(Box::new),
        })
    }

    fn close(&self) {
        self.provider.close();
    }
}

/// Random back-off in `[0, time_left / attempts_left²]`.
///
/// # Errors
///
/// Returns [`Error::DeadlineExceeded`] if the deadline already passed.
pub(crate) fn backoff_sleep(attempts_left: u32, deadline: Instant) -> Result<Duration> {
    if attempts_left == 0 {
        return Ok(Duration::ZERO);
    }
    let now = Instant::now();
    if now > deadline {
        return Err(Error::DeadlineExceeded { source: None });
    }
    let millis_left = deadline.duration_since(now).as_millis() as u64;
    let max_backoff = millis_left / u64::from(attempts_left * attempts_left);
    Ok(Duration::from_millis(
        rand::thread_rng().gen_range(0..=max_backoff),
    ))
}
