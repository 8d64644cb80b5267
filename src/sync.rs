//! Bounded re-probing of the chat list while a fresh session is still
//! populating it.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::error::Cancelled;
use crate::gateway::probe::{self, Operation};
use crate::gateway::{Envelope, Gateway, TemplateArgs};

/// Delay source for retries, swapped out in tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncState {
    Probing { attempt: u32 },
    WaitingRetry { attempt: u32 },
    Success { envelope: Envelope, attempt: u32 },
    Failed { envelope: Envelope, attempt: u32 },
}

/// Status line shown to the operator while attempts are running.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncProgress {
    pub attempt: u32,
    pub max_attempts: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub envelope: Envelope,
    pub attempts: u32,
    pub succeeded: bool,
}

pub struct SessionSync<'a> {
    gateway: &'a dyn Gateway,
    sleeper: &'a dyn Sleeper,
    max_attempts: u32,
    delay: Duration,
}

impl<'a> SessionSync<'a> {
    pub fn new(gateway: &'a dyn Gateway, sleeper: &'a dyn Sleeper, config: &SyncConfig) -> Self {
        Self {
            gateway,
            sleeper,
            max_attempts: config.max_attempts.max(1),
            delay: config.retry_delay(),
        }
    }

    /// Probe the chat list until it answers, a non-retryable failure shows
    /// up, or the attempts run out. Only not-found failures are retried.
    pub async fn list_chats(
        &self,
        session: &str,
        cancel: &CancellationToken,
        on_progress: &(dyn Fn(&SyncProgress) + Send + Sync),
    ) -> Result<SyncReport, Cancelled> {
        let args = TemplateArgs::new().set("session", session);
        let mut state = SyncState::Probing { attempt: 1 };

        loop {
            state = match state {
                SyncState::Probing { attempt } => {
                    if cancel.is_cancelled() {
                        return Err(Cancelled);
                    }
                    on_progress(&SyncProgress {
                        attempt,
                        max_attempts: self.max_attempts,
                        message: format!(
                            "Loading chats for session '{}' (attempt {}/{})...",
                            session, attempt, self.max_attempts
                        ),
                    });

                    let envelope = probe::probe(
                        self.gateway,
                        Operation::ListChats,
                        probe::LIST_CHATS,
                        &args,
                        cancel,
                    )
                    .await?;
                    self.after_probe(session, attempt, envelope)
                }
                SyncState::WaitingRetry { attempt } => {
                    on_progress(&SyncProgress {
                        attempt,
                        max_attempts: self.max_attempts,
                        message: format!(
                            "Session '{}' is still syncing, retrying in {}s (attempt {}/{})...",
                            session,
                            self.delay.as_secs(),
                            attempt,
                            self.max_attempts
                        ),
                    });
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Cancelled),
                        _ = self.sleeper.sleep(self.delay) => {}
                    }
                    SyncState::Probing {
                        attempt: attempt + 1,
                    }
                }
                SyncState::Success { envelope, attempt } => {
                    info!("Session '{}' chats loaded on attempt {}", session, attempt);
                    return Ok(SyncReport {
                        envelope,
                        attempts: attempt,
                        succeeded: true,
                    });
                }
                SyncState::Failed { envelope, attempt } => {
                    return Ok(SyncReport {
                        envelope,
                        attempts: attempt,
                        succeeded: false,
                    });
                }
            };
        }
    }

    fn after_probe(&self, session: &str, attempt: u32, envelope: Envelope) -> SyncState {
        if envelope.success && envelope.failure.is_none() {
            return SyncState::Success { envelope, attempt };
        }

        if !envelope.is_not_found() {
            warn!(
                "Session '{}' chat listing failed with status {}, not retrying",
                session, envelope.http_status
            );
            return SyncState::Failed { envelope, attempt };
        }

        if attempt < self.max_attempts {
            return SyncState::WaitingRetry { attempt };
        }

        let hint = format!(
            "Session '{}' is still synchronizing: chats were not available after {} attempts. Try again shortly.",
            session, self.max_attempts
        );
        warn!("{}", hint);
        SyncState::Failed {
            envelope: envelope.with_hint(hint),
            attempt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::ScriptedGateway;
    use crate::gateway::Payload;
    use serde_json::json;
    use std::sync::Mutex;

    const CHATS_PATH: &str = "/api/sessions/s1/chats";

    #[derive(Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    /// Sleeper that cancels the token instead of waiting.
    struct CancellingSleeper(CancellationToken);

    #[async_trait]
    impl Sleeper for CancellingSleeper {
        async fn sleep(&self, _duration: Duration) {
            self.0.cancel();
            std::future::pending::<()>().await;
        }
    }

    fn not_found() -> Envelope {
        Envelope::from_status("http://gateway.test/api/sessions/s1/chats", 404, None)
    }

    fn chats_ok() -> Envelope {
        Envelope::from_status(
            "http://gateway.test/api/sessions/s1/chats",
            200,
            Some(Payload::Json(json!([{"id": "1@c.us", "name": "A"}]))),
        )
    }

    fn no_progress() -> impl Fn(&SyncProgress) + Send + Sync {
        |_: &SyncProgress| {}
    }

    #[tokio::test]
    async fn test_succeeds_on_fifth_attempt() {
        let mut gateway = ScriptedGateway::new();
        for _ in 0..4 {
            gateway = gateway.reply(CHATS_PATH, not_found());
        }
        gateway = gateway.reply(CHATS_PATH, chats_ok());

        let sleeper = RecordingSleeper::default();
        let sync = SessionSync::new(&gateway, &sleeper, &SyncConfig::default());
        let report = sync
            .list_chats("s1", &CancellationToken::new(), &no_progress())
            .await
            .unwrap();

        assert!(report.succeeded);
        assert_eq!(report.attempts, 5);
        let chat_list_calls = gateway.calls().iter().filter(|p| *p == CHATS_PATH).count();
        assert_eq!(chat_list_calls, 5);
        assert_eq!(
            *sleeper.slept.lock().unwrap(),
            vec![Duration::from_secs(4); 4]
        );
    }

    #[tokio::test]
    async fn test_fails_after_exactly_max_attempts() {
        let gateway = ScriptedGateway::new();
        let sleeper = RecordingSleeper::default();
        let progress = Mutex::new(Vec::new());
        let record = |p: &SyncProgress| progress.lock().unwrap().push(p.attempt);

        let sync = SessionSync::new(&gateway, &sleeper, &SyncConfig::default());
        let report = sync
            .list_chats("s1", &CancellationToken::new(), &record)
            .await
            .unwrap();

        assert!(!report.succeeded);
        assert_eq!(report.attempts, 5);
        assert_eq!(gateway.call_count(), 5 * probe::LIST_CHATS.len());
        assert_eq!(sleeper.slept.lock().unwrap().len(), 4);
        let hint = report.envelope.diagnostic_hint.unwrap();
        assert!(hint.contains("'s1'"));
        assert!(hint.contains("5 attempts"));
        assert_eq!(progress.lock().unwrap().last(), Some(&5));
    }

    #[tokio::test]
    async fn test_empty_chat_list_is_success() {
        let gateway = ScriptedGateway::new().json(CHATS_PATH, 200, json!({"chats": []}));
        let sleeper = RecordingSleeper::default();
        let sync = SessionSync::new(&gateway, &sleeper, &SyncConfig::default());
        let report = sync
            .list_chats("s1", &CancellationToken::new(), &no_progress())
            .await
            .unwrap();
        assert!(report.succeeded);
        assert_eq!(report.attempts, 1);
        assert!(sleeper.slept.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_retryable_failure_stops_immediately() {
        let gateway = ScriptedGateway::new().status(CHATS_PATH, 401);
        let sleeper = RecordingSleeper::default();
        let sync = SessionSync::new(&gateway, &sleeper, &SyncConfig::default());
        let report = sync
            .list_chats("s1", &CancellationToken::new(), &no_progress())
            .await
            .unwrap();
        assert!(!report.succeeded);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.envelope.http_status, 401);
        assert_eq!(gateway.call_count(), 1);
        assert!(sleeper.slept.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unrecognized_shape_is_not_retried() {
        let gateway = ScriptedGateway::new()
            .json(CHATS_PATH, 200, json!({"status": "SCAN_QR_CODE"}))
            .json("/api/chats/s1", 200, json!({"status": "SCAN_QR_CODE"}))
            .json("/api/s1/chats", 200, json!({"status": "SCAN_QR_CODE"}));
        let sleeper = RecordingSleeper::default();
        let sync = SessionSync::new(&gateway, &sleeper, &SyncConfig::default());
        let report = sync
            .list_chats("s1", &CancellationToken::new(), &no_progress())
            .await
            .unwrap();
        assert!(!report.succeeded);
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test]
    async fn test_cancellation_during_sleep_is_silent() {
        let gateway = ScriptedGateway::new();
        let cancel = CancellationToken::new();
        let sleeper = CancellingSleeper(cancel.clone());
        let sync = SessionSync::new(&gateway, &sleeper, &SyncConfig::default());
        let result = sync.list_chats("s1", &cancel, &no_progress()).await;
        assert_eq!(result, Err(Cancelled));
        assert_eq!(gateway.call_count(), probe::LIST_CHATS.len());
    }

    #[tokio::test]
    async fn test_cancelled_before_first_probe() {
        let gateway = ScriptedGateway::new();
        let sleeper = RecordingSleeper::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let sync = SessionSync::new(&gateway, &sleeper, &SyncConfig::default());
        let result = sync.list_chats("s1", &cancel, &no_progress()).await;
        assert_eq!(result, Err(Cancelled));
        assert_eq!(gateway.call_count(), 0);
    }
}
