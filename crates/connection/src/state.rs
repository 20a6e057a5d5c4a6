//! Connection state machine.
//!
//! [`ConnectionState`] is owned by the supervisor task; every status change
//! goes through one of its transition methods, which reject transitions the
//! lifecycle does not allow. `Closed` is terminal.
//!
//! ```text
//! Disconnected ──begin_connect──▶ Connecting ──opened──▶ Connected
//!      ▲                            │                      │
//!    reset                   attempt_failed           channel_lost
//!      │                            ▼                      ▼
//!      └──────────────────────── Error ◀──(gave up)── Disconnected
//!                                   │                      │
//!                                   └──schedule_retry──────┘
//!                                             ▼
//!                                       Reconnecting ──begin_connect──▶ Connecting
//! ```

use std::time::Duration;

use crate::types::{ConnectionStatus, ReconnectConfig};

/// A transition the current status does not allow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {event} while {from}")]
pub struct TransitionError {
    pub from: ConnectionStatus,
    pub event: &'static str,
}

/// Outcome of [`ConnectionState::schedule_retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then start attempt `attempt`.
    Wait { attempt: u32, delay: Duration },
    /// The attempt cap was reached after `attempts` retries.
    GiveUp { attempts: u32 },
}

/// State of one dashboard session's connection.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    status: ConnectionStatus,
    url: String,
    credential: String,
    attempt: u32,
}

impl ConnectionState {
    pub fn new(url: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            url: url.into(),
            credential: credential.into(),
            attempt: 0,
        }
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    /// Consecutive reconnect attempts since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_closed(&self) -> bool {
        self.status == ConnectionStatus::Closed
    }

    /// Starts opening a channel.
    pub fn begin_connect(&mut self) -> Result<ConnectionStatus, TransitionError> {
        match self.status {
            ConnectionStatus::Disconnected | ConnectionStatus::Reconnecting { .. } => {
                Ok(self.set(ConnectionStatus::Connecting))
            }
            _ => Err(self.reject("begin connecting")),
        }
    }

    /// Handshake completed. Resets the attempt counter.
    pub fn opened(&mut self) -> Result<ConnectionStatus, TransitionError> {
        match self.status {
            ConnectionStatus::Connecting => {
                self.attempt = 0;
                Ok(self.set(ConnectionStatus::Connected))
            }
            _ => Err(self.reject("open")),
        }
    }

    /// The attempt failed before the handshake completed.
    pub fn attempt_failed(&mut self) -> Result<ConnectionStatus, TransitionError> {
        match self.status {
            ConnectionStatus::Connecting => Ok(self.set(ConnectionStatus::Error)),
            _ => Err(self.reject("fail an attempt")),
        }
    }

    /// An established channel went away.
    pub fn channel_lost(&mut self) -> Result<ConnectionStatus, TransitionError> {
        match self.status {
            ConnectionStatus::Connected => Ok(self.set(ConnectionStatus::Disconnected)),
            _ => Err(self.reject("lose the channel")),
        }
    }

    /// Counts the next attempt and computes its backoff, or gives up when
    /// the configured cap is reached.
    pub fn schedule_retry(
        &mut self,
        config: &ReconnectConfig,
    ) -> Result<RetryDecision, TransitionError> {
        match self.status {
            ConnectionStatus::Disconnected | ConnectionStatus::Error => {}
            _ => return Err(self.reject("schedule a retry")),
        }

        let next = self.attempt.saturating_add(1);
        if config.is_exhausted(next) {
            self.set(ConnectionStatus::Error);
            return Ok(RetryDecision::GiveUp {
                attempts: self.attempt,
            });
        }

        self.attempt = next;
        self.set(ConnectionStatus::Reconnecting { attempt: next });
        Ok(RetryDecision::Wait {
            attempt: next,
            delay: config.delay_for_attempt(next),
        })
    }

    /// Forced restart: drops back to `Disconnected` with a fresh backoff.
    pub fn reset(&mut self) -> Result<ConnectionStatus, TransitionError> {
        if self.is_closed() {
            return Err(self.reject("reset"));
        }
        self.attempt = 0;
        Ok(self.set(ConnectionStatus::Disconnected))
    }

    /// Points the next attempt at a new target.
    pub fn retarget(
        &mut self,
        url: impl Into<String>,
        credential: impl Into<String>,
    ) -> Result<(), TransitionError> {
        if self.is_closed() {
            return Err(self.reject("change target"));
        }
        self.url = url.into();
        self.credential = credential.into();
        Ok(())
    }

    /// User-initiated close. Allowed from any status.
    pub fn close(&mut self) -> ConnectionStatus {
        self.set(ConnectionStatus::Closed)
    }

    fn set(&mut self, status: ConnectionStatus) -> ConnectionStatus {
        self.status = status.clone();
        status
    }

    fn reject(&self, event: &'static str) -> TransitionError {
        TransitionError {
            from: self.status.clone(),
            event,
        }
    }
}
