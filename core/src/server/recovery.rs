//! Recovery session state machine.
//!
//! ```text
//! Inactive ──start(t)──▶ Collecting(t, shares) ──t-th share──▶ ThresholdReached
//!    ▲                        │   ▲                                  │
//!    └──── reset / complete ──┘   └──── reconstruction failed ◀──────┘
//! ```
//!
//! The session only collects. Reconstruction and key import are driven by
//! the dispatcher, which calls [`RecoverySession::complete`] on success or
//! [`RecoverySession::withdraw`] to hand back the slot when reconstruction
//! fails, so the operator can offer a different share.

use std::collections::BTreeMap;

use thiserror::Error;

use super::messages::RecoveryStatus;
use crate::config::MIN_THRESHOLD;
use crate::sharing::Share;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("recovery mode not active")]
    NoActiveSession,

    #[error("share with index {0} already provided")]
    DuplicateShareIndex(u8),

    #[error("share commitment does not match the shares already provided")]
    CommitmentMismatch,

    #[error("recovery threshold must be at least {min}, got {0}", min = MIN_THRESHOLD)]
    InvalidThreshold(usize),

    #[error("invalid share: {0}")]
    InvalidShare(String),
}

/// What a newly accepted share did to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More shares needed.
    Collecting { provided: usize, required: usize },
    /// The threshold is met; the caller should reconstruct now.
    ThresholdReached,
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Inactive,
    Collecting {
        threshold: usize,
        shares: BTreeMap<u8, Share>,
    },
}

/// The single recovery session a server holds.
#[derive(Debug, Default)]
pub struct RecoverySession {
    state: State,
}

impl RecoverySession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, State::Collecting { .. })
    }

    /// Begin collecting. An active session is discarded and started over;
    /// the return value says whether that happened.
    pub fn start(&mut self, threshold: usize) -> Result<bool, RecoveryError> {
        if threshold < MIN_THRESHOLD as usize {
            return Err(RecoveryError::InvalidThreshold(threshold));
        }
        let restarted = self.is_active();
        self.state = State::Collecting {
            threshold,
            shares: BTreeMap::new(),
        };
        Ok(restarted)
    }

    /// Accept one share.
    ///
    /// Rejected shares never consume a slot. A share split with a higher
    /// threshold than the session was started with raises the session's
    /// requirement to match, since fewer shares can never reconstruct.
    pub fn provide(&mut self, share: Share) -> Result<Progress, RecoveryError> {
        let State::Collecting { threshold, shares } = &mut self.state else {
            return Err(RecoveryError::NoActiveSession);
        };

        if share.index == 0 {
            return Err(RecoveryError::InvalidShare("index 0 is reserved".into()));
        }
        match share.payload() {
            Ok(bytes) if !bytes.is_empty() => {}
            Ok(_) => return Err(RecoveryError::InvalidShare("payload is empty".into())),
            Err(e) => return Err(RecoveryError::InvalidShare(e.to_string())),
        }
        if shares.contains_key(&share.index) {
            return Err(RecoveryError::DuplicateShareIndex(share.index));
        }
        if let Some(existing) = shares.values().next() {
            if existing.commitment != share.commitment {
                return Err(RecoveryError::CommitmentMismatch);
            }
        }

        let share_threshold = share.threshold as usize;
        if share_threshold > *threshold {
            *threshold = share_threshold;
        }

        shares.insert(share.index, share);
        if shares.len() >= *threshold {
            Ok(Progress::ThresholdReached)
        } else {
            Ok(Progress::Collecting {
                provided: shares.len(),
                required: *threshold,
            })
        }
    }

    /// Collected shares in index order.
    pub fn collected(&self) -> Vec<Share> {
        match &self.state {
            State::Inactive => Vec::new(),
            State::Collecting { shares, .. } => shares.values().cloned().collect(),
        }
    }

    /// Give back the slot taken by `index` after a failed reconstruction.
    pub fn withdraw(&mut self, index: u8) {
        if let State::Collecting { shares, .. } = &mut self.state {
            shares.remove(&index);
        }
    }

    /// End the session after a successful recovery. Collected shares are
    /// dropped, which wipes their payloads.
    pub fn complete(&mut self) {
        self.state = State::Inactive;
    }

    /// Abandon the session. Returns `false` if none was active.
    pub fn reset(&mut self) -> bool {
        let was_active = self.is_active();
        self.state = State::Inactive;
        was_active
    }

    pub fn status(&self) -> RecoveryStatus {
        match &self.state {
            State::Inactive => RecoveryStatus {
                is_active: false,
                shares_provided: 0,
                shares_required: 0,
                can_recover: false,
                message: "No active recovery.".into(),
            },
            State::Collecting { threshold, shares } => {
                let provided = shares.len();
                let message = if provided == 0 {
                    "Recovery mode activated. Provide shares.".to_owned()
                } else {
                    format!(
                        "Recovery in progress. {provided}/{threshold} shares provided. Need {} more.",
                        threshold.saturating_sub(provided)
                    )
                };
                RecoveryStatus {
                    is_active: true,
                    shares_provided: provided,
                    shares_required: *threshold,
                    can_recover: provided >= *threshold,
                    message,
                }
            }
        }
    }
}
