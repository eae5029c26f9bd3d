//! Pending-operation state machine and hook dispatch.
//!
//! Every long-running mutation plans first and commits later. The plan is a
//! `Pending*` value that moves through `Planned -> Approved -> Committed`
//! or `Planned -> Rejected`. Transitions are idempotent on their terminal
//! state and fail on invalid source states. Routing is three-tier: review
//! mode returns the pending to the caller, handler mode runs a registered
//! hook synchronously, and auto mode approves immediately.

use serde_json::Value;

use crate::errors::{Result, TractError};

/// Lifecycle of a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStatus {
    Planned,
    Approved,
    Rejected,
    Committed,
}

impl PendingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingStatus::Planned => "pending",
            PendingStatus::Approved => "approved",
            PendingStatus::Rejected => "rejected",
            PendingStatus::Committed => "committed",
        }
    }
}

/// Shared state-machine core embedded in every pending type.
#[derive(Debug, Clone)]
pub struct PendingState {
    status: PendingStatus,
    pub reject_reason: Option<String>,
    pub triggered_by: Option<String>,
    /// HEAD at plan time, checked again at finalization (TOCTOU guard).
    pub planned_head: Option<String>,
}

impl PendingState {
    pub fn new(planned_head: Option<String>, triggered_by: Option<String>) -> Self {
        Self {
            status: PendingStatus::Planned,
            reject_reason: None,
            triggered_by,
            planned_head,
        }
    }

    pub fn status(&self) -> PendingStatus {
        self.status
    }

    /// `Planned -> Approved`. Idempotent when already approved.
    pub fn approve(&mut self) -> Result<()> {
        match self.status {
            PendingStatus::Planned | PendingStatus::Approved => {
                self.status = PendingStatus::Approved;
                Ok(())
            }
            other => Err(TractError::InvalidState(format!(
                "cannot approve a {} operation",
                other.as_str()
            ))),
        }
    }

    /// `Planned|Approved -> Rejected`. Idempotent when already rejected.
    pub fn reject(&mut self, reason: Option<String>) -> Result<()> {
        match self.status {
            PendingStatus::Planned | PendingStatus::Approved | PendingStatus::Rejected => {
                self.status = PendingStatus::Rejected;
                if reason.is_some() {
                    self.reject_reason = reason;
                }
                Ok(())
            }
            PendingStatus::Committed => Err(TractError::InvalidState(
                "cannot reject a committed operation".to_string(),
            )),
        }
    }

    /// `Approved -> Committed`. Only the finalizer calls this.
    pub fn mark_committed(&mut self) -> Result<()> {
        match self.status {
            PendingStatus::Approved | PendingStatus::Committed => {
                self.status = PendingStatus::Committed;
                Ok(())
            }
            other => Err(TractError::InvalidState(format!(
                "cannot commit a {} operation; approve it first",
                other.as_str()
            ))),
        }
    }
}

/// Outcome of `validate()` on a pending operation.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub ok: bool,
    pub diagnosis: Option<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            ok: true,
            diagnosis: None,
        }
    }

    pub fn failed(diagnosis: impl Into<String>) -> Self {
        Self {
            ok: false,
            diagnosis: Some(diagnosis.into()),
        }
    }
}

/// Returned when `auto_retry` exhausts its attempts and rejects.
#[derive(Debug, Clone)]
pub struct HookRejection {
    pub reason: String,
    pub rejection_source: String,
    pub metadata: Value,
}

/// Common surface of every pending operation, used by `auto_retry`.
pub trait PendingOperation {
    fn status(&self) -> PendingStatus;
    fn approve(&mut self) -> Result<()>;
    fn reject(&mut self, reason: Option<String>) -> Result<()>;
    fn validate(&self) -> ValidationResult;

    /// Regenerate the operation's draft output. Not every operation
    /// supports it.
    fn retry(&mut self) -> Result<()> {
        Err(TractError::InvalidState(
            "retry is not supported for this operation".to_string(),
        ))
    }

    /// Fold a rejection diagnosis into the guidance for the next attempt.
    fn fold_diagnosis(&mut self, _diagnosis: &str) {}

    fn operation_name(&self) -> &'static str;
}

/// Validate-retry loop: approve on success, steer and retry on failure,
/// reject with a `HookRejection` when attempts run out.
pub fn auto_retry<P: PendingOperation>(
    pending: &mut P,
    max_retries: u32,
) -> Result<Option<HookRejection>> {
    let mut attempts = 0u32;
    loop {
        let verdict = pending.validate();
        if verdict.ok {
            pending.approve()?;
            return Ok(None);
        }
        let diagnosis = verdict
            .diagnosis
            .unwrap_or_else(|| "validation failed".to_string());
        if attempts >= max_retries {
            pending.reject(Some(diagnosis.clone()))?;
            return Ok(Some(HookRejection {
                reason: diagnosis,
                rejection_source: "auto_retry".to_string(),
                metadata: serde_json::json!({
                    "operation": pending.operation_name(),
                    "attempts": attempts + 1,
                }),
            }));
        }
        pending.fold_diagnosis(&diagnosis);
        pending.retry()?;
        attempts += 1;
    }
}

/// Events a hook handler can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    Compress,
    Merge,
    Rebase,
    Gc,
    Import,
}

/// Typed hook registry: at most one handler per event, run synchronously
/// on the owning thread.
#[derive(Default)]
pub struct Hooks {
    pub compress: Option<Box<dyn FnMut(&mut crate::ops::compress::PendingCompress) + Send>>,
    pub merge: Option<Box<dyn FnMut(&mut crate::ops::merge::PendingMerge) + Send>>,
    pub rebase: Option<Box<dyn FnMut(&mut crate::ops::rebase::PendingRebase) + Send>>,
    pub gc: Option<Box<dyn FnMut(&mut crate::ops::gc::PendingGc) + Send>>,
    pub import: Option<Box<dyn FnMut(&mut crate::ops::rebase::PendingImport) + Send>>,
}

impl Hooks {
    pub fn off(&mut self, event: HookEvent) {
        match event {
            HookEvent::Compress => self.compress = None,
            HookEvent::Merge => self.merge = None,
            HookEvent::Rebase => self.rebase = None,
            HookEvent::Gc => self.gc = None,
            HookEvent::Import => self.import = None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_enforce_the_state_machine() {
        let mut state = PendingState::new(Some("head".into()), None);
        assert_eq!(state.status(), PendingStatus::Planned);
        assert!(state.mark_committed().is_err());

        state.approve().unwrap();
        state.approve().unwrap(); // idempotent
        state.mark_committed().unwrap();
        state.mark_committed().unwrap(); // idempotent
        assert!(state.approve().is_err());
        assert!(state.reject(None).is_err());
    }

    #[test]
    fn reject_is_terminal_against_approve() {
        let mut state = PendingState::new(None, None);
        state.reject(Some("nope".into())).unwrap();
        assert_eq!(state.status(), PendingStatus::Rejected);
        assert!(state.approve().is_err());
        assert!(state.mark_committed().is_err());
        assert_eq!(state.reject_reason.as_deref(), Some("nope"));
    }

    struct Flaky {
        state: PendingState,
        remaining_failures: u32,
        retries: u32,
        diagnoses: Vec<String>,
    }

    impl PendingOperation for Flaky {
        fn status(&self) -> PendingStatus {
            self.state.status()
        }
        fn approve(&mut self) -> Result<()> {
            self.state.approve()
        }
        fn reject(&mut self, reason: Option<String>) -> Result<()> {
            self.state.reject(reason)
        }
        fn validate(&self) -> ValidationResult {
            if self.remaining_failures == 0 {
                ValidationResult::ok()
            } else {
                ValidationResult::failed("too long")
            }
        }
        fn retry(&mut self) -> Result<()> {
            self.retries += 1;
            self.remaining_failures = self.remaining_failures.saturating_sub(1);
            Ok(())
        }
        fn fold_diagnosis(&mut self, diagnosis: &str) {
            self.diagnoses.push(diagnosis.to_string());
        }
        fn operation_name(&self) -> &'static str {
            "flaky"
        }
    }

    #[test]
    fn auto_retry_recovers_within_budget() {
        let mut pending = Flaky {
            state: PendingState::new(None, None),
            remaining_failures: 2,
            retries: 0,
            diagnoses: vec![],
        };
        let rejection = auto_retry(&mut pending, 3).unwrap();
        assert!(rejection.is_none());
        assert_eq!(pending.status(), PendingStatus::Approved);
        assert_eq!(pending.retries, 2);
        assert_eq!(pending.diagnoses.len(), 2);
    }

    #[test]
    fn auto_retry_rejects_on_exhaustion() {
        let mut pending = Flaky {
            state: PendingState::new(None, None),
            remaining_failures: 10,
            retries: 0,
            diagnoses: vec![],
        };
        let rejection = auto_retry(&mut pending, 2).unwrap().unwrap();
        assert_eq!(pending.status(), PendingStatus::Rejected);
        assert_eq!(rejection.rejection_source, "auto_retry");
        assert_eq!(rejection.reason, "too long");
        assert_eq!(rejection.metadata["attempts"], 3);
    }
}
