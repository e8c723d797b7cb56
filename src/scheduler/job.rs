//! Per-page job lifecycle.

use std::fmt;

use thiserror::Error;

/// Lifecycle state of one page's download job.
///
/// ```text
/// Pending -> InFlight -> Succeeded
///               |  ^  \-> Failed
///               v  |
///            Retrying -> Failed
/// ```
///
/// `Succeeded` and `Failed` are terminal; a job never leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    InFlight,
    Retrying,
    Succeeded,
    Failed,
}

impl JobState {
    /// Returns true for `Succeeded` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Returns true when `self -> next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InFlight | Self::Failed)
                | (Self::InFlight, Self::Retrying | Self::Succeeded | Self::Failed)
                | (Self::Retrying, Self::InFlight | Self::Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        write!(f, "{label}")
    }
}

/// Rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("page {page_index}: illegal job transition {from} -> {to}")]
pub struct InvalidTransition {
    pub page_index: usize,
    pub from: JobState,
    pub to: JobState,
}

/// Ephemeral unit of work for one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    page_index: usize,
    attempts: u32,
    state: JobState,
}

impl DownloadJob {
    #[must_use]
    pub fn new(page_index: usize) -> Self {
        Self {
            page_index,
            attempts: 0,
            state: JobState::Pending,
        }
    }

    #[must_use]
    pub fn page_index(&self) -> usize {
        self.page_index
    }

    /// Number of attempts started so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Moves the job to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] and leaves the job untouched when the
    /// change is not allowed, in particular any move out of a terminal state.
    pub fn transition(&mut self, next: JobState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                page_index: self.page_index,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Starts a new attempt: moves to `InFlight` and bumps the attempt count.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] unless the job is `Pending` or `Retrying`.
    pub fn begin_attempt(&mut self) -> Result<(), InvalidTransition> {
        self.transition(JobState::InFlight)?;
        self.attempts += 1;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_with_retry() {
        let mut job = DownloadJob::new(7);
        job.begin_attempt().unwrap();
        job.transition(JobState::Retrying).unwrap();
        job.begin_attempt().unwrap();
        job.transition(JobState::Succeeded).unwrap();
        assert_eq!(job.attempts(), 2);
        assert_eq!(job.state(), JobState::Succeeded);
    }

    #[test]
    fn test_terminal_states_never_regress() {
        for terminal in [JobState::Succeeded, JobState::Failed] {
            for next in [
                JobState::Pending,
                JobState::InFlight,
                JobState::Retrying,
                JobState::Succeeded,
                JobState::Failed,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_invalid_transition_leaves_job_unchanged() {
        let mut job = DownloadJob::new(1);
        job.begin_attempt().unwrap();
        job.transition(JobState::Failed).unwrap();

        let err = job.begin_attempt().unwrap_err();
        assert_eq!(err.from, JobState::Failed);
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.attempts(), 1);
    }

    #[test]
    fn test_pending_cannot_succeed_without_attempt() {
        let mut job = DownloadJob::new(0);
        assert!(job.transition(JobState::Succeeded).is_err());
        assert!(job.transition(JobState::Failed).is_ok());
    }
}
