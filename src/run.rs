//! Run identity and operator annotation.

use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Identity of one data-taking session.
///
/// Ordered by `(exp_number, run_number, sub_run_number)`; the start time is
/// informational and does not take part in comparisons.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RunIdentity {
    /// Experiment number.
    pub exp_number: i32,
    /// Run number within the experiment.
    pub run_number: i32,
    /// Sub-run number, bumped on every RESUME.
    pub sub_run_number: i32,
    /// When the run started, if it did.
    pub start_time: Option<DateTime<Utc>>,
}

impl RunIdentity {
    /// Identity of sub-run 0 of `(exp_number, run_number)`, not yet started.
    pub fn new(exp_number: i32, run_number: i32) -> Self {
        Self {
            exp_number,
            run_number,
            sub_run_number: 0,
            start_time: None,
        }
    }

    fn key(&self) -> (i32, i32, i32) {
        (self.exp_number, self.run_number, self.sub_run_number)
    }

    /// Start time as seconds since the Unix epoch, 0 if the run never started.
    pub fn start_time_secs(&self) -> i64 {
        self.start_time.map(|t| t.timestamp()).unwrap_or(0)
    }
}

impl Default for RunIdentity {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl PartialEq for RunIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for RunIdentity {}

impl PartialOrd for RunIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RunIdentity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Hands out run identities that never go backwards.
#[derive(Debug, Default, Clone)]
pub struct RunNumberAllocator {
    last: RunIdentity,
}

impl RunNumberAllocator {
    /// Resume numbering after a previously recorded run.
    pub fn starting_after(last: RunIdentity) -> Self {
        Self { last }
    }

    /// Identity of the last allocated run.
    pub fn current(&self) -> RunIdentity {
        self.last
    }

    /// Allocate the identity for a new run.
    ///
    /// A requested `(exp, run)` is honoured when it does not precede the last
    /// run; otherwise the run number continues from the last one. Fails when
    /// continuing would overflow the run number, leaving the allocator as it was.
    pub fn start_run(&mut self, requested: Option<(i32, i32)>) -> AppResult<RunIdentity> {
        let mut next = match requested {
            Some((exp, run)) if RunIdentity::new(exp, run) >= self.last => {
                RunIdentity::new(exp, run)
            }
            Some((exp, run)) => {
                tracing::warn!(
                    requested_exp = exp,
                    requested_run = run,
                    last_exp = self.last.exp_number,
                    last_run = self.last.run_number,
                    "Requested run number precedes the last run; continuing numbering"
                );
                self.following_run()?
            }
            None => self.following_run()?,
        };
        next.start_time = Some(Utc::now());
        self.last = next;
        Ok(next)
    }

    fn following_run(&self) -> AppResult<RunIdentity> {
        let run = self.last.run_number.checked_add(1).ok_or_else(|| {
            DaqError::RunNumbersExhausted(format!(
                "run {} of experiment {} is the last one",
                self.last.run_number, self.last.exp_number
            ))
        })?;
        Ok(RunIdentity::new(self.last.exp_number, run))
    }

    /// Bump the sub-run number on RESUME. An explicit value is used if it moves forward.
    pub fn next_sub_run(&mut self, requested: Option<i32>) -> AppResult<RunIdentity> {
        let bumped = self.last.sub_run_number.checked_add(1).ok_or_else(|| {
            DaqError::RunNumbersExhausted(format!(
                "sub-run {} of run {} is the last one",
                self.last.sub_run_number, self.last.run_number
            ))
        })?;
        self.last.sub_run_number = match requested {
            Some(sub) if sub >= bumped => sub,
            _ => bumped,
        };
        Ok(self.last)
    }
}

/// Operator names and comment attached to a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorAnnotation {
    /// Space-separated operator names.
    pub operators: String,
    /// Free-text run comment.
    pub comment: String,
}

impl OperatorAnnotation {
    /// Annotation with the given operators and comment.
    pub fn new(operators: impl Into<String>, comment: impl Into<String>) -> Self {
        Self {
            operators: operators.into(),
            comment: comment.into(),
        }
    }

    /// Both fields must contain something other than whitespace.
    pub fn is_complete(&self) -> bool {
        !self.operators.trim().is_empty() && !self.comment.trim().is_empty()
    }
}
