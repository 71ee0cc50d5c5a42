//! Battle status: each side's event stream folded into a lifecycle record.

use serde::{Deserialize, Serialize};

use super::results::ExperimentResults;
use crate::bridge::protocol::{ExperimentEvent, TrainingInfo};

/// Battle lifecycle. Ordered; a battle only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    InSetup,
    Training,
    Completed,
}

/// Point-in-time battle status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub code: StatusCode,
    /// Last reported fit time in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    /// Estimated seconds until the reporting side finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<f64>,
}

impl Status {
    pub fn new(code: StatusCode) -> Self {
        Self {
            code,
            time: None,
            remaining: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SideOutcome {
    Finished(Box<ExperimentResults>),
    Failed(String),
}

/// Everything one side has reported so far.
#[derive(Debug, Clone, Default)]
pub struct SideRecord {
    pub setup_completed: bool,
    pub outcome: Option<SideOutcome>,
    /// Latest INFO with the drain sequence number it arrived at.
    pub last_info: Option<(TrainingInfo, u64)>,
}

impl SideRecord {
    /// Folds one event. Nothing changes after the terminal event.
    pub fn apply(&mut self, event: ExperimentEvent, seq: u64) {
        if self.outcome.is_some() {
            tracing::warn!(seq, "Event after terminal event ignored");
            return;
        }
        match event {
            ExperimentEvent::SetupCompleted => self.setup_completed = true,
            ExperimentEvent::Info(info) => {
                if self.setup_completed {
                    self.last_info = Some((info, seq));
                }
            }
            ExperimentEvent::Result(results) => {
                self.outcome = Some(SideOutcome::Finished(results));
            }
            ExperimentEvent::Failed(error) => self.outcome = Some(SideOutcome::Failed(error)),
        }
    }

    pub fn code(&self) -> StatusCode {
        match (&self.outcome, self.setup_completed) {
            (Some(_), _) => StatusCode::Completed,
            (None, true) => StatusCode::Training,
            (None, false) => StatusCode::InSetup,
        }
    }

    pub fn failure(&self) -> Option<&str> {
        match &self.outcome {
            Some(SideOutcome::Failed(error)) => Some(error.as_str()),
            _ => None,
        }
    }

    pub fn results(&self) -> Option<&ExperimentResults> {
        match &self.outcome {
            Some(SideOutcome::Finished(results)) => Some(results.as_ref()),
            _ => None,
        }
    }
}

/// Combines both sides. A failure on either side wins; the battle is only
/// complete when both are; otherwise the least advanced side decides, and
/// while training the most recent INFO of either side supplies the times.
pub fn most_significant(records: &[SideRecord; 2], preparing: bool) -> Result<Status, String> {
    if let Some(error) = records.iter().find_map(SideRecord::failure) {
        return Err(error.to_string());
    }
    if preparing {
        return Ok(Status::new(StatusCode::InSetup));
    }
    let code = records
        .iter()
        .map(SideRecord::code)
        .min()
        .unwrap_or(StatusCode::InSetup);
    if code != StatusCode::Training {
        return Ok(Status::new(code));
    }

    let latest = records
        .iter()
        .filter_map(|r| r.last_info.as_ref())
        .max_by_key(|(_, seq)| *seq);
    Ok(Status {
        code,
        time: latest.map(|(info, _)| info.training_time_ns as f64 * 1e-9),
        remaining: latest.and_then(|(info, _)| info.remaining_secs),
    })
}
