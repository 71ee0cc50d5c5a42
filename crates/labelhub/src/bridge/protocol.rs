//! Wire protocol types for parent-child communication.
//!
//! Two channels:
//! - **Worker channel** (stdin/stdout, bidirectional): INIT, REQUEST, ADD, REMOVE, STOP
//! - **Experiment channel** (stdin for the init frame, then stdout only): SETUP_COMPLETED,
//!   INFO, RESULT, FAILED

use serde::{Deserialize, Serialize};

use crate::battle::results::ExperimentResults;
use crate::config::{ActiveLearningConfig, AlBattleConfig};
use crate::dataset::{Dataset, LabelId, SampleId};

/// Messages on the label worker channel.
///
/// The parent sends every variant. The worker only ever answers with
/// `Request { sample_ids: Some(..) }`; anything else arriving at the parent is a
/// protocol error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerEvent {
    /// Must be the first frame on a fresh channel.
    Init {
        config: ActiveLearningConfig,
        dataset: Dataset,
    },

    /// `None` asks the worker to compute a batch; `Some` carries the answer.
    Request {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sample_ids: Option<Vec<SampleId>>,
    },

    Add {
        sample_id: SampleId,
        label_id: LabelId,
    },

    Remove {
        sample_id: SampleId,
        label_id: LabelId,
    },

    Stop,
}

impl WorkerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "INIT",
            Self::Request { .. } => "REQUEST",
            Self::Add { .. } => "ADD",
            Self::Remove { .. } => "REMOVE",
            Self::Stop => "STOP",
        }
    }
}

/// Which half of a battle an experiment process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    One,
    Two,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::One, Side::Two];

    pub fn index(self) -> usize {
        match self {
            Self::One => 0,
            Self::Two => 1,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.index() + 1)
    }
}

/// First and only frame the parent writes to an experiment process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentInit {
    pub side: Side,
    pub config: AlBattleConfig,
    pub dataset: Dataset,
    /// Classification-boundary raster, one feature vector per row.
    pub cb_sample: Vec<Vec<f64>>,
}

/// Progress report for one training iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingInfo {
    pub training_time_ns: u64,
    /// Extrapolated time until the stopping criterion is met.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_secs: Option<f64>,
}

/// Events streamed by an experiment process, in order:
/// SETUP_COMPLETED, INFO*, then exactly one of RESULT or FAILED.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentEvent {
    SetupCompleted,
    Info(TrainingInfo),
    Result(Box<ExperimentResults>),
    Failed(String),
}

impl ExperimentEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result(_) | Self::Failed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_request_serializes() {
        insta::assert_json_snapshot!(WorkerEvent::Request { sample_ids: None }, @r#"
        {
          "event": "REQUEST"
        }
        "#);
    }

    #[test]
    fn worker_request_answer_serializes() {
        let resp = WorkerEvent::Request {
            sample_ids: Some(vec![SampleId(3), SampleId(4)]),
        };
        insta::assert_json_snapshot!(resp, @r#"
        {
          "event": "REQUEST",
          "sample_ids": [
            3,
            4
          ]
        }
        "#);
    }

    #[test]
    fn worker_add_serializes() {
        let req = WorkerEvent::Add {
            sample_id: SampleId(12),
            label_id: LabelId(2),
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "event": "ADD",
          "sample_id": 12,
          "label_id": 2
        }
        "#);
    }

    #[test]
    fn worker_remove_serializes() {
        let req = WorkerEvent::Remove {
            sample_id: SampleId(12),
            label_id: LabelId(2),
        };
        insta::assert_json_snapshot!(req, @r#"
        {
          "event": "REMOVE",
          "sample_id": 12,
          "label_id": 2
        }
        "#);
    }

    #[test]
    fn worker_stop_serializes() {
        insta::assert_json_snapshot!(WorkerEvent::Stop, @r#"
        {
          "event": "STOP"
        }
        "#);
    }

    #[test]
    fn worker_request_deserializes_without_ids() {
        let event: WorkerEvent = serde_json::from_str(r#"{"event": "REQUEST"}"#).unwrap();
        assert_eq!(event, WorkerEvent::Request { sample_ids: None });
        assert_eq!(event.kind(), "REQUEST");
    }

    #[test]
    fn experiment_setup_completed_serializes() {
        insta::assert_json_snapshot!(ExperimentEvent::SetupCompleted, @r#"
        {
          "type": "SETUP_COMPLETED"
        }
        "#);
    }

    #[test]
    fn experiment_failed_serializes() {
        let event = ExperimentEvent::Failed("model exploded".to_string());
        insta::assert_json_snapshot!(event, @r#"
        {
          "type": "FAILED",
          "value": "model exploded"
        }
        "#);
        assert!(event.is_terminal());
    }

    #[test]
    fn experiment_info_serializes() {
        let event = ExperimentEvent::Info(TrainingInfo {
            training_time_ns: 4200,
            remaining_secs: None,
        });
        insta::assert_json_snapshot!(event, @r#"
        {
          "type": "INFO",
          "value": {
            "training_time_ns": 4200
          }
        }
        "#);
        assert!(!event.is_terminal());
    }

    #[test]
    fn side_serializes_snake_case() {
        insta::assert_json_snapshot!(Side::BOTH, @r#"
        [
          "one",
          "two"
        ]
        "#);
        assert_eq!(Side::Two.index(), 1);
        assert_eq!(Side::One.to_string(), "1");
    }
}
