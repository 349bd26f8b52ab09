//! Per-question state machine
//!
//! `Received → Decomposing → Executing → Stitching → Validating →
//! Synthesizing → Complete`, with `Failed` reachable from any state.
//! Stitching and validating are entered per sub-query as the DAG drains,
//! not once for the whole question.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionState {
    Received,
    Decomposing,
    Executing,
    Stitching,
    Validating,
    Synthesizing,
    Complete,
    Failed,
}

impl fmt::Display for QuestionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QuestionState::Received => "received",
            QuestionState::Decomposing => "decomposing",
            QuestionState::Executing => "executing",
            QuestionState::Stitching => "stitching",
            QuestionState::Validating => "validating",
            QuestionState::Synthesizing => "synthesizing",
            QuestionState::Complete => "complete",
            QuestionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks one question's progress through the state machine
#[derive(Debug)]
pub struct QuestionTicket {
    pub question_id: Uuid,
    pub state: QuestionState,
}

impl QuestionTicket {
    pub fn new(question_id: Uuid) -> Self {
        info!(question_id = %question_id, state = %QuestionState::Received, "Question state");
        Self {
            question_id,
            state: QuestionState::Received,
        }
    }

    pub fn advance(&mut self, next: QuestionState) {
        info!(
            question_id = %self.question_id,
            from = %self.state,
            to = %next,
            "Question state"
        );
        self.state = next;
    }
}
