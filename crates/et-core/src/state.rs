use serde::{Deserialize, Serialize};

/// The four-value state every pipeline entity carries.
///
/// `pending -> processing -> {finished_successfully, failed}` is the only
/// legal progression (`pending -> failed` is also legal). No transition
/// leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Pending,
    Processing,
    FinishedSuccessfully,
    Failed,
}

impl ProcessingState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessingState::FinishedSuccessfully | ProcessingState::Failed
        )
    }
}

impl Default for ProcessingState {
    fn default() -> Self {
        ProcessingState::Pending
    }
}

impl std::fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessingState::Pending => "pending",
            ProcessingState::Processing => "processing",
            ProcessingState::FinishedSuccessfully => "finished_successfully",
            ProcessingState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_matches_spec() {
        assert_eq!(
            serde_json::to_string(&ProcessingState::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(
            serde_json::to_string(&ProcessingState::FinishedSuccessfully).unwrap(),
            "\"finished_successfully\""
        );
    }

    #[test]
    fn terminal_states() {
        assert!(!ProcessingState::Pending.is_terminal());
        assert!(!ProcessingState::Processing.is_terminal());
        assert!(ProcessingState::FinishedSuccessfully.is_terminal());
        assert!(ProcessingState::Failed.is_terminal());
    }
}
