use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one ticker within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TickerState {
    Pending,
    FetchingSocial,
    FetchingMarket,
    Aligning,
    Persisting,
    Done,
    Failed,
    /// Never started because the run deadline had already passed.
    Skipped,
}

impl TickerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }

    pub fn can_transition_to(self, next: TickerState) -> bool {
        use TickerState::*;
        matches!(
            (self, next),
            (Pending, FetchingSocial)
                | (Pending, Skipped)
                | (FetchingSocial, FetchingMarket)
                // Empty window: nothing to fetch, nothing to persist.
                | (FetchingSocial, Done)
                | (FetchingSocial, Failed)
                | (FetchingMarket, Aligning)
                | (FetchingMarket, Failed)
                | (Aligning, Persisting)
                | (Aligning, Failed)
                | (Persisting, Done)
                | (Persisting, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::FetchingSocial => "FETCHING_SOCIAL",
            Self::FetchingMarket => "FETCHING_MARKET",
            Self::Aligning => "ALIGNING",
            Self::Persisting => "PERSISTING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for TickerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
