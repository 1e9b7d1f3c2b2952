use crate::domain::Ticker;
use crate::pipeline::state::TickerState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct TickerOutcome {
    pub ticker: Ticker,
    pub final_state: TickerState,
    pub rows_written: u64,
    pub events: usize,
    pub dropped_events: usize,
    pub bars: usize,
    pub dropped_bars: usize,
    pub unattached_events: usize,
    /// Social fetch stopped early; sessions from this instant's local day on were held back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated_at: Option<DateTime<Utc>>,
    /// State the ticker was in when it failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_in: Option<TickerState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TickerOutcome {
    pub fn new(ticker: Ticker) -> Self {
        Self {
            ticker,
            final_state: TickerState::Pending,
            rows_written: 0,
            events: 0,
            dropped_events: 0,
            bars: 0,
            dropped_bars: 0,
            unattached_events: 0,
            truncated_at: None,
            failed_in: None,
            error: None,
        }
    }

    pub fn skipped(ticker: Ticker) -> Self {
        Self {
            final_state: TickerState::Skipped,
            error: Some("run deadline passed before start".to_string()),
            ..Self::new(ticker)
        }
    }

    pub fn succeeded(&self) -> bool {
        self.final_state == TickerState::Done
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

/// Final report of one orchestrator run. Per-ticker failures live here, they never abort the run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<TickerOutcome>,
}

impl RunSummary {
    pub fn status(&self) -> RunStatus {
        let ok = self.outcomes.iter().filter(|o| o.succeeded()).count();
        if ok == self.outcomes.len() {
            RunStatus::Success
        } else if ok == 0 {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        }
    }

    pub fn outcome(&self, ticker: &Ticker) -> Option<&TickerOutcome> {
        self.outcomes.iter().find(|o| &o.ticker == ticker)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TickerOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded())
    }

    pub fn rows_written(&self) -> u64 {
        self.outcomes.iter().map(|o| o.rows_written).sum()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
