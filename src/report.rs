//! Stage identifiers and the per-stay decisions each stage reports.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::table::{DayRecord, DayTable, Stay};

const MAX_REPORTED_STAYS: usize = 256;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Partition,
    Impute,
    Demographics,
    Label,
    Outliers,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Partition,
        Stage::Impute,
        Stage::Demographics,
        Stage::Label,
        Stage::Outliers,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Partition => "partition",
            Self::Impute => "impute",
            Self::Demographics => "demographics",
            Self::Label => "label",
            Self::Outliers => "outliers",
        }
    }

    /// The stage whose output this stage consumes.
    pub fn previous(self) -> Option<Stage> {
        match self {
            Self::Partition => None,
            Self::Impute => Some(Self::Partition),
            Self::Demographics => Some(Self::Impute),
            Self::Label => Some(Self::Demographics),
            Self::Outliers => Some(Self::Label),
        }
    }

    pub fn output_file_name(self) -> &'static str {
        match self {
            Self::Partition => "events_partitioned.csv",
            Self::Impute => "events_imputed.csv",
            Self::Demographics => "events_with_demographics.csv",
            Self::Label => "events_with_labels.csv",
            Self::Outliers => "events_complete.csv",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    TooFewDays { days: usize },
    NoCreatinineAfter48h,
    MissingCreatinineDay3,
    FeatureNeverObserved { feature: String },
    BelowMinimumAge { age: u32 },
    AkiWithin48h,
}

impl DropReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::TooFewDays { .. } => "too_few_days",
            Self::NoCreatinineAfter48h => "no_creatinine_after_48h",
            Self::MissingCreatinineDay3 => "missing_creatinine_day3",
            Self::FeatureNeverObserved { .. } => "feature_never_observed",
            Self::BelowMinimumAge { .. } => "below_minimum_age",
            Self::AkiWithin48h => "aki_within_48h",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncateReason {
    MissingCreatinine { day_index: usize },
    MaxDays { max_days: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StayDecision {
    Dropped {
        stay_id: i64,
        reason: DropReason,
    },
    Truncated {
        stay_id: i64,
        reason: TruncateReason,
        from_days: usize,
        to_days: usize,
    },
}

impl StayDecision {
    pub fn stay_id(&self) -> i64 {
        match self {
            Self::Dropped { stay_id, .. } | Self::Truncated { stay_id, .. } => *stay_id,
        }
    }

    pub fn is_drop(&self) -> bool {
        matches!(self, Self::Dropped { .. })
    }
}

/// Result of running one stay through a per-stay stage. Dropped stays come
/// back with no days.
#[derive(Debug, Clone, PartialEq)]
pub struct StayOutcome {
    pub stay_id: i64,
    pub days: Vec<DayRecord>,
    pub decisions: Vec<StayDecision>,
}

impl StayOutcome {
    pub fn kept(stay: Stay) -> Self {
        Self {
            stay_id: stay.stay_id,
            days: stay.days,
            decisions: Vec::new(),
        }
    }

    pub fn dropped(stay_id: i64, reason: DropReason) -> Self {
        Self {
            stay_id,
            days: Vec::new(),
            decisions: vec![StayDecision::Dropped { stay_id, reason }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureBounds {
    pub feature: String,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub clipped_low: u64,
    pub clipped_high: u64,
    pub stays_with_low_outliers: Vec<i64>,
    pub stays_with_high_outliers: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    pub input_rows: u64,
    pub output_rows: u64,
    pub input_stays: u64,
    pub output_stays: u64,
    pub dropped_stays: u64,
    pub truncated_stays: u64,
    pub decisions: Vec<StayDecision>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bounds: Vec<FeatureBounds>,
}

impl StageReport {
    pub fn new(stage: Stage, input: &DayTable) -> Self {
        let input_rows = input.rows.len() as u64;
        let input_stays = input.stay_count() as u64;
        Self {
            stage,
            input_rows,
            output_rows: input_rows,
            input_stays,
            output_stays: input_stays,
            dropped_stays: 0,
            truncated_stays: 0,
            decisions: Vec::new(),
            bounds: Vec::new(),
        }
    }

    pub fn record(&mut self, decision: StayDecision) {
        log_decision(self.stage, &decision);
        if decision.is_drop() {
            self.dropped_stays += 1;
        } else {
            self.truncated_stays += 1;
        }
        self.decisions.push(decision);
    }

    pub fn finish(&mut self, output: &DayTable) {
        self.output_rows = output.rows.len() as u64;
        self.output_stays = output.stay_count() as u64;
    }
}

/// Concatenates per-stay outcomes (in stay order) into the stage's output
/// table and records every decision on `report`.
pub fn collect_outcomes(
    mut report: StageReport,
    feature_names: Vec<String>,
    outcomes: Vec<StayOutcome>,
) -> (DayTable, StageReport) {
    let mut rows = Vec::with_capacity(report.input_rows as usize);
    for outcome in outcomes {
        for decision in outcome.decisions {
            report.record(decision);
        }
        rows.extend(outcome.days);
    }

    let output = DayTable::new(feature_names, rows);
    report.finish(&output);
    (output, report)
}

pub(crate) fn capped_stay_ids(mut stay_ids: Vec<i64>) -> Vec<i64> {
    stay_ids.sort_unstable();
    stay_ids.dedup();
    stay_ids.truncate(MAX_REPORTED_STAYS);
    stay_ids
}

fn log_decision(stage: Stage, decision: &StayDecision) {
    match decision {
        StayDecision::Dropped { stay_id, reason } => warn!(
            component = "pipeline",
            event = "stay.dropped",
            stage = stage.as_str(),
            stay_id = *stay_id,
            reason = reason.code(),
            details = ?reason
        ),
        StayDecision::Truncated {
            stay_id,
            reason,
            from_days,
            to_days,
        } => warn!(
            component = "pipeline",
            event = "stay.truncated",
            stage = stage.as_str(),
            stay_id = *stay_id,
            reason = ?reason,
            from_days = *from_days,
            to_days = *to_days
        ),
    }
}
