//! Stay Imputer: structural drop/truncate rules and per-stay gap filling.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::FeatureCatalog;
use crate::report::{
    collect_outcomes, DropReason, Stage, StageReport, StayDecision, StayOutcome, TruncateReason,
};
use crate::table::{DayTable, Stay, TableError};

pub const MIN_STAY_DAYS: usize = 3;
/// First day index past the initial 48 hours.
pub const FIRST_POST_WINDOW_DAY: usize = 2;

/// What to do with a retained stay whose creatinine is missing on day 0 or 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarlyCreatininePolicy {
    /// Abort the stage.
    Strict,
    /// Log it and let the forward/backward fill close the gap.
    Fill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImputeConfig {
    pub early_creatinine: EarlyCreatininePolicy,
}

impl Default for ImputeConfig {
    fn default() -> Self {
        Self {
            early_creatinine: EarlyCreatininePolicy::Strict,
        }
    }
}

#[derive(Debug, Error)]
pub enum ImputeError {
    #[error("stay {stay_id} has no creatinine on day index {day_index}")]
    MissingEarlyCreatinine { stay_id: i64, day_index: usize },
    #[error(transparent)]
    Table(#[from] TableError),
}

/// Index of the first non-finite value at or after `start`.
pub fn first_missing_from(values: &[f64], start: usize) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .skip(start)
        .find(|(_, v)| !v.is_finite())
        .map(|(idx, _)| idx)
}

/// Forward fill, then backward fill for any leading gap. A column with no
/// finite value is left untouched.
pub fn forward_backward_fill(values: &mut [f64]) -> usize {
    let mut filled = 0;

    let mut last = None;
    for value in values.iter_mut() {
        if value.is_finite() {
            last = Some(*value);
        } else if let Some(prev) = last {
            *value = prev;
            filled += 1;
        }
    }

    let mut next = None;
    for value in values.iter_mut().rev() {
        if value.is_finite() {
            next = Some(*value);
        } else if let Some(following) = next {
            *value = following;
            filled += 1;
        }
    }

    filled
}

pub fn impute_stay(
    stay: Stay,
    catalog: &FeatureCatalog,
    cfg: &ImputeConfig,
) -> Result<StayOutcome, ImputeError> {
    let stay_id = stay.stay_id;
    let mut days = stay.days;
    let mut decisions = Vec::new();

    if days.len() < MIN_STAY_DAYS {
        return Ok(StayOutcome::dropped(
            stay_id,
            DropReason::TooFewDays { days: days.len() },
        ));
    }

    let cr = catalog.creatinine_index();
    let creatinine: Vec<f64> = days.iter().map(|day| day.values[cr]).collect();

    if !creatinine[FIRST_POST_WINDOW_DAY..]
        .iter()
        .any(|v| v.is_finite())
    {
        return Ok(StayOutcome::dropped(
            stay_id,
            DropReason::NoCreatinineAfter48h,
        ));
    }

    match first_missing_from(&creatinine, FIRST_POST_WINDOW_DAY) {
        Some(FIRST_POST_WINDOW_DAY) => {
            return Ok(StayOutcome::dropped(
                stay_id,
                DropReason::MissingCreatinineDay3,
            ));
        }
        Some(day_index) => {
            decisions.push(StayDecision::Truncated {
                stay_id,
                reason: TruncateReason::MissingCreatinine { day_index },
                from_days: days.len(),
                to_days: day_index,
            });
            days.truncate(day_index);
        }
        None => {}
    }

    for (feature_index, def) in catalog.features().iter().enumerate() {
        if !days.iter().any(|day| day.values[feature_index].is_finite()) {
            return Ok(StayOutcome::dropped(
                stay_id,
                DropReason::FeatureNeverObserved {
                    feature: def.name.clone(),
                },
            ));
        }
    }

    for day_index in 0..FIRST_POST_WINDOW_DAY {
        if days[day_index].values[cr].is_finite() {
            continue;
        }
        match cfg.early_creatinine {
            EarlyCreatininePolicy::Strict => {
                return Err(ImputeError::MissingEarlyCreatinine { stay_id, day_index });
            }
            EarlyCreatininePolicy::Fill => debug!(
                component = "impute",
                event = "impute.early_creatinine.filled",
                stay_id,
                day_index
            ),
        }
    }

    let mut filled = 0;
    for feature_index in 0..catalog.len() {
        let mut column: Vec<f64> = days.iter().map(|day| day.values[feature_index]).collect();
        filled += forward_backward_fill(&mut column);
        for (day, value) in days.iter_mut().zip(column) {
            day.values[feature_index] = value;
        }
    }
    if filled > 0 {
        debug!(
            component = "impute",
            event = "impute.stay.filled",
            stay_id,
            filled
        );
    }

    Ok(StayOutcome {
        stay_id,
        days,
        decisions,
    })
}

pub fn impute_table(
    table: DayTable,
    catalog: &FeatureCatalog,
    cfg: &ImputeConfig,
) -> Result<(DayTable, StageReport), ImputeError> {
    let report = StageReport::new(Stage::Impute, &table);
    info!(
        component = "impute",
        event = "impute.start",
        rows = report.input_rows,
        stays = report.input_stays,
        early_creatinine = ?cfg.early_creatinine
    );

    let feature_names = table.feature_names.clone();
    let outcomes = table
        .into_stays()?
        .into_par_iter()
        .map(|stay| impute_stay(stay, catalog, cfg))
        .collect::<Result<Vec<_>, _>>()?;

    let (output, report) = collect_outcomes(report, feature_names, outcomes);
    info!(
        component = "impute",
        event = "impute.finish",
        rows = report.output_rows,
        stays = report.output_stays,
        dropped = report.dropped_stays,
        truncated = report.truncated_stays
    );

    Ok((output, report))
}
