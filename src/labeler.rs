//! AKI Labeler: next-day KDIGO labels per stay.
//!
//! Day `i` is positive when day `i + 1` shows AKI, either by the creatinine
//! rise from day `i` or by the absolute level on day `i + 1`. Day 0 is always
//! negative. Stays with AKI inside the first 48 hours, or patients below the
//! baseline table's age range, are dropped. The last day of each stay has no
//! next day and is removed; the rest is capped at `max_days`.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::catalog::FeatureCatalog;
use crate::kdigo::{AkiCheck, Demographics, KdigoError, MIN_BASELINE_AGE};
use crate::report::{
    collect_outcomes, DropReason, Stage, StageReport, StayDecision, StayOutcome, TruncateReason,
};
use crate::table::{DayTable, Stay, TableError};

/// Timesteps kept per stay for the sequence model.
pub const DEFAULT_MAX_DAYS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelConfig {
    pub max_days: usize,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            max_days: DEFAULT_MAX_DAYS,
        }
    }
}

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("stay {stay_id} reached the labeler without demographics")]
    MissingDemographics { stay_id: i64 },
    #[error("stay {stay_id} has no creatinine on day index {day_index}")]
    MissingCreatinine { stay_id: i64, day_index: usize },
    #[error("stay {stay_id} has {days} day(s); at least 2 are needed to label")]
    TooFewDays { stay_id: i64, days: usize },
    #[error(transparent)]
    Kdigo(#[from] KdigoError),
    #[error(transparent)]
    Table(#[from] TableError),
}

/// AKI on day 0 or day 1, or in the rise between them.
pub fn aki_within_first_48h(scr: &[f64], demographics: Demographics) -> Result<bool, KdigoError> {
    let checks = [
        AkiCheck::Difference(scr[1] - scr[0]),
        AkiCheck::Absolute {
            scr: scr[0],
            demographics,
        },
        AkiCheck::Absolute {
            scr: scr[1],
            demographics,
        },
    ];
    for check in checks {
        if check.has_aki()? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Labels for days `0..scr.len() - 1`.
pub fn next_day_labels(scr: &[f64], demographics: Demographics) -> Result<Vec<u8>, KdigoError> {
    let mut labels = Vec::with_capacity(scr.len().saturating_sub(1));
    if scr.len() < 2 {
        return Ok(labels);
    }

    labels.push(0);
    for window in scr.windows(2).skip(1) {
        let rise = AkiCheck::Difference(window[1] - window[0]).has_aki()?;
        let level = AkiCheck::Absolute {
            scr: window[1],
            demographics,
        }
        .has_aki()?;
        labels.push(u8::from(rise || level));
    }
    Ok(labels)
}

pub fn label_stay(
    stay: Stay,
    catalog: &FeatureCatalog,
    cfg: &LabelConfig,
) -> Result<StayOutcome, LabelError> {
    let stay_id = stay.stay_id;
    let mut days = stay.days;
    if days.len() < 2 {
        return Err(LabelError::TooFewDays {
            stay_id,
            days: days.len(),
        });
    }

    let demographics: Demographics = days[0]
        .patient
        .ok_or(LabelError::MissingDemographics { stay_id })?
        .into();

    let cr = catalog.creatinine_index();
    let scr: Vec<f64> = days.iter().map(|day| day.values[cr]).collect();
    if let Some(day_index) = scr.iter().position(|v| !v.is_finite()) {
        return Err(LabelError::MissingCreatinine { stay_id, day_index });
    }

    if demographics.age < MIN_BASELINE_AGE {
        return Ok(StayOutcome::dropped(
            stay_id,
            DropReason::BelowMinimumAge {
                age: demographics.age,
            },
        ));
    }

    if aki_within_first_48h(&scr, demographics)? {
        return Ok(StayOutcome::dropped(stay_id, DropReason::AkiWithin48h));
    }

    let labels = next_day_labels(&scr, demographics)?;
    days.truncate(labels.len());
    for (day, label) in days.iter_mut().zip(labels) {
        day.aki = Some(label);
    }

    let mut decisions = Vec::new();
    if days.len() > cfg.max_days {
        decisions.push(StayDecision::Truncated {
            stay_id,
            reason: TruncateReason::MaxDays {
                max_days: cfg.max_days,
            },
            from_days: days.len(),
            to_days: cfg.max_days,
        });
        days.truncate(cfg.max_days);
    }

    Ok(StayOutcome {
        stay_id,
        days,
        decisions,
    })
}

pub fn label_table(
    table: DayTable,
    catalog: &FeatureCatalog,
    cfg: &LabelConfig,
) -> Result<(DayTable, StageReport), LabelError> {
    let report = StageReport::new(Stage::Label, &table);
    info!(
        component = "labeler",
        event = "labeler.start",
        rows = report.input_rows,
        stays = report.input_stays,
        max_days = cfg.max_days
    );

    let feature_names = table.feature_names.clone();
    let outcomes = table
        .into_stays()?
        .into_par_iter()
        .map(|stay| label_stay(stay, catalog, cfg))
        .collect::<Result<Vec<_>, _>>()?;

    let (output, report) = collect_outcomes(report, feature_names, outcomes);
    let positives = output
        .rows
        .iter()
        .filter(|row| row.aki == Some(1))
        .count();
    info!(
        component = "labeler",
        event = "labeler.finish",
        rows = report.output_rows,
        stays = report.output_stays,
        dropped = report.dropped_stays,
        truncated = report.truncated_stays,
        positive_days = positives
    );

    Ok((output, report))
}
