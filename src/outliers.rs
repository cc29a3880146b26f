//! Outlier Clipper: global per-feature winsorization.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::report::{capped_stay_ids, FeatureBounds, Stage, StageReport};
use crate::table::DayTable;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClipConfig {
    pub lower_quantile: f64,
    pub upper_quantile: f64,
}

impl Default for ClipConfig {
    fn default() -> Self {
        Self {
            lower_quantile: 0.01,
            upper_quantile: 0.99,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ClipError {
    #[error("invalid clip quantiles: lower {lower}, upper {upper}")]
    InvalidQuantiles { lower: f64, upper: f64 },
}

impl ClipConfig {
    pub fn validate(&self) -> Result<(), ClipError> {
        let (lower, upper) = (self.lower_quantile, self.upper_quantile);
        if (0.0..=1.0).contains(&lower) && (0.0..=1.0).contains(&upper) && lower <= upper {
            Ok(())
        } else {
            Err(ClipError::InvalidQuantiles { lower, upper })
        }
    }
}

/// Quantile of ascending `sorted` with linear interpolation between the two
/// nearest ranks (`q * (n - 1)`).
pub fn quantile_linear(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Lower and upper bound of one column; missing values are ignored.
pub fn feature_bounds(values: &[f64], cfg: &ClipConfig) -> Option<(f64, f64)> {
    let mut finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    finite.sort_by(f64::total_cmp);
    Some((
        quantile_linear(&finite, cfg.lower_quantile)?,
        quantile_linear(&finite, cfg.upper_quantile)?,
    ))
}

pub fn clip_outliers(
    mut table: DayTable,
    cfg: &ClipConfig,
) -> Result<(DayTable, StageReport), ClipError> {
    cfg.validate()?;
    let mut report = StageReport::new(Stage::Outliers, &table);
    info!(
        component = "outliers",
        event = "outliers.start",
        rows = report.input_rows,
        lower_quantile = cfg.lower_quantile,
        upper_quantile = cfg.upper_quantile
    );

    // Every bound comes from the unclipped table.
    let bounds: Vec<Option<(f64, f64)>> = (0..table.feature_names.len())
        .map(|idx| feature_bounds(&table.feature_column(idx), cfg))
        .collect();

    for (idx, feature) in table.feature_names.iter().enumerate() {
        let mut entry = FeatureBounds {
            feature: feature.clone(),
            lower: bounds[idx].map(|(lower, _)| lower),
            upper: bounds[idx].map(|(_, upper)| upper),
            clipped_low: 0,
            clipped_high: 0,
            stays_with_low_outliers: Vec::new(),
            stays_with_high_outliers: Vec::new(),
        };

        if let Some((lower, upper)) = bounds[idx] {
            let mut low_stays = Vec::new();
            let mut high_stays = Vec::new();
            for row in &mut table.rows {
                let value = &mut row.values[idx];
                if *value > upper {
                    *value = upper;
                    entry.clipped_high += 1;
                    high_stays.push(row.stay_id);
                } else if *value < lower {
                    *value = lower;
                    entry.clipped_low += 1;
                    low_stays.push(row.stay_id);
                }
            }
            entry.stays_with_low_outliers = capped_stay_ids(low_stays);
            entry.stays_with_high_outliers = capped_stay_ids(high_stays);
        }

        info!(
            component = "outliers",
            event = "outliers.feature.bounds",
            feature = %entry.feature,
            lower = ?entry.lower,
            upper = ?entry.upper,
            clipped_low = entry.clipped_low,
            clipped_high = entry.clipped_high
        );
        report.bounds.push(entry);
    }

    report.finish(&table);
    info!(
        component = "outliers",
        event = "outliers.finish",
        rows = report.output_rows,
        clipped = report
            .bounds
            .iter()
            .map(|b| b.clipped_low + b.clipped_high)
            .sum::<u64>()
    );
    Ok((table, report))
}
