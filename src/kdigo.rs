//! KDIGO serum-creatinine criteria for acute kidney injury.
//!
//! Criterion 1: a rise of at least 0.3 mg/dL, evaluated between consecutive
//! days. Criterion 2: a level of at least 1.5 times the demographic baseline.
//! The urine-output criterion is not evaluated.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::table::PatientInfo;

pub const CREATININE_RISE_THRESHOLD: f64 = 0.3;
pub const BASELINE_MULTIPLIER: f64 = 1.5;
pub const MIN_BASELINE_AGE: u32 = 20;

/// `(first age, last age, [black male, black female, other male, other female])`
const BASELINE_TABLE: [(u32, u32, [f64; 4]); 5] = [
    (20, 24, [1.5, 1.2, 1.3, 1.0]),
    (25, 29, [1.5, 1.1, 1.2, 1.0]),
    (30, 39, [1.4, 1.1, 1.2, 0.9]),
    (40, 54, [1.3, 1.0, 1.1, 0.9]),
    (55, u32::MAX, [1.2, 0.9, 1.0, 0.8]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Demographics {
    pub black: bool,
    pub age: u32,
    pub male: bool,
}

impl From<PatientInfo> for Demographics {
    fn from(info: PatientInfo) -> Self {
        Self {
            black: info.black == 1,
            age: info.age,
            male: info.gender == 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KdigoError {
    #[error("no creatinine baseline for age {age} (table starts at 20)")]
    AgeBelowBaselineTable { age: u32 },
}

/// One AKI evaluation: either a day-over-day creatinine change or an absolute
/// creatinine level judged against the patient's baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AkiCheck {
    Difference(f64),
    Absolute { scr: f64, demographics: Demographics },
}

impl AkiCheck {
    pub fn has_aki(&self) -> Result<bool, KdigoError> {
        match *self {
            Self::Difference(diff) => Ok(diff >= CREATININE_RISE_THRESHOLD),
            Self::Absolute { scr, demographics } => {
                Ok(scr >= BASELINE_MULTIPLIER * baseline_creatinine(&demographics)?)
            }
        }
    }
}

/// Estimated pre-injury serum creatinine (mg/dL).
pub fn baseline_creatinine(demographics: &Demographics) -> Result<f64, KdigoError> {
    let row = BASELINE_TABLE
        .iter()
        .find(|(first, last, _)| (*first..=*last).contains(&demographics.age))
        .ok_or(KdigoError::AgeBelowBaselineTable {
            age: demographics.age,
        })?;

    let column = match (demographics.black, demographics.male) {
        (true, true) => 0,
        (true, false) => 1,
        (false, true) => 2,
        (false, false) => 3,
    };
    Ok(row.2[column])
}
