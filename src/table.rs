//! Day-record table shared by every pipeline stage, plus its CSV encoding.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::FeatureCatalog;

pub const STAY_DAY_DATE_FORMAT: &str = "%Y-%m-%d";

const DEMOGRAPHIC_COLUMNS: [&str; 4] = ["hadm_id", "age", "gender", "black"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientInfo {
    pub hadm_id: i64,
    pub age: u32,
    /// 1 = male, 0 = otherwise.
    pub gender: u8,
    /// 1 when the admission ethnicity mentions "black".
    pub black: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayRecord {
    pub stay_id: i64,
    pub subject_id: i64,
    pub chart_day: NaiveDate,
    /// One value per catalog feature, in catalog order; NaN when missing.
    pub values: Vec<f64>,
    pub patient: Option<PatientInfo>,
    pub aki: Option<u8>,
}

impl DayRecord {
    pub fn new(stay_id: i64, subject_id: i64, chart_day: NaiveDate, values: Vec<f64>) -> Self {
        Self {
            stay_id,
            subject_id,
            chart_day,
            values,
            patient: None,
            aki: None,
        }
    }

    pub fn stay_day(&self) -> String {
        format_stay_day(self.stay_id, self.chart_day)
    }
}

/// The ordered day records of one ICU stay.
#[derive(Debug, Clone, PartialEq)]
pub struct Stay {
    pub stay_id: i64,
    pub days: Vec<DayRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DayTable {
    pub feature_names: Vec<String>,
    pub rows: Vec<DayRecord>,
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("{path} is missing required column '{column}'")]
    MissingColumn { path: PathBuf, column: String },
    #[error("{path} has only some demographic columns; expected all of hadm_id, age, gender, black")]
    PartialDemographics { path: PathBuf },
    #[error("failed to parse field {field} value '{value}' at line {line}")]
    ParseField {
        field: String,
        value: String,
        line: u64,
    },
    #[error("invalid stay_day key '{0}'")]
    InvalidStayDay(String),
    #[error("stay_day '{stay_day}' does not belong to stay_id {stay_id}")]
    StayIdMismatch { stay_day: String, stay_id: i64 },
    #[error("duplicate day {chart_day} for stay_id {stay_id}")]
    DuplicateStayDay { stay_id: i64, chart_day: NaiveDate },
    #[error("row for stay_day '{stay_day}' has {found} feature values, expected {expected}")]
    FeatureWidthMismatch {
        stay_day: String,
        found: usize,
        expected: usize,
    },
}

impl DayTable {
    pub fn new(feature_names: Vec<String>, rows: Vec<DayRecord>) -> Self {
        Self {
            feature_names,
            rows,
        }
    }

    pub fn stay_count(&self) -> usize {
        let mut ids: Vec<i64> = self.rows.iter().map(|row| row.stay_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    pub fn has_demographics(&self) -> bool {
        !self.rows.is_empty() && self.rows.iter().all(|row| row.patient.is_some())
    }

    pub fn has_labels(&self) -> bool {
        !self.rows.is_empty() && self.rows.iter().all(|row| row.aki.is_some())
    }

    pub fn column_names(&self) -> Vec<String> {
        column_names(
            &self.feature_names,
            self.has_demographics(),
            self.has_labels(),
        )
    }

    /// Splits the table into stays ordered by stay id, each with its days in
    /// calendar order.
    pub fn into_stays(self) -> Result<Vec<Stay>, TableError> {
        let mut rows = self.rows;
        rows.sort_by_key(|row| (row.stay_id, row.chart_day));

        let mut stays: Vec<Stay> = Vec::new();
        for row in rows {
            match stays.last_mut() {
                Some(stay) if stay.stay_id == row.stay_id => {
                    if stay
                        .days
                        .last()
                        .map(|prev| prev.chart_day == row.chart_day)
                        .unwrap_or(false)
                    {
                        return Err(TableError::DuplicateStayDay {
                            stay_id: row.stay_id,
                            chart_day: row.chart_day,
                        });
                    }
                    stay.days.push(row);
                }
                _ => stays.push(Stay {
                    stay_id: row.stay_id,
                    days: vec![row],
                }),
            }
        }

        Ok(stays)
    }

    pub fn from_stays(feature_names: Vec<String>, stays: Vec<Stay>) -> Self {
        let rows = stays.into_iter().flat_map(|stay| stay.days).collect();
        Self::new(feature_names, rows)
    }

    pub fn feature_column(&self, feature_index: usize) -> Vec<f64> {
        self.rows
            .iter()
            .map(|row| row.values[feature_index])
            .collect()
    }
}

pub fn column_names(feature_names: &[String], demographics: bool, labels: bool) -> Vec<String> {
    let mut columns: Vec<String> = feature_names.to_vec();
    columns.extend(
        ["stay_day", "stay_id", "subject_id"]
            .iter()
            .map(|name| name.to_string()),
    );
    if demographics {
        columns.extend(DEMOGRAPHIC_COLUMNS.iter().map(|name| name.to_string()));
    }
    if labels {
        columns.push("aki".to_string());
    }
    columns
}

pub fn format_stay_day(stay_id: i64, chart_day: NaiveDate) -> String {
    format!("{stay_id}_{}", chart_day.format(STAY_DAY_DATE_FORMAT))
}

pub fn parse_stay_day(raw: &str) -> Result<(i64, NaiveDate), TableError> {
    let invalid = || TableError::InvalidStayDay(raw.to_string());
    let (stay_raw, day_raw) = raw.trim().split_once('_').ok_or_else(invalid)?;
    let stay_id = stay_raw.parse::<i64>().map_err(|_| invalid())?;
    let chart_day =
        NaiveDate::parse_from_str(day_raw, STAY_DAY_DATE_FORMAT).map_err(|_| invalid())?;
    Ok((stay_id, chart_day))
}

pub fn read_day_table(path: &Path, catalog: &FeatureCatalog) -> Result<DayTable, TableError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)?;
    let columns = ColumnIndex::from_headers(reader.headers()?, path);

    let feature_idx: Vec<usize> = catalog
        .features()
        .iter()
        .map(|def| columns.require(&def.name))
        .collect::<Result<_, _>>()?;
    let stay_day_idx = columns.require("stay_day")?;
    let stay_id_idx = columns.require("stay_id")?;
    let subject_idx = columns.require("subject_id")?;

    let present: Vec<Option<usize>> = DEMOGRAPHIC_COLUMNS
        .iter()
        .map(|name| columns.get(name))
        .collect();
    let demographic_idx = match present.iter().filter(|idx| idx.is_some()).count() {
        0 => None,
        n if n == DEMOGRAPHIC_COLUMNS.len() => Some(present.into_iter().flatten().collect::<Vec<_>>()),
        _ => {
            return Err(TableError::PartialDemographics {
                path: path.to_path_buf(),
            })
        }
    };
    let aki_idx = columns.get("aki");

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let line = record.position().map(|pos| pos.line()).unwrap_or_default();

        let stay_day = field(&record, stay_day_idx);
        let (key_stay_id, chart_day) = parse_stay_day(stay_day)?;
        let stay_id = parse_i64(&record, stay_id_idx, "stay_id", line)?;
        if key_stay_id != stay_id {
            return Err(TableError::StayIdMismatch {
                stay_day: stay_day.to_string(),
                stay_id,
            });
        }

        let values = feature_idx
            .iter()
            .zip(catalog.features())
            .map(|(idx, def)| parse_value(&record, *idx, &def.name, line))
            .collect::<Result<Vec<_>, _>>()?;

        let mut row = DayRecord::new(
            stay_id,
            parse_i64(&record, subject_idx, "subject_id", line)?,
            chart_day,
            values,
        );

        if let Some(idx) = &demographic_idx {
            row.patient = Some(PatientInfo {
                hadm_id: parse_i64(&record, idx[0], "hadm_id", line)?,
                age: parse_u32(&record, idx[1], "age", line)?,
                gender: parse_flag(&record, idx[2], "gender", line)?,
                black: parse_flag(&record, idx[3], "black", line)?,
            });
        }
        if let Some(idx) = aki_idx {
            row.aki = Some(parse_flag(&record, idx, "aki", line)?);
        }

        rows.push(row);
    }

    Ok(DayTable::new(catalog.feature_names(), rows))
}

pub fn write_day_table(path: &Path, table: &DayTable) -> Result<(), TableError> {
    let demographics = table.has_demographics();
    let labels = table.has_labels();

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(column_names(&table.feature_names, demographics, labels))?;

    let mut rows: Vec<&DayRecord> = table.rows.iter().collect();
    rows.sort_by_key(|row| (row.stay_id, row.chart_day));

    for row in rows {
        if row.values.len() != table.feature_names.len() {
            return Err(TableError::FeatureWidthMismatch {
                stay_day: row.stay_day(),
                found: row.values.len(),
                expected: table.feature_names.len(),
            });
        }

        let mut record: Vec<String> = row.values.iter().map(|v| format_value(*v)).collect();
        record.push(row.stay_day());
        record.push(row.stay_id.to_string());
        record.push(row.subject_id.to_string());
        if let (true, Some(patient)) = (demographics, row.patient) {
            record.push(patient.hadm_id.to_string());
            record.push(patient.age.to_string());
            record.push(patient.gender.to_string());
            record.push(patient.black.to_string());
        }
        if let (true, Some(aki)) = (labels, row.aki) {
            record.push(aki.to_string());
        }
        writer.write_record(&record)?;
    }

    let bytes = writer.into_inner().map_err(|err| {
        TableError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            err.to_string(),
        ))
    })?;
    write_atomic(path, &bytes)
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), TableError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid output path: {}", path.display()),
            )
        })?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

/// Lowercased header name to column position.
pub(crate) struct ColumnIndex {
    path: PathBuf,
    positions: HashMap<String, usize>,
}

impl ColumnIndex {
    pub(crate) fn from_headers(headers: &StringRecord, path: &Path) -> Self {
        let positions = headers
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.trim().to_ascii_lowercase(), idx))
            .collect();
        Self {
            path: path.to_path_buf(),
            positions,
        }
    }

    pub(crate) fn get(&self, column: &str) -> Option<usize> {
        self.positions.get(column).copied()
    }

    pub(crate) fn require(&self, column: &str) -> Result<usize, TableError> {
        self.get(column).ok_or_else(|| TableError::MissingColumn {
            path: self.path.clone(),
            column: column.to_string(),
        })
    }
}

pub(crate) fn field(record: &StringRecord, idx: usize) -> &str {
    record.get(idx).unwrap_or_default().trim()
}

fn parse_error(field: &str, value: &str, line: u64) -> TableError {
    TableError::ParseField {
        field: field.to_string(),
        value: value.to_string(),
        line,
    }
}

pub(crate) fn parse_i64(
    record: &StringRecord,
    idx: usize,
    name: &str,
    line: u64,
) -> Result<i64, TableError> {
    let raw = field(record, idx);
    raw.parse::<i64>().or_else(|_| {
        // Integer ids written by float-typed writers, e.g. "30001.0".
        raw.parse::<f64>()
            .ok()
            .filter(|v| v.fract() == 0.0 && v.abs() < i64::MAX as f64)
            .map(|v| v as i64)
            .ok_or_else(|| parse_error(name, raw, line))
    })
}

pub(crate) fn parse_u32(
    record: &StringRecord,
    idx: usize,
    name: &str,
    line: u64,
) -> Result<u32, TableError> {
    let raw = field(record, idx);
    raw.parse::<u32>().or_else(|_| {
        raw.parse::<f64>()
            .ok()
            .filter(|v| v.fract() == 0.0 && *v >= 0.0 && *v <= u32::MAX as f64)
            .map(|v| v as u32)
            .ok_or_else(|| parse_error(name, raw, line))
    })
}

fn parse_flag(record: &StringRecord, idx: usize, name: &str, line: u64) -> Result<u8, TableError> {
    match parse_u32(record, idx, name, line)? {
        0 => Ok(0),
        1 => Ok(1),
        _ => Err(parse_error(name, field(record, idx), line)),
    }
}

/// Missing values (empty, `nan`) parse as NaN.
pub(crate) fn parse_value(
    record: &StringRecord,
    idx: usize,
    name: &str,
    line: u64,
) -> Result<f64, TableError> {
    let raw = field(record, idx);
    if raw.is_empty() || raw.eq_ignore_ascii_case("nan") {
        return Ok(f64::NAN);
    }
    raw.parse::<f64>().map_err(|_| parse_error(name, raw, line))
}

fn format_value(value: f64) -> String {
    if value.is_finite() {
        value.to_string()
    } else {
        String::new()
    }
}
