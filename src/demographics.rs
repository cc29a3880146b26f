//! Demographic Joiner: stay → admission → patient lookups.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;
use tracing::info;

use crate::report::{Stage, StageReport};
use crate::table::{field, parse_i64, parse_u32, ColumnIndex, DayTable, PatientInfo, TableError};

#[derive(Debug, Error)]
pub enum DemographicsError {
    #[error("no admission found for stay_id {stay_id}")]
    MissingAdmission { stay_id: i64 },
    #[error("no ethnicity found for hadm_id {hadm_id}")]
    MissingEthnicity { hadm_id: i64 },
    #[error("no patient record found for subject_id {subject_id}")]
    MissingPatient { subject_id: i64 },
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRecord {
    pub hadm_id: i64,
    pub ethnicity: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcuStayRecord {
    pub stay_id: i64,
    pub hadm_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientRecord {
    pub subject_id: i64,
    pub gender: String,
    pub anchor_age: u32,
}

/// Key → value maps built once from the reference tables.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTables {
    stay_to_hadm: HashMap<i64, i64>,
    hadm_to_ethnicity: HashMap<i64, String>,
    subject_to_gender: HashMap<i64, String>,
    subject_to_age: HashMap<i64, u32>,
}

impl ReferenceTables {
    pub fn from_records(
        admissions: impl IntoIterator<Item = AdmissionRecord>,
        icustays: impl IntoIterator<Item = IcuStayRecord>,
        patients: impl IntoIterator<Item = PatientRecord>,
    ) -> Self {
        let mut tables = Self::default();
        for adm in admissions {
            tables.hadm_to_ethnicity.insert(adm.hadm_id, adm.ethnicity);
        }
        for icu in icustays {
            tables.stay_to_hadm.insert(icu.stay_id, icu.hadm_id);
        }
        for patient in patients {
            tables
                .subject_to_gender
                .insert(patient.subject_id, patient.gender);
            tables
                .subject_to_age
                .insert(patient.subject_id, patient.anchor_age);
        }
        tables
    }

    pub fn load(
        admissions: &Path,
        icustays: &Path,
        patients: &Path,
    ) -> Result<Self, DemographicsError> {
        let tables = Self::from_records(
            read_admissions(admissions)?,
            read_icustays(icustays)?,
            read_patients(patients)?,
        );
        info!(
            component = "demographics",
            event = "demographics.references.loaded",
            admissions = tables.hadm_to_ethnicity.len(),
            icustays = tables.stay_to_hadm.len(),
            patients = tables.subject_to_age.len()
        );
        Ok(tables)
    }

    pub fn patient_info(
        &self,
        stay_id: i64,
        subject_id: i64,
    ) -> Result<PatientInfo, DemographicsError> {
        let hadm_id = *self
            .stay_to_hadm
            .get(&stay_id)
            .ok_or(DemographicsError::MissingAdmission { stay_id })?;
        let ethnicity = self
            .hadm_to_ethnicity
            .get(&hadm_id)
            .ok_or(DemographicsError::MissingEthnicity { hadm_id })?;
        let missing_patient = || DemographicsError::MissingPatient { subject_id };
        let gender = self
            .subject_to_gender
            .get(&subject_id)
            .ok_or_else(missing_patient)?;
        let age = *self
            .subject_to_age
            .get(&subject_id)
            .ok_or_else(missing_patient)?;

        Ok(PatientInfo {
            hadm_id,
            age,
            gender: gender_flag(gender),
            black: u8::from(is_black(ethnicity)),
        })
    }
}

pub fn is_black(ethnicity: &str) -> bool {
    ethnicity.to_lowercase().contains("black")
}

pub fn gender_flag(code: &str) -> u8 {
    let code = code.trim();
    u8::from(code.eq_ignore_ascii_case("m") || code.eq_ignore_ascii_case("male"))
}

pub fn attach_demographics(
    mut table: DayTable,
    references: &ReferenceTables,
) -> Result<(DayTable, StageReport), DemographicsError> {
    let mut report = StageReport::new(Stage::Demographics, &table);
    info!(
        component = "demographics",
        event = "demographics.start",
        rows = report.input_rows,
        stays = report.input_stays
    );

    let mut by_stay: HashMap<(i64, i64), PatientInfo> = HashMap::new();
    for row in &mut table.rows {
        let key = (row.stay_id, row.subject_id);
        let info = match by_stay.get(&key) {
            Some(info) => *info,
            None => {
                let info = references.patient_info(row.stay_id, row.subject_id)?;
                by_stay.insert(key, info);
                info
            }
        };
        row.patient = Some(info);
    }

    report.finish(&table);
    info!(
        component = "demographics",
        event = "demographics.finish",
        rows = report.output_rows,
        stays = report.output_stays
    );
    Ok((table, report))
}

fn open_reference(
    path: &Path,
) -> Result<(csv::Reader<std::fs::File>, ColumnIndex), DemographicsError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)?;
    let columns = ColumnIndex::from_headers(reader.headers()?, path);
    Ok((reader, columns))
}

pub fn read_admissions(path: &Path) -> Result<Vec<AdmissionRecord>, DemographicsError> {
    let (mut reader, columns) = open_reference(path)?;
    let hadm_idx = columns.require("hadm_id")?;
    let ethnicity_idx = columns.require("ethnicity")?;

    let mut out = Vec::new();
    for record in reader.records() {
        let record = record?;
        let line = record.position().map(|pos| pos.line()).unwrap_or_default();
        out.push(AdmissionRecord {
            hadm_id: parse_i64(&record, hadm_idx, "hadm_id", line)?,
            ethnicity: field(&record, ethnicity_idx).to_string(),
        });
    }
    Ok(out)
}

pub fn read_icustays(path: &Path) -> Result<Vec<IcuStayRecord>, DemographicsError> {
    let (mut reader, columns) = open_reference(path)?;
    let stay_idx = columns.require("stay_id")?;
    let hadm_idx = columns.require("hadm_id")?;

    let mut out = Vec::new();
    for record in reader.records() {
        let record = record?;
        let line = record.position().map(|pos| pos.line()).unwrap_or_default();
        out.push(IcuStayRecord {
            stay_id: parse_i64(&record, stay_idx, "stay_id", line)?,
            hadm_id: parse_i64(&record, hadm_idx, "hadm_id", line)?,
        });
    }
    Ok(out)
}

pub fn read_patients(path: &Path) -> Result<Vec<PatientRecord>, DemographicsError> {
    let (mut reader, columns) = open_reference(path)?;
    let subject_idx = columns.require("subject_id")?;
    let gender_idx = columns.require("gender")?;
    let age_idx = columns.require("anchor_age")?;

    let mut out = Vec::new();
    for record in reader.records() {
        let record = record?;
        let line = record.position().map(|pos| pos.line()).unwrap_or_default();
        out.push(PatientRecord {
            subject_id: parse_i64(&record, subject_idx, "subject_id", line)?,
            gender: field(&record, gender_idx).to_string(),
            anchor_age: parse_u32(&record, age_idx, "anchor_age", line)?,
        });
    }
    Ok(out)
}
