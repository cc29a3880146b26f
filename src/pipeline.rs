//! Staged, resumable driver over the five dataset stages.
//!
//! Every stage materialises its table under the output directory together
//! with a `<stem>.manifest.json` sidecar. A stage whose output and matching
//! manifest already exist is skipped unless `redo` is set; once any stage
//! runs, every later stage runs as well.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::aggregate::{partition_events_file, AggregateError};
use crate::catalog::FeatureCatalog;
use crate::demographics::{attach_demographics, DemographicsError, ReferenceTables};
use crate::impute::{impute_table, EarlyCreatininePolicy, ImputeConfig, ImputeError};
use crate::labeler::{label_table, LabelConfig, LabelError};
use crate::observability::parse_bool;
use crate::outliers::{clip_outliers, ClipConfig, ClipError};
use crate::report::{Stage, StageReport};
use crate::table::{
    column_names, read_day_table, write_atomic, write_day_table, DayTable, TableError,
};

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    pub events_file: String,
    pub admissions_file: String,
    pub icustays_file: String,
    pub patients_file: String,
    pub redo: bool,
    pub impute: ImputeConfig,
    pub label: LabelConfig,
    pub clip: ClipConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("databases/mimic4"),
            output_dir: PathBuf::from("dataset"),
            events_file: "filtered_events.csv".to_string(),
            admissions_file: "filtered_admissions.csv".to_string(),
            icustays_file: "filtered_icustays.csv".to_string(),
            patients_file: "filtered_patients.csv".to_string(),
            redo: false,
            impute: ImputeConfig::default(),
            label: LabelConfig::default(),
            clip: ClipConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn source_path(&self, file_name: &str) -> PathBuf {
        self.source_dir.join(file_name)
    }

    pub fn stage_output_path(&self, stage: Stage) -> PathBuf {
        self.output_dir.join(stage.output_file_name())
    }

    pub fn manifest_path(&self, stage: Stage) -> PathBuf {
        manifest_path_for(&self.stage_output_path(stage))
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration {key}='{value}'")]
    InvalidConfig { key: String, value: String },
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error(transparent)]
    Impute(#[from] ImputeError),
    #[error(transparent)]
    Demographics(#[from] DemographicsError),
    #[error(transparent)]
    Label(#[from] LabelError),
    #[error(transparent)]
    Clip(#[from] ClipError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ran,
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageRun {
    pub stage: Stage,
    pub status: StageStatus,
    pub output_path: PathBuf,
    pub report: StageReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageManifest {
    pub stage: Stage,
    pub version: u32,
    pub fingerprint: String,
    pub rows: u64,
    pub stays: u64,
    pub report: StageReport,
}

pub fn pipeline_config_from_env() -> Result<PipelineConfig, PipelineError> {
    pipeline_config_from_lookup(|key| env::var(key).ok())
}

/// Builds the configuration from `lookup`, which maps a variable name to its
/// value. Unset or blank variables keep their defaults.
pub fn pipeline_config_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<PipelineConfig, PipelineError> {
    let mut config = PipelineConfig::default();
    let var = |key: &str| {
        lookup(key)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    };
    let invalid = |key: &str, value: &str| PipelineError::InvalidConfig {
        key: key.to_string(),
        value: value.to_string(),
    };

    if let Some(dir) = var("AKI_SOURCE_DIR") {
        config.source_dir = PathBuf::from(dir);
    }
    if let Some(dir) = var("AKI_OUTPUT_DIR") {
        config.output_dir = PathBuf::from(dir);
    }
    if let Some(raw) = var("AKI_REDO") {
        config.redo = parse_bool(&raw).ok_or_else(|| invalid("AKI_REDO", &raw))?;
    }
    if let Some(raw) = var("AKI_EARLY_CREATININE") {
        config.impute.early_creatinine = match raw.to_ascii_lowercase().as_str() {
            "strict" => EarlyCreatininePolicy::Strict,
            "fill" => EarlyCreatininePolicy::Fill,
            _ => return Err(invalid("AKI_EARLY_CREATININE", &raw)),
        };
    }
    if let Some(raw) = var("AKI_MAX_DAYS") {
        config.label.max_days = raw
            .parse::<usize>()
            .ok()
            .filter(|days| *days > 0)
            .ok_or_else(|| invalid("AKI_MAX_DAYS", &raw))?;
    }

    Ok(config)
}

/// SHA-256 over the stage's output columns and every setting that shapes it,
/// including those of earlier stages.
pub fn stage_fingerprint(stage: Stage, catalog: &FeatureCatalog, cfg: &PipelineConfig) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{MANIFEST_VERSION};stage:{};", stage.as_str()));

    hasher.update("catalog:");
    for def in catalog.features() {
        hasher.update(format!("{}={:?}", def.name, def.source));
        for item_id in &def.item_ids {
            hasher.update(format!(",{item_id}"));
        }
        for item_id in &def.inch_item_ids {
            hasher.update(format!(",in{item_id}"));
        }
        hasher.update(";");
    }

    let reached = |later: Stage| stage >= later;
    if reached(Stage::Impute) {
        hasher.update(format!("early_creatinine:{:?};", cfg.impute.early_creatinine));
    }
    if reached(Stage::Label) {
        hasher.update(format!("max_days:{};", cfg.label.max_days));
    }
    if reached(Stage::Outliers) {
        hasher.update(format!(
            "quantiles:{},{};",
            cfg.clip.lower_quantile, cfg.clip.upper_quantile
        ));
    }

    hasher.update("columns:");
    let columns = column_names(
        &catalog.feature_names(),
        reached(Stage::Demographics),
        reached(Stage::Label),
    );
    for column in columns {
        hasher.update(column.as_bytes());
        hasher.update(";");
    }

    hex::encode(hasher.finalize())
}

pub fn run_pipeline(
    cfg: &PipelineConfig,
    catalog: &FeatureCatalog,
) -> Result<Vec<StageRun>, PipelineError> {
    fs::create_dir_all(&cfg.output_dir)?;
    info!(
        component = "pipeline",
        event = "pipeline.start",
        source_dir = %cfg.source_dir.display(),
        output_dir = %cfg.output_dir.display(),
        redo = cfg.redo
    );

    let mut runs = Vec::with_capacity(Stage::ALL.len());
    let mut current: Option<DayTable> = None;
    let mut upstream_ran = false;

    for stage in Stage::ALL {
        let output_path = cfg.stage_output_path(stage);
        let fingerprint = stage_fingerprint(stage, catalog, cfg);

        if !cfg.redo && !upstream_ran {
            if let Some(manifest) = reusable_manifest(stage, &output_path, &fingerprint)? {
                info!(
                    component = "pipeline",
                    event = "pipeline.stage.skipped",
                    stage = stage.as_str(),
                    output = %output_path.display(),
                    rows = manifest.rows
                );
                current = None;
                runs.push(StageRun {
                    stage,
                    status: StageStatus::Skipped,
                    output_path,
                    report: manifest.report,
                });
                continue;
            }
        }

        info!(
            component = "pipeline",
            event = "pipeline.stage.start",
            stage = stage.as_str()
        );
        let (table, report) = run_stage(stage, current.take(), cfg, catalog)?;
        write_day_table(&output_path, &table)?;
        write_manifest(
            &manifest_path_for(&output_path),
            &StageManifest {
                stage,
                version: MANIFEST_VERSION,
                fingerprint,
                rows: report.output_rows,
                stays: report.output_stays,
                report: report.clone(),
            },
        )?;

        info!(
            component = "pipeline",
            event = "pipeline.stage.finish",
            stage = stage.as_str(),
            output = %output_path.display(),
            rows = report.output_rows,
            stays = report.output_stays,
            dropped = report.dropped_stays,
            truncated = report.truncated_stays
        );

        upstream_ran = true;
        current = Some(table);
        runs.push(StageRun {
            stage,
            status: StageStatus::Ran,
            output_path,
            report,
        });
    }

    info!(
        component = "pipeline",
        event = "pipeline.finish",
        stages_ran = runs.iter().filter(|run| run.status == StageStatus::Ran).count()
    );
    Ok(runs)
}

/// Runs one stage. `previous` is the table produced earlier in this run; when
/// absent the predecessor's output is read back from disk.
fn run_stage(
    stage: Stage,
    previous: Option<DayTable>,
    cfg: &PipelineConfig,
    catalog: &FeatureCatalog,
) -> Result<(DayTable, StageReport), PipelineError> {
    let input = |previous: Option<DayTable>| -> Result<DayTable, PipelineError> {
        match (previous, stage.previous()) {
            (Some(table), _) => Ok(table),
            (None, Some(upstream)) => Ok(read_day_table(&cfg.stage_output_path(upstream), catalog)?),
            (None, None) => Ok(DayTable::new(catalog.feature_names(), Vec::new())),
        }
    };

    let output = match stage {
        Stage::Partition => partition_events_file(&cfg.source_path(&cfg.events_file), catalog)?,
        Stage::Impute => impute_table(input(previous)?, catalog, &cfg.impute)?,
        Stage::Demographics => {
            let references = ReferenceTables::load(
                &cfg.source_path(&cfg.admissions_file),
                &cfg.source_path(&cfg.icustays_file),
                &cfg.source_path(&cfg.patients_file),
            )?;
            attach_demographics(input(previous)?, &references)?
        }
        Stage::Label => label_table(input(previous)?, catalog, &cfg.label)?,
        Stage::Outliers => clip_outliers(input(previous)?, &cfg.clip)?,
    };
    Ok(output)
}

pub fn read_manifest(path: &Path) -> Result<StageManifest, PipelineError> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_manifest(path: &Path, manifest: &StageManifest) -> Result<(), PipelineError> {
    let bytes = serde_json::to_vec_pretty(manifest)?;
    write_atomic(path, &bytes)?;
    Ok(())
}

fn reusable_manifest(
    stage: Stage,
    output_path: &Path,
    fingerprint: &str,
) -> Result<Option<StageManifest>, PipelineError> {
    if !output_path.exists() {
        return Ok(None);
    }

    let manifest_path = manifest_path_for(output_path);
    let manifest = match read_manifest(&manifest_path) {
        Ok(manifest) => manifest,
        Err(PipelineError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                component = "pipeline",
                event = "pipeline.manifest.missing",
                stage = stage.as_str(),
                manifest = %manifest_path.display()
            );
            return Ok(None);
        }
        Err(PipelineError::Json(err)) => {
            warn!(
                component = "pipeline",
                event = "pipeline.manifest.unreadable",
                stage = stage.as_str(),
                manifest = %manifest_path.display(),
                error = %err
            );
            return Ok(None);
        }
        Err(err) => return Err(err),
    };

    if manifest.stage != stage
        || manifest.version != MANIFEST_VERSION
        || manifest.fingerprint != fingerprint
    {
        warn!(
            component = "pipeline",
            event = "pipeline.manifest.stale",
            stage = stage.as_str(),
            expected = fingerprint,
            found = %manifest.fingerprint
        );
        return Ok(None);
    }

    Ok(Some(manifest))
}

fn manifest_path_for(output_path: &Path) -> PathBuf {
    output_path.with_extension("manifest.json")
}
