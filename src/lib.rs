//! AKI dataset crate.
//!
//! Builds the next-day acute kidney injury dataset from ICU event extracts:
//! - daily per-stay feature aggregation
//! - per-stay imputation with drop/truncate rules
//! - demographic join
//! - KDIGO next-day labeling
//! - global winsorization
//! - a staged, resumable driver tying the stages together

mod aggregate;
mod catalog;
mod demographics;
mod impute;
mod kdigo;
mod labeler;
mod observability;
mod outliers;
mod pipeline;
mod report;
mod table;

pub use aggregate::{
    aggregate_events, parse_chart_time, partition_events_file, read_events, AggregateError,
    DayAggregator, RawEvent,
};
pub use catalog::{CatalogError, EventSource, FeatureCatalog, FeatureDef, ItemMapping, CREATININE};
pub use demographics::{
    attach_demographics, gender_flag, is_black, read_admissions, read_icustays, read_patients,
    AdmissionRecord, DemographicsError, IcuStayRecord, PatientRecord, ReferenceTables,
};
pub use impute::{
    first_missing_from, forward_backward_fill, impute_stay, impute_table, EarlyCreatininePolicy,
    ImputeConfig, ImputeError, FIRST_POST_WINDOW_DAY, MIN_STAY_DAYS,
};
pub use kdigo::{
    baseline_creatinine, AkiCheck, Demographics, KdigoError, BASELINE_MULTIPLIER,
    CREATININE_RISE_THRESHOLD, MIN_BASELINE_AGE,
};
pub use labeler::{
    aki_within_first_48h, label_stay, label_table, next_day_labels, LabelConfig, LabelError,
    DEFAULT_MAX_DAYS,
};
pub use observability::{
    init_logging, log_app_start, logging_config_from_env, LogFormat, LoggingConfig,
    LoggingInitError,
};
pub use outliers::{clip_outliers, feature_bounds, quantile_linear, ClipConfig, ClipError};
pub use pipeline::{
    pipeline_config_from_env, pipeline_config_from_lookup, read_manifest, run_pipeline,
    stage_fingerprint, PipelineConfig, PipelineError, StageManifest, StageRun, StageStatus,
    MANIFEST_VERSION,
};
pub use report::{
    collect_outcomes, DropReason, FeatureBounds, Stage, StageReport, StayDecision, StayOutcome,
    TruncateReason,
};
pub use table::{
    column_names, format_stay_day, parse_stay_day, read_day_table, write_day_table, DayRecord,
    DayTable, PatientInfo, Stay, TableError, STAY_DAY_DATE_FORMAT,
};
