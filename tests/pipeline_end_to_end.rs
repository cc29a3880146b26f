use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use aki_dataset::{
    read_day_table, read_manifest, run_pipeline, DemographicsError, FeatureCatalog,
    PipelineConfig, PipelineError, Stage, StageStatus,
};
use regex::Regex;
use tempfile::tempdir;

/// `(item id, value)` for one observation of every catalog feature.
const DAILY_ITEMS: [(i64, f64); 13] = [
    (50882, 24.0),
    (50902, 101.0),
    (50912, 1.0),
    (50931, 110.0),
    (50960, 2.0),
    (50971, 4.1),
    (50983, 139.0),
    (51006, 15.0),
    (51222, 11.5),
    (51265, 210.0),
    (51300, 8.2),
    (226730, 172.0),
    (224639, 81.0),
];

fn events_csv(stays: &[(i64, i64, usize)]) -> String {
    let mut out = String::from("stay_id,subject_id,itemid,charttime,valuenum\n");
    for (stay_id, subject_id, days) in stays {
        for day in 0..*days {
            for (item_id, value) in DAILY_ITEMS {
                writeln!(
                    out,
                    "{stay_id},{subject_id},{item_id},2180-07-{:02} 08:00:00,{value}",
                    day + 1
                )
                .expect("write to string");
            }
        }
    }
    out
}

fn seed_sources(dir: &Path, patients: &str) {
    fs::create_dir_all(dir).expect("source dir");
    fs::write(
        dir.join("filtered_events.csv"),
        events_csv(&[(30001, 10001, 5), (30002, 10002, 2)]),
    )
    .expect("events");
    fs::write(
        dir.join("filtered_admissions.csv"),
        "subject_id,hadm_id,ethnicity\n10001,20001,WHITE\n10002,20002,BLACK/AFRICAN AMERICAN\n",
    )
    .expect("admissions");
    fs::write(
        dir.join("filtered_icustays.csv"),
        "subject_id,hadm_id,stay_id\n10001,20001,30001\n10002,20002,30002\n",
    )
    .expect("icustays");
    fs::write(dir.join("filtered_patients.csv"), patients).expect("patients");
}

const PATIENTS: &str = "subject_id,gender,anchor_age\n10001,M,45.0\n10002,F,70\n";

fn config(root: &Path) -> PipelineConfig {
    PipelineConfig {
        source_dir: root.join("mimic4"),
        output_dir: root.join("dataset"),
        ..PipelineConfig::default()
    }
}

#[test]
fn five_day_stay_yields_four_negative_rows() {
    let root = tempdir().expect("temp dir");
    let cfg = config(root.path());
    seed_sources(&cfg.source_dir, PATIENTS);
    let catalog = FeatureCatalog::mimic_iv();

    let runs = run_pipeline(&cfg, &catalog).expect("pipeline succeeds");

    let stages: Vec<Stage> = runs.iter().map(|run| run.stage).collect();
    assert_eq!(stages, Stage::ALL.to_vec());
    assert!(runs.iter().all(|run| run.status == StageStatus::Ran));
    assert_eq!(runs[1].report.dropped_stays, 1);

    let complete = read_day_table(&cfg.stage_output_path(Stage::Outliers), &catalog)
        .expect("final table");
    assert_eq!(complete.rows.len(), 4);
    assert!(complete.rows.iter().all(|row| row.stay_id == 30001));
    assert!(complete.rows.iter().all(|row| row.aki == Some(0)));

    let patient = complete.rows[0].patient.expect("demographics attached");
    assert_eq!(patient.hadm_id, 20001);
    assert_eq!(patient.age, 45);
    assert_eq!(patient.gender, 1);
    assert_eq!(patient.black, 0);

    let text = fs::read_to_string(cfg.stage_output_path(Stage::Outliers)).expect("final csv");
    let header = text.lines().next().expect("header");
    assert!(header.ends_with("stay_day,stay_id,subject_id,hadm_id,age,gender,black,aki"));
    assert_eq!(header.split(',').count(), 13 + 3 + 4 + 1);

    let fingerprint = Regex::new("^[0-9a-f]{64}$").expect("valid regex");
    for stage in Stage::ALL {
        let manifest = read_manifest(&cfg.manifest_path(stage)).expect("manifest written");
        assert_eq!(manifest.stage, stage);
        assert!(fingerprint.is_match(&manifest.fingerprint));
    }
}

#[test]
fn second_run_skips_every_stage() {
    let root = tempdir().expect("temp dir");
    let cfg = config(root.path());
    seed_sources(&cfg.source_dir, PATIENTS);
    let catalog = FeatureCatalog::mimic_iv();

    let first = run_pipeline(&cfg, &catalog).expect("first run");
    let second = run_pipeline(&cfg, &catalog).expect("second run");

    assert!(second.iter().all(|run| run.status == StageStatus::Skipped));
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.report, b.report);
    }
}

#[test]
fn changed_label_setting_reruns_from_labeler() {
    let root = tempdir().expect("temp dir");
    let mut cfg = config(root.path());
    seed_sources(&cfg.source_dir, PATIENTS);
    let catalog = FeatureCatalog::mimic_iv();
    run_pipeline(&cfg, &catalog).expect("first run");

    cfg.label.max_days = 2;
    let runs = run_pipeline(&cfg, &catalog).expect("second run");

    let statuses: Vec<StageStatus> = runs.iter().map(|run| run.status).collect();
    assert_eq!(
        statuses,
        vec![
            StageStatus::Skipped,
            StageStatus::Skipped,
            StageStatus::Skipped,
            StageStatus::Ran,
            StageStatus::Ran,
        ]
    );
    let complete = read_day_table(&cfg.stage_output_path(Stage::Outliers), &catalog)
        .expect("final table");
    assert_eq!(complete.rows.len(), 2);
}

#[test]
fn redo_and_missing_outputs_force_reruns() {
    let root = tempdir().expect("temp dir");
    let mut cfg = config(root.path());
    seed_sources(&cfg.source_dir, PATIENTS);
    let catalog = FeatureCatalog::mimic_iv();
    run_pipeline(&cfg, &catalog).expect("first run");

    fs::remove_file(cfg.stage_output_path(Stage::Demographics)).expect("remove output");
    let runs = run_pipeline(&cfg, &catalog).expect("resume");
    assert_eq!(runs[1].status, StageStatus::Skipped);
    assert_eq!(runs[2].status, StageStatus::Ran);
    assert_eq!(runs[4].status, StageStatus::Ran);

    cfg.redo = true;
    let runs = run_pipeline(&cfg, &catalog).expect("redo");
    assert!(runs.iter().all(|run| run.status == StageStatus::Ran));
}

#[test]
fn unknown_patient_aborts_the_run() {
    let root = tempdir().expect("temp dir");
    let cfg = config(root.path());
    seed_sources(
        &cfg.source_dir,
        "subject_id,gender,anchor_age\n10002,F,70\n",
    );

    let err = run_pipeline(&cfg, &FeatureCatalog::mimic_iv()).expect_err("lookup miss");

    assert!(matches!(
        err,
        PipelineError::Demographics(DemographicsError::MissingPatient { subject_id: 10001 })
    ));
    assert!(cfg.stage_output_path(Stage::Impute).exists());
    assert!(!cfg.stage_output_path(Stage::Demographics).exists());
}
