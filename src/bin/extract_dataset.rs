use aki_dataset::{
    init_logging, log_app_start, logging_config_from_env, pipeline_config_from_env, run_pipeline,
    FeatureCatalog, StageStatus,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging = logging_config_from_env();
    init_logging(&logging)?;
    log_app_start(&logging);

    let cfg = pipeline_config_from_env()?;
    let catalog = FeatureCatalog::mimic_iv();

    println!(
        "Extracting AKI dataset from {} into {} (redo={})",
        cfg.source_dir.display(),
        cfg.output_dir.display(),
        cfg.redo
    );

    let runs = run_pipeline(&cfg, &catalog)?;
    for run in &runs {
        let status = match run.status {
            StageStatus::Ran => "ran",
            StageStatus::Skipped => "skipped",
        };
        println!(
            "{:<13} {:<8} rows={:<8} stays={:<6} dropped={:<6} truncated={:<6} {}",
            run.stage.as_str(),
            status,
            run.report.output_rows,
            run.report.output_stays,
            run.report.dropped_stays,
            run.report.truncated_stays,
            run.output_path.display()
        );
    }

    Ok(())
}
