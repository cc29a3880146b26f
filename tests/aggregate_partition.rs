use std::fs;

use aki_dataset::{
    aggregate_events, parse_chart_time, partition_events_file, read_day_table, write_day_table,
    AggregateError, FeatureCatalog, RawEvent, Stage, TableError,
};
use chrono::NaiveDate;
use tempfile::tempdir;

fn event(stay_id: i64, item_id: i64, chart_time: &str, value: Option<f64>) -> RawEvent {
    RawEvent {
        stay_id,
        subject_id: 10_000 + stay_id,
        item_id,
        chart_time: parse_chart_time(chart_time).expect("valid test timestamp"),
        value,
    }
}

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {expected}, got {actual}"
    );
}

#[test]
fn same_day_events_average_into_one_record() {
    let catalog = FeatureCatalog::mimic_iv();
    let glucose = catalog.index_of("glucose").expect("glucose feature");
    let events = vec![
        event(1, 50931, "2180-07-23 06:00:00", Some(100.0)),
        event(1, 50931, "2180-07-23 18:30:00", Some(120.0)),
        event(1, 50931, "2180-07-24 09:00:00", Some(90.0)),
    ];

    let (table, report) = aggregate_events(&events, &catalog).expect("known items");

    assert_eq!(report.stage, Stage::Partition);
    assert_eq!(report.input_rows, 3);
    assert_eq!(report.output_rows, 2);
    assert_eq!(table.rows.len(), 2);
    assert_eq!(table.rows[0].chart_day, day(2180, 7, 23));
    assert_close(table.rows[0].values[glucose], 110.0);
    assert_close(table.rows[1].values[glucose], 90.0);

    let creatinine = catalog.creatinine_index();
    assert!(table.rows[0].values[creatinine].is_nan());
}

#[test]
fn alternative_item_codes_share_one_feature() {
    let catalog = FeatureCatalog::mimic_iv();
    let potassium = catalog.index_of("potassium").expect("potassium feature");
    let events = vec![
        event(1, 50822, "2180-07-23 06:00:00", Some(3.0)),
        event(1, 50971, "2180-07-23 07:00:00", Some(5.0)),
    ];

    let (table, _) = aggregate_events(&events, &catalog).expect("known items");
    assert_close(table.rows[0].values[potassium], 4.0);
}

#[test]
fn inch_heights_are_converted_before_averaging() {
    let catalog = FeatureCatalog::mimic_iv();
    let height = catalog.index_of("height").expect("height feature");

    let (inches, _) = aggregate_events(&[event(1, 1394, "2180-07-23 06:00:00", Some(70.0))], &catalog)
        .expect("known item");
    assert_close(inches.rows[0].values[height], 177.8);

    let mixed = vec![
        event(2, 226707, "2180-07-23 06:00:00", Some(70.0)),
        event(2, 226730, "2180-07-23 07:00:00", Some(180.0)),
    ];
    let (mixed, _) = aggregate_events(&mixed, &catalog).expect("known items");
    assert_close(mixed.rows[0].values[height], (177.8 + 180.0) / 2.0);
}

#[test]
fn events_without_value_still_create_the_day() {
    let catalog = FeatureCatalog::mimic_iv();
    let events = vec![event(1, 50912, "2180-07-23 06:00:00", None)];

    let (table, _) = aggregate_events(&events, &catalog).expect("known item");

    assert_eq!(table.rows.len(), 1);
    assert!(table.rows[0].values.iter().all(|v| v.is_nan()));
}

#[test]
fn stays_are_kept_apart_and_sorted() {
    let catalog = FeatureCatalog::mimic_iv();
    let events = vec![
        event(2, 50912, "2180-07-24 06:00:00", Some(1.0)),
        event(1, 50912, "2180-07-25 06:00:00", Some(1.1)),
        event(2, 50912, "2180-07-23 06:00:00", Some(1.2)),
    ];

    let (table, report) = aggregate_events(&events, &catalog).expect("known items");
    let keys: Vec<String> = table.rows.iter().map(|row| row.stay_day()).collect();

    assert_eq!(
        keys,
        vec!["1_2180-07-25", "2_2180-07-23", "2_2180-07-24"]
    );
    assert_eq!(report.output_stays, 2);
    assert_eq!(table.rows[1].subject_id, 10_002);
}

#[test]
fn unknown_item_id_is_fatal() {
    let catalog = FeatureCatalog::mimic_iv();
    let err = aggregate_events(&[event(7, 99_999, "2180-07-23 06:00:00", Some(1.0))], &catalog)
        .expect_err("unmapped item must fail");

    assert!(matches!(
        err,
        AggregateError::UnknownItemId {
            item_id: 99_999,
            stay_id: 7
        }
    ));
}

#[test]
fn partitions_event_file_and_round_trips_stage_table() {
    let dir = tempdir().expect("temp dir");
    let events_path = dir.path().join("filtered_events.csv");
    fs::write(
        &events_path,
        "STAY_ID,SUBJECT_ID,ITEMID,CHARTTIME,VALUENUM,VALUEUOM\n\
         30001,10001,50931,2180-07-23 06:00:00,100,mg/dL\n\
         30001,10001,50931,2180-07-23 18:00:00,120,mg/dL\n\
         30001,10001,50912,2180-07-23T08:00:00,1.1,mg/dL\n\
         30001,10001,50912,2180-07-24 08:00:00,,mg/dL\n",
    )
    .expect("write events");

    let catalog = FeatureCatalog::mimic_iv();
    let (table, report) = partition_events_file(&events_path, &catalog).expect("partition");
    assert_eq!(report.input_rows, 4);
    assert_eq!(table.rows.len(), 2);

    let out = dir.path().join("events_partitioned.csv");
    write_day_table(&out, &table).expect("write stage table");

    let text = fs::read_to_string(&out).expect("read back");
    let header = text.lines().next().expect("header line");
    assert!(header.starts_with("bicarbonate,chloride,creatinine,glucose"));
    assert!(header.ends_with("height,weight,stay_day,stay_id,subject_id"));

    let reread = read_day_table(&out, &catalog).expect("read stage table");
    let glucose = catalog.index_of("glucose").expect("glucose feature");
    let creatinine = catalog.creatinine_index();
    assert_eq!(reread.rows.len(), 2);
    assert_eq!(reread.rows[0].stay_day(), "30001_2180-07-23");
    assert_close(reread.rows[0].values[glucose], 110.0);
    assert_close(reread.rows[0].values[creatinine], 1.1);
    assert!(reread.rows[1].values[creatinine].is_nan());
    assert!(reread.rows[0].patient.is_none());
    assert!(reread.rows[0].aki.is_none());
}

#[test]
fn missing_event_column_names_the_column() {
    let dir = tempdir().expect("temp dir");
    let events_path = dir.path().join("filtered_events.csv");
    fs::write(
        &events_path,
        "stay_id,subject_id,itemid,charttime\n30001,10001,50931,2180-07-23 06:00:00\n",
    )
    .expect("write events");

    let err = partition_events_file(&events_path, &FeatureCatalog::mimic_iv())
        .expect_err("valuenum is required");
    assert!(matches!(
        err,
        AggregateError::Table(TableError::MissingColumn { ref column, .. }) if column == "valuenum"
    ));
}

#[test]
fn unparseable_charttime_reports_line() {
    let dir = tempdir().expect("temp dir");
    let events_path = dir.path().join("filtered_events.csv");
    fs::write(
        &events_path,
        "stay_id,subject_id,itemid,charttime,valuenum\n30001,10001,50931,yesterday,1\n",
    )
    .expect("write events");

    let err = partition_events_file(&events_path, &FeatureCatalog::mimic_iv())
        .expect_err("bad timestamp");
    assert!(matches!(
        err,
        AggregateError::InvalidChartTime { ref value, line: 2 } if value == "yesterday"
    ));
}
