//! Raw event ingestion and the daily per-stay feature grid.

use std::collections::HashMap;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::FeatureCatalog;
use crate::report::{Stage, StageReport};
use crate::table::{field, parse_i64, parse_value, ColumnIndex, DayRecord, DayTable, TableError};

const CHART_TIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];
const CHART_DAY_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub stay_id: i64,
    pub subject_id: i64,
    pub item_id: i64,
    pub chart_time: NaiveDateTime,
    pub value: Option<f64>,
}

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("invalid charttime '{value}' at line {line}")]
    InvalidChartTime { value: String, line: u64 },
    #[error("unknown item id {item_id} (stay_id {stay_id})")]
    UnknownItemId { item_id: i64, stay_id: i64 },
}

#[derive(Debug, Clone)]
struct DayAccumulator {
    subject_id: i64,
    sums: Vec<f64>,
    counts: Vec<u32>,
}

/// Collapses events into one record per `(stay_id, calendar day)` holding
/// the mean of every feature observed that day.
#[derive(Debug)]
pub struct DayAggregator<'a> {
    catalog: &'a FeatureCatalog,
    days: HashMap<(i64, NaiveDate), DayAccumulator>,
    events_seen: u64,
    events_without_value: u64,
}

impl<'a> DayAggregator<'a> {
    pub fn new(catalog: &'a FeatureCatalog) -> Self {
        Self {
            catalog,
            days: HashMap::new(),
            events_seen: 0,
            events_without_value: 0,
        }
    }

    pub fn push(&mut self, event: &RawEvent) -> Result<(), AggregateError> {
        let mapping =
            self.catalog
                .lookup(event.item_id)
                .ok_or(AggregateError::UnknownItemId {
                    item_id: event.item_id,
                    stay_id: event.stay_id,
                })?;

        let width = self.catalog.len();
        let entry = self
            .days
            .entry((event.stay_id, event.chart_time.date()))
            .or_insert_with(|| DayAccumulator {
                subject_id: event.subject_id,
                sums: vec![0.0; width],
                counts: vec![0; width],
            });
        // Last event for a stay-day names the subject.
        entry.subject_id = event.subject_id;

        self.events_seen += 1;
        match event.value.filter(|v| v.is_finite()) {
            Some(value) => {
                entry.sums[mapping.feature_index] += value * mapping.scale;
                entry.counts[mapping.feature_index] += 1;
            }
            None => self.events_without_value += 1,
        }

        Ok(())
    }

    pub fn finish(self) -> (DayTable, StageReport) {
        let mut rows: Vec<DayRecord> = self
            .days
            .into_iter()
            .map(|((stay_id, chart_day), acc)| {
                let values = acc
                    .sums
                    .iter()
                    .zip(&acc.counts)
                    .map(|(sum, count)| {
                        if *count == 0 {
                            f64::NAN
                        } else {
                            sum / f64::from(*count)
                        }
                    })
                    .collect();
                DayRecord::new(stay_id, acc.subject_id, chart_day, values)
            })
            .collect();
        rows.sort_by_key(|row| (row.stay_id, row.chart_day));

        let table = DayTable::new(self.catalog.feature_names(), rows);
        let mut report = StageReport::new(Stage::Partition, &table);
        report.input_rows = self.events_seen;

        debug!(
            component = "aggregate",
            event = "aggregate.events.without_value",
            count = self.events_without_value
        );

        (table, report)
    }
}

pub fn aggregate_events<'e>(
    events: impl IntoIterator<Item = &'e RawEvent>,
    catalog: &FeatureCatalog,
) -> Result<(DayTable, StageReport), AggregateError> {
    let mut aggregator = DayAggregator::new(catalog);
    for event in events {
        aggregator.push(event)?;
    }
    Ok(aggregator.finish())
}

/// Streams the raw events CSV straight into the daily grid.
pub fn partition_events_file(
    path: &Path,
    catalog: &FeatureCatalog,
) -> Result<(DayTable, StageReport), AggregateError> {
    info!(
        component = "aggregate",
        event = "aggregate.start",
        input = %path.display()
    );

    let mut aggregator = DayAggregator::new(catalog);
    for_each_event(path, |event| aggregator.push(&event))?;
    let (table, report) = aggregator.finish();

    info!(
        component = "aggregate",
        event = "aggregate.finish",
        events = report.input_rows,
        day_records = report.output_rows,
        stays = report.output_stays
    );

    Ok((table, report))
}

pub fn read_events(path: &Path) -> Result<Vec<RawEvent>, AggregateError> {
    let mut events = Vec::new();
    for_each_event(path, |event| {
        events.push(event);
        Ok(())
    })?;
    Ok(events)
}

fn for_each_event(
    path: &Path,
    mut visit: impl FnMut(RawEvent) -> Result<(), AggregateError>,
) -> Result<(), AggregateError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)?;
    let columns = ColumnIndex::from_headers(reader.headers()?, path);
    let stay_idx = columns.require("stay_id")?;
    let subject_idx = columns.require("subject_id")?;
    let item_idx = columns.require("itemid")?;
    let time_idx = columns.require("charttime")?;
    let value_idx = columns.require("valuenum")?;

    for record in reader.records() {
        let record = record?;
        let line = record.position().map(|pos| pos.line()).unwrap_or_default();
        let value = parse_value(&record, value_idx, "valuenum", line)?;

        visit(RawEvent {
            stay_id: parse_i64(&record, stay_idx, "stay_id", line)?,
            subject_id: parse_i64(&record, subject_idx, "subject_id", line)?,
            item_id: parse_i64(&record, item_idx, "itemid", line)?,
            chart_time: parse_chart_time(field(&record, time_idx)).ok_or_else(|| {
                AggregateError::InvalidChartTime {
                    value: field(&record, time_idx).to_string(),
                    line,
                }
            })?,
            value: (!value.is_nan()).then_some(value),
        })?;
    }

    Ok(())
}

/// Parses an event timestamp; a bare date is taken as midnight.
pub fn parse_chart_time(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    CHART_TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, CHART_DAY_FORMAT)
                .ok()
                .and_then(|day| day.and_hms_opt(0, 0, 0))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chart_time_accepts_common_layouts() {
        let expected = NaiveDate::from_ymd_opt(2180, 7, 23)
            .and_then(|d| d.and_hms_opt(14, 5, 0))
            .expect("valid timestamp");
        assert_eq!(parse_chart_time("2180-07-23 14:05:00"), Some(expected));
        assert_eq!(parse_chart_time("2180-07-23T14:05:00"), Some(expected));
        assert_eq!(
            parse_chart_time("2180-07-23 14:05:00.000").map(|t| t.date()),
            Some(expected.date())
        );
        assert_eq!(
            parse_chart_time("2180-07-23").map(|t| t.date()),
            Some(expected.date())
        );
        assert_eq!(parse_chart_time("23/07/2180"), None);
    }
}
