// =============================================================================
// CSV Sink — per-index append-only option chain files
// =============================================================================
//
// Layout: <csv_dir>/<INDEX>/<rule>/<expiry>.csv, one row per strike per
// collection timestamp. Headers are written once when a file is created;
// columns are stable and additive (new columns append at the end).
// =============================================================================

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::debug;

use crate::types::OverviewSnapshot;

use super::{OptionRow, OptionSink, SideFields};

/// Column order for option rows. Append-only; never reorder.
const OPTION_HEADER: &[&str] = &[
    "timestamp",
    "index",
    "expiry",
    "strike",
    "ce_price",
    "ce_bid",
    "ce_ask",
    "ce_volume",
    "ce_oi",
    "ce_iv",
    "ce_delta",
    "ce_gamma",
    "ce_theta",
    "ce_vega",
    "ce_rho",
    "pe_price",
    "pe_bid",
    "pe_ask",
    "pe_volume",
    "pe_oi",
    "pe_iv",
    "pe_delta",
    "pe_gamma",
    "pe_theta",
    "pe_vega",
    "pe_rho",
];

const OVERVIEW_HEADER: &[&str] = &[
    "timestamp",
    "index",
    "expiries_expected",
    "expiries_collected",
    "expected_mask",
    "collected_mask",
    "missing_mask",
    "day_width",
    "pcr_this_week",
    "pcr_next_week",
    "pcr_this_month",
    "pcr_next_month",
];

pub struct CsvSink {
    root: PathBuf,
    // Serialises header checks against appends on the same file.
    write_lock: Mutex<()>,
}

impl CsvSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn append_records(
        &self,
        path: &Path,
        header: &[&str],
        records: &[Vec<String>],
    ) -> Result<()> {
        let _guard = self.write_lock.lock();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let is_new = !path.exists();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if is_new {
            writer
                .write_record(header)
                .with_context(|| format!("failed to write header to {}", path.display()))?;
        }
        for record in records {
            writer
                .write_record(record)
                .with_context(|| format!("failed to append to {}", path.display()))?;
        }
        writer.flush().context("csv flush failed")?;
        writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("csv writer teardown failed: {e}"))?
            .flush()
            .context("file flush failed")?;
        Ok(())
    }

    fn side_columns(side: &Option<SideFields>) -> Vec<String> {
        match side {
            Some(s) => vec![
                format!("{}", s.price),
                format!("{}", s.bid),
                format!("{}", s.ask),
                format!("{}", s.volume),
                format!("{}", s.open_interest),
                s.iv.map(|v| format!("{v:.6}")).unwrap_or_default(),
                s.delta.map(|v| format!("{v:.6}")).unwrap_or_default(),
                s.gamma.map(|v| format!("{v:.8}")).unwrap_or_default(),
                s.theta.map(|v| format!("{v:.6}")).unwrap_or_default(),
                s.vega.map(|v| format!("{v:.6}")).unwrap_or_default(),
                s.rho.map(|v| format!("{v:.6}")).unwrap_or_default(),
            ],
            None => vec![String::new(); 11],
        }
    }
}

impl OptionSink for CsvSink {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn write_option_rows(&self, rule: &str, rows: &[OptionRow]) -> Result<()> {
        let Some(first) = rows.first() else {
            return Ok(());
        };
        let path = self
            .root
            .join(&first.index)
            .join(rule)
            .join(format!("{}.csv", first.expiry));

        let records: Vec<Vec<String>> = rows
            .iter()
            .map(|row| {
                let mut record = vec![
                    row.timestamp.to_string(),
                    row.index.clone(),
                    row.expiry.to_string(),
                    format!("{}", row.strike),
                ];
                record.extend(Self::side_columns(&row.ce));
                record.extend(Self::side_columns(&row.pe));
                record
            })
            .collect();

        self.append_records(&path, OPTION_HEADER, &records)?;
        debug!(path = %path.display(), rows = rows.len(), "option rows appended");
        Ok(())
    }

    fn write_overview(&self, index: &str, overview: &OverviewSnapshot) -> Result<()> {
        let path = self.root.join(index).join("overview.csv");
        let pcr = |bucket: &str| {
            overview
                .pcr
                .get(bucket)
                .map(|v| format!("{v:.4}"))
                .unwrap_or_default()
        };
        let record = vec![
            chrono::Utc::now().timestamp().to_string(),
            index.to_string(),
            overview.expiries_expected.to_string(),
            overview.expiries_collected.to_string(),
            overview.expected_mask.to_string(),
            overview.collected_mask.to_string(),
            overview.missing_mask.to_string(),
            overview.day_width.to_string(),
            pcr("this_week"),
            pcr("next_week"),
            pcr("this_month"),
            pcr("next_month"),
        ];
        self.append_records(&path, OVERVIEW_HEADER, &[record])?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        // Appends flush on every write; nothing buffered between calls.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OverviewSnapshot;

    fn sample_row(strike: f64) -> OptionRow {
        OptionRow {
            timestamp: 1_722_500_000,
            index: "NIFTY".to_string(),
            expiry: chrono::NaiveDate::from_ymd_opt(2024, 8, 29).unwrap(),
            strike,
            ce: Some(SideFields {
                price: 100.0,
                bid: 99.0,
                ask: 101.0,
                volume: 1000,
                open_interest: 5000,
                iv: Some(0.14),
                ..SideFields::default()
            }),
            pe: None,
        }
    }

    #[test]
    fn header_written_once_rows_append() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path());

        sink.write_option_rows("this_week", &[sample_row(22_400.0)]).unwrap();
        sink.write_option_rows("this_week", &[sample_row(22_500.0)]).unwrap();

        let path = dir
            .path()
            .join("NIFTY/this_week/2024-08-29.csv");
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,index,expiry,strike,ce_price"));
        assert!(lines[1].contains("22400"));
        assert!(lines[2].contains("22500"));
    }

    #[test]
    fn missing_side_leaves_empty_columns() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path());
        sink.write_option_rows("this_week", &[sample_row(22_400.0)]).unwrap();

        let path = dir.path().join("NIFTY/this_week/2024-08-29.csv");
        let content = std::fs::read_to_string(path).unwrap();
        let data_line = content.lines().nth(1).unwrap();
        let fields: Vec<&str> = data_line.split(',').collect();
        assert_eq!(fields.len(), OPTION_HEADER.len());
        // pe_* columns are all empty.
        assert!(fields[fields.len() - 11..].iter().all(|f| f.is_empty()));
    }

    #[test]
    fn overview_row_appends() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path());
        let mut overview = OverviewSnapshot {
            expiries_expected: 2,
            expiries_collected: 2,
            expected_mask: 3,
            collected_mask: 3,
            missing_mask: 0,
            day_width: 120,
            ..OverviewSnapshot::default()
        };
        overview.pcr.insert("this_week".to_string(), 0.92);
        sink.write_overview("NIFTY", &overview).unwrap();

        let content =
            std::fs::read_to_string(dir.path().join("NIFTY/overview.csv")).unwrap();
        assert!(content.lines().count() == 2);
        assert!(content.contains("0.9200"));
    }
}
