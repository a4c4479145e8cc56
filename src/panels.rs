// =============================================================================
// Panel / Summary Emission — enveloped JSON artifacts per cycle
// =============================================================================
//
// The panels directory is a single-writer surface owned by the orchestrator.
// Every file goes through write-to-temp-then-rename so readers never see a
// partial panel. Envelope hashes are 12-hex prefixes over the canonical JSON
// of the panel's data (serde_json emits sorted keys, compact separators);
// the manifest carries the full SHA-256 of the same projection.
// =============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::pipeline::{PhaseErrorRecord, PipelineSummary};

/// Envelope schema identifier.
const ENVELOPE_SCHEMA: &str = "panel-envelope-v1";
/// Envelope version.
const ENVELOPE_VERSION: u32 = 1;

// =============================================================================
// Canonical hashing
// =============================================================================

/// Canonical JSON of a value: sorted keys, compact separators.
fn canonical_json(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Full SHA-256 hex over the canonical data projection.
pub fn data_hash_full(data: &serde_json::Value) -> String {
    hex::encode(Sha256::digest(canonical_json(data).as_bytes()))
}

/// 12-hex envelope hash prefix.
pub fn data_hash_short(data: &serde_json::Value) -> String {
    data_hash_full(data)[..12].to_string()
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename into {}", path.display()))?;
    Ok(())
}

// =============================================================================
// PanelsWriter
// =============================================================================

pub struct PanelsWriter {
    dir: PathBuf,
    config: PipelineConfig,
    source: String,
}

impl PanelsWriter {
    pub fn new(dir: impl Into<PathBuf>, config: PipelineConfig) -> Self {
        Self {
            dir: dir.into(),
            config,
            source: "g6-collector".to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write one cycle's panels: an enveloped file per panel plus the
    /// manifest. Returns the panel names written.
    pub fn write_cycle(&self, panels: &[(String, serde_json::Value)]) -> Result<Vec<String>> {
        if !self.config.panel_export_enabled {
            return Ok(Vec::new());
        }

        let now = chrono::Utc::now().to_rfc3339();
        let mut names = Vec::with_capacity(panels.len());
        let mut hashes = BTreeMap::new();

        for (name, data) in panels {
            let file_name = format!("{name}_enveloped.json");
            let envelope = serde_json::json!({
                "panel": name,
                "version": ENVELOPE_VERSION,
                "generated_at": now,
                "updated_at": now,
                "data": data,
                "meta": {
                    "source": self.source,
                    "schema": ENVELOPE_SCHEMA,
                    "hash": data_hash_short(data),
                },
            });
            write_atomic(
                &self.dir.join(&file_name),
                &serde_json::to_string_pretty(&envelope)?,
            )?;
            hashes.insert(file_name, data_hash_full(data));
            names.push(name.clone());

            if self.config.panel_export_history_enabled {
                self.append_history(name, &envelope)?;
            }
        }

        let manifest = serde_json::json!({
            "panels": names,
            "hashes": hashes,
        });
        write_atomic(
            &self.dir.join("manifest.json"),
            &serde_json::to_string_pretty(&manifest)?,
        )?;

        debug!(panels = names.len(), dir = %self.dir.display(), "panel cycle written");
        Ok(names)
    }

    // -------------------------------------------------------------------------
    // Errors summary
    // -------------------------------------------------------------------------

    /// Write `pipeline_errors_summary.json`: the cycle summary plus the
    /// structured error list, with an optional 16-hex content hash over the
    /// stable projection.
    pub fn write_errors_summary(
        &self,
        summary: &PipelineSummary,
        records: &[PhaseErrorRecord],
    ) -> Result<()> {
        let mut doc = serde_json::json!({
            "summary": summary,
            "errors": records,
            "error_count": records.len(),
            "version": 1,
        });
        if self.config.panel_export_hash {
            let hash = hex::encode(Sha256::digest(canonical_json(&doc).as_bytes()))[..16]
                .to_string();
            doc["content_hash"] = serde_json::Value::String(hash);
        }
        write_atomic(
            &self.dir.join("pipeline_errors_summary.json"),
            &serde_json::to_string_pretty(&doc)?,
        )
    }

    // -------------------------------------------------------------------------
    // Rolling history
    // -------------------------------------------------------------------------

    fn append_history(&self, name: &str, envelope: &serde_json::Value) -> Result<()> {
        let history_dir = self.dir.join("history");
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%9f");
        let file_name = format!("{stamp}_{name}.json");
        write_atomic(
            &history_dir.join(&file_name),
            &serde_json::to_string_pretty(envelope)?,
        )?;

        // Newest-first index, pruned to the configured limit.
        let index_path = history_dir.join("index.json");
        let mut entries: Vec<String> = std::fs::read_to_string(&index_path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        entries.insert(0, file_name);

        let limit = self.config.panel_export_history_limit.max(1);
        while entries.len() > limit {
            if let Some(evicted) = entries.pop() {
                let _ = std::fs::remove_file(history_dir.join(&evicted));
            }
        }
        write_atomic(&index_path, &serde_json::to_string_pretty(&entries)?)
    }

    // -------------------------------------------------------------------------
    // Trend file
    // -------------------------------------------------------------------------

    /// Append one cycle's trend entry and refresh the aggregate block.
    /// Entries are pruned to `trends_limit` (min 1).
    pub fn append_trend(&self, summary: &PipelineSummary, parity_hash: &str) -> Result<()> {
        if !self.config.trends_enabled {
            return Ok(());
        }
        let path = self.dir.join("pipeline_trends.json");

        let mut entries: Vec<serde_json::Value> = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
            .and_then(|doc| doc.get("entries").and_then(|e| e.as_array()).cloned())
            .unwrap_or_default();

        entries.push(serde_json::json!({
            "ts": chrono::Utc::now().timestamp(),
            "phases_total": summary.phases_total,
            "phases_ok": summary.phases_ok,
            "phases_error": summary.phases_error,
            "errors": summary.error_outcomes,
            "success": summary.success(),
            "hash": parity_hash,
        }));

        let limit = self.config.trends_limit.max(1);
        while entries.len() > limit {
            entries.remove(0);
        }

        let cycles = entries.len() as u64;
        let success_cycles = entries
            .iter()
            .filter(|e| e["success"].as_bool().unwrap_or(false))
            .count() as u64;
        let phase_errors_total: u64 = entries
            .iter()
            .map(|e| e["phases_error"].as_u64().unwrap_or(0))
            .sum();
        let phases_total: u64 = entries
            .iter()
            .map(|e| e["phases_total"].as_u64().unwrap_or(0))
            .sum();

        let doc = serde_json::json!({
            "entries": entries,
            "aggregate": {
                "cycles": cycles,
                "success_cycles": success_cycles,
                "success_rate": if cycles > 0 { success_cycles as f64 / cycles as f64 } else { 0.0 },
                "errors_total": phase_errors_total,
                "phase_errors_total": phase_errors_total,
                "phases_total": phases_total,
            },
        });
        write_atomic(&path, &serde_json::to_string_pretty(&doc)?)
    }

    pub fn trends_path(&self) -> PathBuf {
        self.dir.join("pipeline_trends.json")
    }

    // -------------------------------------------------------------------------
    // Config snapshot
    // -------------------------------------------------------------------------

    /// Write the pre-phase config snapshot with a content hash over the
    /// sorted flag mapping.
    pub fn write_config_snapshot(&self, flags: &BTreeMap<String, serde_json::Value>) -> Result<()> {
        if !self.config.config_snapshot {
            return Ok(());
        }
        let flags_value = serde_json::to_value(flags)?;
        let hash =
            hex::encode(Sha256::digest(canonical_json(&flags_value).as_bytes()))[..16].to_string();
        let doc = serde_json::json!({
            "flags": flags_value,
            "content_hash": hash,
            "written_at": chrono::Utc::now().to_rfc3339(),
        });
        write_atomic(
            &self.dir.join("pipeline_config_snapshot.json"),
            &serde_json::to_string_pretty(&doc)?,
        )
    }
}

// =============================================================================
// Integrity monitor
// =============================================================================

/// Result of one integrity sweep over the panels directory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrityReport {
    pub checked: usize,
    pub mismatches: Vec<String>,
}

impl IntegrityReport {
    pub fn ok(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Recompute panel data hashes and compare against the manifest.
pub fn verify_integrity(dir: &Path) -> Result<IntegrityReport> {
    let manifest_path = dir.join("manifest.json");
    let manifest: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(&manifest_path)
            .with_context(|| format!("failed to read {}", manifest_path.display()))?,
    )
    .context("failed to parse manifest")?;

    let hashes = manifest
        .get("hashes")
        .and_then(|h| h.as_object())
        .context("manifest missing hashes map")?;

    let mut report = IntegrityReport::default();
    for (file_name, expected) in hashes {
        report.checked += 1;
        let envelope: serde_json::Value = match std::fs::read_to_string(dir.join(file_name)) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(v) => v,
                Err(_) => {
                    report.mismatches.push(file_name.clone());
                    continue;
                }
            },
            Err(_) => {
                report.mismatches.push(file_name.clone());
                continue;
            }
        };
        let data = envelope.get("data").cloned().unwrap_or(serde_json::Value::Null);
        if data_hash_full(&data) != expected.as_str().unwrap_or_default() {
            report.mismatches.push(file_name.clone());
        }
    }

    if report.ok() {
        debug!(checked = report.checked, "panel integrity verified");
    } else {
        warn!(mismatches = ?report.mismatches, "panel integrity mismatch");
    }
    Ok(report)
}

/// Log-and-count helper for the orchestrator's periodic integrity task.
pub fn integrity_sweep(
    dir: &Path,
    metrics: &crate::metrics::MetricsHandles,
    strict: bool,
) -> Option<IntegrityReport> {
    let report = match verify_integrity(dir) {
        Ok(r) => r,
        Err(e) => {
            // No manifest yet (before the first cycle) is not a defect.
            debug!(error = %e, "integrity sweep skipped");
            return None;
        }
    };
    metrics
        .panel_integrity_ok
        .set(&[], if report.ok() { 1.0 } else { 0.0 });
    if !report.ok() {
        metrics
            .panel_integrity_mismatches
            .inc_by(&[], report.mismatches.len() as f64);
        if strict {
            info!("integrity mismatch under strict exceptions, exiting");
            std::process::exit(1);
        }
    }
    Some(report)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn writer(dir: &Path, mutate: impl FnOnce(&mut PipelineConfig)) -> PanelsWriter {
        let mut config = PipelineConfig::default();
        mutate(&mut config);
        PanelsWriter::new(dir, config)
    }

    fn sample_panels() -> Vec<(String, serde_json::Value)> {
        vec![
            (
                "indices_panel".to_string(),
                serde_json::json!({"NIFTY": {"pcr": {"this_week": 0.9}}}),
            ),
            (
                "cycle_panel".to_string(),
                serde_json::json!({"cycles_total": 5}),
            ),
        ]
    }

    #[test]
    fn envelope_and_manifest_hashes_agree() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path(), |_| {});
        w.write_cycle(&sample_panels()).unwrap();

        let envelope: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("indices_panel_enveloped.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(envelope["meta"]["schema"], ENVELOPE_SCHEMA);
        assert_eq!(envelope["version"], 1);

        let manifest: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("manifest.json")).unwrap(),
        )
        .unwrap();
        let full = manifest["hashes"]["indices_panel_enveloped.json"]
            .as_str()
            .unwrap();
        assert_eq!(full.len(), 64);
        // Envelope short hash is the 12-hex prefix of the manifest hash.
        assert_eq!(&full[..12], envelope["meta"]["hash"].as_str().unwrap());
        // Recomputing from the written data reproduces the manifest hash.
        assert_eq!(data_hash_full(&envelope["data"]), full);
    }

    #[test]
    fn integrity_sweep_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path(), |_| {});
        w.write_cycle(&sample_panels()).unwrap();

        let clean = verify_integrity(dir.path()).unwrap();
        assert!(clean.ok());
        assert_eq!(clean.checked, 2);

        // Tamper with one panel's data.
        let path = dir.path().join("cycle_panel_enveloped.json");
        let mut envelope: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        envelope["data"]["cycles_total"] = serde_json::json!(999);
        std::fs::write(&path, serde_json::to_string(&envelope).unwrap()).unwrap();

        let tampered = verify_integrity(dir.path()).unwrap();
        assert_eq!(tampered.mismatches, vec!["cycle_panel_enveloped.json"]);
    }

    #[test]
    fn disabled_export_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path(), |cfg| cfg.panel_export_enabled = false);
        let names = w.write_cycle(&sample_panels()).unwrap();
        assert!(names.is_empty());
        assert!(!dir.path().join("manifest.json").exists());
    }

    #[test]
    fn errors_summary_hash_flag() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path(), |cfg| cfg.panel_export_hash = true);
        let summary = PipelineSummary::default();
        w.write_errors_summary(&summary, &[]).unwrap();

        let doc: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("pipeline_errors_summary.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(doc["error_count"], 0);
        assert_eq!(doc["content_hash"].as_str().unwrap().len(), 16);
    }

    #[test]
    fn history_prunes_to_limit_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path(), |cfg| {
            cfg.panel_export_history_enabled = true;
            cfg.panel_export_history_limit = 2;
        });
        for i in 0..4 {
            let panels = vec![("p".to_string(), serde_json::json!({ "cycle": i }))];
            w.write_cycle(&panels).unwrap();
        }

        let index: Vec<String> = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("history/index.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(index.len(), 2);
        // Newest first: the first entry exists on disk, evicted ones do not.
        assert!(dir.path().join("history").join(&index[0]).exists());
        let survivors = std::fs::read_dir(dir.path().join("history")).unwrap().count();
        // index.json + 2 retained clones.
        assert_eq!(survivors, 3);
    }

    #[test]
    fn trend_file_aggregates_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path(), |cfg| {
            cfg.trends_enabled = true;
            cfg.trends_limit = 3;
        });

        for i in 0..5 {
            let mut summary = PipelineSummary::default();
            summary.phases_total = 13;
            summary.phases_ok = if i == 0 { 12 } else { 13 };
            summary.phases_error = if i == 0 { 1 } else { 0 };
            w.append_trend(&summary, "abcd1234abcd1234").unwrap();
        }

        let doc: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(w.trends_path()).unwrap(),
        )
        .unwrap();
        assert_eq!(doc["entries"].as_array().unwrap().len(), 3);
        // The failing first cycle was pruned away.
        assert_eq!(doc["aggregate"]["cycles"], 3);
        assert_eq!(doc["aggregate"]["success_cycles"], 3);
        assert_eq!(doc["aggregate"]["success_rate"], 1.0);
        assert_eq!(doc["aggregate"]["phases_total"], 39);
    }

    #[test]
    fn config_snapshot_carries_sorted_hash() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path(), |cfg| cfg.config_snapshot = true);
        let mut flags = BTreeMap::new();
        flags.insert("retry_enabled".to_string(), serde_json::json!(false));
        flags.insert("rolling_window".to_string(), serde_json::json!(0));
        w.write_config_snapshot(&flags).unwrap();

        let doc: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("pipeline_config_snapshot.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(doc["content_hash"].as_str().unwrap().len(), 16);
        assert_eq!(doc["flags"]["retry_enabled"], false);
    }
}
