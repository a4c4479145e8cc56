// =============================================================================
// Lifecycle janitor — compression and retention over the data directory
// =============================================================================
//
// One sweep per invocation: gzip-compress data files older than the
// configured age (bounded per sweep), then delete files past the retention
// horizon (also bounded). Bounds keep a backlog from turning a sweep into a
// stall; the remainder is picked up next time.
// =============================================================================

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info, warn};

use crate::config::LifecycleConfig;
use crate::metrics::MetricsHandles;

/// Result of one janitor sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub compressed: usize,
    pub compression_candidates: usize,
    pub deleted: usize,
}

pub struct LifecycleJanitor {
    root: PathBuf,
    config: LifecycleConfig,
    metrics: MetricsHandles,
}

impl LifecycleJanitor {
    pub fn new(root: impl Into<PathBuf>, config: LifecycleConfig, metrics: MetricsHandles) -> Self {
        Self {
            root: root.into(),
            config,
            metrics,
        }
    }

    /// Run one sweep over the data directory.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        if !self.root.exists() {
            return report;
        }

        let mut files = Vec::new();
        if let Err(e) = collect_files(&self.root, &mut files) {
            warn!(error = %e, "lifecycle walk failed");
            return report;
        }

        let now = SystemTime::now();
        let compress_age = Duration::from_secs(self.config.compression_age_seconds);
        let retention_age = Duration::from_secs(self.config.retention_days as u64 * 86_400);

        // Oldest first so bounded sweeps drain the backlog in order.
        files.sort_by_key(|(_, modified)| *modified);

        for (path, modified) in &files {
            let age = now.duration_since(*modified).unwrap_or_default();

            // Retention first: a file past the horizon is deleted, not
            // compressed.
            if age >= retention_age {
                if report.deleted < self.config.retention_delete_limit.min(self.config.max_per_cycle)
                {
                    match std::fs::remove_file(path) {
                        Ok(()) => {
                            report.deleted += 1;
                            self.metrics.lifecycle_deleted.inc(&[]);
                            debug!(path = %path.display(), "retention delete");
                        }
                        Err(e) => warn!(path = %path.display(), error = %e, "delete failed"),
                    }
                }
                continue;
            }

            if age >= compress_age && self.is_compressible(path) {
                report.compression_candidates += 1;
                if report.compressed < self.config.max_per_cycle {
                    match compress_file(path) {
                        Ok(()) => {
                            report.compressed += 1;
                            debug!(path = %path.display(), "compressed");
                        }
                        Err(e) => warn!(path = %path.display(), error = %e, "compress failed"),
                    }
                }
            }
        }

        self.metrics
            .lifecycle_compression_candidates
            .set(&[], report.compression_candidates as f64);

        if report.compressed > 0 || report.deleted > 0 {
            info!(
                compressed = report.compressed,
                deleted = report.deleted,
                "lifecycle sweep finished"
            );
        }
        report
    }

    fn is_compressible(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| self.config.compression_extensions.iter().any(|c| c == ext))
            .unwrap_or(false)
    }
}

fn collect_files(dir: &Path, out: &mut Vec<(PathBuf, SystemTime)>) -> Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("read_dir {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if let Ok(meta) = entry.metadata() {
            if let Ok(modified) = meta.modified() {
                out.push((path, modified));
            }
        }
    }
    Ok(())
}

/// Replace `path` with `path.gz`.
fn compress_file(path: &Path) -> Result<()> {
    let content = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let gz_path = PathBuf::from(format!("{}.gz", path.display()));

    let file = std::fs::File::create(&gz_path)
        .with_context(|| format!("create {}", gz_path.display()))?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(&content).context("gzip write failed")?;
    encoder.finish().context("gzip finish failed")?;

    std::fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;
    use crate::metrics::MetricsRegistry;

    fn handles() -> MetricsHandles {
        let registry = MetricsRegistry::new(MetricsConfig::default());
        MetricsHandles::build(&registry).unwrap()
    }

    fn janitor(root: &Path, mutate: impl FnOnce(&mut LifecycleConfig)) -> LifecycleJanitor {
        let mut config = LifecycleConfig::default();
        mutate(&mut config);
        LifecycleJanitor::new(root, config, handles())
    }

    #[test]
    fn fresh_files_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("today.csv"), "a,b\n").unwrap();
        let report = janitor(dir.path(), |_| {}).sweep();
        assert_eq!(report.compressed, 0);
        assert_eq!(report.deleted, 0);
        assert!(dir.path().join("today.csv").exists());
    }

    #[test]
    fn aged_csv_compressed_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.csv");
        std::fs::write(&path, "a,b\n1,2\n").unwrap();

        // Age zero means everything qualifies for compression.
        let report = janitor(dir.path(), |cfg| {
            cfg.compression_age_seconds = 0;
        })
        .sweep();

        assert_eq!(report.compressed, 1);
        assert!(!path.exists());
        assert!(dir.path().join("old.csv.gz").exists());
    }

    #[test]
    fn retention_deletes_with_bound() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("f{i}.csv")), "x\n").unwrap();
        }
        let report = janitor(dir.path(), |cfg| {
            cfg.retention_days = 0;
            cfg.retention_delete_limit = 3;
        })
        .sweep();

        assert_eq!(report.deleted, 3);
        let remaining = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(remaining, 2);
    }

    #[test]
    fn non_matching_extension_not_compressed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        let report = janitor(dir.path(), |cfg| {
            cfg.compression_age_seconds = 0;
        })
        .sweep();
        assert_eq!(report.compressed, 0);
        assert!(dir.path().join("notes.txt").exists());
    }
}
