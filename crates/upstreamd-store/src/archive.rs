//! Durable metric history.
//!
//! One append-only JSONL file per server under the archive directory. The
//! hot store is authoritative for reads; the archive answers only when the
//! hot store is empty, and retains up to seven days of samples. Pruning
//! rewrites each file through a temp file + rename so readers never observe
//! a partial file.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use tracing::{debug, warn};

use upstreamd_common::error::{ControlError, Result};
use upstreamd_common::model::MetricSample;

pub struct MetricsArchive {
    dir: PathBuf,
}

impl MetricsArchive {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| ControlError::Archive(format!("cannot create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    fn file_for(&self, server_id: &str) -> PathBuf {
        // Server ids come from config and the URL path; normalize anything
        // that is not filesystem-safe.
        let safe: String = server_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }

    pub fn append(&self, sample: &MetricSample) -> Result<()> {
        let path = self.file_for(&sample.server_id);
        let line = serde_json::to_string(sample)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ControlError::Archive(format!("cannot open {}: {e}", path.display())))?;
        writeln!(file, "{line}")
            .map_err(|e| ControlError::Archive(format!("cannot append {}: {e}", path.display())))?;
        Ok(())
    }

    fn read_all(path: &Path) -> Result<Vec<MetricSample>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ControlError::Archive(format!(
                    "cannot read {}: {e}",
                    path.display()
                )))
            }
        };
        let mut samples = Vec::new();
        for line in BufReader::new(file).lines() {
            let line =
                line.map_err(|e| ControlError::Archive(format!("{}: {e}", path.display())))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<MetricSample>(&line) {
                Ok(sample) => samples.push(sample),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping corrupt archive line"),
            }
        }
        Ok(samples)
    }

    /// Newest archived sample for one server.
    pub fn latest(&self, server_id: &str) -> Result<Option<MetricSample>> {
        let mut samples = Self::read_all(&self.file_for(server_id))?;
        samples.sort_by_key(|s| s.created_at);
        Ok(samples.pop())
    }

    /// Newest archived sample for every server with a file.
    pub fn latest_per_server(&self) -> Result<HashMap<String, MetricSample>> {
        let mut result = HashMap::new();
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| ControlError::Archive(format!("cannot list archive: {e}")))?;
        for entry in entries {
            let path = entry
                .map_err(|e| ControlError::Archive(e.to_string()))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let mut samples = Self::read_all(&path)?;
            samples.sort_by_key(|s| s.created_at);
            if let Some(sample) = samples.pop() {
                result.insert(sample.server_id.clone(), sample);
            }
        }
        Ok(result)
    }

    /// Up to `limit` samples for a server, newest first.
    pub fn history(&self, server_id: &str, limit: usize) -> Result<Vec<MetricSample>> {
        let mut samples = Self::read_all(&self.file_for(server_id))?;
        samples.sort_by_key(|s| std::cmp::Reverse(s.created_at));
        samples.truncate(limit);
        Ok(samples)
    }

    /// Drops samples older than the retention window, compacting each file
    /// via temp-write + rename. Returns how many samples were dropped.
    pub fn prune_older_than(&self, retention_days: i64) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let mut dropped = 0;
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| ControlError::Archive(format!("cannot list archive: {e}")))?;
        for entry in entries {
            let path = entry
                .map_err(|e| ControlError::Archive(e.to_string()))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let samples = Self::read_all(&path)?;
            let kept: Vec<&MetricSample> = samples
                .iter()
                .filter(|s| s.created_at.map(|at| at >= cutoff).unwrap_or(false))
                .collect();
            if kept.len() == samples.len() {
                continue;
            }
            dropped += samples.len() - kept.len();

            let tmp = path.with_extension("jsonl.tmp");
            let mut file = File::create(&tmp)
                .map_err(|e| ControlError::Archive(format!("cannot write {}: {e}", tmp.display())))?;
            for sample in &kept {
                writeln!(file, "{}", serde_json::to_string(sample)?)
                    .map_err(|e| ControlError::Archive(e.to_string()))?;
            }
            fs::rename(&tmp, &path)
                .map_err(|e| ControlError::Archive(format!("cannot replace {}: {e}", path.display())))?;
        }
        if dropped > 0 {
            debug!(dropped, "pruned archived metrics past retention");
        }
        Ok(dropped)
    }
}
