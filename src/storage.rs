//! Run history on disk.
//!
//! Each finished run is one pretty-printed JSON file under the local data directory.

use crate::model::RunRecord;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// `<data_local_dir>/archgraph-cli/runs`.
pub fn runs_dir() -> Result<PathBuf> {
    let base = dirs::data_local_dir().context("cannot determine local data directory")?;
    Ok(base.join("archgraph-cli").join("runs"))
}

fn file_name(record: &RunRecord) -> String {
    let job = record
        .job_id
        .as_ref()
        .map(|j| j.file_stem())
        .unwrap_or_else(|| "nojob".into());
    format!(
        "run-{}-{}.json",
        record.timestamp_utc.replace(':', "-").replace('T', "_"),
        job
    )
}

pub fn save_run(record: &RunRecord) -> Result<PathBuf> {
    save_run_in(&runs_dir()?, record)
}

pub fn save_run_in(dir: &Path, record: &RunRecord) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join(file_name(record));
    export_json(&path, record)?;
    Ok(path)
}

/// Most recent first.
pub fn load_recent(limit: usize) -> Result<Vec<RunRecord>> {
    load_recent_in(&runs_dir()?, limit)
}

pub fn load_recent_in(dir: &Path, limit: usize) -> Result<Vec<RunRecord>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("read {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    // Names start with the RFC 3339 timestamp, so lexical order is chronological.
    files.sort();
    files.reverse();

    let mut out = Vec::new();
    for p in files.into_iter().take(limit) {
        let data = match std::fs::read_to_string(&p) {
            Ok(d) => d,
            Err(_) => continue,
        };
        if let Ok(rec) = serde_json::from_str::<RunRecord>(&data) {
            out.push(rec);
        }
    }
    Ok(out)
}

pub fn delete_run_in(dir: &Path, record: &RunRecord) -> Result<()> {
    let path = dir.join(file_name(record));
    std::fs::remove_file(&path).with_context(|| format!("delete {}", path.display()))
}

pub fn delete_run(record: &RunRecord) -> Result<()> {
    delete_run_in(&runs_dir()?, record)
}

pub fn export_json(path: &Path, record: &RunRecord) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(record)?;
    std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
