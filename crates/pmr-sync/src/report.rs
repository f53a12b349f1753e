use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use pmr_core::MarketGapFlag;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub fn run_dir(reports_root: &Path, run_id: Uuid) -> PathBuf {
    reports_root.join(run_id.to_string())
}

/// Writes `<reports_root>/<run_id>/summary.json` tagged with the stage name.
pub async fn write_run_summary<T: Serialize>(
    reports_root: &Path,
    run_id: Uuid,
    stage: &str,
    summary: &T,
) -> Result<PathBuf> {
    let dir = run_dir(reports_root, run_id);
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join("summary.json");
    let bytes = serde_json::to_vec_pretty(&serde_json::json!({
        "stage": stage,
        "run_id": run_id,
        "summary": summary,
    }))
    .with_context(|| format!("serializing {stage} summary"))?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Writes `snapshots/market_gap_flags.parquet` plus its manifest under `run_dir`.
pub async fn export_market_gap_snapshot(run_dir: &Path, flags: &[MarketGapFlag]) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let flags_path = snapshot_dir.join("market_gap_flags.parquet");
    write_market_gap_parquet(&flags_path, flags)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry("market_gap_flags", run_dir, &flags_path)?],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_market_gap_parquet(path: &Path, flags: &[MarketGapFlag]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("property_id", DataType::Utf8, false),
        ArrowField::new("gap_percentage", DataType::Float64, false),
        ArrowField::new("reference_price", DataType::Float64, false),
        ArrowField::new("reference_level", DataType::Utf8, false),
        ArrowField::new("comparable_count", DataType::UInt32, false),
        ArrowField::new("confidence", DataType::Utf8, false),
        ArrowField::new("potential_profit", DataType::Float64, false),
        ArrowField::new("notified", DataType::Boolean, false),
        ArrowField::new("computed_at", DataType::Utf8, false),
    ]));

    let ids = StringArray::from(flags.iter().map(|f| f.property_id.to_string()).collect::<Vec<_>>());
    let gaps = Float64Array::from(flags.iter().map(|f| f.gap_percentage).collect::<Vec<_>>());
    let references = Float64Array::from(flags.iter().map(|f| f.reference_price).collect::<Vec<_>>());
    let levels = StringArray::from(
        flags
            .iter()
            .map(|f| f.reference_level.as_str())
            .collect::<Vec<_>>(),
    );
    let counts = UInt32Array::from(flags.iter().map(|f| f.comparable_count).collect::<Vec<_>>());
    let confidences =
        StringArray::from(flags.iter().map(|f| f.confidence.as_str()).collect::<Vec<_>>());
    let profits = Float64Array::from(flags.iter().map(|f| f.potential_profit).collect::<Vec<_>>());
    let notified = BooleanArray::from(flags.iter().map(|f| f.notified).collect::<Vec<_>>());
    let computed = StringArray::from(
        flags
            .iter()
            .map(|f| f.computed_at.to_rfc3339())
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(gaps),
            Arc::new(references),
            Arc::new(levels),
            Arc::new(counts),
            Arc::new(confidences),
            Arc::new(profits),
            Arc::new(notified),
            Arc::new(computed),
        ],
    )
    .context("building market gap record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, base_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(base_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pmr_core::{Confidence, ReferenceLevel};
    use tempfile::tempdir;

    #[tokio::test]
    async fn snapshot_manifest_hashes_parquet_file() {
        let dir = tempdir().expect("tempdir");
        let run = run_dir(dir.path(), Uuid::nil());
        let flags = vec![MarketGapFlag {
            property_id: Uuid::from_u128(1),
            gap_percentage: 20.0,
            reference_price: 2_000.0,
            reference_level: ReferenceLevel::Street,
            comparable_count: 6,
            confidence: Confidence::Medium,
            potential_profit: 28_000.0,
            notified: false,
            computed_at: Utc.with_ymd_and_hms(2026, 3, 5, 7, 0, 0).single().unwrap(),
            cleared_at: None,
        }];
        let manifest_path = export_market_gap_snapshot(&run, &flags).await.unwrap();

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        let entry = &manifest["files"][0];
        assert_eq!(entry["path"], "snapshots/market_gap_flags.parquet");
        let parquet = std::fs::read(run.join("snapshots/market_gap_flags.parquet")).unwrap();
        assert_eq!(entry["bytes"], parquet.len() as u64);
        assert_eq!(entry["sha256"].as_str().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn summary_is_tagged_with_stage() {
        let dir = tempdir().expect("tempdir");
        let path = write_run_summary(dir.path(), Uuid::nil(), "recheck", &serde_json::json!({"checked": 3}))
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(value["stage"], "recheck");
        assert_eq!(value["summary"]["checked"], 3);
    }
}
