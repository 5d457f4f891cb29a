//! Writes a finished run report to `reports/<run_id>/`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::report::RunReport;

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub operation: String,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct WrittenReport {
    pub dir: PathBuf,
    pub manifest: ReportManifest,
}

pub struct ReportSink {
    reports_root: PathBuf,
}

impl ReportSink {
    pub fn new(reports_root: impl Into<PathBuf>) -> Self {
        Self {
            reports_root: reports_root.into(),
        }
    }

    pub fn write(&self, report: &RunReport) -> Result<WrittenReport> {
        let dir = self.reports_root.join(report.run_id.to_string());
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

        let json_path = dir.join("report.json");
        let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
        std::fs::write(&json_path, json)
            .with_context(|| format!("writing {}", json_path.display()))?;

        let summary_path = dir.join("summary.md");
        std::fs::write(&summary_path, report.summary_markdown())
            .with_context(|| format!("writing {}", summary_path.display()))?;

        let entries_path = dir.join("entries.parquet");
        write_entries_parquet(&entries_path, report)?;

        let manifest = ReportManifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            run_id: report.run_id.to_string(),
            operation: report.operation.clone(),
            files: vec![
                manifest_entry("report", &dir, &json_path)?,
                manifest_entry("summary", &dir, &summary_path)?,
                manifest_entry("entries", &dir, &entries_path)?,
            ],
        };
        let manifest_path = dir.join("manifest.json");
        std::fs::write(
            &manifest_path,
            serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?,
        )
        .with_context(|| format!("writing {}", manifest_path.display()))?;

        info!(run_id = %report.run_id, dir = %dir.display(), "report written");
        Ok(WrittenReport { dir, manifest })
    }
}

fn write_entries_parquet(path: &Path, report: &RunReport) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("stage", DataType::Utf8, false),
        ArrowField::new("key", DataType::Utf8, false),
        ArrowField::new("raw_name", DataType::Utf8, true),
        ArrowField::new("slug", DataType::Utf8, true),
        ArrowField::new("candidates", DataType::Utf8, false),
        ArrowField::new("detail", DataType::Utf8, false),
    ]));

    let rows = report
        .entries
        .iter()
        .flat_map(|(category, entries)| entries.iter().map(move |entry| (*category, entry)))
        .collect::<Vec<_>>();

    let categories = StringArray::from(rows.iter().map(|(c, _)| c.as_str()).collect::<Vec<_>>());
    let stages = StringArray::from(rows.iter().map(|(_, e)| e.stage.as_str()).collect::<Vec<_>>());
    let keys = StringArray::from(rows.iter().map(|(_, e)| e.key.as_str()).collect::<Vec<_>>());
    let raw_names =
        StringArray::from(rows.iter().map(|(_, e)| e.raw_name.as_deref()).collect::<Vec<_>>());
    let slugs = StringArray::from(rows.iter().map(|(_, e)| e.slug.as_deref()).collect::<Vec<_>>());
    let candidates = StringArray::from(
        rows.iter()
            .map(|(_, e)| {
                e.candidates
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .collect::<Vec<_>>(),
    );
    let details = StringArray::from(rows.iter().map(|(_, e)| e.detail.as_str()).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(categories),
            Arc::new(stages),
            Arc::new(keys),
            Arc::new(raw_names),
            Arc::new(slugs),
            Arc::new(candidates),
            Arc::new(details),
        ],
    )
    .context("building report entries record batch")?;
    write_parquet(path, batch)
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

fn manifest_entry(name: &str, dir: &Path, path: &Path) -> Result<ManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(ManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{Category, ReportBuilder, ReportEntry, Stage};
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use uuid::Uuid;

    fn report() -> RunReport {
        let mut builder = ReportBuilder::new();
        builder.record(
            Category::Ambiguous,
            ReportEntry::new(Stage::Participant, "csv:5")
                .raw_name("analuisa")
                .candidates([Uuid::from_u128(3), Uuid::from_u128(4)]),
        );
        builder.record(
            Category::Created,
            ReportEntry::new(Stage::Participant, "zoe").slug("zoe"),
        );
        builder.finish(Uuid::from_u128(42), "ingest", false, chrono::Utc::now())
    }

    #[test]
    fn writes_report_files_and_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let report = report();
        let written = ReportSink::new(tmp.path()).write(&report).unwrap();

        assert_eq!(written.dir, tmp.path().join(Uuid::from_u128(42).to_string()));
        let names = written
            .manifest
            .files
            .iter()
            .map(|f| f.path.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["report.json", "summary.md", "entries.parquet"]);

        let json = std::fs::read(written.dir.join("report.json")).unwrap();
        let mut hasher = Sha256::new();
        hasher.update(&json);
        assert_eq!(written.manifest.files[0].sha256, hex::encode(hasher.finalize()));
        let parsed: RunReport = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed, report);

        let manifest: ReportManifest = serde_json::from_str(
            &std::fs::read_to_string(written.dir.join("manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest, written.manifest);

        let parquet = File::open(written.dir.join("entries.parquet")).unwrap();
        let reader = SerializedFileReader::new(parquet).unwrap();
        assert_eq!(reader.metadata().file_metadata().num_rows(), 2);
    }
}
