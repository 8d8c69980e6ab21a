//! Source registry persistence, report sinks and the WebDriver rendering client.

use std::io::Write;
use std::path::{Path, PathBuf};

use harvest_core::Source;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

mod webdriver;

pub use webdriver::{WebDriverConfig, WebDriverLauncher, WebDriverSession};

pub const CRATE_NAME: &str = "harvest-storage";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("reading source registry {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing source registry {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("writing source registry {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing source registry: {0}")]
    Serialize(#[from] serde_yaml::Error),
    #[error("source id and display name must both be non-empty")]
    InvalidSource,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    sources: Vec<Source>,
}

/// Tracked sources and their display names, kept in a YAML file.
#[derive(Debug, Clone)]
pub struct SourceRegistry {
    path: PathBuf,
}

impl SourceRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty registry.
    pub async fn load(&self) -> Result<Vec<Source>, RegistryError> {
        let yaml = match fs::read_to_string(&self.path).await {
            Ok(yaml) => yaml,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(RegistryError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if yaml.trim().is_empty() {
            return Ok(Vec::new());
        }
        let doc: RegistryDocument =
            serde_yaml::from_str(&yaml).map_err(|source| RegistryError::Parse {
                path: self.path.clone(),
                source,
            })?;
        Ok(doc.sources)
    }

    /// Replace the registry contents via temp file + rename.
    pub async fn save(&self, sources: &[Source]) -> Result<(), RegistryError> {
        let yaml = serde_yaml::to_string(&RegistryDocument {
            sources: sources.to_vec(),
        })?;
        let write_err = |source| RegistryError::Write {
            path: self.path.clone(),
            source,
        };

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await.map_err(write_err)?;

        let temp_path = parent.join(format!(".{}.sources.tmp", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path).await.map_err(write_err)?;
        file.write_all(yaml.as_bytes()).await.map_err(write_err)?;
        file.flush().await.map_err(write_err)?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(write_err(source));
        }
        Ok(())
    }

    /// Register a source, or rename it if the id is already tracked.
    pub async fn add(&self, source: Source) -> Result<Vec<Source>, RegistryError> {
        let source = Source::new(source.id.trim(), source.display_name.trim());
        if source.id.is_empty() || source.display_name.is_empty() {
            return Err(RegistryError::InvalidSource);
        }

        let mut sources = self.load().await?;
        match sources.iter_mut().find(|s| s.id == source.id) {
            Some(existing) => existing.display_name = source.display_name,
            None => {
                info!(source_id = %source.id, "registering source");
                sources.push(source);
            }
        }
        self.save(&sources).await?;
        Ok(sources)
    }

    /// Look up `ids` in request order; unknown and repeated ids are dropped.
    pub async fn resolve(&self, ids: &[String]) -> Result<Vec<Source>, RegistryError> {
        let known = self.load().await?;
        let mut resolved: Vec<Source> = Vec::with_capacity(ids.len());
        for id in ids {
            let id = id.trim();
            if resolved.iter().any(|s| s.id == id) {
                continue;
            }
            if let Some(source) = known.iter().find(|s| s.id == id) {
                resolved.push(source.clone());
            }
        }
        Ok(resolved)
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("writing report row: {0}")]
    Csv(#[from] csv::Error),
    #[error("writing report: {0}")]
    Io(#[from] std::io::Error),
}

/// Row-at-a-time tabular output.
pub trait ReportSink {
    fn append_row(&mut self, row: &[String]) -> Result<(), ReportError>;
}

/// CSV report. Starts with a UTF-8 byte order mark so spreadsheet apps pick
/// the right encoding for non-ASCII titles.
pub struct CsvReport<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> CsvReport<W> {
    pub fn new(mut inner: W) -> Result<Self, ReportError> {
        inner.write_all("\u{feff}".as_bytes())?;
        Ok(Self {
            writer: csv::Writer::from_writer(inner),
        })
    }

    pub fn finish(self) -> Result<W, ReportError> {
        self.writer
            .into_inner()
            .map_err(|err| ReportError::Io(err.into_error()))
    }
}

impl CsvReport<Vec<u8>> {
    pub fn in_memory() -> Self {
        Self {
            writer: csv::Writer::from_writer("\u{feff}".as_bytes().to_vec()),
        }
    }
}

impl<W: Write> ReportSink for CsvReport<W> {
    fn append_row(&mut self, row: &[String]) -> Result<(), ReportError> {
        self.writer.write_record(row)?;
        Ok(())
    }
}

/// Collects rows in memory; handy for previews and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemoryReport {
    pub rows: Vec<Vec<String>>,
}

impl ReportSink for MemoryReport {
    fn append_row(&mut self, row: &[String]) -> Result<(), ReportError> {
        self.rows.push(row.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_registry_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let registry = SourceRegistry::new(dir.path().join("nope.yaml"));
        assert!(registry.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn add_persists_and_renames_existing() {
        let dir = tempdir().expect("tempdir");
        let registry = SourceRegistry::new(dir.path().join("data").join("sources.yaml"));

        registry
            .add(Source::new("moonlight", "Moon"))
            .await
            .expect("add moon");
        registry
            .add(Source::new(" sunrise ", " Sun "))
            .await
            .expect("add sun");
        let sources = registry
            .add(Source::new("moonlight", "Moonlight Diary"))
            .await
            .expect("rename moon");

        assert_eq!(
            sources,
            vec![
                Source::new("moonlight", "Moonlight Diary"),
                Source::new("sunrise", "Sun"),
            ]
        );
        let reloaded = SourceRegistry::new(registry.path()).load().await.expect("reload");
        assert_eq!(reloaded, sources);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("data"))
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn add_rejects_blank_fields() {
        let dir = tempdir().expect("tempdir");
        let registry = SourceRegistry::new(dir.path().join("sources.yaml"));
        let err = registry.add(Source::new("  ", "Alias")).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSource));
    }

    #[tokio::test]
    async fn resolve_keeps_request_order_and_drops_unknown() {
        let dir = tempdir().expect("tempdir");
        let registry = SourceRegistry::new(dir.path().join("sources.yaml"));
        registry
            .save(&[
                Source::new("a", "Alpha"),
                Source::new("b", "Beta"),
                Source::new("c", "Gamma"),
            ])
            .await
            .expect("save");

        let ids = ["c", "zzz", "a", "c"].map(String::from);
        let resolved = registry.resolve(&ids).await.expect("resolve");
        assert_eq!(
            resolved,
            vec![Source::new("c", "Gamma"), Source::new("a", "Alpha")]
        );
    }

    #[tokio::test]
    async fn malformed_registry_is_a_parse_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sources.yaml");
        std::fs::write(&path, "sources: [unterminated").expect("write");
        let err = SourceRegistry::new(&path).load().await.unwrap_err();
        assert!(matches!(err, RegistryError::Parse { .. }));
    }

    #[test]
    fn csv_report_quotes_and_marks_encoding() {
        let mut report = CsvReport::in_memory();
        report
            .append_row(&["name".into(), "title".into()])
            .expect("header");
        report
            .append_row(&["달빛".into(), "Hello, world".into()])
            .expect("row");
        let bytes = report.finish().expect("finish");
        let text = String::from_utf8(bytes).expect("utf8");
        assert_eq!(text, "\u{feff}name,title\n달빛,\"Hello, world\"\n");
    }
}
