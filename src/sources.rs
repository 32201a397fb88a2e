//! File-backed record sources for the CLI.
//!
//! A file is either a top-level JSON array of records or JSON lines (one
//! record per non-blank line). The format is sniffed from the first
//! non-whitespace byte. JSON lines are decoded lazily, one record per
//! [`next_record`](RecordSource::next_record) call, so a malformed line
//! fails the run at that line rather than up front.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use scoreport_core::source::RecordSource;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{}: expected a top-level JSON array or JSON lines", .path.display())]
    NotRecords { path: PathBuf },
    #[error("{}: invalid JSON: {source}", .path.display())]
    InvalidJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{}:{line}: invalid JSON: {source}", .path.display())]
    InvalidLine {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

enum Records {
    Array(std::vec::IntoIter<Value>),
    Lines {
        lines: std::vec::IntoIter<(usize, String)>,
    },
}

/// Records read from a file on disk.
pub struct FileSource {
    path: PathBuf,
    import_type: String,
    context: Value,
    sha256: String,
    records: Records,
}

impl FileSource {
    pub fn open(path: &Path, import_type: &str, context: Value) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_content(path, import_type, context, &content)
    }

    fn from_content(path: &Path, import_type: &str, context: Value, content: &str) -> Result<Self> {
        let sha256 = format!("{:x}", Sha256::digest(content.as_bytes()));
        let records = match content.trim_start().chars().next() {
            Some('[') => {
                let value: Value =
                    serde_json::from_str(content).map_err(|source| SourceError::InvalidJson {
                        path: path.to_path_buf(),
                        source,
                    })?;
                match value {
                    Value::Array(items) => Records::Array(items.into_iter()),
                    _ => {
                        return Err(SourceError::NotRecords {
                            path: path.to_path_buf(),
                        }
                        .into())
                    }
                }
            }
            Some('{') | None => Records::Lines {
                lines: content
                    .lines()
                    .enumerate()
                    .filter(|(_, l)| !l.trim().is_empty())
                    .map(|(i, l)| (i + 1, l.to_string()))
                    .collect::<Vec<_>>()
                    .into_iter(),
            },
            Some(_) => {
                return Err(SourceError::NotRecords {
                    path: path.to_path_buf(),
                }
                .into())
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            import_type: import_type.to_string(),
            context,
            sha256,
            records,
        })
    }

    /// SHA-256 of the file contents, recorded with the import run.
    pub fn sha256(&self) -> &str {
        &self.sha256
    }
}

#[async_trait]
impl RecordSource for FileSource {
    fn import_type(&self) -> &str {
        &self.import_type
    }

    fn context(&self) -> &Value {
        &self.context
    }

    async fn next_record(&mut self) -> Result<Option<Value>> {
        match &mut self.records {
            Records::Array(items) => Ok(items.next()),
            Records::Lines { lines } => match lines.next() {
                None => Ok(None),
                Some((line, text)) => {
                    let value = serde_json::from_str(&text).map_err(|source| {
                        SourceError::InvalidLine {
                            path: self.path.clone(),
                            line,
                            source,
                        }
                    })?;
                    Ok(Some(value))
                }
            },
        }
    }
}
