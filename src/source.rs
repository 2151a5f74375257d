//! Record source capability and bundled implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::SourceError;

/// One data record: an identifier plus arbitrary fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl SourceRecord {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}

/// Selection passed to [`RecordSource::fetch_records`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordQuery {
    /// Only records whose fields contain this text (case-insensitive).
    pub filter: Option<String>,
    pub limit: Option<usize>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_records(&self, query: &RecordQuery) -> Result<Vec<SourceRecord>, SourceError>;

    async fn fetch_record(&self, id: &str) -> Result<SourceRecord, SourceError>;

    /// Fetches several records by id, one result per id in the same order.
    ///
    /// The outer `Err` means the source itself is unusable; ids that are
    /// missing or malformed are reported in their own slot. The default
    /// calls [`RecordSource::fetch_record`] once per id.
    async fn fetch_records_by_id(
        &self,
        ids: &[String],
    ) -> Result<Vec<Result<SourceRecord, SourceError>>, SourceError> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            match self.fetch_record(id).await {
                Err(SourceError::Unavailable(msg)) => return Err(SourceError::Unavailable(msg)),
                other => results.push(other),
            }
        }
        Ok(results)
    }
}

fn matches_filter(record: &SourceRecord, filter: &str) -> bool {
    let needle = filter.to_lowercase();
    record.fields.values().any(|v| match v {
        Value::String(s) => s.to_lowercase().contains(&needle),
        other => other.to_string().to_lowercase().contains(&needle),
    })
}

fn select(records: &[SourceRecord], query: &RecordQuery) -> Vec<SourceRecord> {
    records
        .iter()
        .filter(|r| query.filter.as_deref().map_or(true, |f| matches_filter(r, f)))
        .take(query.limit.unwrap_or(usize::MAX))
        .cloned()
        .collect()
}

/// Records held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    records: Vec<SourceRecord>,
}

impl MemorySource {
    pub fn new(records: Vec<SourceRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn fetch_records(&self, query: &RecordQuery) -> Result<Vec<SourceRecord>, SourceError> {
        Ok(select(&self.records, query))
    }

    async fn fetch_record(&self, id: &str) -> Result<SourceRecord, SourceError> {
        self.records
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(id.to_string()))
    }
}

/// Records loaded from a JSON array file on every fetch. A batch lookup by
/// id reads the file once.
///
/// Each element is either `{"id": ..., "fields": {...}}` or a flat object
/// with an `id` member, in which case the remaining members become fields.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<SourceRecord>, SourceError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| SourceError::Unavailable(format!("{}: {}", self.path.display(), e)))?;

        let values: Vec<Value> = serde_json::from_str(&raw)
            .map_err(|e| SourceError::Unavailable(format!("{}: {}", self.path.display(), e)))?;

        let records = values
            .into_iter()
            .enumerate()
            .map(|(index, value)| parse_record(index, value))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(path = %self.path.display(), count = records.len(), "Loaded records");
        Ok(records)
    }
}

fn parse_record(index: usize, value: Value) -> Result<SourceRecord, SourceError> {
    let Value::Object(mut object) = value else {
        return Err(SourceError::Malformed(format!(
            "record #{} is not an object",
            index
        )));
    };

    let id = match object.remove("id") {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            return Err(SourceError::Malformed(format!(
                "record #{} has no string or numeric `id`",
                index
            )))
        }
    };

    let fields = match object.remove("fields") {
        Some(Value::Object(fields)) if object.is_empty() => fields,
        Some(other) => {
            object.insert("fields".to_string(), other);
            object
        }
        None => object,
    };

    Ok(SourceRecord { id, fields })
}

#[async_trait]
impl RecordSource for JsonFileSource {
    async fn fetch_records(&self, query: &RecordQuery) -> Result<Vec<SourceRecord>, SourceError> {
        Ok(select(&self.load().await?, query))
    }

    async fn fetch_record(&self, id: &str) -> Result<SourceRecord, SourceError> {
        self.load()
            .await?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| SourceError::NotFound(id.to_string()))
    }

    async fn fetch_records_by_id(
        &self,
        ids: &[String],
    ) -> Result<Vec<Result<SourceRecord, SourceError>>, SourceError> {
        let by_id: HashMap<String, SourceRecord> = self
            .load()
            .await?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        Ok(ids
            .iter()
            .map(|id| {
                by_id
                    .get(id)
                    .cloned()
                    .ok_or_else(|| SourceError::NotFound(id.clone()))
            })
            .collect())
    }
}
