//! Raw record sources.
//!
//! A source is a finite, non-restartable, lazily produced sequence of raw
//! records plus the import context shared by all of them. The orchestrator
//! pulls one record at a time and does not ask for the next until the
//! previous one has been fully handled.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait RecordSource: Send {
    /// Import type of every record in this source, e.g. `"ir/fervidex"`.
    fn import_type(&self) -> &str;

    /// Import context shared by the whole run.
    fn context(&self) -> &Value;

    /// Next record, or `Ok(None)` once the source is exhausted.
    async fn next_record(&mut self) -> Result<Option<Value>>;
}

/// A source over records that are already in memory.
pub struct VecSource {
    import_type: String,
    context: Value,
    records: std::vec::IntoIter<Value>,
}

impl VecSource {
    pub fn new(import_type: impl Into<String>, context: Value, records: Vec<Value>) -> Self {
        Self {
            import_type: import_type.into(),
            context,
            records: records.into_iter(),
        }
    }
}

#[async_trait]
impl RecordSource for VecSource {
    fn import_type(&self) -> &str {
        &self.import_type
    }

    fn context(&self) -> &Value {
        &self.context
    }

    async fn next_record(&mut self) -> Result<Option<Value>> {
        Ok(self.records.next())
    }
}
