//! The converter contract and the registry the pipeline dispatches through.
//!
//! Format authors implement the typed [`Converter`] trait. The pipeline
//! never sees those types: records and contexts travel as JSON (they must
//! survive a round trip through the orphan store), and a blanket impl of
//! [`ErasedConverter`] does the decoding. The orchestrator and reconciler
//! look converters up by import type and never branch on format identity.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use scoreport_core::convert::{Converter, ConverterRegistry};
//! use scoreport_core::failure::ConversionFailure;
//! use scoreport_core::models::Converted;
//! use scoreport_core::store::Catalog;
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Row { score: u32 }
//!
//! struct RowConverter;
//!
//! #[async_trait]
//! impl Converter for RowConverter {
//!     type Record = Row;
//!     type Context = ();
//!
//!     fn import_type(&self) -> &str { "file/rows" }
//!
//!     async fn convert(
//!         &self,
//!         _record: &Row,
//!         _context: &(),
//!         _catalog: &dyn Catalog,
//!     ) -> Result<Converted, ConversionFailure> {
//!         Err(ConversionFailure::SongOrChartNotFound("no catalog".into()))
//!     }
//! }
//!
//! let mut registry = ConverterRegistry::new();
//! registry.register(RowConverter);
//! assert!(registry.find("file/rows").is_some());
//! ```

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::failure::ConversionFailure;
use crate::models::Converted;
use crate::store::Catalog;

/// Per-format mapping from one raw record to a canonical dry score.
///
/// Implementations read the catalog and nothing else; persistence belongs
/// to the orchestrator.
#[async_trait]
pub trait Converter: Send + Sync {
    /// One entry of the source's record sequence.
    type Record: DeserializeOwned + Send + Sync;
    /// Side-channel data shared by every record of one import run.
    type Context: DeserializeOwned + Send + Sync;

    /// Import type identifier, e.g. `"ir/fervidex"`.
    fn import_type(&self) -> &str;

    async fn convert(
        &self,
        record: &Self::Record,
        context: &Self::Context,
        catalog: &dyn Catalog,
    ) -> Result<Converted, ConversionFailure>;
}

/// JSON-level view of a [`Converter`].
#[async_trait]
pub trait ErasedConverter: Send + Sync {
    /// Check that `context` decodes into the converter's context type.
    fn validate_context(&self, context: &Value) -> Result<(), String>;

    /// Decode and convert one record.
    ///
    /// A record that does not decode is an
    /// [`InvalidScore`](ConversionFailure::InvalidScore) (wrong types,
    /// negative counts); a context that does not decode is an
    /// [`Internal`](ConversionFailure::Internal) failure, since contexts
    /// are validated before a run starts.
    async fn convert_value(
        &self,
        raw: &Value,
        context: &Value,
        catalog: &dyn Catalog,
    ) -> Result<Converted, ConversionFailure>;
}

#[async_trait]
impl<C> ErasedConverter for C
where
    C: Converter,
{
    fn validate_context(&self, context: &Value) -> Result<(), String> {
        serde_json::from_value::<C::Context>(context.clone())
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn convert_value(
        &self,
        raw: &Value,
        context: &Value,
        catalog: &dyn Catalog,
    ) -> Result<Converted, ConversionFailure> {
        let record: C::Record = serde_json::from_value(raw.clone()).map_err(|e| {
            ConversionFailure::InvalidScore(format!(
                "Malformed {} record: {}",
                self.import_type(),
                e
            ))
        })?;
        let context: C::Context = serde_json::from_value(context.clone()).map_err(|e| {
            ConversionFailure::Internal(format!(
                "Malformed {} import context: {}",
                self.import_type(),
                e
            ))
        })?;
        self.convert(&record, &context, catalog).await
    }
}

/// Registry of converters keyed by import type.
pub struct ConverterRegistry {
    converters: Vec<(String, Box<dyn ErasedConverter>)>,
}

impl ConverterRegistry {
    /// Create an empty converter registry.
    pub fn new() -> Self {
        Self {
            converters: Vec::new(),
        }
    }

    /// Register a converter. A later registration for the same import type
    /// replaces the earlier one.
    pub fn register<C>(&mut self, converter: C)
    where
        C: Converter + 'static,
    {
        let import_type = converter.import_type().to_string();
        self.converters.retain(|(t, _)| *t != import_type);
        self.converters.push((import_type, Box::new(converter)));
    }

    /// Find the converter for an import type.
    pub fn find(&self, import_type: &str) -> Option<&dyn ErasedConverter> {
        self.converters
            .iter()
            .find(|(t, _)| t == import_type)
            .map(|(_, c)| c.as_ref())
    }

    /// Registered import types, in registration order.
    pub fn import_types(&self) -> Vec<&str> {
        self.converters.iter().map(|(t, _)| t.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.converters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.converters.len()
    }
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
