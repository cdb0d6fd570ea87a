//! The serialization pipeline: validate, adapt, encode outbound, with
//! the mirror image inbound.
//!
//! Outbound: schema validation, dialect adaptation, then encoding in the
//! configured wire format. Inbound reverses each stage. Individual stages
//! can be disabled by configuration; stage order is fixed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use sd_core::{RowError, TableRow};

use crate::binary;
use crate::dialect::{Dialect, DialectAdapter};
use crate::schema::schema_for;

/// Wire encoding for row payloads.
///
/// `Text` (JSON) is the compatibility default and works with every
/// dialect. `Binary` is the compact length-prefixed framing from
/// [`crate::binary`] and must not be fed data from untrusted sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Text,
    Binary,
}

impl WireFormat {
    /// Parse the `PROTOCOL` config tag.
    pub fn parse(tag: &str) -> Option<WireFormat> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "text" | "json" => Some(WireFormat::Text),
            "binary" => Some(WireFormat::Binary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub dialect: Dialect,
    pub format: WireFormat,
    pub validate: bool,
    pub adapt: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            dialect: Dialect::A,
            format: WireFormat::Text,
            validate: true,
            adapt: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(#[from] RowError),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Cumulative pipeline counters.
#[derive(Debug, Default)]
struct PipelineMetrics {
    operations: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    objects_processed: AtomicU64,
    validate_micros: AtomicU64,
    adapt_micros: AtomicU64,
    codec_micros: AtomicU64,
}

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineMetricsSnapshot {
    pub operations: u64,
    pub successes: u64,
    pub failures: u64,
    pub objects_processed: u64,
    pub validate_micros: u64,
    pub adapt_micros: u64,
    pub codec_micros: u64,
    pub unknown_fields_seen: u64,
}

pub struct SerializationPipeline {
    config: PipelineConfig,
    adapter: DialectAdapter,
    metrics: PipelineMetrics,
}

impl SerializationPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        let adapter = DialectAdapter::new(config.dialect);
        SerializationPipeline {
            config,
            adapter,
            metrics: PipelineMetrics::default(),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.config.dialect
    }

    pub fn format(&self) -> WireFormat {
        self.config.format
    }

    /// Serialize one row: validate, adapt, encode.
    pub fn serialize(&self, type_name: &str, row: &TableRow) -> Result<Vec<u8>, PipelineError> {
        self.metrics.operations.fetch_add(1, Ordering::Relaxed);
        let result = self.serialize_inner(type_name, row);
        self.record_outcome(&result);
        result
    }

    /// Deserialize one row: decode, adapt-reverse, validate.
    pub fn deserialize(&self, type_name: &str, bytes: &[u8]) -> Result<TableRow, PipelineError> {
        self.metrics.operations.fetch_add(1, Ordering::Relaxed);
        let result = self.deserialize_inner(type_name, bytes);
        self.record_outcome(&result);
        result
    }

    /// Serialize a homogeneous batch. Per-element failures are reported in
    /// place; the batch itself never aborts.
    pub fn serialize_batch(
        &self,
        type_name: &str,
        rows: &[TableRow],
    ) -> Vec<Result<Vec<u8>, PipelineError>> {
        rows.iter().map(|r| self.serialize(type_name, r)).collect()
    }

    /// Deserialize a homogeneous batch with per-element error reporting.
    pub fn deserialize_batch(
        &self,
        type_name: &str,
        frames: &[Vec<u8>],
    ) -> Vec<Result<TableRow, PipelineError>> {
        frames
            .iter()
            .map(|f| self.deserialize(type_name, f))
            .collect()
    }

    /// Apply the inbound adapt+validate stages to an already-decoded row,
    /// as used for rows arriving inside stream messages.
    pub fn adapt_inbound(&self, type_name: &str, row: &TableRow) -> Result<TableRow, PipelineError> {
        let adapted = if self.config.adapt {
            let start = Instant::now();
            let adapted = self.adapter.from_server(row, type_name);
            self.record_stage(&self.metrics.adapt_micros, start);
            adapted
        } else {
            row.clone()
        };
        self.validate_stage(type_name, &adapted)?;
        Ok(adapted)
    }

    /// Apply the outbound validate+adapt stages without encoding.
    pub fn adapt_outbound(
        &self,
        type_name: &str,
        row: &TableRow,
    ) -> Result<TableRow, PipelineError> {
        self.validate_stage(type_name, row)?;
        if self.config.adapt {
            let start = Instant::now();
            let adapted = self.adapter.to_server(row, type_name);
            self.record_stage(&self.metrics.adapt_micros, start);
            Ok(adapted)
        } else {
            Ok(row.clone())
        }
    }

    pub fn metrics(&self) -> PipelineMetricsSnapshot {
        PipelineMetricsSnapshot {
            operations: self.metrics.operations.load(Ordering::Relaxed),
            successes: self.metrics.successes.load(Ordering::Relaxed),
            failures: self.metrics.failures.load(Ordering::Relaxed),
            objects_processed: self.metrics.objects_processed.load(Ordering::Relaxed),
            validate_micros: self.metrics.validate_micros.load(Ordering::Relaxed),
            adapt_micros: self.metrics.adapt_micros.load(Ordering::Relaxed),
            codec_micros: self.metrics.codec_micros.load(Ordering::Relaxed),
            unknown_fields_seen: self.adapter.unknown_fields_seen(),
        }
    }

    // -- internal --

    fn serialize_inner(&self, type_name: &str, row: &TableRow) -> Result<Vec<u8>, PipelineError> {
        let adapted = self.adapt_outbound(type_name, row)?;
        let start = Instant::now();
        let encoded = match self.config.format {
            WireFormat::Text => serde_json::to_vec(&adapted)
                .map_err(|e| PipelineError::Encode(e.to_string()))?,
            WireFormat::Binary => {
                let payload = serde_json::to_vec(&adapted)
                    .map_err(|e| PipelineError::Encode(e.to_string()))?;
                binary::encode_frame(&payload)
            }
        };
        self.record_stage(&self.metrics.codec_micros, start);
        Ok(encoded)
    }

    fn deserialize_inner(&self, type_name: &str, bytes: &[u8]) -> Result<TableRow, PipelineError> {
        let start = Instant::now();
        let decoded: TableRow = match self.config.format {
            WireFormat::Text => serde_json::from_slice(bytes)
                .map_err(|e| PipelineError::Decode(e.to_string()))?,
            WireFormat::Binary => {
                let payload = binary::decode_frame(bytes)
                    .map_err(|e| PipelineError::Decode(e.to_string()))?;
                serde_json::from_slice(&payload)
                    .map_err(|e| PipelineError::Decode(e.to_string()))?
            }
        };
        self.record_stage(&self.metrics.codec_micros, start);
        self.adapt_inbound(type_name, &decoded)
    }

    fn validate_stage(&self, type_name: &str, row: &TableRow) -> Result<(), PipelineError> {
        if !self.config.validate {
            return Ok(());
        }
        if let Some(schema) = schema_for(type_name) {
            let start = Instant::now();
            let result = schema.validate(row);
            self.record_stage(&self.metrics.validate_micros, start);
            result?;
        }
        Ok(())
    }

    fn record_stage(&self, counter: &AtomicU64, start: Instant) {
        counter.fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
    }

    fn record_outcome<T>(&self, result: &Result<T, PipelineError>) {
        match result {
            Ok(_) => {
                self.metrics.successes.fetch_add(1, Ordering::Relaxed);
                self.metrics.objects_processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
