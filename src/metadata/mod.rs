//! # Metadata Module
//!
//! Descriptive information about parameters (display names, units, ranges).
//!
//! Metadata only decorates cache entries. Loading it is best-effort: the
//! engine logs a failure and keeps synchronizing values without enrichment.

pub mod pdef;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::error::Result;
use crate::protocol::normalize_name;

pub use pdef::PdefCatalog;

/// Descriptive fields for one parameter
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParamMetadata {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub units: Option<String>,
    pub min: Option<f32>,
    pub max: Option<f32>,
    pub default: Option<f32>,
    pub reboot_required: bool,
    /// Enumerated values and their labels
    pub values: BTreeMap<i64, String>,
}

/// Metadata for a whole parameter table, keyed by normalized name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataCatalog {
    entries: HashMap<String, ParamMetadata>,
}

impl MetadataCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry
    pub fn insert(&mut self, name: &str, metadata: ParamMetadata) {
        self.entries.insert(normalize_name(name), metadata);
    }

    /// Look up a parameter by any spelling of its name
    pub fn lookup(&self, name: &str) -> Option<&ParamMetadata> {
        self.entries.get(&normalize_name(name))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Source of parameter metadata
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Load the full catalog
    async fn load(&self) -> Result<MetadataCatalog>;
}

/// Provider for setups without a catalog
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMetadata;

#[async_trait]
impl MetadataProvider for NoMetadata {
    async fn load(&self) -> Result<MetadataCatalog> {
        Ok(MetadataCatalog::new())
    }
}

/// Provider backed by an already-built catalog
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    catalog: MetadataCatalog,
}

impl StaticMetadata {
    pub fn new(catalog: MetadataCatalog) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl MetadataProvider for StaticMetadata {
    async fn load(&self) -> Result<MetadataCatalog> {
        Ok(self.catalog.clone())
    }
}
