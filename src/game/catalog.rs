//! Icon type catalog
//!
//! Static per-type settings the registry consults when a marker is created.

use std::collections::HashMap;

use rand::Rng;

use crate::config::IconTypeConfig;
use crate::marker::IconTypeId;

/// Per-type defaults
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct IconTypeInfo {
    /// Default lifetime in seconds, `None` = unlimited
    pub default_ttl: Option<f64>,
    /// Random extra lifetime in `[0, ttl_jitter]` seconds
    pub ttl_jitter: f64,
}

impl IconTypeInfo {
    pub fn new(default_ttl: Option<f64>, ttl_jitter: f64) -> Self {
        Self {
            default_ttl,
            ttl_jitter,
        }
    }

    /// Roll a concrete lifetime for a new marker of this type
    pub fn roll_lifetime<R: Rng>(&self, rng: &mut R) -> Option<f64> {
        let base = self.default_ttl?.max(0.0);
        if self.ttl_jitter > 0.0 {
            Some(base + rng.gen_range(0.0..=self.ttl_jitter))
        } else {
            Some(base)
        }
    }
}

/// Resolves icon type ids to their settings
pub trait IconTypeRegistry: Send + Sync {
    /// `None` for unknown types
    fn lookup(&self, type_id: &IconTypeId) -> Option<IconTypeInfo>;
}

/// In-memory catalog loaded from configuration
#[derive(Debug, Clone, Default)]
pub struct IconCatalog {
    types: HashMap<IconTypeId, IconTypeInfo>,
}

impl IconCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(entries: &[IconTypeConfig]) -> Self {
        let mut catalog = Self::new();
        for entry in entries {
            catalog.register(
                entry.name.as_str(),
                IconTypeInfo::new(entry.default_ttl_secs, entry.ttl_jitter_secs),
            );
        }
        catalog
    }

    /// Builder-style registration
    pub fn with_type(mut self, type_id: impl Into<IconTypeId>, info: IconTypeInfo) -> Self {
        self.register(type_id, info);
        self
    }

    /// Add or replace a type
    pub fn register(&mut self, type_id: impl Into<IconTypeId>, info: IconTypeInfo) {
        self.types.insert(type_id.into(), info);
    }

    pub fn contains(&self, type_id: &IconTypeId) -> bool {
        self.types.contains_key(type_id)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl IconTypeRegistry for IconCatalog {
    fn lookup(&self, type_id: &IconTypeId) -> Option<IconTypeInfo> {
        self.types.get(type_id).copied()
    }
}
