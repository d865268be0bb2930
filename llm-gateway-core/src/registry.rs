//! # Provider Registry
//!
//! Process-wide, name-keyed ownership of provider adapters. Mutation is
//! serialized behind the write half of a read-write lock; reads take the
//! read half and copy out `Arc` handles, so enumeration never blocks
//! concurrent lookups. All enumerations return providers in lexicographic
//! name order so downstream selection is deterministic.

use crate::health::HealthMonitor;
use crate::providers::{Provider, ProviderType};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("provider {0} is already registered")]
    Duplicate(String),
    #[error("provider {0} is not registered")]
    NotFound(String),
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its name. Fails on duplicates; a provider
    /// is addressable only while its registration is active.
    pub fn register(&self, provider: Arc<dyn Provider>) -> Result<(), RegistryError> {
        let name = provider.name().to_string();
        let mut providers = self.providers.write().unwrap();
        if providers.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        tracing::info!(provider = %name, "registered provider");
        providers.insert(name, provider);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.read().unwrap().get(name).cloned()
    }

    /// Remove a provider, dropping its registration atomically.
    pub fn remove(&self, name: &str) -> Result<Arc<dyn Provider>, RegistryError> {
        let removed = self.providers.write().unwrap().remove(name);
        match removed {
            Some(provider) => {
                tracing::info!(provider = %name, "removed provider");
                Ok(provider)
            }
            None => Err(RegistryError::NotFound(name.to_string())),
        }
    }

    /// All registered providers, sorted by name.
    pub fn enumerate(&self) -> Vec<Arc<dyn Provider>> {
        let providers = self.providers.read().unwrap();
        let mut all: Vec<_> = providers.values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Providers the health monitor currently considers routable, sorted by
    /// name. Reads cached verdicts only; no probe is issued on this path.
    pub fn enumerate_healthy(&self, health: &HealthMonitor) -> Vec<Arc<dyn Provider>> {
        self.enumerate()
            .into_iter()
            .filter(|p| health.is_routable(p.name()))
            .collect()
    }

    /// Providers of one wire dialect, sorted by name.
    pub fn enumerate_by_type(&self, provider_type: ProviderType) -> Vec<Arc<dyn Provider>> {
        self.enumerate()
            .into_iter()
            .filter(|p| p.provider_type() == provider_type)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.providers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().unwrap().is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.enumerate().iter().map(|p| p.name().to_string()).collect()
    }
}
