//! Configuration surface consumed by the publisher.
//!
//! Mirrors the agent's `file_paths` configuration section: include patterns
//! grouped by category, plus a flat set of exclude patterns. Changes are
//! picked up on the next `configure()` call, never live.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Include and exclude path patterns, grouped by category.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilePathsConfig {
    /// Category name -> include patterns to monitor.
    #[serde(default)]
    pub file_paths: BTreeMap<String, Vec<String>>,

    /// Category name -> literal paths excluded from firing.
    #[serde(default)]
    pub exclude_paths: BTreeMap<String, Vec<String>>,
}

impl FilePathsConfig {
    /// Parse the configuration from its JSON representation.
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Add an include pattern under a category.
    pub fn watch(mut self, category: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.file_paths
            .entry(category.into())
            .or_default()
            .push(pattern.into());
        self
    }

    /// Add an exclude path under a category.
    pub fn exclude(mut self, category: impl Into<String>, path: impl Into<String>) -> Self {
        self.exclude_paths
            .entry(category.into())
            .or_default()
            .push(path.into());
        self
    }

    /// Flatten the include section into subscriptions. Empty patterns are
    /// skipped.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut subs = Vec::new();
        for (category, patterns) in &self.file_paths {
            for pattern in patterns {
                if pattern.is_empty() {
                    continue;
                }
                subs.push(Subscription {
                    pattern: pattern.clone(),
                    recursive: false,
                    category: category.clone(),
                });
            }
        }
        subs
    }

    /// Flatten the exclude section into the literal excluded path set.
    /// Empty patterns are skipped.
    pub fn exclude_set(&self) -> Vec<String> {
        self.exclude_paths
            .values()
            .flatten()
            .filter(|path| !path.is_empty())
            .cloned()
            .collect()
    }
}

/// One configured monitoring request: a path pattern, whether the subtree
/// should be monitored, and the config category it originated from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub pattern: String,
    pub recursive: bool,
    pub category: String,
}

impl Subscription {
    pub fn new(pattern: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            recursive: false,
            category: category.into(),
        }
    }
}
