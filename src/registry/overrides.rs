//! Local registry overrides.
//!
//! Two maps from resolver identifier to content identifier: mappings the user
//! saved (pinned versions, persisted as JSON) and the configured defaults.
//! Saved mappings always win.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::identifier::{Identifier, IdentifierKind};

/// Saved and default resolver mappings.
#[derive(Debug, Clone, Default)]
pub struct RegistryOverrides {
    saved: BTreeMap<String, Identifier>,
    defaults: BTreeMap<String, Identifier>,
    path: Option<PathBuf>,
}

impl RegistryOverrides {
    /// Build from in-memory maps. Nothing is persisted.
    pub fn new(
        saved: BTreeMap<String, Identifier>,
        defaults: BTreeMap<String, Identifier>,
    ) -> Self {
        Self {
            saved,
            defaults,
            path: None,
        }
    }

    /// Load saved mappings from `path` (missing file means none) and merge in
    /// configured defaults. Entries that do not parse are skipped with a
    /// warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or is not a
    /// JSON object of strings.
    pub fn load(path: &Path, defaults: &BTreeMap<String, String>) -> Result<Self> {
        let saved = match std::fs::read_to_string(path) {
            Ok(contents) => {
                let raw: BTreeMap<String, String> = serde_json::from_str(&contents)
                    .with_context(|| format!("failed to parse overrides {}", path.display()))?;
                validated(raw, "saved override")
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read overrides {}", path.display()))
            }
        };
        Ok(Self {
            saved,
            defaults: validated(defaults.clone(), "default registry entry"),
            path: Some(path.to_path_buf()),
        })
    }

    /// Target for `resolver`, saved mappings first.
    pub fn get(&self, resolver: &Identifier) -> Option<&Identifier> {
        self.saved
            .get(resolver.as_str())
            .or_else(|| self.defaults.get(resolver.as_str()))
    }

    /// Pin `resolver` to `target` and persist.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifiers have the wrong kinds or the file
    /// cannot be written.
    pub fn pin(&mut self, resolver: &Identifier, target: &Identifier) -> Result<()> {
        anyhow::ensure!(
            resolver.kind() == IdentifierKind::Resolver,
            "{resolver} is not a resolver identifier"
        );
        anyhow::ensure!(
            target.kind() == IdentifierKind::Content,
            "{target} is not a content identifier"
        );
        self.saved
            .insert(resolver.as_str().to_owned(), target.clone());
        info!(resolver = %resolver, target = %target, "registry override saved");
        self.save()
    }

    /// Remove a saved mapping and persist. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn unpin(&mut self, resolver: &Identifier) -> Result<bool> {
        let existed = self.saved.remove(resolver.as_str()).is_some();
        if existed {
            info!(resolver = %resolver, "registry override removed");
            self.save()?;
        }
        Ok(existed)
    }

    /// Saved mappings, in identifier order.
    pub fn saved(&self) -> impl Iterator<Item = (&str, &Identifier)> {
        self.saved.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let raw: BTreeMap<&str, &str> = self
            .saved
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let json = serde_json::to_string_pretty(&raw).context("failed to encode overrides")?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write overrides {}", path.display()))
    }
}

fn validated(raw: BTreeMap<String, String>, what: &str) -> BTreeMap<String, Identifier> {
    raw.into_iter()
        .filter_map(|(resolver, target)| {
            let parsed = Identifier::parse(&resolver)
                .ok()
                .filter(Identifier::is_resolver)
                .zip(
                    Identifier::parse(&target)
                        .ok()
                        .filter(|t| t.kind() == IdentifierKind::Content),
                );
            match parsed {
                Some((resolver, target)) => Some((resolver.as_str().to_owned(), target)),
                None => {
                    warn!(%resolver, %target, "ignoring invalid {what}");
                    None
                }
            }
        })
        .collect()
}
