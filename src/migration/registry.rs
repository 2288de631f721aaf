//! Migration registry
//!
//! The registry is the ordered, validated set of migrations a runner works
//! from. It is built once, before any database work, and never mutated
//! afterwards.

use super::error::RegistryError;
use super::migration::{Migration, MigrationId};
use std::collections::{BTreeSet, HashMap};

/// Validated migrations in ascending id order
#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    migrations: Vec<Migration>,
}

impl MigrationRegistry {
    /// Build a registry from `migrations`
    ///
    /// Input order is irrelevant; migrations are sorted by id.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::EmptyApply` if a migration has no apply
    /// operations, `DuplicateId` if two migrations share an id and
    /// `DuplicateName` if two share a name. Migrations are checked in input
    /// order and the first violation is reported.
    pub fn new(migrations: impl IntoIterator<Item = Migration>) -> Result<Self, RegistryError> {
        let mut by_id: HashMap<MigrationId, String> = HashMap::new();
        let mut by_name: HashMap<String, MigrationId> = HashMap::new();
        let mut collected = Vec::new();

        for migration in migrations {
            if migration.apply().is_empty() {
                return Err(RegistryError::EmptyApply {
                    id: migration.id(),
                    name: migration.name().to_string(),
                });
            }
            if let Some(first) = by_id.get(&migration.id()) {
                return Err(RegistryError::DuplicateId {
                    id: migration.id(),
                    first: first.clone(),
                    second: migration.name().to_string(),
                });
            }
            if let Some(first) = by_name.get(migration.name()) {
                return Err(RegistryError::DuplicateName {
                    name: migration.name().to_string(),
                    first: *first,
                    second: migration.id(),
                });
            }
            by_id.insert(migration.id(), migration.name().to_string());
            by_name.insert(migration.name().to_string(), migration.id());
            collected.push(migration);
        }

        collected.sort_by_key(Migration::id);
        log::debug!("Registered {} migration(s)", collected.len());
        Ok(Self {
            migrations: collected,
        })
    }

    /// All migrations, ascending by id
    pub fn ordered_migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Look up a migration by id
    pub fn get(&self, id: MigrationId) -> Option<&Migration> {
        self.migrations
            .binary_search_by_key(&id, Migration::id)
            .ok()
            .map(|idx| &self.migrations[idx])
    }

    pub fn contains(&self, id: MigrationId) -> bool {
        self.get(id).is_some()
    }

    /// All registered ids, ascending
    pub fn ids(&self) -> impl Iterator<Item = MigrationId> + '_ {
        self.migrations.iter().map(Migration::id)
    }

    /// Migrations not in `applied`, ascending by id
    pub fn pending<'a>(&'a self, applied: &'a BTreeSet<MigrationId>) -> impl Iterator<Item = &'a Migration> + 'a {
        self.migrations
            .iter()
            .filter(move |m| !applied.contains(&m.id()))
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}
