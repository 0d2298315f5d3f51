//! Schema migration support.
//!
//! Migrations upgrade the persisted layout across app versions already in
//! the field. They are:
//! - **Forward-only**: no automatic rollback of applied versions.
//! - **Ordered**: versions are unique and sequential from 1.
//! - **Idempotent**: applied versions are recorded in the store and
//!   re-running the runner is a no-op, checked against the recorded set
//!   rather than re-derived from the data.
//! - **Atomic per step**: a step's data changes, the bumped schema version,
//!   and the applied-version entry commit together; a failed step changes
//!   nothing and aborts the run.
//!
//! Migration must complete before any other component touches the store;
//! a [`StoreError::MigrationFailed`] is fatal at startup.

use crate::error::{StoreError, StoreResult};
use crate::store::{LocalStore, MigrationTxn};
use std::collections::BTreeMap;
use tracing::info;

/// A single ordered schema change.
pub trait Migration: Send + Sync {
    /// Version of this step. Versions are unique and sequential from 1.
    fn version(&self) -> u64;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// Optional description.
    fn description(&self) -> Option<&str> {
        None
    }

    /// Applies the step. Must be safe to re-run against already-transformed
    /// data (the runner guards with the applied set, but steps on partially
    /// upgraded fleets may see either shape).
    fn up(&self, txn: &mut MigrationTxn<'_>) -> StoreResult<()>;
}

/// Runs registered migrations against a store at startup.
pub struct MigrationRunner {
    migrations: BTreeMap<u64, Box<dyn Migration>>,
}

impl MigrationRunner {
    /// Creates an empty runner.
    pub fn new() -> Self {
        Self {
            migrations: BTreeMap::new(),
        }
    }

    /// Registers a migration step.
    ///
    /// Returns an error if a step with the same version is already
    /// registered.
    pub fn register(&mut self, migration: Box<dyn Migration>) -> StoreResult<()> {
        let version = migration.version();
        if self.migrations.contains_key(&version) {
            return Err(StoreError::migration_failed(
                version,
                "version already registered",
            ));
        }
        self.migrations.insert(version, migration);
        Ok(())
    }

    /// Validates that registered versions are sequential from 1 with no gaps.
    pub fn validate(&self) -> StoreResult<()> {
        for (i, version) in self.migrations.keys().enumerate() {
            let expected = (i + 1) as u64;
            if *version != expected {
                return Err(StoreError::migration_failed(
                    *version,
                    format!("version gap: expected {expected}"),
                ));
            }
        }
        Ok(())
    }

    /// Returns versions that have not been applied to the store yet.
    pub fn pending(&self, store: &LocalStore) -> Vec<u64> {
        self.migrations
            .keys()
            .copied()
            .filter(|v| !store.is_applied(*v))
            .collect()
    }

    /// Applies all pending steps in ascending version order.
    ///
    /// Returns the resulting schema version. Re-running on a current store
    /// is a no-op. On the first failing step the run aborts with a fatal
    /// [`StoreError::MigrationFailed`]; the caller must refuse to proceed.
    pub fn migrate(&self, store: &LocalStore) -> StoreResult<u64> {
        self.validate()?;

        for (version, migration) in &self.migrations {
            if store.is_applied(*version) {
                continue;
            }
            store.run_migration(*version, migration.name(), |txn| migration.up(txn))?;
            info!(version, name = migration.name(), "migration applied");
        }

        Ok(store.schema_version())
    }
}

impl Default for MigrationRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use serde_json::json;

    struct AddStatusField;

    impl Migration for AddStatusField {
        fn version(&self) -> u64 {
            1
        }
        fn name(&self) -> &str {
            "add_status_field"
        }
        fn up(&self, txn: &mut MigrationTxn<'_>) -> StoreResult<()> {
            txn.add_field_default("order", "status", json!("open"));
            Ok(())
        }
    }

    struct RenamePhone;

    impl Migration for RenamePhone {
        fn version(&self) -> u64 {
            2
        }
        fn name(&self) -> &str {
            "rename_phone_to_mobile"
        }
        fn up(&self, txn: &mut MigrationTxn<'_>) -> StoreResult<()> {
            txn.rename_field("contact", "phone", "mobile");
            Ok(())
        }
    }

    struct Failing {
        version: u64,
    }

    impl Migration for Failing {
        fn version(&self) -> u64 {
            self.version
        }
        fn name(&self) -> &str {
            "failing"
        }
        fn up(&self, txn: &mut MigrationTxn<'_>) -> StoreResult<()> {
            // Mutate before failing to prove the rollback discards it.
            txn.put(Record::new("junk", 1));
            Err(StoreError::invalid_operation("boom"))
        }
    }

    fn seeded_store() -> LocalStore {
        let store = LocalStore::in_memory().unwrap();
        store
            .upsert(Record::new("contact", 1).with_field("phone", json!("555")))
            .unwrap();
        store.upsert(Record::new("order", 1)).unwrap();
        store
    }

    #[test]
    fn migrate_fresh_store_applies_all() {
        let store = seeded_store();
        let mut runner = MigrationRunner::new();
        runner.register(Box::new(AddStatusField)).unwrap();
        runner.register(Box::new(RenamePhone)).unwrap();

        let version = runner.migrate(&store).unwrap();
        assert_eq!(version, 2);
        assert_eq!(store.schema_version(), 2);

        let order = store.get("order", 1).unwrap();
        assert_eq!(order.field("status"), Some(&json!("open")));
        let contact = store.get("contact", 1).unwrap();
        assert_eq!(contact.field("mobile"), Some(&json!("555")));
        assert!(contact.field("phone").is_none());
    }

    #[test]
    fn migrate_twice_is_idempotent() {
        let store = seeded_store();
        let mut runner = MigrationRunner::new();
        runner.register(Box::new(AddStatusField)).unwrap();
        runner.register(Box::new(RenamePhone)).unwrap();

        let first = runner.migrate(&store).unwrap();
        let second = runner.migrate(&store).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.schema_version(), 2);
        assert!(store.is_applied(1));
        assert!(store.is_applied(2));
        assert!(runner.pending(&store).is_empty());
    }

    #[test]
    fn duplicate_version_rejected() {
        let mut runner = MigrationRunner::new();
        runner.register(Box::new(AddStatusField)).unwrap();
        assert!(runner.register(Box::new(AddStatusField)).is_err());
    }

    #[test]
    fn version_gap_rejected() {
        let mut runner = MigrationRunner::new();
        runner.register(Box::new(AddStatusField)).unwrap();
        runner.register(Box::new(Failing { version: 3 })).unwrap();
        assert!(runner.validate().is_err());
        assert!(runner.migrate(&LocalStore::in_memory().unwrap()).is_err());
    }

    #[test]
    fn failed_step_rolls_back_and_aborts() {
        let store = seeded_store();
        let mut runner = MigrationRunner::new();
        runner.register(Box::new(AddStatusField)).unwrap();
        runner.register(Box::new(Failing { version: 2 })).unwrap();

        let err = runner.migrate(&store).unwrap_err();
        assert!(matches!(
            err,
            StoreError::MigrationFailed { version: 2, .. }
        ));

        // Step 1 committed, step 2 left no trace.
        assert_eq!(store.schema_version(), 1);
        assert!(store.is_applied(1));
        assert!(!store.is_applied(2));
        assert!(store.get("junk", 1).is_none());
    }

    #[test]
    fn resumes_from_recorded_version_not_data_shape() {
        let store = seeded_store();
        let mut first = MigrationRunner::new();
        first.register(Box::new(AddStatusField)).unwrap();
        first.migrate(&store).unwrap();

        // A later app release registers both steps; only step 2 runs.
        let mut second = MigrationRunner::new();
        second.register(Box::new(AddStatusField)).unwrap();
        second.register(Box::new(RenamePhone)).unwrap();
        assert_eq!(second.pending(&store), vec![2]);
        assert_eq!(second.migrate(&store).unwrap(), 2);
    }
}
