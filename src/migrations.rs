//! Versioned schema steps for the redb files.
//!
//! Each database file carries a `schema_migrations` table mapping applied
//! version numbers to step names. Opening a store applies every step newer
//! than the highest recorded version, one write transaction per step, in
//! ascending order.

use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    TableDefinition,
    TableError,
    WriteTransaction,
};
use tracing::{debug, info};

use crate::error::{Error, Result};

const SCHEMA_MIGRATIONS: TableDefinition<u64, &str> =
    TableDefinition::new("schema_migrations");

/// One schema step. `apply` runs inside the step's write transaction.
pub struct Migration {
    pub version: u64,
    pub name: &'static str,
    pub apply: fn(&WriteTransaction) -> Result<()>,
}

/// Highest applied version, or 0 for a database that has never been
/// migrated.
pub fn current_version(db: &Database) -> Result<u64> {
    let txn = db.begin_read()?;
    let table = match txn.open_table(SCHEMA_MIGRATIONS) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    Ok(table.last()?.map(|(version, _)| version.value()).unwrap_or(0))
}

/// Bring `db` up to the last step in `steps`. Returns the resulting
/// version.
pub fn apply(db: &Database, label: &str, steps: &[Migration]) -> Result<u64> {
    if steps.windows(2).any(|w| w[0].version >= w[1].version) {
        return Err(Error::Config(format!(
            "{label} migrations are not in strictly ascending order"
        )));
    }

    let latest = steps.last().map(|m| m.version).unwrap_or(0);
    let mut current = current_version(db)?;
    if current > latest {
        return Err(Error::Config(format!(
            "{label} schema version {current} is newer than this build \
             supports ({latest})"
        )));
    }

    let start = current;
    for step in steps.iter().filter(|m| m.version > start) {
        let txn = db.begin_write()?;
        (step.apply)(&txn)?;
        {
            let mut table = txn.open_table(SCHEMA_MIGRATIONS)?;
            table.insert(step.version, step.name)?;
        }
        txn.commit()?;
        info!(db = label, version = step.version, step = step.name, "applied migration");
        current = step.version;
    }

    debug!(db = label, version = current, "schema up to date");
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIDGETS: TableDefinition<&str, u64> = TableDefinition::new("widgets");
    const GADGETS: TableDefinition<&str, u64> = TableDefinition::new("gadgets");

    fn create_widgets(txn: &WriteTransaction) -> Result<()> {
        txn.open_table(WIDGETS)?;
        Ok(())
    }

    fn create_gadgets(txn: &WriteTransaction) -> Result<()> {
        txn.open_table(GADGETS)?;
        Ok(())
    }

    const STEPS: &[Migration] = &[
        Migration {
            version: 1,
            name: "widgets",
            apply: create_widgets,
        },
        Migration {
            version: 2,
            name: "gadgets",
            apply: create_gadgets,
        },
    ];

    fn test_db() -> (tempfile::TempDir, Database) {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::create(tmp.path().join("m.redb")).unwrap();
        (tmp, db)
    }

    #[test]
    fn fresh_database_is_version_zero() {
        let (_tmp, db) = test_db();
        assert_eq!(current_version(&db).unwrap(), 0);
    }

    #[test]
    fn applies_all_steps_in_order() {
        let (_tmp, db) = test_db();
        assert_eq!(apply(&db, "test", STEPS).unwrap(), 2);
        assert_eq!(current_version(&db).unwrap(), 2);

        let txn = db.begin_read().unwrap();
        txn.open_table(WIDGETS).unwrap();
        txn.open_table(GADGETS).unwrap();
    }

    #[test]
    fn reapplying_is_a_no_op() {
        let (_tmp, db) = test_db();
        apply(&db, "test", STEPS).unwrap();
        assert_eq!(apply(&db, "test", STEPS).unwrap(), 2);
    }

    #[test]
    fn resumes_from_recorded_version() {
        let (_tmp, db) = test_db();
        apply(&db, "test", &STEPS[..1]).unwrap();
        assert_eq!(current_version(&db).unwrap(), 1);
        assert_eq!(apply(&db, "test", STEPS).unwrap(), 2);
    }

    #[test]
    fn newer_database_is_rejected() {
        let (_tmp, db) = test_db();
        apply(&db, "test", STEPS).unwrap();
        assert!(matches!(
            apply(&db, "test", &STEPS[..1]),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn unordered_steps_are_rejected() {
        let (_tmp, db) = test_db();
        let reversed = [
            Migration {
                version: 2,
                name: "gadgets",
                apply: create_gadgets,
            },
            Migration {
                version: 1,
                name: "widgets",
                apply: create_widgets,
            },
        ];
        assert!(apply(&db, "test", &reversed).is_err());
    }
}
