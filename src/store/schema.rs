use std::path::Path;

use log::{debug, info};
use rusqlite::Connection;

use crate::error::Result;

/// Applies pending schema migrations to a store file.
///
/// Returns `true` when at least one migration had to run. Callers use a
/// `false` answer to skip re-checking a file they have already confirmed.
pub trait SchemaMigrator {
	fn apply_pending(&self, store_file: &Path) -> Result<bool>;
}

/// Ordered schema steps. Index `n` upgrades a store from `user_version = n`
/// to `n + 1`. Never edit a released step; append a new one.
const MIGRATIONS: &[&str] = &[
	// 1: base schema
	"CREATE TABLE IF NOT EXISTS sites (
		id                       INTEGER PRIMARY KEY,
		site_id                  INTEGER NOT NULL,
		max_id                   INTEGER NOT NULL,
		identity                 TEXT NOT NULL UNIQUE,
		name                     TEXT NOT NULL,
		hospital_identifier_mask TEXT NOT NULL DEFAULT '',
		phone_mask               TEXT NOT NULL DEFAULT '',
		argb_text_colour         INTEGER NOT NULL DEFAULT 0,
		argb_background_colour   INTEGER NOT NULL DEFAULT 0,
		last_modified            INTEGER NOT NULL
	);
	CREATE TABLE IF NOT EXISTS participants (
		id                          INTEGER PRIMARY KEY,
		site_id                     INTEGER NOT NULL,
		name                        TEXT NOT NULL,
		mothers_name                TEXT NOT NULL DEFAULT '',
		hospital_identifier         TEXT NOT NULL,
		admission_weight            INTEGER NOT NULL,
		gestational_age_weeks       REAL NOT NULL,
		born_at                     INTEGER NOT NULL,
		admission_diagnosis         TEXT NOT NULL DEFAULT '',
		phone_number                TEXT NOT NULL DEFAULT '',
		is_male                     INTEGER NOT NULL,
		inborn                      INTEGER,
		registered_at               INTEGER NOT NULL,
		registering_investigator    TEXT NOT NULL DEFAULT '',
		is_intervention_arm         INTEGER NOT NULL,
		was_envelope_randomised     INTEGER NOT NULL DEFAULT 0,
		block_number                INTEGER,
		block_size                  INTEGER NOT NULL DEFAULT 0,
		multiple_sibling_id         INTEGER,
		outcome_at_28_days          TEXT NOT NULL DEFAULT 'pending',
		cause_of_death              TEXT NOT NULL DEFAULT 'not_applicable',
		other_cause_of_death_detail TEXT,
		bcg_adverse                 INTEGER,
		bcg_adverse_detail          TEXT,
		bcg_papule                  INTEGER,
		last_contact_weight         INTEGER,
		last_weight_date            INTEGER,
		discharged_at               INTEGER,
		death_or_last_contact_at    INTEGER,
		notes                       TEXT,
		app_version                 TEXT NOT NULL DEFAULT '',
		last_modified               INTEGER NOT NULL
	);
	CREATE TABLE IF NOT EXISTS screened_patients (
		id                    INTEGER PRIMARY KEY,
		site_id               INTEGER NOT NULL,
		name                  TEXT NOT NULL,
		mothers_name          TEXT NOT NULL DEFAULT '',
		hospital_identifier   TEXT NOT NULL,
		admission_weight      INTEGER NOT NULL,
		gestational_age_weeks REAL NOT NULL,
		born_at               INTEGER NOT NULL,
		is_male               INTEGER NOT NULL,
		inborn                INTEGER,
		registered_at         INTEGER NOT NULL,
		bad_infection_immune  INTEGER NOT NULL DEFAULT 0,
		bad_malformation      INTEGER NOT NULL DEFAULT 0,
		likely_die_24hr       INTEGER NOT NULL DEFAULT 0,
		was_given_bcg_prior   INTEGER NOT NULL DEFAULT 0,
		refused_consent       INTEGER,
		missed                INTEGER,
		app_version           TEXT NOT NULL DEFAULT '',
		last_modified         INTEGER NOT NULL
	);
	CREATE TABLE IF NOT EXISTS vaccines (
		id            INTEGER PRIMARY KEY,
		site_id       INTEGER NOT NULL,
		name          TEXT NOT NULL,
		last_modified INTEGER NOT NULL
	);
	CREATE TABLE IF NOT EXISTS vaccines_administered (
		id              INTEGER PRIMARY KEY,
		site_id         INTEGER NOT NULL,
		participant_id  INTEGER NOT NULL,
		vaccine_id      INTEGER NOT NULL,
		administered_at INTEGER NOT NULL,
		last_modified   INTEGER NOT NULL
	);
	CREATE TABLE IF NOT EXISTS protocol_violations (
		id                     INTEGER PRIMARY KEY,
		site_id                INTEGER NOT NULL,
		participant_id         INTEGER NOT NULL,
		severity               TEXT NOT NULL DEFAULT 'minor',
		detected               TEXT,
		details                TEXT NOT NULL,
		reported_at            INTEGER NOT NULL,
		reporting_investigator TEXT NOT NULL DEFAULT '',
		last_modified          INTEGER NOT NULL
	);
	CREATE TABLE IF NOT EXISTS allocation_blocks (
		site_id      INTEGER NOT NULL,
		is_male      INTEGER NOT NULL,
		heavy        INTEGER NOT NULL,
		block_number INTEGER NOT NULL,
		block_size   INTEGER NOT NULL,
		sequence     TEXT NOT NULL,
		consumed     TEXT NOT NULL,
		PRIMARY KEY (site_id, is_male, heavy, block_number)
	);
	CREATE TABLE IF NOT EXISTS merge_log (
		archive_path TEXT NOT NULL,
		site_id      INTEGER NOT NULL,
		watermark    INTEGER NOT NULL,
		merged_at    INTEGER NOT NULL,
		PRIMARY KEY (archive_path, site_id)
	);
	CREATE TABLE IF NOT EXISTS store_meta (
		key   TEXT PRIMARY KEY,
		value TEXT NOT NULL
	);",
	// 2: watermark and ownership indexes used by export checks and merge pulls
	"CREATE INDEX IF NOT EXISTS idx_participants_modified ON participants(last_modified);
	CREATE INDEX IF NOT EXISTS idx_participants_site ON participants(site_id);
	CREATE INDEX IF NOT EXISTS idx_screened_modified ON screened_patients(last_modified);
	CREATE INDEX IF NOT EXISTS idx_screened_site ON screened_patients(site_id);
	CREATE INDEX IF NOT EXISTS idx_vaccines_administered_participant ON vaccines_administered(participant_id);
	CREATE INDEX IF NOT EXISTS idx_vaccines_administered_modified ON vaccines_administered(last_modified);
	CREATE INDEX IF NOT EXISTS idx_violations_modified ON protocol_violations(last_modified);
	CREATE INDEX IF NOT EXISTS idx_violations_participant ON protocol_violations(participant_id);",
];

pub const SCHEMA_VERSION: usize = MIGRATIONS.len();

/// Migrator driven by SQLite's `user_version` pragma.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteMigrator;

impl SqliteMigrator {
	/// Apply pending steps on an open connection, each in its own transaction.
	pub fn migrate(conn: &mut Connection) -> Result<bool> {
		let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
		let current = usize::try_from(current).unwrap_or(0);
		if current >= MIGRATIONS.len() {
			return Ok(false);
		}

		for (index, step) in MIGRATIONS.iter().enumerate().skip(current) {
			let tx = conn.transaction()?;
			tx.execute_batch(step)?;
			tx.pragma_update(None, "user_version", (index + 1) as i64)?;
			tx.commit()?;
			debug!("applied schema migration {}", index + 1);
		}
		info!("store schema upgraded from version {} to {}", current, MIGRATIONS.len());
		Ok(true)
	}
}

impl SchemaMigrator for SqliteMigrator {
	fn apply_pending(&self, store_file: &Path) -> Result<bool> {
		let mut conn = Connection::open(store_file)?;
		let migrated = Self::migrate(&mut conn)?;
		conn.close().map_err(|(_, e)| e)?;
		Ok(migrated)
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn fresh_store_migrates_once() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("TrialData.db");

		assert!(SqliteMigrator.apply_pending(&path).expect("first migration"));
		assert!(!SqliteMigrator.apply_pending(&path).expect("second check"));

		let conn = Connection::open(&path).expect("open");
		let version: i64 = conn
			.query_row("PRAGMA user_version", [], |row| row.get(0))
			.expect("version");
		assert_eq!(version as usize, SCHEMA_VERSION);
	}

	#[test]
	fn partially_migrated_store_only_runs_remaining_steps() {
		let mut conn = Connection::open_in_memory().expect("open");
		conn.execute_batch(MIGRATIONS[0]).expect("base schema");
		conn.pragma_update(None, "user_version", 1i64).expect("pragma");

		assert!(SqliteMigrator::migrate(&mut conn).expect("migrate"));
		let indexes: i64 = conn
			.query_row(
				"SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_%'",
				[],
				|row| row.get(0),
			)
			.expect("count");
		assert!(indexes > 0);
	}
}
