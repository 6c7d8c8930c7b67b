//! Single-file SQLite store owned by one repository.

pub mod schema;
pub mod tables;

use std::path::{Path, PathBuf};

use log::debug;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use uuid::Uuid;

use crate::error::{Result, TrialError};

pub use schema::{SchemaMigrator, SqliteMigrator};
pub use tables::StoredRecord;

const LOCAL_SITE_KEY: &str = "local_site_identity";

/// Exclusive handle on a store file.
///
/// The connection is dropped while the file itself is copied or replaced
/// (see [`Store::release`]) and reopened afterwards.
#[derive(Debug)]
pub struct Store {
	path: PathBuf,
	conn: Option<Connection>,
}

impl Store {
	/// Migrate the file if needed and open it.
	pub fn open(path: impl Into<PathBuf>, migrator: &dyn SchemaMigrator) -> Result<Self> {
		let path = path.into();
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		if migrator.apply_pending(&path)? {
			debug!("migrated store {}", path.display());
		}
		let conn = Self::connect(&path)?;
		Ok(Self {
			path,
			conn: Some(conn),
		})
	}

	/// Open an existing file read-write without migrating it.
	pub fn open_unmigrated(path: impl Into<PathBuf>) -> Result<Self> {
		let path = path.into();
		let conn = Self::connect(&path)?;
		Ok(Self {
			path,
			conn: Some(conn),
		})
	}

	fn connect(path: &Path) -> Result<Connection> {
		let conn = Connection::open(path)?;
		// Rollback journal keeps the store a single file that can be zipped as is.
		let _mode: String =
			conn.pragma_update_and_check(None, "journal_mode", "DELETE", |row| row.get(0))?;
		Ok(conn)
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn conn(&self) -> Result<&Connection> {
		self.conn.as_ref().ok_or(TrialError::StoreReleased)
	}

	/// Run `f` inside one transaction. Any error rolls the whole operation back.
	pub fn atomically<T>(&mut self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
		let conn = self.conn.as_mut().ok_or(TrialError::StoreReleased)?;
		let tx = conn.transaction()?;
		let value = f(&tx)?;
		tx.commit()?;
		Ok(value)
	}

	/// Close the connection, hand the file to `f`, then reopen.
	///
	/// The store is reopened even when `f` fails.
	pub fn release<T>(&mut self, f: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
		if let Some(conn) = self.conn.take() {
			if let Err((conn, e)) = conn.close() {
				// Still open; keep it so the store stays usable.
				self.conn = Some(conn);
				return Err(e.into());
			}
		}
		let outcome = f(&self.path);
		self.conn = Some(Self::connect(&self.path)?);
		outcome
	}

	pub fn close(mut self) -> Result<()> {
		if let Some(conn) = self.conn.take() {
			conn.close().map_err(|(_, e)| e)?;
		}
		Ok(())
	}
}

pub fn meta_value(conn: &Connection, key: &str) -> Result<Option<String>> {
	let value = conn
		.query_row(
			"SELECT value FROM store_meta WHERE key = ?1",
			params![key],
			|row| row.get(0),
		)
		.optional()?;
	Ok(value)
}

pub fn set_meta_value(conn: &Connection, key: &str, value: &str) -> Result<()> {
	conn.execute(
		"INSERT OR REPLACE INTO store_meta (key, value) VALUES (?1, ?2)",
		params![key, value],
	)?;
	Ok(())
}

/// Identity of the site this store belongs to, once provisioned.
pub fn local_site_identity(conn: &Connection) -> Result<Option<Uuid>> {
	Ok(meta_value(conn, LOCAL_SITE_KEY)?.and_then(|v| Uuid::parse_str(&v).ok()))
}

pub fn set_local_site_identity(conn: &Connection, identity: Uuid) -> Result<()> {
	set_meta_value(conn, LOCAL_SITE_KEY, &identity.to_string())
}
