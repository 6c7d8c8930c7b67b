//! Partitioned identifier allocation.
//!
//! Each site allocates only inside its own reserved range, so two sites can
//! create records independently and never produce the same identifier.

use rusqlite::Connection;

use crate::error::{Result, TrialError};
use crate::model::{RecordKind, Site};
use crate::store::tables;

/// Next free identifier of `kind` for `site`: the largest existing id in the
/// site's range (or the site id itself when there is none) plus one.
pub fn next_id(conn: &Connection, kind: RecordKind, site: &Site) -> Result<i64> {
	let current = tables::max_id_between(conn, kind, site.id, site.max_id)?.unwrap_or(site.id);
	let next = current.checked_add(1).unwrap_or(i64::MAX);
	if next > site.max_id {
		return Err(TrialError::RangeExhausted {
			kind,
			site_id: site.id,
			max_id: site.max_id,
		});
	}
	Ok(next)
}

/// Reject an identifier the site does not own.
pub fn ensure_owned(site: &Site, id: i64) -> Result<()> {
	if site.contains(id) {
		Ok(())
	} else {
		Err(TrialError::IdOutOfRange {
			id,
			site_id: site.id,
		})
	}
}
