use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::model::RecordKind;

/// Errors raised by allocation, randomisation, export and merge.
///
/// `DuplicateSiteKey` and `OverlappingRange` are fatal for the archive being
/// merged: they are detected before any row is written, so the local store is
/// left untouched and an operator has to resolve the site ranges.
#[derive(Debug, Error)]
pub enum TrialError {
	#[error("identifier range exhausted for {kind} at site {site_id} (max id {max_id})")]
	RangeExhausted {
		kind: RecordKind,
		site_id: i64,
		max_id: i64,
	},

	#[error("identifier {id} lies outside the range reserved for site {site_id}")]
	IdOutOfRange { id: i64, site_id: i64 },

	#[error("no sealed envelope numbered {0}")]
	EnvelopeNotFound(i64),

	#[error("envelope {0} has already been opened")]
	EnvelopeAlreadyUsed(i64),

	#[error("duplicate key for site id {site_id} (identities {existing} and {incoming})")]
	DuplicateSiteKey {
		site_id: i64,
		existing: Uuid,
		incoming: Uuid,
	},

	#[error(
		"overlapping site ranges: existing site ids {}-{}, new site ids {}-{}",
		existing.0, existing.1, incoming.0, incoming.1
	)]
	OverlappingRange {
		existing: (i64, i64),
		incoming: (i64, i64),
	},

	#[error("invalid archive entry in {path}: expected '.{expected}' but found '{found}'")]
	InvalidArchiveEntry {
		path: PathBuf,
		expected: String,
		found: String,
	},

	#[error("unreadable archive {path}: {reason}")]
	UnreadableArchive { path: PathBuf, reason: String },

	#[error("unknown site {0}")]
	UnknownSite(i64),

	#[error("participant {0} not found")]
	ParticipantNotFound(i64),

	#[error("participant cannot be linked to sibling {sibling_id}: {reason}")]
	InvalidSibling { sibling_id: i64, reason: String },

	#[error("no local site has been provisioned for this store")]
	NoLocalSite,

	#[error("invalid input: {0}")]
	Validation(String),

	#[error("store connection is released")]
	StoreReleased,

	#[error("store error: {0}")]
	Store(#[from] rusqlite::Error),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("archive error: {0}")]
	Archive(#[from] zip::result::ZipError),

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

impl TrialError {
	/// Conditions that require operator intervention before the shared-folder
	/// exchange can continue.
	pub fn is_fatal(&self) -> bool {
		matches!(
			self,
			TrialError::RangeExhausted { .. }
				| TrialError::DuplicateSiteKey { .. }
				| TrialError::OverlappingRange { .. }
		)
	}
}

pub type Result<T, E = TrialError> = std::result::Result<T, E>;
