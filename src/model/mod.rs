//! Persistent record types shared between sites.
//!
//! Every record kind exposes the same narrow capability set through
//! [`SharedRecord`]: an integer identifier, the site that owns it, and the
//! last-modified watermark used for merge conflict resolution.

pub mod participant;
pub mod records;
pub mod site;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use participant::{
	CauseOfDeath, NewParticipant, Outcome, OutcomeUpdate, Participant, ParticipantEdit,
};
pub use records::{
	NewScreenedPatient, ProtocolViolation, ScreenedPatient, Vaccine, VaccineAdministered,
	VaccineDose, ViolationKind, ViolationSeverity,
};
pub use site::{Site, SiteDraft};

/// Kinds of record kept in the store. Each kind lives in its own table and
/// draws identifiers from the owning site's reserved range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
	Site,
	Participant,
	ScreenedPatient,
	Vaccine,
	VaccineAdministered,
	ProtocolViolation,
}

impl RecordKind {
	/// All kinds, in the order a merge applies them (parents before children).
	pub const ALL: [RecordKind; 6] = [
		RecordKind::Site,
		RecordKind::Vaccine,
		RecordKind::Participant,
		RecordKind::VaccineAdministered,
		RecordKind::ScreenedPatient,
		RecordKind::ProtocolViolation,
	];

	pub fn table(&self) -> &'static str {
		match self {
			Self::Site => "sites",
			Self::Participant => "participants",
			Self::ScreenedPatient => "screened_patients",
			Self::Vaccine => "vaccines",
			Self::VaccineAdministered => "vaccines_administered",
			Self::ProtocolViolation => "protocol_violations",
		}
	}
}

impl fmt::Display for RecordKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.table())
	}
}

/// Capability shared by every record exchanged between sites.
pub trait SharedRecord {
	const KIND: RecordKind;

	fn id(&self) -> i64;

	fn owner_site_id(&self) -> i64;

	fn last_modified(&self) -> DateTime<Utc>;
}

/// Store timestamps are kept at microsecond precision; values compared
/// against stored rows must be truncated the same way.
pub fn to_micros(ts: DateTime<Utc>) -> i64 {
	ts.timestamp_micros()
}

pub fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
	DateTime::from_timestamp_micros(micros)
}

/// Current time truncated to store precision.
pub fn now() -> DateTime<Utc> {
	let ts = Utc::now();
	from_micros(to_micros(ts)).unwrap_or(ts)
}
