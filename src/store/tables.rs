//! Row mapping for every record kind and the generic queries built on it.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Params, Row, params, params_from_iter};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{
	CauseOfDeath, Outcome, Participant, ProtocolViolation, RecordKind, ScreenedPatient,
	SharedRecord, Site, Vaccine, VaccineAdministered, ViolationKind, ViolationSeverity, from_micros,
	to_micros,
};

/// A record with a table of its own. `COLUMNS` and `to_values` must list
/// the same columns in the same order; `id` comes first.
pub trait StoredRecord: SharedRecord + Sized {
	const COLUMNS: &'static [&'static str];

	fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;

	fn to_values(&self) -> Vec<Value>;
}

fn timestamp(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Utc>> {
	let micros: i64 = row.get(column)?;
	from_micros(micros)
		.ok_or_else(|| rusqlite::Error::IntegralValueOutOfRange(column_index(row, column), micros))
}

fn optional_timestamp(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
	match row.get::<_, Option<i64>>(column)? {
		None => Ok(None),
		Some(micros) => from_micros(micros).map(Some).ok_or_else(|| {
			rusqlite::Error::IntegralValueOutOfRange(column_index(row, column), micros)
		}),
	}
}

fn column_index(row: &Row<'_>, column: &str) -> usize {
	row.as_ref().column_index(column).unwrap_or(0)
}

fn micros(ts: DateTime<Utc>) -> Value {
	Value::Integer(to_micros(ts))
}

fn optional_micros(ts: Option<DateTime<Utc>>) -> Value {
	ts.map(to_micros).into()
}

impl StoredRecord for Site {
	const COLUMNS: &'static [&'static str] = &[
		"id",
		"site_id",
		"max_id",
		"identity",
		"name",
		"hospital_identifier_mask",
		"phone_mask",
		"argb_text_colour",
		"argb_background_colour",
		"last_modified",
	];

	fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
		let identity: String = row.get("identity")?;
		let identity = Uuid::parse_str(&identity).map_err(|e| {
			rusqlite::Error::FromSqlConversionFailure(
				column_index(row, "identity"),
				Type::Text,
				Box::new(e),
			)
		})?;
		Ok(Site {
			id: row.get("id")?,
			max_id: row.get("max_id")?,
			identity,
			name: row.get("name")?,
			hospital_identifier_mask: row.get("hospital_identifier_mask")?,
			phone_mask: row.get("phone_mask")?,
			argb_text_colour: row.get("argb_text_colour")?,
			argb_background_colour: row.get("argb_background_colour")?,
			last_modified: timestamp(row, "last_modified")?,
		})
	}

	fn to_values(&self) -> Vec<Value> {
		vec![
			self.id.into(),
			self.id.into(),
			self.max_id.into(),
			self.identity.to_string().into(),
			self.name.clone().into(),
			self.hospital_identifier_mask.clone().into(),
			self.phone_mask.clone().into(),
			self.argb_text_colour.into(),
			self.argb_background_colour.into(),
			micros(self.last_modified),
		]
	}
}

impl StoredRecord for Participant {
	const COLUMNS: &'static [&'static str] = &[
		"id",
		"site_id",
		"name",
		"mothers_name",
		"hospital_identifier",
		"admission_weight",
		"gestational_age_weeks",
		"born_at",
		"admission_diagnosis",
		"phone_number",
		"is_male",
		"inborn",
		"registered_at",
		"registering_investigator",
		"is_intervention_arm",
		"was_envelope_randomised",
		"block_number",
		"block_size",
		"multiple_sibling_id",
		"outcome_at_28_days",
		"cause_of_death",
		"other_cause_of_death_detail",
		"bcg_adverse",
		"bcg_adverse_detail",
		"bcg_papule",
		"last_contact_weight",
		"last_weight_date",
		"discharged_at",
		"death_or_last_contact_at",
		"notes",
		"app_version",
		"last_modified",
	];

	fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
		let outcome: String = row.get("outcome_at_28_days")?;
		let cause: String = row.get("cause_of_death")?;
		Ok(Participant {
			id: row.get("id")?,
			site_id: row.get("site_id")?,
			name: row.get("name")?,
			mothers_name: row.get("mothers_name")?,
			hospital_identifier: row.get("hospital_identifier")?,
			admission_weight: row.get("admission_weight")?,
			gestational_age_weeks: row.get("gestational_age_weeks")?,
			born_at: timestamp(row, "born_at")?,
			admission_diagnosis: row.get("admission_diagnosis")?,
			phone_number: row.get("phone_number")?,
			is_male: row.get("is_male")?,
			inborn: row.get("inborn")?,
			registered_at: timestamp(row, "registered_at")?,
			registering_investigator: row.get("registering_investigator")?,
			is_intervention_arm: row.get("is_intervention_arm")?,
			was_envelope_randomised: row.get("was_envelope_randomised")?,
			block_number: row.get("block_number")?,
			block_size: row.get("block_size")?,
			multiple_sibling_id: row.get("multiple_sibling_id")?,
			outcome_at_28_days: Outcome::from_str_lossy(&outcome),
			cause_of_death: CauseOfDeath::from_str_lossy(&cause),
			other_cause_of_death_detail: row.get("other_cause_of_death_detail")?,
			bcg_adverse: row.get("bcg_adverse")?,
			bcg_adverse_detail: row.get("bcg_adverse_detail")?,
			bcg_papule: row.get("bcg_papule")?,
			last_contact_weight: row.get("last_contact_weight")?,
			last_weight_date: optional_timestamp(row, "last_weight_date")?,
			discharged_at: optional_timestamp(row, "discharged_at")?,
			death_or_last_contact_at: optional_timestamp(row, "death_or_last_contact_at")?,
			notes: row.get("notes")?,
			app_version: row.get("app_version")?,
			last_modified: timestamp(row, "last_modified")?,
		})
	}

	fn to_values(&self) -> Vec<Value> {
		vec![
			self.id.into(),
			self.site_id.into(),
			self.name.clone().into(),
			self.mothers_name.clone().into(),
			self.hospital_identifier.clone().into(),
			self.admission_weight.into(),
			self.gestational_age_weeks.into(),
			micros(self.born_at),
			self.admission_diagnosis.clone().into(),
			self.phone_number.clone().into(),
			self.is_male.into(),
			self.inborn.into(),
			micros(self.registered_at),
			self.registering_investigator.clone().into(),
			self.is_intervention_arm.into(),
			self.was_envelope_randomised.into(),
			self.block_number.into(),
			self.block_size.into(),
			self.multiple_sibling_id.into(),
			self.outcome_at_28_days.as_str().to_string().into(),
			self.cause_of_death.as_str().to_string().into(),
			self.other_cause_of_death_detail.clone().into(),
			self.bcg_adverse.into(),
			self.bcg_adverse_detail.clone().into(),
			self.bcg_papule.into(),
			self.last_contact_weight.into(),
			optional_micros(self.last_weight_date),
			optional_micros(self.discharged_at),
			optional_micros(self.death_or_last_contact_at),
			self.notes.clone().into(),
			self.app_version.clone().into(),
			micros(self.last_modified),
		]
	}
}

impl StoredRecord for ScreenedPatient {
	const COLUMNS: &'static [&'static str] = &[
		"id",
		"site_id",
		"name",
		"mothers_name",
		"hospital_identifier",
		"admission_weight",
		"gestational_age_weeks",
		"born_at",
		"is_male",
		"inborn",
		"registered_at",
		"bad_infection_immune",
		"bad_malformation",
		"likely_die_24hr",
		"was_given_bcg_prior",
		"refused_consent",
		"missed",
		"app_version",
		"last_modified",
	];

	fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
		Ok(ScreenedPatient {
			id: row.get("id")?,
			site_id: row.get("site_id")?,
			name: row.get("name")?,
			mothers_name: row.get("mothers_name")?,
			hospital_identifier: row.get("hospital_identifier")?,
			admission_weight: row.get("admission_weight")?,
			gestational_age_weeks: row.get("gestational_age_weeks")?,
			born_at: timestamp(row, "born_at")?,
			is_male: row.get("is_male")?,
			inborn: row.get("inborn")?,
			registered_at: timestamp(row, "registered_at")?,
			bad_infection_immune: row.get("bad_infection_immune")?,
			bad_malformation: row.get("bad_malformation")?,
			likely_die_24hr: row.get("likely_die_24hr")?,
			was_given_bcg_prior: row.get("was_given_bcg_prior")?,
			refused_consent: row.get("refused_consent")?,
			missed: row.get("missed")?,
			app_version: row.get("app_version")?,
			last_modified: timestamp(row, "last_modified")?,
		})
	}

	fn to_values(&self) -> Vec<Value> {
		vec![
			self.id.into(),
			self.site_id.into(),
			self.name.clone().into(),
			self.mothers_name.clone().into(),
			self.hospital_identifier.clone().into(),
			self.admission_weight.into(),
			self.gestational_age_weeks.into(),
			micros(self.born_at),
			self.is_male.into(),
			self.inborn.into(),
			micros(self.registered_at),
			self.bad_infection_immune.into(),
			self.bad_malformation.into(),
			self.likely_die_24hr.into(),
			self.was_given_bcg_prior.into(),
			self.refused_consent.into(),
			self.missed.into(),
			self.app_version.clone().into(),
			micros(self.last_modified),
		]
	}
}

impl StoredRecord for Vaccine {
	const COLUMNS: &'static [&'static str] = &["id", "site_id", "name", "last_modified"];

	fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
		Ok(Vaccine {
			id: row.get("id")?,
			site_id: row.get("site_id")?,
			name: row.get("name")?,
			last_modified: timestamp(row, "last_modified")?,
		})
	}

	fn to_values(&self) -> Vec<Value> {
		vec![
			self.id.into(),
			self.site_id.into(),
			self.name.clone().into(),
			micros(self.last_modified),
		]
	}
}

impl StoredRecord for VaccineAdministered {
	const COLUMNS: &'static [&'static str] = &[
		"id",
		"site_id",
		"participant_id",
		"vaccine_id",
		"administered_at",
		"last_modified",
	];

	fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
		Ok(VaccineAdministered {
			id: row.get("id")?,
			site_id: row.get("site_id")?,
			participant_id: row.get("participant_id")?,
			vaccine_id: row.get("vaccine_id")?,
			administered_at: timestamp(row, "administered_at")?,
			last_modified: timestamp(row, "last_modified")?,
		})
	}

	fn to_values(&self) -> Vec<Value> {
		vec![
			self.id.into(),
			self.site_id.into(),
			self.participant_id.into(),
			self.vaccine_id.into(),
			micros(self.administered_at),
			micros(self.last_modified),
		]
	}
}

impl StoredRecord for ProtocolViolation {
	const COLUMNS: &'static [&'static str] = &[
		"id",
		"site_id",
		"participant_id",
		"severity",
		"detected",
		"details",
		"reported_at",
		"reporting_investigator",
		"last_modified",
	];

	fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
		let severity: String = row.get("severity")?;
		let detected: Option<String> = row.get("detected")?;
		Ok(ProtocolViolation {
			id: row.get("id")?,
			site_id: row.get("site_id")?,
			participant_id: row.get("participant_id")?,
			severity: ViolationSeverity::from_str_lossy(&severity),
			detected: detected.as_deref().and_then(ViolationKind::parse),
			details: row.get("details")?,
			reported_at: timestamp(row, "reported_at")?,
			reporting_investigator: row.get("reporting_investigator")?,
			last_modified: timestamp(row, "last_modified")?,
		})
	}

	fn to_values(&self) -> Vec<Value> {
		vec![
			self.id.into(),
			self.site_id.into(),
			self.participant_id.into(),
			self.severity.as_str().to_string().into(),
			self.detected.map(|k| k.as_str().to_string()).into(),
			self.details.clone().into(),
			micros(self.reported_at),
			self.reporting_investigator.clone().into(),
			micros(self.last_modified),
		]
	}
}

fn select_sql<T: StoredRecord>(filter: &str) -> String {
	format!(
		"SELECT {} FROM {} {} ORDER BY id",
		T::COLUMNS.join(", "),
		T::KIND.table(),
		filter
	)
}

pub fn fetch_where<T: StoredRecord, P: Params>(
	conn: &Connection,
	filter: &str,
	params: P,
) -> Result<Vec<T>> {
	let mut stmt = conn.prepare(&select_sql::<T>(filter))?;
	let rows = stmt.query_map(params, |row| T::from_row(row))?;
	Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn fetch_all<T: StoredRecord>(conn: &Connection) -> Result<Vec<T>> {
	fetch_where(conn, "", [])
}

pub fn find<T: StoredRecord>(conn: &Connection, id: i64) -> Result<Option<T>> {
	let record = conn
		.query_row(&select_sql::<T>("WHERE id = ?1"), params![id], |row| {
			T::from_row(row)
		})
		.optional()?;
	Ok(record)
}

/// Insert-or-overwrite by identifier.
pub fn upsert<T: StoredRecord>(conn: &Connection, record: &T) -> Result<()> {
	let placeholders = (1..=T::COLUMNS.len())
		.map(|i| format!("?{}", i))
		.collect::<Vec<_>>()
		.join(", ");
	let sql = format!(
		"INSERT OR REPLACE INTO {} ({}) VALUES ({})",
		T::KIND.table(),
		T::COLUMNS.join(", "),
		placeholders
	);
	conn.execute(&sql, params_from_iter(record.to_values()))?;
	Ok(())
}

pub fn delete(conn: &Connection, kind: RecordKind, id: i64) -> Result<usize> {
	let sql = format!("DELETE FROM {} WHERE id = ?1", kind.table());
	Ok(conn.execute(&sql, params![id])?)
}

/// Largest identifier of `kind` within `[low, high]`.
pub fn max_id_between(conn: &Connection, kind: RecordKind, low: i64, high: i64) -> Result<Option<i64>> {
	let sql = format!(
		"SELECT MAX(id) FROM {} WHERE id BETWEEN ?1 AND ?2",
		kind.table()
	);
	Ok(conn.query_row(&sql, params![low, high], |row| row.get(0))?)
}

pub fn newest_modification(conn: &Connection, kind: RecordKind) -> Result<Option<DateTime<Utc>>> {
	let sql = format!("SELECT MAX(last_modified) FROM {}", kind.table());
	let newest: Option<i64> = conn.query_row(&sql, [], |row| row.get(0))?;
	Ok(newest.and_then(from_micros))
}

pub fn ids(conn: &Connection, kind: RecordKind) -> Result<HashSet<i64>> {
	let sql = format!("SELECT id FROM {}", kind.table());
	let mut stmt = conn.prepare(&sql)?;
	let rows = stmt.query_map([], |row| row.get(0))?;
	Ok(rows.collect::<rusqlite::Result<HashSet<i64>>>()?)
}

/// Records owned by `site_id` modified strictly after `watermark`; every
/// record the site owns when there is no watermark.
pub fn owned_since<T: StoredRecord>(
	conn: &Connection,
	site_id: i64,
	watermark: Option<DateTime<Utc>>,
) -> Result<Vec<T>> {
	match watermark {
		Some(w) => fetch_where(
			conn,
			"WHERE site_id = ?1 AND last_modified > ?2",
			params![site_id, to_micros(w)],
		),
		None => fetch_where(conn, "WHERE site_id = ?1", params![site_id]),
	}
}

/// Newest modification among records of `kind` owned by `site_id`.
pub fn newest_owned(conn: &Connection, kind: RecordKind, site_id: i64) -> Result<Option<DateTime<Utc>>> {
	let sql = format!(
		"SELECT MAX(last_modified) FROM {} WHERE site_id = ?1",
		kind.table()
	);
	let newest: Option<i64> = conn.query_row(&sql, params![site_id], |row| row.get(0))?;
	Ok(newest.and_then(from_micros))
}

pub fn count_where(conn: &Connection, kind: RecordKind, filter: &str) -> Result<i64> {
	let sql = format!("SELECT COUNT(*) FROM {} {}", kind.table(), filter);
	Ok(conn.query_row(&sql, [], |row| row.get(0))?)
}

/// Deletes every row of `kind` whose id falls outside all of `ranges`.
pub fn retain_ranges(conn: &Connection, kind: RecordKind, ranges: &[(i64, i64)]) -> Result<usize> {
	let keep = ranges
		.iter()
		.map(|(low, high)| format!("(id BETWEEN {} AND {})", low, high))
		.collect::<Vec<_>>()
		.join(" OR ");
	let sql = if keep.is_empty() {
		format!("DELETE FROM {}", kind.table())
	} else {
		format!("DELETE FROM {} WHERE NOT ({})", kind.table(), keep)
	};
	Ok(conn.execute(&sql, [])?)
}
