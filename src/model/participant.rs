use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{RecordKind, SharedRecord, VaccineDose};

/// Status of a participant 28 days after enrolment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
	#[default]
	Pending,
	Inpatient,
	DischargedAlive,
	DischargedLikelyDied,
	Died,
	LostToFollowUp,
}

impl Outcome {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Pending => "pending",
			Self::Inpatient => "inpatient",
			Self::DischargedAlive => "discharged_alive",
			Self::DischargedLikelyDied => "discharged_likely_died",
			Self::Died => "died",
			Self::LostToFollowUp => "lost_to_follow_up",
		}
	}

	pub fn from_str_lossy(s: &str) -> Self {
		match s {
			"inpatient" => Self::Inpatient,
			"discharged_alive" => Self::DischargedAlive,
			"discharged_likely_died" => Self::DischargedLikelyDied,
			"died" => Self::Died,
			"lost_to_follow_up" => Self::LostToFollowUp,
			_ => Self::Pending,
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CauseOfDeath {
	#[default]
	NotApplicable,
	Sepsis,
	Respiratory,
	Neurological,
	Other,
	Unknown,
}

impl CauseOfDeath {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::NotApplicable => "not_applicable",
			Self::Sepsis => "sepsis",
			Self::Respiratory => "respiratory",
			Self::Neurological => "neurological",
			Self::Other => "other",
			Self::Unknown => "unknown",
		}
	}

	pub fn from_str_lossy(s: &str) -> Self {
		match s {
			"sepsis" => Self::Sepsis,
			"respiratory" => Self::Respiratory,
			"neurological" => Self::Neurological,
			"other" => Self::Other,
			"unknown" => Self::Unknown,
			_ => Self::NotApplicable,
		}
	}
}

/// An enrolled, randomised participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
	pub id: i64,
	pub site_id: i64,
	pub name: String,
	pub mothers_name: String,
	pub hospital_identifier: String,
	/// Birth (admission) weight in grams.
	pub admission_weight: i32,
	pub gestational_age_weeks: f64,
	pub born_at: DateTime<Utc>,
	pub admission_diagnosis: String,
	pub phone_number: String,
	pub is_male: bool,
	pub inborn: Option<bool>,
	pub registered_at: DateTime<Utc>,
	pub registering_investigator: String,

	// Allocation. Written once at enrolment; edits that would have changed it
	// are recorded as protocol violations instead.
	pub is_intervention_arm: bool,
	pub was_envelope_randomised: bool,
	pub block_number: Option<i32>,
	pub block_size: i32,
	/// Same-site sibling from a multiple birth. A reference, not ownership.
	pub multiple_sibling_id: Option<i64>,

	pub outcome_at_28_days: Outcome,
	pub cause_of_death: CauseOfDeath,
	pub other_cause_of_death_detail: Option<String>,
	pub bcg_adverse: Option<bool>,
	pub bcg_adverse_detail: Option<String>,
	pub bcg_papule: Option<bool>,
	pub last_contact_weight: Option<i32>,
	pub last_weight_date: Option<DateTime<Utc>>,
	pub discharged_at: Option<DateTime<Utc>>,
	pub death_or_last_contact_at: Option<DateTime<Utc>>,
	pub notes: Option<String>,

	pub app_version: String,
	pub last_modified: DateTime<Utc>,
}

impl SharedRecord for Participant {
	const KIND: RecordKind = RecordKind::Participant;

	fn id(&self) -> i64 {
		self.id
	}

	fn owner_site_id(&self) -> i64 {
		self.site_id
	}

	fn last_modified(&self) -> DateTime<Utc> {
		self.last_modified
	}
}

/// Enrolment input. Randomisation and identifiers are filled in by the
/// repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewParticipant {
	pub site_id: i64,
	pub name: String,
	pub mothers_name: String,
	pub hospital_identifier: String,
	pub admission_weight: i32,
	pub gestational_age_weeks: f64,
	pub born_at: DateTime<Utc>,
	pub admission_diagnosis: String,
	pub phone_number: String,
	pub is_male: bool,
	pub inborn: Option<bool>,
	pub registered_at: DateTime<Utc>,
	pub multiple_sibling_id: Option<i64>,
	/// Sealed envelope opened for this participant, if envelope randomising.
	pub envelope_number: Option<i64>,
}

/// Replacement values for the fields captured at enrolment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantEdit {
	pub name: String,
	pub mothers_name: String,
	pub hospital_identifier: String,
	pub admission_weight: i32,
	pub gestational_age_weeks: f64,
	pub born_at: DateTime<Utc>,
	pub admission_diagnosis: String,
	pub phone_number: String,
	pub is_male: bool,
	pub inborn: Option<bool>,
	pub registered_at: DateTime<Utc>,
	pub multiple_sibling_id: Option<i64>,
}

impl From<&Participant> for ParticipantEdit {
	fn from(p: &Participant) -> Self {
		Self {
			name: p.name.clone(),
			mothers_name: p.mothers_name.clone(),
			hospital_identifier: p.hospital_identifier.clone(),
			admission_weight: p.admission_weight,
			gestational_age_weeks: p.gestational_age_weeks,
			born_at: p.born_at,
			admission_diagnosis: p.admission_diagnosis.clone(),
			phone_number: p.phone_number.clone(),
			is_male: p.is_male,
			inborn: p.inborn,
			registered_at: p.registered_at,
			multiple_sibling_id: p.multiple_sibling_id,
		}
	}
}

/// Follow-up data recorded after enrolment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeUpdate {
	pub outcome_at_28_days: Outcome,
	pub cause_of_death: CauseOfDeath,
	pub other_cause_of_death_detail: Option<String>,
	pub bcg_adverse: Option<bool>,
	pub bcg_adverse_detail: Option<String>,
	pub bcg_papule: Option<bool>,
	pub last_contact_weight: Option<i32>,
	pub last_weight_date: Option<DateTime<Utc>>,
	pub discharged_at: Option<DateTime<Utc>>,
	pub death_or_last_contact_at: Option<DateTime<Utc>>,
	pub notes: Option<String>,
	/// When present, replaces the participant's administered vaccines.
	#[serde(default)]
	pub vaccines_administered: Option<Vec<VaccineDose>>,
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn outcome_text_round_trips_and_defaults_to_pending() {
		for o in [
			Outcome::Inpatient,
			Outcome::DischargedAlive,
			Outcome::DischargedLikelyDied,
			Outcome::Died,
			Outcome::LostToFollowUp,
		] {
			assert_eq!(Outcome::from_str_lossy(o.as_str()), o);
		}
		assert_eq!(Outcome::from_str_lossy("garbage"), Outcome::Pending);
	}

	#[test]
	fn unknown_cause_of_death_text_is_not_applicable() {
		assert_eq!(CauseOfDeath::from_str_lossy(""), CauseOfDeath::NotApplicable);
		assert_eq!(CauseOfDeath::from_str_lossy("sepsis"), CauseOfDeath::Sepsis);
	}
}
