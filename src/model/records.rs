use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{RecordKind, SharedRecord};

/// A patient assessed for eligibility but not enrolled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenedPatient {
	pub id: i64,
	pub site_id: i64,
	pub name: String,
	pub mothers_name: String,
	pub hospital_identifier: String,
	pub admission_weight: i32,
	pub gestational_age_weeks: f64,
	pub born_at: DateTime<Utc>,
	pub is_male: bool,
	pub inborn: Option<bool>,
	pub registered_at: DateTime<Utc>,
	pub bad_infection_immune: bool,
	pub bad_malformation: bool,
	pub likely_die_24hr: bool,
	pub was_given_bcg_prior: bool,
	pub refused_consent: Option<bool>,
	pub missed: Option<bool>,
	pub app_version: String,
	pub last_modified: DateTime<Utc>,
}

impl SharedRecord for ScreenedPatient {
	const KIND: RecordKind = RecordKind::ScreenedPatient;

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

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewScreenedPatient {
	pub site_id: i64,
	pub name: String,
	pub mothers_name: String,
	pub hospital_identifier: String,
	pub admission_weight: i32,
	pub gestational_age_weeks: f64,
	pub born_at: DateTime<Utc>,
	pub is_male: bool,
	pub inborn: Option<bool>,
	pub registered_at: DateTime<Utc>,
	pub bad_infection_immune: bool,
	pub bad_malformation: bool,
	pub likely_die_24hr: bool,
	pub was_given_bcg_prior: bool,
	pub refused_consent: Option<bool>,
	pub missed: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vaccine {
	pub id: i64,
	pub site_id: i64,
	pub name: String,
	pub last_modified: DateTime<Utc>,
}

impl SharedRecord for Vaccine {
	const KIND: RecordKind = RecordKind::Vaccine;

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

/// A vaccine given to a participant. Owned by the participant's site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaccineAdministered {
	pub id: i64,
	pub site_id: i64,
	pub participant_id: i64,
	pub vaccine_id: i64,
	pub administered_at: DateTime<Utc>,
	pub last_modified: DateTime<Utc>,
}

impl SharedRecord for VaccineAdministered {
	const KIND: RecordKind = RecordKind::VaccineAdministered;

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

/// Input row when replacing a participant's administered vaccines. `id` is
/// `None` for a dose not yet stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaccineDose {
	#[serde(default)]
	pub id: Option<i64>,
	pub vaccine_id: i64,
	pub administered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
	#[default]
	Minor,
	Major,
	MajorWrongAllocation,
}

impl ViolationSeverity {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Minor => "minor",
			Self::Major => "major",
			Self::MajorWrongAllocation => "major_wrong_allocation",
		}
	}

	pub fn from_str_lossy(s: &str) -> Self {
		match s {
			"major" => Self::Major,
			"major_wrong_allocation" => Self::MajorWrongAllocation,
			_ => Self::Minor,
		}
	}
}

/// Deviations detected automatically when enrolment data is edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
	BlockCriteriaChanged,
	IneligibleWeight,
	MultipleSiblingIdChanged,
}

impl ViolationKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::BlockCriteriaChanged => "block_criteria_changed",
			Self::IneligibleWeight => "ineligible_weight",
			Self::MultipleSiblingIdChanged => "multiple_sibling_id_changed",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"block_criteria_changed" => Some(Self::BlockCriteriaChanged),
			"ineligible_weight" => Some(Self::IneligibleWeight),
			"multiple_sibling_id_changed" => Some(Self::MultipleSiblingIdChanged),
			_ => None,
		}
	}
}

/// Append-only audit record of a deviation from protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolViolation {
	pub id: i64,
	pub site_id: i64,
	pub participant_id: i64,
	pub severity: ViolationSeverity,
	/// Set for violations raised by edit detection; `None` for manual reports.
	pub detected: Option<ViolationKind>,
	pub details: String,
	pub reported_at: DateTime<Utc>,
	pub reporting_investigator: String,
	pub last_modified: DateTime<Utc>,
}

impl SharedRecord for ProtocolViolation {
	const KIND: RecordKind = RecordKind::ProtocolViolation;

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

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn violation_kind_parses_its_own_text() {
		for kind in [
			ViolationKind::BlockCriteriaChanged,
			ViolationKind::IneligibleWeight,
			ViolationKind::MultipleSiblingIdChanged,
		] {
			assert_eq!(ViolationKind::parse(kind.as_str()), Some(kind));
		}
		assert_eq!(ViolationKind::parse("manual"), None);
	}

	#[test]
	fn severity_defaults_to_minor() {
		assert_eq!(ViolationSeverity::from_str_lossy("?"), ViolationSeverity::Minor);
		assert_eq!(
			ViolationSeverity::from_str_lossy("major_wrong_allocation"),
			ViolationSeverity::MajorWrongAllocation
		);
	}
}
