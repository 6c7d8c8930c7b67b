use crate::config::RandomisingSettings;
use crate::model::{Participant, ParticipantEdit, ViolationKind};

use super::RandomisingCategory;

const ALTERED_ALLOCATION: &str = "Alteration to data which would have affected randomisation:";

/// A deviation found by comparing a participant with a proposed edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedViolation {
	pub kind: ViolationKind,
	pub details: String,
}

fn sex(is_male: bool) -> &'static str {
	if is_male { "male" } else { "female" }
}

fn sibling(id: Option<i64>) -> String {
	id.map_or_else(|| "none".to_string(), |id| id.to_string())
}

/// Every violation the edit would cause. The three kinds are independent and
/// may all fire for one edit.
pub fn assess_edit(
	before: &Participant,
	edit: &ParticipantEdit,
	settings: &RandomisingSettings,
) -> Vec<DetectedViolation> {
	let mut found = Vec::new();

	let old_category = RandomisingCategory::of(before.is_male, before.admission_weight, settings);
	let new_category = RandomisingCategory::of(edit.is_male, edit.admission_weight, settings);
	if old_category != new_category {
		found.push(DetectedViolation {
			kind: ViolationKind::BlockCriteriaChanged,
			details: format!(
				"{} randomising category changed from {}g {} to {}g {}",
				ALTERED_ALLOCATION,
				before.admission_weight,
				sex(before.is_male),
				edit.admission_weight,
				sex(edit.is_male)
			),
		});
	}

	if edit.admission_weight > settings.max_birth_weight_grams
		&& edit.admission_weight > before.admission_weight
	{
		found.push(DetectedViolation {
			kind: ViolationKind::IneligibleWeight,
			details: format!(
				"Retrospectively ineligible participant: weight changed from {}g to {}g (limit {}g)",
				before.admission_weight, edit.admission_weight, settings.max_birth_weight_grams
			),
		});
	}

	if before.multiple_sibling_id != edit.multiple_sibling_id {
		found.push(DetectedViolation {
			kind: ViolationKind::MultipleSiblingIdChanged,
			details: format!(
				"{} multiple birth sibling changed from '{}' to '{}'",
				ALTERED_ALLOCATION,
				sibling(before.multiple_sibling_id),
				sibling(edit.multiple_sibling_id)
			),
		});
	}

	found
}
