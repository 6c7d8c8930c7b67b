//! Treatment-arm allocation for new participants and re-derivation after
//! edits that move a participant to another randomising category.

pub mod blocks;
pub mod envelopes;
pub mod violations;

use log::{debug, info, warn};
use rand::Rng;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::allocator;
use crate::config::RandomisingSettings;
use crate::error::{Result, TrialError};
use crate::model::{NewParticipant, Participant, ParticipantEdit, RecordKind, Site};
use crate::store::tables;

pub use envelopes::{Envelope, EnvelopeCatalog};
pub use violations::{DetectedViolation, assess_edit};

/// Stratum for block randomisation: sex and birth-weight band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RandomisingCategory {
	pub is_male: bool,
	pub heavy: bool,
}

impl RandomisingCategory {
	pub fn of(is_male: bool, admission_weight: i32, settings: &RandomisingSettings) -> Self {
		Self {
			is_male,
			heavy: admission_weight >= settings.weight_band_threshold_grams,
		}
	}
}

/// Arm and block metadata written onto a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
	pub is_intervention_arm: bool,
	pub block_number: Option<i32>,
	pub block_size: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationOutcome {
	EnvelopeAllocated,
	BlockAllocated,
	ForcedSiblingAllocated,
}

/// Result of randomising one enrolment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Randomisation {
	pub participant_id: i64,
	pub allocation: Allocation,
	pub outcome: AllocationOutcome,
	pub was_envelope_randomised: bool,
	pub multiple_sibling_id: Option<i64>,
}

pub struct RandomisingEngine<'a> {
	settings: &'a RandomisingSettings,
	envelopes: &'a EnvelopeCatalog,
}

impl<'a> RandomisingEngine<'a> {
	pub fn new(settings: &'a RandomisingSettings, envelopes: &'a EnvelopeCatalog) -> Self {
		Self {
			settings,
			envelopes,
		}
	}

	pub fn category(&self, is_male: bool, admission_weight: i32) -> RandomisingCategory {
		RandomisingCategory::of(is_male, admission_weight, self.settings)
	}

	/// Choose identifier, arm and block for a new participant at `site`.
	///
	/// A same-sex sibling already enrolled decides the arm and block, even
	/// when an envelope number is supplied. Otherwise the envelope is used,
	/// and failing that the next slot of the category's block.
	pub fn randomise<R: Rng + ?Sized>(
		&self,
		conn: &Connection,
		site: &Site,
		request: &NewParticipant,
		rng: &mut R,
	) -> Result<Randomisation> {
		if let Some(sibling_id) = request.multiple_sibling_id {
			let sibling = self.sibling(conn, site, sibling_id)?;
			if sibling.is_male == request.is_male {
				let enveloped = sibling.was_envelope_randomised || request.envelope_number.is_some();
				let participant_id = if enveloped && !self.envelopes.is_empty() {
					self.next_above_envelopes(conn)?
				} else {
					allocator::next_id(conn, RecordKind::Participant, site)?
				};
				info!(
					"participant {} allocated with same-sex sibling {} (arm {})",
					participant_id,
					sibling.id,
					arm_name(sibling.is_intervention_arm)
				);
				return Ok(Randomisation {
					participant_id,
					allocation: Allocation {
						is_intervention_arm: sibling.is_intervention_arm,
						block_number: sibling.block_number,
						block_size: sibling.block_size,
					},
					outcome: AllocationOutcome::ForcedSiblingAllocated,
					was_envelope_randomised: enveloped,
					multiple_sibling_id: Some(sibling.id),
				});
			}
			debug!(
				"sibling {} is of the opposite sex; randomising independently",
				sibling.id
			);
		}

		if let Some(number) = request.envelope_number {
			let envelope = self.envelopes.get(number)?;
			allocator::ensure_owned(site, number)?;
			if tables::find::<Participant>(conn, number)?.is_some() {
				return Err(TrialError::EnvelopeAlreadyUsed(number));
			}
			info!("participant {} allocated by sealed envelope", number);
			return Ok(Randomisation {
				participant_id: number,
				allocation: Allocation {
					is_intervention_arm: envelope.is_intervention_arm,
					block_number: Some(envelope.block_number),
					block_size: envelope.block_size,
				},
				outcome: AllocationOutcome::EnvelopeAllocated,
				was_envelope_randomised: true,
				multiple_sibling_id: request.multiple_sibling_id,
			});
		}

		let participant_id = allocator::next_id(conn, RecordKind::Participant, site)?;
		let category = self.category(request.is_male, request.admission_weight);
		let allocation = blocks::allocate(conn, site.id, category, &self.settings.block_sizes, rng)?;
		info!(
			"participant {} block allocated (block {:?} of {})",
			participant_id, allocation.block_number, allocation.block_size
		);
		Ok(Randomisation {
			participant_id,
			allocation,
			outcome: AllocationOutcome::BlockAllocated,
			was_envelope_randomised: false,
			multiple_sibling_id: request.multiple_sibling_id,
		})
	}

	/// Detect violations caused by `edit` and, for a block-randomised
	/// participant whose category changed, move them into a block of the new
	/// category. The participant's arm never changes.
	pub fn review_edit<R: Rng + ?Sized>(
		&self,
		conn: &Connection,
		participant: &mut Participant,
		edit: &ParticipantEdit,
		rng: &mut R,
	) -> Result<Vec<DetectedViolation>> {
		let found = assess_edit(participant, edit, self.settings);
		let category_changed = found
			.iter()
			.any(|v| v.kind == crate::model::ViolationKind::BlockCriteriaChanged);

		if category_changed {
			if participant.was_envelope_randomised {
				warn!(
					"participant {} changed randomising category; sealed envelope allocation kept",
					participant.id
				);
			} else {
				let category = self.category(edit.is_male, edit.admission_weight);
				let allocation = blocks::reassign(
					conn,
					participant.site_id,
					category,
					participant.is_intervention_arm,
					&self.settings.block_sizes,
					rng,
				)?;
				participant.block_number = allocation.block_number;
				participant.block_size = allocation.block_size;
				warn!(
					"participant {} moved to block {:?} after randomising category change",
					participant.id, allocation.block_number
				);
			}
		}
		Ok(found)
	}

	/// Twins of envelope-randomised participants are numbered after the
	/// highest participant id above the envelope series, across all sites.
	fn next_above_envelopes(&self, conn: &Connection) -> Result<i64> {
		let ceiling = self.envelopes.ceiling();
		let current = tables::max_id_between(conn, RecordKind::Participant, ceiling + 1, i64::MAX)?
			.unwrap_or(ceiling);
		Ok(current.saturating_add(1))
	}

	fn sibling(&self, conn: &Connection, site: &Site, sibling_id: i64) -> Result<Participant> {
		let sibling = tables::find::<Participant>(conn, sibling_id)?.ok_or_else(|| {
			TrialError::InvalidSibling {
				sibling_id,
				reason: "no such participant".to_string(),
			}
		})?;
		if sibling.site_id != site.id {
			return Err(TrialError::InvalidSibling {
				sibling_id,
				reason: format!("enrolled at site {}", sibling.site_id),
			});
		}
		Ok(sibling)
	}
}

fn arm_name(is_intervention_arm: bool) -> &'static str {
	if is_intervention_arm {
		"intervention"
	} else {
		"control"
	}
}
