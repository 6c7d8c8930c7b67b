use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrialError};

/// One pre-generated sealed allocation. The participant who opens it takes
/// `number` as their identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
	pub number: i64,
	pub block_number: i32,
	pub block_size: i32,
	pub is_intervention_arm: bool,
}

/// The sealed envelope series. Identifiers from 1 up to [`ceiling`] are
/// reserved for it and never handed out by block randomisation.
///
/// [`ceiling`]: EnvelopeCatalog::ceiling
#[derive(Debug, Clone, Default)]
pub struct EnvelopeCatalog {
	envelopes: BTreeMap<i64, Envelope>,
}

impl EnvelopeCatalog {
	pub fn new(envelopes: impl IntoIterator<Item = Envelope>) -> Self {
		Self {
			envelopes: envelopes.into_iter().map(|e| (e.number, e)).collect(),
		}
	}

	/// Load a JSON array of envelopes.
	pub fn load(path: &Path) -> Result<Self> {
		let file = std::fs::File::open(path)?;
		let envelopes: Vec<Envelope> = serde_json::from_reader(std::io::BufReader::new(file))?;
		if let Some(bad) = envelopes.iter().find(|e| e.number < 1) {
			return Err(TrialError::Validation(format!(
				"envelope numbers start at 1, found {}",
				bad.number
			)));
		}
		Ok(Self::new(envelopes))
	}

	pub fn get(&self, number: i64) -> Result<&Envelope> {
		self.envelopes
			.get(&number)
			.ok_or(TrialError::EnvelopeNotFound(number))
	}

	/// Highest envelope number, or 0 when there are no envelopes.
	pub fn ceiling(&self) -> i64 {
		self.envelopes.keys().next_back().copied().unwrap_or(0)
	}

	pub fn len(&self) -> usize {
		self.envelopes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.envelopes.is_empty()
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn loads_json_and_reports_ceiling() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("envelopes.json");
		std::fs::write(
			&path,
			r#"[
				{"number": 1, "block_number": 1, "block_size": 4, "is_intervention_arm": true},
				{"number": 2, "block_number": 1, "block_size": 4, "is_intervention_arm": false},
				{"number": 40, "block_number": 9, "block_size": 6, "is_intervention_arm": true}
			]"#,
		)
		.expect("write");

		let catalog = EnvelopeCatalog::load(&path).expect("load");
		assert_eq!(catalog.len(), 3);
		assert_eq!(catalog.ceiling(), 40);
		assert_eq!(catalog.get(2).expect("present").block_size, 4);
		assert!(matches!(catalog.get(3), Err(TrialError::EnvelopeNotFound(3))));
	}

	#[test]
	fn empty_catalog_reserves_nothing() {
		assert_eq!(EnvelopeCatalog::default().ceiling(), 0);
	}
}
