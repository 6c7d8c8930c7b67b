use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{RecordKind, SharedRecord};

/// A study site (study centre) and the identifier range it owns.
///
/// Every record created at a site takes an identifier from `[id, max_id]`.
/// Ranges are disjoint across sites, so sites never need to coordinate when
/// allocating. `identity` is a stable token that survives renumbering; merges
/// match sites by identity, never by numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
	pub id: i64,
	pub max_id: i64,
	pub identity: Uuid,
	pub name: String,
	pub hospital_identifier_mask: String,
	pub phone_mask: String,
	pub argb_text_colour: u32,
	pub argb_background_colour: u32,
	pub last_modified: DateTime<Utc>,
}

impl Site {
	pub fn contains(&self, id: i64) -> bool {
		self.id <= id && id <= self.max_id
	}

	pub fn overlaps(&self, other: &Site) -> bool {
		self.id <= other.max_id && other.id <= self.max_id
	}

	pub fn range(&self) -> (i64, i64) {
		(self.id, self.max_id)
	}

	/// Hex form of the identity used in archive file names.
	pub fn token(&self) -> String {
		self.identity.simple().to_string()
	}
}

impl SharedRecord for Site {
	const KIND: RecordKind = RecordKind::Site;

	fn id(&self) -> i64 {
		self.id
	}

	fn owner_site_id(&self) -> i64 {
		self.id
	}

	fn last_modified(&self) -> DateTime<Utc> {
		self.last_modified
	}
}

/// Provisioning input for a site. A draft without an identity is a brand new
/// site and receives a fresh random token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteDraft {
	pub id: i64,
	pub max_id: i64,
	#[serde(default)]
	pub identity: Option<Uuid>,
	pub name: String,
	#[serde(default)]
	pub hospital_identifier_mask: String,
	#[serde(default)]
	pub phone_mask: String,
	#[serde(default)]
	pub argb_text_colour: u32,
	#[serde(default)]
	pub argb_background_colour: u32,
}

impl SiteDraft {
	pub fn new(id: i64, max_id: i64, name: impl Into<String>) -> Self {
		Self {
			id,
			max_id,
			name: name.into(),
			..Self::default()
		}
	}

	pub fn with_identity(mut self, identity: Uuid) -> Self {
		self.identity = Some(identity);
		self
	}

	pub(crate) fn into_site(self, last_modified: DateTime<Utc>) -> Site {
		Site {
			id: self.id,
			max_id: self.max_id,
			identity: self.identity.unwrap_or_else(Uuid::new_v4),
			name: self.name,
			hospital_identifier_mask: self.hospital_identifier_mask,
			phone_mask: self.phone_mask,
			argb_text_colour: self.argb_text_colour,
			argb_background_colour: self.argb_background_colour,
			last_modified,
		}
	}
}
