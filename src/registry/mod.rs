//! In-memory cache of known sites.
//!
//! Loaded from the store and refreshed explicitly by every operation that
//! changes the `sites` table (provisioning and merges that write site rows).

use std::collections::BTreeMap;

use rusqlite::Connection;
use uuid::Uuid;

use crate::error::{Result, TrialError};
use crate::model::Site;
use crate::store::{self, tables};

#[derive(Debug, Clone, Default)]
pub struct SiteRegistry {
	sites: BTreeMap<i64, Site>,
	local: Option<Uuid>,
}

impl SiteRegistry {
	pub fn load(conn: &Connection) -> Result<Self> {
		let mut registry = Self::default();
		registry.refresh(conn)?;
		Ok(registry)
	}

	pub fn refresh(&mut self, conn: &Connection) -> Result<()> {
		self.sites = tables::fetch_all::<Site>(conn)?
			.into_iter()
			.map(|s| (s.id, s))
			.collect();
		self.local = store::local_site_identity(conn)?;
		Ok(())
	}

	pub fn get(&self, site_id: i64) -> Result<&Site> {
		self.sites.get(&site_id).ok_or(TrialError::UnknownSite(site_id))
	}

	pub fn all(&self) -> impl Iterator<Item = &Site> {
		self.sites.values()
	}

	pub fn len(&self) -> usize {
		self.sites.len()
	}

	pub fn is_empty(&self) -> bool {
		self.sites.is_empty()
	}

	pub fn find_by_identity(&self, identity: Uuid) -> Option<&Site> {
		self.sites.values().find(|s| s.identity == identity)
	}

	/// The site this store enrols for.
	pub fn local(&self) -> Result<&Site> {
		self.local
			.and_then(|identity| self.find_by_identity(identity))
			.ok_or(TrialError::NoLocalSite)
	}
}

/// Reject a site whose id is already held under another identity, then one
/// whose range overlaps any known site. Nothing is written on either error.
pub fn check_new_site<'a>(known: impl IntoIterator<Item = &'a Site>, candidate: &Site) -> Result<()> {
	let known: Vec<&Site> = known.into_iter().collect();
	if let Some(existing) = known
		.iter()
		.find(|s| s.id == candidate.id && s.identity != candidate.identity)
	{
		return Err(TrialError::DuplicateSiteKey {
			site_id: candidate.id,
			existing: existing.identity,
			incoming: candidate.identity,
		});
	}
	if let Some(existing) = known
		.iter()
		.find(|s| s.identity != candidate.identity && s.overlaps(candidate))
	{
		return Err(TrialError::OverlappingRange {
			existing: existing.range(),
			incoming: candidate.range(),
		});
	}
	if candidate.max_id < candidate.id {
		return Err(TrialError::Validation(format!(
			"site {} has an empty range ending at {}",
			candidate.id, candidate.max_id
		)));
	}
	Ok(())
}
