//! Reconciling one extracted remote store into the local store.
//!
//! Remote rows travel per owning site. For each site the remote store
//! contains, only rows modified after that site's watermark for this archive
//! are read; a site seen for the first time is copied whole. A row is written
//! only when it is strictly newer than the local copy, so replaying an
//! archive writes nothing.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::{Connection, params};

use crate::error::Result;
use crate::model::{
	Participant, ProtocolViolation, RecordKind, ScreenedPatient, Site, Vaccine,
	VaccineAdministered, from_micros, now, to_micros,
};
use crate::notify::{ChangeEvent, ChangedRecord, ParticipantSnapshot};
use crate::registry;
use crate::store::tables::{self, StoredRecord};

/// Outcome of merging one archive.
#[derive(Debug, Default)]
pub struct MergeReport {
	pub new_sites: Vec<Site>,
	/// Site rows written, new or updated. Non-zero means the registry is stale.
	pub sites_written: usize,
	pub upserted: usize,
	pub events: Vec<ChangeEvent>,
}

struct Written<T> {
	record: T,
	existed: bool,
}

/// Sites in `remote` that are not known locally by identity, checked against
/// the local sites and against each other. Nothing is written.
pub fn new_sites(local: &Connection, remote: &Connection) -> Result<Vec<Site>> {
	let mut known = tables::fetch_all::<Site>(local)?;
	let mut fresh = Vec::new();
	for site in tables::fetch_all::<Site>(remote)? {
		if known.iter().any(|k| k.identity == site.identity) {
			continue;
		}
		registry::check_new_site(&known, &site)?;
		known.push(site.clone());
		fresh.push(site);
	}
	Ok(fresh)
}

fn watermarks(conn: &Connection, archive_key: &str) -> Result<HashMap<i64, DateTime<Utc>>> {
	let mut stmt = conn.prepare("SELECT site_id, watermark FROM merge_log WHERE archive_path = ?1")?;
	let rows = stmt.query_map(params![archive_key], |row| {
		Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
	})?;
	let mut found = HashMap::new();
	for row in rows {
		let (site_id, micros) = row?;
		if let Some(ts) = from_micros(micros) {
			found.insert(site_id, ts);
		}
	}
	Ok(found)
}

fn record_watermark(conn: &Connection, archive_key: &str, site_id: i64, watermark: DateTime<Utc>) -> Result<()> {
	conn.execute(
		"INSERT INTO merge_log (archive_path, site_id, watermark, merged_at)
		 VALUES (?1, ?2, ?3, ?4)
		 ON CONFLICT (archive_path, site_id) DO UPDATE SET
		   watermark = MAX(watermark, excluded.watermark),
		   merged_at = excluded.merged_at",
		params![archive_key, site_id, to_micros(watermark), to_micros(now())],
	)?;
	Ok(())
}

/// Newest change the remote store holds for `site_id`, across all kinds.
fn newest_for_site(remote: &Connection, site_id: i64) -> Result<Option<DateTime<Utc>>> {
	let mut newest = None;
	for kind in RecordKind::ALL {
		newest = newest.max(tables::newest_owned(remote, kind, site_id)?);
	}
	Ok(newest)
}

/// Pull `T` rows for the accepted sites and write those strictly newer than
/// the local copy.
fn transfer<T: StoredRecord>(
	local: &Connection,
	remote: &Connection,
	sites: &[(Site, Option<DateTime<Utc>>)],
) -> Result<Vec<Written<T>>> {
	let mut written = Vec::new();
	for (site, watermark) in sites {
		for record in tables::owned_since::<T>(remote, site.id, *watermark)? {
			if !site.contains(record.id()) {
				warn!(
					"skipping {} {}: outside the range of site {}",
					T::KIND,
					record.id(),
					site.id
				);
				continue;
			}
			let existing = tables::find::<T>(local, record.id())?;
			let existed = existing.is_some();
			if existing.is_some_and(|l| l.last_modified() >= record.last_modified()) {
				continue;
			}
			tables::upsert(local, &record)?;
			written.push(Written { record, existed });
		}
	}
	debug!("{} {} rows written", written.len(), T::KIND);
	Ok(written)
}

pub(crate) fn snapshot(conn: &Connection, participant: Participant) -> Result<ParticipantSnapshot> {
	let vaccines_administered = tables::fetch_where::<VaccineAdministered, _>(
		conn,
		"WHERE participant_id = ?1",
		params![participant.id],
	)?;
	Ok(ParticipantSnapshot {
		participant,
		vaccines_administered,
	})
}

/// Merge `remote` into `local`. Call inside a transaction on `local`: site
/// conflicts are detected before any write, and any later error leaves the
/// whole archive unmerged.
///
/// Change events are only built when `observed` is set.
pub fn merge_store(
	local: &Connection,
	remote: &Connection,
	archive_key: &str,
	observed: bool,
) -> Result<MergeReport> {
	let fresh = new_sites(local, remote)?;
	let fresh_ids: HashSet<i64> = fresh.iter().map(|s| s.id).collect();
	let marks = watermarks(local, archive_key)?;

	// Accepted owners: every remote site that, after this merge, is known
	// locally under the same id and identity.
	let local_sites: Vec<Site> = tables::fetch_all::<Site>(local)?;
	let mut accepted: Vec<(Site, Option<DateTime<Utc>>)> = Vec::new();
	for site in tables::fetch_all::<Site>(remote)? {
		let same = fresh_ids.contains(&site.id)
			|| local_sites
				.iter()
				.any(|l| l.id == site.id && l.identity == site.identity);
		if !same {
			warn!(
				"ignoring records of remote site {} ({}): identity is registered under another id",
				site.id,
				site.token()
			);
			continue;
		}
		let watermark = if fresh_ids.contains(&site.id) {
			None
		} else {
			marks.get(&site.id).copied()
		};
		accepted.push((site, watermark));
	}

	let mut report = MergeReport {
		new_sites: fresh,
		..MergeReport::default()
	};

	let sites = transfer::<Site>(local, remote, &accepted)?;
	for w in &sites {
		let others: Vec<Site> = tables::fetch_all::<Site>(local)?
			.into_iter()
			.filter(|s| s.identity != w.record.identity)
			.collect();
		registry::check_new_site(&others, &w.record)?;
	}
	let vaccines = transfer::<Vaccine>(local, remote, &accepted)?;
	let participants = transfer::<Participant>(local, remote, &accepted)?;
	let administered = transfer::<VaccineAdministered>(local, remote, &accepted)?;
	let screened = transfer::<ScreenedPatient>(local, remote, &accepted)?;
	let violations = transfer::<ProtocolViolation>(local, remote, &accepted)?;

	report.sites_written = sites.len();
	report.upserted = sites.len()
		+ vaccines.len()
		+ participants.len()
		+ administered.len()
		+ screened.len()
		+ violations.len();

	if observed {
		let transferred: HashSet<i64> = participants.iter().map(|w| w.record.id).collect();
		for w in participants {
			let event = if w.existed {
				ChangeEvent::updated
			} else {
				ChangeEvent::added
			};
			report
				.events
				.push(event(ChangedRecord::Participant(snapshot(local, w.record)?)));
		}
		let vaccinated: BTreeSet<i64> = administered
			.iter()
			.map(|w| w.record.participant_id)
			.filter(|id| !transferred.contains(id))
			.collect();
		for id in vaccinated {
			if let Some(p) = tables::find::<Participant>(local, id)? {
				report
					.events
					.push(ChangeEvent::updated(ChangedRecord::Participant(snapshot(local, p)?)));
			}
		}
		for w in screened {
			let event = if w.existed {
				ChangeEvent::updated
			} else {
				ChangeEvent::added
			};
			report.events.push(event(ChangedRecord::ScreenedPatient(w.record)));
		}
		for w in violations.into_iter().filter(|w| !w.existed) {
			report
				.events
				.push(ChangeEvent::added(ChangedRecord::ProtocolViolation(w.record)));
		}
	}

	for (site, _) in &accepted {
		if let Some(newest) = newest_for_site(remote, site.id)? {
			record_watermark(local, archive_key, site.id, newest)?;
		}
	}

	info!(
		"merged {}: {} new sites, {} rows written",
		archive_key,
		report.new_sites.len(),
		report.upserted
	);
	Ok(report)
}
