//! The repository owns the local store connection and exposes every
//! operation a site performs: provisioning, enrolment and follow-up,
//! exporting its snapshot and merging everyone else's.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rusqlite::{Connection, params};
use serde::Serialize;

use crate::allocator;
use crate::config::Settings;
use crate::error::{Result, TrialError};
use crate::model::{
	NewParticipant, NewScreenedPatient, OutcomeUpdate, Participant, ParticipantEdit,
	ProtocolViolation, RecordKind, ScreenedPatient, Site, SiteDraft, Vaccine, VaccineAdministered,
	VaccineDose, ViolationSeverity, now,
};
use crate::notify::{ChangeBus, ChangeEvent, ChangeSubscriber, ChangedRecord};
use crate::observability::{SyncMetrics, global_sync_metrics};
use crate::randomising::{AllocationOutcome, EnvelopeCatalog, Randomisation, RandomisingEngine};
use crate::registry::{self, SiteRegistry};
use crate::store::{self, SchemaMigrator, SqliteMigrator, Store, tables};
use crate::sync::{self, discovery, export, merge};

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParticipantSummary {
	pub total: i64,
	pub intervention_arm: i64,
	pub outcome_recorded: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScreenedSummary {
	pub total: i64,
	pub bad_infection_immune: i64,
	pub bad_malformation: i64,
	pub likely_die_24hr: i64,
	pub was_given_bcg_prior: i64,
	pub refused_consent: i64,
	pub missed: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "archive", rename_all = "snake_case")]
pub enum ExportOutcome {
	Written(PathBuf),
	AlreadyCurrent(PathBuf),
}

/// What one call to [`Repository::synchronise`] did.
#[derive(Debug, Default, Serialize)]
pub struct SyncReport {
	pub merged: Vec<MergedArchive>,
	/// Archives skipped because their entry did not hold a store file.
	pub invalid: Vec<PathBuf>,
	pub not_due: usize,
	pub events_dispatched: usize,
}

#[derive(Debug, Serialize)]
pub struct MergedArchive {
	pub archive: PathBuf,
	pub new_sites: Vec<i64>,
	pub upserted: usize,
	pub events: usize,
}

/// Sites found in one extracted remote store.
#[derive(Debug, Serialize)]
pub struct RemoteStore {
	pub path: PathBuf,
	pub sites: Vec<Site>,
}

pub struct Repository {
	settings: Settings,
	store: Store,
	registry: SiteRegistry,
	envelopes: EnvelopeCatalog,
	bus: ChangeBus,
	rng: StdRng,
	migrator: Box<dyn SchemaMigrator>,
	/// Extracted stores already confirmed to need no migration.
	forgoing_migration: HashSet<PathBuf>,
}

impl Repository {
	pub fn open(settings: Settings) -> Result<Self> {
		Self::open_with(settings, Box::new(SqliteMigrator))
	}

	pub fn open_with(settings: Settings, migrator: Box<dyn SchemaMigrator>) -> Result<Self> {
		let store = Store::open(settings.store_file(), migrator.as_ref())?;
		let registry = SiteRegistry::load(store.conn()?)?;
		let envelopes = match &settings.envelopes_file {
			Some(path) => EnvelopeCatalog::load(path)?,
			None => EnvelopeCatalog::default(),
		};
		info!(
			"opened store {} ({} sites, {} sealed envelopes)",
			store.path().display(),
			registry.len(),
			envelopes.len()
		);
		Ok(Self {
			settings,
			store,
			registry,
			envelopes,
			bus: ChangeBus::default(),
			rng: StdRng::from_entropy(),
			migrator,
			forgoing_migration: HashSet::new(),
		})
	}

	/// Replace the block shuffling generator with a seeded one.
	pub fn with_rng_seed(mut self, seed: u64) -> Self {
		self.rng = StdRng::seed_from_u64(seed);
		self
	}

	pub fn settings(&self) -> &Settings {
		&self.settings
	}

	pub fn subscribe(&mut self, subscriber: impl ChangeSubscriber + 'static) {
		self.bus.subscribe(subscriber);
	}

	pub fn close(self) -> Result<()> {
		self.store.close()
	}

	fn conn(&self) -> Result<&Connection> {
		self.store.conn()
	}

	fn publish(&mut self, events: Vec<ChangeEvent>) -> usize {
		let delivered = self.bus.dispatch(&events);
		SyncMetrics::add(&global_sync_metrics().change_events, delivered as u64);
		delivered
	}

	fn participant_event(&self, participant: Participant, added: bool) -> Result<ChangeEvent> {
		let record = ChangedRecord::Participant(merge::snapshot(self.conn()?, participant)?);
		Ok(if added {
			ChangeEvent::added(record)
		} else {
			ChangeEvent::updated(record)
		})
	}

	// --- sites ---

	pub fn sites(&self) -> Vec<Site> {
		self.registry.all().cloned().collect()
	}

	pub fn local_site(&self) -> Result<&Site> {
		self.registry.local()
	}

	/// Add new sites or update existing ones (matched by identity). The
	/// first site ever provisioned becomes this store's local site.
	pub fn provision_sites(&mut self, drafts: Vec<SiteDraft>) -> Result<Vec<Site>> {
		let saved = self.store.atomically(|tx| {
			let mut saved = Vec::with_capacity(drafts.len());
			for draft in drafts {
				let site = draft.into_site(now());
				let known = tables::fetch_all::<Site>(tx)?;
				if let Some(existing) = known.iter().find(|k| k.identity == site.identity) {
					if existing.id != site.id {
						return Err(TrialError::Validation(format!(
							"site {} is registered under id {}; ids cannot change",
							site.token(),
							existing.id
						)));
					}
				}
				let others: Vec<&Site> = known.iter().filter(|k| k.identity != site.identity).collect();
				registry::check_new_site(others, &site)?;
				tables::upsert(tx, &site)?;
				if store::local_site_identity(tx)?.is_none() {
					store::set_local_site_identity(tx, site.identity)?;
					info!("site {} ({}) is the local site", site.id, site.name);
				}
				saved.push(site);
			}
			Ok(saved)
		})?;
		self.registry.refresh(self.store.conn()?)?;
		Ok(saved)
	}

	// --- participants ---

	pub fn participants(&self) -> Result<Vec<Participant>> {
		tables::fetch_all(self.conn()?)
	}

	pub fn find_participant(&self, id: i64) -> Result<Participant> {
		tables::find(self.conn()?, id)?.ok_or(TrialError::ParticipantNotFound(id))
	}

	pub fn vaccines_administered(&self, participant_id: i64) -> Result<Vec<VaccineAdministered>> {
		tables::fetch_where(
			self.conn()?,
			"WHERE participant_id = ?1",
			params![participant_id],
		)
	}

	/// Randomise and store a new participant.
	pub fn enrol(&mut self, request: NewParticipant) -> Result<(Participant, AllocationOutcome)> {
		let site = self.registry.get(request.site_id)?.clone();
		let engine = RandomisingEngine::new(&self.settings.randomising, &self.envelopes);
		let operator = &self.settings.operator;
		let rng = &mut self.rng;

		let (participant, outcome) = self.store.atomically(|tx| {
			let randomisation = engine.randomise(tx, &site, &request, rng)?;
			allocator::ensure_owned(&site, randomisation.participant_id)?;
			let participant = new_participant(&request, &randomisation, operator);
			tables::upsert(tx, &participant)?;
			Ok((participant, randomisation.outcome))
		})?;

		if self.bus.is_observed() {
			let event = self.participant_event(participant.clone(), true)?;
			self.publish(vec![event]);
		}
		Ok((participant, outcome))
	}

	/// Apply an edit to enrolment data. Edits touching the randomising
	/// criteria are logged as protocol violations, returned alongside the
	/// updated participant.
	pub fn update_enrollment(
		&mut self,
		id: i64,
		edit: ParticipantEdit,
	) -> Result<(Participant, Vec<ProtocolViolation>)> {
		let engine = RandomisingEngine::new(&self.settings.randomising, &self.envelopes);
		let operator = &self.settings.operator;
		let registry = &self.registry;
		let rng = &mut self.rng;

		let (participant, logged) = self.store.atomically(|tx| {
			let mut participant =
				tables::find::<Participant>(tx, id)?.ok_or(TrialError::ParticipantNotFound(id))?;
			let site = registry.get(participant.site_id)?;
			if let Some(sibling_id) = edit.multiple_sibling_id {
				if sibling_id == id {
					return Err(TrialError::InvalidSibling {
						sibling_id,
						reason: "a participant cannot be their own sibling".into(),
					});
				}
				match tables::find::<Participant>(tx, sibling_id)? {
					Some(s) if s.site_id == participant.site_id => {}
					Some(s) => {
						return Err(TrialError::InvalidSibling {
							sibling_id,
							reason: format!("enrolled at site {}", s.site_id),
						});
					}
					None => {
						return Err(TrialError::InvalidSibling {
							sibling_id,
							reason: "no such participant".into(),
						});
					}
				}
			}

			let detected = engine.review_edit(tx, &mut participant, &edit, rng)?;
			let reported_at = now();
			let mut logged = Vec::with_capacity(detected.len());
			for found in detected {
				let violation = ProtocolViolation {
					id: allocator::next_id(tx, RecordKind::ProtocolViolation, site)?,
					site_id: site.id,
					participant_id: id,
					severity: ViolationSeverity::MajorWrongAllocation,
					detected: Some(found.kind),
					details: found.details,
					reported_at,
					reporting_investigator: operator.clone(),
					last_modified: reported_at,
				};
				tables::upsert(tx, &violation)?;
				warn!("protocol violation {} logged for participant {}", violation.id, id);
				logged.push(violation);
			}

			apply_edit(&mut participant, edit);
			participant.last_modified = reported_at;
			tables::upsert(tx, &participant)?;
			Ok((participant, logged))
		})?;

		if self.bus.is_observed() {
			let mut events = vec![self.participant_event(participant.clone(), false)?];
			events.extend(
				logged
					.iter()
					.cloned()
					.map(|v| ChangeEvent::added(ChangedRecord::ProtocolViolation(v))),
			);
			self.publish(events);
		}
		Ok((participant, logged))
	}

	/// Record follow-up data; replaces the administered vaccines when the
	/// update carries them.
	pub fn record_outcome(&mut self, id: i64, update: OutcomeUpdate) -> Result<Participant> {
		let registry = &self.registry;
		let participant = self.store.atomically(|tx| {
			let mut participant =
				tables::find::<Participant>(tx, id)?.ok_or(TrialError::ParticipantNotFound(id))?;
			let OutcomeUpdate {
				outcome_at_28_days,
				cause_of_death,
				other_cause_of_death_detail,
				bcg_adverse,
				bcg_adverse_detail,
				bcg_papule,
				last_contact_weight,
				last_weight_date,
				discharged_at,
				death_or_last_contact_at,
				notes,
				vaccines_administered,
			} = update;
			participant.outcome_at_28_days = outcome_at_28_days;
			participant.cause_of_death = cause_of_death;
			participant.other_cause_of_death_detail = other_cause_of_death_detail;
			participant.bcg_adverse = bcg_adverse;
			participant.bcg_adverse_detail = bcg_adverse_detail;
			participant.bcg_papule = bcg_papule;
			participant.last_contact_weight = last_contact_weight;
			participant.last_weight_date = last_weight_date;
			participant.discharged_at = discharged_at;
			participant.death_or_last_contact_at = death_or_last_contact_at;
			participant.notes = notes;
			participant.last_modified = now();
			tables::upsert(tx, &participant)?;

			if let Some(doses) = vaccines_administered {
				let site = registry.get(participant.site_id)?;
				replace_vaccines(tx, site, participant.id, &doses)?;
			}
			Ok(participant)
		})?;

		if self.bus.is_observed() {
			let event = self.participant_event(participant.clone(), false)?;
			self.publish(vec![event]);
		}
		Ok(participant)
	}

	/// Make `doses` the participant's complete set of administered vaccines.
	pub fn set_vaccines_administered(
		&mut self,
		participant_id: i64,
		doses: Vec<VaccineDose>,
	) -> Result<Vec<VaccineAdministered>> {
		let registry = &self.registry;
		let (participant, stored) = self.store.atomically(|tx| {
			let participant = tables::find::<Participant>(tx, participant_id)?
				.ok_or(TrialError::ParticipantNotFound(participant_id))?;
			let site = registry.get(participant.site_id)?;
			let stored = replace_vaccines(tx, site, participant_id, &doses)?;
			Ok((participant, stored))
		})?;

		if self.bus.is_observed() {
			let event = self.participant_event(participant, false)?;
			self.publish(vec![event]);
		}
		Ok(stored)
	}

	pub fn participant_summary(&self) -> Result<ParticipantSummary> {
		let conn = self.conn()?;
		Ok(ParticipantSummary {
			total: tables::count_where(conn, RecordKind::Participant, "")?,
			intervention_arm: tables::count_where(
				conn,
				RecordKind::Participant,
				"WHERE is_intervention_arm = 1",
			)?,
			outcome_recorded: tables::count_where(
				conn,
				RecordKind::Participant,
				"WHERE outcome_at_28_days <> 'pending'",
			)?,
		})
	}

	// --- vaccines ---

	/// Add a vaccine to the catalogue, owned by the local site.
	pub fn add_vaccine(&mut self, name: &str) -> Result<Vaccine> {
		let name = name.trim();
		if name.is_empty() {
			return Err(TrialError::Validation("vaccine name is empty".into()));
		}
		let site = self.registry.local()?.clone();
		self.store.atomically(|tx| {
			let vaccine = Vaccine {
				id: allocator::next_id(tx, RecordKind::Vaccine, &site)?,
				site_id: site.id,
				name: name.to_string(),
				last_modified: now(),
			};
			tables::upsert(tx, &vaccine)?;
			Ok(vaccine)
		})
	}

	pub fn vaccines(&self) -> Result<Vec<Vaccine>> {
		tables::fetch_all(self.conn()?)
	}

	// --- screened patients ---

	pub fn screen(&mut self, patient: NewScreenedPatient) -> Result<ScreenedPatient> {
		let site = self.registry.get(patient.site_id)?.clone();
		let screened = self.store.atomically(|tx| {
			let screened = ScreenedPatient {
				id: allocator::next_id(tx, RecordKind::ScreenedPatient, &site)?,
				site_id: site.id,
				name: patient.name,
				mothers_name: patient.mothers_name,
				hospital_identifier: patient.hospital_identifier.trim().to_string(),
				admission_weight: patient.admission_weight,
				gestational_age_weeks: patient.gestational_age_weeks,
				born_at: patient.born_at,
				is_male: patient.is_male,
				inborn: patient.inborn,
				registered_at: patient.registered_at,
				bad_infection_immune: patient.bad_infection_immune,
				bad_malformation: patient.bad_malformation,
				likely_die_24hr: patient.likely_die_24hr,
				was_given_bcg_prior: patient.was_given_bcg_prior,
				refused_consent: patient.refused_consent,
				missed: patient.missed,
				app_version: APP_VERSION.to_string(),
				last_modified: now(),
			};
			tables::upsert(tx, &screened)?;
			Ok(screened)
		})?;

		if self.bus.is_observed() {
			self.publish(vec![ChangeEvent::added(ChangedRecord::ScreenedPatient(
				screened.clone(),
			))]);
		}
		Ok(screened)
	}

	/// Overwrite a screened patient. The owning site and identifier are fixed.
	pub fn update_screened(&mut self, mut patient: ScreenedPatient) -> Result<ScreenedPatient> {
		let patient = self.store.atomically(|tx| {
			let existing = tables::find::<ScreenedPatient>(tx, patient.id)?.ok_or_else(|| {
				TrialError::Validation(format!("screened patient {} not found", patient.id))
			})?;
			if existing.site_id != patient.site_id {
				return Err(TrialError::Validation(format!(
					"screened patient {} belongs to site {}",
					patient.id, existing.site_id
				)));
			}
			patient.app_version = existing.app_version;
			patient.last_modified = now();
			tables::upsert(tx, &patient)?;
			Ok(patient)
		})?;

		if self.bus.is_observed() {
			self.publish(vec![ChangeEvent::updated(ChangedRecord::ScreenedPatient(
				patient.clone(),
			))]);
		}
		Ok(patient)
	}

	pub fn screened_patients(&self) -> Result<Vec<ScreenedPatient>> {
		tables::fetch_all(self.conn()?)
	}

	pub fn screened_summary(&self) -> Result<ScreenedSummary> {
		let conn = self.conn()?;
		let count = |filter: &str| tables::count_where(conn, RecordKind::ScreenedPatient, filter);
		Ok(ScreenedSummary {
			total: count("")?,
			bad_infection_immune: count("WHERE bad_infection_immune = 1")?,
			bad_malformation: count("WHERE bad_malformation = 1")?,
			likely_die_24hr: count("WHERE likely_die_24hr = 1")?,
			was_given_bcg_prior: count("WHERE was_given_bcg_prior = 1")?,
			refused_consent: count("WHERE refused_consent = 1")?,
			missed: count("WHERE missed = 1")?,
		})
	}

	// --- protocol violations ---

	/// Log a manually reported violation against a participant.
	pub fn report_violation(
		&mut self,
		participant_id: i64,
		severity: ViolationSeverity,
		details: &str,
	) -> Result<ProtocolViolation> {
		let operator = &self.settings.operator;
		let registry = &self.registry;
		let violation = self.store.atomically(|tx| {
			let participant = tables::find::<Participant>(tx, participant_id)?
				.ok_or(TrialError::ParticipantNotFound(participant_id))?;
			let site = registry.get(participant.site_id)?;
			let reported_at = now();
			let violation = ProtocolViolation {
				id: allocator::next_id(tx, RecordKind::ProtocolViolation, site)?,
				site_id: site.id,
				participant_id,
				severity,
				detected: None,
				details: details.to_string(),
				reported_at,
				reporting_investigator: operator.clone(),
				last_modified: reported_at,
			};
			tables::upsert(tx, &violation)?;
			Ok(violation)
		})?;

		if self.bus.is_observed() {
			self.publish(vec![ChangeEvent::added(ChangedRecord::ProtocolViolation(
				violation.clone(),
			))]);
		}
		Ok(violation)
	}

	pub fn protocol_violations(&self) -> Result<Vec<ProtocolViolation>> {
		tables::fetch_all(self.conn()?)
	}

	pub fn violations_for(&self, participant_id: i64) -> Result<Vec<ProtocolViolation>> {
		tables::fetch_where(
			self.conn()?,
			"WHERE participant_id = ?1",
			params![participant_id],
		)
	}

	// --- exchange ---

	fn own_stem(&self) -> Option<String> {
		self.registry
			.local()
			.ok()
			.map(|site| export::archive_stem(&self.settings.store_name, site))
	}

	/// Write this site's archive to the export folder unless the archive
	/// there is already newer than every record.
	pub fn export(&mut self) -> Result<ExportOutcome> {
		let dir = self
			.settings
			.export_target()
			.ok_or_else(|| TrialError::Validation("no export folder configured".into()))?
			.to_path_buf();
		let site = self.registry.local()?.clone();
		let archive = export::archive_path(&dir, &self.settings.store_name, &site);
		let metrics = global_sync_metrics();

		let newest = export::newest_modification(self.conn()?)?;
		if !export::needs_export(&archive, newest)? {
			debug!("archive {} is current", archive.display());
			SyncMetrics::incr(&metrics.exports_skipped);
			return Ok(ExportOutcome::AlreadyCurrent(archive));
		}

		let entry = format!(
			"{}.{}",
			export::archive_stem(&self.settings.store_name, &site),
			self.settings.store_extension
		);
		self.store
			.release(|store_file| sync::write_archive(store_file, &archive, &entry))?;
		SyncMetrics::incr(&metrics.exports_written);
		Ok(ExportOutcome::Written(archive))
	}

	fn migrate_if_required(&mut self, path: &Path) -> Result<()> {
		if self.forgoing_migration.contains(path) {
			return Ok(());
		}
		if !self.migrator.apply_pending(path)? {
			self.forgoing_migration.insert(path.to_path_buf());
		}
		Ok(())
	}

	/// Extract and merge every due archive from the shared folders, one at a
	/// time. An archive is fully committed before the next one starts; on
	/// error the archives already merged stay merged.
	pub fn synchronise(&mut self) -> Result<SyncReport> {
		let metrics = global_sync_metrics();
		let own = self.own_stem();
		let pairs = discovery::discover(
			&self.settings.remote_dirs,
			&self.settings.data_dir,
			&self.settings.store_name,
			&self.settings.store_extension,
			own.as_deref(),
		)?;

		let mut report = SyncReport::default();
		for pair in pairs {
			if !pair.is_due() {
				report.not_due += 1;
				continue;
			}
			match self.merge_archive(&pair) {
				Ok(merged) => {
					SyncMetrics::incr(&metrics.archives_merged);
					report.events_dispatched += merged.events;
					report.merged.push(merged);
				}
				Err(TrialError::InvalidArchiveEntry {
					path,
					expected,
					found,
				}) => {
					warn!(
						"skipping {}: entry has extension '{}', expected '{}'",
						path.display(),
						found,
						expected
					);
					SyncMetrics::incr(&metrics.archives_skipped);
					report.invalid.push(path);
				}
				Err(TrialError::UnreadableArchive { path, reason }) => {
					warn!("skipping {}: {}", path.display(), reason);
					SyncMetrics::incr(&metrics.archives_skipped);
					report.invalid.push(path);
				}
				Err(e) => {
					SyncMetrics::incr(&metrics.archives_failed);
					if e.is_fatal() {
						error!(
							"merge of {} refused, site ranges need an operator: {}",
							pair.archive.display(),
							e
						);
					} else {
						error!("merge of {} failed: {}", pair.archive.display(), e);
					}
					return Err(e);
				}
			}
		}
		Ok(report)
	}

	fn merge_archive(&mut self, pair: &discovery::ArchivePair) -> Result<MergedArchive> {
		let extracted = discovery::extract(pair, &self.settings.data_dir, &self.settings.store_extension)?;
		self.migrate_if_required(&extracted)?;

		let archive_key = pair.archive.to_string_lossy().into_owned();
		let observed = self.bus.is_observed();
		let remote = Store::open_unmigrated(&extracted)?;
		let outcome = self
			.store
			.atomically(|tx| merge::merge_store(tx, remote.conn()?, &archive_key, observed));
		remote.close()?;
		let outcome = outcome?;

		discovery::mark_merged(&extracted, pair.archive_modified)?;
		if outcome.sites_written > 0 {
			self.registry.refresh(self.store.conn()?)?;
		}
		for site in &outcome.new_sites {
			info!("site {} ({}) joined from {}", site.id, site.name, archive_key);
		}
		SyncMetrics::add(&global_sync_metrics().records_upserted, outcome.upserted as u64);

		let events = self.publish(outcome.events);
		Ok(MergedArchive {
			archive: pair.archive.clone(),
			new_sites: outcome.new_sites.iter().map(|s| s.id).collect(),
			upserted: outcome.upserted,
			events,
		})
	}

	/// Sites contained in each remote store extracted so far.
	pub fn remote_site_listing(&mut self) -> Result<Vec<RemoteStore>> {
		let paths = discovery::extracted_stores(
			&self.settings.data_dir,
			&self.settings.store_name,
			&self.settings.store_extension,
		)?;
		let mut listing = Vec::with_capacity(paths.len());
		for path in paths {
			self.migrate_if_required(&path)?;
			let remote = Store::open_unmigrated(&path)?;
			let sites = tables::fetch_all::<Site>(remote.conn()?);
			remote.close()?;
			listing.push(RemoteStore { path, sites: sites? });
		}
		Ok(listing)
	}

	/// Copy the store into `dir` keeping only rows owned by `site_ids`, for
	/// handing a partial dataset to a third party.
	pub fn export_sites(&mut self, dir: &Path, site_ids: &[i64]) -> Result<PathBuf> {
		let chosen: Vec<Site> = site_ids
			.iter()
			.map(|id| self.registry.get(*id).cloned())
			.collect::<Result<_>>()?;
		let first = chosen
			.first()
			.ok_or_else(|| TrialError::Validation("no sites chosen for export".into()))?;

		std::fs::create_dir_all(dir)?;
		let destination = dir.join(format!(
			"{}.{}",
			export::archive_stem(&self.settings.store_name, first),
			self.settings.store_extension
		));
		self.store.release(|store_file| {
			std::fs::copy(store_file, &destination)?;
			Ok(())
		})?;

		let ranges: Vec<(i64, i64)> = chosen.iter().map(Site::range).collect();
		let mut limited = Store::open_unmigrated(&destination)?;
		let removed = limited.atomically(|tx| {
			let mut removed = 0;
			for kind in RecordKind::ALL {
				removed += tables::retain_ranges(tx, kind, &ranges)?;
			}
			let keep = chosen
				.iter()
				.map(|s| s.id.to_string())
				.collect::<Vec<_>>()
				.join(", ");
			tx.execute(
				&format!("DELETE FROM allocation_blocks WHERE site_id NOT IN ({})", keep),
				[],
			)?;
			tx.execute("DELETE FROM merge_log", [])?;
			store::set_local_site_identity(tx, first.identity)?;
			Ok(removed)
		})?;
		limited.close()?;

		info!(
			"exported sites {:?} to {} ({} rows dropped)",
			site_ids,
			destination.display(),
			removed
		);
		Ok(destination)
	}

	pub fn metrics_text(&self) -> String {
		global_sync_metrics().to_prometheus_text()
	}
}

fn new_participant(request: &NewParticipant, r: &Randomisation, operator: &str) -> Participant {
	Participant {
		id: r.participant_id,
		site_id: request.site_id,
		name: request.name.clone(),
		mothers_name: request.mothers_name.clone(),
		hospital_identifier: request.hospital_identifier.trim().to_string(),
		admission_weight: request.admission_weight,
		gestational_age_weeks: request.gestational_age_weeks,
		born_at: request.born_at,
		admission_diagnosis: request.admission_diagnosis.clone(),
		phone_number: request.phone_number.clone(),
		is_male: request.is_male,
		inborn: request.inborn,
		registered_at: request.registered_at,
		registering_investigator: operator.to_string(),
		is_intervention_arm: r.allocation.is_intervention_arm,
		was_envelope_randomised: r.was_envelope_randomised,
		block_number: r.allocation.block_number,
		block_size: r.allocation.block_size,
		multiple_sibling_id: r.multiple_sibling_id,
		outcome_at_28_days: Default::default(),
		cause_of_death: Default::default(),
		other_cause_of_death_detail: None,
		bcg_adverse: None,
		bcg_adverse_detail: None,
		bcg_papule: None,
		last_contact_weight: None,
		last_weight_date: None,
		discharged_at: None,
		death_or_last_contact_at: None,
		notes: None,
		app_version: APP_VERSION.to_string(),
		last_modified: now(),
	}
}

fn apply_edit(p: &mut Participant, edit: ParticipantEdit) {
	p.name = edit.name;
	p.mothers_name = edit.mothers_name;
	p.hospital_identifier = edit.hospital_identifier.trim().to_string();
	p.admission_weight = edit.admission_weight;
	p.gestational_age_weeks = edit.gestational_age_weeks;
	p.born_at = edit.born_at;
	p.admission_diagnosis = edit.admission_diagnosis;
	p.phone_number = edit.phone_number;
	p.is_male = edit.is_male;
	p.inborn = edit.inborn;
	p.registered_at = edit.registered_at;
	p.multiple_sibling_id = edit.multiple_sibling_id;
}

/// Replace a participant's administered vaccines with `doses`. Stored rows
/// missing from `doses` are deleted; doses without an id get one from the
/// participant's site.
fn replace_vaccines(
	conn: &Connection,
	site: &Site,
	participant_id: i64,
	doses: &[VaccineDose],
) -> Result<Vec<VaccineAdministered>> {
	let current: HashMap<i64, VaccineAdministered> = tables::fetch_where::<VaccineAdministered, _>(
		conn,
		"WHERE participant_id = ?1",
		params![participant_id],
	)?
	.into_iter()
	.map(|v| (v.id, v))
	.collect();
	let vaccine_ids: HashSet<i64> = tables::ids(conn, RecordKind::Vaccine)?;

	for dose in doses {
		if !vaccine_ids.contains(&dose.vaccine_id) {
			return Err(TrialError::Validation(format!(
				"unknown vaccine {}",
				dose.vaccine_id
			)));
		}
		if let Some(id) = dose.id {
			if !current.contains_key(&id) {
				return Err(TrialError::Validation(format!(
					"vaccine dose {} does not belong to participant {}",
					id, participant_id
				)));
			}
		}
	}

	let keep: HashSet<i64> = doses.iter().filter_map(|d| d.id).collect();
	for id in current.keys().filter(|id| !keep.contains(id)) {
		tables::delete(conn, RecordKind::VaccineAdministered, *id)?;
	}

	let stamp = now();
	let mut stored = Vec::with_capacity(doses.len());
	for dose in doses {
		let row = match dose.id.and_then(|id| current.get(&id)) {
			Some(existing)
				if existing.vaccine_id == dose.vaccine_id
					&& existing.administered_at == dose.administered_at =>
			{
				existing.clone()
			}
			Some(existing) => {
				let row = VaccineAdministered {
					vaccine_id: dose.vaccine_id,
					administered_at: dose.administered_at,
					last_modified: stamp,
					..existing.clone()
				};
				tables::upsert(conn, &row)?;
				row
			}
			None => {
				let row = VaccineAdministered {
					id: allocator::next_id(conn, RecordKind::VaccineAdministered, site)?,
					site_id: site.id,
					participant_id,
					vaccine_id: dose.vaccine_id,
					administered_at: dose.administered_at,
					last_modified: stamp,
				};
				tables::upsert(conn, &row)?;
				row
			}
		};
		stored.push(row);
	}
	Ok(stored)
}
