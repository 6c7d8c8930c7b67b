//! Common fixtures for integration tests: one repository per simulated site,
//! all sharing one exchange folder.
#![allow(dead_code)]

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;
use trialsync::config::Settings;
use trialsync::model::{NewParticipant, NewScreenedPatient, Site, SiteDraft};
use trialsync::{ChangeEvent, Repository};

/// A temporary exchange folder plus per-site data folders beneath it.
pub struct Network {
	pub root: TempDir,
}

impl Network {
	pub fn new() -> Self {
		Self {
			root: tempfile::tempdir().unwrap(),
		}
	}

	pub fn shared(&self) -> PathBuf {
		self.root.path().join("shared")
	}

	pub fn settings(&self, site_name: &str) -> Settings {
		let shared = self.shared();
		std::fs::create_dir_all(&shared).unwrap();
		Settings {
			data_dir: self.root.path().join(site_name),
			remote_dirs: vec![shared],
			operator: format!("{site_name}-operator"),
			..Settings::default()
		}
	}

	/// Open a fresh store for `name` provisioned with the range `[id, max_id]`.
	pub fn site(&self, name: &str, id: i64, max_id: i64) -> (Repository, Site) {
		let mut repo = Repository::open(self.settings(name))
			.unwrap()
			.with_rng_seed(id as u64);
		let site = repo
			.provision_sites(vec![SiteDraft::new(id, max_id, name)])
			.unwrap()
			.remove(0);
		(repo, site)
	}

	pub fn archive_dir(&self) -> &Path {
		self.root.path()
	}
}

pub fn participant(site_id: i64, is_male: bool, weight: i32) -> NewParticipant {
	let born = Utc.with_ymd_and_hms(2024, 3, 1, 6, 30, 0).single().unwrap();
	NewParticipant {
		site_id,
		name: "Baby".into(),
		mothers_name: "Mother".into(),
		hospital_identifier: format!("H-{site_id}-{weight}"),
		admission_weight: weight,
		gestational_age_weeks: 31.5,
		born_at: born,
		admission_diagnosis: "prematurity".into(),
		phone_number: String::new(),
		is_male,
		inborn: Some(true),
		registered_at: born + chrono::Duration::hours(4),
		multiple_sibling_id: None,
		envelope_number: None,
	}
}

pub fn screened(site_id: i64) -> NewScreenedPatient {
	let born = Utc.with_ymd_and_hms(2024, 3, 2, 1, 0, 0).single().unwrap();
	NewScreenedPatient {
		site_id,
		name: "Screened".into(),
		mothers_name: "Mother".into(),
		hospital_identifier: format!("S-{site_id}"),
		admission_weight: 1500,
		gestational_age_weeks: 33.0,
		born_at: born,
		is_male: false,
		inborn: Some(false),
		registered_at: born + chrono::Duration::hours(2),
		bad_infection_immune: false,
		bad_malformation: true,
		likely_die_24hr: false,
		was_given_bcg_prior: false,
		refused_consent: Some(false),
		missed: None,
	}
}

/// Subscribe a recorder to `repo` and return the shared event log.
pub fn record_events(repo: &mut Repository) -> Rc<RefCell<Vec<ChangeEvent>>> {
	let log = Rc::new(RefCell::new(Vec::new()));
	let sink = Rc::clone(&log);
	repo.subscribe(move |event: &ChangeEvent| sink.borrow_mut().push(event.clone()));
	log
}

/// File timestamps come from a coarse clock; pause long enough that the next
/// file written is stamped after every record modified so far.
pub fn tick() {
	std::thread::sleep(std::time::Duration::from_millis(30));
}
