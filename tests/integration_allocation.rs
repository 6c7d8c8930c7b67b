mod common;

#[cfg(feature = "integration-tests")]
mod integration_tests {
	use chrono::{Duration, TimeZone, Utc};
	use trialsync::model::{OutcomeUpdate, RecordKind, SiteDraft, VaccineDose, ViolationSeverity};
	use trialsync::{ChangeKind, Repository, TrialError};
	use uuid::Uuid;

	use super::common::{self, Network};

	#[test]
	fn test_each_kind_counts_from_the_site_id() {
		let net = Network::new();
		let (mut repo, _) = net.site("kilo", 3000, 3999);

		let (p1, _) = repo.enrol(common::participant(3000, true, 900)).unwrap();
		let (p2, _) = repo.enrol(common::participant(3000, false, 900)).unwrap();
		let screened = repo.screen(common::screened(3000)).unwrap();
		let vaccine = repo.add_vaccine("BCG").unwrap();
		let violation = repo
			.report_violation(p1.id, ViolationSeverity::Major, "dose given twice")
			.unwrap();

		assert_eq!((p1.id, p2.id), (3001, 3002));
		assert_eq!(screened.id, 3001);
		assert_eq!(vaccine.id, 3001);
		assert_eq!(violation.id, 3001);
		assert_eq!(violation.reporting_investigator, "kilo-operator");
	}

	#[test]
	fn test_exhausted_range_is_an_error() {
		let net = Network::new();
		let (mut repo, _) = net.site("tiny", 1, 3);
		repo.enrol(common::participant(1, true, 900)).unwrap();
		repo.enrol(common::participant(1, true, 900)).unwrap();
		match repo.enrol(common::participant(1, true, 900)) {
			Err(TrialError::RangeExhausted { kind, site_id, max_id }) => {
				assert_eq!(kind, RecordKind::Participant);
				assert_eq!((site_id, max_id), (1, 3));
			}
			other => panic!("unexpected {other:?}"),
		}
		assert_eq!(repo.participants().unwrap().len(), 2);
	}

	#[test]
	fn test_provisioning_rejects_conflicting_sites() {
		let net = Network::new();
		let (mut repo, alpha) = net.site("alpha", 1, 999);

		let overlap = repo.provision_sites(vec![SiteDraft::new(900, 1500, "overlap")]);
		assert!(matches!(overlap, Err(TrialError::OverlappingRange { .. })));

		let duplicate = repo.provision_sites(vec![SiteDraft::new(1, 99, "duplicate")]);
		assert!(matches!(duplicate, Err(TrialError::DuplicateSiteKey { .. })));

		let empty = repo.provision_sites(vec![SiteDraft::new(5000, 4000, "empty")]);
		assert!(matches!(empty, Err(TrialError::Validation(_))));

		// Updating a known site by identity is allowed.
		let renamed = repo
			.provision_sites(vec![
				SiteDraft::new(1, 999, "alpha renamed").with_identity(alpha.identity),
			])
			.unwrap();
		assert_eq!(renamed[0].name, "alpha renamed");
		assert_eq!(repo.sites().len(), 1);
		assert_eq!(repo.local_site().unwrap().identity, alpha.identity);

		let fresh = SiteDraft::new(1000, 1999, "bravo").with_identity(Uuid::new_v4());
		repo.provision_sites(vec![fresh]).unwrap();
		assert_eq!(repo.sites().len(), 2);
		assert_eq!(repo.local_site().unwrap().id, 1);
	}

	#[test]
	fn test_enrolment_needs_a_known_site() {
		let net = Network::new();
		let mut repo = Repository::open(net.settings("empty")).unwrap();
		assert!(matches!(
			repo.enrol(common::participant(1, true, 900)),
			Err(TrialError::UnknownSite(1))
		));
		assert!(matches!(repo.add_vaccine("BCG"), Err(TrialError::NoLocalSite)));
	}

	#[test]
	fn test_vaccines_administered_are_replaced_as_a_set() {
		let net = Network::new();
		let (mut repo, _) = net.site("alpha", 1, 999);
		let bcg = repo.add_vaccine("BCG").unwrap();
		let opv = repo.add_vaccine("OPV").unwrap();
		let (p, _) = repo.enrol(common::participant(1, true, 900)).unwrap();
		let given = Utc.with_ymd_and_hms(2024, 3, 2, 9, 0, 0).single().unwrap();

		let stored = repo
			.set_vaccines_administered(
				p.id,
				vec![
					VaccineDose {
						id: None,
						vaccine_id: bcg.id,
						administered_at: given,
					},
					VaccineDose {
						id: None,
						vaccine_id: opv.id,
						administered_at: given,
					},
				],
			)
			.unwrap();
		assert_eq!(stored.iter().map(|v| v.id).collect::<Vec<_>>(), vec![2, 3]);

		let events = common::record_events(&mut repo);
		let kept = VaccineDose {
			id: Some(stored[1].id),
			vaccine_id: opv.id,
			administered_at: given + Duration::days(1),
		};
		let updated = repo
			.record_outcome(
				p.id,
				OutcomeUpdate {
					vaccines_administered: Some(vec![kept]),
					..OutcomeUpdate::default()
				},
			)
			.unwrap();
		let remaining = repo.vaccines_administered(p.id).unwrap();
		assert_eq!(remaining.len(), 1);
		assert_eq!(remaining[0].id, stored[1].id);
		assert_eq!(remaining[0].administered_at, given + Duration::days(1));
		assert!(updated.last_modified > p.last_modified);
		assert_eq!(events.borrow()[0].change, ChangeKind::Updated);

		let unknown = repo.set_vaccines_administered(
			p.id,
			vec![VaccineDose {
				id: None,
				vaccine_id: 777,
				administered_at: given,
			}],
		);
		assert!(matches!(unknown, Err(TrialError::Validation(_))));
		assert_eq!(repo.vaccines_administered(p.id).unwrap().len(), 1);
	}

	#[test]
	fn test_summaries_count_flags() {
		let net = Network::new();
		let (mut repo, _) = net.site("alpha", 1, 999);
		repo.enrol(common::participant(1, true, 900)).unwrap();
		let first = repo.screen(common::screened(1)).unwrap();
		let mut second = repo.screen(common::screened(1)).unwrap();
		second.missed = Some(true);
		second.bad_malformation = false;
		repo.update_screened(second).unwrap();

		let participants = repo.participant_summary().unwrap();
		assert_eq!(participants.total, 1);
		assert_eq!(participants.outcome_recorded, 0);

		let screened = repo.screened_summary().unwrap();
		assert_eq!(screened.total, 2);
		assert_eq!(screened.bad_malformation, 1);
		assert_eq!(screened.missed, 1);
		assert_eq!(screened.refused_consent, 0);

		let mut moved = first;
		moved.site_id = 1000;
		assert!(matches!(repo.update_screened(moved), Err(TrialError::Validation(_))));
	}
}
