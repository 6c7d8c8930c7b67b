mod common;

#[cfg(feature = "integration-tests")]
mod integration_tests {
	use serde_json::json;
	use trialsync::model::{ParticipantEdit, SiteDraft, ViolationKind, ViolationSeverity};
	use trialsync::{AllocationOutcome, Repository, TrialError};

	use super::common::{self, Network};

	/// Store for site [1,999] with ten sealed envelopes numbered 1..=10.
	fn with_envelopes(net: &Network) -> Repository {
		let envelopes: Vec<_> = (1..=10)
			.map(|n| {
				json!({
					"number": n,
					"block_number": (n - 1) / 4 + 1,
					"block_size": 4,
					"is_intervention_arm": n % 2 == 0,
				})
			})
			.collect();
		let file = net.archive_dir().join("envelopes.json");
		std::fs::write(&file, serde_json::to_vec(&envelopes).unwrap()).unwrap();

		let mut settings = net.settings("enveloped");
		settings.envelopes_file = Some(file);
		let mut repo = Repository::open(settings).unwrap().with_rng_seed(7);
		repo.provision_sites(vec![SiteDraft::new(1, 999, "enveloped")])
			.unwrap();
		repo
	}

	#[test]
	fn test_same_sex_twin_shares_allocation() {
		let net = Network::new();
		let (mut repo, _) = net.site("alpha", 1, 999);
		let (first, outcome) = repo.enrol(common::participant(1, true, 900)).unwrap();
		assert_eq!(outcome, AllocationOutcome::BlockAllocated);

		let mut twin = common::participant(1, true, 950);
		twin.multiple_sibling_id = Some(first.id);
		let (second, outcome) = repo.enrol(twin).unwrap();
		assert_eq!(outcome, AllocationOutcome::ForcedSiblingAllocated);
		assert_eq!(second.is_intervention_arm, first.is_intervention_arm);
		assert_eq!(second.block_number, first.block_number);
		assert_eq!(second.block_size, first.block_size);
		assert_eq!(second.multiple_sibling_id, Some(first.id));
	}

	#[test]
	fn test_opposite_sex_twin_is_randomised_independently() {
		let net = Network::new();
		let (mut repo, _) = net.site("alpha", 1, 999);
		let (first, _) = repo.enrol(common::participant(1, true, 900)).unwrap();

		let mut twin = common::participant(1, false, 900);
		twin.multiple_sibling_id = Some(first.id);
		let (second, outcome) = repo.enrol(twin).unwrap();
		assert_eq!(outcome, AllocationOutcome::BlockAllocated);
		assert_eq!(second.multiple_sibling_id, Some(first.id));
	}

	#[test]
	fn test_sibling_must_be_enrolled_at_same_site() {
		let net = Network::new();
		let mut repo = Repository::open(net.settings("pair")).unwrap();
		repo.provision_sites(vec![
			SiteDraft::new(1, 999, "north"),
			SiteDraft::new(1000, 1999, "south"),
		])
		.unwrap();
		let (north, _) = repo.enrol(common::participant(1, true, 900)).unwrap();

		let mut twin = common::participant(1000, true, 900);
		twin.multiple_sibling_id = Some(north.id);
		let err = repo.enrol(twin).unwrap_err();
		assert!(matches!(err, TrialError::InvalidSibling { .. }), "{err}");

		let mut orphan = common::participant(1, true, 900);
		orphan.multiple_sibling_id = Some(555);
		assert!(matches!(
			repo.enrol(orphan),
			Err(TrialError::InvalidSibling { sibling_id: 555, .. })
		));
	}

	#[test]
	fn test_blocks_balance_arms() {
		let net = Network::new();
		let mut settings = net.settings("balanced");
		settings.randomising.block_sizes = vec![4];
		let mut repo = Repository::open(settings).unwrap().with_rng_seed(11);
		repo.provision_sites(vec![SiteDraft::new(1, 999, "balanced")])
			.unwrap();

		let mut intervention = 0;
		for _ in 0..8 {
			let (p, _) = repo.enrol(common::participant(1, false, 1200)).unwrap();
			assert_eq!(p.block_size, 4);
			if p.is_intervention_arm {
				intervention += 1;
			}
		}
		assert_eq!(intervention, 4);
		assert_eq!(repo.participant_summary().unwrap().intervention_arm, 4);
	}

	#[test]
	fn test_envelope_allocation_uses_envelope_number() {
		let net = Network::new();
		let mut repo = with_envelopes(&net);

		let mut request = common::participant(1, true, 900);
		request.envelope_number = Some(4);
		let (opened, outcome) = repo.enrol(request.clone()).unwrap();
		assert_eq!(outcome, AllocationOutcome::EnvelopeAllocated);
		assert_eq!(opened.id, 4);
		assert!(opened.is_intervention_arm);
		assert!(opened.was_envelope_randomised);
		assert_eq!(opened.block_number, Some(1));

		assert!(matches!(
			repo.enrol(request),
			Err(TrialError::EnvelopeAlreadyUsed(4))
		));

		let mut missing = common::participant(1, true, 900);
		missing.envelope_number = Some(99);
		assert!(matches!(repo.enrol(missing), Err(TrialError::EnvelopeNotFound(99))));
	}

	#[test]
	fn test_envelope_twin_is_numbered_above_the_envelopes() {
		let net = Network::new();
		let mut repo = with_envelopes(&net);

		let (first, _) = repo.enrol(common::participant(1, false, 1500)).unwrap();
		assert_eq!(first.id, 2);

		let mut sealed = common::participant(1, true, 900);
		sealed.envelope_number = Some(5);
		repo.enrol(sealed).unwrap();

		let mut twin = common::participant(1, true, 900);
		twin.multiple_sibling_id = Some(5);
		let (second, outcome) = repo.enrol(twin).unwrap();
		assert_eq!(outcome, AllocationOutcome::ForcedSiblingAllocated);
		assert_eq!(second.id, 11);
		assert!(second.was_envelope_randomised);

		// Block numbering carries on from the largest id in the site range.
		let (third, _) = repo.enrol(common::participant(1, false, 1500)).unwrap();
		assert_eq!(third.id, 12);
	}

	#[test]
	fn test_weight_band_change_logs_one_violation() {
		let net = Network::new();
		let (mut repo, _) = net.site("alpha", 1, 999);
		let (p, _) = repo.enrol(common::participant(1, true, 900)).unwrap();
		let events = common::record_events(&mut repo);

		let mut edit = ParticipantEdit::from(&p);
		edit.admission_weight = 1100;
		let (updated, violations) = repo.update_enrollment(p.id, edit).unwrap();

		assert_eq!(violations.len(), 1);
		assert_eq!(violations[0].detected, Some(ViolationKind::BlockCriteriaChanged));
		assert_eq!(violations[0].severity, ViolationSeverity::MajorWrongAllocation);
		assert_eq!(violations[0].reporting_investigator, "alpha-operator");
		assert_eq!(updated.admission_weight, 1100);
		assert_eq!(updated.is_intervention_arm, p.is_intervention_arm);
		assert_eq!(repo.violations_for(p.id).unwrap().len(), 1);
		assert_eq!(events.borrow().len(), 2);
	}

	#[test]
	fn test_unrelated_edit_logs_nothing() {
		let net = Network::new();
		let (mut repo, _) = net.site("alpha", 1, 999);
		let (p, _) = repo.enrol(common::participant(1, false, 1500)).unwrap();

		let mut edit = ParticipantEdit::from(&p);
		edit.name = "Corrected".into();
		edit.admission_weight = 1450;
		let (updated, violations) = repo.update_enrollment(p.id, edit).unwrap();
		assert!(violations.is_empty());
		assert_eq!(updated.name, "Corrected");
		assert!(updated.last_modified > p.last_modified);
	}

	#[test]
	fn test_weight_above_limit_is_ineligible() {
		let net = Network::new();
		let (mut repo, _) = net.site("alpha", 1, 999);
		let (p, _) = repo.enrol(common::participant(1, false, 1500)).unwrap();

		let mut edit = ParticipantEdit::from(&p);
		edit.admission_weight = 2300;
		let (_, violations) = repo.update_enrollment(p.id, edit).unwrap();
		let kinds: Vec<_> = violations.iter().filter_map(|v| v.detected).collect();
		assert_eq!(kinds, vec![ViolationKind::IneligibleWeight]);
	}

	#[test]
	fn test_correcting_weight_downwards_logs_nothing() {
		let net = Network::new();
		let (mut repo, _) = net.site("alpha", 1, 999);
		let (p, _) = repo.enrol(common::participant(1, true, 2500)).unwrap();

		let mut edit = ParticipantEdit::from(&p);
		edit.admission_weight = 2200;
		let (updated, violations) = repo.update_enrollment(p.id, edit).unwrap();
		assert!(violations.is_empty());
		assert_eq!(updated.admission_weight, 2200);
		assert!(repo.violations_for(p.id).unwrap().is_empty());
	}

	#[test]
	fn test_violations_from_one_edit_share_time_and_operator() {
		let net = Network::new();
		let (mut repo, _) = net.site("alpha", 1, 999);
		let (p, _) = repo.enrol(common::participant(1, true, 900)).unwrap();

		let mut edit = ParticipantEdit::from(&p);
		edit.admission_weight = 2300;
		let (updated, violations) = repo.update_enrollment(p.id, edit).unwrap();
		let kinds: Vec<_> = violations.iter().filter_map(|v| v.detected).collect();
		assert_eq!(
			kinds,
			vec![ViolationKind::BlockCriteriaChanged, ViolationKind::IneligibleWeight]
		);
		assert_eq!(violations[0].reported_at, violations[1].reported_at);
		assert!(violations.iter().all(|v| v.reporting_investigator == "alpha-operator"));
		assert!(violations.iter().all(|v| v.participant_id == p.id));
		assert_ne!(violations[0].id, violations[1].id);
		assert_eq!(updated.last_modified, violations[0].reported_at);

		let stored = repo.violations_for(p.id).unwrap();
		assert_eq!(stored.len(), 2);
		assert!(stored.iter().all(|v| v.reported_at == violations[0].reported_at));
	}
}
