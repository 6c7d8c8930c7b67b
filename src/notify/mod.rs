//! Change notifications.
//!
//! Core operations return batches of [`ChangeEvent`]s; the bus fans them out
//! to whatever subscribers the caller registered. Operations ask
//! [`ChangeBus::is_observed`] first and skip building events nobody reads.

use serde::Serialize;

use crate::model::{Participant, ProtocolViolation, ScreenedPatient, VaccineAdministered};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
	Added,
	Updated,
}

/// A participant together with its administered vaccines.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipantSnapshot {
	pub participant: Participant,
	pub vaccines_administered: Vec<VaccineAdministered>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum ChangedRecord {
	Participant(ParticipantSnapshot),
	ScreenedPatient(ScreenedPatient),
	ProtocolViolation(ProtocolViolation),
}

impl ChangedRecord {
	pub fn id(&self) -> i64 {
		match self {
			Self::Participant(s) => s.participant.id,
			Self::ScreenedPatient(p) => p.id,
			Self::ProtocolViolation(v) => v.id,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
	pub change: ChangeKind,
	pub record: ChangedRecord,
}

impl ChangeEvent {
	pub fn added(record: ChangedRecord) -> Self {
		Self {
			change: ChangeKind::Added,
			record,
		}
	}

	pub fn updated(record: ChangedRecord) -> Self {
		Self {
			change: ChangeKind::Updated,
			record,
		}
	}
}

pub trait ChangeSubscriber {
	fn on_change(&mut self, event: &ChangeEvent);
}

impl<F> ChangeSubscriber for F
where
	F: FnMut(&ChangeEvent),
{
	fn on_change(&mut self, event: &ChangeEvent) {
		self(event)
	}
}

#[derive(Default)]
pub struct ChangeBus {
	subscribers: Vec<Box<dyn ChangeSubscriber>>,
}

impl std::fmt::Debug for ChangeBus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChangeBus")
			.field("subscribers", &self.subscribers.len())
			.finish()
	}
}

impl ChangeBus {
	pub fn subscribe(&mut self, subscriber: impl ChangeSubscriber + 'static) {
		self.subscribers.push(Box::new(subscriber));
	}

	pub fn is_observed(&self) -> bool {
		!self.subscribers.is_empty()
	}

	/// Deliver every event to every subscriber, in order. Returns the number
	/// of events delivered.
	pub fn dispatch(&mut self, events: &[ChangeEvent]) -> usize {
		if self.subscribers.is_empty() {
			return 0;
		}
		for event in events {
			for subscriber in self.subscribers.iter_mut() {
				subscriber.on_change(event);
			}
		}
		events.len()
	}
}
