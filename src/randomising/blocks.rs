//! Persisted randomisation blocks, one series per site and category.
//!
//! A block's arm sequence is shuffled once when the block is opened and kept
//! in `allocation_blocks`, so balance survives restarts and merges.

use rand::Rng;
use rand::seq::SliceRandom;
use rusqlite::{Connection, OptionalExtension, params};

use super::{Allocation, RandomisingCategory};
use crate::error::{Result, TrialError};

const INTERVENTION: char = 'I';
const CONTROL: char = 'C';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
	pub site_id: i64,
	pub category: RandomisingCategory,
	pub block_number: i32,
	/// `true` entries are intervention slots.
	pub sequence: Vec<bool>,
	pub consumed: Vec<bool>,
}

impl Block {
	pub fn size(&self) -> i32 {
		self.sequence.len() as i32
	}

	pub fn is_full(&self) -> bool {
		self.consumed.iter().all(|c| *c)
	}

	fn next_free(&self, arm: Option<bool>) -> Option<usize> {
		(0..self.sequence.len())
			.find(|&i| !self.consumed[i] && arm.is_none_or(|a| self.sequence[i] == a))
	}

	fn take(&mut self, slot: usize) -> Allocation {
		self.consumed[slot] = true;
		Allocation {
			is_intervention_arm: self.sequence[slot],
			block_number: Some(self.block_number),
			block_size: self.size(),
		}
	}
}

/// Latest block of the category's series, full or not.
pub fn current(conn: &Connection, site_id: i64, category: RandomisingCategory) -> Result<Option<Block>> {
	let row = conn
		.query_row(
			"SELECT block_number, sequence, consumed FROM allocation_blocks
			 WHERE site_id = ?1 AND is_male = ?2 AND heavy = ?3
			 ORDER BY block_number DESC LIMIT 1",
			params![site_id, category.is_male, category.heavy],
			|row| {
				Ok((
					row.get::<_, i32>(0)?,
					row.get::<_, String>(1)?,
					row.get::<_, String>(2)?,
				))
			},
		)
		.optional()?;

	Ok(row.map(|(block_number, sequence, consumed)| Block {
		site_id,
		category,
		block_number,
		sequence: sequence.chars().map(|c| c == INTERVENTION).collect(),
		consumed: consumed.chars().map(|c| c == '1').collect(),
	}))
}

fn save(conn: &Connection, block: &Block) -> Result<()> {
	let sequence: String = block
		.sequence
		.iter()
		.map(|i| if *i { INTERVENTION } else { CONTROL })
		.collect();
	let consumed: String = block
		.consumed
		.iter()
		.map(|c| if *c { '1' } else { '0' })
		.collect();
	conn.execute(
		"INSERT OR REPLACE INTO allocation_blocks
		 (site_id, is_male, heavy, block_number, block_size, sequence, consumed)
		 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
		params![
			block.site_id,
			block.category.is_male,
			block.category.heavy,
			block.block_number,
			block.size(),
			sequence,
			consumed
		],
	)?;
	Ok(())
}

/// Balanced, shuffled block following `previous` in the series.
pub fn open_next<R: Rng + ?Sized>(
	site_id: i64,
	category: RandomisingCategory,
	previous: Option<&Block>,
	block_sizes: &[i32],
	rng: &mut R,
) -> Result<Block> {
	let usable: Vec<i32> = block_sizes
		.iter()
		.copied()
		.filter(|s| *s >= 2 && s % 2 == 0)
		.collect();
	let size = *usable.choose(rng).ok_or_else(|| {
		TrialError::Validation(format!(
			"no usable block size in {:?}; sizes must be even and at least 2",
			block_sizes
		))
	})?;

	let half = (size / 2) as usize;
	let mut sequence = vec![true; half];
	sequence.extend(std::iter::repeat_n(false, half));
	sequence.shuffle(rng);

	Ok(Block {
		site_id,
		category,
		block_number: previous.map_or(1, |b| b.block_number + 1),
		consumed: vec![false; sequence.len()],
		sequence,
	})
}

/// Take the next slot of the category's open block, opening a block first if
/// the series is empty or its last block is full.
pub fn allocate<R: Rng + ?Sized>(
	conn: &Connection,
	site_id: i64,
	category: RandomisingCategory,
	block_sizes: &[i32],
	rng: &mut R,
) -> Result<Allocation> {
	take_slot(conn, site_id, category, None, block_sizes, rng)
}

/// Block membership for a participant whose category changed after
/// allocation. The arm is kept; the first free slot for that arm in the new
/// category's open block is consumed, or a fresh block is opened.
pub fn reassign<R: Rng + ?Sized>(
	conn: &Connection,
	site_id: i64,
	category: RandomisingCategory,
	is_intervention_arm: bool,
	block_sizes: &[i32],
	rng: &mut R,
) -> Result<Allocation> {
	take_slot(conn, site_id, category, Some(is_intervention_arm), block_sizes, rng)
}

fn take_slot<R: Rng + ?Sized>(
	conn: &Connection,
	site_id: i64,
	category: RandomisingCategory,
	arm: Option<bool>,
	block_sizes: &[i32],
	rng: &mut R,
) -> Result<Allocation> {
	let existing = current(conn, site_id, category)?;
	let (mut block, slot) = match existing.as_ref().and_then(|b| b.next_free(arm).map(|s| (b, s))) {
		Some((b, s)) => (b.clone(), s),
		None => {
			let fresh = open_next(site_id, category, existing.as_ref(), block_sizes, rng)?;
			let slot = fresh
				.next_free(arm)
				.ok_or_else(|| TrialError::Validation("new block has no free slot".into()))?;
			(fresh, slot)
		}
	};
	let allocation = block.take(slot);
	save(conn, &block)?;
	Ok(allocation)
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use rand::SeedableRng;
	use rand::rngs::StdRng;

	use super::*;
	use crate::store::schema::SqliteMigrator;

	fn conn() -> Connection {
		let mut conn = Connection::open_in_memory().expect("open");
		SqliteMigrator::migrate(&mut conn).expect("migrate");
		conn
	}

	const LIGHT_BOYS: RandomisingCategory = RandomisingCategory {
		is_male: true,
		heavy: false,
	};

	#[test]
	fn every_completed_block_is_balanced() {
		let conn = conn();
		let mut rng = StdRng::seed_from_u64(7);
		let mut by_block = std::collections::BTreeMap::<i32, (i32, i32)>::new();

		for _ in 0..60 {
			let a = allocate(&conn, 1, LIGHT_BOYS, &[4, 6], &mut rng).expect("allocate");
			let entry = by_block.entry(a.block_number.expect("block")).or_default();
			if a.is_intervention_arm {
				entry.0 += 1;
			} else {
				entry.1 += 1;
			}
		}

		let last = *by_block.keys().next_back().expect("blocks");
		for (number, (intervention, control)) in by_block {
			if number != last {
				assert_eq!(intervention, control, "block {number} unbalanced");
			}
		}
	}

	#[test]
	fn categories_have_independent_series() {
		let conn = conn();
		let mut rng = StdRng::seed_from_u64(1);
		let heavy_girls = RandomisingCategory {
			is_male: false,
			heavy: true,
		};
		allocate(&conn, 1, LIGHT_BOYS, &[2], &mut rng).expect("a");
		allocate(&conn, 1, LIGHT_BOYS, &[2], &mut rng).expect("b");
		let third = allocate(&conn, 1, LIGHT_BOYS, &[2], &mut rng).expect("c");
		let other = allocate(&conn, 1, heavy_girls, &[2], &mut rng).expect("d");
		assert_eq!(third.block_number, Some(2));
		assert_eq!(other.block_number, Some(1));
	}

	#[test]
	fn reassignment_keeps_the_arm() {
		let conn = conn();
		let mut rng = StdRng::seed_from_u64(3);
		for arm in [true, true, false, true] {
			let a = reassign(&conn, 1, LIGHT_BOYS, arm, &[4], &mut rng).expect("reassign");
			assert_eq!(a.is_intervention_arm, arm);
			assert_eq!(a.block_size, 4);
		}
		// third intervention slot cannot fit in a 4-block
		let block = current(&conn, 1, LIGHT_BOYS).expect("load").expect("block");
		assert_eq!(block.block_number, 2);
	}

	#[test]
	fn odd_block_sizes_are_refused() {
		let conn = conn();
		let mut rng = StdRng::seed_from_u64(0);
		let err = allocate(&conn, 1, LIGHT_BOYS, &[3, 5], &mut rng).expect_err("odd sizes");
		assert!(matches!(err, TrialError::Validation(_)));
	}
}
