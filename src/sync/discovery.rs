//! Finding other sites' archives and their extracted copies.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::{debug, warn};
use regex::Regex;
use zip::ZipArchive;

use crate::error::{Result, TrialError};

/// Matches `<store>_<32 hex>.<extension>` and captures the stem.
pub fn file_pattern(store_name: &str, extension: &str) -> Result<Regex> {
	let pattern = format!(
		r"^({}_[0-9a-fA-F]{{32}})\.{}$",
		regex::escape(store_name),
		regex::escape(extension)
	);
	Regex::new(&pattern).map_err(|e| TrialError::Validation(e.to_string()))
}

/// A remote archive and, when it has been extracted before, the local copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePair {
	pub stem: String,
	pub archive: PathBuf,
	pub archive_modified: SystemTime,
	pub extracted: Option<PathBuf>,
	pub extracted_modified: Option<SystemTime>,
}

impl ArchivePair {
	/// Due when never extracted, or when the copy predates the archive.
	pub fn is_due(&self) -> bool {
		match self.extracted_modified {
			None => true,
			Some(extracted) => extracted < self.archive_modified,
		}
	}
}

fn matching_files(dir: &Path, pattern: &Regex) -> Result<Vec<(String, PathBuf, SystemTime)>> {
	let mut found = Vec::new();
	for entry in std::fs::read_dir(dir)? {
		let entry = entry?;
		let name = entry.file_name();
		let Some(name) = name.to_str() else {
			continue;
		};
		let Some(captures) = pattern.captures(name) else {
			continue;
		};
		let metadata = entry.metadata()?;
		if !metadata.is_file() {
			continue;
		}
		found.push((
			captures[1].to_string(),
			entry.path(),
			metadata.modified()?,
		));
	}
	found.sort_by(|a, b| a.0.cmp(&b.0));
	Ok(found)
}

/// Archives in `remote_dirs` paired with extracted stores in `data_dir` by
/// stem. `own_stem` (this site's archive) is left out. Missing remote
/// folders are logged and skipped.
pub fn discover(
	remote_dirs: &[PathBuf],
	data_dir: &Path,
	store_name: &str,
	store_extension: &str,
	own_stem: Option<&str>,
) -> Result<Vec<ArchivePair>> {
	let zip_pattern = file_pattern(store_name, "zip")?;
	let store_pattern = file_pattern(store_name, store_extension)?;

	let mut pairs: Vec<ArchivePair> = Vec::new();
	for dir in remote_dirs {
		if !dir.is_dir() {
			warn!("shared folder {} is not available", dir.display());
			continue;
		}
		for (stem, archive, archive_modified) in matching_files(dir, &zip_pattern)? {
			if Some(stem.as_str()) == own_stem {
				continue;
			}
			if pairs.iter().any(|p| p.stem == stem) {
				warn!(
					"ignoring {}: an archive named {} was already found",
					archive.display(),
					stem
				);
				continue;
			}
			pairs.push(ArchivePair {
				stem,
				archive,
				archive_modified,
				extracted: None,
				extracted_modified: None,
			});
		}
	}

	if data_dir.is_dir() {
		for (stem, path, modified) in matching_files(data_dir, &store_pattern)? {
			if let Some(pair) = pairs.iter_mut().find(|p| p.stem == stem) {
				pair.extracted = Some(path);
				pair.extracted_modified = Some(modified);
			}
		}
	}

	debug!("discovered {} remote archives", pairs.len());
	Ok(pairs)
}

/// Extracted stores present in `data_dir`, whether or not their archive is
/// still reachable.
pub fn extracted_stores(data_dir: &Path, store_name: &str, store_extension: &str) -> Result<Vec<PathBuf>> {
	if !data_dir.is_dir() {
		return Ok(Vec::new());
	}
	let pattern = file_pattern(store_name, store_extension)?;
	Ok(matching_files(data_dir, &pattern)?
		.into_iter()
		.map(|(_, path, _)| path)
		.collect())
}

/// Extract the single store entry of `pair` into `data_dir`.
///
/// The copy's modification time is pinned to the epoch so the pair stays due
/// until [`mark_merged`] records a committed merge.
pub fn extract(pair: &ArchivePair, data_dir: &Path, store_extension: &str) -> Result<PathBuf> {
	let unreadable = |e: zip::result::ZipError| TrialError::UnreadableArchive {
		path: pair.archive.clone(),
		reason: e.to_string(),
	};
	let mut archive = ZipArchive::new(BufReader::new(File::open(&pair.archive)?)).map_err(unreadable)?;
	let mut entry = archive.by_index(0).map_err(unreadable)?;

	let found = Path::new(entry.name())
		.extension()
		.and_then(|e| e.to_str())
		.unwrap_or("")
		.to_string();
	if !found.eq_ignore_ascii_case(store_extension) {
		return Err(TrialError::InvalidArchiveEntry {
			path: pair.archive.clone(),
			expected: store_extension.to_string(),
			found,
		});
	}

	std::fs::create_dir_all(data_dir)?;
	let target = data_dir.join(format!("{}.{}", pair.stem, store_extension));
	let partial = target.with_extension(format!("{}.partial", store_extension));
	{
		let mut out = BufWriter::new(File::create(&partial)?);
		std::io::copy(&mut entry, &mut out)?;
		let file = out.into_inner().map_err(|e| e.into_error())?;
		file.sync_all()?;
	}
	std::fs::rename(&partial, &target)?;
	set_modified(&target, SystemTime::UNIX_EPOCH)?;
	debug!("extracted {} to {}", pair.archive.display(), target.display());
	Ok(target)
}

/// Stamp the extracted copy with its archive's time once the merge committed.
pub fn mark_merged(extracted: &Path, archive_modified: SystemTime) -> Result<()> {
	set_modified(extracted, archive_modified)
}

fn set_modified(path: &Path, when: SystemTime) -> Result<()> {
	let file = File::options().write(true).open(path)?;
	file.set_modified(when)?;
	Ok(())
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use std::io::Write;
	use std::time::Duration;

	use zip::ZipWriter;
	use zip::write::SimpleFileOptions;

	use super::*;

	const A: &str = "TrialData_0123456789abcdef0123456789abcdef";
	const B: &str = "TrialData_fedcba9876543210fedcba9876543210";

	fn write_zip(path: &Path, entry: &str, body: &[u8]) {
		let mut zip = ZipWriter::new(File::create(path).expect("create"));
		zip.start_file(entry, SimpleFileOptions::default())
			.expect("start");
		zip.write_all(body).expect("write");
		zip.finish().expect("finish");
	}

	#[test]
	fn pattern_requires_exact_shape() {
		let re = file_pattern("TrialData", "zip").expect("regex");
		assert!(re.is_match(&format!("{A}.zip")));
		assert!(!re.is_match("TrialData_123.zip"));
		assert!(!re.is_match(&format!("Other_{}.zip", &A[10..])));
		assert!(!re.is_match(&format!("{A}.db")));
	}

	#[test]
	fn pairs_archives_with_extracted_copies_and_skips_own_archive() {
		let remote = tempfile::tempdir().expect("remote");
		let data = tempfile::tempdir().expect("data");
		write_zip(&remote.path().join(format!("{A}.zip")), &format!("{A}.db"), b"a");
		write_zip(&remote.path().join(format!("{B}.zip")), &format!("{B}.db"), b"b");
		std::fs::write(remote.path().join("notes.txt"), b"ignored").expect("write");
		std::fs::write(data.path().join(format!("{B}.db")), b"old").expect("write");

		let pairs = discover(
			&[remote.path().to_path_buf(), PathBuf::from("/no/such/folder")],
			data.path(),
			"TrialData",
			"db",
			Some(A),
		)
		.expect("discover");
		assert_eq!(pairs.len(), 1);
		assert_eq!(pairs[0].stem, B);
		assert!(pairs[0].extracted.is_some());
	}

	#[test]
	fn extraction_stays_due_until_marked() {
		let remote = tempfile::tempdir().expect("remote");
		let data = tempfile::tempdir().expect("data");
		write_zip(&remote.path().join(format!("{A}.zip")), &format!("{A}.db"), b"store");

		let find = || {
			discover(&[remote.path().to_path_buf()], data.path(), "TrialData", "db", None)
				.expect("discover")
				.remove(0)
		};

		let pair = find();
		assert!(pair.is_due());
		let extracted = extract(&pair, data.path(), "db").expect("extract");
		assert_eq!(std::fs::read(&extracted).expect("read"), b"store");
		assert!(find().is_due());

		mark_merged(&extracted, pair.archive_modified).expect("mark");
		assert!(!find().is_due());

		let mut newer = find();
		newer.archive_modified += Duration::from_secs(60);
		assert!(newer.is_due());
	}

	#[test]
	fn wrong_entry_extension_is_rejected() {
		let remote = tempfile::tempdir().expect("remote");
		let data = tempfile::tempdir().expect("data");
		write_zip(&remote.path().join(format!("{A}.zip")), &format!("{A}.sdf"), b"x");
		let pair = discover(&[remote.path().to_path_buf()], data.path(), "TrialData", "db", None)
			.expect("discover")
			.remove(0);

		let err = extract(&pair, data.path(), "db").expect_err("invalid");
		match err {
			TrialError::InvalidArchiveEntry { expected, found, .. } => {
				assert_eq!(expected, "db");
				assert_eq!(found, "sdf");
			}
			other => panic!("unexpected {other:?}"),
		}
		assert!(!data.path().join(format!("{A}.db")).exists());
	}

	#[test]
	fn corrupt_or_empty_archive_is_unreadable() {
		let remote = tempfile::tempdir().expect("remote");
		let data = tempfile::tempdir().expect("data");
		std::fs::write(remote.path().join(format!("{A}.zip")), b"not a zip").expect("write");
		let empty = ZipWriter::new(File::create(remote.path().join(format!("{B}.zip"))).expect("create"));
		empty.finish().expect("finish");

		let pairs = discover(&[remote.path().to_path_buf()], data.path(), "TrialData", "db", None)
			.expect("discover");
		assert_eq!(pairs.len(), 2);
		for pair in &pairs {
			let err = extract(pair, data.path(), "db").expect_err("unreadable");
			assert!(matches!(err, TrialError::UnreadableArchive { .. }), "{err}");
		}
	}
}
