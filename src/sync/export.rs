//! Writing this site's store as an exchange archive.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info};
use rusqlite::Connection;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::error::Result;
use crate::model::{RecordKind, Site};
use crate::store::tables;

/// `<store>_<identity hex>`, shared by an archive and the store file inside it.
pub fn archive_stem(store_name: &str, site: &Site) -> String {
	format!("{}_{}", store_name, site.token())
}

pub fn archive_path(dir: &Path, store_name: &str, site: &Site) -> PathBuf {
	dir.join(format!("{}.zip", archive_stem(store_name, site)))
}

pub fn modified_at(path: &Path) -> Result<DateTime<Utc>> {
	Ok(DateTime::<Utc>::from(std::fs::metadata(path)?.modified()?))
}

/// Newest `last_modified` across every record kind.
pub fn newest_modification(conn: &Connection) -> Result<Option<DateTime<Utc>>> {
	let mut newest = None;
	for kind in RecordKind::ALL {
		newest = newest.max(tables::newest_modification(conn, kind)?);
	}
	Ok(newest)
}

/// An archive is current when it exists and is strictly newer than every
/// record in the store. An empty store never needs re-exporting over an
/// existing archive.
pub fn needs_export(archive: &Path, newest: Option<DateTime<Utc>>) -> Result<bool> {
	if !archive.exists() {
		return Ok(true);
	}
	let Some(newest) = newest else {
		return Ok(false);
	};
	let archived = modified_at(archive)?;
	debug!(
		"archive {} modified {}, newest record {}",
		archive.display(),
		archived,
		newest
	);
	Ok(archived <= newest)
}

/// Zip `store_file` into `archive` as a single entry named `entry_name`.
/// The archive is built beside the target and renamed into place, so
/// readers of the shared folder never see a partial file.
pub fn write_archive(store_file: &Path, archive: &Path, entry_name: &str) -> Result<()> {
	if let Some(parent) = archive.parent() {
		std::fs::create_dir_all(parent)?;
	}
	let partial = archive.with_extension("zip.partial");
	{
		let mut zip = ZipWriter::new(BufWriter::new(File::create(&partial)?));
		let options =
			SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
		zip.start_file(entry_name, options)?;
		let mut source = BufReader::new(File::open(store_file)?);
		std::io::copy(&mut source, &mut zip)?;
		let file = zip.finish()?.into_inner().map_err(|e| e.into_error())?;
		file.sync_all()?;
	}
	std::fs::rename(&partial, archive)?;
	info!("wrote archive {}", archive.display());
	Ok(())
}
