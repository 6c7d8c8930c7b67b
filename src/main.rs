use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use trialsync::model::SiteDraft;
use trialsync::observability::init_logging;
use trialsync::{ExportOutcome, Repository, config};

#[derive(Parser)]
#[command(
	name = "trialsync",
	about = "Trialsync - multi-site trial store with shared-folder sync"
)]
struct Cli {
	/// Extra configuration file layered over the defaults
	#[arg(long, global = true, env = "TRIALSYNC_CONFIG")]
	config: Option<PathBuf>,
	#[command(subcommand)]
	command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
	/// Add or update sites from a JSON array of site definitions
	Provision {
		/// JSON file holding the sites
		file: PathBuf,
	},
	/// List the sites known to the local store
	Sites,
	/// Write this site's archive to the export folder if it is out of date
	Export,
	/// Merge every due archive found in the shared folders
	Merge,
	/// Export, then merge (default)
	Sync,
	/// Copy the store limited to the given sites
	ExportSites {
		#[arg(long)]
		dir: PathBuf,
		/// Site id; repeat for several sites
		#[arg(long = "site", required = true)]
		sites: Vec<i64>,
	},
	/// List the sites held in each extracted remote store
	RemoteSites,
	/// Print enrolment and screening totals and sync counters
	Summary,
}

fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	let settings = config::load_with(cli.config.as_deref()).context("failed to load configuration")?;

	init_logging(settings.log_level, settings.log_file.as_deref())?;

	let mut repo = Repository::open(settings).context("failed to open the local store")?;

	match cli.command.unwrap_or(Commands::Sync) {
		Commands::Provision { file } => {
			let text = std::fs::read_to_string(&file)
				.with_context(|| format!("reading {}", file.display()))?;
			let drafts: Vec<SiteDraft> = serde_json::from_str(&text)?;
			for site in repo.provision_sites(drafts)? {
				println!("{}\t{}-{}\t{}\t{}", site.id, site.id, site.max_id, site.token(), site.name);
			}
		}
		Commands::Sites => {
			let local = repo.local_site().ok().map(|s| s.id);
			for site in repo.sites() {
				let marker = if Some(site.id) == local { "*" } else { " " };
				println!(
					"{}{}\t{}-{}\t{}\t{}",
					marker,
					site.id,
					site.id,
					site.max_id,
					site.token(),
					site.name
				);
			}
		}
		Commands::Export => print_export(repo.export()?),
		Commands::Merge => {
			let report = repo.synchronise()?;
			println!("{}", serde_json::to_string_pretty(&report)?);
		}
		Commands::Sync => {
			print_export(repo.export()?);
			let report = repo.synchronise()?;
			println!("{}", serde_json::to_string_pretty(&report)?);
		}
		Commands::ExportSites { dir, sites } => {
			let path = repo.export_sites(&dir, &sites)?;
			println!("{}", path.display());
		}
		Commands::RemoteSites => {
			for store in repo.remote_site_listing()? {
				println!("{}", store.path.display());
				for site in store.sites {
					println!("\t{}\t{}-{}\t{}", site.id, site.id, site.max_id, site.name);
				}
			}
		}
		Commands::Summary => {
			let participants = repo.participant_summary()?;
			let screened = repo.screened_summary()?;
			println!(
				"{}",
				serde_json::to_string_pretty(&serde_json::json!({
					"participants": participants,
					"screened": screened,
				}))?
			);
			print!("{}", repo.metrics_text());
		}
	}

	repo.close()?;
	info!("done");
	Ok(())
}

fn print_export(outcome: ExportOutcome) {
	match outcome {
		ExportOutcome::Written(path) => println!("exported {}", path.display()),
		ExportOutcome::AlreadyCurrent(path) => println!("{} is current", path.display()),
	}
}
