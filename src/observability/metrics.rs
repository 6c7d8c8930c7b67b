use std::sync::atomic::{AtomicU64, Ordering};

/// Global sync metrics instance
static GLOBAL_SYNC_METRICS: once_cell::sync::Lazy<SyncMetrics> =
	once_cell::sync::Lazy::new(SyncMetrics::default);

/// Get a reference to the global sync metrics
pub fn global_sync_metrics() -> &'static SyncMetrics {
	&GLOBAL_SYNC_METRICS
}

/// Counters for export and merge runs
#[derive(Debug, Default)]
pub struct SyncMetrics {
	pub exports_written: AtomicU64,
	pub exports_skipped: AtomicU64,
	pub archives_merged: AtomicU64,
	pub archives_skipped: AtomicU64,
	pub archives_failed: AtomicU64,
	pub records_upserted: AtomicU64,
	pub change_events: AtomicU64,
}

impl SyncMetrics {
	pub fn incr(counter: &AtomicU64) {
		counter.fetch_add(1, Ordering::Relaxed);
	}

	pub fn add(counter: &AtomicU64, n: u64) {
		counter.fetch_add(n, Ordering::Relaxed);
	}

	/// Generate Prometheus-compatible metrics text
	pub fn to_prometheus_text(&self) -> String {
		let counters: [(&str, &str, &AtomicU64); 7] = [
			("exports_written", "Archives written for other sites", &self.exports_written),
			(
				"exports_skipped",
				"Exports skipped because the archive was already current",
				&self.exports_skipped,
			),
			("archives_merged", "Remote archives merged", &self.archives_merged),
			(
				"archives_skipped",
				"Remote archives not due or skipped for an invalid entry",
				&self.archives_skipped,
			),
			("archives_failed", "Remote archive merges that failed", &self.archives_failed),
			("records_upserted", "Records written by merges", &self.records_upserted),
			("change_events", "Change notifications raised", &self.change_events),
		];

		let mut out = String::new();
		for (name, help, counter) in counters {
			out.push_str(&format!("# HELP trialsync_sync_{}_total {}\n", name, help));
			out.push_str(&format!("# TYPE trialsync_sync_{}_total counter\n", name));
			out.push_str(&format!(
				"trialsync_sync_{}_total {}\n",
				name,
				counter.load(Ordering::Relaxed)
			));
		}
		out
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn test_sync_metrics_default() {
		let metrics = SyncMetrics::default();
		assert_eq!(metrics.archives_merged.load(Ordering::Relaxed), 0);
		assert_eq!(metrics.records_upserted.load(Ordering::Relaxed), 0);
	}

	#[test]
	fn test_sync_metrics_prometheus_text() {
		let metrics = SyncMetrics::default();
		metrics.archives_merged.store(5, Ordering::Relaxed);
		SyncMetrics::add(&metrics.records_upserted, 100);
		SyncMetrics::incr(&metrics.records_upserted);

		let text = metrics.to_prometheus_text();
		assert!(text.contains("trialsync_sync_archives_merged_total 5"));
		assert!(text.contains("trialsync_sync_records_upserted_total 101"));
		assert!(text.contains("# TYPE trialsync_sync_change_events_total counter"));
	}
}
