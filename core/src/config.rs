use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables of the sync engine. The defaults reproduce the shipped behavior;
/// hosts override fields selectively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
	/// Concurrent divergences within this window on the same path are treated
	/// as genuine conflicts; outside it the newer side wins outright.
	pub conflict_skew: Duration,

	/// Suffix of structured-document files eligible for block-level conflict
	/// resolution.
	pub doc_suffix: String,

	/// Tree path of the sync-ignore rule blob.
	pub syncignore_path: String,

	/// Directory names never pruned when removing empty directories from the
	/// data root.
	pub prune_excludes: Vec<String>,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			conflict_skew: Duration::from_secs(7 * 60),
			doc_suffix: ".vd".to_string(),
			syncignore_path: "/.vellum/syncignore".to_string(),
			prune_excludes: vec![".vellum".to_string()],
		}
	}
}

impl SyncConfig {
	pub(crate) fn conflict_skew_millis(&self) -> i64 {
		self.conflict_skew.as_millis() as i64
	}
}
