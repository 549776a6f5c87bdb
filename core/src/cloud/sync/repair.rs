//! Reconciliation of the server-side integrity report: objects the audit
//! found missing are re-uploaded when the local store still has them. Runs
//! opportunistically during publication, at most once per repository
//! instance.

use std::{
	collections::HashSet,
	sync::{atomic::Ordering, Arc, Mutex},
};

use tokio::task::spawn_blocking;
use tracing::{error, info, warn};

use crate::{
	cloud::keys,
	domain::{CheckReport, Hash},
	event::SyncEvent,
	util::write_file_safer,
	Repo,
};

use super::{transfer, SharedTraffic};

impl Repo {
	/// Never fails the surrounding publication; every problem is logged and
	/// abandoned until a later sync retries.
	pub(crate) async fn upload_cloud_missing_objects(&self, traffic: &SharedTraffic) {
		if self.fixed_missing_objects.swap(true, Ordering::SeqCst) {
			return;
		}
		if !self.cloud.kind().uses_check_index() {
			return;
		}

		self.fix_missing_objects(traffic).await;
		self.events.publish(SyncEvent::AfterFixObjects);
	}

	async fn fix_missing_objects(&self, traffic: &SharedTraffic) {
		let raw = match self.cloud.download_object(keys::CHECK_REPORT).await {
			Ok(raw) => raw,
			Err(e) if e.is_not_found() => return,
			Err(e) => {
				error!("download check report failed: {e}");
				return;
			}
		};
		{
			let mut stat = traffic.lock().unwrap();
			stat.download.download_file_count += 1;
			stat.download.download_bytes += raw.len() as u64;
			stat.api.api_get += 1;
		}

		let store = self.store.clone();
		let decoded = spawn_blocking(move || -> crate::error::Result<CheckReport> {
			let data = store.decompress_index_data(&raw)?;
			Ok(serde_json::from_slice(&data)?)
		})
		.await;
		let mut report = match decoded {
			Ok(Ok(report)) => report,
			Ok(Err(e)) => {
				error!("decode check report failed: {e}");
				return;
			}
			Err(e) => {
				error!("decode check report task failed: {e}");
				return;
			}
		};
		if report.missing_objects.is_empty() {
			return;
		}

		let mut still_missing: HashSet<Hash> = HashSet::new();
		let mut uploadable = Vec::new();
		for missing in &report.missing_objects {
			info!("cloud missing object [{missing}]");
			still_missing.insert(missing.clone());

			let path = self.repo_path.join(missing.object_key());
			let meta = match std::fs::metadata(&path) {
				Ok(meta) => meta,
				Err(e) => {
					warn!("cloud missing object [{missing}] not found locally: {e}");
					continue;
				}
			};

			{
				let mut stat = traffic.lock().unwrap();
				stat.upload.upload_file_count += 1;
				stat.upload.upload_bytes += meta.len();
			}
			if !uploadable.contains(missing) {
				uploadable.push(missing.clone());
			}
		}

		let total = uploadable.len();
		let still_missing = Arc::new(Mutex::new(still_missing));
		let uploaded = transfer::run(
			uploadable,
			self.cloud.get_concurrent_reqs(),
			|id: Hash, seq, _| {
				let cloud = self.cloud.clone();
				let events = self.events.clone();
				let still_missing = still_missing.clone();
				async move {
					events.publish(SyncEvent::BeforeFixObjects { seq, total });
					let key = id.object_key();
					cloud.upload_object(&key, false).await?;
					still_missing.lock().unwrap().remove(&id);
					info!("uploaded cloud missing object [{key}]");
					Ok(())
				}
			},
		)
		.await;
		if let Err(e) = uploaded {
			warn!("upload cloud missing objects failed: {e}");
			return;
		}

		report.fix_count += 1;
		report.missing_objects = {
			let mut rest: Vec<Hash> = still_missing.lock().unwrap().iter().cloned().collect();
			rest.sort();
			rest
		};

		if report.missing_objects.is_empty() {
			info!("cloud missing objects fixed");
		} else {
			self.events.publish(SyncEvent::CloudCorrupted);
			warn!(
				"cloud still missing objects [{}]",
				report.missing_objects.len()
			);
		}

		let store = self.store.clone();
		let local_copy = self.repo_path.join(keys::CHECK_REPORT);
		let report_to_write = report.clone();
		let written = spawn_blocking(move || -> crate::error::Result<()> {
			let data = serde_json::to_vec(&report_to_write)?;
			let encoded = store.compress_index_data(&data)?;
			write_file_safer(&local_copy, &encoded)?;
			Ok(())
		})
		.await;
		match written {
			Ok(Ok(())) => {}
			Ok(Err(e)) => {
				error!("write check report failed: {e}");
				return;
			}
			Err(e) => {
				error!("write check report task failed: {e}");
				return;
			}
		}
		if let Err(e) = self.cloud.upload_object(keys::CHECK_REPORT, true).await {
			error!("upload check report failed: {e}");
		}
	}
}
