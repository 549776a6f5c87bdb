//! The three-way merge over local latest, remote latest and the last sync
//! point, plus the follow-up that captures conflict history, applies the
//! result to the working tree and decides what gets published.

use std::{
	collections::{HashMap, HashSet},
	fs,
	path::Path,
	time::Instant,
};

use tokio::task::spawn_blocking;
use tracing::{error, info, warn};

use crate::{
	cloud::sync::{
		diff::{diff_upsert_remove, get_file},
		document::{only_fold_changed, parse_tree, DocNode},
		ignore::IgnoreMatcher,
		MergeResult, SharedTraffic,
	},
	domain::{FileManifest, Hash, Index},
	error::{Error, Result},
	indexer,
	store::LocalStore,
	util::{format_millis, FileIOError},
	worktree,
	Repo,
};

impl Repo {
	/// Core of the bidirectional sync, entered once both transfer branches
	/// have drained: diff, resolve, apply, merge, publish.
	pub(crate) async fn sync0(
		&self,
		fetched_files: Vec<FileManifest>,
		cloud_latest: &Index,
		latest: &Index,
		merge_result: &mut MergeResult,
		traffic: &SharedTraffic,
	) -> Result<()> {
		let cloud_latest_files = self.get_files(&cloud_latest.files).await?;
		let cloud_chunk_ids = super::collect_chunks(&cloud_latest_files);

		let (downloaded, uploaded) = tokio::join!(
			async {
				let fetch_chunk_ids = self.local_not_found_chunks(&cloud_chunk_ids).await?;
				let bytes = self.download_cloud_chunks_put(&fetch_chunk_ids).await?;
				let mut stat = traffic.lock().unwrap();
				stat.download.download_bytes += bytes;
				stat.download.download_chunk_count += fetch_chunk_ids.len();
				stat.api.api_get += fetch_chunk_ids.len();
				Ok::<(), Error>(())
			},
			self.upload_cloud(latest, cloud_latest, &cloud_chunk_ids, traffic),
		);
		downloaded?;
		uploaded?;

		let latest_files = self.get_files(&latest.files).await?;
		info!(
			"got local latest [{}] files [{}]",
			latest.id,
			latest_files.len()
		);
		let latest_sync = self.latest_sync();
		let latest_sync_files = self.get_files(&latest_sync.files).await?;

		let (local_upserts, local_removes) =
			diff_upsert_remove(&latest_files, &latest_sync_files, false);

		let latest_file_map: HashMap<&str, &FileManifest> =
			latest_files.iter().map(|f| (f.path.as_str(), f)).collect();

		let (cloud_upserts, cloud_removes) = if !cloud_latest.is_empty() {
			diff_upsert_remove(&cloud_latest_files, &latest_files, true)
		} else {
			(Vec::new(), Vec::new())
		};

		for file in &cloud_upserts {
			info!(
				"cloud upsert [{}, {}, {}]",
				file.id,
				file.path,
				format_millis(file.updated)
			);
		}
		for file in &cloud_removes {
			info!(
				"cloud remove [{}, {}, {}]",
				file.id,
				file.path,
				format_millis(file.updated)
			);
		}
		for file in &local_upserts {
			info!(
				"local upsert [{}, {}, {}]",
				file.id,
				file.path,
				format_millis(file.updated)
			);
		}
		for file in &local_removes {
			info!(
				"local remove [{}, {}, {}]",
				file.id,
				file.path,
				format_millis(file.updated)
			);
		}

		let local_upserts = self.filter_local_upserts(local_upserts, &cloud_upserts);
		let local_changed = !local_upserts.is_empty() || !local_removes.is_empty();

		let local_upsert_ignore = local_upserts
			.iter()
			.any(|file| file.path == self.config.syncignore_path);

		let fetched_file_ids: HashSet<&Hash> = fetched_files.iter().map(|f| &f.id).collect();

		let now_str = merge_result.time.format("%Y-%m-%d-%H%M%S").to_string();

		// Conflicting files lean toward the local upserts and removes; the
		// cloud version of every tentative conflict is preserved in history
		// regardless of how it resolves.
		let mut tentative_conflicts: Vec<FileManifest> = Vec::new();
		let mut cloud_upsert_ignore: Option<&FileManifest> = None;
		for cloud_upsert in &cloud_upserts {
			if cloud_upsert.path == self.config.syncignore_path {
				cloud_upsert_ignore = Some(*cloud_upsert);
			}

			if let Some(local_upsert) = get_file(&local_upserts, cloud_upsert) {
				tentative_conflicts.push((*cloud_upsert).clone());

				if fetched_file_ids.contains(&cloud_upsert.id) {
					if self
						.ignore_local_upsert(local_upsert, &latest_sync_files, &now_str)
						.await
					{
						// A fold-only local change is not worth a conflict.
						merge_result.upserts.push((*cloud_upsert).clone());
						info!(
							"sync merge upsert [{}, {}, {}]",
							cloud_upsert.id,
							cloud_upsert.path,
							format_millis(cloud_upsert.updated)
						);
						continue;
					}

					merge_result.conflicts.push((*cloud_upsert).clone());
					info!(
						"sync merge conflict [{}, {}, {}]",
						cloud_upsert.id,
						cloud_upsert.path,
						format_millis(cloud_upsert.updated)
					);
				}
				continue;
			}

			if get_file(&local_removes, cloud_upsert).is_none() {
				if cloud_upsert.path.ends_with(".tmp") {
					warn!("ignored tmp file [{}]", cloud_upsert.path);
					continue;
				}

				let skew = self.config.conflict_skew_millis();
				let cloud_upsert_too_old = latest_file_map
					.get(cloud_upsert.path.as_str())
					.is_some_and(|local| local.updated > cloud_upsert.updated + skew);
				if cloud_upsert_too_old {
					warn!(
						"ignored cloud upsert [{}, {}, {}] because local file is newer",
						cloud_upsert.id,
						cloud_upsert.path,
						format_millis(cloud_upsert.updated)
					);
					continue;
				}

				merge_result.upserts.push((*cloud_upsert).clone());
				info!(
					"sync merge upsert [{}, {}, {}]",
					cloud_upsert.id,
					cloud_upsert.path,
					format_millis(cloud_upsert.updated)
				);
			}
		}

		// Local upserts suppress remote removes.
		for cloud_remove in &cloud_removes {
			if get_file(&local_upserts, cloud_remove).is_none() {
				merge_result.removes.push((*cloud_remove).clone());
			}
		}

		// A remotely-updated syncignore is honored immediately so the merge
		// cannot delete paths the fresh rules protect.
		let mut ignore_matcher = IgnoreMatcher::empty();
		if let Some(cloud_ignore) = cloud_upsert_ignore {
			let co_dir = if local_upsert_ignore {
				self.temp_path.join("repo/sync/ignore")
			} else {
				self.data_path.clone()
			};
			let store = self.store.clone();
			let cloud_ignore = cloud_ignore.clone();
			ignore_matcher = spawn_blocking(move || -> Result<IgnoreMatcher> {
				let abs = worktree::checkout_file(&store, &co_dir, &cloud_ignore)
					.map_err(|e| {
						error!("checkout ignore file failed: {e}");
						e
					})?;
				let content = fs::read_to_string(&abs)
					.map_err(|e| Error::FileIO(FileIOError::from((abs.as_path(), e))))?;
				IgnoreMatcher::compile(&content)
			})
			.await??;
		}
		merge_result
			.removes
			.retain(|file| !ignore_matcher.matches(&file.path));

		if !tentative_conflicts.is_empty() {
			self.generate_conflict_history(&tentative_conflicts, &now_str)
				.await?;
		}

		// Not transactional; a failed checkout is logged and the next sync
		// repairs the tree.
		if let Err(e) = self.restore_files(merge_result).await {
			error!("restore files failed: {e}");
		}

		self.merge_sync(merge_result, local_changed, true, latest, cloud_latest, &cloud_chunk_ids, traffic)
			.await?;

		self.report_traffic(traffic);
		self.prune_empty_dirs().await;
		Ok(())
	}

	/// Drops local upserts that are older than the concurrent cloud upsert
	/// of the same path by more than the skew window; stale local writes
	/// must not clobber newer cloud data.
	pub(crate) fn filter_local_upserts<'a>(
		&self,
		local_upserts: Vec<&'a FileManifest>,
		cloud_upserts: &[&FileManifest],
	) -> Vec<&'a FileManifest> {
		let cloud_by_path: HashMap<&str, &FileManifest> = cloud_upserts
			.iter()
			.map(|f| (f.path.as_str(), *f))
			.collect();
		let skew = self.config.conflict_skew_millis();

		local_upserts
			.into_iter()
			.filter(|local| {
				let Some(cloud) = cloud_by_path.get(local.path.as_str()) else {
					return true;
				};
				if local.updated < cloud.updated - skew {
					warn!(
						"ignored local upsert [{}, {}, {}] because it is older than cloud upsert [{}, {}, {}]",
						local.id,
						local.path,
						format_millis(local.updated),
						cloud.id,
						cloud.path,
						format_millis(cloud.updated)
					);
					return false;
				}
				true
			})
			.collect()
	}

	/// Whether a local upsert of a structured document only changed fold
	/// state relative to the sync base. Any failure along the way simply
	/// means "not equivalent".
	pub(crate) async fn ignore_local_upsert(
		&self,
		local_upsert: &FileManifest,
		latest_sync_files: &[FileManifest],
		now: &str,
	) -> bool {
		if !local_upsert.path.ends_with(&self.config.doc_suffix) {
			return false; // only structured documents get content comparison
		}

		let sync_refs: Vec<&FileManifest> = latest_sync_files.iter().collect();
		let Some(base) = get_file(&sync_refs, local_upsert) else {
			return false; // the upsert is a brand-new file
		};

		let store = self.store.clone();
		let temp = self.temp_path.join("repo/sync/resolves").join(now);
		let local_upsert = local_upsert.clone();
		let base = base.clone();
		spawn_blocking(move || {
			let Ok(local_tree) = checkout_tree(&store, &local_upsert, &temp.join("local"))
			else {
				return false;
			};
			let Ok(base_tree) = checkout_tree(&store, &base, &temp.join("base")) else {
				return false;
			};
			only_fold_changed(&local_tree, &base_tree)
		})
		.await
		.unwrap_or(false)
	}

	/// Checks out the remote version of every tentative conflict and copies
	/// it under `history/<timestamp>-sync/`. Loss of this copy would lose
	/// the only remaining route to the data, so failure is fatal for the
	/// sync.
	pub(crate) async fn generate_conflict_history(
		&self,
		conflicts: &[FileManifest],
		now: &str,
	) -> Result<()> {
		let store = self.store.clone();
		let temp = self.temp_path.join("repo/sync/conflicts").join(now);
		let history_path = self.history_path.clone();
		let conflicts = conflicts.to_vec();
		let now = now.to_string();
		spawn_blocking(move || {
			for file in &conflicts {
				let manifest = store.get_file(&file.id)?;
				let abs = worktree::checkout_file(&store, &temp, &manifest)?;
				if let Err(e) = worktree::gen_sync_history(&history_path, &now, &file.path, &abs)
				{
					error!("generate sync history failed: {e}");
					return Err(Error::GenerateConflictHistory);
				}
			}
			Ok(())
		})
		.await?
	}

	pub(crate) async fn restore_files(&self, merge_result: &MergeResult) -> Result<()> {
		let store = self.store.clone();
		let data_path = self.data_path.clone();
		let upserts = merge_result.upserts.clone();
		let removes = merge_result.removes.clone();
		spawn_blocking(move || {
			worktree::checkout_files(&store, &data_path, &upserts)?;
			worktree::remove_files(&data_path, &removes)
		})
		.await?
	}

	/// Decides the new local latest after a merge and pushes it out.
	///
	/// Both sides changed: re-index the freshly patched tree into a merge
	/// snapshot. Only the cloud changed: adopt the cloud index wholesale.
	/// Publication happens when local changes must reach the cloud or the
	/// remote is brand new.
	pub(crate) async fn merge_sync(
		&self,
		merge_result: &MergeResult,
		local_changed: bool,
		need_sync_cloud: bool,
		latest: &Index,
		cloud_latest: &Index,
		cloud_chunk_ids: &[Hash],
		traffic: &SharedTraffic,
	) -> Result<Index> {
		let mut latest = latest.clone();

		if merge_result.data_changed() {
			if local_changed {
				info!("creating merge index [{}]", latest.id);
				let merge_start = Instant::now();

				// Re-scanning the tree walks and hashes every file; that
				// work belongs on the blocking pool.
				let store = self.store.clone();
				let data_path = self.data_path.clone();
				let device = self.device.clone();
				let parent = latest.id.clone();
				let mut merged = spawn_blocking(move || {
					indexer::index_tree(
						&store,
						&data_path,
						&device,
						&parent,
						"[Sync] Cloud sync merge",
					)
				})
				.await?
				.map_err(|e| {
					error!("merge index failed: {e}");
					e
				})?;

				merged.memo = format!(
					"[Sync] Cloud sync merge, completed in {:.2}s",
					merge_start.elapsed().as_secs_f64()
				);
				self.put_index_blocking(&merged).await?;
				// The local ref must point at the merge snapshot before
				// publication, which uploads the ref file verbatim.
				self.update_latest(&merged)?;
				info!("created merge index {}", merged.brief());
				latest = merged;

				if need_sync_cloud {
					self.upload_cloud(&latest, cloud_latest, cloud_chunk_ids, traffic)
						.await
						.map_err(|e| {
							error!("upload cloud failed: {e}");
							e
						})?;
				}
			} else {
				latest = cloud_latest.clone();
			}
		}

		if (local_changed && need_sync_cloud) || cloud_latest.is_empty() {
			self.update_cloud_indexes(&mut latest, traffic).await?;
		}

		self.update_latest(&latest)?;
		self.put_index_blocking(&latest).await?;
		self.update_latest_sync(&latest)?;
		Ok(latest)
	}

	pub(crate) async fn put_index_blocking(&self, index: &Index) -> Result<()> {
		let store = self.store.clone();
		let index = index.clone();
		spawn_blocking(move || store.put_index(&index)).await??;
		Ok(())
	}
}

fn checkout_tree(store: &LocalStore, file: &FileManifest, dir: &Path) -> Result<DocNode> {
	let manifest = store.get_file(&file.id)?;
	let abs = worktree::checkout_file(store, dir, &manifest)?;
	let data = fs::read(&abs).map_err(|e| FileIOError::from((abs.as_path(), e)))?;
	parse_tree(&data)
}
