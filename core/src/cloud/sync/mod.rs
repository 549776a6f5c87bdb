//! Cloud synchronization of the snapshot repository.
//!
//! Three entry points: `sync` (bidirectional three-way merge), `sync_download`
//! (pull with coarse conflict flagging) and `sync_upload` (optimistic push).
//! Every entry point serializes on the repository operation lock, takes the
//! remote lease for its duration and releases it on all exit paths.

pub mod diff;
pub mod document;
pub mod ignore;
mod latest;
mod merge;
mod repair;
pub(crate) mod transfer;

use std::{
	collections::HashSet,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex,
	},
};

use chrono::{DateTime, Utc};
use tokio::task::spawn_blocking;
use tracing::{error, info, warn};

use crate::{
	cloud::{CloudError, CloudRepoInfo, CloudStat, Traffic},
	domain::{Chunk, FileManifest, Hash, Index},
	error::{Error, Result},
	event::SyncEvent,
	util::remove_empty_dirs,
	worktree, Repo,
};

use diff::{diff_upsert_remove, get_file};

/// Outcome of a merge: what was written, what was removed, what conflicted.
/// Upserts and removes have been applied to the working tree; conflicts were
/// copied aside and are surfaced to the caller.
#[derive(Debug, Clone)]
pub struct MergeResult {
	pub time: DateTime<Utc>,
	pub upserts: Vec<FileManifest>,
	pub removes: Vec<FileManifest>,
	pub conflicts: Vec<FileManifest>,
}

impl MergeResult {
	pub(crate) fn new() -> Self {
		Self {
			time: Utc::now(),
			upserts: Vec::new(),
			removes: Vec::new(),
			conflicts: Vec::new(),
		}
	}

	pub fn data_changed(&self) -> bool {
		!self.upserts.is_empty() || !self.removes.is_empty() || !self.conflicts.is_empty()
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadTrafficStat {
	pub download_file_count: usize,
	pub download_chunk_count: usize,
	pub download_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadTrafficStat {
	pub upload_file_count: usize,
	pub upload_chunk_count: usize,
	pub upload_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApiTrafficStat {
	pub api_get: usize,
	pub api_put: usize,
}

/// Byte, object and API call counters for one sync operation. Shared across
/// concurrent branches behind a mutex while the operation runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStat {
	pub download: DownloadTrafficStat,
	pub upload: UploadTrafficStat,
	pub api: ApiTrafficStat,
}

impl TrafficStat {
	fn to_traffic(self) -> Traffic {
		Traffic {
			upload_bytes: self.upload.upload_bytes,
			download_bytes: self.download.download_bytes,
			api_get: self.api.api_get as u64,
			api_put: self.api.api_put as u64,
		}
	}
}

pub(crate) type SharedTraffic = Arc<Mutex<TrafficStat>>;

/// Deduplicated chunk ids of `files`, in order of first appearance.
pub(crate) fn collect_chunks(files: &[FileManifest]) -> Vec<Hash> {
	let mut seen = HashSet::new();
	let mut chunk_ids = Vec::new();
	for file in files {
		for chunk in &file.chunks {
			if seen.insert(chunk.clone()) {
				chunk_ids.push(chunk.clone());
			}
		}
	}
	chunk_ids
}

impl Repo {
	/// Bidirectional synchronization with the remote repository.
	pub async fn sync(&self) -> Result<(MergeResult, TrafficStat)> {
		let _guard = self.op_lock.lock().await;

		// Hold the remote lease so no other device uploads concurrently.
		self.try_lock_cloud(&self.device.id).await?;
		let result = self.sync_inner().await;
		self.unlock_cloud().await;

		result.map_err(|e| {
			let e = e.promote_repo_fatal();
			if matches!(e, Error::RepoFatal) {
				error!("sync failed: local object referenced by an index is gone");
			}
			e
		})
	}

	async fn sync_inner(&self) -> Result<(MergeResult, TrafficStat)> {
		let mut merge_result = MergeResult::new();
		let traffic: SharedTraffic = Arc::default();

		let latest = self.latest()?;
		let (bytes, cloud_latest) = self.download_cloud_latest().await?;
		{
			let mut stat = traffic.lock().unwrap();
			stat.download.download_file_count += 1;
			stat.download.download_bytes += bytes;
			stat.api.api_get += 1;
		}

		if cloud_latest.id == latest.id {
			// Nothing moved on either side.
			let stat = *traffic.lock().unwrap();
			return Ok((merge_result, stat));
		}

		let available = self.cloud.get_available_size();
		if available <= cloud_latest.size || available <= latest.size {
			return Err(Error::CloudStorageSizeExceeded);
		}

		let fetch_file_ids = self.local_not_found_files(&cloud_latest.files).await?;
		let (bytes, fetched_files) = self.download_cloud_files_put(&fetch_file_ids).await?;
		{
			let mut stat = traffic.lock().unwrap();
			stat.download.download_bytes += bytes;
			stat.download.download_file_count += fetch_file_ids.len();
			stat.api.api_get += fetch_file_ids.len();
		}

		self.sync0(fetched_files, &cloud_latest, &latest, &mut merge_result, &traffic)
			.await?;

		let stat = *traffic.lock().unwrap();
		Ok((merge_result, stat))
	}

	/// One-way pull. Local changes never reach the remote; any local upsert
	/// the merge overrides or removes is flagged as a conflict and its local
	/// version is preserved in history.
	pub async fn sync_download(&self) -> Result<(MergeResult, TrafficStat)> {
		let _guard = self.op_lock.lock().await;

		self.try_lock_cloud(&self.device.id).await?;
		let result = self.sync_download_inner().await;
		self.unlock_cloud().await;
		result
	}

	async fn sync_download_inner(&self) -> Result<(MergeResult, TrafficStat)> {
		let mut merge_result = MergeResult::new();
		let traffic: SharedTraffic = Arc::default();

		let latest = self.latest()?;
		let (bytes, cloud_latest) = self.download_cloud_latest().await?;
		{
			let mut stat = traffic.lock().unwrap();
			stat.download.download_file_count += 1;
			stat.download.download_bytes += bytes;
			stat.api.api_get += 1;
		}

		if cloud_latest.id == latest.id || cloud_latest.is_empty() {
			let stat = *traffic.lock().unwrap();
			return Ok((merge_result, stat));
		}

		let fetch_file_ids = self.local_not_found_files(&cloud_latest.files).await?;
		let (bytes, fetched_files) = self.download_cloud_files_put(&fetch_file_ids).await?;
		{
			let mut stat = traffic.lock().unwrap();
			stat.download.download_bytes += bytes;
			stat.download.download_file_count += fetch_file_ids.len();
			stat.api.api_get += fetch_file_ids.len();
		}

		let cloud_latest_files = self.get_files(&cloud_latest.files).await?;
		let cloud_chunk_ids = collect_chunks(&cloud_latest_files);

		let fetch_chunk_ids = self.local_not_found_chunks(&cloud_chunk_ids).await?;
		let bytes = self.download_cloud_chunks_put(&fetch_chunk_ids).await?;
		{
			let mut stat = traffic.lock().unwrap();
			stat.download.download_bytes += bytes;
			stat.download.download_chunk_count += fetch_chunk_ids.len();
			stat.api.api_get += fetch_chunk_ids.len();
		}

		let latest_files = self.get_files(&latest.files).await?;
		let latest_sync = self.latest_sync();
		let latest_sync_files = self.get_files(&latest_sync.files).await?;
		let (local_upserts, local_removes) =
			diff_upsert_remove(&latest_files, &latest_sync_files, false);
		let local_changed = !local_upserts.is_empty() || !local_removes.is_empty();

		// One-way pull: the cloud diff against local IS the merge result.
		let (upserts, removes) = diff_upsert_remove(&cloud_latest_files, &latest_files, false);
		merge_result.upserts = upserts.into_iter().cloned().collect();
		merge_result.removes = removes.into_iter().cloned().collect();

		// Coarse conflict rule: any local upsert the pull is about to
		// override or delete, with the cloud side winning in the tree.
		let merge_upserts: Vec<&FileManifest> = merge_result.upserts.iter().collect();
		let merge_removes: Vec<&FileManifest> = merge_result.removes.iter().collect();
		for local_upsert in &local_upserts {
			if get_file(&merge_upserts, local_upsert).is_some()
				|| get_file(&merge_removes, local_upsert).is_some()
			{
				merge_result.conflicts.push((*local_upsert).clone());
				info!(
					"sync download conflict [{}, {}, {}]",
					local_upsert.id,
					local_upsert.path,
					crate::util::format_millis(local_upsert.updated)
				);
			}
		}

		if !merge_result.conflicts.is_empty() {
			let now_str = merge_result.time.format("%Y-%m-%d-%H%M%S").to_string();
			let conflicts = merge_result.conflicts.clone();
			self.generate_conflict_history(&conflicts, &now_str).await?;
		}

		if let Err(e) = self.restore_files(&merge_result).await {
			error!("restore files failed: {e}");
		}

		self.merge_sync(
			&merge_result,
			local_changed,
			false,
			&latest,
			&cloud_latest,
			&cloud_chunk_ids,
			&traffic,
		)
		.await?;

		self.report_traffic(&traffic);
		self.prune_empty_dirs().await;

		let stat = *traffic.lock().unwrap();
		Ok((merge_result, stat))
	}

	/// One-way push: upload every local file the remote lacks plus all of
	/// their chunks (optimistically, without asking the remote chunk by
	/// chunk), then publish.
	pub async fn sync_upload(&self) -> Result<TrafficStat> {
		let _guard = self.op_lock.lock().await;

		self.try_lock_cloud(&self.device.id).await?;
		let result = self.sync_upload_inner().await;
		self.unlock_cloud().await;
		result
	}

	async fn sync_upload_inner(&self) -> Result<TrafficStat> {
		let traffic: SharedTraffic = Arc::default();

		let latest = self.latest()?;
		let (bytes, cloud_latest) = self.download_cloud_latest().await?;
		{
			let mut stat = traffic.lock().unwrap();
			stat.download.download_file_count += 1;
			stat.download.download_bytes += bytes;
			stat.api.api_get += 1;
		}

		if cloud_latest.id == latest.id {
			let stat = *traffic.lock().unwrap();
			return Ok(stat);
		}

		let available = self.cloud.get_available_size();
		if available <= cloud_latest.size || available <= latest.size {
			return Err(Error::CloudStorageSizeExceeded);
		}

		let cloud_file_ids: HashSet<&Hash> = cloud_latest.files.iter().collect();
		let upload_file_ids: Vec<Hash> = latest
			.files
			.iter()
			.filter(|id| !cloud_file_ids.contains(id))
			.cloned()
			.collect();
		let upload_files = self.get_files(&upload_file_ids).await?;
		let upload_chunk_ids = collect_chunks(&upload_files);

		let bytes = self.upload_chunks(&upload_chunk_ids).await?;
		{
			let mut stat = traffic.lock().unwrap();
			stat.upload.upload_chunk_count += upload_chunk_ids.len();
			stat.upload.upload_bytes += bytes;
			stat.api.api_put += upload_chunk_ids.len();
		}

		let bytes = self.upload_files(&upload_files).await?;
		{
			let mut stat = traffic.lock().unwrap();
			stat.upload.upload_file_count += upload_files.len();
			stat.upload.upload_bytes += bytes;
			stat.api.api_put += upload_files.len();
		}

		let mut latest = latest;
		self.update_cloud_indexes(&mut latest, &traffic).await?;
		self.update_latest_sync(&latest)?;

		self.report_traffic(&traffic);

		let stat = *traffic.lock().unwrap();
		Ok(stat)
	}

	/// The authoritative remote snapshot; the empty index when the remote
	/// has never been published to.
	pub async fn get_cloud_latest(&self) -> Result<Index> {
		let _guard = self.op_lock.lock().await;
		let (_, cloud_latest) = self.download_cloud_latest().await?;
		Ok(cloud_latest)
	}

	/// Fetches the file manifests of `cloud_latest` that the local store
	/// lacks, without merging anything.
	pub async fn get_sync_cloud_files(&self, cloud_latest: &Index) -> Result<Vec<FileManifest>> {
		let _guard = self.op_lock.lock().await;

		let latest = self.latest()?;
		if cloud_latest.id == latest.id {
			return Ok(Vec::new());
		}

		let available = self.cloud.get_available_size();
		if available <= cloud_latest.size || available <= latest.size {
			return Err(Error::CloudStorageSizeExceeded);
		}

		let fetch_file_ids = self.local_not_found_files(&cloud_latest.files).await?;
		let (bytes, fetched_files) = self.download_cloud_files_put(&fetch_file_ids).await?;

		let mut stat = TrafficStat::default();
		stat.download.download_bytes = bytes;
		stat.download.download_file_count = fetch_file_ids.len();
		stat.api.api_get = fetch_file_ids.len();
		let cloud = self.cloud.clone();
		tokio::spawn(async move {
			cloud.add_traffic(stat.to_traffic()).await;
		});

		Ok(fetched_files)
	}

	/// Downloads whatever chunks `files` still need and checks the files out
	/// into the working tree.
	pub async fn checkout_files_from_cloud(
		&self,
		files: &[FileManifest],
	) -> Result<DownloadTrafficStat> {
		let mut stat = DownloadTrafficStat::default();

		let chunk_ids = collect_chunks(files);
		let chunk_ids = self.local_not_found_chunks(&chunk_ids).await?;
		stat.download_bytes = self.download_cloud_chunks_put(&chunk_ids).await?;
		stat.download_chunk_count = chunk_ids.len();

		let store = self.store.clone();
		let data_path = self.data_path.clone();
		let files = files.to_vec();
		spawn_blocking(move || worktree::checkout_files(&store, &data_path, &files)).await??;
		Ok(stat)
	}

	pub async fn create_cloud_repo(&self, name: &str) -> Result<()> {
		let _guard = self.op_lock.lock().await;

		self.try_lock_cloud("create").await?;
		let result = self.cloud.create_repo(name).await;
		self.unlock_cloud().await;
		Ok(result?)
	}

	pub async fn remove_cloud_repo(&self, name: &str) -> Result<()> {
		let _guard = self.op_lock.lock().await;

		self.try_lock_cloud("remove").await?;
		let result = self.cloud.remove_repo(name).await;
		self.unlock_cloud().await;
		Ok(result?)
	}

	pub async fn get_cloud_repos(&self) -> Result<(Vec<CloudRepoInfo>, i64)> {
		Ok(self.cloud.get_repos().await?)
	}

	pub fn get_cloud_available_size(&self) -> i64 {
		self.cloud.get_available_size()
	}

	pub async fn get_cloud_repo_stat(&self) -> Result<CloudStat> {
		Ok(self.cloud.get_stat().await?)
	}

	// Lease handling. Acquisition failure surfaces `CloudLocked` without any
	// further remote traffic; release is attempted on every exit path and
	// only ever logged.

	pub(crate) async fn try_lock_cloud(&self, owner: &str) -> Result<()> {
		match self.cloud.lock(owner).await {
			Ok(()) => Ok(()),
			Err(CloudError::Locked { owner }) => Err(Error::CloudLocked { owner }),
			Err(e) => Err(e.into()),
		}
	}

	pub(crate) async fn unlock_cloud(&self) {
		if let Err(e) = self.cloud.unlock().await {
			warn!("unlock cloud failed: {e}");
		}
	}

	pub(crate) fn report_traffic(&self, traffic: &SharedTraffic) {
		let stat = *traffic.lock().unwrap();
		let cloud = self.cloud.clone();
		tokio::spawn(async move {
			cloud.add_traffic(stat.to_traffic()).await;
		});
	}

	// Transfer helpers: all of them fan out through the bounded pool and
	// fail fast on the first error.

	pub(crate) async fn download_cloud_chunks_put(&self, chunk_ids: &[Hash]) -> Result<u64> {
		if chunk_ids.is_empty() {
			return Ok(0);
		}

		let total = chunk_ids.len();
		self.events.publish(SyncEvent::BeforeDownloadChunks(total));

		let bytes = Arc::new(AtomicU64::new(0));
		transfer::run(
			chunk_ids.to_vec(),
			self.cloud.get_concurrent_reqs(),
			|id: Hash, seq, total| {
				let cloud = self.cloud.clone();
				let store = self.store.clone();
				let events = self.events.clone();
				let bytes = bytes.clone();
				async move {
					events.publish(SyncEvent::BeforeDownloadChunk { seq, total });
					let raw = cloud.download_object(&id.object_key()).await?;
					// Codec and disk work stay off the async workers.
					let len = spawn_blocking(move || -> Result<u64> {
						let data = store.decode_object_data(&raw)?;
						let len = data.len() as u64;
						store.put_chunk(&Chunk { id, data })?;
						Ok(len)
					})
					.await??;
					bytes.fetch_add(len, Ordering::Relaxed);
					Ok(())
				}
			},
		)
		.await?;

		Ok(bytes.load(Ordering::Relaxed))
	}

	pub(crate) async fn download_cloud_files_put(
		&self,
		file_ids: &[Hash],
	) -> Result<(u64, Vec<FileManifest>)> {
		if file_ids.is_empty() {
			return Ok((0, Vec::new()));
		}

		let total = file_ids.len();
		self.events.publish(SyncEvent::BeforeDownloadFiles(total));

		let bytes = Arc::new(AtomicU64::new(0));
		let fetched = Arc::new(Mutex::new(Vec::with_capacity(total)));
		transfer::run(
			file_ids.to_vec(),
			self.cloud.get_concurrent_reqs(),
			|id: Hash, seq, total| {
				let cloud = self.cloud.clone();
				let store = self.store.clone();
				let events = self.events.clone();
				let bytes = bytes.clone();
				let fetched = fetched.clone();
				async move {
					events.publish(SyncEvent::BeforeDownloadFile { seq, total });
					let raw = cloud.download_object(&id.object_key()).await?;
					let (len, file) = spawn_blocking(move || -> Result<(u64, FileManifest)> {
						let data = store.decode_object_data(&raw)?;
						let file: FileManifest = serde_json::from_slice(&data)?;
						store.put_file(&file)?;
						Ok((data.len() as u64, file))
					})
					.await??;
					bytes.fetch_add(len, Ordering::Relaxed);
					fetched.lock().unwrap().push(file);
					Ok(())
				}
			},
		)
		.await?;

		let fetched = std::mem::take(&mut *fetched.lock().unwrap());
		Ok((bytes.load(Ordering::Relaxed), fetched))
	}

	pub(crate) async fn upload_chunks(&self, chunk_ids: &[Hash]) -> Result<u64> {
		if chunk_ids.is_empty() {
			return Ok(0);
		}

		let total = chunk_ids.len();
		self.events.publish(SyncEvent::BeforeUploadChunks(total));

		let bytes = Arc::new(AtomicU64::new(0));
		transfer::run(
			chunk_ids.to_vec(),
			self.cloud.get_concurrent_reqs(),
			|id: Hash, seq, total| {
				let cloud = self.cloud.clone();
				let events = self.events.clone();
				let bytes = bytes.clone();
				async move {
					events.publish(SyncEvent::BeforeUploadChunk { seq, total });
					let sent = cloud.upload_object(&id.object_key(), false).await?;
					bytes.fetch_add(sent, Ordering::Relaxed);
					Ok(())
				}
			},
		)
		.await?;

		Ok(bytes.load(Ordering::Relaxed))
	}

	pub(crate) async fn upload_files(&self, files: &[FileManifest]) -> Result<u64> {
		if files.is_empty() {
			return Ok(0);
		}

		let total = files.len();
		self.events.publish(SyncEvent::BeforeUploadFiles(total));

		let bytes = Arc::new(AtomicU64::new(0));
		let ids: Vec<Hash> = files.iter().map(|f| f.id.clone()).collect();
		transfer::run(
			ids,
			self.cloud.get_concurrent_reqs(),
			|id: Hash, seq, total| {
				let cloud = self.cloud.clone();
				let events = self.events.clone();
				let bytes = bytes.clone();
				async move {
					events.publish(SyncEvent::BeforeUploadFile { seq, total });
					let sent = cloud.upload_object(&id.object_key(), false).await?;
					bytes.fetch_add(sent, Ordering::Relaxed);
					Ok(())
				}
			},
		)
		.await?;

		Ok(bytes.load(Ordering::Relaxed))
	}

	/// Uploads the local files and chunks the remote lacks: chunks first so
	/// a published file never references data the remote does not hold yet.
	pub(crate) async fn upload_cloud(
		&self,
		latest: &Index,
		cloud_latest: &Index,
		cloud_chunk_ids: &[Hash],
		traffic: &SharedTraffic,
	) -> Result<()> {
		let cloud_file_ids: HashSet<&Hash> = cloud_latest.files.iter().collect();
		let upsert_file_ids: Vec<Hash> = latest
			.files
			.iter()
			.filter(|id| !cloud_file_ids.contains(id))
			.cloned()
			.collect();
		let upsert_files = self.get_files(&upsert_file_ids).await?;
		if upsert_files.is_empty() {
			return Ok(());
		}

		let cloud_chunks: HashSet<&Hash> = cloud_chunk_ids.iter().collect();
		let upsert_chunk_ids: Vec<Hash> = collect_chunks(&upsert_files)
			.into_iter()
			.filter(|id| !cloud_chunks.contains(id))
			.collect();

		let bytes = self.upload_chunks(&upsert_chunk_ids).await?;
		{
			let mut stat = traffic.lock().unwrap();
			stat.upload.upload_chunk_count += upsert_chunk_ids.len();
			stat.upload.upload_bytes += bytes;
			stat.api.api_put += upsert_chunk_ids.len();
		}

		let bytes = self.upload_files(&upsert_files).await?;
		{
			let mut stat = traffic.lock().unwrap();
			stat.upload.upload_file_count += upsert_files.len();
			stat.upload.upload_bytes += bytes;
			stat.api.api_put += upsert_files.len();
		}

		Ok(())
	}

	// Local store interrogation. The store is synchronous; every scan over it
	// runs on the blocking pool so the async workers stay responsive.

	/// Resolves manifests for `ids`; an id no store object backs is reported
	/// as the missing object it is.
	pub(crate) async fn get_files(&self, ids: &[Hash]) -> Result<Vec<FileManifest>> {
		let store = self.store.clone();
		let ids = ids.to_vec();
		spawn_blocking(move || -> Result<Vec<FileManifest>> {
			ids.iter()
				.map(|id| {
					store.get_file(id).map_err(|e| {
						if e.is_not_found() {
							Error::NotFoundObject(id.clone())
						} else {
							e.into()
						}
					})
				})
				.collect()
		})
		.await?
	}

	pub(crate) async fn local_not_found_files(&self, file_ids: &[Hash]) -> Result<Vec<Hash>> {
		self.local_not_found(file_ids).await
	}

	pub(crate) async fn local_not_found_chunks(&self, chunk_ids: &[Hash]) -> Result<Vec<Hash>> {
		self.local_not_found(chunk_ids).await
	}

	async fn local_not_found(&self, ids: &[Hash]) -> Result<Vec<Hash>> {
		let store = self.store.clone();
		let ids = ids.to_vec();
		spawn_blocking(move || -> Result<Vec<Hash>> {
			let mut seen = HashSet::new();
			let mut missing = Vec::new();
			for id in ids {
				match store.stat(&id) {
					Ok(_) => {}
					Err(e) if e.is_not_found() => {
						if seen.insert(id.clone()) {
							missing.push(id);
						}
					}
					Err(e) => return Err(e.into()),
				}
			}
			Ok(missing)
		})
		.await?
	}

	/// Empty-directory pruning walks the whole data root; run it off-loop and
	/// only log if the task dies.
	pub(crate) async fn prune_empty_dirs(&self) {
		let data_path = self.data_path.clone();
		let excludes = self.config.prune_excludes.clone();
		if let Err(e) = spawn_blocking(move || remove_empty_dirs(&data_path, &excludes)).await {
			error!("prune empty dirs task failed: {e}");
		}
	}
}
