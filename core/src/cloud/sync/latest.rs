//! The `refs/latest` pointer protocol.
//!
//! Publication order is load-bearing: the index body must be remote before
//! the pointer flips, and only then is the seq-numbered freshness marker
//! written. Reading masks CDN staleness of the cacheable pointer by
//! cross-checking the highest seq marker and keeping whichever index is
//! younger.

use tokio::task::spawn_blocking;
use tracing::{error, info, warn};

use crate::{
	cloud::{keys, parse_seq_ref},
	domain::{CheckIndex, CheckIndexFile, Hash, Index, IndexesList, PublishedIndex},
	error::Result,
	event::SyncEvent,
	util::{write_file_safer, FileIOError},
	Repo,
};

use super::SharedTraffic;

impl Repo {
	/// Resolves the authoritative remote snapshot. A missing or malformed
	/// pointer is a soft miss yielding the empty index. Returns the index
	/// body size alongside, for traffic accounting.
	pub(crate) async fn download_cloud_latest(&self) -> Result<(u64, Index)> {
		self.events
			.publish(SyncEvent::BeforeDownloadRef(keys::REF_LATEST.to_string()));

		let raw = match self.cloud.download_object(keys::REF_LATEST).await {
			Ok(raw) => raw,
			Err(e) if e.is_not_found() => {
				warn!("cloud latest ref not found, treating remote as empty");
				return Ok((0, Index::default()));
			}
			Err(e) => return Err(e.into()),
		};

		let Some(latest_id) = Hash::parse(&String::from_utf8_lossy(&raw)) else {
			warn!("cloud latest ref payload is malformed, treating remote as empty");
			return Ok((0, Index::default()));
		};

		let uses_seq_refs = self.cloud.kind().uses_seq_refs();
		let (downloaded, seq) = tokio::join!(self.download_cloud_index(&latest_id), async {
			if uses_seq_refs {
				self.seq_num_latest().await.0
			} else {
				None
			}
		});
		let (mut bytes, mut index) = downloaded?;

		if let Some(seq_id) = seq {
			if seq_id != latest_id && !index.is_empty() {
				warn!("cloud latest [{latest_id}] does not match seq marker [{seq_id}]");
				match self.download_cloud_index(&seq_id).await {
					Ok((seq_bytes, seq_index)) if seq_index.created > index.created => {
						warn!(
							"using seq marker index {} instead of cloud latest {}",
							seq_index.brief(),
							index.brief(),
						);
						bytes = seq_bytes;
						index = seq_index;
					}
					Ok(_) => {
						warn!("keeping cloud latest [{latest_id}] over older seq marker");
					}
					Err(e) => warn!("download seq marker index [{seq_id}] failed: {e}"),
				}
			}
		}

		info!("got cloud latest {}", index.brief());
		Ok((bytes, index))
	}

	pub(crate) async fn download_cloud_index(&self, id: &Hash) -> Result<(u64, Index)> {
		self.events
			.publish(SyncEvent::BeforeDownloadIndex(id.to_string()));

		let raw = self.cloud.download_object(&keys::index(id)).await?;
		let store = self.store.clone();
		spawn_blocking(move || -> Result<(u64, Index)> {
			let data = store.decompress_index_data(&raw)?;
			let index: Index = serde_json::from_slice(&data)?;
			Ok((data.len() as u64, index))
		})
		.await?
	}

	/// Scans `refs/latest-*` markers: the id under the highest seq, that seq,
	/// and every marker key seen. Malformed markers are deleted
	/// opportunistically; listing failures degrade to an empty answer.
	pub(crate) async fn seq_num_latest(&self) -> (Option<Hash>, u64, Vec<String>) {
		let refs = match self.cloud.list_objects(keys::REFS_PREFIX).await {
			Ok(refs) => refs,
			Err(e) => {
				error!("list refs failed: {e}");
				return (None, 0, Vec::new());
			}
		};

		let mut max_seq = 0;
		let mut id = None;
		let mut markers = Vec::new();
		for object in refs {
			if !object.path.starts_with("latest-") {
				continue;
			}
			let key = format!("{}{}", keys::REFS_PREFIX, object.path);
			let Some((seq, marker_id)) = parse_seq_ref(&object.path) else {
				let _ = self.cloud.remove_object(&key).await;
				continue;
			};
			if seq > max_seq {
				max_seq = seq;
				id = Some(marker_id);
			}
			markers.push(key);
		}
		(id, max_seq, markers)
	}

	/// Publishes `latest` to the remote: check index first locally, then the
	/// index/pointer chain, the index list, the check index and the
	/// opportunistic repair, concurrently.
	pub(crate) async fn update_cloud_indexes(
		&self,
		latest: &mut Index,
		traffic: &SharedTraffic,
	) -> Result<()> {
		let files = self.get_files(&latest.files).await?;

		let mut check_index = CheckIndex {
			id: Hash::random(),
			index_id: latest.id.clone(),
			files: Vec::with_capacity(files.len()),
		};
		for file in files {
			check_index.files.push(CheckIndexFile {
				id: file.id,
				chunks: file.chunks,
			});
		}

		// The local write precedes every remote write so the remote never
		// references a check index that does not exist yet.
		latest.check_index_id = check_index.id.clone();
		self.put_index_blocking(latest).await?;

		let (pointer, list, check, ()) = tokio::join!(
			self.publish_pointer_chain(latest, traffic),
			self.update_cloud_indexes_v2(latest, traffic),
			self.update_cloud_check_index(&check_index),
			self.upload_cloud_missing_objects(traffic),
		);
		pointer?;
		list?;
		check?;
		Ok(())
	}

	/// Branch 1 of publication, in strict order: index body, `refs/latest`,
	/// then the new seq marker; older markers are deleted in the background.
	async fn publish_pointer_chain(&self, latest: &Index, traffic: &SharedTraffic) -> Result<()> {
		let bytes = self.upload_index(latest).await?;
		{
			let mut stat = traffic.lock().unwrap();
			stat.upload.upload_file_count += 1;
			stat.upload.upload_bytes += bytes;
			stat.api.api_put += 1;
		}

		let bytes = self.update_cloud_ref(keys::REF_LATEST).await?;
		{
			let mut stat = traffic.lock().unwrap();
			stat.upload.upload_file_count += 1;
			stat.upload.upload_bytes += bytes;
			stat.api.api_put += 1;
		}

		if self.cloud.kind().uses_seq_refs() {
			let (_, max_seq, old_markers) = self.seq_num_latest().await;
			let key = keys::seq_ref(max_seq + 1, &latest.id);
			self.cloud
				.upload_bytes(&key, latest.id.to_string().into_bytes(), true)
				.await?;

			let cloud = self.cloud.clone();
			tokio::spawn(async move {
				for marker in old_markers {
					if let Err(e) = cloud.remove_object(&marker).await {
						warn!("delete cloud [{marker}] failed: {e}");
					}
				}
			});
		}

		Ok(())
	}

	async fn upload_index(&self, index: &Index) -> Result<u64> {
		self.events
			.publish(SyncEvent::BeforeUploadIndex(index.id.to_string()));
		let bytes = self
			.cloud
			.upload_object(&keys::index(&index.id), false)
			.await?;
		info!("uploaded index {}", index.brief());
		Ok(bytes)
	}

	pub(crate) async fn update_cloud_ref(&self, name: &str) -> Result<u64> {
		self.events
			.publish(SyncEvent::BeforeUploadRef(name.to_string()));

		let path = self.repo_path.join(name);
		let payload =
			std::fs::read(&path).map_err(|e| FileIOError::from((path.as_path(), e)))?;

		let bytes = self.cloud.upload_object(name, true).await?;
		info!(
			"uploaded cloud ref [{name}, id={}]",
			String::from_utf8_lossy(&payload).trim()
		);
		Ok(bytes)
	}

	/// Merges `latest` into `indexes-v2.json`: newest first, deduplicated by
	/// id, untouched when the id is already listed.
	async fn update_cloud_indexes_v2(&self, latest: &Index, traffic: &SharedTraffic) -> Result<()> {
		self.events.publish(SyncEvent::BeforeUploadIndexes);

		let mut list = IndexesList::default();
		let mut download_bytes = 0;
		match self.cloud.download_object(keys::INDEXES_V2).await {
			Ok(raw) => {
				download_bytes = raw.len() as u64;
				let store = self.store.clone();
				// A corrupt list is rebuilt from scratch; a failing codec is
				// a real error.
				let parsed = spawn_blocking(
					move || -> Result<std::result::Result<IndexesList, serde_json::Error>> {
						let data = store.decompress_index_data(&raw)?;
						Ok(serde_json::from_slice(&data))
					},
				)
				.await??;
				match parsed {
					Ok(parsed) => list = parsed,
					Err(e) => warn!("unmarshal cloud indexes-v2.json failed: {e}"),
				}
			}
			Err(e) if e.is_not_found() => {}
			Err(e) => return Err(e.into()),
		}

		let mut seen = std::collections::HashSet::new();
		let mut deduped = Vec::with_capacity(list.indexes.len());
		let mut found = false;
		for entry in list.indexes {
			if entry.id == latest.id {
				found = true;
			}
			if seen.insert(entry.id.clone()) {
				deduped.push(entry);
			}
		}
		if found {
			let mut stat = traffic.lock().unwrap();
			stat.download.download_file_count += 1;
			stat.download.download_bytes += download_bytes;
			stat.api.api_get += 1;
			return Ok(());
		}

		let mut list = IndexesList { indexes: deduped };
		list.indexes.insert(0, PublishedIndex::from(latest));

		let store = self.store.clone();
		let local_copy = self.repo_path.join(keys::INDEXES_V2);
		spawn_blocking(move || -> Result<()> {
			let data = serde_json::to_vec(&list)?;
			let encoded = store.compress_index_data(&data)?;
			write_file_safer(&local_copy, &encoded)?;
			Ok(())
		})
		.await??;

		let upload_bytes = self.cloud.upload_object(keys::INDEXES_V2, true).await?;

		let mut stat = traffic.lock().unwrap();
		stat.download.download_file_count += 1;
		stat.download.download_bytes += download_bytes;
		stat.upload.upload_file_count += 1;
		stat.upload.upload_bytes += upload_bytes;
		stat.api.api_get += 1;
		stat.api.api_put += 1;
		Ok(())
	}

	/// The managed service audits published snapshots against this parallel
	/// manifest; other backends skip it.
	async fn update_cloud_check_index(&self, check_index: &CheckIndex) -> Result<()> {
		if !self.cloud.kind().uses_check_index() {
			return Ok(());
		}

		self.events.publish(SyncEvent::BeforeUploadCheckIndex);

		let key = keys::check_index(&check_index.id);
		let store = self.store.clone();
		let local_copy = self.repo_path.join(&key);
		let check_index = check_index.clone();
		spawn_blocking(move || -> Result<()> {
			let data = serde_json::to_vec(&check_index)?;
			let encoded = store.compress_index_data(&data)?;
			write_file_safer(&local_copy, &encoded)?;
			Ok(())
		})
		.await??;

		self.cloud.upload_object(&key, false).await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_seq_marker_key_parses_back() {
		let id = Hash::of(b"snapshot");
		let key = keys::seq_ref(7, &id);
		let name = key.strip_prefix(keys::REFS_PREFIX).unwrap();
		assert_eq!(parse_seq_ref(name), Some((7, id)));
	}
}
