//! Pointer-protocol and publication behaviors: seq-marker recovery, index
//! list maintenance, the integrity repair pass and the progress event
//! stream.

mod common;

use common::{device, paired_device};
use vellum_core::{
	store::codec, CheckReport, Hash, IndexesList, SyncEvent,
};

#[tokio::test]
async fn test_indexes_v2_lists_newest_first_without_duplicates() {
	let dev = device("device-a");
	dev.write("/a.txt", b"v1");
	dev.repo.index("first").unwrap();
	dev.repo.sync().await.unwrap();
	let first_id = dev.repo.latest().unwrap().id;

	dev.write("/a.txt", b"v2");
	dev.repo.index("second").unwrap();
	dev.repo.sync().await.unwrap();
	let second_id = dev.repo.latest().unwrap().id;

	let raw = dev.cloud.object("indexes-v2.json").unwrap();
	let list: IndexesList =
		serde_json::from_slice(&codec::decompress(&raw).unwrap()).unwrap();

	assert_eq!(list.indexes[0].id, second_id);
	assert!(list.indexes.iter().any(|entry| entry.id == first_id));

	let mut ids: Vec<&Hash> = list.indexes.iter().map(|entry| &entry.id).collect();
	ids.sort();
	ids.dedup();
	assert_eq!(ids.len(), list.indexes.len(), "duplicate ids in index list");
}

#[tokio::test]
async fn test_seq_marker_is_published_and_old_markers_cleaned() {
	let dev = device("device-a");
	dev.write("/a.txt", b"v1");
	dev.repo.index("first").unwrap();
	dev.repo.sync().await.unwrap();
	let latest = dev.repo.latest().unwrap();

	let markers: Vec<String> = dev
		.cloud
		.object_keys()
		.into_iter()
		.filter(|key| key.starts_with("refs/latest-") && key != "refs/latest-sync")
		.collect();
	assert_eq!(markers, vec![format!("refs/latest-1-{}", latest.id)]);

	// The marker payload is the bare snapshot id.
	let payload = dev.cloud.object(&markers[0]).unwrap();
	assert_eq!(String::from_utf8(payload).unwrap(), latest.id.to_string());
}

#[tokio::test]
async fn test_stale_cached_pointer_is_masked_by_seq_marker() {
	let dev = device("device-a");
	dev.write("/a.txt", b"v1");
	dev.repo.index("first").unwrap();
	dev.repo.sync().await.unwrap();
	let old_id = dev.repo.latest().unwrap().id;

	// Creation timestamps must differ for the recovery to pick a winner.
	tokio::time::sleep(std::time::Duration::from_millis(10)).await;

	dev.write("/a.txt", b"v2");
	dev.repo.index("second").unwrap();
	dev.repo.sync().await.unwrap();
	let new_id = dev.repo.latest().unwrap().id;

	// Simulate a CDN serving the stale cacheable pointer.
	dev.cloud
		.insert_object("refs/latest", old_id.to_string().into_bytes());

	let resolved = dev.repo.get_cloud_latest().await.unwrap();
	assert_eq!(resolved.id, new_id);
}

#[tokio::test]
async fn test_malformed_seq_markers_are_deleted_on_read() {
	let dev = device("device-a");
	dev.write("/a.txt", b"v1");
	dev.repo.index("first").unwrap();
	dev.repo.sync().await.unwrap();

	dev.cloud
		.insert_object("refs/latest-garbage", b"junk".to_vec());

	dev.repo.get_cloud_latest().await.unwrap();
	assert!(dev.cloud.object("refs/latest-garbage").is_none());
}

#[tokio::test]
async fn test_missing_object_repair_reuploads_local_objects() {
	let dev = device("device-a");
	dev.write("/a.txt", b"will go missing remotely");
	let local = dev.repo.index("first").unwrap();
	dev.repo.sync().await.unwrap();

	// The audit reports one data object missing; drop it remotely too.
	let file = dev.repo.store().get_file(&local.files[0]).unwrap();
	let lost_chunk = file.chunks[0].clone();
	dev.cloud.remove_key(&lost_chunk.object_key());
	let report = CheckReport {
		missing_objects: vec![lost_chunk.clone()],
		fix_count: 0,
	};
	dev.cloud.insert_object(
		"check/indexes-report",
		codec::compress(&serde_json::to_vec(&report).unwrap()).unwrap(),
	);

	// The repair already ran once on this instance (it is one-shot); a new
	// process over the same repository gets a fresh attempt.
	let (objects, lock) = dev.cloud.shared();
	let cloud = std::sync::Arc::new(vellum_core::testing::MemoryCloud::connect(
		dev.root.path().join("repo"),
		objects,
		lock,
	));
	let reopened = vellum_core::Repo::open(
		dev.root.path().join("repo"),
		dev.root.path().join("data"),
		dev.root.path().join("temp"),
		dev.root.path().join("history"),
		vellum_core::DeviceInfo::new("device-a", "device-a", "linux"),
		cloud.clone(),
		vellum_core::SyncConfig::default(),
	)
	.unwrap();

	// The next publication runs the repair opportunistically.
	dev.write("/b.txt", b"second snapshot");
	reopened.index("second").unwrap();
	reopened.sync().await.unwrap();

	assert!(dev.cloud.object(&lost_chunk.object_key()).is_some());

	let raw = dev.cloud.object("check/indexes-report").unwrap();
	let rewritten: CheckReport =
		serde_json::from_slice(&codec::decompress(&raw).unwrap()).unwrap();
	assert_eq!(rewritten.fix_count, 1);
	assert!(rewritten.missing_objects.is_empty());
}

#[tokio::test]
async fn test_check_index_is_published_for_managed_backend() {
	let dev = device("device-a");
	dev.write("/a.txt", b"payload");
	dev.repo.index("first").unwrap();
	dev.repo.sync().await.unwrap();

	let latest = dev.repo.latest().unwrap();
	assert!(!latest.check_index_id.is_empty());

	let key = format!("check/indexes/{}", latest.check_index_id);
	let raw = dev.cloud.object(&key).expect("check index uploaded");
	let check: vellum_core::CheckIndex =
		serde_json::from_slice(&codec::decompress(&raw).unwrap()).unwrap();
	assert_eq!(check.index_id, latest.id);
	assert_eq!(check.files.len(), latest.files.len());
}

#[tokio::test]
async fn test_progress_events_are_emitted_during_pull() {
	let first = device("device-a");
	first.write("/a.txt", b"alpha");
	first.repo.index("first").unwrap();
	first.repo.sync().await.unwrap();

	let second = paired_device("device-b", &first);
	let mut events = second.repo.subscribe();
	second.repo.sync_download().await.unwrap();

	let mut saw_ref = false;
	let mut saw_files = false;
	let mut saw_chunk = false;
	while let Ok(event) = events.try_recv() {
		match event {
			SyncEvent::BeforeDownloadRef(_) => saw_ref = true,
			SyncEvent::BeforeDownloadFiles(_) => saw_files = true,
			SyncEvent::BeforeDownloadChunk { .. } => saw_chunk = true,
			_ => {}
		}
	}
	assert!(saw_ref && saw_files && saw_chunk);
}
