//! Working-tree indexer: rescans the data root into a new snapshot. Files
//! are cut into fixed-size chunks, chunks and manifests land in the local
//! store, and the resulting index records the manifests in path order.

use std::{fs, path::Path, time::UNIX_EPOCH};

use walkdir::WalkDir;

use crate::{
	domain::{Chunk, DeviceInfo, FileManifest, Hash, Index},
	error::Result,
	store::LocalStore,
	util::{now_millis, FileIOError},
};

const CHUNK_SIZE: usize = 1024 * 1024;

pub(crate) fn index_tree(
	store: &LocalStore,
	data_path: &Path,
	device: &DeviceInfo,
	parent: &Hash,
	memo: &str,
) -> Result<Index> {
	let mut entries = Vec::new();
	for entry in WalkDir::new(data_path).follow_links(false) {
		let entry = entry.map_err(|e| {
			let path = e
				.path()
				.map(Path::to_path_buf)
				.unwrap_or_else(|| data_path.to_path_buf());
			let source = e
				.into_io_error()
				.unwrap_or_else(|| std::io::Error::other("walk failed"));
			FileIOError::from((path.as_path(), source))
		})?;
		if !entry.file_type().is_file() {
			continue;
		}

		let rel = entry
			.path()
			.strip_prefix(data_path)
			.expect("walkdir yields children of the data root")
			.to_string_lossy()
			.replace('\\', "/");
		entries.push((format!("/{rel}"), entry.into_path()));
	}
	entries.sort();

	let mut file_ids = Vec::with_capacity(entries.len());
	let mut total_size = 0;
	for (rel, abs) in entries {
		let manifest = index_file(store, &rel, &abs)?;
		total_size += manifest.size;
		file_ids.push(manifest.id.clone());
		store.put_file(&manifest)?;
	}

	let index = Index::new(
		parent.clone(),
		memo.to_string(),
		now_millis(),
		file_ids,
		total_size,
		device,
	);
	store.put_index(&index)?;
	Ok(index)
}

fn index_file(store: &LocalStore, rel: &str, abs: &Path) -> Result<FileManifest> {
	let data = fs::read(abs).map_err(|e| FileIOError::from((abs, e)))?;
	let meta = fs::metadata(abs).map_err(|e| FileIOError::from((abs, e)))?;
	let updated = meta
		.modified()
		.ok()
		.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
		.map(|d| d.as_millis() as i64)
		.unwrap_or_else(now_millis);

	let mut chunk_ids = Vec::new();
	for piece in data.chunks(CHUNK_SIZE.max(1)) {
		let chunk = Chunk::new(piece.to_vec());
		store.put_chunk(&chunk)?;
		chunk_ids.push(chunk.id);
	}

	Ok(FileManifest::new(
		rel.to_string(),
		data.len() as i64,
		updated,
		chunk_ids,
	))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_index_tree_orders_by_path_and_sums_size() {
		let repo = tempfile::tempdir().unwrap();
		let data = tempfile::tempdir().unwrap();
		let store = LocalStore::new(repo.path());
		let device = DeviceInfo::new("dev", "test", "linux");

		fs::create_dir_all(data.path().join("b")).unwrap();
		fs::write(data.path().join("b/two.txt"), b"22").unwrap();
		fs::write(data.path().join("one.txt"), b"1").unwrap();

		let index = index_tree(&store, data.path(), &device, &Hash::default(), "").unwrap();
		assert_eq!(index.files.len(), 2);
		assert_eq!(index.size, 3);

		let paths: Vec<String> = index
			.files
			.iter()
			.map(|id| store.get_file(id).unwrap().path)
			.collect();
		assert_eq!(paths, vec!["/b/two.txt", "/one.txt"]);
	}

	#[test]
	fn test_reindex_without_changes_is_stable() {
		let repo = tempfile::tempdir().unwrap();
		let data = tempfile::tempdir().unwrap();
		let store = LocalStore::new(repo.path());
		let device = DeviceInfo::new("dev", "test", "linux");
		fs::write(data.path().join("a.txt"), b"same").unwrap();

		let first = index_tree(&store, data.path(), &device, &Hash::default(), "").unwrap();
		let second = index_tree(&store, data.path(), &device, &Hash::default(), "").unwrap();
		assert_eq!(first.files, second.files);
	}

	#[test]
	fn test_empty_file_has_no_chunks() {
		let repo = tempfile::tempdir().unwrap();
		let data = tempfile::tempdir().unwrap();
		let store = LocalStore::new(repo.path());
		fs::write(data.path().join("empty"), b"").unwrap();

		let index = index_tree(
			&store,
			data.path(),
			&DeviceInfo::new("d", "n", "o"),
			&Hash::default(),
			"",
		)
		.unwrap();
		let manifest = store.get_file(&index.files[0]).unwrap();
		assert!(manifest.chunks.is_empty());
		assert_eq!(manifest.size, 0);
	}
}
