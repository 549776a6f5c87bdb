//! Materialization of file manifests into the working tree, and removal of
//! files the merge decided against. Checkout is deliberately not
//! transactional; callers log failures and the next sync repairs the tree.

use std::{
	fs,
	path::{Path, PathBuf},
	time::{Duration, UNIX_EPOCH},
};

use tracing::warn;

use crate::{
	domain::FileManifest,
	error::{Error, Result},
	store::LocalStore,
	util::{copy_file, join_rel, FileIOError},
};

/// Assembles `file` from its chunks and writes it under `root`, restoring the
/// recorded mtime. Returns the absolute path written.
pub(crate) fn checkout_file(
	store: &LocalStore,
	root: &Path,
	file: &FileManifest,
) -> Result<PathBuf> {
	let dest = join_rel(root, &file.path);
	if let Some(parent) = dest.parent() {
		fs::create_dir_all(parent).map_err(|e| FileIOError::from((parent, e)))?;
	}

	let mut data = Vec::with_capacity(file.size.max(0) as usize);
	for chunk_id in &file.chunks {
		let chunk = store.get_chunk(chunk_id)?;
		data.extend_from_slice(&chunk.data);
	}
	fs::write(&dest, &data).map_err(|e| FileIOError::from((dest.as_path(), e)))?;

	if file.updated > 0 {
		let mtime = UNIX_EPOCH + Duration::from_millis(file.updated as u64);
		let handle = fs::File::options()
			.write(true)
			.open(&dest)
			.map_err(|e| FileIOError::from((dest.as_path(), e)))?;
		if let Err(e) = handle.set_modified(mtime) {
			warn!("failed to restore mtime of {}: {e}", dest.display());
		}
	}

	Ok(dest)
}

pub(crate) fn checkout_files(
	store: &LocalStore,
	root: &Path,
	files: &[FileManifest],
) -> Result<()> {
	for file in files {
		checkout_file(store, root, file)?;
	}
	Ok(())
}

/// Removes merged-away files from the working tree. Already-absent paths are
/// fine.
pub(crate) fn remove_files(root: &Path, files: &[FileManifest]) -> Result<()> {
	for file in files {
		let path = join_rel(root, &file.path);
		match fs::remove_file(&path) {
			Ok(()) => {}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
			Err(e) => return Err(Error::FileIO(FileIOError::from((path.as_path(), e)))),
		}
	}
	Ok(())
}

/// Copies a checked-out conflict version into
/// `<history>/<timestamp>-sync/<original path>`.
pub(crate) fn gen_sync_history(
	history_path: &Path,
	now: &str,
	rel_path: &str,
	abs_path: &Path,
) -> Result<()> {
	let history_dir = history_path.join(format!("{now}-sync"));
	fs::create_dir_all(&history_dir).map_err(|e| FileIOError::from((history_dir.as_path(), e)))?;
	copy_file(abs_path, &join_rel(&history_dir, rel_path))?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::domain::Chunk;

	#[test]
	fn test_checkout_reassembles_chunks() {
		let repo = tempfile::tempdir().unwrap();
		let data_dir = tempfile::tempdir().unwrap();
		let store = LocalStore::new(repo.path());

		let first = Chunk::new(b"hello ".to_vec());
		let second = Chunk::new(b"world".to_vec());
		store.put_chunk(&first).unwrap();
		store.put_chunk(&second).unwrap();

		let file = FileManifest::new(
			"/notes/greeting.txt".into(),
			11,
			1_700_000_000_000,
			vec![first.id, second.id],
		);

		let written = checkout_file(&store, data_dir.path(), &file).unwrap();
		assert_eq!(fs::read(written).unwrap(), b"hello world");
	}

	#[test]
	fn test_remove_missing_file_is_fine() {
		let data_dir = tempfile::tempdir().unwrap();
		let file = FileManifest::new("/gone.txt".into(), 0, 0, vec![]);
		remove_files(data_dir.path(), &[file]).unwrap();
	}

	#[test]
	fn test_sync_history_copy_lands_under_timestamped_dir() {
		let history = tempfile::tempdir().unwrap();
		let scratch = tempfile::tempdir().unwrap();
		let src = scratch.path().join("doc.vd");
		fs::write(&src, b"cloud version").unwrap();

		gen_sync_history(history.path(), "2024-01-02-030405", "/notes/doc.vd", &src).unwrap();

		let copied = history
			.path()
			.join("2024-01-02-030405-sync/notes/doc.vd");
		assert_eq!(fs::read(copied).unwrap(), b"cloud version");
	}
}
