//! Local content-addressed object store.
//!
//! Chunks and file manifests live under `objects/<h[:2]>/<h[2:]>` encoded
//! with the object codec; indexes live under `indexes/<h>` as compressed
//! JSON. Writes are temp-file-and-rename so concurrent readers never see a
//! partial object.

pub mod codec;

use std::{fs, io, path::PathBuf};

use crate::{
	domain::{Chunk, FileManifest, Hash, Index},
	util::{write_file_safer, FileIOError},
};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
	#[error("object not found: {id}")]
	NotFound { id: String },
	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error("codec failure: {0}")]
	Codec(io::Error),
	#[error("malformed object json: {0}")]
	Json(#[from] serde_json::Error),
}

impl StoreError {
	pub fn is_not_found(&self) -> bool {
		match self {
			Self::NotFound { .. } => true,
			Self::FileIO(e) => e.is_not_found(),
			_ => false,
		}
	}
}

#[derive(Debug, Clone)]
pub struct LocalStore {
	root: PathBuf,
}

impl LocalStore {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	pub fn root(&self) -> &PathBuf {
		&self.root
	}

	pub fn object_path(&self, id: &Hash) -> PathBuf {
		self.root.join(id.object_key())
	}

	pub fn index_path(&self, id: &Hash) -> PathBuf {
		self.root.join("indexes").join(id.as_str())
	}

	/// Size on disk of a data object, or `NotFound`.
	pub fn stat(&self, id: &Hash) -> Result<u64, StoreError> {
		let path = self.object_path(id);
		match fs::metadata(&path) {
			Ok(meta) => Ok(meta.len()),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound {
				id: id.to_string(),
			}),
			Err(e) => Err(FileIOError::from((path.as_path(), e)).into()),
		}
	}

	fn read_object(&self, id: &Hash) -> Result<Vec<u8>, StoreError> {
		let path = self.object_path(id);
		let encoded = match fs::read(&path) {
			Ok(data) => data,
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				return Err(StoreError::NotFound {
					id: id.to_string(),
				})
			}
			Err(e) => return Err(FileIOError::from((path.as_path(), e)).into()),
		};
		self.decode_object_data(&encoded)
	}

	fn write_object(&self, id: &Hash, data: &[u8]) -> Result<(), StoreError> {
		let path = self.object_path(id);
		if path.exists() {
			return Ok(()); // content-addressed, already present
		}
		let encoded = codec::compress(data).map_err(StoreError::Codec)?;
		write_file_safer(&path, &encoded)?;
		Ok(())
	}

	pub fn get_chunk(&self, id: &Hash) -> Result<Chunk, StoreError> {
		let data = self.read_object(id)?;
		Ok(Chunk {
			id: id.clone(),
			data,
		})
	}

	pub fn put_chunk(&self, chunk: &Chunk) -> Result<(), StoreError> {
		self.write_object(&chunk.id, &chunk.data)
	}

	pub fn get_file(&self, id: &Hash) -> Result<FileManifest, StoreError> {
		let data = self.read_object(id)?;
		Ok(serde_json::from_slice(&data)?)
	}

	pub fn put_file(&self, file: &FileManifest) -> Result<(), StoreError> {
		self.write_object(&file.id, &serde_json::to_vec(file)?)
	}

	pub fn get_index(&self, id: &Hash) -> Result<Index, StoreError> {
		let path = self.index_path(id);
		let encoded = match fs::read(&path) {
			Ok(data) => data,
			Err(e) if e.kind() == io::ErrorKind::NotFound => {
				return Err(StoreError::NotFound {
					id: id.to_string(),
				})
			}
			Err(e) => return Err(FileIOError::from((path.as_path(), e)).into()),
		};
		let data = self.decompress_index_data(&encoded)?;
		Ok(serde_json::from_slice(&data)?)
	}

	pub fn put_index(&self, index: &Index) -> Result<(), StoreError> {
		let data = serde_json::to_vec(index)?;
		let encoded = codec::compress(&data).map_err(StoreError::Codec)?;
		write_file_safer(&self.index_path(&index.id), &encoded)?;
		Ok(())
	}

	/// Applies the object codec to bytes fetched from the remote, the inverse
	/// of what `write_object` put on disk.
	pub fn decode_object_data(&self, data: &[u8]) -> Result<Vec<u8>, StoreError> {
		codec::decompress(data).map_err(StoreError::Codec)
	}

	/// Index-family keys are compressed JSON without the object codec.
	pub fn decompress_index_data(&self, data: &[u8]) -> Result<Vec<u8>, StoreError> {
		codec::decompress(data).map_err(StoreError::Codec)
	}

	pub fn compress_index_data(&self, data: &[u8]) -> Result<Vec<u8>, StoreError> {
		codec::compress(data).map_err(StoreError::Codec)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn store() -> (tempfile::TempDir, LocalStore) {
		let dir = tempfile::tempdir().unwrap();
		let store = LocalStore::new(dir.path());
		(dir, store)
	}

	#[test]
	fn test_chunk_roundtrip() {
		let (_dir, store) = store();
		let chunk = Chunk::new(b"chunk bytes".to_vec());
		store.put_chunk(&chunk).unwrap();

		assert_eq!(store.get_chunk(&chunk.id).unwrap(), chunk);
		assert_eq!(store.stat(&chunk.id).is_ok(), true);
	}

	#[test]
	fn test_missing_object_is_not_found() {
		let (_dir, store) = store();
		let err = store.get_chunk(&Hash::of(b"nope")).unwrap_err();
		assert!(err.is_not_found());
	}

	#[test]
	fn test_file_manifest_roundtrip() {
		let (_dir, store) = store();
		let file = FileManifest::new("/a.txt".into(), 3, 123, vec![Hash::of(b"c")]);
		store.put_file(&file).unwrap();
		assert_eq!(store.get_file(&file.id).unwrap(), file);
	}

	#[test]
	fn test_index_roundtrip() {
		let (_dir, store) = store();
		let device = crate::domain::DeviceInfo::new("d", "n", "o");
		let index = Index::new(Hash::default(), "memo".into(), 9, vec![], 0, &device);
		store.put_index(&index).unwrap();
		assert_eq!(store.get_index(&index.id).unwrap().id, index.id);
	}

	#[test]
	fn test_object_bytes_are_encoded_on_disk() {
		let (_dir, store) = store();
		let chunk = Chunk::new(b"encoded at rest".to_vec());
		store.put_chunk(&chunk).unwrap();

		let raw = fs::read(store.object_path(&chunk.id)).unwrap();
		assert_ne!(raw, chunk.data);
		assert_eq!(store.decode_object_data(&raw).unwrap(), chunk.data);
	}
}
