use serde::{Deserialize, Serialize};

use super::Hash;

/// An immutable content-addressed byte range of a file. Shared across files
/// whenever content matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
	pub id: Hash,
	pub data: Vec<u8>,
}

impl Chunk {
	pub fn new(data: Vec<u8>) -> Self {
		Self {
			id: Hash::of(&data),
			data,
		}
	}
}

/// Content-addressed record of a path's chunks, size and mtime. Identical
/// `{path, size, updated, chunks}` yields an identical id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
	pub id: Hash,
	pub path: String,
	pub size: i64,
	/// Unix milliseconds of the last modification.
	pub updated: i64,
	pub chunks: Vec<Hash>,
}

impl FileManifest {
	pub fn new(path: String, size: i64, updated: i64, chunks: Vec<Hash>) -> Self {
		let mut file = Self {
			id: Hash::default(),
			path,
			size,
			updated,
			chunks,
		};
		file.id = file.compute_id();
		file
	}

	fn compute_id(&self) -> Hash {
		let mut buf = format!("{}\n{}\n{}\n", self.path, self.size, self.updated);
		for chunk in &self.chunks {
			buf.push_str(chunk.as_str());
			buf.push('\n');
		}
		Hash::of(buf.as_bytes())
	}
}
