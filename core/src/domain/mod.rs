//! Domain types of the snapshot repository: content addresses, chunks, file
//! manifests and snapshot indexes. Everything here is immutable once written
//! to a store; identity is derived from content.

pub mod file;
pub mod hash;
pub mod index;

pub use file::{Chunk, FileManifest};
pub use hash::Hash;
pub use index::{CheckIndex, CheckIndexFile, CheckReport, Index, IndexesList, PublishedIndex};

use serde::{Deserialize, Serialize};

/// Identity of the device an index was produced on; recorded on every
/// published snapshot so the index list can attribute entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
	pub id: String,
	pub name: String,
	pub os: String,
}

impl DeviceInfo {
	pub fn new(id: impl Into<String>, name: impl Into<String>, os: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			name: name.into(),
			os: os.into(),
		}
	}

	/// A device identity with a random id, for hosts that have not persisted
	/// one yet.
	pub fn generate(name: impl Into<String>, os: impl Into<String>) -> Self {
		Self::new(uuid::Uuid::new_v4().to_string(), name, os)
	}
}
