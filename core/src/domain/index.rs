use serde::{Deserialize, Serialize};

use super::{DeviceInfo, Hash};

/// A snapshot: the ordered set of file manifests forming one point-in-time
/// state of the repository. Immutable once written, except that
/// `check_index_id` is set once right before publication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Index {
	pub id: Hash,
	#[serde(default)]
	pub parent: Hash,
	#[serde(default)]
	pub memo: String,
	/// Unix milliseconds of snapshot creation.
	pub created: i64,
	pub files: Vec<Hash>,
	/// Total size in bytes of the files listed.
	pub size: i64,
	#[serde(rename = "systemID", default)]
	pub system_id: String,
	#[serde(rename = "systemName", default)]
	pub system_name: String,
	#[serde(rename = "systemOS", default)]
	pub system_os: String,
	#[serde(rename = "checkIndexID", default)]
	pub check_index_id: Hash,
}

impl Index {
	pub fn new(
		parent: Hash,
		memo: String,
		created: i64,
		files: Vec<Hash>,
		size: i64,
		device: &DeviceInfo,
	) -> Self {
		let mut index = Self {
			id: Hash::default(),
			parent,
			memo,
			created,
			files,
			size,
			system_id: device.id.clone(),
			system_name: device.name.clone(),
			system_os: device.os.clone(),
			check_index_id: Hash::default(),
		};
		index.id = index.compute_id();
		index
	}

	// The memo and check-index id are set after creation and before first
	// publication; identity must not depend on them.
	fn compute_id(&self) -> Hash {
		let mut buf = format!(
			"{}\n{}\n{}\n{}\n",
			self.parent, self.created, self.size, self.system_id
		);
		for file in &self.files {
			buf.push_str(file.as_str());
			buf.push('\n');
		}
		Hash::of(buf.as_bytes())
	}

	/// An index that has never been written; stands in for a missing remote
	/// or a missing sync point.
	pub fn is_empty(&self) -> bool {
		self.id.is_empty()
	}

	/// Short form for log lines.
	pub fn brief(&self) -> String {
		format!(
			"[id={}, files={}, size={}, created={}]",
			self.id,
			self.files.len(),
			self.size,
			crate::util::format_millis(self.created),
		)
	}
}

/// Parallel verification manifest for a published index, consumed by the
/// remote integrity audit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckIndex {
	pub id: Hash,
	#[serde(rename = "indexID")]
	pub index_id: Hash,
	pub files: Vec<CheckIndexFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckIndexFile {
	pub id: Hash,
	pub chunks: Vec<Hash>,
}

/// Remote-generated report of data objects the audit could not resolve.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckReport {
	#[serde(rename = "missingObjects", default)]
	pub missing_objects: Vec<Hash>,
	#[serde(rename = "fixCount", default)]
	pub fix_count: i32,
}

/// Wire body of `indexes-v2.json`: every index id ever published, newest
/// first, deduplicated by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexesList {
	pub indexes: Vec<PublishedIndex>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedIndex {
	pub id: Hash,
	#[serde(rename = "systemID", default)]
	pub system_id: String,
	#[serde(rename = "systemName", default)]
	pub system_name: String,
	#[serde(rename = "systemOS", default)]
	pub system_os: String,
}

impl From<&Index> for PublishedIndex {
	fn from(index: &Index) -> Self {
		Self {
			id: index.id.clone(),
			system_id: index.system_id.clone(),
			system_name: index.system_name.clone(),
			system_os: index.system_os.clone(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_empty_index_roundtrip() {
		let index = Index::default();
		assert!(index.is_empty());

		let json = serde_json::to_vec(&index).unwrap();
		let back: Index = serde_json::from_slice(&json).unwrap();
		assert!(back.is_empty());
	}

	#[test]
	fn test_index_id_depends_on_files() {
		let device = DeviceInfo::new("dev", "laptop", "linux");
		let a = Index::new(
			Hash::default(),
			String::new(),
			1,
			vec![Hash::of(b"f1")],
			10,
			&device,
		);
		let b = Index::new(
			Hash::default(),
			String::new(),
			1,
			vec![Hash::of(b"f2")],
			10,
			&device,
		);
		assert_ne!(a.id, b.id);
	}

	#[test]
	fn test_indexes_list_wire_keys() {
		let list = IndexesList {
			indexes: vec![PublishedIndex {
				id: Hash::of(b"x"),
				system_id: "s".into(),
				system_name: "n".into(),
				system_os: "o".into(),
			}],
		};
		let json = serde_json::to_string(&list).unwrap();
		assert!(json.contains("\"systemID\""));
		assert!(json.contains("\"systemName\""));
		assert!(json.contains("\"systemOS\""));
	}
}
