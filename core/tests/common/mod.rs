#![allow(dead_code)] // not every integration binary uses every helper

use std::{
	fs,
	path::PathBuf,
	sync::Arc,
	time::{Duration, SystemTime},
};

use vellum_core::{
	testing::MemoryCloud, CloudBackend, DeviceInfo, Repo, SyncConfig,
};

/// One simulated device: its own repository directories plus a handle on the
/// in-memory cloud it talks to.
pub struct TestDevice {
	pub repo: Repo,
	pub cloud: Arc<MemoryCloud>,
	pub root: tempfile::TempDir,
}

impl TestDevice {
	pub fn data_path(&self, rel: &str) -> PathBuf {
		self.root.path().join("data").join(rel.trim_start_matches('/'))
	}

	pub fn write(&self, rel: &str, content: &[u8]) {
		let path = self.data_path(rel);
		fs::create_dir_all(path.parent().unwrap()).unwrap();
		fs::write(path, content).unwrap();
	}

	/// Writes a file whose mtime lies `behind` in the past, for timestamp
	/// skew scenarios.
	pub fn write_aged(&self, rel: &str, content: &[u8], behind: Duration) {
		self.write(rel, content);
		let path = self.data_path(rel);
		let file = fs::File::options().write(true).open(path).unwrap();
		file.set_modified(SystemTime::now() - behind).unwrap();
	}

	pub fn read(&self, rel: &str) -> Vec<u8> {
		fs::read(self.data_path(rel)).unwrap()
	}

	pub fn exists(&self, rel: &str) -> bool {
		self.data_path(rel).exists()
	}

	pub fn remove(&self, rel: &str) {
		fs::remove_file(self.data_path(rel)).unwrap();
	}

	pub fn history_root(&self) -> PathBuf {
		self.root.path().join("history")
	}
}

pub fn device(name: &str) -> TestDevice {
	let root = tempfile::tempdir().unwrap();
	let cloud = Arc::new(MemoryCloud::new(root.path().join("repo")));
	build(name, root, cloud)
}

/// A second device sharing the first one's remote state.
pub fn paired_device(name: &str, other: &TestDevice) -> TestDevice {
	let root = tempfile::tempdir().unwrap();
	let (objects, lock) = other.cloud.shared();
	let cloud = Arc::new(MemoryCloud::connect(root.path().join("repo"), objects, lock));
	build(name, root, cloud)
}

fn build(name: &str, root: tempfile::TempDir, cloud: Arc<MemoryCloud>) -> TestDevice {
	let dyn_cloud: Arc<dyn CloudBackend> = cloud.clone();
	let repo = Repo::open(
		root.path().join("repo"),
		root.path().join("data"),
		root.path().join("temp"),
		root.path().join("history"),
		DeviceInfo::new(name, name, "linux"),
		dyn_cloud,
		SyncConfig::default(),
	)
	.unwrap();

	TestDevice { repo, cloud, root }
}

/// A structured document with one paragraph block, as checkout bytes.
pub fn doc_json(block_id: &str, content: &str, fold: &str) -> String {
	format!(
		r#"{{"id":"root","type":"document","children":[{{"id":"{block_id}","type":"paragraph","content":"{content}","attrs":{{"fold":"{fold}"}}}}]}}"#
	)
}
