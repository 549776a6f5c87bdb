//! Test doubles for the sync engine. The in-memory backend emulates a remote
//! object store well enough to run whole sync flows against tempdir
//! repositories; two repositories pointed at the same shared state act like
//! two devices on one account.

use std::{
	collections::{BTreeMap, HashSet},
	fs,
	path::PathBuf,
	sync::{
		atomic::{AtomicI64, Ordering},
		Arc, Mutex,
	},
};

use async_trait::async_trait;

use crate::{
	cloud::{BackendKind, CloudBackend, CloudError, CloudRepoInfo, CloudStat, ObjectInfo, Traffic},
	util::FileIOError,
};

pub type SharedObjects = Arc<Mutex<BTreeMap<String, Vec<u8>>>>;
pub type SharedLock = Arc<Mutex<Option<String>>>;

pub struct MemoryCloud {
	repo_path: PathBuf,
	kind: BackendKind,
	objects: SharedObjects,
	lock: SharedLock,
	repos: Mutex<HashSet<String>>,
	available: AtomicI64,
	concurrent_reqs: usize,
	traffic: Mutex<Traffic>,
	fail_keys: Mutex<HashSet<String>>,
}

impl MemoryCloud {
	pub fn new(repo_path: impl Into<PathBuf>) -> Self {
		Self::connect(
			repo_path,
			Arc::new(Mutex::new(BTreeMap::new())),
			Arc::new(Mutex::new(None)),
		)
	}

	/// Binds another "device" to existing remote state.
	pub fn connect(repo_path: impl Into<PathBuf>, objects: SharedObjects, lock: SharedLock) -> Self {
		Self {
			repo_path: repo_path.into(),
			kind: BackendKind::Managed,
			objects,
			lock,
			repos: Mutex::new(HashSet::new()),
			available: AtomicI64::new(i64::MAX),
			concurrent_reqs: 8,
			traffic: Mutex::new(Traffic::default()),
			fail_keys: Mutex::new(HashSet::new()),
		}
	}

	pub fn with_kind(mut self, kind: BackendKind) -> Self {
		self.kind = kind;
		self
	}

	pub fn with_available_size(self, available: i64) -> Self {
		self.available.store(available, Ordering::Relaxed);
		self
	}

	pub fn set_available_size(&self, available: i64) {
		self.available.store(available, Ordering::Relaxed);
	}

	pub fn shared(&self) -> (SharedObjects, SharedLock) {
		(self.objects.clone(), self.lock.clone())
	}

	/// Makes every transfer touching `key` fail with a transient error.
	pub fn fail_on(&self, key: impl Into<String>) {
		self.fail_keys.lock().unwrap().insert(key.into());
	}

	pub fn object(&self, key: &str) -> Option<Vec<u8>> {
		self.objects.lock().unwrap().get(key).cloned()
	}

	pub fn object_keys(&self) -> Vec<String> {
		self.objects.lock().unwrap().keys().cloned().collect()
	}

	pub fn insert_object(&self, key: impl Into<String>, data: Vec<u8>) {
		self.objects.lock().unwrap().insert(key.into(), data);
	}

	pub fn remove_key(&self, key: &str) {
		self.objects.lock().unwrap().remove(key);
	}

	pub fn traffic(&self) -> Traffic {
		*self.traffic.lock().unwrap()
	}

	fn check_failure(&self, key: &str) -> Result<(), CloudError> {
		if self.fail_keys.lock().unwrap().contains(key) {
			return Err(CloudError::Transient {
				message: format!("injected failure on {key}"),
			});
		}
		Ok(())
	}
}

#[async_trait]
impl CloudBackend for MemoryCloud {
	fn kind(&self) -> BackendKind {
		self.kind
	}

	async fn upload_object(&self, key: &str, _cacheable: bool) -> Result<u64, CloudError> {
		self.check_failure(key)?;
		let path = self.repo_path.join(key);
		let data = fs::read(&path).map_err(|e| FileIOError::from((path.as_path(), e)))?;
		let len = data.len() as u64;
		self.objects.lock().unwrap().insert(key.to_string(), data);
		Ok(len)
	}

	async fn upload_bytes(
		&self,
		key: &str,
		data: Vec<u8>,
		_cacheable: bool,
	) -> Result<u64, CloudError> {
		self.check_failure(key)?;
		let len = data.len() as u64;
		self.objects.lock().unwrap().insert(key.to_string(), data);
		Ok(len)
	}

	async fn download_object(&self, key: &str) -> Result<Vec<u8>, CloudError> {
		self.check_failure(key)?;
		self.objects
			.lock()
			.unwrap()
			.get(key)
			.cloned()
			.ok_or_else(|| CloudError::ObjectNotFound {
				key: key.to_string(),
			})
	}

	async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>, CloudError> {
		Ok(self
			.objects
			.lock()
			.unwrap()
			.iter()
			.filter(|(key, _)| key.starts_with(prefix))
			.map(|(key, data)| ObjectInfo {
				path: key[prefix.len()..].to_string(),
				size: data.len() as u64,
			})
			.collect())
	}

	async fn remove_object(&self, key: &str) -> Result<(), CloudError> {
		self.objects.lock().unwrap().remove(key);
		Ok(())
	}

	async fn lock(&self, owner: &str) -> Result<(), CloudError> {
		let mut lock = self.lock.lock().unwrap();
		match lock.as_deref() {
			Some(holder) if holder != owner => Err(CloudError::Locked {
				owner: holder.to_string(),
			}),
			_ => {
				*lock = Some(owner.to_string());
				Ok(())
			}
		}
	}

	async fn unlock(&self) -> Result<(), CloudError> {
		*self.lock.lock().unwrap() = None;
		Ok(())
	}

	fn get_available_size(&self) -> i64 {
		self.available.load(Ordering::Relaxed)
	}

	fn get_concurrent_reqs(&self) -> usize {
		self.concurrent_reqs
	}

	async fn add_traffic(&self, traffic: Traffic) {
		let mut total = self.traffic.lock().unwrap();
		total.upload_bytes += traffic.upload_bytes;
		total.download_bytes += traffic.download_bytes;
		total.api_get += traffic.api_get;
		total.api_put += traffic.api_put;
	}

	async fn create_repo(&self, name: &str) -> Result<(), CloudError> {
		self.repos.lock().unwrap().insert(name.to_string());
		Ok(())
	}

	async fn remove_repo(&self, name: &str) -> Result<(), CloudError> {
		self.repos.lock().unwrap().remove(name);
		Ok(())
	}

	async fn get_repos(&self) -> Result<(Vec<CloudRepoInfo>, i64), CloudError> {
		let size: i64 = self
			.objects
			.lock()
			.unwrap()
			.values()
			.map(|data| data.len() as i64)
			.sum();
		let repos = self
			.repos
			.lock()
			.unwrap()
			.iter()
			.map(|name| CloudRepoInfo {
				name: name.clone(),
				size,
				updated: 0,
			})
			.collect();
		Ok((repos, size))
	}

	async fn get_stat(&self) -> Result<CloudStat, CloudError> {
		let objects = self.objects.lock().unwrap();
		Ok(CloudStat {
			size: objects.values().map(|data| data.len() as i64).sum(),
			file_count: objects.len() as u64,
			updated: 0,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_lock_is_exclusive_per_owner() {
		let dir = tempfile::tempdir().unwrap();
		let cloud = MemoryCloud::new(dir.path());

		cloud.lock("device-a").await.unwrap();
		cloud.lock("device-a").await.unwrap();
		let err = cloud.lock("device-b").await.unwrap_err();
		assert!(matches!(err, CloudError::Locked { owner } if owner == "device-a"));

		cloud.unlock().await.unwrap();
		cloud.lock("device-b").await.unwrap();
	}

	#[tokio::test]
	async fn test_list_strips_prefix() {
		let dir = tempfile::tempdir().unwrap();
		let cloud = MemoryCloud::new(dir.path());
		cloud.insert_object("refs/latest-1-aaa", vec![1]);
		cloud.insert_object("indexes/bbb", vec![2]);

		let refs = cloud.list_objects("refs/").await.unwrap();
		assert_eq!(refs.len(), 1);
		assert_eq!(refs[0].path, "latest-1-aaa");
	}
}
