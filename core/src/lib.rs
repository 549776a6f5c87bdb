//! Vellum core: a content-addressed snapshot repository with cloud
//! synchronization.
//!
//! User documents are modeled as immutable chunks and file manifests; an
//! index lists the manifests forming one point-in-time state. The cloud
//! layer reconciles a local index with a remote one through a three-way
//! merge over the last sync point, moves the minimum set of objects in both
//! directions with bounded parallelism, and flips the remote `refs/latest`
//! pointer only after everything it references is durable.

pub mod cloud;
pub mod config;
pub mod domain;
pub mod error;
pub mod event;
pub mod store;
pub mod testing;
pub mod util;

pub(crate) mod indexer;
pub(crate) mod worktree;

use std::{
	fs,
	path::PathBuf,
	sync::{atomic::AtomicBool, Arc},
};

use tokio::sync::broadcast;
use tracing::{info, warn};

pub use cloud::{
	sync::{ApiTrafficStat, DownloadTrafficStat, MergeResult, TrafficStat, UploadTrafficStat},
	BackendKind, CloudBackend, CloudError, CloudRepoInfo, CloudStat, Traffic,
};
pub use config::SyncConfig;
pub use domain::{
	CheckIndex, CheckReport, Chunk, DeviceInfo, FileManifest, Hash, Index, IndexesList,
};
pub use error::{Error, Result};
pub use event::{EventBus, SyncEvent};
pub use store::LocalStore;

use util::{write_file_safer, FileIOError};

/// A snapshot repository bound to one device and one cloud backend.
///
/// Sync entry points serialize on an internal operation lock; only one sync
/// runs at a time per repository.
pub struct Repo {
	pub(crate) device: DeviceInfo,
	/// Root of the local object database (`objects/`, `indexes/`, `refs/`).
	pub(crate) repo_path: PathBuf,
	/// The live working tree checkouts land in.
	pub(crate) data_path: PathBuf,
	pub(crate) temp_path: PathBuf,
	pub(crate) history_path: PathBuf,
	pub(crate) store: LocalStore,
	pub(crate) cloud: Arc<dyn CloudBackend>,
	pub(crate) config: SyncConfig,
	pub(crate) events: EventBus,
	pub(crate) op_lock: tokio::sync::Mutex<()>,
	/// One-shot guard for the missing-object repair, scoped to this instance
	/// so multi-repository hosts stay independent.
	pub(crate) fixed_missing_objects: AtomicBool,
}

impl Repo {
	pub fn open(
		repo_path: impl Into<PathBuf>,
		data_path: impl Into<PathBuf>,
		temp_path: impl Into<PathBuf>,
		history_path: impl Into<PathBuf>,
		device: DeviceInfo,
		cloud: Arc<dyn CloudBackend>,
		config: SyncConfig,
	) -> Result<Self> {
		let repo_path = repo_path.into();
		let data_path = data_path.into();
		let temp_path = temp_path.into();
		let history_path = history_path.into();

		for path in [&repo_path, &data_path, &temp_path, &history_path] {
			fs::create_dir_all(path).map_err(|e| FileIOError::from((path.as_path(), e)))?;
		}
		let refs = repo_path.join("refs");
		fs::create_dir_all(&refs).map_err(|e| FileIOError::from((refs.as_path(), e)))?;

		Ok(Self {
			store: LocalStore::new(&repo_path),
			device,
			repo_path,
			data_path,
			temp_path,
			history_path,
			cloud,
			config,
			events: EventBus::default(),
			op_lock: tokio::sync::Mutex::new(()),
			fixed_missing_objects: AtomicBool::new(false),
		})
	}

	pub fn device(&self) -> &DeviceInfo {
		&self.device
	}

	pub fn store(&self) -> &LocalStore {
		&self.store
	}

	pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
		self.events.subscribe()
	}

	/// The current local snapshot; the empty index on a repository that has
	/// never indexed.
	pub fn latest(&self) -> Result<Index> {
		let path = self.repo_path.join("refs/latest");
		let raw = match fs::read_to_string(&path) {
			Ok(raw) => raw,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Index::default()),
			Err(e) => return Err(FileIOError::from((path.as_path(), e)).into()),
		};

		let Some(id) = Hash::parse(&raw) else {
			warn!("local latest ref payload is malformed");
			return Ok(Index::default());
		};

		// A ref pointing at an index the store cannot resolve means local
		// corruption; the caller must reset the repository.
		self.store.get_index(&id).map_err(|e| {
			if e.is_not_found() {
				Error::RepoFatal
			} else {
				e.into()
			}
		})
	}

	/// The sync base: the snapshot state at the last successful sync. Soft
	/// on every failure, degrading to the empty index.
	pub(crate) fn latest_sync(&self) -> Index {
		let path = self.repo_path.join("refs/latest-sync");
		let raw = match fs::read_to_string(&path) {
			Ok(raw) => raw,
			Err(_) => {
				info!("latest sync index not found, starting from an empty base");
				return Index::default();
			}
		};

		let Some(id) = Hash::parse(&raw) else {
			warn!("latest sync ref payload is malformed");
			return Index::default();
		};

		match self.store.get_index(&id) {
			Ok(index) => {
				info!("got latest sync {}", index.brief());
				index
			}
			Err(e) => {
				warn!("get latest sync index failed: {e}");
				Index::default()
			}
		}
	}

	pub(crate) fn update_latest(&self, index: &Index) -> Result<()> {
		write_file_safer(
			&self.repo_path.join("refs/latest"),
			index.id.as_str().as_bytes(),
		)?;
		info!("updated latest {}", index.brief());
		Ok(())
	}

	pub(crate) fn update_latest_sync(&self, index: &Index) -> Result<()> {
		write_file_safer(
			&self.repo_path.join("refs/latest-sync"),
			index.id.as_str().as_bytes(),
		)?;
		info!("updated latest sync {}", index.brief());
		Ok(())
	}

	/// Rescans the working tree into a new snapshot and makes it the local
	/// latest.
	pub fn index(&self, memo: &str) -> Result<Index> {
		let parent = self.latest()?;
		let index = indexer::index_tree(
			&self.store,
			&self.data_path,
			&self.device,
			&parent.id,
			memo,
		)?;
		self.update_latest(&index)?;
		Ok(index)
	}
}
