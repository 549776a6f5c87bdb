//! Remote object gateway: the typed contract every cloud backend implements,
//! plus the repository key layout.
//!
//! Backends (S3, WebDAV, the managed service) live outside this crate; the
//! sync engine only sees this trait. Uploads stream the already-encoded blob
//! sitting at `<repo>/<key>` on local disk, downloads return the raw backend
//! bytes and the caller applies the decode rule for the key family.

pub mod sync;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{domain::Hash, util::FileIOError};

/// Exact remote key strings. These are wire layout, not implementation
/// detail; changing any of them strands existing repositories.
pub mod keys {
	use crate::domain::Hash;

	pub const REF_LATEST: &str = "refs/latest";
	pub const REF_LATEST_SYNC: &str = "refs/latest-sync";
	pub const REFS_PREFIX: &str = "refs/";
	pub const INDEXES_V2: &str = "indexes-v2.json";
	pub const CHECK_REPORT: &str = "check/indexes-report";

	pub fn index(id: &Hash) -> String {
		format!("indexes/{id}")
	}

	pub fn check_index(id: &Hash) -> String {
		format!("check/indexes/{id}")
	}

	pub fn seq_ref(seq: u64, id: &Hash) -> String {
		format!("refs/latest-{seq}-{id}")
	}
}

#[derive(thiserror::Error, Debug)]
pub enum CloudError {
	#[error("cloud object not found: {key}")]
	ObjectNotFound { key: String },
	#[error("cloud repository is locked by {owner}")]
	Locked { owner: String },
	#[error("transient cloud failure: {message}")]
	Transient { message: String },
	#[error("cloud authentication rejected: {message}")]
	Auth { message: String },
	#[error("cloud request failed: {message}")]
	Fatal { message: String },
	#[error(transparent)]
	FileIO(#[from] FileIOError),
}

impl CloudError {
	pub fn is_not_found(&self) -> bool {
		matches!(self, Self::ObjectNotFound { .. })
	}
}

/// Which product family a backend belongs to. Drives the seq-ref freshness
/// markers (CDN-cached backends) and the integrity audit (managed only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
	S3,
	WebDav,
	Managed,
	Local,
}

impl BackendKind {
	/// Backends whose `refs/latest` may be served stale by a CDN get the
	/// `refs/latest-<seq>-<hash>` fallback markers.
	pub fn uses_seq_refs(self) -> bool {
		matches!(self, Self::S3 | Self::Managed)
	}

	/// Only the managed service runs the server-side integrity audit.
	pub fn uses_check_index(self) -> bool {
		matches!(self, Self::Managed)
	}
}

/// Traffic accounting pushed to the backend after each operation,
/// fire-and-forget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Traffic {
	pub upload_bytes: u64,
	pub download_bytes: u64,
	pub api_get: u64,
	pub api_put: u64,
}

/// A listed remote object; `path` is relative to the listed prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
	pub path: String,
	pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudRepoInfo {
	pub name: String,
	pub size: i64,
	pub updated: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudStat {
	pub size: i64,
	pub file_count: u64,
	pub updated: i64,
}

#[async_trait]
pub trait CloudBackend: Send + Sync {
	fn kind(&self) -> BackendKind;

	/// Uploads the local blob at `<repo>/<key>`, returning bytes sent.
	/// `cacheable` hints that CDNs may cache the object.
	async fn upload_object(&self, key: &str, cacheable: bool) -> Result<u64, CloudError>;

	/// Uploads an in-memory payload (seq refs have no local file).
	async fn upload_bytes(&self, key: &str, data: Vec<u8>, cacheable: bool)
		-> Result<u64, CloudError>;

	async fn download_object(&self, key: &str) -> Result<Vec<u8>, CloudError>;

	async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>, CloudError>;

	async fn remove_object(&self, key: &str) -> Result<(), CloudError>;

	/// Acquires the device lease; `Locked { owner }` when another device
	/// holds it.
	async fn lock(&self, owner: &str) -> Result<(), CloudError>;

	async fn unlock(&self) -> Result<(), CloudError>;

	fn get_available_size(&self) -> i64;

	fn get_concurrent_reqs(&self) -> usize;

	async fn add_traffic(&self, traffic: Traffic);

	async fn create_repo(&self, name: &str) -> Result<(), CloudError>;

	async fn remove_repo(&self, name: &str) -> Result<(), CloudError>;

	/// All repositories on the account plus their total size.
	async fn get_repos(&self) -> Result<(Vec<CloudRepoInfo>, i64), CloudError>;

	async fn get_stat(&self) -> Result<CloudStat, CloudError>;
}

/// Parses a `latest-<seq>-<hash>` ref name (relative to `refs/`).
pub(crate) fn parse_seq_ref(name: &str) -> Option<(u64, Hash)> {
	let rest = name.strip_prefix("latest-")?;
	let (seq, hash) = rest.split_once('-')?;
	Some((seq.parse().ok()?, Hash::parse(hash)?))
}
