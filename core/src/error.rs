use crate::{cloud::CloudError, domain::Hash, store::StoreError, util::FileIOError};

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("cloud repository is locked by another device ({owner})")]
	CloudLocked { owner: String },
	#[error("cloud storage limit size exceeded")]
	CloudStorageSizeExceeded,
	#[error("cloud backup count exceeded")]
	CloudBackupCountExceeded,
	#[error("generate conflict history failed")]
	GenerateConflictHistory,
	#[error("repository is corrupted and must be reset")]
	RepoFatal,
	#[error("object referenced by an index is missing: {0}")]
	NotFoundObject(Hash),
	#[error(transparent)]
	Cloud(#[from] CloudError),
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error("serialization failure: {0}")]
	Json(#[from] serde_json::Error),
	#[error("blocking task failed to execute to completion")]
	Join(#[from] tokio::task::JoinError),
	#[error("malformed document tree: {0}")]
	Document(String),
	#[error("invalid syncignore pattern: {0}")]
	Ignore(#[from] globset::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
	/// A "no such file" under `objects/` observed while uploading means an
	/// index references data the local store no longer holds: the repository
	/// itself is corrupt, which the caller must be told unambiguously.
	pub(crate) fn promote_repo_fatal(self) -> Self {
		let object_path_gone = |e: &FileIOError| {
			e.is_not_found() && e.path.to_string_lossy().contains("objects")
		};

		match &self {
			Self::FileIO(e) if object_path_gone(e) => Self::RepoFatal,
			Self::Cloud(CloudError::FileIO(e)) if object_path_gone(e) => Self::RepoFatal,
			Self::Store(StoreError::FileIO(e)) if object_path_gone(e) => Self::RepoFatal,
			_ => self,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io;

	#[test]
	fn test_missing_object_upload_promotes_to_fatal() {
		let err = Error::Cloud(CloudError::FileIO(FileIOError::from((
			std::path::Path::new("/repo/objects/ab/cdef"),
			io::Error::new(io::ErrorKind::NotFound, "gone"),
		))));
		assert!(matches!(err.promote_repo_fatal(), Error::RepoFatal));
	}

	#[test]
	fn test_other_errors_pass_through() {
		let err = Error::CloudStorageSizeExceeded;
		assert!(matches!(
			err.promote_repo_fatal(),
			Error::CloudStorageSizeExceeded
		));

		let err = Error::FileIO(FileIOError::from((
			std::path::Path::new("/data/notes/a.vd"),
			io::Error::new(io::ErrorKind::NotFound, "gone"),
		)));
		assert!(!matches!(err.promote_repo_fatal(), Error::RepoFatal));
	}
}
