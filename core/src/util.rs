use std::{
	fs, io,
	path::{Path, PathBuf},
};

use chrono::{DateTime, Local, TimeZone, Utc};

/// I/O error annotated with the path it happened on.
#[derive(thiserror::Error, Debug)]
#[error("I/O error at path '{}': {source}", path.display())]
pub struct FileIOError {
	pub path: Box<Path>,
	#[source]
	pub source: io::Error,
}

impl<P: Into<Box<Path>>> From<(P, io::Error)> for FileIOError {
	fn from((path, source): (P, io::Error)) -> Self {
		Self {
			path: path.into(),
			source,
		}
	}
}

impl FileIOError {
	pub fn is_not_found(&self) -> bool {
		self.source.kind() == io::ErrorKind::NotFound
	}
}

pub fn now_millis() -> i64 {
	Utc::now().timestamp_millis()
}

/// Renders a Unix-millisecond timestamp for log lines.
pub fn format_millis(millis: i64) -> String {
	Local
		.timestamp_millis_opt(millis)
		.single()
		.map(|t: DateTime<Local>| t.format("%Y-%m-%d %H:%M:%S").to_string())
		.unwrap_or_else(|| millis.to_string())
}

/// Writes `data` to `path` through a sibling temp file and a rename, so
/// readers never observe a half-written blob.
pub fn write_file_safer(path: &Path, data: &[u8]) -> Result<(), FileIOError> {
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).map_err(|e| FileIOError::from((parent, e)))?;
	}

	let tmp = path.with_extension("tmp~");
	fs::write(&tmp, data).map_err(|e| FileIOError::from((tmp.as_path(), e)))?;
	fs::rename(&tmp, path).map_err(|e| FileIOError::from((path, e)))?;

	Ok(())
}

/// Removes directories under `root` that hold no files, bottom-up. Directory
/// names in `excludes` are left alone together with everything below them.
pub fn remove_empty_dirs(root: &Path, excludes: &[String]) {
	fn visit(dir: &Path, excludes: &[String]) -> bool {
		let Ok(entries) = fs::read_dir(dir) else {
			return false;
		};

		let mut empty = true;
		for entry in entries.flatten() {
			let path = entry.path();
			if path.is_dir() {
				let name = entry.file_name().to_string_lossy().to_string();
				if excludes.contains(&name) {
					empty = false;
					continue;
				}
				if visit(&path, excludes) {
					if let Err(e) = fs::remove_dir(&path) {
						tracing::warn!("failed to remove empty dir {}: {e}", path.display());
						empty = false;
					}
				} else {
					empty = false;
				}
			} else {
				empty = false;
			}
		}
		empty
	}

	visit(root, excludes);
}

/// Copies a file creating any missing parent directories at the destination.
pub fn copy_file(from: &Path, to: &Path) -> Result<(), FileIOError> {
	if let Some(parent) = to.parent() {
		fs::create_dir_all(parent).map_err(|e| FileIOError::from((parent, e)))?;
	}
	fs::copy(from, to).map_err(|e| FileIOError::from((from, e)))?;
	Ok(())
}

/// Joins a repository-relative path (leading `/`) onto a local root.
pub fn join_rel(root: &Path, rel: &str) -> PathBuf {
	root.join(rel.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_remove_empty_dirs_keeps_excluded() {
		let dir = tempfile::tempdir().unwrap();
		fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
		fs::create_dir_all(dir.path().join(".vellum/inner")).unwrap();
		fs::write(dir.path().join("a/keep.txt"), b"x").unwrap();

		remove_empty_dirs(dir.path(), &[".vellum".to_string()]);

		assert!(dir.path().join("a").exists());
		assert!(!dir.path().join("a/b").exists());
		assert!(dir.path().join(".vellum/inner").exists());
	}

	#[test]
	fn test_join_rel_strips_leading_slash() {
		let joined = join_rel(Path::new("/data"), "/notes/doc.vd");
		assert_eq!(joined, PathBuf::from("/data/notes/doc.vd"));
	}
}
