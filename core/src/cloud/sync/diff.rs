//! Pure set arithmetic over file lists, the base of the three-way merge.

use std::collections::HashMap;

use crate::domain::FileManifest;

/// Splits `a` relative to `b` into upserts (paths new in `a`, or present in
/// both with a different id) and removes (paths only `b` still has). With
/// `strict`, a timestamp change alone also counts as an upsert.
pub(crate) fn diff_upsert_remove<'a>(
	a: &'a [FileManifest],
	b: &'a [FileManifest],
	strict: bool,
) -> (Vec<&'a FileManifest>, Vec<&'a FileManifest>) {
	let by_path_a: HashMap<&str, &FileManifest> =
		a.iter().map(|f| (f.path.as_str(), f)).collect();
	let by_path_b: HashMap<&str, &FileManifest> =
		b.iter().map(|f| (f.path.as_str(), f)).collect();

	let upserts = a
		.iter()
		.filter(|file| match by_path_b.get(file.path.as_str()) {
			None => true,
			Some(other) => other.id != file.id || (strict && other.updated != file.updated),
		})
		.collect();

	let removes = b
		.iter()
		.filter(|file| !by_path_a.contains_key(file.path.as_str()))
		.collect();

	(upserts, removes)
}

/// First entry matching `file` by id OR by path, so a rename-plus-rewrite
/// still resolves in one hop. Which field matched is implementation order;
/// callers must not depend on it.
pub(crate) fn get_file<'a>(
	files: &[&'a FileManifest],
	file: &FileManifest,
) -> Option<&'a FileManifest> {
	files
		.iter()
		.find(|f| f.id == file.id || f.path == file.path)
		.copied()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::domain::Hash;

	fn file(path: &str, content: &str, updated: i64) -> FileManifest {
		FileManifest::new(
			path.to_string(),
			content.len() as i64,
			updated,
			vec![Hash::of(content.as_bytes())],
		)
	}

	#[test]
	fn test_diff_new_and_changed_paths_are_upserts() {
		let a = vec![file("/a", "1", 10), file("/b", "new", 10)];
		let b = vec![file("/b", "old", 10)];

		let (upserts, removes) = diff_upsert_remove(&a, &b, false);
		let paths: Vec<&str> = upserts.iter().map(|f| f.path.as_str()).collect();
		assert_eq!(paths, vec!["/a", "/b"]);
		assert!(removes.is_empty());
	}

	#[test]
	fn test_diff_missing_paths_are_removes() {
		let a = vec![file("/keep", "x", 1)];
		let b = vec![file("/keep", "x", 1), file("/gone", "y", 1)];

		let (upserts, removes) = diff_upsert_remove(&a, &b, false);
		assert!(upserts.is_empty());
		assert_eq!(removes.len(), 1);
		assert_eq!(removes[0].path, "/gone");
	}

	#[test]
	fn test_strict_diff_sees_timestamp_only_changes() {
		let a = vec![file("/a", "same", 2000)];
		let b = vec![file("/a", "same", 1000)];

		let (lenient, _) = diff_upsert_remove(&a, &b, false);
		assert!(lenient.is_empty());

		let (strict, _) = diff_upsert_remove(&a, &b, true);
		assert_eq!(strict.len(), 1);
	}

	#[test]
	fn test_get_file_matches_by_id_or_path() {
		let renamed = file("/new-name", "content", 1);
		let same_path = file("/probe", "other", 1);
		let files = vec![&renamed, &same_path];

		// Same identity under another path: matches by id.
		let probe = FileManifest {
			path: "/old-name".to_string(),
			..renamed.clone()
		};
		assert_eq!(get_file(&files, &probe).unwrap().path, "/new-name");

		// Same path with different content: matches by path.
		let probe = file("/probe", "rewritten", 1);
		assert_eq!(get_file(&files, &probe).unwrap().path, "/probe");

		let probe = file("/absent", "nothing", 1);
		assert!(get_file(&files, &probe).is_none());
	}
}
