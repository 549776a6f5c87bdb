//! Sync-ignore rules. The blob is a list of gitignore-style lines; the
//! compiled matcher strips matching paths from the merged remove set so a
//! remote that no longer tracks locally-ignored files cannot delete them
//! here.

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::Result;

#[derive(Debug)]
pub(crate) struct IgnoreMatcher {
	set: GlobSet,
}

impl IgnoreMatcher {
	pub fn empty() -> Self {
		Self {
			set: GlobSet::empty(),
		}
	}

	pub fn compile(content: &str) -> Result<Self> {
		let mut builder = GlobSetBuilder::new();
		for line in content.replace("\r\n", "\n").lines() {
			let line = line.trim();
			if line.is_empty() || line.starts_with('#') {
				continue;
			}

			// An anchored pattern matches from the tree root; a floating one
			// matches at any depth, like gitignore.
			let pattern = if let Some(anchored) = line.strip_prefix('/') {
				anchored.to_string()
			} else {
				format!("**/{line}")
			};
			builder.add(Glob::new(&pattern)?);

			// A bare directory rule also covers everything below it.
			if !pattern.ends_with("/**") && !pattern.contains('*') {
				builder.add(Glob::new(&format!("{pattern}/**"))?);
			}
		}

		Ok(Self {
			set: builder.build()?,
		})
	}

	pub fn matches(&self, path: &str) -> bool {
		self.set.is_match(path.trim_start_matches('/'))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_anchored_and_floating_rules() {
		let matcher = IgnoreMatcher::compile("/notes/tmp/**\n*.bak\n").unwrap();

		assert!(matcher.matches("/notes/tmp/a.md"));
		assert!(matcher.matches("/notes/tmp/deep/b.md"));
		assert!(!matcher.matches("/notes/real/a.md"));
		assert!(matcher.matches("/anywhere/file.bak"));
		assert!(matcher.matches("/file.bak"));
	}

	#[test]
	fn test_comments_and_blank_lines_are_skipped() {
		let matcher = IgnoreMatcher::compile("# comment\n\n  \n/skip.txt\n").unwrap();
		assert!(matcher.matches("/skip.txt"));
		assert!(!matcher.matches("/comment"));
	}

	#[test]
	fn test_directory_rule_covers_children() {
		let matcher = IgnoreMatcher::compile("/cache\n").unwrap();
		assert!(matcher.matches("/cache"));
		assert!(matcher.matches("/cache/entry.bin"));
	}

	#[test]
	fn test_empty_matcher_matches_nothing() {
		let matcher = IgnoreMatcher::empty();
		assert!(!matcher.matches("/anything"));
	}

	#[test]
	fn test_windows_line_endings() {
		let matcher = IgnoreMatcher::compile("/a.txt\r\n/b.txt\r\n").unwrap();
		assert!(matcher.matches("/a.txt"));
		assert!(matcher.matches("/b.txt"));
	}
}
