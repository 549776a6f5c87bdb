//! Structured-document block comparison.
//!
//! A `.vd` document is a JSON tree of blocks with stable ids and an
//! attribute map. Two snapshots of a document are equivalent modulo fold
//! state when their block sets agree on everything except the `fold`,
//! `heading-fold` and `updated` attributes; such a local edit is
//! non-durable and loses to a concurrent remote edit without counting as a
//! conflict.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Attributes ignored by the comparison: view state and bookkeeping, not
/// content.
const TRANSIENT_ATTRS: [&str; 3] = ["fold", "heading-fold", "updated"];

const ROOT_KIND: &str = "document";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocNode {
	#[serde(default)]
	pub id: String,
	#[serde(rename = "type", default)]
	pub kind: String,
	#[serde(default)]
	pub content: String,
	#[serde(default)]
	pub attrs: BTreeMap<String, String>,
	#[serde(default)]
	pub children: Vec<DocNode>,
}

pub(crate) fn parse_tree(data: &[u8]) -> Result<DocNode> {
	serde_json::from_slice(data).map_err(|e| Error::Document(e.to_string()))
}

fn collect_blocks<'a>(node: &'a DocNode, blocks: &mut BTreeMap<&'a str, &'a DocNode>) {
	if node.kind != ROOT_KIND && !node.id.is_empty() {
		blocks.insert(node.id.as_str(), node);
	}
	for child in &node.children {
		collect_blocks(child, blocks);
	}
}

fn durable_attrs(node: &DocNode) -> BTreeMap<&str, &str> {
	node.attrs
		.iter()
		.filter(|(key, _)| !TRANSIENT_ATTRS.contains(&key.as_str()))
		.map(|(key, value)| (key.as_str(), value.as_str()))
		.collect()
}

/// Whether `local` differs from `base` only in transient attributes.
pub(crate) fn only_fold_changed(local: &DocNode, base: &DocNode) -> bool {
	let mut local_blocks = BTreeMap::new();
	let mut base_blocks = BTreeMap::new();
	collect_blocks(local, &mut local_blocks);
	collect_blocks(base, &mut base_blocks);

	if local_blocks.len() != base_blocks.len() {
		return false;
	}

	for (id, local_node) in &local_blocks {
		let Some(base_node) = base_blocks.get(id) else {
			return false;
		};
		if local_node.kind != base_node.kind || local_node.content != base_node.content {
			return false;
		}
		if durable_attrs(local_node) != durable_attrs(base_node) {
			return false;
		}
	}

	true
}

#[cfg(test)]
mod tests {
	use super::*;

	fn doc(json: &str) -> DocNode {
		parse_tree(json.as_bytes()).unwrap()
	}

	const BASE: &str = r#"{
		"id": "root", "type": "document", "children": [
			{"id": "b1", "type": "paragraph", "content": "x",
			 "attrs": {"fold": "0", "updated": "100"}},
			{"id": "b2", "type": "heading", "content": "title",
			 "attrs": {"level": "2"}}
		]
	}"#;

	#[test]
	fn test_fold_only_change_is_equivalent() {
		let folded = BASE.replace(r#""fold": "0""#, r#""fold": "1""#);
		assert!(only_fold_changed(&doc(&folded), &doc(BASE)));
	}

	#[test]
	fn test_updated_attr_is_transient() {
		let touched = BASE.replace(r#""updated": "100""#, r#""updated": "999""#);
		assert!(only_fold_changed(&doc(&touched), &doc(BASE)));
	}

	#[test]
	fn test_content_change_is_not_equivalent() {
		let edited = BASE.replace(r#""content": "x""#, r#""content": "y""#);
		assert!(!only_fold_changed(&doc(&edited), &doc(BASE)));
	}

	#[test]
	fn test_durable_attr_change_is_not_equivalent() {
		let releveled = BASE.replace(r#""level": "2""#, r#""level": "3""#);
		assert!(!only_fold_changed(&doc(&releveled), &doc(BASE)));
	}

	#[test]
	fn test_added_block_is_not_equivalent() {
		let grown = BASE.replace(
			r#"{"id": "b2""#,
			r#"{"id": "b3", "type": "paragraph", "content": "new"},
			   {"id": "b2""#,
		);
		assert!(!only_fold_changed(&doc(&grown), &doc(BASE)));
	}

	#[test]
	fn test_root_node_is_not_a_block() {
		// Rerooting alone does not affect the comparison.
		let local = doc(r#"{"id": "other-root", "type": "document", "children": []}"#);
		let base = doc(r#"{"id": "root", "type": "document", "children": []}"#);
		assert!(only_fold_changed(&local, &base));
	}
}
