use std::fmt;

use serde::{Deserialize, Serialize};

/// A 40-character lowercase hex content address.
///
/// Treated as opaque everywhere except at boundaries, where the length is
/// validated; a ref payload of any other length is considered absent.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hash(String);

impl Hash {
	pub const LEN: usize = 40;

	/// Content address of a byte string.
	pub fn of(data: &[u8]) -> Self {
		let digest = blake3::hash(data);
		Self(hex_encode(&digest.as_bytes()[..Self::LEN / 2]))
	}

	/// A fresh random address, used for check-index identities.
	pub fn random() -> Self {
		let bytes: [u8; 20] = rand::random();
		Self(hex_encode(&bytes))
	}

	/// Parses a boundary string, accepting only 40 hex characters.
	pub fn parse(raw: &str) -> Option<Self> {
		let raw = raw.trim();
		(raw.len() == Self::LEN && raw.bytes().all(|b| b.is_ascii_hexdigit()))
			.then(|| Self(raw.to_ascii_lowercase()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// The two-level sharded object key: `objects/<h[:2]>/<h[2:]>`.
	pub fn object_key(&self) -> String {
		format!("objects/{}/{}", &self.0[..2], &self.0[2..])
	}
}

fn hex_encode(bytes: &[u8]) -> String {
	bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl fmt::Display for Hash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl fmt::Debug for Hash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}
