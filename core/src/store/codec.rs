use std::io;

/// Compression level used for every blob this crate writes. Matches what the
/// backup tooling expects when it decodes repository objects out-of-band.
const LEVEL: i32 = 3;

pub fn compress(data: &[u8]) -> Result<Vec<u8>, io::Error> {
	zstd::stream::encode_all(data, LEVEL)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, io::Error> {
	zstd::stream::decode_all(data)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_roundtrip() {
		let data = b"some repository object payload".repeat(64);
		let packed = compress(&data).unwrap();
		assert!(packed.len() < data.len());
		assert_eq!(decompress(&packed).unwrap(), data);
	}
}
