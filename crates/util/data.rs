//! Content hashing. The hash function is fixed to SHA-512, hex-encoded,
//! for this release; `Config::hash` is kept for forward compatibility
//! but is not otherwise consulted.
use sha2::{Digest, Sha512};

/// Hex-encoded SHA-512 digest of a block's bytes.
pub fn hash_block(data: &[u8]) -> String {
	let mut hasher = Sha512::new();
	hasher.update(data);
	hex::encode(hasher.finalize())
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn hash_is_stable() {
		let a = hash_block(b"hello world");
		let b = hash_block(b"hello world");
		assert_eq!(a, b);
		assert_ne!(a, hash_block(b"hello worlD"));
	}

	#[test]
	fn empty_block_has_well_known_hash() {
		// sha512("") per RFC test vectors
		assert_eq!(
			hash_block(b""),
			"cf83e1357eefb8bdf1542850d66d8007d620e4050b5715dc83f4a921d36ce9ce47d0d13c5d85f2b0ff8318d2877eec2f63b931bd47417a81a538327af927da3"
		);
	}
}
