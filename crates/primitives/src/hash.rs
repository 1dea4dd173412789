//! Common wrapper around whatever we choose our native hash function to be.

use bitcoin::hashes::Hash;
use borsh::BorshSerialize;
use sha2::{Digest, Sha256};

use crate::buf::Buf32;

/// Direct untagged hash.
pub fn raw(buf: &[u8]) -> Buf32 {
    Buf32::from(<[u8; 32]>::from(Sha256::digest(buf)))
}

/// Hashes the borsh encoding of the value without materializing it.
pub fn compute_borsh_hash<T: BorshSerialize>(v: &T) -> Buf32 {
    let mut hasher = Sha256::new();
    v.serialize(&mut hasher).expect("hash: borsh serialize");
    let arr: [u8; 32] = hasher.finalize().into();
    Buf32::from(arr)
}

/// Computes a Bitcoin-style double-SHA-256.
pub fn sha256d(buf: &[u8]) -> Buf32 {
    let h = bitcoin::hashes::sha256d::Hash::hash(buf);
    h.to_byte_array().into()
}

/// Computes a double-SHA-256 over the concatenation of two 32-byte
/// values, the combining step of the cfheader chain.
pub fn sha256d_pair(a: &Buf32, b: &Buf32) -> Buf32 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(a.as_slice());
    buf[32..].copy_from_slice(b.as_slice());
    sha256d(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256d_empty() {
        // Well-known double-SHA-256 of the empty string.
        let expect: Buf32 = "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
            .parse()
            .unwrap();
        assert_eq!(sha256d(&[]), expect);
    }

    #[test]
    fn test_sha256d_pair_is_concatenation() {
        let a = Buf32::from([1; 32]);
        let b = Buf32::from([2; 32]);
        let mut cat = [0u8; 64];
        cat[..32].copy_from_slice(a.as_slice());
        cat[32..].copy_from_slice(b.as_slice());
        assert_eq!(sha256d_pair(&a, &b), sha256d(&cat));
    }
}
