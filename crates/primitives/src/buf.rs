use crate::macros::internal;

/// 20-byte buf, useful for pubkey and script hashes.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Buf20(pub [u8; 20]);

/// 32-byte buf, useful for block hashes, txids and filter headers.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Buf32(pub [u8; 32]);

/// 64-byte buf, useful for signatures.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Buf64(pub [u8; 64]);

internal::impl_buf_common!(Buf20, 20);
internal::impl_buf_common!(Buf32, 32);
internal::impl_buf_common!(Buf64, 64);

internal::impl_buf_serde!(Buf20, 20);
internal::impl_buf_serde!(Buf32, 32);
internal::impl_buf_serde!(Buf64, 64);

impl From<bitcoin::BlockHash> for Buf32 {
    fn from(value: bitcoin::BlockHash) -> Self {
        use bitcoin::hashes::Hash;
        Self(value.to_byte_array())
    }
}

impl From<Buf32> for bitcoin::BlockHash {
    fn from(value: Buf32) -> Self {
        use bitcoin::hashes::Hash;
        bitcoin::BlockHash::from_byte_array(value.0)
    }
}

impl From<bitcoin::Txid> for Buf32 {
    fn from(value: bitcoin::Txid) -> Self {
        use bitcoin::hashes::Hash;
        Self(value.to_byte_array())
    }
}

impl From<Buf32> for bitcoin::Txid {
    fn from(value: Buf32) -> Self {
        use bitcoin::hashes::Hash;
        bitcoin::Txid::from_byte_array(value.0)
    }
}

#[cfg(test)]
mod tests {
    use super::Buf32;

    #[test]
    fn test_buf32_hex_round_trip() {
        let buf: Buf32 = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
            .parse()
            .unwrap();
        assert_eq!(
            format!("{buf:?}"),
            "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
        );
        assert_eq!(format!("{buf}"), "012345..abcdef");
    }

    #[test]
    fn test_buf32_borsh_round_trip() {
        let buf = Buf32::from([7u8; 32]);
        let enc = borsh::to_vec(&buf).unwrap();
        assert_eq!(enc.len(), 32);
        let dec: Buf32 = borsh::from_slice(&enc).unwrap();
        assert_eq!(dec, buf);
    }
}
