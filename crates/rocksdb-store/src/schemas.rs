//! Table definitions for the wallet and filter stores.

use std::collections::BTreeSet;

use borsh::{BorshDeserialize, BorshSerialize};
use rockbound::Schema;

use cinder_db::types::{OutputRecord, ProposalRecord, TxoState};
use cinder_primitives::prelude::*;

/// Declares one column family whose key and value both use their borsh
/// encodings, which is true of every table in this store.
macro_rules! define_borsh_table {
    ($(#[$docs:meta])+ ($table:ident) $key:ty => $value:ty) => {
        $(#[$docs])+
        ///
        #[doc = concat!("Keyed by [`", stringify!($key), "`], holding [`", stringify!($value), "`].")]
        #[derive(Clone, Copy, Debug, Default)]
        pub(crate) struct $table;

        impl ::rockbound::schema::Schema for $table {
            const COLUMN_FAMILY_NAME: &'static str = ::core::stringify!($table);
            type Key = $key;
            type Value = $value;
        }

        impl ::rockbound::schema::KeyEncoder<$table> for $key {
            fn encode_key(&self) -> Result<Vec<u8>, ::rockbound::CodecError> {
                ::borsh::to_vec(self).map_err(Into::into)
            }
        }

        impl ::rockbound::schema::KeyDecoder<$table> for $key {
            fn decode_key(data: &[u8]) -> Result<Self, ::rockbound::CodecError> {
                ::borsh::BorshDeserialize::deserialize_reader(&mut &data[..]).map_err(Into::into)
            }
        }

        impl ::rockbound::schema::ValueCodec<$table> for $value {
            fn encode_value(&self) -> Result<Vec<u8>, ::rockbound::CodecError> {
                ::borsh::to_vec(self).map_err(Into::into)
            }

            fn decode_value(data: &[u8]) -> Result<Self, ::rockbound::CodecError> {
                ::borsh::BorshDeserialize::deserialize_reader(&mut &data[..]).map_err(Into::into)
            }
        }
    };
}

/// Decoded form of one subchain id row.
#[derive(Clone, Debug, Eq, PartialEq, BorshSerialize, BorshDeserialize)]
pub struct SubchainIdRecord {
    pub subaccount: SubaccountId,
    pub kind: SubchainKind,
    pub filter_type: FilterType,
    pub version: u32,
}

/// One stored pattern element with the child index it derives from.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, BorshSerialize, BorshDeserialize)]
pub struct PatternEntry {
    pub index: ChildIndex,
    pub element: Vec<u8>,
}

// Subchain tables.

define_borsh_table!(
    /// Maps a subchain index to the coordinates it digests
    (SubchainIdSchema) SubchainIndex => SubchainIdRecord
);

define_borsh_table!(
    /// Highest BIP-32 child index whose patterns are stored
    (LastIndexedSchema) SubchainIndex => ChildIndex
);

define_borsh_table!(
    /// Highest position the scanner has tested
    (LastScannedSchema) SubchainIndex => BlockPosition
);

define_borsh_table!(
    /// Pattern ids belonging to a subchain
    (PatternIndexSchema) SubchainIndex => BTreeSet<PatternId>
);

define_borsh_table!(
    /// Pattern elements by pattern id
    (PatternsSchema) PatternId => BTreeSet<PatternEntry>
);

define_borsh_table!(
    /// Patterns already exactly tested against a block
    (MatchIndexSchema) Buf32 => BTreeSet<PatternId>
);

// Output tables.

define_borsh_table!(
    /// Primary UTXO table
    (OutputSchema) Outpoint => OutputRecord
);

define_borsh_table!(
    /// Outpoints by state
    (StateIndexSchema) TxoState => BTreeSet<Outpoint>
);

define_borsh_table!(
    /// Outpoints by owning nym
    (NymIndexSchema) NymId => BTreeSet<Outpoint>
);

define_borsh_table!(
    /// Outpoints by (nym, subaccount)
    (AccountIndexSchema) (NymId, SubaccountId) => BTreeSet<Outpoint>
);

define_borsh_table!(
    /// Outpoints by owning key
    (KeyIndexSchema) KeyId => BTreeSet<Outpoint>
);

define_borsh_table!(
    /// Outpoints by creating or consuming txid
    (TxidIndexSchema) Buf32 => BTreeSet<Outpoint>
);

define_borsh_table!(
    /// Contact ids by script pattern hash
    (ContactIndexSchema) Buf32 => BTreeSet<Buf32>
);

define_borsh_table!(
    /// Singleton wallet-wide markers (see [`crate::output::WALLET_POSITION_KEY`])
    (WalletStateSchema) u8 => BlockPosition
);

// Proposal tables.

define_borsh_table!(
    /// Pending spend proposals
    (ProposalSchema) Buf32 => ProposalRecord
);

define_borsh_table!(
    /// Proposals whose transaction has confirmed
    (CompletedProposalSchema) Buf32 => ()
);

// Filter tables.

define_borsh_table!(
    /// cfheader by (filter type, block hash)
    (FilterHeaderSchema) (FilterType, Buf32) => Buf32
);

define_borsh_table!(
    /// Encoded cfilter by (filter type, block hash)
    (FilterSchema) (FilterType, Buf32) => Vec<u8>
);

define_borsh_table!(
    /// Best position with a stored cfheader, per filter type
    (HeaderTipSchema) FilterType => BlockPosition
);

define_borsh_table!(
    /// Best position with a stored cfilter, per filter type
    (FilterTipSchema) FilterType => BlockPosition
);

/// Column families every store instance opens.
pub(crate) const STORE_COLUMN_FAMILIES: &[&str] = &[
    SubchainIdSchema::COLUMN_FAMILY_NAME,
    LastIndexedSchema::COLUMN_FAMILY_NAME,
    LastScannedSchema::COLUMN_FAMILY_NAME,
    PatternIndexSchema::COLUMN_FAMILY_NAME,
    PatternsSchema::COLUMN_FAMILY_NAME,
    MatchIndexSchema::COLUMN_FAMILY_NAME,
    OutputSchema::COLUMN_FAMILY_NAME,
    StateIndexSchema::COLUMN_FAMILY_NAME,
    NymIndexSchema::COLUMN_FAMILY_NAME,
    AccountIndexSchema::COLUMN_FAMILY_NAME,
    KeyIndexSchema::COLUMN_FAMILY_NAME,
    TxidIndexSchema::COLUMN_FAMILY_NAME,
    ContactIndexSchema::COLUMN_FAMILY_NAME,
    WalletStateSchema::COLUMN_FAMILY_NAME,
    ProposalSchema::COLUMN_FAMILY_NAME,
    CompletedProposalSchema::COLUMN_FAMILY_NAME,
    FilterHeaderSchema::COLUMN_FAMILY_NAME,
    FilterSchema::COLUMN_FAMILY_NAME,
    HeaderTipSchema::COLUMN_FAMILY_NAME,
    FilterTipSchema::COLUMN_FAMILY_NAME,
];
