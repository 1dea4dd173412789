//! Wallet addressing identifiers.
//!
//! A wallet is partitioned into nyms, each nym owns subaccounts, and each
//! subaccount derives keys along several subchains.  Database tables are
//! keyed by a digest over the subchain coordinates so that renames and
//! version bumps never collide with existing rows.

use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::buf::Buf32;
use crate::filter::FilterType;
use crate::hash;

/// Identifier of a wallet owner.
pub type NymId = Buf32;

/// Identifier of one HD or payment-code subaccount under a nym.
pub type SubaccountId = Buf32;

/// BIP-32 child index within a subchain.
pub type ChildIndex = u32;

/// One addressing dimension of a subaccount.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    IntoPrimitive,
    TryFromPrimitive,
    BorshSerialize,
    BorshDeserialize,
    Arbitrary,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum SubchainKind {
    Internal = 0,
    External = 1,
    Incoming = 2,
    Outgoing = 3,
    Notification = 4,
}

/// Primary key for all subchain-scoped database tables.
///
/// Deterministic digest over the subchain coordinates; see the module
/// docs for why this is hashed rather than concatenated.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    Arbitrary,
    Serialize,
    Deserialize,
)]
pub struct SubchainIndex(Buf32);

impl SubchainIndex {
    pub const VERSION: u32 = 1;

    pub fn derive(
        subaccount: &SubaccountId,
        kind: SubchainKind,
        filter_type: FilterType,
        version: u32,
    ) -> Self {
        let preimage = (subaccount, u8::from(kind), u8::from(filter_type), version);
        Self(hash::compute_borsh_hash(&preimage))
    }

    pub fn as_buf(&self) -> &Buf32 {
        &self.0
    }
}

/// Identifier for one pattern batch, a digest over the subchain index and
/// the BIP-32 child index the patterns were derived from.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    Arbitrary,
    Serialize,
    Deserialize,
)]
pub struct PatternId(Buf32);

impl PatternId {
    pub fn derive(subchain: &SubchainIndex, index: ChildIndex) -> Self {
        Self(hash::compute_borsh_hash(&(subchain, index)))
    }

    pub fn as_buf(&self) -> &Buf32 {
        &self.0
    }
}

/// Fully qualified key coordinates, enough for the keystore to rederive
/// the corresponding keypair.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    Arbitrary,
    Serialize,
    Deserialize,
)]
pub struct KeyId {
    pub subaccount: SubaccountId,
    pub kind: SubchainKind,
    pub index: ChildIndex,
}

impl KeyId {
    pub fn new(subaccount: SubaccountId, kind: SubchainKind, index: ChildIndex) -> Self {
        Self {
            subaccount,
            kind,
            index,
        }
    }
}
