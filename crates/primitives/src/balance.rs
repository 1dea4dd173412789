use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

/// A confirmed/unconfirmed satoshi pair for some query scope.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    BorshSerialize,
    BorshDeserialize,
    Arbitrary,
    Serialize,
    Deserialize,
)]
pub struct Balance {
    /// Value of outputs spendable right now.
    pub confirmed: u64,

    /// Value including outputs still waiting on a confirmation.
    pub unconfirmed: u64,
}

impl Balance {
    pub fn new(confirmed: u64, unconfirmed: u64) -> Self {
        Self {
            confirmed,
            unconfirmed,
        }
    }
}
