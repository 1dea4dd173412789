use cinder_primitives::prelude::*;

/// Events published by the sync and wallet components.
#[derive(Clone, Debug, PartialEq)]
pub enum WalletEvent {
    /// A new cfilter tip was committed for a chain.
    FilterTip {
        chain: Chain,
        filter_type: FilterType,
        tip: BlockPosition,
    },

    /// A nym's balance changed.
    BalanceChanged {
        nym: NymId,
        subaccount: Option<SubaccountId>,
        balance: Balance,
    },

    /// A transaction relevant to a nym was recorded.
    NewTransaction {
        nym: NymId,
        txid: Buf32,
        chain: Chain,
    },

    /// A reorg completed; derived state was rewound to the ancestor.
    ReorgDone {
        chain: Chain,
        ancestor: BlockPosition,
    },

    /// Scan progress for one subchain.
    ScanProgress {
        subchain: SubchainIndex,
        position: BlockPosition,
    },
}
