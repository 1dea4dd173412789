//! Wallet engine behavior over a real store: scanning a small chain,
//! confirming matches, funding spend proposals, and reorg rollback.

use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, Block, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use parking_lot::Mutex;

use cinder_db::traits::{OutputStore, SubchainStore};
use cinder_db::types::{ProposalPayment, ProposalRecord, TxoState};
use cinder_download::Shared;
use cinder_filters::{filter_elements, BlockOracle, HeaderOracle};
use cinder_gcs::Gcs;
use cinder_primitives::prelude::*;
use cinder_rocksdb::{test_utils::temp_db, WalletDb};
use cinder_status::{StatusPublisher, WalletEvent};
use cinder_wallet::{
    Bip32KeySource, FilterSource, KeySource, ScannerConfig, ScriptForm, Wallet,
};

fn nym() -> NymId {
    Buf32::from([1; 32])
}

fn subaccount() -> SubaccountId {
    Buf32::from([2; 32])
}

fn external_key(index: u32) -> KeyId {
    KeyId::new(subaccount(), SubchainKind::External, index)
}

/// A tiny in-memory chain the mocks serve from.
struct MockChain {
    positions: Vec<BlockPosition>,
    blocks: HashMap<Buf32, Block>,
    filters: Mutex<HashMap<Buf32, Gcs>>,
}

impl MockChain {
    /// Builds a chain of blocks, each holding the given transactions,
    /// with real block hashes and filters.
    fn new(txs_per_block: Vec<Vec<Transaction>>) -> Self {
        let mut positions = Vec::new();
        let mut blocks = HashMap::new();
        let mut filters = HashMap::new();
        let mut prev = bitcoin::BlockHash::all_zeros();

        for (height, txdata) in txs_per_block.into_iter().enumerate() {
            let block = Block {
                header: bitcoin::block::Header {
                    version: bitcoin::block::Version::TWO,
                    prev_blockhash: prev,
                    merkle_root: bitcoin::TxMerkleNode::all_zeros(),
                    time: height as u32,
                    bits: bitcoin::CompactTarget::from_consensus(0x207fffff),
                    nonce: 0,
                },
                txdata,
            };
            prev = block.block_hash();
            let hash: Buf32 = block.block_hash().into();

            let elements = filter_elements(&block, FilterType::Basic);
            let gcs = Gcs::for_block(FilterType::Basic, &hash, &elements).unwrap();

            positions.push(BlockPosition::new(height as i64, hash));
            blocks.insert(hash, block);
            filters.insert(hash, gcs);
        }

        Self {
            positions,
            blocks,
            filters: Mutex::new(filters),
        }
    }

    fn tip(&self) -> BlockPosition {
        *self.positions.last().unwrap()
    }
}

impl FilterSource for Arc<MockChain> {
    fn filter_tip(&self) -> BlockPosition {
        self.tip()
    }

    fn load_filter(&self, block: &Buf32) -> Option<Gcs> {
        self.filters.lock().get(block).cloned()
    }
}

impl HeaderOracle for Arc<MockChain> {
    fn best_position(&self) -> BlockPosition {
        self.tip()
    }

    fn best_hash(&self, height: Height) -> Option<Buf32> {
        if height < 0 {
            return None;
        }
        self.positions.get(height as usize).map(|p| *p.hash())
    }

    fn best_chain(&self, from: &BlockPosition, limit: usize) -> Vec<BlockPosition> {
        self.positions
            .iter()
            .filter(|p| p.height() > from.height())
            .take(limit)
            .copied()
            .collect()
    }

    fn common_parent(&self, position: &BlockPosition) -> BlockPosition {
        let height = position.height().clamp(0, self.positions.len() as i64 - 1);
        self.positions[height as usize]
    }

    fn genesis_position(&self) -> BlockPosition {
        self.positions[0]
    }
}

impl BlockOracle for Arc<MockChain> {
    fn load_block(&self, hash: &Buf32) -> Shared<Block> {
        Shared::ready(self.blocks.get(hash).expect("mock: block present").clone())
    }

    fn tip(&self) -> BlockPosition {
        MockChain::tip(self)
    }
}

fn coinbase() -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(vec![0x51]),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(5_000_000),
            script_pubkey: ScriptBuf::from_bytes(vec![0x6a]),
        }],
    }
}

fn payment_tx(outputs: Vec<(u64, ScriptBuf)>) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: bitcoin::Txid::from_byte_array([0xfe; 32]),
                vout: 0,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: outputs
            .into_iter()
            .map(|(value, script_pubkey)| TxOut {
                value: Amount::from_sat(value),
                script_pubkey,
            })
            .collect(),
    }
}

struct Fixture {
    wallet: Wallet<WalletDb, Bip32KeySource>,
    chain: Arc<MockChain>,
    db: Arc<WalletDb>,
    keys: Arc<Bip32KeySource>,
}

/// A wallet over a three-block chain whose last block pays key 0.
fn fixture() -> Fixture {
    let keys = Arc::new(Bip32KeySource::from_seed(&[7; 64]));
    keys.ensure_derived(&subaccount(), SubchainKind::External, 2);
    keys.ensure_derived(&subaccount(), SubchainKind::Internal, 0);

    let key0_script = ScriptForm::P2wpkh.script(&keys.pubkey(&external_key(0)).unwrap());
    let chain = Arc::new(MockChain::new(vec![
        vec![coinbase()],
        vec![coinbase()],
        vec![coinbase(), payment_tx(vec![(70_000, key0_script)])],
    ]));

    let db = Arc::new(WalletDb::new(temp_db(), Chain::UnitTest));
    let status = Arc::new(StatusPublisher::new());
    let config = ScannerConfig {
        max_scan: 100,
        scan_threshold: 10,
        post_match_rewind: 5,
    };

    let wallet = Wallet::new(
        nym(),
        Chain::UnitTest,
        db.clone(),
        keys.clone(),
        Arc::new(chain.clone()),
        Arc::new(chain.clone()),
        Arc::new(chain.clone()),
        status,
        config,
        2,
    );

    Fixture {
        wallet,
        chain,
        db,
        keys,
    }
}

#[test]
fn test_scan_confirms_matching_block() {
    let fx = fixture();

    fx.wallet.handle_new_subaccount(&subaccount()).unwrap();
    fx.wallet.handle_new_filter_tip(&fx.chain.tip()).unwrap();

    let balance = fx.wallet.balance().unwrap();
    assert_eq!(balance.confirmed, 70_000);
    assert_eq!(balance.unconfirmed, 70_000);

    let unspent = fx.wallet.outputs(Some(TxoState::ConfirmedNew)).unwrap();
    assert_eq!(unspent.len(), 1);
    assert_eq!(unspent[0].1.position.height(), 2);
    assert_eq!(unspent[0].1.keys, vec![external_key(0)]);

    // The match rewound the scan window below the hit; the follow-up
    // tick re-tested the window (finding the patterns already tested)
    // and caught back up to the tip.
    let external = fx
        .db
        .get_or_create_subchain(&subaccount(), SubchainKind::External, FilterType::Basic)
        .unwrap();
    assert_eq!(fx.db.last_scanned(&external).unwrap().height(), 2);
}

#[test]
fn test_mempool_transaction_is_unconfirmed() {
    let fx = fixture();
    fx.wallet.handle_new_subaccount(&subaccount()).unwrap();
    fx.wallet.handle_new_filter_tip(&fx.chain.tip()).unwrap();

    let key1_script = ScriptForm::P2wpkh.script(&fx.keys.pubkey(&external_key(1)).unwrap());
    let tx = payment_tx(vec![(12_000, key1_script)]);
    assert!(fx.wallet.handle_mempool_tx(&tx).unwrap());

    let balance = fx.wallet.balance().unwrap();
    assert_eq!(balance.confirmed, 70_000);
    assert_eq!(balance.unconfirmed, 82_000);

    // An unrelated transaction is ignored.
    let other = payment_tx(vec![(1, ScriptBuf::from_bytes(vec![0x55]))]);
    assert!(!fx.wallet.handle_mempool_tx(&other).unwrap());
}

#[test]
fn test_reorg_rolls_wallet_back() {
    let fx = fixture();
    fx.wallet.handle_new_subaccount(&subaccount()).unwrap();
    fx.wallet.handle_new_filter_tip(&fx.chain.tip()).unwrap();
    assert_eq!(fx.wallet.balance().unwrap().confirmed, 70_000);

    let ancestor = fx.chain.positions[1];
    fx.wallet.handle_reorg(&ancestor).unwrap();

    assert_eq!(fx.wallet.balance().unwrap(), Balance::default());
    let orphaned = fx.wallet.outputs(Some(TxoState::OrphanedNew)).unwrap();
    assert_eq!(orphaned.len(), 1);

    // Scan progress rewound to the ancestor.
    let external = fx
        .db
        .get_or_create_subchain(&subaccount(), SubchainKind::External, FilterType::Basic)
        .unwrap();
    assert!(fx.db.last_scanned(&external).unwrap().height() <= ancestor.height());

    // A second identical reorg is a no-op.
    fx.wallet.handle_reorg(&ancestor).unwrap();
    assert_eq!(fx.wallet.outputs(Some(TxoState::OrphanedNew)).unwrap().len(), 1);
}

#[test]
fn test_spend_proposal_funding_and_signing() {
    // A chain that pays the wallet nothing, so the only spendable
    // outputs are the three we create by hand.
    let keys = Arc::new(Bip32KeySource::from_seed(&[7; 64]));
    keys.ensure_derived(&subaccount(), SubchainKind::External, 2);
    keys.ensure_derived(&subaccount(), SubchainKind::Internal, 0);
    let chain = Arc::new(MockChain::new(vec![vec![coinbase()], vec![coinbase()]]));
    let db = Arc::new(WalletDb::new(temp_db(), Chain::UnitTest));
    let wallet = Wallet::new(
        nym(),
        Chain::UnitTest,
        db.clone(),
        keys.clone(),
        Arc::new(chain.clone()),
        Arc::new(chain.clone()),
        Arc::new(chain.clone()),
        Arc::new(StatusPublisher::new()),
        ScannerConfig::default(),
        2,
    );
    let fx = Fixture {
        wallet,
        chain,
        db,
        keys,
    };
    fx.wallet.handle_new_subaccount(&subaccount()).unwrap();

    // Hand the wallet three confirmed P2WPKH outputs directly.
    let external = fx
        .db
        .get_or_create_subchain(&subaccount(), SubchainKind::External, FilterType::Basic)
        .unwrap();
    let funding = payment_tx(vec![
        (
            10_000,
            ScriptForm::P2wpkh.script(&fx.keys.pubkey(&external_key(0)).unwrap()),
        ),
        (
            20_000,
            ScriptForm::P2wpkh.script(&fx.keys.pubkey(&external_key(1)).unwrap()),
        ),
        (
            30_000,
            ScriptForm::P2wpkh.script(&fx.keys.pubkey(&external_key(2)).unwrap()),
        ),
    ]);
    let mut matches = cinder_db::types::BatchedMatches::new();
    matches.insert(
        fx.chain.positions[1],
        vec![cinder_db::types::MatchedTransaction {
            tx: funding.clone(),
            matched_outputs: vec![
                (0, external_key(0)),
                (1, external_key(1)),
                (2, external_key(2)),
            ],
        }],
    );
    let mut created = Vec::new();
    let mut consumed = Vec::new();
    fx.db
        .add_confirmed_transactions(
            &nym(),
            &subaccount(),
            &external,
            &matches,
            &mut created,
            &mut consumed,
        )
        .unwrap();
    assert_eq!(created.len(), 3);

    // One 35k payment at 2 sat/vbyte.
    let mut recipient_bytes = vec![0x00, 0x14];
    recipient_bytes.extend([0x99u8; 20]);
    let recipient = ScriptBuf::from_bytes(recipient_bytes);
    let proposal = ProposalRecord {
        id: Buf32::from([0xab; 32]),
        spender: nym(),
        change_subaccount: subaccount(),
        payments: vec![ProposalPayment {
            script: recipient.to_bytes(),
            amount: 35_000,
            contact: None,
        }],
        memo: String::new(),
        expires: 0,
        finished_tx: None,
    };

    let finished = fx.wallet.submit_proposal(proposal.clone()).unwrap();
    assert_eq!(finished.len(), 1);
    let tx = &finished[0];

    // Largest-first selection funds with the 30k and 20k outputs.
    assert_eq!(tx.input.len(), 2);
    let spent_values: u64 = fx
        .db
        .outputs(Some(TxoState::UnconfirmedSpend))
        .unwrap()
        .iter()
        .map(|(_, r)| r.value)
        .sum();
    assert_eq!(spent_values, 50_000);

    // Payment plus a non-dust change output; the difference is the fee.
    assert_eq!(tx.output[0].value.to_sat(), 35_000);
    assert_eq!(tx.output[0].script_pubkey, recipient);
    assert_eq!(tx.output.len(), 2);
    let change = tx.output[1].value.to_sat();
    assert!(change >= Chain::UnitTest.dust_threshold());
    let fee = 50_000 - 35_000 - change;
    assert!(fee > 0 && fee < 1_000, "unexpected fee {fee}");

    // Every input carries a P2WPKH witness (signature + pubkey).
    for input in &tx.input {
        assert_eq!(input.witness.len(), 2);
        assert!(input.script_sig.is_empty());
    }

    // The untouched 10k output is still spendable, and the change is
    // tracked as ours.
    let confirmed = fx.wallet.outputs(Some(TxoState::ConfirmedNew)).unwrap();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].1.value, 10_000);
    let unconfirmed = fx.wallet.outputs(Some(TxoState::UnconfirmedNew)).unwrap();
    assert_eq!(unconfirmed.len(), 1);
    assert_eq!(unconfirmed[0].1.value, change);

    // The stored proposal now carries the finished transaction.
    let stored = cinder_db::traits::ProposalStore::load_proposal(fx.db.as_ref(), &proposal.id)
        .unwrap()
        .unwrap();
    assert!(stored.finished_tx.is_some());
}

#[test]
fn test_multisig_input_gets_skeleton_signature() {
    let keys = Arc::new(Bip32KeySource::from_seed(&[7; 64]));
    keys.ensure_derived(&subaccount(), SubchainKind::External, 0);
    keys.ensure_derived(&subaccount(), SubchainKind::Internal, 0);
    let chain = Arc::new(MockChain::new(vec![vec![coinbase()], vec![coinbase()]]));
    let db = Arc::new(WalletDb::new(temp_db(), Chain::UnitTest));
    let wallet = Wallet::new(
        nym(),
        Chain::UnitTest,
        db.clone(),
        keys.clone(),
        Arc::new(chain.clone()),
        Arc::new(chain.clone()),
        Arc::new(chain.clone()),
        Arc::new(StatusPublisher::new()),
        ScannerConfig::default(),
        2,
    );
    wallet.handle_new_subaccount(&subaccount()).unwrap();

    // One confirmed one-of-one multisig output owned by key 0.
    let external = db
        .get_or_create_subchain(&subaccount(), SubchainKind::External, FilterType::Basic)
        .unwrap();
    let multisig = ScriptForm::Multisig.script(&keys.pubkey(&external_key(0)).unwrap());
    let funding = payment_tx(vec![(80_000, multisig)]);
    let mut matches = cinder_db::types::BatchedMatches::new();
    matches.insert(
        chain.positions[1],
        vec![cinder_db::types::MatchedTransaction {
            tx: funding.clone(),
            matched_outputs: vec![(0, external_key(0))],
        }],
    );
    let mut created = Vec::new();
    let mut consumed = Vec::new();
    db.add_confirmed_transactions(
        &nym(),
        &subaccount(),
        &external,
        &matches,
        &mut created,
        &mut consumed,
    )
    .unwrap();

    let mut recipient_bytes = vec![0x00, 0x14];
    recipient_bytes.extend([0x77u8; 20]);
    let proposal = ProposalRecord {
        id: Buf32::from([0xad; 32]),
        spender: nym(),
        change_subaccount: subaccount(),
        payments: vec![ProposalPayment {
            script: recipient_bytes,
            amount: 40_000,
            contact: None,
        }],
        memo: String::new(),
        expires: 0,
        finished_tx: None,
    };

    let finished = wallet.submit_proposal(proposal).unwrap();
    assert_eq!(finished.len(), 1);
    let tx = &finished[0];

    // A bare multisig input carries a legacy signature stack: the
    // CHECKMULTISIG dummy (empty push) plus our DER signature.
    assert_eq!(tx.input.len(), 1);
    let script_sig = tx.input[0].script_sig.as_bytes();
    assert!(tx.input[0].witness.is_empty());
    assert_eq!(script_sig[0], 0x00);
    assert!(script_sig.len() > 70);
}

#[test]
fn test_unfundable_proposal_reports_and_releases() {
    let fx = fixture();
    fx.wallet.handle_new_subaccount(&subaccount()).unwrap();
    fx.wallet.handle_new_filter_tip(&fx.chain.tip()).unwrap();

    // Ask for far more than the wallet holds.
    let proposal = ProposalRecord {
        id: Buf32::from([0xac; 32]),
        spender: nym(),
        change_subaccount: subaccount(),
        payments: vec![ProposalPayment {
            script: vec![0x00, 0x14, 0x01],
            amount: 10_000_000,
            contact: None,
        }],
        memo: String::new(),
        expires: 0,
        finished_tx: None,
    };

    let finished = fx.wallet.submit_proposal(proposal.clone()).unwrap();
    assert!(finished.is_empty());

    // The reservation was rolled back and the proposal stays pending
    // for a retry.
    assert!(fx
        .wallet
        .outputs(Some(TxoState::Reserved))
        .unwrap()
        .is_empty());
    assert!(fx.wallet.proposals().pending().contains(&proposal.id));
}

#[test]
fn test_status_events_published() {
    let keys = Arc::new(Bip32KeySource::from_seed(&[7; 64]));
    keys.ensure_derived(&subaccount(), SubchainKind::External, 0);

    let key0_script = ScriptForm::P2wpkh.script(&keys.pubkey(&external_key(0)).unwrap());
    let chain = Arc::new(MockChain::new(vec![
        vec![coinbase()],
        vec![coinbase(), payment_tx(vec![(5_000, key0_script)])],
    ]));

    let db = Arc::new(WalletDb::new(temp_db(), Chain::UnitTest));
    let status = Arc::new(StatusPublisher::new());
    let mut events = status.subscribe();

    let wallet = Wallet::new(
        nym(),
        Chain::UnitTest,
        db,
        keys,
        Arc::new(chain.clone()),
        Arc::new(chain.clone()),
        Arc::new(chain.clone()),
        status,
        ScannerConfig::default(),
        1,
    );

    wallet.handle_new_subaccount(&subaccount()).unwrap();
    wallet.handle_new_filter_tip(&chain.tip()).unwrap();

    let mut saw_tx = false;
    let mut saw_balance = false;
    let mut saw_progress = false;
    while let Ok(event) = events.try_recv() {
        match event {
            WalletEvent::NewTransaction { nym: n, .. } => {
                assert_eq!(n, nym());
                saw_tx = true;
            }
            WalletEvent::BalanceChanged { balance, .. } => {
                saw_balance |= balance.confirmed == 5_000;
            }
            WalletEvent::ScanProgress { .. } => saw_progress = true,
            _ => {}
        }
    }
    assert!(saw_tx);
    assert!(saw_balance);
    assert!(saw_progress);
}
