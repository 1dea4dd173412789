//! Builds and signs one transaction for a spend proposal.

use bitcoin::absolute::LockTime;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, EcdsaSighashType, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use thiserror::Error;
use tracing::*;

use cinder_db::traits::WalletDatabase;
use cinder_db::types::{OutputRecord, ProposalRecord, SpendPolicy};
use cinder_primitives::prelude::*;

use crate::keys::{KeySource, ScriptForm};

#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("insufficient funds: need {required}, reservable {reserved}")]
    InsufficientFunds { required: u64, reserved: u64 },

    #[error("invalid recipient output: {0}")]
    InvalidRecipient(String),

    #[error("cannot sign input {0}: {1}")]
    SigningFailed(usize, String),

    #[error("transaction is not funded yet")]
    NotFunded,

    #[error("db: {0}")]
    Db(#[from] cinder_db::DbError),
}

/// Weight contribution of one input, by script form (vbytes).
fn input_vsize(form: Option<ScriptForm>) -> u64 {
    match form {
        Some(ScriptForm::P2wpkh) => 68,
        Some(ScriptForm::P2shP2wpkh) => 91,
        Some(ScriptForm::P2pk) => 114,
        _ => 148,
    }
}

/// Drives one proposal through output creation, funding, change, and
/// signing.  Abandoning the builder at any point releases every
/// reserved output.
pub struct TransactionBuilder<'a, D, K> {
    db: &'a D,
    keys: &'a K,
    chain: Chain,
    proposal: &'a ProposalRecord,
    fee_rate: u64,
    inputs: Vec<(Outpoint, OutputRecord)>,
    outputs: Vec<TxOut>,
    change: Option<(KeyId, ScriptBuf)>,
    secp: Secp256k1<All>,
}

impl<'a, D: WalletDatabase, K: KeySource> TransactionBuilder<'a, D, K> {
    pub fn new(
        db: &'a D,
        keys: &'a K,
        chain: Chain,
        proposal: &'a ProposalRecord,
        fee_rate: u64,
    ) -> Self {
        Self {
            db,
            keys,
            chain,
            proposal,
            fee_rate,
            inputs: Vec::new(),
            outputs: Vec::new(),
            change: None,
            secp: Secp256k1::new(),
        }
    }

    pub fn spender(&self) -> &NymId {
        &self.proposal.spender
    }

    /// Synthesises one output per requested payment.
    pub fn create_outputs(&mut self) -> Result<(), BuilderError> {
        for payment in &self.proposal.payments {
            if payment.script.is_empty() {
                return Err(BuilderError::InvalidRecipient("empty script".into()));
            }
            if payment.amount == 0 {
                return Err(BuilderError::InvalidRecipient("zero amount".into()));
            }
            self.outputs.push(TxOut {
                value: Amount::from_sat(payment.amount),
                script_pubkey: ScriptBuf::from_bytes(payment.script.clone()),
            });
        }
        Ok(())
    }

    fn input_total(&self) -> u64 {
        self.inputs.iter().map(|(_, record)| record.value).sum()
    }

    fn output_total(&self) -> u64 {
        self.outputs.iter().map(|o| o.value.to_sat()).sum()
    }

    /// Fee at the current shape, optionally with a change output
    /// added.
    fn fee(&self, with_change: bool) -> u64 {
        let mut vsize = 10u64;
        for (_, record) in &self.inputs {
            vsize += input_vsize(ScriptForm::classify(&record.script));
        }
        for output in &self.outputs {
            vsize += 9 + output.script_pubkey.len() as u64;
        }
        if with_change {
            // Change is always P2WPKH.
            vsize += 31;
        }
        vsize * self.fee_rate
    }

    pub fn is_funded(&self) -> bool {
        self.input_total() >= self.output_total() + self.fee(false)
    }

    /// Reserves outputs until the transaction is funded.  On
    /// exhaustion every reservation is released and the proposal fails
    /// with `InsufficientFunds`.
    pub fn add_inputs(&mut self, policy: &SpendPolicy) -> Result<(), BuilderError> {
        while !self.is_funded() {
            match self
                .db
                .reserve_utxo(&self.proposal.spender, &self.proposal.id, policy)?
            {
                Some((outpoint, record)) => {
                    trace!(%outpoint, value = record.value, "reserved input");
                    self.inputs.push((outpoint, record));
                }
                None => {
                    let required = self.output_total() + self.fee(false);
                    let reserved = self.input_total();
                    self.release()?;
                    return Err(BuilderError::InsufficientFunds { required, reserved });
                }
            }
        }
        Ok(())
    }

    /// Adds a change output for the excess, unless it would be dust,
    /// in which case the excess stays with the fee.
    pub fn add_change(&mut self) -> Result<(), BuilderError> {
        if !self.is_funded() {
            return Err(BuilderError::NotFunded);
        }

        let excess = self.input_total() - self.output_total() - self.fee(true);
        if excess < self.chain.dust_threshold() {
            return Ok(());
        }

        let key = self
            .keys
            .derive_next(&self.proposal.change_subaccount, SubchainKind::Internal);
        let pubkey = self.keys.pubkey(&key).ok_or_else(|| {
            BuilderError::SigningFailed(usize::MAX, "change key not derivable".into())
        })?;
        let script = ScriptForm::P2wpkh.script(&pubkey);

        debug!(value = excess, "adding change output");
        self.outputs.push(TxOut {
            value: Amount::from_sat(excess),
            script_pubkey: script.clone(),
        });
        self.change = Some((key, script));
        Ok(())
    }

    /// Output indices holding change, with their keys.
    pub fn change_keys(&self) -> Vec<(u32, KeyId)> {
        match &self.change {
            Some((key, script)) => self
                .outputs
                .iter()
                .enumerate()
                .filter(|(_, o)| o.script_pubkey == *script)
                .map(|(i, _)| (i as u32, *key))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Assembles and signs the final transaction.
    pub fn finalize(&self) -> Result<Transaction, BuilderError> {
        if !self.is_funded() {
            return Err(BuilderError::NotFunded);
        }

        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: self
                .inputs
                .iter()
                .map(|(outpoint, _)| TxIn {
                    previous_output: (*outpoint).into(),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
                .collect(),
            output: self.outputs.clone(),
        };

        self.sign_inputs(&mut tx)?;
        Ok(tx)
    }

    /// Returns every reserved output to the spendable pool.
    pub fn release(&self) -> Result<(), BuilderError> {
        self.db.release_proposal(&self.proposal.id)?;
        Ok(())
    }

    fn sign_inputs(&self, tx: &mut Transaction) -> Result<(), BuilderError> {
        let unsigned = tx.clone();
        let mut cache = SighashCache::new(&unsigned);

        for (index, (_, record)) in self.inputs.iter().enumerate() {
            let form = ScriptForm::classify(&record.script);
            let key = *record.keys.first().ok_or_else(|| {
                BuilderError::SigningFailed(index, "output has no key attribution".into())
            })?;
            let private = self.keys.privkey(&key).ok_or_else(|| {
                BuilderError::SigningFailed(index, "signing key not derivable".into())
            })?;
            let pubkey = self.keys.pubkey(&key).ok_or_else(|| {
                BuilderError::SigningFailed(index, "pubkey not derivable".into())
            })?;
            let script = ScriptBuf::from_bytes(record.script.clone());

            match form {
                Some(ScriptForm::P2wpkh) => {
                    let sighash = cache
                        .p2wpkh_signature_hash(
                            index,
                            &script,
                            Amount::from_sat(record.value),
                            EcdsaSighashType::All,
                        )
                        .map_err(|e| BuilderError::SigningFailed(index, e.to_string()))?;
                    let signature = self.ecdsa_sign(sighash.as_ref(), &private);
                    tx.input[index].witness = Witness::p2wpkh(&signature, &pubkey.0);
                }
                Some(ScriptForm::P2shP2wpkh) => {
                    let redeem = ScriptForm::P2wpkh.script(&pubkey);
                    let sighash = cache
                        .p2wpkh_signature_hash(
                            index,
                            &redeem,
                            Amount::from_sat(record.value),
                            EcdsaSighashType::All,
                        )
                        .map_err(|e| BuilderError::SigningFailed(index, e.to_string()))?;
                    let signature = self.ecdsa_sign(sighash.as_ref(), &private);
                    tx.input[index].witness = Witness::p2wpkh(&signature, &pubkey.0);

                    let redeem_push = PushBytesBuf::try_from(redeem.to_bytes())
                        .map_err(|e| BuilderError::SigningFailed(index, e.to_string()))?;
                    tx.input[index].script_sig =
                        Builder::new().push_slice(redeem_push).into_script();
                }
                Some(ScriptForm::P2pkh) => {
                    let sighash = cache
                        .legacy_signature_hash(index, &script, EcdsaSighashType::All.to_u32())
                        .map_err(|e| BuilderError::SigningFailed(index, e.to_string()))?;
                    let signature = self.ecdsa_sign(sighash.as_ref(), &private);
                    tx.input[index].script_sig = Builder::new()
                        .push_slice(signature.serialize())
                        .push_slice(pubkey.to_bytes())
                        .into_script();
                }
                Some(ScriptForm::P2pk) => {
                    let sighash = cache
                        .legacy_signature_hash(index, &script, EcdsaSighashType::All.to_u32())
                        .map_err(|e| BuilderError::SigningFailed(index, e.to_string()))?;
                    let signature = self.ecdsa_sign(sighash.as_ref(), &private);
                    tx.input[index].script_sig =
                        Builder::new().push_slice(signature.serialize()).into_script();
                }
                Some(ScriptForm::Multisig) => {
                    let sighash = cache
                        .legacy_signature_hash(index, &script, EcdsaSighashType::All.to_u32())
                        .map_err(|e| BuilderError::SigningFailed(index, e.to_string()))?;
                    let signature = self.ecdsa_sign(sighash.as_ref(), &private);
                    // CHECKMULTISIG consumes one extra stack element;
                    // the empty push fills it and cosigners append
                    // their signatures after ours.
                    tx.input[index].script_sig = Builder::new()
                        .push_opcode(bitcoin::opcodes::OP_0)
                        .push_slice(signature.serialize())
                        .into_script();
                }
                None => {
                    return Err(BuilderError::SigningFailed(
                        index,
                        "unsupported previous output script".into(),
                    ));
                }
            }
        }

        Ok(())
    }

    fn ecdsa_sign(&self, digest: &[u8], private: &bitcoin::PrivateKey) -> bitcoin::ecdsa::Signature {
        let digest: [u8; 32] = digest.try_into().expect("spend: sighash digest width");
        let message = Message::from_digest(digest);
        bitcoin::ecdsa::Signature {
            signature: self.secp.sign_ecdsa(&message, &private.inner),
            sighash_type: EcdsaSighashType::All,
        }
    }
}

