//! Key derivation and the script forms a wallet key can appear as.

use std::collections::HashMap;

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::hashes::Hash;
use bitcoin::script::Builder;
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{CompressedPublicKey, NetworkKind, PrivateKey, ScriptBuf};
use parking_lot::RwLock;

use cinder_primitives::filter::FilterType;
use cinder_primitives::keys::{ChildIndex, KeyId, SubaccountId, SubchainKind};

/// Keystore view the scanners and the spend builder consume.
pub trait KeySource: Send + Sync + 'static {
    /// Highest derived child index for a subchain, if any key exists.
    fn last_derived(&self, subaccount: &SubaccountId, kind: SubchainKind) -> Option<ChildIndex>;

    fn pubkey(&self, key: &KeyId) -> Option<CompressedPublicKey>;

    fn privkey(&self, key: &KeyId) -> Option<PrivateKey>;

    /// Derives one more key on the subchain and returns its id, used
    /// for fresh change outputs.
    fn derive_next(&self, subaccount: &SubaccountId, kind: SubchainKind) -> KeyId;
}

/// The script shapes we index and can sign for.
///
/// `Multisig` is a signing-only shape: we contribute our signature to a
/// bare CHECKMULTISIG output, cosigners fill the remaining slots.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ScriptForm {
    P2pk,
    P2pkh,
    P2wpkh,
    P2shP2wpkh,
    Multisig,
}

impl ScriptForm {
    /// The single-key forms indexed per derived key.
    pub const ALL: [ScriptForm; 4] = [Self::P2pk, Self::P2pkh, Self::P2wpkh, Self::P2shP2wpkh];

    /// The scriptPubKey this form gives the key.  For `Multisig` this
    /// is the one-of-one skeleton; larger quorums carry the cosigner
    /// keys the keystore does not derive.
    pub fn script(&self, pubkey: &CompressedPublicKey) -> ScriptBuf {
        match self {
            Self::P2pk => Builder::new()
                .push_slice(pubkey.to_bytes())
                .push_opcode(bitcoin::opcodes::all::OP_CHECKSIG)
                .into_script(),
            Self::P2pkh => ScriptBuf::new_p2pkh(&bitcoin::PublicKey::from(*pubkey).pubkey_hash()),
            Self::P2wpkh => ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash()),
            Self::P2shP2wpkh => {
                let redeem = ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash());
                ScriptBuf::new_p2sh(&redeem.script_hash())
            }
            Self::Multisig => Builder::new()
                .push_opcode(bitcoin::opcodes::all::OP_PUSHNUM_1)
                .push_slice(pubkey.to_bytes())
                .push_opcode(bitcoin::opcodes::all::OP_PUSHNUM_1)
                .push_opcode(bitcoin::opcodes::all::OP_CHECKMULTISIG)
                .into_script(),
        }
    }

    /// Identifies the form of a scriptPubKey we own.
    pub fn classify(script: &[u8]) -> Option<ScriptForm> {
        match script {
            [0x00, 0x14, ..] if script.len() == 22 => Some(Self::P2wpkh),
            [0x76, 0xa9, 0x14, ..] if script.len() == 25 => Some(Self::P2pkh),
            [0xa9, 0x14, ..] if script.len() == 23 => Some(Self::P2shP2wpkh),
            [0x21, ..] if script.len() == 35 && script[34] == 0xac => Some(Self::P2pk),
            // Bare m-of-n: OP_m ... OP_n OP_CHECKMULTISIG.
            [first, .., 0xae] if (0x51..=0x60).contains(first) => Some(Self::Multisig),
            _ => None,
        }
    }
}

/// Every scriptPubKey the key can appear as on chain.
pub fn key_scripts(pubkey: &CompressedPublicKey) -> Vec<(ScriptForm, ScriptBuf)> {
    ScriptForm::ALL
        .iter()
        .map(|form| (*form, form.script(pubkey)))
        .collect()
}

/// The cfilter probe elements for one key under a filter type.
///
/// The basic filter commits to whole scriptPubKeys; the extended types
/// commit to the raw key material as well.
pub fn key_filter_elements(pubkey: &CompressedPublicKey, filter_type: FilterType) -> Vec<Vec<u8>> {
    let mut out: Vec<Vec<u8>> = key_scripts(pubkey)
        .into_iter()
        .map(|(_, script)| script.to_bytes())
        .collect();

    if filter_type == FilterType::Es {
        out.push(pubkey.to_bytes().to_vec());
        out.push(
            bitcoin::PublicKey::from(*pubkey)
                .pubkey_hash()
                .to_byte_array()
                .to_vec(),
        );
    }

    out
}

/// BIP-32 backed key source: one account node per (subaccount, kind),
/// children derived non-hardened below it.
pub struct Bip32KeySource {
    secp: Secp256k1<All>,
    master: Xpriv,
    derived: RwLock<HashMap<(SubaccountId, SubchainKind), ChildIndex>>,
}

impl Bip32KeySource {
    pub fn new(master: Xpriv) -> Self {
        Self {
            secp: Secp256k1::new(),
            master,
            derived: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_seed(seed: &[u8]) -> Self {
        let master =
            Xpriv::new_master(NetworkKind::Test, seed).expect("keys: master from seed");
        Self::new(master)
    }

    /// Marks keys up to `index` as derived for a subchain, the way an
    /// external keystore would after a lookahead top-up.
    pub fn ensure_derived(&self, subaccount: &SubaccountId, kind: SubchainKind, index: ChildIndex) {
        let mut derived = self.derived.write();
        let entry = derived.entry((*subaccount, kind)).or_insert(index);
        *entry = (*entry).max(index);
    }

    fn child_xpriv(&self, subaccount: &SubaccountId, kind: SubchainKind, index: u32) -> Xpriv {
        // The subaccount contributes a non-hardened path segment so
        // distinct subaccounts derive disjoint trees.
        let account = u32::from_le_bytes(
            subaccount.as_slice()[..4]
                .try_into()
                .expect("keys: id prefix"),
        ) & 0x7fff_ffff;

        let path = DerivationPath::from(vec![
            ChildNumber::from_normal_idx(account).expect("keys: account segment"),
            ChildNumber::from_normal_idx(u8::from(kind) as u32).expect("keys: kind segment"),
            ChildNumber::from_normal_idx(index).expect("keys: child segment"),
        ]);

        self.master
            .derive_priv(&self.secp, &path)
            .expect("keys: derive child")
    }
}

impl KeySource for Bip32KeySource {
    fn last_derived(&self, subaccount: &SubaccountId, kind: SubchainKind) -> Option<ChildIndex> {
        self.derived.read().get(&(*subaccount, kind)).copied()
    }

    fn pubkey(&self, key: &KeyId) -> Option<CompressedPublicKey> {
        let xpriv = self.child_xpriv(&key.subaccount, key.kind, key.index);
        let private = xpriv.to_priv();
        CompressedPublicKey::from_private_key(&self.secp, &private).ok()
    }

    fn privkey(&self, key: &KeyId) -> Option<PrivateKey> {
        Some(self.child_xpriv(&key.subaccount, key.kind, key.index).to_priv())
    }

    fn derive_next(&self, subaccount: &SubaccountId, kind: SubchainKind) -> KeyId {
        let mut derived = self.derived.write();
        let next = derived
            .get(&(*subaccount, kind))
            .map(|last| last + 1)
            .unwrap_or(0);
        derived.insert((*subaccount, kind), next);
        KeyId::new(*subaccount, kind, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_primitives::buf::Buf32;

    fn source() -> Bip32KeySource {
        Bip32KeySource::from_seed(&[0x42; 64])
    }

    fn subaccount() -> SubaccountId {
        Buf32::from([3; 32])
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = source();
        let b = source();
        let key = KeyId::new(subaccount(), SubchainKind::External, 7);
        assert_eq!(a.pubkey(&key), b.pubkey(&key));
        assert_ne!(
            a.pubkey(&key),
            a.pubkey(&KeyId::new(subaccount(), SubchainKind::External, 8))
        );
        assert_ne!(
            a.pubkey(&key),
            a.pubkey(&KeyId::new(subaccount(), SubchainKind::Internal, 7))
        );
    }

    #[test]
    fn test_script_forms_classify_back() {
        let src = source();
        let key = KeyId::new(subaccount(), SubchainKind::External, 0);
        let pubkey = src.pubkey(&key).unwrap();

        for (form, script) in key_scripts(&pubkey) {
            assert_eq!(ScriptForm::classify(&script.to_bytes()), Some(form));
        }
    }

    #[test]
    fn test_multisig_classification() {
        let src = source();
        let key = KeyId::new(subaccount(), SubchainKind::External, 0);
        let pubkey = src.pubkey(&key).unwrap();

        // The one-of-one skeleton we can produce ourselves.
        let skeleton = ScriptForm::Multisig.script(&pubkey);
        assert_eq!(
            ScriptForm::classify(&skeleton.to_bytes()),
            Some(ScriptForm::Multisig)
        );

        // A two-of-three shape somebody else built around our key.
        let other = src
            .pubkey(&KeyId::new(subaccount(), SubchainKind::External, 1))
            .unwrap();
        let third = src
            .pubkey(&KeyId::new(subaccount(), SubchainKind::External, 2))
            .unwrap();
        let two_of_three = Builder::new()
            .push_opcode(bitcoin::opcodes::all::OP_PUSHNUM_2)
            .push_slice(pubkey.to_bytes())
            .push_slice(other.to_bytes())
            .push_slice(third.to_bytes())
            .push_opcode(bitcoin::opcodes::all::OP_PUSHNUM_3)
            .push_opcode(bitcoin::opcodes::all::OP_CHECKMULTISIG)
            .into_script();
        assert_eq!(
            ScriptForm::classify(&two_of_three.to_bytes()),
            Some(ScriptForm::Multisig)
        );

        assert_eq!(ScriptForm::classify(&[0x6a, 0x01, 0x02]), None);
    }

    #[test]
    fn test_filter_elements_by_type() {
        let src = source();
        let key = KeyId::new(subaccount(), SubchainKind::External, 0);
        let pubkey = src.pubkey(&key).unwrap();

        assert_eq!(key_filter_elements(&pubkey, FilterType::Basic).len(), 4);
        assert_eq!(key_filter_elements(&pubkey, FilterType::Es).len(), 6);
    }

    #[test]
    fn test_derive_next_advances() {
        let src = source();
        assert_eq!(
            src.last_derived(&subaccount(), SubchainKind::Internal),
            None
        );
        let first = src.derive_next(&subaccount(), SubchainKind::Internal);
        assert_eq!(first.index, 0);
        let second = src.derive_next(&subaccount(), SubchainKind::Internal);
        assert_eq!(second.index, 1);
        assert_eq!(
            src.last_derived(&subaccount(), SubchainKind::Internal),
            Some(1)
        );
    }
}
