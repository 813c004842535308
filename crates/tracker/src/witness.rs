//! Analysis of slashing transactions found on Bitcoin.
//!
//! A transaction spending the slashing leaf of a staking or unbonding output carries this witness:
//!
//! ```text
//! <cov sig n-1> ... <cov sig 0> <fp sig m-1> ... <fp sig 0> <delegator sig> <script> <control block>
//! ```
//!
//! Keys are taken in sorted order and their slots appear in reverse, as the script consumes the
//! stack from the top. Covenant members that did not sign and finality providers other than the
//! one slashed leave an empty element.
//!
//! Every revealed covenant signature is the decryption of an adaptor signature encrypted under the
//! slashed finality provider's key, so together with the adaptor signature it reveals that key.

use std::collections::BTreeMap;

use bitcoin::{OutPoint, ScriptBuf, Transaction, TxOut, Txid, Witness};
use btcstaking_primitives::{
    constants::SCHNORR_SIGNATURE_SIZE,
    scripts::{sort_keys, SlashingPath},
    secp::EvenSecretKey,
    types::{CovenantAdaptorSignatures, SlashingTxKind},
};
use secp256k1::{schnorr, Message, XOnlyPublicKey, SECP256K1};
use tracing::{debug, warn};

use crate::errors::FormatError;

/// The signatures revealed by a slashing witness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSlashingWitness {
    /// Revealed covenant signatures keyed by covenant member.
    pub covenant_sigs: BTreeMap<XOnlyPublicKey, schnorr::Signature>,

    /// The finality provider that signed.
    pub fp_pk: XOnlyPublicKey,

    /// The finality provider's signature.
    pub fp_sig: schnorr::Signature,

    /// The delegator's signature.
    pub delegator_sig: schnorr::Signature,

    /// The leaf script.
    pub script: ScriptBuf,

    /// The serialized control block.
    pub control_block: Vec<u8>,
}

fn parse_sig_slot(elem: &[u8], index: usize) -> Result<Option<schnorr::Signature>, FormatError> {
    match elem.len() {
        0 => Ok(None),
        SCHNORR_SIGNATURE_SIZE => schnorr::Signature::from_slice(elem)
            .map(Some)
            .map_err(|_| FormatError::InvalidSignature { index }),
        _ => Err(FormatError::InvalidSignature { index }),
    }
}

/// Parses the witness of a slashing-leaf spend against the given covenant committee and finality
/// provider set.
///
/// Only the shape and the encodings are checked here; signatures are verified by
/// [`SlashingTxInfo::classify`].
pub fn parse_slashing_tx_witness(
    witness: &Witness,
    covenant_pks: &[XOnlyPublicKey],
    fp_pks: &[XOnlyPublicKey],
) -> Result<ParsedSlashingWitness, FormatError> {
    let mut covenant_pks = covenant_pks.to_vec();
    sort_keys(&mut covenant_pks);
    let mut fp_pks = fp_pks.to_vec();
    sort_keys(&mut fp_pks);

    let expected = covenant_pks.len() + fp_pks.len() + 3;
    if witness.len() != expected {
        return Err(FormatError::WitnessLength {
            expected,
            got: witness.len(),
        });
    }

    let elems: Vec<&[u8]> = witness.iter().collect();

    let mut covenant_sigs = BTreeMap::new();
    for (index, pk) in covenant_pks.iter().rev().enumerate() {
        if let Some(sig) = parse_sig_slot(elems[index], index)? {
            covenant_sigs.insert(*pk, sig);
        }
    }

    let offset = covenant_pks.len();
    let mut fp_sigs = Vec::new();
    for (i, pk) in fp_pks.iter().rev().enumerate() {
        let index = offset + i;
        if let Some(sig) = parse_sig_slot(elems[index], index)? {
            fp_sigs.push((*pk, sig));
        }
    }

    let [(fp_pk, fp_sig)] = fp_sigs.as_slice() else {
        return Err(FormatError::FpSignatureCount(fp_sigs.len()));
    };

    let index = offset + fp_pks.len();
    let delegator_sig =
        parse_sig_slot(elems[index], index)?.ok_or(FormatError::InvalidSignature { index })?;

    Ok(ParsedSlashingWitness {
        covenant_sigs,
        fp_pk: *fp_pk,
        fp_sig: *fp_sig,
        delegator_sig,
        script: ScriptBuf::from_bytes(elems[index + 1].to_vec()),
        control_block: elems[index + 2].to_vec(),
    })
}

/// Recovers the secret key of the finality provider at `fp_idx` from the covenant signatures
/// revealed in a slashing witness.
///
/// For every covenant member with a revealed signature, the adaptor signature it produced for the
/// finality provider at delegation time is combined with the revealed one. A share only counts if
/// the key it yields belongs to `fp_pk`. The key is returned once at least `quorum` shares agree
/// on it; anything less, or any disagreement, yields `None`.
pub fn try_extract_fp_sk(
    cov_sig_map: &BTreeMap<XOnlyPublicKey, schnorr::Signature>,
    fp_idx: usize,
    fp_pk: &XOnlyPublicKey,
    cov_asig_lists: &[CovenantAdaptorSignatures],
    quorum: usize,
) -> Option<EvenSecretKey> {
    let mut recovered: Option<EvenSecretKey> = None;
    let mut shares = 0;

    for asigs in cov_asig_lists {
        let Some(sig) = cov_sig_map.get(&asigs.cov_pk) else {
            continue;
        };

        let asig = match asigs.adaptor_sig(fp_idx) {
            Some(Ok(asig)) => asig,
            Some(Err(e)) => {
                debug!(cov_pk = %asigs.cov_pk, %e, "skipping malformed covenant adaptor signature");
                continue;
            }
            None => continue,
        };

        let sk = match asig.extract(sig, fp_pk) {
            Ok(sk) => sk,
            Err(e) => {
                debug!(cov_pk = %asigs.cov_pk, %e, "covenant share does not reveal the key");
                continue;
            }
        };

        match recovered {
            None => recovered = Some(sk),
            Some(prev) if prev == sk => {}
            Some(_) => {
                warn!(%fp_pk, "covenant shares disagree on the finality provider key");
                return None;
            }
        }
        shares += 1;
    }

    match shares >= quorum.max(1) {
        true => recovered,
        false => {
            debug!(%fp_pk, %shares, %quorum, "not enough covenant shares to recover the key");
            None
        }
    }
}

/// A Bitcoin transaction that is a candidate slashing tx of a tracked delegation.
#[derive(Debug, Clone)]
pub struct SlashingTxInfo {
    /// Which pre-signed slashing tx the candidate is.
    pub kind: SlashingTxKind,

    /// The delegation it would slash.
    pub staking_tx_hash: Txid,

    /// The candidate transaction.
    pub tx: Transaction,

    path: SlashingPath,
    funding_outpoint: OutPoint,
    funding_output: TxOut,
}

impl SlashingTxInfo {
    /// Wraps a candidate that should spend `funding_outpoint` via `path`.
    pub fn new(
        kind: SlashingTxKind,
        path: SlashingPath,
        staking_tx_hash: Txid,
        funding_outpoint: OutPoint,
        funding_output: TxOut,
        tx: Transaction,
    ) -> Self {
        Self {
            kind,
            staking_tx_hash,
            tx,
            path,
            funding_outpoint,
            funding_output,
        }
    }

    /// The slashing path the candidate is checked against.
    pub fn path(&self) -> &SlashingPath {
        &self.path
    }

    /// Checks that the candidate is a valid slashing-leaf spend of the tracked output and returns
    /// the revealed signatures.
    pub fn classify(&self) -> Result<ParsedSlashingWitness, FormatError> {
        let [input] = self.tx.input.as_slice() else {
            return Err(FormatError::InputCount(self.tx.input.len()));
        };

        if input.previous_output != self.funding_outpoint {
            return Err(FormatError::UnexpectedPrevout {
                expected: self.funding_outpoint,
                got: input.previous_output,
            });
        }

        let parsed =
            parse_slashing_tx_witness(&input.witness, &self.path.covenant_pks, &self.path.fp_pks)?;

        if parsed.script != self.path.slashing_script()? {
            return Err(FormatError::ScriptMismatch);
        }

        if parsed.control_block != self.path.slashing_control_block(self.kind)?.serialize() {
            return Err(FormatError::ControlBlockMismatch);
        }

        let quorum = self.path.covenant_quorum as usize;
        if parsed.covenant_sigs.len() < quorum {
            return Err(FormatError::CovenantQuorum {
                got: parsed.covenant_sigs.len(),
                quorum,
            });
        }

        let sighash = self.path.slashing_sighash(&self.tx, &self.funding_output)?;
        let msg = Message::from_digest(sighash);
        let verify = |sig: &schnorr::Signature, pk: &XOnlyPublicKey| {
            SECP256K1
                .verify_schnorr(sig, &msg, pk)
                .map_err(|_| FormatError::SignatureMismatch(*pk))
        };

        verify(&parsed.delegator_sig, &self.path.staker_pk)?;
        verify(&parsed.fp_sig, &parsed.fp_pk)?;
        for (cov_pk, sig) in &parsed.covenant_sigs {
            verify(sig, cov_pk)?;
        }

        Ok(parsed)
    }

    /// Whether the candidate is a valid slashing spend of the delegation's tracked output.
    pub fn is_slash_staking_tx(&self) -> bool {
        self.classify().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use btcstaking_test_utils::{
        bitcoin::{generate_secret_keys, generate_signature},
        staking::{CovenantCommittee, DelegationFixture},
    };
    use proptest::prelude::*;

    use super::*;
    use crate::index::TrackedDelegation;

    const KINDS: [SlashingTxKind; 2] = [
        SlashingTxKind::StakingSlashing,
        SlashingTxKind::UnbondingSlashing,
    ];

    fn setup(num_fps: usize) -> (DelegationFixture, TrackedDelegation) {
        let committee = CovenantCommittee::new(3, 2);
        let fixture = DelegationFixture::new(&committee, generate_secret_keys(num_fps), true);
        let tracked = TrackedDelegation::new(fixture.delegation.clone(), &committee.params);
        (fixture, tracked)
    }

    fn with_witness(tx: &Transaction, elems: Vec<Vec<u8>>) -> Transaction {
        let mut tx = tx.clone();
        tx.input[0].witness = Witness::from_slice(&elems);
        tx
    }

    #[test]
    fn completed_slashing_tx_is_recognized() {
        let (fixture, tracked) = setup(2);

        for kind in KINDS {
            for fp_idx in 0..2 {
                let tx = fixture.selectively_slashed_tx(fp_idx, kind);
                let info = tracked.slashing_tx_info(kind, tx).unwrap();

                assert!(info.is_slash_staking_tx(), "{kind:?} by fp {fp_idx}");
                assert_eq!(info.staking_tx_hash, tracked.staking_tx_hash());
            }
        }
    }

    #[test]
    fn staking_slashing_tx_does_not_classify_as_unbonding() {
        let (fixture, tracked) = setup(1);
        let tx = fixture.selectively_slashed_tx(0, SlashingTxKind::StakingSlashing);
        let info = tracked
            .slashing_tx_info(SlashingTxKind::UnbondingSlashing, tx)
            .unwrap();

        assert!(matches!(
            info.classify(),
            Err(FormatError::UnexpectedPrevout { .. })
        ));
    }

    #[test]
    fn recovers_the_slashed_fp_key() {
        let (fixture, tracked) = setup(2);

        for kind in KINDS {
            let tx = fixture.selectively_slashed_tx(1, kind);
            let parsed = tracked.slashing_tx_info(kind, tx).unwrap().classify().unwrap();
            let fp_idx = tracked.delegation.fp_index(&parsed.fp_pk).unwrap();
            assert_eq!(fp_idx, 1);

            let sk = try_extract_fp_sk(
                &parsed.covenant_sigs,
                fp_idx,
                &parsed.fp_pk,
                tracked.covenant_sigs(kind).unwrap(),
                2,
            )
            .expect("a quorum of shares must reveal the key");

            assert_eq!(*sk, *EvenSecretKey::from(fixture.fp_sks[1]));
        }
    }

    #[test]
    fn unrelated_signatures_reveal_nothing() {
        let (fixture, tracked) = setup(1);
        let fp_pk = tracked.delegation.fp_btc_pk_list[0];
        let cov_sigs = tracked.covenant_sigs(SlashingTxKind::StakingSlashing).unwrap();
        let random_sigs = fixture
            .committee
            .params
            .covenant_pks
            .iter()
            .map(|pk| (*pk, generate_signature()))
            .collect();

        assert!(try_extract_fp_sk(&random_sigs, 0, &fp_pk, cov_sigs, 1).is_none());
    }

    #[test]
    fn fewer_shares_than_quorum_reveal_nothing() {
        let (fixture, tracked) = setup(1);
        let tx = fixture.selectively_slashed_tx(0, SlashingTxKind::StakingSlashing);
        let parsed = tracked
            .slashing_tx_info(SlashingTxKind::StakingSlashing, tx)
            .unwrap()
            .classify()
            .unwrap();
        let cov_sigs = tracked.covenant_sigs(SlashingTxKind::StakingSlashing).unwrap();

        // the witness reveals exactly the quorum of 2
        assert!(try_extract_fp_sk(&parsed.covenant_sigs, 0, &parsed.fp_pk, cov_sigs, 3).is_none());
        assert!(try_extract_fp_sk(&parsed.covenant_sigs, 0, &parsed.fp_pk, cov_sigs, 2).is_some());
    }

    #[test]
    fn malformed_witnesses_are_rejected() {
        let (fixture, tracked) = setup(1);
        let kind = SlashingTxKind::StakingSlashing;
        let tx = fixture.selectively_slashed_tx(0, kind);
        let elems: Vec<Vec<u8>> = tx.input[0].witness.iter().map(<[u8]>::to_vec).collect();
        let classify = |elems: Vec<Vec<u8>>| {
            tracked
                .slashing_tx_info(kind, with_witness(&tx, elems))
                .unwrap()
                .classify()
        };

        let mut extra = elems.clone();
        extra.insert(0, vec![]);
        assert!(matches!(
            classify(extra),
            Err(FormatError::WitnessLength { .. })
        ));

        let signed_slot = elems.iter().position(|e| !e.is_empty()).unwrap();
        let mut truncated = elems.clone();
        truncated[signed_slot].pop();
        assert_eq!(
            classify(truncated),
            Err(FormatError::InvalidSignature { index: signed_slot })
        );

        let empty_slot = elems.iter().position(Vec::is_empty).unwrap();
        let mut swapped = elems.clone();
        swapped.swap(signed_slot, empty_slot);
        assert!(classify(swapped).is_err());

        // fp slot emptied
        let mut no_fp = elems.clone();
        no_fp[3] = vec![];
        assert_eq!(classify(no_fp), Err(FormatError::FpSignatureCount(0)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn any_flipped_byte_breaks_classification(elem_seed in any::<usize>(), byte_seed in any::<usize>()) {
            let (fixture, tracked) = setup(1);
            let kind = SlashingTxKind::StakingSlashing;
            let tx = fixture.selectively_slashed_tx(0, kind);
            let mut elems: Vec<Vec<u8>> = tx.input[0].witness.iter().map(<[u8]>::to_vec).collect();

            let non_empty: Vec<usize> = (0..elems.len()).filter(|i| !elems[*i].is_empty()).collect();
            let elem = non_empty[elem_seed % non_empty.len()];
            let byte = byte_seed % elems[elem].len();
            elems[elem][byte] ^= 0x01;

            let info = tracked.slashing_tx_info(kind, with_witness(&tx, elems)).unwrap();
            prop_assert!(!info.is_slash_staking_tx());
        }
    }
}
