//! Completion of pre-signed slashing transactions with an extracted finality provider key.

use std::collections::BTreeMap;

use bitcoin::{OutPoint, Transaction};
use btcstaking_primitives::{
    secp::EvenSecretKey,
    types::{BtcDelegation, SlashingTxKind, StakingParams},
};
use secp256k1::{schnorr, Keypair, Message, SecretKey, XOnlyPublicKey, SECP256K1};
use tracing::debug;

use crate::errors::SlashingError;

/// Builds the fully witnessed slashing transaction of `kind` for `delegation`.
///
/// The covenant adaptor signatures targeted at the finality provider owning `fp_sk` are decrypted
/// with that key, the provider signs for itself, and the delegator's pre-signed signature
/// completes the witness. Exactly `covenant_quorum` covenant signatures are included, as the
/// script requires.
pub fn build_slashing_tx_with_witness(
    fp_sk: &SecretKey,
    delegation: &BtcDelegation,
    params: &StakingParams,
    kind: SlashingTxKind,
) -> Result<Transaction, SlashingError> {
    let fp_sk = EvenSecretKey::from(*fp_sk);
    let fp_pk = fp_sk.xonly();
    let fp_idx = delegation
        .fp_index(&fp_pk)
        .ok_or(SlashingError::UnknownFinalityProvider(fp_pk))?;

    let staking_tx_hash = delegation.staking_tx_hash();
    let (mut tx, prevout, delegator_sig, cov_asigs) = match kind {
        SlashingTxKind::StakingSlashing => (
            delegation.slashing_tx.clone(),
            delegation
                .staking_output()
                .cloned()
                .ok_or(SlashingError::OutputNotSpendable(OutPoint::new(
                    staking_tx_hash,
                    delegation.staking_output_idx,
                )))?,
            delegation.delegator_slashing_sig,
            delegation.covenant_sigs.as_slice(),
        ),
        SlashingTxKind::UnbondingSlashing => {
            let undelegation = delegation
                .undelegation
                .as_ref()
                .ok_or(SlashingError::NotUnbonded(staking_tx_hash))?;
            let prevout = undelegation
                .unbonding_tx
                .output
                .first()
                .cloned()
                .ok_or(SlashingError::NotUnbonded(staking_tx_hash))?;
            (
                undelegation.slashing_tx.clone(),
                prevout,
                undelegation.delegator_slashing_sig,
                undelegation.covenant_slashing_sigs.as_slice(),
            )
        }
    };

    let path = delegation.slashing_path(params);
    let sighash = path.slashing_sighash(&tx, &prevout)?;
    let msg = Message::from_digest(sighash);
    let quorum = params.covenant_quorum as usize;

    let mut covenant_sigs: BTreeMap<XOnlyPublicKey, schnorr::Signature> = BTreeMap::new();
    for asigs in cov_asigs {
        if covenant_sigs.len() == quorum {
            break;
        }

        if !params.covenant_pks.contains(&asigs.cov_pk) {
            debug!(cov_pk = %asigs.cov_pk, "skipping signature of unknown covenant member");
            continue;
        }

        let Some(asig) = asigs.adaptor_sig(fp_idx) else {
            continue;
        };

        let sig = match asig.and_then(|asig| asig.decrypt(&fp_sk)) {
            Ok(sig) => sig,
            Err(e) => {
                debug!(cov_pk = %asigs.cov_pk, %e, "skipping unusable covenant adaptor signature");
                continue;
            }
        };

        if SECP256K1.verify_schnorr(&sig, &msg, &asigs.cov_pk).is_err() {
            debug!(cov_pk = %asigs.cov_pk, "decrypted covenant signature does not verify");
            continue;
        }

        covenant_sigs.insert(asigs.cov_pk, sig);
    }

    if covenant_sigs.len() < quorum {
        return Err(SlashingError::InsufficientCovenantSigs {
            got: covenant_sigs.len(),
            quorum,
        });
    }

    let keypair = Keypair::from_secret_key(SECP256K1, &fp_sk);
    let fp_sig = SECP256K1.sign_schnorr(&msg, &keypair);

    tx.input[0].witness =
        path.slashing_witness(kind, &covenant_sigs, &fp_pk, &fp_sig, &delegator_sig)?;

    Ok(tx)
}
