use bitcoin::consensus::encode::deserialize_hex;
use bitcoin::psbt::Psbt;
use bitcoin::Transaction;

use crate::error::WalletError;

/// Signed payout that matched its unsigned template
#[derive(Debug, Clone)]
pub struct ValidatedPayout {
    pub transaction: Transaction,
    pub total_input: u64,
    pub locktime: u32,
}

pub fn parse_psbt(psbt_hex: &str) -> Result<Psbt, WalletError> {
    let bytes = hex::decode(psbt_hex.trim())
        .map_err(|e| WalletError::invalid(format!("Unsigned transaction is invalid: {}", e)))?;
    Psbt::deserialize(&bytes).map_err(|e| WalletError::invalid(format!("Unsigned transaction is invalid: {}", e)))
}

pub fn parse_signed(signed_hex: &str) -> Result<Transaction, WalletError> {
    deserialize_hex(signed_hex.trim())
        .map_err(|e| WalletError::invalid(format!("Error parsing signed transaction: {}", e)))
}

/// Check a signed transaction against the unsigned PSBT it was built from
///
/// Signatures are not verified; only the fields that fix who gets paid, how
/// much, and from when.
pub fn validate_signed(signed: &Transaction, psbt: &Psbt) -> Result<ValidatedPayout, WalletError> {
    let template = &psbt.unsigned_tx;

    if signed.version != template.version {
        return Err(mismatch("version"));
    }
    if signed.lock_time != template.lock_time {
        return Err(mismatch("locktime"));
    }
    if signed.input.len() != template.input.len() {
        return Err(mismatch("input count"));
    }
    for (i, (ours, theirs)) in template.input.iter().zip(&signed.input).enumerate() {
        if ours.previous_output != theirs.previous_output || ours.sequence != theirs.sequence {
            return Err(mismatch(&format!("input {}", i)));
        }
    }
    if signed.output.len() != template.output.len() {
        return Err(mismatch("output count"));
    }
    for (i, (ours, theirs)) in template.output.iter().zip(&signed.output).enumerate() {
        if ours.value != theirs.value || ours.script_pubkey != theirs.script_pubkey {
            return Err(mismatch(&format!("output {}", i)));
        }
    }

    let mut total_input = 0u64;
    for (i, (txin, input)) in template.input.iter().zip(&psbt.inputs).enumerate() {
        let vout = txin.previous_output.vout as usize;
        let value = match (&input.witness_utxo, &input.non_witness_utxo) {
            (_, Some(prev)) => prev.output.get(vout).map(|o| o.value),
            (Some(out), None) => Some(out.value),
            (None, None) => None,
        }
        .ok_or_else(|| WalletError::Bitcoin(format!("Input {} is missing its previous output", i)))?;
        total_input += value.to_sat();
    }

    Ok(ValidatedPayout {
        transaction: signed.clone(),
        total_input,
        locktime: signed.lock_time.to_consensus_u32(),
    })
}

fn mismatch(field: &str) -> WalletError {
    WalletError::invalid(format!("Signed transaction does not match unsigned {}", field))
}
