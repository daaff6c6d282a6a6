use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::deserialize_hex;
use bitcoin::psbt::Psbt;
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, Network, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::derivation::ExtendedPublicKey;
use crate::error::WalletError;
use crate::storage::Utxo;
use crate::wallet::context::{ChainSource, Discovery, WalletContext};

/// Outputs below this are rejected as dust
pub const DUST_LIMIT: u64 = 546;
/// Locktime enabled, replace-by-fee disabled
pub const PAYOUT_SEQUENCE: Sequence = Sequence::ENABLE_LOCKTIME_NO_RBF;

const NON_SEGWIT_INPUT_VSIZE: f64 = 180.0;
const SEGWIT_INPUT_VSIZE: f64 = 68.5;
const OUTPUT_VSIZE: f64 = 34.0;
const TX_OVERHEAD_VSIZE: f64 = 10.0;

/// One payout destination
#[derive(Debug, Clone)]
pub struct PayoutRecipient {
    pub address: Address,
    pub percentage: f64,
}

/// Unsigned payout ready for an external signer
#[derive(Debug, Clone)]
pub struct UnsignedPayout {
    pub psbt: Psbt,
    pub total_input: u64,
    pub unconfirmed_inputs: bool,
    /// Estimated fee in sat
    pub fee: u64,
}

impl UnsignedPayout {
    pub fn psbt_hex(&self) -> String {
        self.psbt.serialize_hex()
    }
}

/// Estimated virtual size of a payout transaction
pub fn estimate_vsize(non_segwit_inputs: usize, segwit_inputs: usize, outputs: usize) -> f64 {
    NON_SEGWIT_INPUT_VSIZE * non_segwit_inputs as f64
        + SEGWIT_INPUT_VSIZE * segwit_inputs as f64
        + OUTPUT_VSIZE * outputs as f64
        + TX_OVERHEAD_VSIZE
}

/// Split `total` by percentage, each output carrying its share of `fee`
pub fn allocate_outputs(total: u64, fee: f64, percentages: &[f64]) -> Result<Vec<u64>, WalletError> {
    percentages
        .iter()
        .map(|pct| {
            let share = pct / 100.0;
            let value = (total as f64 * share - fee * share).floor();
            if value < DUST_LIMIT as f64 {
                return Err(WalletError::InsufficientFunds(format!(
                    "Output for {}% would be {} sat, below the dust limit",
                    pct, value
                )));
            }
            Ok(value as u64)
        })
        .collect()
}

fn is_segwit_script(script_hex: &str) -> bool {
    script_hex.starts_with("0014") || script_hex.starts_with("0020")
}

pub struct TransactionBuilder {
    network: Network,
    source: Arc<dyn ChainSource>,
}

impl TransactionBuilder {
    pub fn new(network: Network, source: Arc<dyn ChainSource>) -> Self {
        Self { network, source }
    }

    /// Scan the wallet from scratch and spend every UTXO to `recipients`
    pub async fn build(
        &self,
        key: &ExtendedPublicKey,
        recipients: &[PayoutRecipient],
        valid_from: DateTime<Utc>,
        fee_rate: f64,
    ) -> Result<UnsignedPayout, WalletError> {
        log::info!("Constructing wallet state for payout");
        let mut context = WalletContext::new(key.clone(), Arc::clone(&self.source), self.network);
        context.initialize(Discovery::FullScan).await?;

        let utxos: Vec<Utxo> = context
            .funded_derivations()
            .into_iter()
            .flat_map(|d| d.utxos.iter().cloned())
            .collect();

        let locktime = u32::try_from(valid_from.timestamp())
            .map_err(|_| WalletError::invalid("Validity date is invalid"))?;
        build_payout(&utxos, recipients, locktime, fee_rate)
    }
}

/// Assemble the unsigned payout from an explicit UTXO set
pub fn build_payout(
    utxos: &[Utxo],
    recipients: &[PayoutRecipient],
    locktime: u32,
    fee_rate: f64,
) -> Result<UnsignedPayout, WalletError> {
    if utxos.is_empty() {
        return Err(WalletError::InsufficientFunds("Wallet has no spendable outputs".to_string()));
    }
    if recipients.is_empty() {
        return Err(WalletError::invalid("Distribution has no recipients"));
    }
    if !fee_rate.is_finite() || fee_rate <= 0.0 {
        return Err(WalletError::invalid("Transaction fee is invalid"));
    }
    let lock_time = LockTime::from_time(locktime)
        .map_err(|e| WalletError::invalid(format!("Validity date is invalid: {}", e)))?;

    let mut inputs = Vec::with_capacity(utxos.len());
    let mut previous = Vec::with_capacity(utxos.len());
    let mut total_input = 0u64;
    let mut segwit = 0usize;
    let mut unconfirmed_inputs = false;

    for utxo in utxos {
        let prev_tx: Transaction = deserialize_hex(&utxo.raw_tx_hex)
            .map_err(|e| WalletError::Bitcoin(format!("Invalid transaction {}: {}", utxo.tx_hash, e)))?;
        if is_segwit_script(&utxo.script_pubkey) {
            segwit += 1;
        }
        if !utxo.is_confirmed() {
            unconfirmed_inputs = true;
        }
        total_input += utxo.value;

        inputs.push(TxIn {
            previous_output: utxo.outpoint()?,
            script_sig: ScriptBuf::new(),
            sequence: PAYOUT_SEQUENCE,
            witness: Witness::new(),
        });
        previous.push(prev_tx);
    }

    let vsize = estimate_vsize(utxos.len() - segwit, segwit, recipients.len());
    let fee = vsize * fee_rate;
    let percentages: Vec<f64> = recipients.iter().map(|r| r.percentage).collect();
    let values = allocate_outputs(total_input, fee, &percentages)?;

    let output: Vec<TxOut> = recipients
        .iter()
        .zip(values.iter())
        .map(|(recipient, value)| TxOut {
            value: Amount::from_sat(*value),
            script_pubkey: recipient.address.script_pubkey(),
        })
        .collect();
    let total_output: u64 = values.iter().sum();

    let unsigned = Transaction {
        version: Version::TWO,
        lock_time,
        input: inputs,
        output,
    };
    let mut psbt = Psbt::from_unsigned_tx(unsigned)
        .map_err(|e| WalletError::Bitcoin(format!("Failed to create PSBT: {}", e)))?;
    for (input, prev_tx) in psbt.inputs.iter_mut().zip(previous) {
        input.non_witness_utxo = Some(prev_tx);
    }

    log::info!(
        "Built payout: {} inputs, {} outputs, {} sat in, fee ~{} sat",
        utxos.len(),
        recipients.len(),
        total_input,
        total_input - total_output
    );

    Ok(UnsignedPayout {
        psbt,
        total_input,
        unconfirmed_inputs,
        fee: total_input - total_output,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bitcoin::consensus::encode::serialize_hex;
    use bitcoin::hashes::Hash;
    use bitcoin::{absolute, OutPoint, Txid};

    /// Confirmed UTXO paying `value` to `script`
    pub(crate) fn utxo_for(script: &ScriptBuf, value: u64, seed: u8) -> Utxo {
        let tx = Transaction {
            version: Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array([seed; 32]), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: script.clone(),
            }],
        };
        Utxo {
            tx_hash: tx.compute_txid().to_string(),
            output_index: 0,
            value,
            block_height: 100,
            script_pubkey: hex::encode(script.as_bytes()),
            raw_tx_hex: serialize_hex(&tx),
        }
    }

    fn recipient(seed: u8, percentage: f64) -> PayoutRecipient {
        let script = ScriptBuf::new_p2wsh(&bitcoin::WScriptHash::from_byte_array([seed; 32]));
        PayoutRecipient {
            address: Address::from_script(&script, Network::Regtest).unwrap(),
            percentage,
        }
    }

    fn p2wpkh_script() -> ScriptBuf {
        let mut bytes = vec![0x00, 0x14];
        bytes.extend_from_slice(&[7u8; 20]);
        ScriptBuf::from_bytes(bytes)
    }

    const LOCKTIME: u32 = 1_900_000_000;

    #[test]
    fn test_even_split_shares_fee() {
        let values = allocate_outputs(100_000, 1_000.0, &[50.0, 50.0]).unwrap();
        assert_eq!(values, vec![49_500, 49_500]);
    }

    #[test]
    fn test_uneven_split_rounds_down() {
        let values = allocate_outputs(100_001, 1_000.0, &[25.0, 75.0]).unwrap();
        assert_eq!(values, vec![24_750, 74_250]);
        let spent: u64 = values.iter().sum::<u64>() + 1_000;
        assert!(100_001 - spent <= 2);
    }

    #[test]
    fn test_dust_output_rejected() {
        let result = allocate_outputs(2_000, 500.0, &[80.0, 20.0]);
        assert!(matches!(result, Err(WalletError::InsufficientFunds(_))));
    }

    #[test]
    fn test_vsize_estimate() {
        assert_eq!(estimate_vsize(1, 2, 2), 180.0 + 137.0 + 68.0 + 10.0);
    }

    #[test]
    fn test_build_payout_shape() {
        let script = p2wpkh_script();
        let mut utxos = vec![utxo_for(&script, 60_000, 1), utxo_for(&script, 40_000, 2)];
        utxos[1].block_height = 0;
        let recipients = vec![recipient(1, 50.0), recipient(2, 50.0)];

        let payout = build_payout(&utxos, &recipients, LOCKTIME, 2.0).unwrap();
        let tx = &payout.psbt.unsigned_tx;

        assert_eq!(tx.version, Version::TWO);
        assert_eq!(tx.lock_time.to_consensus_u32(), LOCKTIME);
        assert!(tx.input.iter().all(|i| i.sequence.to_consensus_u32() == 0xfffffffe));
        assert_eq!(tx.output.len(), 2);
        assert_eq!(payout.total_input, 100_000);
        assert!(payout.unconfirmed_inputs);
        assert!(payout.psbt.inputs.iter().all(|i| i.non_witness_utxo.is_some()));

        // 2 segwit inputs, 2 outputs: 215 vB at 2 sat/vB
        let expected_each = (50_000.0f64 - 215.0).floor() as u64;
        assert_eq!(tx.output[0].value.to_sat(), expected_each);
        assert_eq!(payout.fee, 100_000 - 2 * expected_each);
    }

    #[test]
    fn test_build_payout_rejects_bad_inputs() {
        let script = p2wpkh_script();
        let recipients = vec![recipient(1, 100.0)];

        let empty = build_payout(&[], &recipients, LOCKTIME, 1.0);
        assert!(matches!(empty, Err(WalletError::InsufficientFunds(_))));

        let utxos = vec![utxo_for(&script, 10_000, 1)];
        let block_height_lock = build_payout(&utxos, &recipients, 800_000, 1.0);
        assert!(matches!(block_height_lock, Err(WalletError::Validation(_))));

        let zero_fee = build_payout(&utxos, &recipients, LOCKTIME, 0.0);
        assert!(matches!(zero_fee, Err(WalletError::Validation(_))));
    }
}
