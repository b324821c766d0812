use super::NetworkClient;
use crate::config::EngineConfig;
use crate::error::{FlipstakeError, Result};
use crate::escrow::{address_for_secret, parse_address, secret_key_from};
use crate::types::{ChainTransaction, EntropyToken, Transfer, TxOutput};
use crate::vault::EscrowSecret;
use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use esplora_client::AsyncClient;
use std::str::FromStr;
use tracing::{debug, info, warn};

const FEE_TARGET_BLOCKS: u16 = 6;
const MIN_FEE_RATE: f64 = 1.0;

// P2WPKH vsize estimate
const TX_OVERHEAD_VBYTES: u64 = 11;
const INPUT_VBYTES: u64 = 68;
const OUTPUT_VBYTES: u64 = 31;

struct Utxo {
    outpoint: OutPoint,
    value: Amount,
}

/// Bitcoin binding backed by an Esplora HTTP API.
pub struct EsploraNetwork {
    client: AsyncClient,
    network: Network,
    finality_depth: u32,
    dust_limit: Amount,
}

impl EsploraNetwork {
    /// Client for one endpoint; the rest of `config` sets network rules.
    pub fn new(url: &str, config: &EngineConfig) -> Result<Self> {
        let client = esplora_client::Builder::new(url)
            .build_async()
            .map_err(|e| {
                FlipstakeError::esplora(format!("Failed to create esplora client: {}", e))
            })?;

        Ok(Self {
            client,
            network: config.network,
            finality_depth: config.finality_depth,
            dust_limit: config.dust_limit,
        })
    }

    async fn tip_height(&self) -> Result<u32> {
        self.client
            .get_height()
            .await
            .map_err(|e| FlipstakeError::chain_unavailable(format!("Failed to get tip: {}", e)))
    }

    /// Unspent outputs paying `script`, fetched fresh for every call.
    async fn list_utxos(&self, script: &ScriptBuf) -> Result<Vec<Utxo>> {
        let txs = self
            .client
            .scripthash_txs(script, None)
            .await
            .map_err(|e| FlipstakeError::esplora(format!("Failed to get transactions: {}", e)))?;

        let mut utxos = Vec::new();
        for tx in txs {
            for (vout, output) in tx.vout.iter().enumerate() {
                if output.scriptpubkey != *script {
                    continue;
                }
                let status = self
                    .client
                    .get_output_status(&tx.txid, vout as u64)
                    .await
                    .map_err(|e| {
                        FlipstakeError::esplora(format!("Failed to get output status: {}", e))
                    })?;
                if status.map(|s| s.spent).unwrap_or(false) {
                    continue;
                }
                utxos.push(Utxo {
                    outpoint: OutPoint::new(tx.txid, vout as u32),
                    value: Amount::from_sat(output.value),
                });
            }
        }

        Ok(utxos)
    }

    async fn fee_for(&self, inputs: usize, outputs: usize) -> Result<Amount> {
        let estimates = self
            .client
            .get_fee_estimates()
            .await
            .map_err(|e| FlipstakeError::esplora(format!("Failed to get fee estimates: {}", e)))?;

        let rate = estimates
            .get(&FEE_TARGET_BLOCKS)
            .copied()
            .unwrap_or(MIN_FEE_RATE)
            .max(MIN_FEE_RATE);
        let vbytes =
            TX_OVERHEAD_VBYTES + INPUT_VBYTES * inputs as u64 + OUTPUT_VBYTES * outputs as u64;

        Ok(Amount::from_sat((rate * vbytes as f64).ceil() as u64))
    }

    async fn sender_of(&self, tx: &Transaction) -> Result<Option<String>> {
        let mut sender: Option<String> = None;

        for input in &tx.input {
            if input.previous_output.is_null() {
                return Ok(None);
            }
            let prev = self
                .client
                .get_tx(&input.previous_output.txid)
                .await
                .map_err(|e| FlipstakeError::esplora(format!("Failed to get prevout: {}", e)))?;
            let Some(prev) = prev else {
                return Ok(None);
            };
            let Some(out) = prev.output.get(input.previous_output.vout as usize) else {
                return Ok(None);
            };
            let Ok(address) = Address::from_script(&out.script_pubkey, self.network) else {
                return Ok(None);
            };

            let address = address.to_string();
            match &sender {
                Some(existing) if *existing != address => return Ok(None),
                Some(_) => {}
                None => sender = Some(address),
            }
        }

        Ok(sender)
    }

    fn sign_and_build(
        &self,
        secret: &EscrowSecret,
        from: &Address,
        utxos: &[Utxo],
        outputs: Vec<TxOut>,
    ) -> Result<Transaction> {
        let secp = Secp256k1::new();
        let secret_key = secret_key_from(secret)?;
        let pubkey = secret_key.public_key(&secp);
        let script = from.script_pubkey();

        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: utxos
                .iter()
                .map(|u| TxIn {
                    previous_output: u.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
                .collect(),
            output: outputs,
        };

        let mut witnesses = Vec::with_capacity(utxos.len());
        {
            let mut cache = SighashCache::new(&tx);
            for (index, utxo) in utxos.iter().enumerate() {
                let sighash = cache
                    .p2wpkh_signature_hash(index, &script, utxo.value, EcdsaSighashType::All)
                    .map_err(|e| FlipstakeError::transfer(format!("Sighash failed: {}", e)))?;
                let message = Message::from_digest(sighash.to_byte_array());
                let signature = secp.sign_ecdsa(&message, &secret_key);
                let signature = bitcoin::ecdsa::Signature::sighash_all(signature);
                witnesses.push(Witness::p2wpkh(&signature, &pubkey));
            }
        }

        for (input, witness) in tx.input.iter_mut().zip(witnesses) {
            input.witness = witness;
        }

        Ok(tx)
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<String> {
        self.client
            .broadcast(tx)
            .await
            .map_err(|e| FlipstakeError::transfer(format!("Broadcast failed: {}", e)))?;
        Ok(tx.compute_txid().to_string())
    }
}

#[async_trait]
impl NetworkClient for EsploraNetwork {
    async fn get_finalized_entropy(&self) -> Result<EntropyToken> {
        let tip = self.tip_height().await?;
        let height = (tip + 1).checked_sub(self.finality_depth).ok_or_else(|| {
            FlipstakeError::chain_unavailable("Chain is shorter than the finality depth")
        })?;

        let hash = self.client.get_block_hash(height).await.map_err(|e| {
            FlipstakeError::chain_unavailable(format!("Failed to get block hash: {}", e))
        })?;

        debug!("Read entropy from block {} at height {}", hash, height);
        Ok(EntropyToken {
            height,
            value: hash.to_string(),
        })
    }

    async fn get_transaction(&self, signature: &str) -> Result<Option<ChainTransaction>> {
        let txid = Txid::from_str(signature)
            .map_err(|_| FlipstakeError::InvalidSignature(signature.to_string()))?;

        let tx = self
            .client
            .get_tx(&txid)
            .await
            .map_err(|e| FlipstakeError::esplora(format!("Failed to get transaction: {}", e)))?;
        let Some(tx) = tx else {
            return Ok(None);
        };

        let status = self
            .client
            .get_tx_status(&txid)
            .await
            .map_err(|e| FlipstakeError::esplora(format!("Failed to get tx status: {}", e)))?;

        let finalized = match (status.confirmed, status.block_height) {
            (true, Some(block_height)) => {
                let tip = self.tip_height().await?;
                tip.saturating_sub(block_height) + 1 >= self.finality_depth
            }
            _ => false,
        };

        let outputs = tx
            .output
            .iter()
            .filter_map(|out| {
                Address::from_script(&out.script_pubkey, self.network)
                    .ok()
                    .map(|address| TxOutput {
                        address: address.to_string(),
                        amount: out.value,
                    })
            })
            .collect();

        Ok(Some(ChainTransaction {
            signature: txid.to_string(),
            sender: self.sender_of(&tx).await?,
            outputs,
            finalized,
        }))
    }

    async fn get_balance(&self, address: &str) -> Result<Amount> {
        let address = parse_address(address, self.network)?;
        let utxos = self.list_utxos(&address.script_pubkey()).await?;
        Ok(utxos.iter().fold(Amount::ZERO, |acc, u| acc + u.value))
    }

    async fn transfer(&self, secret: &EscrowSecret, to: &str, amount: Amount) -> Result<String> {
        let from = address_for_secret(secret, self.network)?;
        let to = parse_address(to, self.network)?;

        let utxos = self.list_utxos(&from.script_pubkey()).await?;
        let total = utxos.iter().fold(Amount::ZERO, |acc, u| acc + u.value);
        let fee = self.fee_for(utxos.len(), 2).await?;

        let needed = amount + fee;
        if total < needed {
            return Err(FlipstakeError::InsufficientFunds {
                need: needed.to_sat(),
                available: total.to_sat(),
            });
        }

        let mut outputs = vec![TxOut {
            value: amount,
            script_pubkey: to.script_pubkey(),
        }];
        let change = total - needed;
        if change > self.dust_limit {
            outputs.push(TxOut {
                value: change,
                script_pubkey: from.script_pubkey(),
            });
        } else {
            warn!("Change of {} from {} folded into fee", change, from);
        }

        let tx = self.sign_and_build(secret, &from, &utxos, outputs)?;
        let txid = self.broadcast(&tx).await?;
        info!("Sent {} from {} to {} in {}", amount, from, to, txid);
        Ok(txid)
    }

    async fn sweep(&self, secret: &EscrowSecret, to: &str) -> Result<Option<Transfer>> {
        let from = address_for_secret(secret, self.network)?;
        let to = parse_address(to, self.network)?;

        let utxos = self.list_utxos(&from.script_pubkey()).await?;
        if utxos.is_empty() {
            return Ok(None);
        }
        let total = utxos.iter().fold(Amount::ZERO, |acc, u| acc + u.value);
        let fee = self.fee_for(utxos.len(), 1).await?;

        let value = match total.checked_sub(fee) {
            Some(value) if value > self.dust_limit => value,
            _ => {
                debug!("Leaving {} of dust in {}", total, from);
                return Ok(None);
            }
        };

        let outputs = vec![TxOut {
            value,
            script_pubkey: to.script_pubkey(),
        }];
        let tx = self.sign_and_build(secret, &from, &utxos, outputs)?;
        let txid = self.broadcast(&tx).await?;
        info!("Swept {} from {} to {} in {}", value, from, to, txid);

        Ok(Some(Transfer {
            signature: txid,
            amount: value,
        }))
    }
}
