use crate::chain::{with_timeout, ChainClient, SignedTx, Signer, UnsignedTx};
use crate::config::ChainConfig;
use crate::errors::{ClientError, TxmError, TxmResult};
use crate::types::{Address, AttemptState, Tx, TxAttempt, Wei};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Signs attempts and talks to the node on behalf of the broadcaster and the
/// confirmer. Every node request runs under the configured request timeout.
#[derive(Clone)]
pub struct TxSender {
    client: Arc<dyn ChainClient>,
    signer: Arc<dyn Signer>,
    chain_id: u64,
    request_timeout: Duration,
}

impl TxSender {
    pub fn new(client: Arc<dyn ChainClient>, signer: Arc<dyn Signer>, chain: &ChainConfig) -> Self {
        Self {
            client,
            signer,
            chain_id: chain.chain_id,
            request_timeout: chain.request_timeout(),
        }
    }

    /// Sign `tx` at `gas_price` into a fresh InProgress attempt
    ///
    /// Nothing is persisted; the caller decides where the attempt goes.
    pub fn new_attempt(&self, tx: &Tx, gas_price: Wei) -> TxmResult<TxAttempt> {
        let nonce = tx
            .nonce
            .ok_or_else(|| TxmError::Service(format!("transaction {} has no nonce to sign", tx.id)))?;
        let unsigned = UnsignedTx {
            nonce,
            to: tx.to,
            value: tx.value,
            gas_limit: tx.gas_limit,
            gas_price,
            payload: tx.payload.clone(),
        };
        let SignedTx { hash, raw } = self.signer.sign_transaction(&tx.from, &unsigned, self.chain_id)?;

        Ok(TxAttempt {
            id: Uuid::new_v4(),
            tx_id: tx.id,
            signed_raw: raw,
            gas_price,
            hash,
            state: AttemptState::InProgress,
            broadcast_before_block_num: None,
            receipt_ids: Vec::new(),
            created_at: Utc::now(),
        })
    }

    /// Push the signed bytes of `attempt` to the node
    pub async fn send_attempt(&self, attempt: &TxAttempt) -> Result<(), ClientError> {
        let signed = SignedTx {
            hash: attempt.hash,
            raw: attempt.signed_raw.clone(),
        };
        with_timeout(self.request_timeout, self.client.send_transaction(&signed)).await
    }

    pub async fn pending_nonce(&self, address: &Address) -> Result<u64, ClientError> {
        with_timeout(self.request_timeout, self.client.pending_nonce_at(address)).await
    }

    pub fn client(&self) -> &Arc<dyn ChainClient> {
        &self.client
    }

    pub fn signer(&self) -> &Arc<dyn Signer> {
        &self.signer
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}
