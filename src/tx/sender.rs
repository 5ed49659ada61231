//! Relay executor: builds, signs, submits and confirms destination calls

use super::calldata;
use super::gas::GasPolicy;
use super::{DestinationLedger, ReceiptOutcome};
use crate::chain::ChainRpc;
use crate::config::FederatorConfig;
use crate::error::{FederatorError, FederatorResult};
use crate::events::{compute_transaction_id, CrossEvent, TransactionId};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Submits transfers to one destination chain with the relay's own key
pub struct RelayExecutor {
    provider: Arc<dyn ChainRpc>,
    bridge_address: Address,
    /// Approval-threshold wallet; when set transfers are proposed to it
    multisig_address: Option<Address>,
    /// Wallet for signing, bound to the destination chain id
    wallet: LocalWallet,
    gas: GasPolicy,
    receipt_timeout: Duration,
    receipt_poll: Duration,
}

impl RelayExecutor {
    /// Create an executor for the destination side of `config`
    pub fn new(config: &FederatorConfig, provider: Arc<dyn ChainRpc>) -> FederatorResult<Self> {
        let destination = &config.destination;

        let bridge_address: Address = destination
            .bridge_address
            .parse()
            .map_err(|e| FederatorError::Config(format!("Invalid bridge address: {}", e)))?;
        let multisig_address = destination
            .multisig_address
            .as_deref()
            .map(|address| {
                address.parse::<Address>().map_err(|e| {
                    FederatorError::Config(format!("Invalid multisig address: {}", e))
                })
            })
            .transpose()?;

        let wallet = config
            .signing_key
            .expose()
            .parse::<LocalWallet>()
            .map_err(|e| FederatorError::Signing(format!("Invalid private key: {}", e)))?
            .with_chain_id(destination.chain_id);

        info!(
            "Relay executor for chain {} initialized with wallet {:?}{}",
            destination.name,
            wallet.address(),
            if multisig_address.is_some() { " (multisig)" } else { "" }
        );

        Ok(Self {
            provider,
            bridge_address,
            multisig_address,
            wallet,
            gas: GasPolicy::new(&config.gas),
            receipt_timeout: config.receipt_timeout,
            receipt_poll: config.receipt_poll,
        })
    }

    /// Read-only call against the destination bridge
    async fn read_bridge(&self, data: Bytes) -> FederatorResult<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.bridge_address)
            .data(data)
            .into();
        self.provider.call(&tx).await
    }

    /// Sign and send one call, then wait for its receipt
    async fn send(&self, to: Address, data: Bytes) -> FederatorResult<TransactionReceipt> {
        let chain_id = self.provider.chain_id();
        let from = self.wallet.address();

        let mut tx: TypedTransaction = TransactionRequest::new()
            .from(from)
            .to(to)
            .data(data)
            .value(U256::zero())
            .chain_id(chain_id)
            .into();

        let estimate = self
            .provider
            .estimate_gas(&tx)
            .await
            .map_err(classify_revert)?;
        let gas_price = self.gas.current_price(self.provider.as_ref()).await?;
        let nonce = self.provider.get_transaction_count(from).await?;

        tx.set_gas(self.gas.gas_limit(estimate));
        tx.set_gas_price(gas_price);
        tx.set_nonce(nonce);

        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| FederatorError::Signing(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);

        let tx_hash = self.provider.send_raw_transaction(raw).await?;
        debug!(
            "Sent {:?} to {:?} on chain {} (nonce {}, gas price {})",
            tx_hash, to, chain_id, nonce, gas_price
        );

        let receipt = self.wait_for_receipt(tx_hash).await?;
        if receipt.status == Some(U64::zero()) {
            return Err(FederatorError::Reverted {
                chain_id,
                reason: format!("transaction {:?} reverted", tx_hash),
            });
        }

        Ok(receipt)
    }

    /// Poll for the receipt of `tx_hash` until the receipt timeout elapses
    async fn wait_for_receipt(&self, tx_hash: H256) -> FederatorResult<TransactionReceipt> {
        let chain_id = self.provider.chain_id();
        let poll = async {
            loop {
                match self.provider.get_transaction_receipt(tx_hash).await {
                    Ok(Some(receipt)) => return Ok(receipt),
                    Ok(None) => {}
                    Err(e) if e.is_transient() => {
                        warn!("Receipt poll for {:?} failed: {}", tx_hash, e);
                    }
                    Err(e) => return Err(e),
                }
                tokio::time::sleep(self.receipt_poll).await;
            }
        };

        timeout(self.receipt_timeout, poll)
            .await
            .map_err(|_| FederatorError::RpcTimeout {
                chain_id,
                operation: format!("receipt of {:?}", tx_hash),
            })?
    }
}

/// A revert whose reason mentions the processed-flag means another relay won
fn classify_revert(error: FederatorError) -> FederatorError {
    match error {
        FederatorError::Reverted { reason, .. } if reason.to_lowercase().contains("processed") => {
            FederatorError::AlreadyProcessed(reason)
        }
        other => other,
    }
}

fn outcome_of(receipt: &TransactionReceipt, proposed: bool) -> ReceiptOutcome {
    let tx_hash = receipt.transaction_hash;
    let block_number = receipt.block_number.map(|b| b.as_u64()).unwrap_or_default();
    if proposed {
        ReceiptOutcome::Proposed { tx_hash, block_number }
    } else {
        ReceiptOutcome::Relayed { tx_hash, block_number }
    }
}

#[async_trait]
impl DestinationLedger for RelayExecutor {
    fn chain_id(&self) -> u64 {
        self.provider.chain_id()
    }

    async fn is_processed(&self, id: TransactionId) -> FederatorResult<bool> {
        let output = self.read_bridge(calldata::processed(id)).await?;
        calldata::decode_bool(&output)
    }

    async fn remote_transaction_id(&self, event: &CrossEvent) -> FederatorResult<TransactionId> {
        let output = self
            .read_bridge(calldata::get_transaction_id(event)?)
            .await?;
        calldata::decode_bytes32(&output)
    }

    async fn submit(&self, event: &CrossEvent) -> FederatorResult<ReceiptOutcome> {
        let accept = calldata::accept_transfer(event)?;

        let (to, data, proposed) = match self.multisig_address {
            Some(multisig) => (
                multisig,
                calldata::submit_transaction(self.bridge_address, accept),
                true,
            ),
            None => (self.bridge_address, accept, false),
        };

        match self.send(to, data).await {
            Ok(receipt) => Ok(outcome_of(&receipt, proposed)),
            // a competing submission may have been mined first
            Err(FederatorError::Reverted { chain_id, reason }) => {
                let id = compute_transaction_id(event)?;
                if self.is_processed(id).await? {
                    Err(FederatorError::AlreadyProcessed(reason))
                } else {
                    Err(FederatorError::Reverted { chain_id, reason })
                }
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainRpc;
    use crate::config::tests::{sample_toml, TEST_KEY};
    use crate::config::Settings;
    use crate::events::tests::sample_event;
    use ethers::abi::{self, Token};
    use ethers::utils::{id, rlp};

    /// forward: rsk -> eth (chain 4) through a multisig; reverse: eth -> rsk (chain 31)
    fn config(multisig: bool) -> FederatorConfig {
        let settings = Settings::from_toml(&sample_toml()).unwrap();
        if multisig {
            settings.forward().unwrap()
        } else {
            settings.reverse().unwrap()
        }
    }

    fn executor(config: &FederatorConfig, rpc: MockChainRpc) -> RelayExecutor {
        RelayExecutor::new(config, Arc::new(rpc)).unwrap()
    }

    fn receipt(status: u64) -> TransactionReceipt {
        TransactionReceipt {
            transaction_hash: H256::repeat_byte(0xaa),
            block_number: Some(U64::from(77)),
            status: Some(U64::from(status)),
            ..Default::default()
        }
    }

    fn processed_output(processed: bool) -> Bytes {
        Bytes::from(abi::encode(&[Token::Bool(processed)]))
    }

    /// Mock answering every step of a submission; signed payloads land in `sent`
    fn submitting_rpc(chain_id: u64, sent: Arc<std::sync::Mutex<Vec<Bytes>>>) -> MockChainRpc {
        let mut rpc = MockChainRpc::new();
        rpc.expect_chain_id().return_const(chain_id);
        rpc.expect_estimate_gas()
            .returning(|_| Ok(U256::from(100_000)));
        rpc.expect_get_gas_price().returning(|| Ok(U256::from(20)));
        rpc.expect_get_transaction_count()
            .returning(|_| Ok(U256::from(7)));
        rpc.expect_send_raw_transaction().returning(move |raw| {
            sent.lock().unwrap().push(raw);
            Ok(H256::repeat_byte(0xaa))
        });
        rpc
    }

    #[test]
    fn test_wallet_is_bound_to_destination_chain() {
        let direct = executor(&config(false), MockChainRpc::new());
        assert_eq!(direct.wallet.chain_id(), 31);
        assert!(direct.multisig_address.is_none());

        let proposing = executor(&config(true), MockChainRpc::new());
        assert_eq!(proposing.wallet.chain_id(), 4);
        assert!(proposing.multisig_address.is_some());

        let expected: LocalWallet = TEST_KEY.parse().unwrap();
        assert_eq!(direct.wallet.address(), expected.address());
    }

    #[test]
    fn test_processed_revert_is_benign() {
        let err = classify_revert(FederatorError::Reverted {
            chain_id: 4,
            reason: "execution reverted: Bridge: Already processed".to_string(),
        });
        assert!(matches!(err, FederatorError::AlreadyProcessed(_)));

        let err = classify_revert(FederatorError::Reverted {
            chain_id: 4,
            reason: "execution reverted: Bridge: Token not allowed".to_string(),
        });
        assert!(matches!(err, FederatorError::Reverted { .. }));
    }

    #[test]
    fn test_outcome_distinguishes_proposals() {
        let receipt = receipt(1);
        assert_eq!(
            outcome_of(&receipt, false),
            ReceiptOutcome::Relayed {
                tx_hash: H256::repeat_byte(0xaa),
                block_number: 77
            }
        );
        assert!(matches!(outcome_of(&receipt, true), ReceiptOutcome::Proposed { .. }));
    }

    #[tokio::test]
    async fn test_multisig_proposal_is_signed_with_gas_policy() {
        let mut config = config(true);
        config.gas.primary_chain_id = Some(4);
        let multisig: Address = config
            .destination
            .multisig_address
            .as_deref()
            .unwrap()
            .parse()
            .unwrap();

        let sent = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut rpc = submitting_rpc(4, sent.clone());
        rpc.expect_get_transaction_receipt()
            .returning(|_| Ok(Some(receipt(1))));

        let outcome = executor(&config, rpc)
            .submit(&sample_event(110, 0))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReceiptOutcome::Proposed {
                tx_hash: H256::repeat_byte(0xaa),
                block_number: 77
            }
        );

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let tx: Transaction = rlp::decode(&sent[0]).unwrap();
        assert_eq!(tx.to, Some(multisig));
        assert_eq!(tx.gas, U256::from(120_000));
        assert_eq!(tx.gas_price, Some(U256::from(30)));
        assert_eq!(tx.nonce, U256::from(7));
        assert_eq!(&tx.input[..4], &id(calldata::SUBMIT_TRANSACTION_SIGNATURE)[..]);
    }

    #[tokio::test]
    async fn test_direct_transfer_goes_to_bridge_at_node_price() {
        let config = config(false);
        let bridge: Address = config.destination.bridge_address.parse().unwrap();

        let sent = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut rpc = submitting_rpc(31, sent.clone());
        rpc.expect_get_transaction_receipt()
            .returning(|_| Ok(Some(receipt(1))));

        let outcome = executor(&config, rpc)
            .submit(&sample_event(110, 0))
            .await
            .unwrap();
        assert!(matches!(outcome, ReceiptOutcome::Relayed { block_number: 77, .. }));

        let tx: Transaction = rlp::decode(&sent.lock().unwrap()[0]).unwrap();
        assert_eq!(tx.to, Some(bridge));
        assert_eq!(tx.gas_price, Some(U256::from(20)));
        assert_eq!(&tx.input[..4], &id(calldata::ACCEPT_TRANSFER_SIGNATURE)[..]);
    }

    #[tokio::test]
    async fn test_failed_receipt_is_reverted() {
        let sent = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut rpc = submitting_rpc(31, sent);
        rpc.expect_get_transaction_receipt()
            .returning(|_| Ok(Some(receipt(0))));
        rpc.expect_call()
            .times(1)
            .returning(|_| Ok(processed_output(false)));

        let err = executor(&config(false), rpc)
            .submit(&sample_event(110, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, FederatorError::Reverted { chain_id: 31, .. }));
    }

    #[tokio::test]
    async fn test_failed_receipt_for_processed_transfer_is_benign() {
        let sent = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut rpc = submitting_rpc(31, sent);
        rpc.expect_get_transaction_receipt()
            .returning(|_| Ok(Some(receipt(0))));
        rpc.expect_call()
            .times(1)
            .returning(|_| Ok(processed_output(true)));

        let err = executor(&config(false), rpc)
            .submit(&sample_event(110, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, FederatorError::AlreadyProcessed(_)));
    }

    #[tokio::test]
    async fn test_missing_receipt_times_out() {
        let mut config = config(false);
        config.receipt_timeout = Duration::from_millis(50);
        config.receipt_poll = Duration::from_millis(10);

        let sent = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut rpc = submitting_rpc(31, sent);
        rpc.expect_get_transaction_receipt().returning(|_| Ok(None));

        let err = executor(&config, rpc)
            .submit(&sample_event(110, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, FederatorError::RpcTimeout { chain_id: 31, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_estimate_revert_on_processed_flag_is_benign() {
        let mut rpc = MockChainRpc::new();
        rpc.expect_chain_id().return_const(31u64);
        rpc.expect_estimate_gas().returning(|_| {
            Err(FederatorError::Reverted {
                chain_id: 31,
                reason: "execution reverted: Bridge: Already processed".to_string(),
            })
        });
        rpc.expect_send_raw_transaction().never();

        let err = executor(&config(false), rpc)
            .submit(&sample_event(110, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, FederatorError::AlreadyProcessed(_)));
    }

    #[tokio::test]
    async fn test_processed_flag_reads_bridge() {
        let config = config(false);
        let bridge: Address = config.destination.bridge_address.parse().unwrap();
        let event = sample_event(110, 0);
        let expected = calldata::processed(compute_transaction_id(&event).unwrap());

        let mut rpc = MockChainRpc::new();
        rpc.expect_call()
            .withf(move |tx| tx.to_addr() == Some(&bridge) && tx.data() == Some(&expected))
            .times(1)
            .returning(|_| Ok(processed_output(true)));

        let executor = executor(&config, rpc);
        let id = compute_transaction_id(&event).unwrap();
        assert!(executor.is_processed(id).await.unwrap());
    }
}
