//! JSON-RPC implementation of every collaborator trait.
//!
//! Reads go through `eth_call`; writes are sent from the operator account
//! with `eth_sendTransaction` (the node holds the operator key) and then
//! polled for a receipt. The operator also acts as the bundler: it calls
//! `handleOps` itself.

use alloy_primitives::aliases::U192;
use alloy_primitives::{Address, B256, U256};
use alloy_sol_types::{SolCall, SolEvent};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::rpc_client::RpcClient;
use super::{
    AccountFactory, ChainHandles, ContractAddresses, Coordinator, FeeOracle, Fees, NativeLedger, NetworkInfo,
    Receipt, Registry, RegistryEntry, Sponsor, TransactionStatus,
};
use crate::config::ChainConfig;
use crate::error::ChainError;
use crate::operation::abi::{
    balanceOfCall, createAccountCall, fundPaymasterCall, getAddressCall, getNonceCall, getNoteCall,
    getUserOpHashCall, handleOpsCall, UserOperationEvent,
};
use crate::operation::UserOperation;

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct EvmChain {
    rpc: RpcClient,
    operator: Address,
    addresses: ContractAddresses,
    receipt_timeout: Duration,
}

impl EvmChain {
    pub fn new(config: &ChainConfig) -> Self {
        Self {
            rpc: RpcClient::new(config.rpc_url.clone()),
            operator: config.operator,
            addresses: ContractAddresses::from(config),
            receipt_timeout: Duration::from_secs(config.receipt_timeout_secs),
        }
    }

    /// Every collaborator handle, all backed by this one client.
    pub fn handles(self: Arc<Self>) -> ChainHandles {
        ChainHandles {
            coordinator: self.clone(),
            factory: self.clone(),
            sponsor: self.clone(),
            fee_oracle: Some(self.clone() as Arc<dyn FeeOracle>),
            registry: self.clone(),
            ledger: self.clone(),
            addresses: self.addresses,
        }
    }

    async fn call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>, ChainError> {
        let result = self
            .rpc
            .send_request(
                "eth_call",
                json!([{ "to": to, "data": format!("0x{}", hex::encode(data)) }, "latest"]),
            )
            .await?;
        parse_bytes(&result)
    }

    async fn send(&self, to: Address, data: Vec<u8>, value: U256) -> Result<Receipt, ChainError> {
        let mut tx = json!({ "from": self.operator, "to": to });
        if !data.is_empty() {
            tx["data"] = json!(format!("0x{}", hex::encode(data)));
        }
        if !value.is_zero() {
            tx["value"] = json!(format!("0x{:x}", value));
        }
        let hash = self.rpc.send_request("eth_sendTransaction", json!([tx])).await?;
        let hash = parse_b256(&hash)?;
        debug!("Sent {} to {}", hash, to);

        let receipt = self.wait_for_receipt(hash).await?;
        if !receipt_succeeded(&receipt) {
            return Err(ChainError::Reverted(format!("transaction {} reverted", hash)));
        }
        receipt_summary(&receipt)
    }

    /// Polls until the receipt shows up or the timeout passes. The
    /// transaction is already broadcast, so a failed poll is never reported
    /// as transient: a resend could execute twice.
    async fn wait_for_receipt(&self, hash: B256) -> Result<Value, ChainError> {
        let deadline = tokio::time::Instant::now() + self.receipt_timeout;
        loop {
            let last_error = match self
                .rpc
                .send_request("eth_getTransactionReceipt", json!([hash]))
                .await
            {
                Ok(receipt) if !receipt.is_null() => return Ok(receipt),
                Ok(_) => None,
                Err(e) => {
                    warn!("Receipt poll for {} failed: {}", hash, e);
                    Some(e)
                }
            };
            if tokio::time::Instant::now() >= deadline {
                return Err(ChainError::ReceiptTimeout(match last_error {
                    Some(e) => format!("{} (last poll: {})", hash, e),
                    None => hash.to_string(),
                }));
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }

    async fn quantity(&self, method: &str, params: Value) -> Result<U256, ChainError> {
        let result = self.rpc.send_request(method, params).await?;
        parse_quantity(&result)
    }
}

#[async_trait]
impl Coordinator for EvmChain {
    async fn get_nonce(&self, sender: Address, key: U256) -> Result<U256, ChainError> {
        let data = getNonceCall {
            sender,
            key: U192::saturating_from(key),
        }
        .abi_encode();
        let out = self.call(self.addresses.coordinator, data).await?;
        word(&out, 0)
    }

    async fn hash_operation(&self, op: &UserOperation) -> Result<B256, ChainError> {
        let data = getUserOpHashCall { userOp: op.into() }.abi_encode();
        let out = self.call(self.addresses.coordinator, data).await?;
        Ok(B256::from(word(&out, 0)?.to_be_bytes::<32>()))
    }

    async fn submit(&self, ops: &[UserOperation], beneficiary: Address) -> Result<Receipt, ChainError> {
        let data = handleOpsCall {
            ops: ops.iter().map(Into::into).collect(),
            beneficiary,
        }
        .abi_encode();
        let mut tx = json!({
            "from": self.operator,
            "to": self.addresses.coordinator,
            "data": format!("0x{}", hex::encode(data)),
        });
        // eth_estimateGas surfaces FailedOp reverts before anything is sent
        let gas = self.quantity("eth_estimateGas", json!([tx.clone()])).await?;
        tx["gas"] = json!(format!("0x{:x}", gas));

        let hash = parse_b256(&self.rpc.send_request("eth_sendTransaction", json!([tx])).await?)?;
        info!("📤 handleOps sent: {}", hash);
        let receipt = self.wait_for_receipt(hash).await?;
        if !receipt_succeeded(&receipt) {
            return Err(ChainError::Reverted(format!("handleOps {} reverted", hash)));
        }
        if let Some(false) = operation_succeeded(&receipt) {
            return Err(ChainError::Reverted(format!(
                "operation execution reverted in {}",
                hash
            )));
        }
        receipt_summary(&receipt)
    }
}

#[async_trait]
impl AccountFactory for EvmChain {
    async fn predict_address(&self, owner: Address, salt: U256) -> Result<Address, ChainError> {
        let out = self
            .call(self.addresses.factory, getAddressCall { owner, salt }.abi_encode())
            .await?;
        address_word(&out, 0)
    }

    async fn create_account(&self, owner: Address, salt: U256) -> Result<Receipt, ChainError> {
        self.send(self.addresses.factory, createAccountCall { owner, salt }.abi_encode(), U256::ZERO)
            .await
    }
}

#[async_trait]
impl Sponsor for EvmChain {
    async fn get_deposit(&self) -> Result<U256, ChainError> {
        let data = balanceOfCall {
            account: self.addresses.sponsor,
        }
        .abi_encode();
        let out = self.call(self.addresses.coordinator, data).await?;
        word(&out, 0)
    }

    async fn fund(&self, amount: U256) -> Result<Receipt, ChainError> {
        self.send(self.addresses.sponsor, fundPaymasterCall {}.abi_encode(), amount)
            .await
    }
}

#[async_trait]
impl FeeOracle for EvmChain {
    async fn get_fees(&self) -> Result<Fees, ChainError> {
        let priority = self.quantity("eth_maxPriorityFeePerGas", json!([])).await?;
        let block = self
            .rpc
            .send_request("eth_getBlockByNumber", json!(["latest", false]))
            .await?;
        let base = parse_quantity(&block["baseFeePerGas"])?;
        Ok(Fees {
            max_fee_per_gas: base * U256::from(2u64) + priority,
            max_priority_fee_per_gas: priority,
        })
    }
}

#[async_trait]
impl Registry for EvmChain {
    async fn get(&self, id: B256) -> Result<RegistryEntry, ChainError> {
        let out = self
            .call(self.addresses.registry, getNoteCall { noteId: id }.abi_encode())
            .await?;
        Ok(RegistryEntry {
            fingerprint: B256::from(word(&out, 0)?.to_be_bytes::<32>()),
            owner: address_word(&out, 1)?,
            timestamp: u64::try_from(word(&out, 2)?)
                .map_err(|_| ChainError::Malformed("timestamp out of range".to_string()))?,
            exists: !word(&out, 3)?.is_zero(),
        })
    }
}

#[async_trait]
impl NativeLedger for EvmChain {
    async fn balance_of(&self, address: Address) -> Result<U256, ChainError> {
        self.quantity("eth_getBalance", json!([address, "latest"])).await
    }

    async fn is_deployed(&self, address: Address) -> Result<bool, ChainError> {
        let code = self
            .rpc
            .send_request("eth_getCode", json!([address, "latest"]))
            .await?;
        Ok(!parse_bytes(&code)?.is_empty())
    }

    async fn transfer(&self, to: Address, amount: U256) -> Result<Receipt, ChainError> {
        self.send(to, Vec::new(), amount).await
    }

    async fn transaction_status(&self, hash: B256) -> Result<TransactionStatus, ChainError> {
        let receipt = self
            .rpc
            .send_request("eth_getTransactionReceipt", json!([hash]))
            .await?;
        if receipt.is_null() {
            return Ok(TransactionStatus::Pending);
        }
        let summary = receipt_summary(&receipt)?;
        Ok(if receipt_succeeded(&receipt) {
            TransactionStatus::Confirmed {
                block_number: summary.block_number,
                gas_used: summary.gas_used,
            }
        } else {
            TransactionStatus::Failed {
                block_number: summary.block_number,
            }
        })
    }

    async fn network_info(&self) -> Result<NetworkInfo, ChainError> {
        let chain_id = self.quantity("eth_chainId", json!([])).await?;
        let block_number = self.quantity("eth_blockNumber", json!([])).await?;
        Ok(NetworkInfo {
            chain_id: to_u64(chain_id)?,
            block_number: to_u64(block_number)?,
            fees: self.get_fees().await.ok(),
        })
    }
}

fn parse_quantity(value: &Value) -> Result<U256, ChainError> {
    let s = value
        .as_str()
        .ok_or_else(|| ChainError::Malformed(format!("expected hex quantity, got {}", value)))?;
    let digits = s.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(digits, 16).map_err(|e| ChainError::Malformed(format!("bad quantity {}: {}", s, e)))
}

fn parse_bytes(value: &Value) -> Result<Vec<u8>, ChainError> {
    let s = value
        .as_str()
        .ok_or_else(|| ChainError::Malformed(format!("expected hex data, got {}", value)))?;
    hex::decode(s.trim_start_matches("0x")).map_err(|e| ChainError::Malformed(format!("bad hex data: {}", e)))
}

fn parse_b256(value: &Value) -> Result<B256, ChainError> {
    let bytes = parse_bytes(value)?;
    if bytes.len() != 32 {
        return Err(ChainError::Malformed(format!("expected 32 bytes, got {}", bytes.len())));
    }
    Ok(B256::from_slice(&bytes))
}

fn to_u64(value: U256) -> Result<u64, ChainError> {
    u64::try_from(value).map_err(|_| ChainError::Malformed(format!("{} does not fit in u64", value)))
}

/// The `index`-th 32-byte word of ABI return data.
fn word(data: &[u8], index: usize) -> Result<U256, ChainError> {
    let start = index * 32;
    let slice = data
        .get(start..start + 32)
        .ok_or_else(|| ChainError::Malformed(format!("return data too short for word {}", index)))?;
    Ok(U256::from_be_slice(slice))
}

fn address_word(data: &[u8], index: usize) -> Result<Address, ChainError> {
    let bytes = word(data, index)?.to_be_bytes::<32>();
    Ok(Address::from_slice(&bytes[12..]))
}

fn receipt_succeeded(receipt: &Value) -> bool {
    receipt["status"].as_str() == Some("0x1")
}

fn receipt_summary(receipt: &Value) -> Result<Receipt, ChainError> {
    Ok(Receipt {
        transaction_hash: parse_b256(&receipt["transactionHash"])?,
        block_number: to_u64(parse_quantity(&receipt["blockNumber"])?)?,
        gas_used: to_u64(parse_quantity(&receipt["gasUsed"])?)?,
    })
}

/// Success flag of the first `UserOperationEvent` in a receipt, if any.
fn operation_succeeded(receipt: &Value) -> Option<bool> {
    let topic = format!("{:#x}", UserOperationEvent::SIGNATURE_HASH);
    receipt["logs"].as_array()?.iter().find_map(|log| {
        let first = log["topics"].get(0)?.as_str()?;
        if !first.eq_ignore_ascii_case(&topic) {
            return None;
        }
        let data = parse_bytes(&log["data"]).ok()?;
        // data: nonce | success | actualGasCost | actualGasUsed
        word(&data, 1).ok().map(|flag| !flag.is_zero())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_log(success: bool) -> Value {
        let mut data = vec![0u8; 128];
        data[63] = success as u8;
        json!({
            "topics": [format!("{:#x}", UserOperationEvent::SIGNATURE_HASH)],
            "data": format!("0x{}", hex::encode(data)),
        })
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity(&json!("0x1a")).unwrap(), U256::from(26u64));
        assert_eq!(parse_quantity(&json!("0x")).unwrap(), U256::ZERO);
        assert!(parse_quantity(&json!(12)).is_err());
        assert!(parse_quantity(&json!("0xzz")).is_err());
    }

    #[test]
    fn test_return_words() {
        let mut data = vec![0u8; 64];
        data[31] = 7;
        data[44..64].copy_from_slice(Address::repeat_byte(0xab).as_slice());
        assert_eq!(word(&data, 0).unwrap(), U256::from(7u64));
        assert_eq!(address_word(&data, 1).unwrap(), Address::repeat_byte(0xab));
        assert!(word(&data, 2).is_err());
    }

    #[test]
    fn test_receipt_parsing() {
        let receipt = json!({
            "status": "0x1",
            "transactionHash": format!("{:#x}", B256::repeat_byte(3)),
            "blockNumber": "0x10",
            "gasUsed": "0x5208",
            "logs": [event_log(true)],
        });
        assert!(receipt_succeeded(&receipt));
        let summary = receipt_summary(&receipt).unwrap();
        assert_eq!(summary.block_number, 16);
        assert_eq!(summary.gas_used, 21_000);
        assert_eq!(summary.transaction_hash, B256::repeat_byte(3));
        assert_eq!(operation_succeeded(&receipt), Some(true));
    }

    #[test]
    fn test_failed_operation_event() {
        let receipt = json!({ "status": "0x1", "logs": [event_log(false)] });
        assert_eq!(operation_succeeded(&receipt), Some(false));
        let no_event = json!({ "status": "0x1", "logs": [] });
        assert_eq!(operation_succeeded(&no_event), None);
    }

    /// Serves canned JSON-RPC results; the receipt endpoint always fails.
    async fn stub_node() -> String {
        use axum::{http::StatusCode, response::IntoResponse, routing::post, Json, Router};

        async fn answer(Json(req): Json<Value>) -> axum::response::Response {
            let result = match req["method"].as_str().unwrap_or_default() {
                "eth_estimateGas" => json!("0x30d40"),
                "eth_sendTransaction" => json!(format!("{:#x}", B256::repeat_byte(0x77))),
                _ => return StatusCode::BAD_GATEWAY.into_response(),
            };
            Json(json!({ "jsonrpc": "2.0", "id": req["id"], "result": result })).into_response()
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().route("/", post(answer))).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn chain_at(url: String) -> EvmChain {
        EvmChain::new(&ChainConfig {
            rpc_url: url,
            operator: Address::repeat_byte(0x0a),
            coordinator: Address::repeat_byte(0xe0),
            receipt_timeout_secs: 0,
            ..ChainConfig::default()
        })
    }

    #[tokio::test]
    async fn test_failed_receipt_poll_after_broadcast_is_uncertain() {
        let chain = chain_at(stub_node().await);

        let err = chain.submit(&[UserOperation::default()], Address::repeat_byte(0xbe)).await.unwrap_err();
        assert!(matches!(&err, ChainError::ReceiptTimeout(msg) if msg.contains("last poll")));
        assert!(!crate::error::AnchorError::from(err).is_transient());

        let err = chain.transfer(Address::repeat_byte(0x11), U256::from(5u64)).await.unwrap_err();
        assert!(matches!(err, ChainError::ReceiptTimeout(_)));
    }

    #[tokio::test]
    async fn test_failure_before_broadcast_stays_transient() {
        let chain = chain_at("http://127.0.0.1:1".to_string());
        let err = chain.transfer(Address::repeat_byte(0x11), U256::from(5u64)).await.unwrap_err();
        assert!(matches!(err, ChainError::Network(_)));
    }
}
