//! Scripted in-memory chain for tests.
//!
//! Submissions are executed against a tiny model of the coordinator: deploy
//! code marks the account deployed, nonces advance, and `execute` payloads
//! that carry `registerNote`/`updateNote` are written to the registry.

use alloy_primitives::{keccak256, Address, B256, U256};
use alloy_sol_types::SolCall;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{
    AccountFactory, ChainHandles, ContractAddresses, Coordinator, FeeOracle, Fees, NativeLedger, NetworkInfo,
    Receipt, Registry, RegistryEntry, Sponsor, TransactionStatus,
};
use crate::error::ChainError;
use crate::operation::abi::{getUserOpHashCall, registerNoteCall, updateNoteCall};
use crate::operation::UserOperation;

const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

/// What the next `submit` call does.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitBehavior {
    /// Execute normally (may still revert on prefund checks).
    Succeed,
    Revert(String),
    Network,
    RateLimited(Option<Duration>),
    /// Nothing lands on chain and no receipt arrives.
    Timeout,
    /// The write lands on chain but the receipt is lost.
    SucceedThenTimeout,
    /// The write lands on chain but the connection drops before the reply.
    SucceedThenNetwork,
}

struct State {
    nonces: HashMap<Address, U256>,
    deployed: HashSet<Address>,
    balances: HashMap<Address, U256>,
    deposit: U256,
    registry: HashMap<B256, RegistryEntry>,
    receipts: HashMap<B256, Receipt>,
    script: VecDeque<SubmitBehavior>,
    submissions: Vec<UserOperation>,
    fundings: Vec<U256>,
    transfers: Vec<(Address, U256)>,
    predict_calls: usize,
    factory_down: bool,
    fund_fails: bool,
    deposit_unreadable: bool,
    block: u64,
    fees: Fees,
}

pub struct MockChain {
    state: Mutex<State>,
}

impl MockChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                nonces: HashMap::new(),
                deployed: HashSet::new(),
                balances: HashMap::new(),
                deposit: U256::from(10u64).pow(U256::from(18u64)),
                registry: HashMap::new(),
                receipts: HashMap::new(),
                script: VecDeque::new(),
                submissions: Vec::new(),
                fundings: Vec::new(),
                transfers: Vec::new(),
                predict_calls: 0,
                factory_down: false,
                fund_fails: false,
                deposit_unreadable: false,
                block: 100,
                fees: Fees {
                    max_fee_per_gas: U256::from(3_000_000_000u64),
                    max_priority_fee_per_gas: U256::from(1_000_000_000u64),
                },
            }),
        })
    }

    /// All collaborator handles backed by this chain. No fee oracle, so
    /// builders fall back to their constant fees.
    pub fn handles(self: &Arc<Self>) -> ChainHandles {
        ChainHandles {
            coordinator: self.clone(),
            factory: self.clone(),
            sponsor: self.clone(),
            fee_oracle: None,
            registry: self.clone(),
            ledger: self.clone(),
            addresses: ContractAddresses {
                coordinator: Address::repeat_byte(0xe0),
                factory: Address::repeat_byte(0xfa),
                registry: Address::repeat_byte(0xae),
                sponsor: Address::repeat_byte(0x5e),
                beneficiary: Address::repeat_byte(0xbe),
            },
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Queues behaviours for upcoming `submit` calls; an empty queue succeeds.
    pub fn script(&self, behaviors: impl IntoIterator<Item = SubmitBehavior>) {
        self.state().script.extend(behaviors);
    }

    pub fn submissions(&self) -> Vec<UserOperation> {
        self.state().submissions.clone()
    }

    pub fn fundings(&self) -> Vec<U256> {
        self.state().fundings.clone()
    }

    pub fn transfers(&self) -> Vec<(Address, U256)> {
        self.state().transfers.clone()
    }

    pub fn predict_calls(&self) -> usize {
        self.state().predict_calls
    }

    pub fn set_factory_down(&self, down: bool) {
        self.state().factory_down = down;
    }

    pub fn set_fund_fails(&self, fails: bool) {
        self.state().fund_fails = fails;
    }

    pub fn set_deposit_unreadable(&self, unreadable: bool) {
        self.state().deposit_unreadable = unreadable;
    }

    pub fn set_deposit(&self, amount: U256) {
        self.state().deposit = amount;
    }

    pub fn deposit(&self) -> U256 {
        self.state().deposit
    }

    pub fn set_balance(&self, address: Address, amount: U256) {
        self.state().balances.insert(address, amount);
    }

    pub fn set_nonce(&self, address: Address, nonce: U256) {
        self.state().nonces.insert(address, nonce);
    }

    pub fn mark_deployed(&self, address: Address) {
        self.state().deployed.insert(address);
    }

    pub fn fees(&self) -> Fees {
        self.state().fees
    }

    /// Writes a registry entry directly, as if an earlier submission landed.
    pub fn anchor(&self, note_id: B256, fingerprint: B256, owner: Address) {
        let mut state = self.state();
        let timestamp = GENESIS_TIMESTAMP + state.block;
        state.registry.insert(
            note_id,
            RegistryEntry {
                fingerprint,
                owner,
                timestamp,
                exists: true,
            },
        );
    }

    pub fn registry_entry(&self, note_id: B256) -> Option<RegistryEntry> {
        self.state().registry.get(&note_id).cloned()
    }

    fn next_receipt(state: &mut State, gas_used: u64) -> Receipt {
        state.block += 1;
        let receipt = Receipt {
            transaction_hash: keccak256(state.block.to_be_bytes()),
            block_number: state.block,
            gas_used,
        };
        state.receipts.insert(receipt.transaction_hash, receipt.clone());
        receipt
    }
}

/// Pulls the registry write out of an `execute(dest, 0, func)` payload.
fn registry_write(call_data: &[u8]) -> Option<([u8; 4], B256, B256)> {
    // selector | dest | value | offset | length | func...
    let func = call_data.get(4 + 128..)?;
    let selector: [u8; 4] = func.get(..4)?.try_into().ok()?;
    let note_id = B256::from_slice(func.get(4..36)?);
    let hash = B256::from_slice(func.get(36..68)?);
    Some((selector, note_id, hash))
}

fn execute(state: &mut State, op: &UserOperation) -> Result<(), ChainError> {
    if op.is_sponsored() {
        if state.deposit < op.max_cost() {
            return Err(ChainError::Reverted("FailedOp(0, \"AA31 paymaster deposit too low\")".into()));
        }
    } else {
        let balance = state.balances.get(&op.sender).copied().unwrap_or_default();
        if balance < op.max_cost() {
            return Err(ChainError::Reverted("FailedOp(0, \"AA21 didn't pay prefund\")".into()));
        }
    }
    let nonce = state.nonces.get(&op.sender).copied().unwrap_or_default();
    if op.nonce != nonce {
        return Err(ChainError::Reverted("FailedOp(0, \"AA25 invalid account nonce\")".into()));
    }

    if !op.init_code.is_empty() {
        state.deployed.insert(op.sender);
    }
    state.nonces.insert(op.sender, nonce + U256::from(1u64));

    if let Some((selector, note_id, hash)) = registry_write(&op.call_data) {
        let exists = state.registry.get(&note_id).map_or(false, |e| e.exists);
        if selector == registerNoteCall::SELECTOR && exists {
            return Err(ChainError::Reverted("Note already exists".into()));
        }
        if selector == updateNoteCall::SELECTOR && !exists {
            return Err(ChainError::Reverted("Note does not exist".into()));
        }
        let timestamp = GENESIS_TIMESTAMP + state.block + 1;
        state.registry.insert(
            note_id,
            RegistryEntry {
                fingerprint: hash,
                owner: op.sender,
                timestamp,
                exists: true,
            },
        );
    }
    Ok(())
}

#[async_trait]
impl Coordinator for MockChain {
    async fn get_nonce(&self, sender: Address, _key: U256) -> Result<U256, ChainError> {
        Ok(self.state().nonces.get(&sender).copied().unwrap_or_default())
    }

    async fn hash_operation(&self, op: &UserOperation) -> Result<B256, ChainError> {
        let mut unsigned = op.clone();
        unsigned.signature = Default::default();
        Ok(keccak256(getUserOpHashCall { userOp: (&unsigned).into() }.abi_encode()))
    }

    async fn submit(&self, ops: &[UserOperation], _beneficiary: Address) -> Result<Receipt, ChainError> {
        let mut state = self.state();
        state.submissions.extend(ops.iter().cloned());
        let behavior = state.script.pop_front().unwrap_or(SubmitBehavior::Succeed);
        match behavior {
            SubmitBehavior::Succeed => {
                for op in ops {
                    execute(&mut state, op)?;
                }
                Ok(Self::next_receipt(&mut state, 120_000))
            }
            SubmitBehavior::Revert(reason) => Err(ChainError::Reverted(reason)),
            SubmitBehavior::Network => Err(ChainError::Network("connection reset".into())),
            SubmitBehavior::RateLimited(retry_after) => Err(ChainError::RateLimited { retry_after }),
            SubmitBehavior::Timeout => Err(ChainError::ReceiptTimeout("0xpending".into())),
            SubmitBehavior::SucceedThenTimeout => {
                for op in ops {
                    execute(&mut state, op)?;
                }
                let receipt = Self::next_receipt(&mut state, 120_000);
                Err(ChainError::ReceiptTimeout(receipt.transaction_hash.to_string()))
            }
            SubmitBehavior::SucceedThenNetwork => {
                for op in ops {
                    execute(&mut state, op)?;
                }
                Self::next_receipt(&mut state, 120_000);
                Err(ChainError::Network("connection reset while polling receipt".into()))
            }
        }
    }
}

#[async_trait]
impl AccountFactory for MockChain {
    async fn predict_address(&self, owner: Address, salt: U256) -> Result<Address, ChainError> {
        let mut state = self.state();
        if state.factory_down {
            return Err(ChainError::Network("factory unreachable".into()));
        }
        state.predict_calls += 1;
        let mut preimage = owner.to_vec();
        preimage.extend_from_slice(&salt.to_be_bytes::<32>());
        Ok(Address::from_slice(&keccak256(preimage)[12..]))
    }

    async fn create_account(&self, owner: Address, salt: U256) -> Result<Receipt, ChainError> {
        let address = self.predict_address(owner, salt).await?;
        let mut state = self.state();
        state.deployed.insert(address);
        Ok(Self::next_receipt(&mut state, 250_000))
    }
}

#[async_trait]
impl Sponsor for MockChain {
    async fn get_deposit(&self) -> Result<U256, ChainError> {
        let state = self.state();
        if state.deposit_unreadable {
            return Err(ChainError::Network("deposit read failed".into()));
        }
        Ok(state.deposit)
    }

    async fn fund(&self, amount: U256) -> Result<Receipt, ChainError> {
        let mut state = self.state();
        if state.fund_fails {
            return Err(ChainError::Reverted("insufficient operator funds".into()));
        }
        state.deposit += amount;
        state.fundings.push(amount);
        Ok(Self::next_receipt(&mut state, 45_000))
    }
}

#[async_trait]
impl FeeOracle for MockChain {
    async fn get_fees(&self) -> Result<Fees, ChainError> {
        Ok(self.state().fees)
    }
}

#[async_trait]
impl Registry for MockChain {
    async fn get(&self, id: B256) -> Result<RegistryEntry, ChainError> {
        Ok(self
            .state()
            .registry
            .get(&id)
            .cloned()
            .unwrap_or_else(RegistryEntry::missing))
    }
}

#[async_trait]
impl NativeLedger for MockChain {
    async fn balance_of(&self, address: Address) -> Result<U256, ChainError> {
        Ok(self.state().balances.get(&address).copied().unwrap_or_default())
    }

    async fn is_deployed(&self, address: Address) -> Result<bool, ChainError> {
        Ok(self.state().deployed.contains(&address))
    }

    async fn transfer(&self, to: Address, amount: U256) -> Result<Receipt, ChainError> {
        let mut state = self.state();
        if state.fund_fails {
            return Err(ChainError::Reverted("insufficient operator funds".into()));
        }
        *state.balances.entry(to).or_default() += amount;
        state.transfers.push((to, amount));
        Ok(Self::next_receipt(&mut state, 21_000))
    }

    async fn transaction_status(&self, hash: B256) -> Result<TransactionStatus, ChainError> {
        Ok(match self.state().receipts.get(&hash) {
            Some(r) => TransactionStatus::Confirmed {
                block_number: r.block_number,
                gas_used: r.gas_used,
            },
            None => TransactionStatus::Pending,
        })
    }

    async fn network_info(&self) -> Result<NetworkInfo, ChainError> {
        let state = self.state();
        Ok(NetworkInfo {
            chain_id: 31337,
            block_number: state.block,
            fees: Some(state.fees),
        })
    }
}
