use alloy_primitives::B256;
use axum::{debug_handler, extract::State, Json};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::types::*;
use super::RpcState;
use crate::error::AnchorError;

/// Main RPC handler - dispatches to specific method handlers
#[debug_handler]
pub async fn handle_rpc_request(
    State(state): State<RpcState>,
    Json(req): Json<RpcRequest>,
) -> Json<RpcResponse> {
    debug!("RPC Request: method={}, id={}", req.method, req.id);

    let result = match req.method.as_str() {
        // Content lifecycle
        "submitContent" => handle_submit_content(state.clone(), req.params).await,
        "registerContent" => handle_register_content(state.clone(), req.params).await,
        "editContent" => handle_edit_content(state.clone(), req.params).await,
        "getContent" => handle_get_content(state.clone(), req.params).await,
        "listContent" => handle_list_content(state.clone(), req.params).await,
        "verifyContent" => handle_verify_content(state.clone(), req.params).await,
        // Reconciliation
        "sweepStuck" => handle_sweep_stuck(state.clone()).await,
        "checkRecord" => handle_check_record(state.clone(), req.params).await,
        // Sponsor
        "checkSponsorHealth" => to_json(&state.service.check_sponsor_health().await),
        "fundSponsor" => handle_fund_sponsor(state.clone()).await,
        // Chain
        "getAccountInfo" => handle_account_info(state.clone(), req.params).await,
        "getNetworkInfo" => handle_network_info(state.clone()).await,
        "getTransactionStatus" => handle_transaction_status(state.clone(), req.params).await,
        "getVersion" => Ok(serde_json::json!({ "version": env!("CARGO_PKG_VERSION") })),
        _ => Err(RpcError {
            code: METHOD_NOT_FOUND,
            message: format!("Method not found: {}", req.method),
        }),
    };

    // Build response
    match result {
        Ok(val) => Json(RpcResponse {
            jsonrpc: "2.0".to_string(),
            result: Some(val),
            error: None,
            id: req.id,
        }),
        Err(err) => Json(RpcResponse {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(err),
            id: req.id,
        }),
    }
}

//
// === Helper Functions ===
//

fn parse_params<T: DeserializeOwned>(params: serde_json::Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|e| RpcError {
        code: INVALID_PARAMS,
        message: format!("Invalid params: {}", e),
    })
}

/// Safely serialize to JSON value
fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError {
        code: INTERNAL_ERROR,
        message: format!("Serialization error: {}", e),
    })
}

fn parse_hash(field: &str, value: &str) -> Result<B256, RpcError> {
    value.parse::<B256>().map_err(|e| RpcError {
        code: INVALID_PARAMS,
        message: format!("Invalid params: {} is not a 32-byte hex value ({})", field, e),
    })
}

impl From<AnchorError> for RpcError {
    fn from(err: AnchorError) -> Self {
        let code = match &err {
            AnchorError::InvalidContent(_) => INVALID_PARAMS,
            AnchorError::NotFound(_) => NOT_FOUND,
            AnchorError::IllegalTransition { .. } => CONFLICT,
            AnchorError::Storage(_) | AnchorError::Config(_) => INTERNAL_ERROR,
            _ => SERVER_ERROR,
        };
        RpcError {
            code,
            message: err.to_string(),
        }
    }
}

//
// === Individual Handlers ===
//

/// Handle submitContent(owner, title, body)
async fn handle_submit_content(
    state: RpcState,
    params: serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let p: SubmitContentParams = parse_params(params)?;
    // The registration task outlives the request; its result lands in the record.
    let (ack, _task) = state.service.submit_content(&p.owner, &p.title, &p.body).await?;
    to_json(&ack)
}

/// Handle registerContent(id)
async fn handle_register_content(
    state: RpcState,
    params: serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let p: ContentIdParams = parse_params(params)?;
    let (ack, _task) = state.service.register_content(&p.id).await?;
    to_json(&ack)
}

async fn handle_edit_content(
    state: RpcState,
    params: serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let p: EditContentParams = parse_params(params)?;
    let record = state.service.edit_content(&p.id, &p.title, &p.body).await?;
    to_json(&record)
}

async fn handle_get_content(
    state: RpcState,
    params: serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let p: ContentIdParams = parse_params(params)?;
    to_json(&state.service.get_content(&p.id).await?)
}

async fn handle_list_content(
    state: RpcState,
    params: serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let p: ListContentParams = parse_params(params)?;
    to_json(&state.service.list_content(&p.owner, p.page, p.limit).await?)
}

/// Handle verifyContent(id, fingerprint)
async fn handle_verify_content(
    state: RpcState,
    params: serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let p: VerifyContentParams = parse_params(params)?;
    let expected = parse_hash("fingerprint", &p.fingerprint)?;
    to_json(&state.service.verify_content(&p.id, expected).await?)
}

async fn handle_sweep_stuck(state: RpcState) -> Result<serde_json::Value, RpcError> {
    to_json(&state.service.sweep_stuck().await?)
}

async fn handle_check_record(
    state: RpcState,
    params: serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let p: ContentIdParams = parse_params(params)?;
    to_json(&state.service.check_record(&p.id).await?)
}

async fn handle_fund_sponsor(state: RpcState) -> Result<serde_json::Value, RpcError> {
    to_json(&state.service.fund_sponsor().await?)
}

async fn handle_account_info(
    state: RpcState,
    params: serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let p: AccountParams = parse_params(params)?;
    to_json(&state.service.account_info(&p.identity).await?)
}

async fn handle_network_info(state: RpcState) -> Result<serde_json::Value, RpcError> {
    to_json(&state.service.network_info().await?)
}

async fn handle_transaction_status(
    state: RpcState,
    params: serde_json::Value,
) -> Result<serde_json::Value, RpcError> {
    let p: TransactionStatusParams = parse_params(params)?;
    let hash = parse_hash("hash", &p.hash)?;
    to_json(&state.service.transaction_status(hash).await?)
}
