use serde::{Deserialize, Serialize};

// JSON-RPC 2.0 Request
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub id: u64,
}

// JSON-RPC 2.0 Response
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

pub const INVALID_PARAMS: i32 = -32602;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INTERNAL_ERROR: i32 = -32603;
pub const NOT_FOUND: i32 = -32004;
pub const CONFLICT: i32 = -32009;
pub const SERVER_ERROR: i32 = -32000;

// Method-specific param types

#[derive(Debug, Deserialize)]
pub struct SubmitContentParams {
    pub owner: String,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct ContentIdParams {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct EditContentParams {
    pub id: String,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct ListContentParams {
    pub owner: String,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_page() -> usize {
    1
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Deserialize)]
pub struct VerifyContentParams {
    pub id: String,
    /// Hex fingerprint the caller expects to find on chain.
    pub fingerprint: String,
}

#[derive(Debug, Deserialize)]
pub struct AccountParams {
    pub identity: String,
}

#[derive(Debug, Deserialize)]
pub struct TransactionStatusParams {
    pub hash: String,
}
