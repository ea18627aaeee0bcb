// JSON-RPC 2.0 client shared by the chain adapter and the CLI
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::ChainError;

/// Node error code used by several providers for request throttling.
const RATE_LIMIT_CODE: i64 = -32005;

pub struct RpcClient {
    url: String,
    client: Client,
    request_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            url,
            client,
            request_id: AtomicU64::new(1),
        }
    }

    pub async fn send_request(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ChainError::Network(format!("RPC request failed: {}", e)))?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(ChainError::RateLimited {
                retry_after: retry_after_hint(response.headers()),
            });
        }
        if response.status().is_server_error() {
            return Err(ChainError::Network(format!("HTTP {}", response.status())));
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| ChainError::Malformed(format!("Failed to parse response: {}", e)))?;

        if let Some(error) = json.get("error") {
            return Err(classify_rpc_error(error));
        }

        Ok(json["result"].clone())
    }
}

/// Seconds form of `Retry-After`; the HTTP-date form is ignored.
pub fn retry_after_hint(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Sorts a JSON-RPC error object into throttling, revert or transport failure.
pub fn classify_rpc_error(error: &Value) -> ChainError {
    let code = error["code"].as_i64().unwrap_or(0);
    let message = error["message"].as_str().unwrap_or("Unknown error").to_string();
    let lower = message.to_lowercase();

    if code == RATE_LIMIT_CODE || lower.contains("rate limit") || lower.contains("too many requests") {
        return ChainError::RateLimited { retry_after: None };
    }

    let data = error["data"].as_str().and_then(|d| hex::decode(d.trim_start_matches("0x")).ok());
    let decoded = data.as_deref().and_then(decode_revert_reason);

    // code 3 is "execution reverted" with revert data attached
    if code == 3 || lower.contains("revert") || lower.contains("failedop") || decoded.is_some() {
        return match decoded {
            Some(reason) => ChainError::Reverted(format!("{}: {}", message, reason)),
            None => ChainError::Reverted(message),
        };
    }
    if ["AA1", "AA2", "AA3", "AA4"].iter().any(|code| message.contains(code)) {
        return ChainError::Reverted(message);
    }

    match code {
        -32603 | -32000 => ChainError::Network(message),
        _ => ChainError::Malformed(format!("RPC error {}: {}", code, message)),
    }
}

/// Decodes `Error(string)` and the coordinator's `FailedOp(uint256,string)`
/// revert payloads.
pub fn decode_revert_reason(data: &[u8]) -> Option<String> {
    const ERROR_STRING: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
    const FAILED_OP: [u8; 4] = [0x22, 0x02, 0x66, 0xb6];

    if data.len() < 4 {
        return None;
    }
    let (selector, body) = data.split_at(4);
    let offset_word = if selector == ERROR_STRING {
        0
    } else if selector == FAILED_OP {
        1
    } else {
        return None;
    };

    let offset = read_word_usize(body, offset_word * 32)?;
    let len = read_word_usize(body, offset)?;
    let start = offset.checked_add(32)?;
    let bytes = body.get(start..start.checked_add(len)?)?;
    String::from_utf8(bytes.to_vec()).ok()
}

fn read_word_usize(data: &[u8], at: usize) -> Option<usize> {
    let word = data.get(at..at.checked_add(32)?)?;
    if word[..24].iter().any(|b| *b != 0) {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&word[24..]);
    usize::try_from(u64::from_be_bytes(buf)).ok()
}
