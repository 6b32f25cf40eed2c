//! RPC Method Implementations
//!
//! Each method corresponds to a JSON-RPC call. Methods are thin adapters
//! over [`Core`]; refusals are reported as `{code, message, tag}`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::consensus::Block;
use crate::crypto::Hash;
use crate::error::CoreError;
use crate::node::{AddBlockResult, Core};

const INVALID_PARAMS: i32 = -32602;
const METHOD_NOT_FOUND: i32 = -32601;
/// Largest block range returned by `getblocks`
const MAX_BLOCKS_PER_REQUEST: usize = 100;

/// JSON-RPC 2.0 Request
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Option<Value>,
    pub id: Value,
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub result: Option<Value>,
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

/// JSON-RPC Error
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    /// Rejection reason tag for core refusals
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                tag: None,
            }),
            id,
        }
    }

    /// Report a refusal from the core
    pub fn core_error(id: Value, err: &CoreError) -> Self {
        let kind = err.kind();
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code: kind.rpc_code(),
                message: err.detail().to_string(),
                tag: Some(format!("{:?}", kind)),
            }),
            id,
        }
    }
}

/// RPC Handler State
pub struct RpcState {
    pub core: Arc<Core>,
    /// Allow administrative calls such as `rollbackchain`
    pub allow_admin: bool,
}

/// Process a JSON-RPC request and return a response
pub fn handle_request(state: &RpcState, request: JsonRpcRequest) -> JsonRpcResponse {
    debug!(method = %request.method, "rpc request");
    let id = request.id;
    let params = request.params;
    match request.method.as_str() {
        "getblockcount" => get_block_count(state, id),
        "getblockhash" => get_block_hash(state, id, params),
        "getblock" => get_block(state, id, params),
        "getblocks" => get_blocks(state, id, params),
        "getblockstatus" => get_block_status(state, id, params),
        "getblocktemplate" => get_block_template(state, id, params),
        "submitblock" => submit_block(state, id, params),
        "sendrawtransaction" => send_raw_transaction(state, id, params),
        "gettransaction" => get_transaction(state, id, params),
        "gettransactionpool" => get_transaction_pool(state, id),
        "getheightstats" => get_height_stats(state, id, params),
        "getinfo" => get_info(state, id),
        "rollbackchain" if state.allow_admin => rollback_chain(state, id, params),
        method => JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("Method not found: {}", method)),
    }
}

/// First positional parameter, or a bare scalar
fn first_param(params: Option<Value>) -> Option<Value> {
    match params {
        Some(Value::Array(mut arr)) if !arr.is_empty() => Some(arr.swap_remove(0)),
        Some(Value::Array(_)) | None => None,
        Some(value) => Some(value),
    }
}

fn u64_param(params: Option<Value>) -> Option<u64> {
    first_param(params).and_then(|v| v.as_u64())
}

fn string_param(params: Option<Value>) -> Option<String> {
    match first_param(params) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

fn hash_param(params: Option<Value>) -> Option<Hash> {
    string_param(params).and_then(|s| Hash::from_hex(&s).ok())
}

fn hex_param(params: Option<Value>) -> Option<Vec<u8>> {
    string_param(params).and_then(|s| hex::decode(s).ok())
}

fn block_json(core: &Core, block: &Block) -> Value {
    let hash = block.hash();
    json!({
        "hash": hash.to_string(),
        "status": core.block_status(&hash),
        "major_version": block.header.major_version,
        "minor_version": block.header.minor_version,
        "prev_hash": block.prev_hash().to_string(),
        "timestamp": block.header.timestamp,
        "difficulty": block.header.difficulty,
        "nonce": block.header.nonce,
        "size": block.size(),
        "tx_hashes": block.tx_hashes().iter().map(|h| h.to_string()).collect::<Vec<_>>(),
        "blob": hex::encode(block.to_bytes()),
    })
}

/// Number of blocks in the main chain, genesis included
fn get_block_count(state: &RpcState, id: Value) -> JsonRpcResponse {
    JsonRpcResponse::success(id, json!(state.core.top_height() + 1))
}

fn get_block_hash(state: &RpcState, id: Value, params: Option<Value>) -> JsonRpcResponse {
    let Some(height) = u64_param(params) else {
        return JsonRpcResponse::error(id, INVALID_PARAMS, "Invalid params: expected height".into());
    };
    match state.core.block_hash(height) {
        Some(hash) => JsonRpcResponse::success(id, json!(hash.to_string())),
        None => JsonRpcResponse::error(id, INVALID_PARAMS, format!("Block height {} out of range", height)),
    }
}

/// Params: [hash] or [height]
fn get_block(state: &RpcState, id: Value, params: Option<Value>) -> JsonRpcResponse {
    let block = match first_param(params) {
        Some(Value::Number(n)) => n.as_u64().and_then(|h| state.core.block_by_height(h)),
        Some(Value::String(s)) => match Hash::from_hex(&s) {
            Ok(hash) => state.core.block_by_hash(&hash),
            Err(_) => {
                return JsonRpcResponse::error(id, INVALID_PARAMS, "Invalid params: bad block hash".into())
            }
        },
        _ => {
            return JsonRpcResponse::error(id, INVALID_PARAMS, "Invalid params: expected hash or height".into())
        }
    };
    match block {
        Some(block) => JsonRpcResponse::success(id, block_json(&state.core, &block)),
        None => JsonRpcResponse::error(id, INVALID_PARAMS, "Block not found".into()),
    }
}

/// Params: [start_height, count]
fn get_blocks(state: &RpcState, id: Value, params: Option<Value>) -> JsonRpcResponse {
    let (start, count) = match params {
        Some(Value::Array(arr)) if arr.len() == 2 => match (arr[0].as_u64(), arr[1].as_u64()) {
            (Some(start), Some(count)) => (start, count as usize),
            _ => return JsonRpcResponse::error(id, INVALID_PARAMS, "Invalid params: [start, count]".into()),
        },
        _ => return JsonRpcResponse::error(id, INVALID_PARAMS, "Invalid params: [start, count]".into()),
    };
    let blocks: Vec<Value> = state
        .core
        .blocks(start, count.min(MAX_BLOCKS_PER_REQUEST))
        .iter()
        .map(|block| block_json(&state.core, block))
        .collect();
    JsonRpcResponse::success(id, json!(blocks))
}

fn get_block_status(state: &RpcState, id: Value, params: Option<Value>) -> JsonRpcResponse {
    let Some(hash) = hash_param(params) else {
        return JsonRpcResponse::error(id, INVALID_PARAMS, "Invalid params: expected block hash".into());
    };
    JsonRpcResponse::success(id, json!(state.core.block_status(&hash)))
}

/// Params: [miner_address]
fn get_block_template(state: &RpcState, id: Value, params: Option<Value>) -> JsonRpcResponse {
    let Some(address) = string_param(params) else {
        return JsonRpcResponse::error(id, INVALID_PARAMS, "Invalid params: expected miner address".into());
    };
    match state.core.build_block_template(&address) {
        Ok(template) => JsonRpcResponse::success(
            id,
            json!({
                "blocktemplate_blob": hex::encode(template.block.to_bytes()),
                "hashing_blob": hex::encode(template.block.hashing_blob()),
                "height": template.height,
                "difficulty": template.difficulty,
                "reward": template.reward,
                "fees": template.fees,
                "size_limit": template.size_limit,
            }),
        ),
        Err(err) => JsonRpcResponse::core_error(id, &err),
    }
}

/// Params: [block_hex]
fn submit_block(state: &RpcState, id: Value, params: Option<Value>) -> JsonRpcResponse {
    let Some(bytes) = hex_param(params) else {
        return JsonRpcResponse::error(id, INVALID_PARAMS, "Invalid params: expected block hex".into());
    };
    match state.core.add_block(&bytes) {
        Ok(result) => JsonRpcResponse::success(id, json!({ "status": submit_status(&result), "result": result })),
        Err(err) => JsonRpcResponse::core_error(id, &err),
    }
}

/// Params: [tx_hex]
fn send_raw_transaction(state: &RpcState, id: Value, params: Option<Value>) -> JsonRpcResponse {
    let Some(bytes) = hex_param(params) else {
        return JsonRpcResponse::error(id, INVALID_PARAMS, "Invalid params: expected tx_hex".into());
    };
    match state.core.add_transaction(&bytes, false) {
        Ok(hash) => JsonRpcResponse::success(id, json!(hash.to_string())),
        Err(err) => JsonRpcResponse::core_error(id, &err),
    }
}

fn get_transaction(state: &RpcState, id: Value, params: Option<Value>) -> JsonRpcResponse {
    let Some(hash) = hash_param(params) else {
        return JsonRpcResponse::error(id, INVALID_PARAMS, "Invalid params: expected tx hash".into());
    };
    match state.core.transaction(&hash) {
        Some((tx, location)) => JsonRpcResponse::success(
            id,
            json!({
                "hash": hash.to_string(),
                "location": location,
                "size": tx.size(),
                "blob": hex::encode(tx.to_bytes()),
            }),
        ),
        None => JsonRpcResponse::error(id, INVALID_PARAMS, "Transaction not found".into()),
    }
}

fn get_transaction_pool(state: &RpcState, id: Value) -> JsonRpcResponse {
    let hashes: Vec<String> = state
        .core
        .pool_transactions()
        .iter()
        .map(|tx| tx.hash().to_string())
        .collect();
    JsonRpcResponse::success(id, json!(hashes))
}

/// Params: [height]
fn get_height_stats(state: &RpcState, id: Value, params: Option<Value>) -> JsonRpcResponse {
    let Some(height) = u64_param(params) else {
        return JsonRpcResponse::error(id, INVALID_PARAMS, "Invalid params: expected height".into());
    };
    let core = &state.core;
    match (
        core.difficulty_at_height(height),
        core.coins_emitted_at_height(height),
        core.deposit_amount_at_height(height),
    ) {
        (Some(difficulty), Some(coins), Some(deposits)) => JsonRpcResponse::success(
            id,
            json!({
                "height": height,
                "difficulty": difficulty,
                "already_generated_coins": coins,
                "total_deposits": deposits,
            }),
        ),
        _ => JsonRpcResponse::error(id, INVALID_PARAMS, format!("Block height {} out of range", height)),
    }
}

/// Returns general node information
fn get_info(state: &RpcState, id: Value) -> JsonRpcResponse {
    let stats = state.core.stats();
    JsonRpcResponse::success(
        id,
        json!({
            "chain": crate::constants::CURRENCY_NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "height": stats.height,
            "top_hash": stats.top_hash.to_string(),
            "difficulty": stats.next_difficulty,
            "cumulative_difficulty": stats.cumulative_difficulty.to_string(),
            "already_generated_coins": stats.already_generated_coins,
            "total_deposits": stats.total_deposits,
            "outputs": stats.output_count,
            "spent_key_images": stats.spent_key_images,
            "alternative_blocks": stats.alternative_blocks,
            "pool": stats.pool,
            "halted": state.core.is_halted(),
        }),
    )
}

/// Params: [height]
fn rollback_chain(state: &RpcState, id: Value, params: Option<Value>) -> JsonRpcResponse {
    let Some(height) = u64_param(params) else {
        return JsonRpcResponse::error(id, INVALID_PARAMS, "Invalid params: expected height".into());
    };
    match state.core.rollback_chain_to(height) {
        Ok(removed) => JsonRpcResponse::success(id, json!({ "height": height, "removed": removed })),
        Err(err) => JsonRpcResponse::core_error(id, &err),
    }
}

/// Status string miners expect for an accepted block
fn submit_status(result: &AddBlockResult) -> &'static str {
    match result {
        AddBlockResult::Accepted { .. } | AddBlockResult::SwitchedChain { .. } => "OK",
        AddBlockResult::AcceptedAlternative { .. } => "ALTERNATIVE",
        AddBlockResult::AlreadyExists => "DUPLICATE",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::CurrencyBuilder;
    use crate::node::ManualClock;

    fn state() -> RpcState {
        let currency = Arc::new(CurrencyBuilder::testnet().build().unwrap());
        let clock = Arc::new(ManualClock::new(currency.genesis_timestamp + 1_000));
        RpcState {
            core: Arc::new(Core::new(currency, clock)),
            allow_admin: false,
        }
    }

    fn call(state: &RpcState, method: &str, params: Value) -> JsonRpcResponse {
        handle_request(
            state,
            JsonRpcRequest {
                jsonrpc: "2.0".into(),
                method: method.into(),
                params: Some(params),
                id: json!(1),
            },
        )
    }

    #[test]
    fn test_block_count_and_genesis_hash() {
        let state = state();
        let count = call(&state, "getblockcount", json!([]));
        assert_eq!(count.result, Some(json!(1)));

        let hash = call(&state, "getblockhash", json!([0]));
        assert_eq!(hash.result, Some(json!(state.core.top_hash().to_string())));

        let missing = call(&state, "getblockhash", json!([5]));
        assert_eq!(missing.error.unwrap().code, INVALID_PARAMS);
    }

    #[test]
    fn test_core_refusal_carries_tag() {
        let state = state();
        let response = call(&state, "sendrawtransaction", json!(["00"]));
        let error = response.error.unwrap();
        assert_eq!(error.tag.as_deref(), Some("MalformedStructure"));
        assert_eq!(error.code, crate::error::ErrorKind::MalformedStructure.rpc_code());
    }

    #[test]
    fn test_admin_methods_hidden_by_default() {
        let state = state();
        let response = call(&state, "rollbackchain", json!([0]));
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[test]
    fn test_template_needs_valid_address() {
        let state = state();
        let bad = call(&state, "getblocktemplate", json!(["nope"]));
        assert!(bad.error.is_some());

        let address = crate::wallet::KeyPair::generate().address;
        let good = call(&state, "getblocktemplate", json!([address]));
        let result = good.result.unwrap();
        assert_eq!(result["height"], json!(1));
    }
}
