//! Types for talking to the full node over JSON-RPC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error object returned by the node's JSON-RPC interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Symbolic name of the error code, as used by Bitcoin Core.
    pub fn code_name(&self) -> &'static str {
        match self.code {
            -1 => "RPC_MISC_ERROR",
            -3 => "RPC_TYPE_ERROR",
            -5 => "RPC_INVALID_ADDRESS_OR_KEY",
            -7 => "RPC_OUT_OF_MEMORY",
            -8 => "RPC_INVALID_PARAMETER",
            -20 => "RPC_DATABASE_ERROR",
            -22 => "RPC_DESERIALIZATION_ERROR",
            -25 => "RPC_VERIFY_ERROR",
            -26 => "RPC_VERIFY_REJECTED",
            -27 => "RPC_VERIFY_ALREADY_IN_CHAIN",
            -28 => "RPC_IN_WARMUP",
            -32600 => "RPC_INVALID_REQUEST",
            -32601 => "RPC_METHOD_NOT_FOUND",
            -32603 => "RPC_INTERNAL_ERROR",
            -32700 => "RPC_PARSE_ERROR",
            _ => "RPC_UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code_name(), self.code, self.message)
    }
}

/// Errors from a node call
#[derive(Debug, Clone, thiserror::Error)]
pub enum NodeError {
    /// The node could not be reached. Never retried by the core.
    #[error("Node unavailable: {0}")]
    Unavailable(String),

    /// The node answered with an RPC error.
    #[error("Node rejected the call: {0}")]
    Rejected(RpcError),

    #[error("Invalid node response: {0}")]
    InvalidResponse(String),
}

/// Subset of `getblockchaininfo` used for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockchainInfo {
    pub blocks: u64,
    pub headers: u64,
    #[serde(rename = "verificationprogress")]
    pub verification_progress: f64,
    #[serde(rename = "initialblockdownload", default)]
    pub initial_block_download: bool,
}

/// JSON-RPC response envelope.
#[derive(Debug, Deserialize)]
pub(crate) struct RpcResponse<T> {
    pub result: Option<T>,
    pub error: Option<RpcError>,
}

impl<T> RpcResponse<T> {
    pub fn into_result(self) -> Result<T, NodeError> {
        if let Some(error) = self.error {
            return Err(NodeError::Rejected(error));
        }
        self.result
            .ok_or_else(|| NodeError::InvalidResponse("Response carried neither result nor error".to_string()))
    }
}
