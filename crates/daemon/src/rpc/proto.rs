//! JSON-RPC 2.0 envelope types and the stable error-code mapping.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use hb_domain::Error;

// JSON-RPC protocol-level codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Application error codes, keyed by error kind. Part of the RPC contract.
fn code_for_kind(kind: &str) -> i64 {
    match kind {
        "validation-error" => 1000,
        "auth-error" => 1001,
        "permission-denied" => 1002,
        "not-found" => 1003,
        "ambiguous-prefix" => 1004,
        "conflict" => 1005,
        "invariant-violation" => 1006,
        "adapter-error" => 1007,
        "provider-error" => 1008,
        "cancelled" => 1009,
        _ => 1010, // internal
    }
}

#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Response {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, error: RpcError) -> Self {
        Response {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error),
        }
    }
}

impl RpcError {
    pub fn protocol(code: i64, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Map a domain error to the wire error, carrying structured context in
/// `data` where the kind defines any.
pub fn to_rpc_error(err: &Error) -> RpcError {
    let kind = err.kind();
    let mut data = serde_json::Map::new();
    data.insert("kind".into(), Value::String(kind.to_string()));

    match err {
        Error::AmbiguousPrefix { candidates, .. } => {
            let entries: Vec<Value> = candidates
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "id": c.id.to_string(),
                        "short-id": hb_domain::id::short_id(&c.id),
                        "created-at": c.created_at,
                    })
                })
                .collect();
            data.insert("candidates".into(), Value::Array(entries));
        }
        Error::Adapter {
            platform, detail, ..
        } => {
            data.insert("platform".into(), Value::String(platform.clone()));
            if let Some(detail) = detail {
                data.insert("adapter-error".into(), detail.clone());
            }
        }
        Error::Provider { provider, .. } => {
            data.insert("provider".into(), Value::String(provider.clone()));
        }
        _ => {}
    }

    RpcError {
        code: code_for_kind(kind),
        message: err.to_string(),
        data: Some(Value::Object(data)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hb_domain::error::PrefixCandidate;

    #[test]
    fn kinds_map_to_stable_codes() {
        assert_eq!(to_rpc_error(&Error::Validation("x".into())).code, 1000);
        assert_eq!(to_rpc_error(&Error::Auth("x".into())).code, 1001);
        assert_eq!(to_rpc_error(&Error::PermissionDenied("x".into())).code, 1002);
        assert_eq!(to_rpc_error(&Error::NotFound("x".into())).code, 1003);
        assert_eq!(to_rpc_error(&Error::Cancelled).code, 1009);
        assert_eq!(to_rpc_error(&Error::Internal("x".into())).code, 1010);
    }

    #[test]
    fn ambiguous_prefix_carries_candidates() {
        let id = hb_domain::id::new_id();
        let err = Error::AmbiguousPrefix {
            prefix: "ab".into(),
            candidates: vec![PrefixCandidate { id, created_at: 7 }],
        };
        let rpc = to_rpc_error(&err);
        assert_eq!(rpc.code, 1004);
        let data = rpc.data.unwrap();
        assert_eq!(data["kind"], "ambiguous-prefix");
        assert_eq!(data["candidates"][0]["id"], id.to_string());
        assert_eq!(data["candidates"][0]["created-at"], 7);
    }

    #[test]
    fn adapter_error_nests_platform_detail() {
        let err = Error::Adapter {
            platform: "telegram".into(),
            message: "bad chat".into(),
            detail: Some(serde_json::json!({"telegram-error-code": 400})),
        };
        let rpc = to_rpc_error(&err);
        assert_eq!(rpc.code, 1007);
        let data = rpc.data.unwrap();
        assert_eq!(data["platform"], "telegram");
        assert_eq!(data["adapter-error"]["telegram-error-code"], 400);
    }
}
