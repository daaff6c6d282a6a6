//! Electrum JSON-RPC wire types
//!
//! Messages are newline-delimited JSON-RPC 2.0 objects. The server answers
//! requests by id and pushes subscription notifications without one.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const METHOD_VERSION: &str = "server.version";
pub const METHOD_PING: &str = "server.ping";
pub const METHOD_SUBSCRIBE: &str = "blockchain.scripthash.subscribe";
pub const METHOD_LIST_UNSPENT: &str = "blockchain.scripthash.listunspent";
pub const METHOD_GET_HISTORY: &str = "blockchain.scripthash.get_history";
pub const METHOD_GET_TRANSACTION: &str = "blockchain.transaction.get";

#[derive(Debug, Clone, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Vec<Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }

    /// Serialized line including the trailing newline
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Anything the server can send us
#[derive(Debug, Clone, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response {
        id: u64,
        result: Result<Value, String>,
    },
    /// `blockchain.scripthash.subscribe` push: (script hash, status)
    ScriptHashNotification {
        script_hash: String,
        status: Option<String>,
    },
    /// Notifications we don't track (headers etc.)
    Other,
}

impl Incoming {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        let raw: RawMessage = serde_json::from_str(line)?;

        if let Some(id) = raw.id {
            let result = match raw.error {
                Some(err) if !err.is_null() => Err(describe_error(err)),
                _ => Ok(raw.result.unwrap_or(Value::Null)),
            };
            return Ok(Incoming::Response { id, result });
        }

        if raw.method.as_deref() == Some(METHOD_SUBSCRIBE) {
            if let Some(Value::Array(params)) = raw.params {
                if let Some(script_hash) = params.first().and_then(|v| v.as_str()) {
                    let status = params.get(1).and_then(|v| v.as_str()).map(String::from);
                    return Ok(Incoming::ScriptHashNotification {
                        script_hash: script_hash.to_string(),
                        status,
                    });
                }
            }
        }

        Ok(Incoming::Other)
    }
}

fn describe_error(err: Value) -> String {
    match serde_json::from_value::<RpcError>(err.clone()) {
        Ok(rpc) if !rpc.message.is_empty() => format!("{} (code {})", rpc.message, rpc.code),
        _ => err.to_string(),
    }
}

/// Entry of `blockchain.scripthash.get_history`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HistoryEntry {
    pub tx_hash: String,
    /// 0 or negative for mempool transactions
    pub height: i64,
    #[serde(default)]
    pub fee: Option<u64>,
}

/// Entry of `blockchain.scripthash.listunspent`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UnspentEntry {
    pub tx_hash: String,
    pub tx_pos: u32,
    pub height: i64,
    pub value: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_line() {
        let req = Request::new(7, METHOD_GET_HISTORY, vec![json!("abcd")]);
        let line = req.to_line().unwrap();
        assert!(line.ends_with('\n'));
        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert_eq!(value["method"], "blockchain.scripthash.get_history");
        assert_eq!(value["params"], json!(["abcd"]));
    }

    #[test]
    fn test_parse_response_and_error() {
        let ok = Incoming::parse(r#"{"jsonrpc":"2.0","id":1,"result":["ElectrumX 1.16","1.4"]}"#).unwrap();
        assert_eq!(
            ok,
            Incoming::Response {
                id: 1,
                result: Ok(json!(["ElectrumX 1.16", "1.4"]))
            }
        );

        let err = Incoming::parse(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32600,"message":"bad request"}}"#,
        )
        .unwrap();
        match err {
            Incoming::Response { id, result: Err(msg) } => {
                assert_eq!(id, 2);
                assert!(msg.contains("bad request"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_notification() {
        let note = Incoming::parse(
            r#"{"jsonrpc":"2.0","method":"blockchain.scripthash.subscribe","params":["aa11","bb22"]}"#,
        )
        .unwrap();
        assert_eq!(
            note,
            Incoming::ScriptHashNotification {
                script_hash: "aa11".to_string(),
                status: Some("bb22".to_string()),
            }
        );

        let headers = Incoming::parse(
            r#"{"jsonrpc":"2.0","method":"blockchain.headers.subscribe","params":[{"height":1}]}"#,
        )
        .unwrap();
        assert_eq!(headers, Incoming::Other);
    }

    #[test]
    fn test_unspent_entry() {
        let entries: Vec<UnspentEntry> = serde_json::from_value(json!([
            {"tx_hash": "ff", "tx_pos": 1, "height": 0, "value": 1500}
        ]))
        .unwrap();
        assert_eq!(entries[0].tx_pos, 1);
        assert_eq!(entries[0].value, 1500);
    }
}
