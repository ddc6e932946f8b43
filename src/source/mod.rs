//! HTTP block sources.
//!
//! Each adapter polls one endpoint and normalizes its dialect into a
//! [`Block`]. Adapters never retry and never back off on their own:
//! the dispatcher races them and the runner's tick is the timing
//! authority. Parsing is kept in pure functions over decoded JSON so
//! each dialect is testable without a live endpoint.

pub mod dispatcher;
pub mod jsonpath;
pub mod limiter;
pub mod stats;

use crate::block::Block;
use chrono::{DateTime, Utc};
use limiter::RateLimiter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Wire dialect spoken by a source endpoint. Adding a dialect means
/// adding a variant and its parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dialect {
    /// TronGrid-style REST: `blockID` + `block_header.raw_data`.
    #[serde(rename = "rest-trongrid")]
    RestTrongrid,
    /// Two-step JSON-RPC: latest height, then block by height.
    #[serde(rename = "rpc-eth-style")]
    RpcEthStyle,
    /// Arbitrary JSON shapes via configured paths.
    #[serde(rename = "rest-generic")]
    RestGeneric,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::RestTrongrid => "rest-trongrid",
            Dialect::RpcEthStyle => "rpc-eth-style",
            Dialect::RestGeneric => "rest-generic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HttpMethod {
    #[default]
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
}

/// Unit of the time value a generic source reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeUnit {
    #[default]
    #[serde(rename = "ms")]
    Ms,
    #[serde(rename = "s")]
    S,
}

/// One HTTP source. `base_rps`/`max_rps` bound the token bucket;
/// headers are applied to requests verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// POST body, raw JSON text.
    #[serde(default)]
    pub body: String,
    pub dialect: Dialect,

    // rest-generic extraction
    #[serde(default)]
    pub height_path: String,
    #[serde(default)]
    pub hash_path: String,
    #[serde(default)]
    pub time_path: String,
    #[serde(default)]
    pub time_unit: TimeUnit,

    // rpc-eth-style methods
    #[serde(default = "default_rpc_height_method")]
    pub rpc_height_method: String,
    #[serde(default = "default_rpc_block_method")]
    pub rpc_block_method: String,

    #[serde(default = "default_base_rps")]
    pub base_rps: u32,
    #[serde(default = "default_max_rps")]
    pub max_rps: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_rpc_height_method() -> String {
    "eth_blockNumber".to_string()
}
fn default_rpc_block_method() -> String {
    "eth_getBlockByNumber".to_string()
}
fn default_base_rps() -> u32 {
    1
}
fn default_max_rps() -> u32 {
    5
}
fn default_timeout_ms() -> u64 {
    6000
}

/// Adapter-level failures. `Disabled` and `RateLimited` are
/// non-results to the dispatcher; the rest feed its loser
/// aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("source disabled")]
    Disabled,
    #[error("rate limited")]
    RateLimited,
    #[error("request timed out")]
    Timeout,
    #[error("network: {0}")]
    Network(String),
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("decode: {0}")]
    Decode(String),
    #[error("invalid block: {0}")]
    InvalidBlock(&'static str),
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SourceError::Timeout
        } else if err.is_decode() {
            SourceError::Decode(err.to_string())
        } else {
            SourceError::Network(err.to_string())
        }
    }
}

/// The seam the dispatcher races over. Production adapters implement
/// it over HTTP; tests race deterministic mocks.
pub trait Fetch: Send + Sync + 'static {
    fn id(&self) -> &str;
    fn dialect_tag(&self) -> &'static str;
    fn enabled(&self) -> bool;
    fn fetch_latest(&self) -> impl Future<Output = Result<Block, SourceError>> + Send;
}

/// Block fields as extracted from a source response, before
/// normalization.
#[derive(Debug, Clone, PartialEq)]
struct RawBlock {
    height: u64,
    hash: String,
    /// Unix seconds; `None` falls back to the observation instant.
    time_unix: Option<i64>,
}

/// Polls one endpoint and yields normalized blocks. Owns its rate
/// limiter and HTTP client exclusively.
pub struct SourceAdapter {
    cfg: SourceConfig,
    limiter: RateLimiter,
    client: reqwest::Client,
}

impl SourceAdapter {
    pub fn new(cfg: SourceConfig) -> Result<Self, SourceError> {
        let limiter = RateLimiter::new(cfg.base_rps, cfg.max_rps);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()?;
        Ok(Self {
            cfg,
            limiter,
            client,
        })
    }

    pub fn config(&self) -> &SourceConfig {
        &self.cfg
    }

    async fn request_json(&self, body: Option<&str>) -> Result<Value, SourceError> {
        let method = match self.cfg.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        };
        let mut req = self.client.request(method, &self.cfg.url);
        for (key, value) in &self.cfg.headers {
            req = req.header(key.as_str(), value.as_str());
        }
        if let Some(body) = body {
            req = req
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.to_string());
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SourceError::HttpStatus(status.as_u16()));
        }
        Ok(resp.json::<Value>().await?)
    }

    async fn rpc_call(&self, id: u32, method: &str, params: Value) -> Result<Value, SourceError> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut req = self.client.post(&self.cfg.url).json(&payload);
        for (key, value) in &self.cfg.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SourceError::HttpStatus(status.as_u16()));
        }
        let raw: Value = resp.json().await?;
        if !raw["error"].is_null() {
            return Err(SourceError::Decode(format!("rpc error: {}", raw["error"])));
        }
        Ok(raw)
    }

    /// Two-step fetch: latest height, then the block at that height.
    /// Gateways whose first response already carries a full block
    /// object skip the second call.
    async fn fetch_rpc(&self) -> Result<RawBlock, SourceError> {
        let first = self
            .rpc_call(1, &self.cfg.rpc_height_method, Value::Array(Vec::new()))
            .await?;
        if let Some(raw) = parse_rpc_block(&first) {
            return Ok(raw);
        }

        let height =
            parse_rpc_height(&first).ok_or(SourceError::InvalidBlock("rpc height missing"))?;
        let params = serde_json::json!([format!("0x{height:x}"), false]);
        let second = self.rpc_call(2, &self.cfg.rpc_block_method, params).await?;
        parse_rpc_block(&second).ok_or(SourceError::InvalidBlock("rpc block missing fields"))
    }

    fn finalize(&self, raw: RawBlock) -> Result<Block, SourceError> {
        let hash = raw.hash.trim().to_ascii_lowercase();
        if hash.is_empty() {
            return Err(SourceError::InvalidBlock("empty hash"));
        }
        if raw.height == 0 {
            return Err(SourceError::InvalidBlock("zero height"));
        }
        let time = raw
            .time_unix
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now);
        Ok(Block {
            height: raw.height.to_string(),
            hash,
            time,
            source_id: self.cfg.id.clone(),
        })
    }
}

impl Fetch for SourceAdapter {
    fn id(&self) -> &str {
        &self.cfg.id
    }

    fn dialect_tag(&self) -> &'static str {
        self.cfg.dialect.as_str()
    }

    fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    async fn fetch_latest(&self) -> Result<Block, SourceError> {
        if !self.cfg.enabled {
            return Err(SourceError::Disabled);
        }
        if !self.limiter.try_acquire() {
            return Err(SourceError::RateLimited);
        }

        let raw = match self.cfg.dialect {
            Dialect::RpcEthStyle => self.fetch_rpc().await?,
            Dialect::RestTrongrid => {
                let body = matches!(self.cfg.method, HttpMethod::Post).then(|| {
                    if self.cfg.body.is_empty() {
                        "{}"
                    } else {
                        self.cfg.body.as_str()
                    }
                });
                let decoded = self.request_json(body).await?;
                parse_trongrid(&decoded)
                    .ok_or(SourceError::InvalidBlock("trongrid block missing fields"))?
            }
            Dialect::RestGeneric => {
                let body = (!self.cfg.body.is_empty()).then(|| self.cfg.body.as_str());
                let decoded = self.request_json(body).await?;
                parse_generic(&decoded, &self.cfg)?
            }
        };
        self.finalize(raw)
    }
}

// --- Dialect parsers (pure) ---

/// `result` of a height call: `0x`-hex string or JSON number.
fn parse_rpc_height(raw: &Value) -> Option<u64> {
    value_to_u64(raw.get("result")?)
}

/// `result` of a block call: `hash` (or Tron-style `blockID`),
/// `number` (hex or number), `timestamp` (hex seconds, number
/// seconds, or milliseconds when beyond 2e12).
fn parse_rpc_block(raw: &Value) -> Option<RawBlock> {
    let obj = raw.get("result")?.as_object()?;

    let hash = obj
        .get("hash")
        .and_then(Value::as_str)
        .filter(|h| !h.is_empty())
        .or_else(|| obj.get("blockID").and_then(Value::as_str))
        .filter(|h| !h.is_empty())?
        .to_string();

    let height = value_to_u64(obj.get("number")?)?;

    let time_unix = obj.get("timestamp").and_then(|ts| match ts {
        Value::String(s) => hex_to_u64(s).map(|v| v as i64),
        Value::Number(_) => value_to_i64(ts).map(coerce_unix_seconds),
        _ => None,
    });

    Some(RawBlock {
        height,
        hash,
        time_unix,
    })
}

/// TronGrid `getnowblock` shape.
fn parse_trongrid(raw: &Value) -> Option<RawBlock> {
    let hash = raw
        .get("blockID")
        .and_then(Value::as_str)
        .filter(|h| !h.is_empty())?
        .to_string();
    let raw_data = raw.get("block_header")?.get("raw_data")?;
    let height = raw_data.get("number").and_then(Value::as_u64)?;
    let time_unix = raw_data
        .get("timestamp")
        .and_then(Value::as_i64)
        .map(|ms| ms / 1000);

    Some(RawBlock {
        height,
        hash,
        time_unix,
    })
}

/// Configured-path extraction for arbitrary JSON shapes.
fn parse_generic(raw: &Value, cfg: &SourceConfig) -> Result<RawBlock, SourceError> {
    let height_value = jsonpath::lookup(raw, &cfg.height_path)
        .map_err(|e| SourceError::Decode(format!("heightPath: {e}")))?;
    let height = value_to_u64(height_value)
        .ok_or(SourceError::Decode("heightPath: not a number".to_string()))?;

    let hash = jsonpath::lookup(raw, &cfg.hash_path)
        .map_err(|e| SourceError::Decode(format!("hashPath: {e}")))?
        .as_str()
        .ok_or(SourceError::Decode("hashPath: not a string".to_string()))?
        .to_string();

    let time_unix = if cfg.time_path.is_empty() {
        None
    } else {
        let time_value = jsonpath::lookup(raw, &cfg.time_path)
            .map_err(|e| SourceError::Decode(format!("timePath: {e}")))?;
        let v = value_to_i64(time_value)
            .ok_or(SourceError::Decode("timePath: not a number".to_string()))?;
        Some(match cfg.time_unit {
            TimeUnit::Ms => v / 1000,
            TimeUnit::S => v,
        })
    };

    Ok(RawBlock {
        height,
        hash,
        time_unix,
    })
}

fn value_to_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let s = s.trim();
            match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => s.parse().ok(),
            }
        }
        _ => None,
    }
}

fn value_to_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn hex_to_u64(s: &str) -> Option<u64> {
    let s = s.trim();
    let hex = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    u64::from_str_radix(hex, 16).ok()
}

/// Values beyond 2e12 can only be milliseconds.
fn coerce_unix_seconds(v: i64) -> i64 {
    if v > 2_000_000_000_000 {
        v / 1000
    } else {
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn generic_cfg() -> SourceConfig {
        SourceConfig {
            id: "g1".to_string(),
            name: String::new(),
            enabled: true,
            method: HttpMethod::Get,
            url: "http://localhost/block".to_string(),
            headers: HashMap::new(),
            body: String::new(),
            dialect: Dialect::RestGeneric,
            height_path: "data.height".to_string(),
            hash_path: "data.hash".to_string(),
            time_path: "data.ts".to_string(),
            time_unit: TimeUnit::Ms,
            rpc_height_method: default_rpc_height_method(),
            rpc_block_method: default_rpc_block_method(),
            base_rps: 1,
            max_rps: 5,
            timeout_ms: 6000,
        }
    }

    #[test]
    fn test_rpc_height_hex_and_number() {
        assert_eq!(parse_rpc_height(&json!({"result": "0x10"})), Some(16));
        assert_eq!(parse_rpc_height(&json!({"result": 42})), Some(42));
        assert_eq!(parse_rpc_height(&json!({"result": null})), None);
        assert_eq!(parse_rpc_height(&json!({})), None);
    }

    #[test]
    fn test_rpc_block_hex_fields() {
        let raw = json!({"result": {
            "hash": "0xABCD",
            "number": "0x2a",
            "timestamp": "0x65e8f380"
        }});
        let blk = parse_rpc_block(&raw).unwrap();
        assert_eq!(blk.height, 42);
        assert_eq!(blk.hash, "0xABCD");
        assert_eq!(blk.time_unix, Some(0x65e8f380));
    }

    #[test]
    fn test_rpc_block_id_fallback_and_ms_timestamp() {
        let raw = json!({"result": {
            "blockID": "00abc",
            "number": 77,
            "timestamp": 1_700_000_000_123i64
        }});
        let blk = parse_rpc_block(&raw).unwrap();
        assert_eq!(blk.hash, "00abc");
        assert_eq!(blk.height, 77);
        assert_eq!(blk.time_unix, Some(1_700_000_000));
    }

    #[test]
    fn test_rpc_block_second_timestamp_kept() {
        let raw = json!({"result": {"hash": "aa", "number": 7, "timestamp": 1_700_000_000i64}});
        assert_eq!(
            parse_rpc_block(&raw).unwrap().time_unix,
            Some(1_700_000_000)
        );
    }

    #[test]
    fn test_rpc_block_rejects_missing_hash() {
        assert!(parse_rpc_block(&json!({"result": {"number": 7}})).is_none());
        assert!(parse_rpc_block(&json!({"result": "0x10"})).is_none());
    }

    #[test]
    fn test_trongrid_shape() {
        let raw = json!({
            "blockID": "0000ABCD",
            "block_header": {"raw_data": {"number": 123, "timestamp": 1_700_000_000_000i64}}
        });
        let blk = parse_trongrid(&raw).unwrap();
        assert_eq!(blk.height, 123);
        assert_eq!(blk.hash, "0000ABCD");
        assert_eq!(blk.time_unix, Some(1_700_000_000));
    }

    #[test]
    fn test_trongrid_missing_fields() {
        assert!(parse_trongrid(&json!({"blockID": ""})).is_none());
        assert!(parse_trongrid(&json!({"blockID": "aa"})).is_none());
    }

    #[test]
    fn test_generic_paths_with_ms_time() {
        let raw = json!({"data": {"height": "64", "hash": "00FF", "ts": 1_700_000_000_500i64}});
        let blk = parse_generic(&raw, &generic_cfg()).unwrap();
        assert_eq!(blk.height, 64);
        assert_eq!(blk.hash, "00FF");
        assert_eq!(blk.time_unix, Some(1_700_000_000));
    }

    #[test]
    fn test_generic_seconds_and_no_time_path() {
        let mut cfg = generic_cfg();
        cfg.time_unit = TimeUnit::S;
        let raw = json!({"data": {"height": 9, "hash": "aa", "ts": 1_700_000_000i64}});
        assert_eq!(
            parse_generic(&raw, &cfg).unwrap().time_unix,
            Some(1_700_000_000)
        );

        cfg.time_path = String::new();
        assert_eq!(parse_generic(&raw, &cfg).unwrap().time_unix, None);
    }

    #[test]
    fn test_generic_bad_paths_are_decode_errors() {
        let raw = json!({"data": {"hash": "aa"}});
        match parse_generic(&raw, &generic_cfg()) {
            Err(SourceError::Decode(msg)) => assert!(msg.contains("heightPath")),
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn test_finalize_normalizes_and_validates() {
        let adapter = SourceAdapter::new(generic_cfg()).unwrap();
        let ok = adapter
            .finalize(RawBlock {
                height: 5,
                hash: " 00ABcd ".to_string(),
                time_unix: Some(1_700_000_000),
            })
            .unwrap();
        assert_eq!(ok.hash, "00abcd");
        assert_eq!(ok.height, "5");
        assert_eq!(ok.source_id, "g1");
        assert!(ok.is_valid());

        assert_eq!(
            adapter.finalize(RawBlock {
                height: 0,
                hash: "aa".to_string(),
                time_unix: None,
            }),
            Err(SourceError::InvalidBlock("zero height"))
        );
        assert_eq!(
            adapter.finalize(RawBlock {
                height: 3,
                hash: "   ".to_string(),
                time_unix: None,
            }),
            Err(SourceError::InvalidBlock("empty hash"))
        );
    }

    #[tokio::test]
    async fn test_disabled_and_rate_limited_short_circuit() {
        let mut cfg = generic_cfg();
        cfg.enabled = false;
        let adapter = SourceAdapter::new(cfg).unwrap();
        assert_eq!(adapter.fetch_latest().await, Err(SourceError::Disabled));

        let mut cfg = generic_cfg();
        cfg.base_rps = 1;
        cfg.max_rps = 1;
        // unroutable URL: the limiter must reject before any I/O
        cfg.url = "http://127.0.0.1:1/unreachable".to_string();
        let adapter = SourceAdapter::new(cfg).unwrap();
        // burn the single token (the request itself fails fast)
        let first = adapter.fetch_latest().await;
        assert_ne!(first, Err(SourceError::RateLimited));
        assert_eq!(adapter.fetch_latest().await, Err(SourceError::RateLimited));
    }
}
