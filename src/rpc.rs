// src/rpc.rs
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::{keccak256, Address, U256};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::contracts::ContractDescriptor;
use crate::error::{PortfolioError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chain {
    Ethereum,
    Optimism,
    Gnosis,
    Base,
    Arbitrum,
    Polygon,
}

impl Chain {
    /// Network id used in provider hostnames.
    pub fn network(&self) -> &'static str {
        match self {
            Chain::Ethereum => "eth",
            Chain::Optimism => "opt",
            Chain::Gnosis => "gnosis",
            Chain::Base => "base",
            Chain::Arbitrum => "arb",
            Chain::Polygon => "polygon",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Optimism => "optimism",
            Chain::Gnosis => "gnosis",
            Chain::Base => "base",
            Chain::Arbitrum => "arbitrum",
            Chain::Polygon => "polygon",
        }
    }
}

impl FromStr for Chain {
    type Err = PortfolioError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ethereum" => Ok(Chain::Ethereum),
            "optimism" => Ok(Chain::Optimism),
            "gnosis" => Ok(Chain::Gnosis),
            "base" => Ok(Chain::Base),
            "arbitrum" => Ok(Chain::Arbitrum),
            "polygon" => Ok(Chain::Polygon),
            other => Err(PortfolioError::UnsupportedChain(other.to_string())),
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static argument accepted by a view call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallArg {
    Address(Address),
    Uint(U256),
}

/// Decoded first return value of a view call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewOutput {
    Uint(U256),
    Text(String),
}

impl ViewOutput {
    pub fn into_uint(self) -> Result<U256> {
        match self {
            ViewOutput::Uint(v) => Ok(v),
            ViewOutput::Text(t) => Err(PortfolioError::Decode(format!(
                "expected numeric output, got string '{}'",
                t
            ))),
        }
    }

    pub fn into_text(self) -> Result<String> {
        match self {
            ViewOutput::Text(t) => Ok(t),
            ViewOutput::Uint(v) => Err(PortfolioError::Decode(format!(
                "expected string output, got number {}",
                v
            ))),
        }
    }
}

/// A view call against a validated descriptor.
#[derive(Debug, Clone)]
pub struct ViewCall<'a> {
    pub contract: &'a str,
    pub chain: Chain,
    pub address: Address,
    pub abi: &'a [Value],
    pub method: &'a str,
    pub args: Vec<CallArg>,
}

impl<'a> ViewCall<'a> {
    /// Checks the descriptor fields a call needs, failing with the missing one.
    pub fn new(descriptor: &'a ContractDescriptor, method: &'a str, args: Vec<CallArg>) -> Result<Self> {
        let abi = descriptor.require_abi()?;
        let address = parse_address(descriptor.require_address()?)?;
        Ok(Self {
            contract: &descriptor.name,
            chain: descriptor.chain()?,
            address,
            abi,
            method,
            args,
        })
    }
}

pub fn parse_address(raw: &str) -> Result<Address> {
    raw.trim()
        .parse::<Address>()
        .map_err(|_| PortfolioError::InvalidAddress(raw.to_string()))
}

/// Read-only access to chain state.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Native balance in wei.
    async fn native_balance(&self, chain: Chain, wallet: Address) -> Result<U256>;

    async fn call_view(&self, call: ViewCall<'_>) -> Result<ViewOutput>;
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    #[allow(dead_code)]
    jsonrpc: String,
    #[allow(dead_code)]
    id: u64,
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Endpoint for one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub chain: Chain,
    pub url: String,
}

/// JSON-RPC reader over HTTP, one endpoint per chain.
#[derive(Debug, Clone)]
pub struct JsonRpcReader {
    client: Client,
    url_template: String,
    api_key: String,
}

pub const DEFAULT_RPC_TEMPLATE: &str = "https://{network}-mainnet.g.alchemy.com/v2/{key}";

impl JsonRpcReader {
    pub fn new(url_template: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url_template: url_template.into(),
            api_key: api_key.into(),
        })
    }

    pub fn connection(&self, chain: &str) -> Result<Connection> {
        let chain: Chain = chain.parse()?;
        Ok(self.connection_for(chain))
    }

    fn connection_for(&self, chain: Chain) -> Connection {
        let url = self
            .url_template
            .replace("{network}", chain.network())
            .replace("{key}", &self.api_key);
        Connection { chain, url }
    }

    async fn request(&self, conn: &Connection, method: &str, params: Value) -> Result<String> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        debug!("📡 Sending {} → {}", method, conn.chain);

        let resp = self.client.post(&conn.url).json(&payload).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(PortfolioError::Upstream {
                service: "json-rpc",
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: RpcResponse<String> = serde_json::from_str(&text)
            .map_err(|e| PortfolioError::Decode(format!("{} response: {}", method, e)))?;
        if let Some(err) = parsed.error {
            return Err(PortfolioError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        parsed
            .result
            .ok_or_else(|| PortfolioError::Decode(format!("{} response has no result", method)))
    }
}

#[async_trait]
impl ChainReader for JsonRpcReader {
    async fn native_balance(&self, chain: Chain, wallet: Address) -> Result<U256> {
        let conn = self.connection_for(chain);
        let raw = self
            .request(&conn, "eth_getBalance", json!([wallet.to_string(), "latest"]))
            .await?;
        parse_quantity(&raw)
    }

    async fn call_view(&self, call: ViewCall<'_>) -> Result<ViewOutput> {
        let function = AbiFunction::find(call.abi, call.method)
            .ok_or_else(|| PortfolioError::missing(call.contract, "abi method"))?;
        let data = function.encode_call(&call.args)?;

        let conn = self.connection_for(call.chain);
        let raw = self
            .request(
                &conn,
                "eth_call",
                json!([{ "to": call.address.to_string(), "data": data }, "latest"]),
            )
            .await?;
        let bytes = hex::decode(raw.trim_start_matches("0x"))
            .map_err(|e| PortfolioError::Decode(format!("eth_call result: {}", e)))?;
        function.decode_output(&bytes)
    }
}

fn parse_quantity(raw: &str) -> Result<U256> {
    U256::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|e| PortfolioError::Decode(format!("quantity '{}': {}", raw, e)))
}

/// The parts of a JSON ABI function entry needed for static view calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbiFunction {
    pub name: String,
    pub inputs: Vec<String>,
    pub output: Option<String>,
}

impl AbiFunction {
    pub fn find(abi: &[Value], method: &str) -> Option<Self> {
        let entry = abi.iter().find(|item| {
            item.get("name").and_then(Value::as_str) == Some(method)
                && item.get("type").and_then(Value::as_str).unwrap_or("function") == "function"
        })?;
        let types = |field: &str| -> Vec<String> {
            entry
                .get(field)
                .and_then(Value::as_array)
                .map(|params| {
                    params
                        .iter()
                        .filter_map(|p| p.get("type").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };
        Some(Self {
            name: method.to_string(),
            inputs: types("inputs"),
            output: types("outputs").into_iter().next(),
        })
    }

    pub fn signature(&self) -> String {
        format!("{}({})", self.name, self.inputs.join(","))
    }

    pub fn selector(&self) -> [u8; 4] {
        let hash = keccak256(self.signature().as_bytes());
        [hash[0], hash[1], hash[2], hash[3]]
    }

    /// Hex call data: selector followed by one 32-byte word per argument.
    pub fn encode_call(&self, args: &[CallArg]) -> Result<String> {
        if args.len() != self.inputs.len() {
            return Err(PortfolioError::Decode(format!(
                "{} expects {} arguments, got {}",
                self.signature(),
                self.inputs.len(),
                args.len()
            )));
        }
        let mut data = Vec::with_capacity(4 + 32 * args.len());
        data.extend_from_slice(&self.selector());
        for (ty, arg) in self.inputs.iter().zip(args) {
            match (ty.as_str(), arg) {
                ("address", CallArg::Address(addr)) => {
                    data.extend_from_slice(&[0u8; 12]);
                    data.extend_from_slice(addr.as_slice());
                }
                (t, CallArg::Uint(v)) if t.starts_with("uint") => {
                    data.extend_from_slice(&v.to_be_bytes::<32>());
                }
                (t, a) => {
                    return Err(PortfolioError::Decode(format!(
                        "argument {:?} does not match ABI type {}",
                        a, t
                    )))
                }
            }
        }
        Ok(format!("0x{}", hex::encode(data)))
    }

    pub fn decode_output(&self, bytes: &[u8]) -> Result<ViewOutput> {
        match self.output.as_deref() {
            Some("string") => decode_string(bytes).map(ViewOutput::Text),
            Some(t) if t.starts_with("uint") || t.starts_with("int") => {
                word(bytes, 0).map(ViewOutput::Uint)
            }
            other => Err(PortfolioError::Decode(format!(
                "unsupported output type {:?} for {}",
                other,
                self.signature()
            ))),
        }
    }
}

fn word(bytes: &[u8], index: usize) -> Result<U256> {
    let start = index * 32;
    bytes
        .get(start..start + 32)
        .map(|w| U256::from_be_slice(w))
        .ok_or_else(|| PortfolioError::Decode(format!("output shorter than word {}", index)))
}

fn as_index(v: U256) -> Result<usize> {
    if v > U256::from(u32::MAX) {
        return Err(PortfolioError::Decode(format!("offset {} out of range", v)));
    }
    Ok(v.to::<u32>() as usize)
}

fn decode_string(bytes: &[u8]) -> Result<String> {
    let offset = as_index(word(bytes, 0)?)?;
    let len_word = bytes
        .get(offset..offset + 32)
        .ok_or_else(|| PortfolioError::Decode("string length out of range".into()))?;
    let len = as_index(U256::from_be_slice(len_word))?;
    let start = offset + 32;
    let raw = bytes
        .get(start..start + len)
        .ok_or_else(|| PortfolioError::Decode("string body out of range".into()))?;
    String::from_utf8(raw.to_vec()).map_err(|e| PortfolioError::Decode(e.to_string()))
}
