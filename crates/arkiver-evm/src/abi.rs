//! `AbiEventDecoder` — decodes raw logs of one ABI event.
//!
//! # EVM log layout
//! - `topics[0]` = keccak256 of the canonical event signature
//! - `topics[1..]` = indexed parameters, one 32-byte word each
//! - `data` = ABI-encoded sequence of the non-indexed parameters
//!
//! Indexed reference types (string, bytes, arrays, tuples) are stored as the
//! keccak256 of their encoding, so only the 32-byte hash can be recovered.

use alloy_dyn_abi::{DynSolType, DynSolValue, Specifier};
use alloy_json_abi::{Event, EventParam, Param};
use alloy_primitives::B256;
use serde_json::{Map, Value};

use arkiver_core::error::ArkiverError;
use arkiver_core::types::{DecodedEvent, RawLog};

/// One event parameter with its resolved type.
#[derive(Debug, Clone)]
struct ParamSpec {
    name: String,
    ty: DynSolType,
    components: Vec<Param>,
}

impl ParamSpec {
    fn new(index: usize, param: &EventParam, event: &str) -> Result<Self, ArkiverError> {
        let ty = param.resolve().map_err(|e| ArkiverError::Decode {
            event: event.to_string(),
            reason: format!("unsupported parameter type '{}': {e}", param.ty),
        })?;
        let name = if param.name.is_empty() {
            format!("arg{index}")
        } else {
            param.name.clone()
        };
        Ok(Self {
            name,
            ty,
            components: param.components.clone(),
        })
    }
}

/// Decoder for a single, non-anonymous event.
#[derive(Debug, Clone)]
pub struct AbiEventDecoder {
    name: String,
    signature: String,
    selector: B256,
    topic: String,
    /// All parameters in declaration order, with their indexed flag.
    params: Vec<(bool, ParamSpec)>,
}

impl AbiEventDecoder {
    pub fn new(event: &Event) -> Result<Self, ArkiverError> {
        if event.anonymous {
            return Err(ArkiverError::Decode {
                event: event.name.clone(),
                reason: "anonymous events have no topic to route on".into(),
            });
        }
        let params = event
            .inputs
            .iter()
            .enumerate()
            .map(|(i, p)| Ok((p.indexed, ParamSpec::new(i, p, &event.name)?)))
            .collect::<Result<Vec<_>, ArkiverError>>()?;
        let selector = event.selector();
        Ok(Self {
            name: event.name.clone(),
            signature: event.signature(),
            selector,
            topic: topic_hex(&selector),
            params,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical signature, e.g. `Transfer(address,address,uint256)`.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Lowercase `0x`-prefixed topic0.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn indexed_count(&self) -> usize {
        self.params.iter().filter(|(indexed, _)| *indexed).count()
    }

    fn err(&self, reason: impl Into<String>) -> ArkiverError {
        ArkiverError::Decode {
            event: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Decode a mined log into named arguments.
    pub fn decode(&self, log: &RawLog) -> Result<DecodedEvent, ArkiverError> {
        let topics = log
            .topics
            .iter()
            .map(|t| parse_topic(t).ok_or_else(|| self.err(format!("invalid topic {t}"))))
            .collect::<Result<Vec<B256>, _>>()?;

        match topics.first() {
            Some(t0) if *t0 == self.selector => {}
            Some(t0) => return Err(self.err(format!("topic0 {} does not match", topic_hex(t0)))),
            None => return Err(self.err("log has no topics")),
        }
        let expected = self.indexed_count() + 1;
        if topics.len() != expected {
            return Err(self.err(format!(
                "expected {expected} topics, log has {}",
                topics.len()
            )));
        }

        let data = decode_hex(&log.data).ok_or_else(|| self.err("invalid data hex"))?;
        let body_types: Vec<DynSolType> = self
            .params
            .iter()
            .filter(|(indexed, _)| !*indexed)
            .map(|(_, p)| p.ty.clone())
            .collect();
        let mut body = if body_types.is_empty() {
            Vec::new()
        } else {
            match DynSolType::Tuple(body_types).abi_decode_sequence(&data) {
                Ok(DynSolValue::Tuple(values)) => values,
                Ok(other) => vec![other],
                Err(e) => return Err(self.err(format!("data decode: {e}"))),
            }
        }
        .into_iter();

        let mut indexed = topics[1..].iter();
        let mut args = Map::new();
        for (is_indexed, spec) in &self.params {
            let value = if *is_indexed {
                let topic = indexed.next().ok_or_else(|| self.err("missing topic"))?;
                decode_topic(topic, spec).map_err(|e| self.err(e))?
            } else {
                let value = body.next().ok_or_else(|| self.err("missing data value"))?;
                to_json(value, &spec.components)
            };
            args.insert(spec.name.clone(), value);
        }

        Ok(DecodedEvent {
            name: self.name.clone(),
            signature: self.signature.clone(),
            address: log.address.to_ascii_lowercase(),
            block_number: log.block_number_u64().ok_or_else(|| self.err("missing block number"))?,
            block_hash: log.block_hash.clone().unwrap_or_default(),
            transaction_hash: log.transaction_hash.clone().unwrap_or_default(),
            log_index: log.log_index_u64().ok_or_else(|| self.err("missing log index"))?,
            args,
        })
    }
}

/// Lowercase `0x`-prefixed hex of a 32-byte word.
pub fn topic_hex(word: &B256) -> String {
    format!("0x{}", hex::encode(word))
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    hex::decode(s.strip_prefix("0x").unwrap_or(s)).ok()
}

fn parse_topic(s: &str) -> Option<B256> {
    let bytes = decode_hex(s)?;
    (bytes.len() == 32).then(|| B256::from_slice(&bytes))
}

fn decode_topic(topic: &B256, spec: &ParamSpec) -> Result<Value, String> {
    match spec.ty {
        DynSolType::String
        | DynSolType::Bytes
        | DynSolType::Array(_)
        | DynSolType::FixedArray(..)
        | DynSolType::Tuple(_) => Ok(Value::String(topic_hex(topic))),
        _ => spec
            .ty
            .abi_decode(topic.as_slice())
            .map(|v| to_json(v, &spec.components))
            .map_err(|e| format!("topic decode for '{}': {e}", spec.name)),
    }
}

/// Convert a decoded value into JSON.
///
/// Integers that fit in 64 bits become JSON numbers; wider ones become decimal
/// strings. Tuples with named components become objects.
pub fn to_json(value: DynSolValue, components: &[Param]) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(b),
        DynSolValue::Int(i, _) => match i128::try_from(i).ok().and_then(|v| i64::try_from(v).ok()) {
            Some(v) => Value::from(v),
            None => Value::String(i.to_string()),
        },
        DynSolValue::Uint(u, _) => match u128::try_from(u).ok().and_then(|v| u64::try_from(v).ok()) {
            Some(v) => Value::from(v),
            None => Value::String(u.to_string()),
        },
        DynSolValue::FixedBytes(word, size) => {
            Value::String(format!("0x{}", hex::encode(&word[..size.min(32)])))
        }
        DynSolValue::Address(a) => Value::String(format!("0x{}", hex::encode(a))),
        DynSolValue::Function(f) => Value::String(format!("0x{}", hex::encode(f))),
        DynSolValue::Bytes(b) => Value::String(format!("0x{}", hex::encode(b))),
        DynSolValue::String(s) => Value::String(s),
        DynSolValue::Array(values) | DynSolValue::FixedArray(values) => Value::Array(
            values
                .into_iter()
                .map(|v| to_json(v, components))
                .collect(),
        ),
        DynSolValue::Tuple(values) => {
            let named = !components.is_empty()
                && components.len() == values.len()
                && components.iter().all(|c| !c.name.is_empty());
            if named {
                let mut obj = Map::new();
                for (component, v) in components.iter().zip(values) {
                    obj.insert(component.name.clone(), to_json(v, &component.components));
                }
                Value::Object(obj)
            } else {
                Value::Array(values.into_iter().map(|v| to_json(v, &[])).collect())
            }
        }
        #[allow(unreachable_patterns)]
        _ => Value::Null,
    }
}
