//! Envelope and capsule wire types.
//!
//! The wire encoding is MessagePack (`rmp-serde`), chosen to match the
//! msgpack encoding the original protocol uses for the same envelope set.
//! Struct-valued capsules are CBOR-encoded independently (`ciborium`) and
//! carried as opaque bytes inside the envelope, per the capsule table below.

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One wire message. Discriminated by `type` via serde's internally tagged
/// representation, which performs exactly the two-pass
/// discriminate-then-decode the envelope codec calls for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// Outbound RPC call: caller to callee.
    #[serde(rename = "rpcreq")]
    RpcRequest {
        id: String,
        name: String,
        parameters: Vec<RpcDataCapsule>,
        return_dtypes: Vec<String>,
    },
    /// RPC response: callee to caller.
    #[serde(rename = "rpcres")]
    RpcResponse {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        r#return: Option<Vec<RpcDataCapsule>>,
    },
    /// Channel join request: joiner to acceptor.
    #[serde(rename = "chreq")]
    ChannelRequest {
        id: String,
        cid: String,
    },
    /// Channel join response: acceptor to joiner.
    #[serde(rename = "chreqresp")]
    ChannelRequestResponse {
        rqid: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        cid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nabr: Option<String>,
    },
    /// Channel data packet, either direction.
    #[serde(rename = "chst")]
    ChannelSessionTransport {
        csid: String,
        pid: u64,
        body: serde_bytes::ByteBuf,
    },
    /// Acknowledgement for a `chst` packet.
    #[serde(rename = "chtsr")]
    ChannelTransportStateResponse {
        csid: String,
        pid: u64,
        state: u8,
    },
    /// Out-of-band channel signal: 0 = close, 1 = join-ack.
    #[serde(rename = "chsig")]
    ChannelSessionSignal {
        csid: String,
        pid: u64,
    },
}

/// ACK state carried on a `chtsr`. Only `Ack` (0) is produced by this
/// implementation; the field exists so a future revision may add states.
pub const CHTSR_STATE_ACK: u8 = 0;

/// `chsig` signal codes: the `pid` field is overloaded as a signal code here.
pub const CHSIG_CLOSE: u64 = 0;
pub const CHSIG_JOIN_ACK: u64 = 1;

/// One RPC argument or return value, tagged by wire type name.
#[derive(Debug, Clone, Serialize)]
pub struct RpcDataCapsule {
    pub r#type: String,
    pub value: CapsuleValue,
}

/// The recognized `value` shapes for a [`RpcDataCapsule`].
///
/// `Struct` carries the CBOR encoding of the concrete struct value; the
/// `type` field on the owning capsule carries `struct:<fqname>` and names
/// which Rust type to decode it as.
///
/// Serializes as an untagged union (the owning capsule's `type` field is the
/// only discriminator on the wire), but deliberately does **not** derive
/// `Deserialize`: decoding an untagged enum by probing each variant in turn
/// cannot tell a `uint` capsule whose value happens to fit in `i64` apart
/// from an `int` one, so it would silently decode `uint` payloads as `Int`.
/// [`RpcDataCapsule`]'s own `Deserialize` impl below decodes the capsule's
/// `value` against its `type` tag instead, which is the only
/// exact-kind-match the wire format actually promises.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CapsuleValue {
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
    String(String),
    Slice(Vec<RpcDataCapsule>),
    Map(Vec<(RpcDataCapsule, RpcDataCapsule)>),
    Struct(serde_bytes::ByteBuf),
}

impl CapsuleValue {
    /// Decodes a generic msgpack `value` against the capsule's own `type`
    /// tag, rather than guessing the variant from the value's shape.
    fn from_tagged(tag: &str, value: rmpv::Value) -> std::result::Result<Self, String> {
        match tag {
            "int" => value.as_i64().map(Self::Int).ok_or_else(|| "expected int value".to_string()),
            "uint" => value.as_u64().map(Self::Uint).ok_or_else(|| "expected uint value".to_string()),
            "float" => {
                value.as_f64().map(Self::Float).ok_or_else(|| "expected float value".to_string())
            }
            "bool" => {
                value.as_bool().map(Self::Bool).ok_or_else(|| "expected bool value".to_string())
            }
            "string" => value
                .as_str()
                .map(|s| Self::String(s.to_string()))
                .ok_or_else(|| "expected string value".to_string()),
            "slice" => rmpv::ext::from_value(value)
                .map(Self::Slice)
                .map_err(|e| format!("slice decode failed: {e}")),
            "map" => rmpv::ext::from_value(value)
                .map(Self::Map)
                .map_err(|e| format!("map decode failed: {e}")),
            other if other.starts_with("struct:") => rmpv::ext::from_value(value)
                .map(Self::Struct)
                .map_err(|e| format!("struct decode failed: {e}")),
            other => Err(format!("unrecognized capsule type tag {other}")),
        }
    }
}

impl<'de> Deserialize<'de> for RpcDataCapsule {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RawCapsule {
            r#type: String,
            value: rmpv::Value,
        }
        let raw = RawCapsule::deserialize(deserializer)?;
        let value = CapsuleValue::from_tagged(&raw.r#type, raw.value).map_err(D::Error::custom)?;
        Ok(RpcDataCapsule { r#type: raw.r#type, value })
    }
}

impl RpcDataCapsule {
    #[must_use]
    pub fn int(v: i64) -> Self {
        Self { r#type: "int".to_string(), value: CapsuleValue::Int(v) }
    }

    #[must_use]
    pub fn uint(v: u64) -> Self {
        Self { r#type: "uint".to_string(), value: CapsuleValue::Uint(v) }
    }

    #[must_use]
    pub fn float(v: f64) -> Self {
        Self { r#type: "float".to_string(), value: CapsuleValue::Float(v) }
    }

    #[must_use]
    pub fn bool(v: bool) -> Self {
        Self { r#type: "bool".to_string(), value: CapsuleValue::Bool(v) }
    }

    #[must_use]
    pub fn string(v: impl Into<String>) -> Self {
        Self { r#type: "string".to_string(), value: CapsuleValue::String(v.into()) }
    }

    /// Encodes `value` as CBOR and wraps it as a `struct:<fqname>` capsule.
    pub fn encode_struct<T: Serialize>(fqname: &str, value: &T) -> Result<Self> {
        let mut bytes = Vec::new();
        ciborium::into_writer(value, &mut bytes)
            .map_err(|e| Error::ProtocolFault(format!("cbor encode failed: {e}")))?;
        Ok(Self {
            r#type: format!("struct:{fqname}"),
            value: CapsuleValue::Struct(serde_bytes::ByteBuf::from(bytes)),
        })
    }

    /// Decodes a `struct:<fqname>` capsule's CBOR body into `T`.
    pub fn decode_struct<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        match &self.value {
            CapsuleValue::Struct(bytes) => ciborium::from_reader(bytes.as_slice())
                .map_err(|e| Error::ProtocolFault(format!("cbor decode failed: {e}"))),
            _ => Err(Error::InvalidArgument(format!(
                "capsule tagged {} is not a struct value",
                self.r#type
            ))),
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match &self.value {
            CapsuleValue::Int(v) => Ok(*v),
            _ => Err(Error::InvalidArgument(format!("expected int capsule, got {}", self.r#type))),
        }
    }

    pub fn as_uint(&self) -> Result<u64> {
        match &self.value {
            CapsuleValue::Uint(v) => Ok(*v),
            _ => Err(Error::InvalidArgument(format!("expected uint capsule, got {}", self.r#type))),
        }
    }

    pub fn as_float(&self) -> Result<f64> {
        match &self.value {
            CapsuleValue::Float(v) => Ok(*v),
            _ => Err(Error::InvalidArgument(format!("expected float capsule, got {}", self.r#type))),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match &self.value {
            CapsuleValue::Bool(v) => Ok(*v),
            _ => Err(Error::InvalidArgument(format!("expected bool capsule, got {}", self.r#type))),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match &self.value {
            CapsuleValue::String(v) => Ok(v.as_str()),
            _ => Err(Error::InvalidArgument(format!("expected string capsule, got {}", self.r#type))),
        }
    }
}

/// Reflective descriptor for a handler parameter or return type, or a
/// `call()` return-type declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDesc {
    Int,
    Uint,
    Float,
    Bool,
    Str,
    Bytes,
    Slice(Box<TypeDesc>),
    Map,
    Struct(&'static str),
}

impl TypeDesc {
    /// Returns whether `capsule` could plausibly decode against this descriptor.
    #[must_use]
    pub fn matches_capsule(&self, capsule: &RpcDataCapsule) -> bool {
        match self {
            Self::Int => matches!(capsule.value, CapsuleValue::Int(_)),
            Self::Uint => matches!(capsule.value, CapsuleValue::Uint(_)),
            Self::Float => matches!(capsule.value, CapsuleValue::Float(_)),
            Self::Bool => matches!(capsule.value, CapsuleValue::Bool(_)),
            Self::Str | Self::Bytes => matches!(capsule.value, CapsuleValue::String(_)),
            Self::Slice(_) => matches!(capsule.value, CapsuleValue::Slice(_)),
            Self::Map => matches!(capsule.value, CapsuleValue::Map(_)),
            Self::Struct(name) => capsule.r#type == format!("struct:{name}"),
        }
    }
}

/// Serializes an [`Envelope`] to its MessagePack wire form.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(envelope)
        .map_err(|e| Error::ProtocolFault(format!("envelope encode failed: {e}")))
}

/// Decodes a complete payload (one Framer `END`-terminated unit) into an [`Envelope`].
pub fn decode(payload: &[u8]) -> Result<Envelope> {
    rmp_serde::from_slice(payload)
        .map_err(|e| Error::ProtocolFault(format!("envelope decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_rpc_request() {
        let env = Envelope::RpcRequest {
            id: "abc".to_string(),
            name: "echo".to_string(),
            parameters: vec![RpcDataCapsule::string("hi")],
            return_dtypes: vec!["string".to_string(), "error".to_string()],
        };
        let bytes = encode(&env).expect("encode");
        let decoded = decode(&bytes).expect("decode");
        match decoded {
            Envelope::RpcRequest { id, name, parameters, .. } => {
                assert_eq!(id, "abc");
                assert_eq!(name, "echo");
                assert_eq!(parameters[0].as_str().unwrap(), "hi");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn round_trips_channel_signal() {
        let env = Envelope::ChannelSessionSignal { csid: "s1".to_string(), pid: CHSIG_JOIN_ACK };
        let bytes = encode(&env).expect("encode");
        let decoded = decode(&bytes).expect("decode");
        match decoded {
            Envelope::ChannelSessionSignal { csid, pid } => {
                assert_eq!(csid, "s1");
                assert_eq!(pid, 1);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn struct_capsule_round_trips() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Point {
            x: i32,
            y: i32,
        }
        let capsule = RpcDataCapsule::encode_struct("Point", &Point { x: 1, y: 2 }).unwrap();
        assert_eq!(capsule.r#type, "struct:Point");
        let decoded: Point = capsule.decode_struct().unwrap();
        assert_eq!(decoded, Point { x: 1, y: 2 });
    }

    #[test]
    fn unknown_bytes_fail_decode() {
        assert!(decode(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn uint_capsule_round_trips_as_uint_not_int() {
        // A value that fits in i64 must still decode as Uint when its type
        // tag says "uint" -- the tag picks the variant, not a value probe.
        let env = Envelope::RpcRequest {
            id: "abc".to_string(),
            name: "f".to_string(),
            parameters: vec![RpcDataCapsule::uint(42)],
            return_dtypes: vec![],
        };
        let bytes = encode(&env).expect("encode");
        let decoded = decode(&bytes).expect("decode");
        match decoded {
            Envelope::RpcRequest { parameters, .. } => {
                assert_eq!(parameters[0].as_uint().unwrap(), 42);
                assert!(parameters[0].as_int().is_err(), "uint capsule must not decode as int");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn int_capsule_round_trips_as_int_not_uint() {
        let env = Envelope::RpcRequest {
            id: "abc".to_string(),
            name: "f".to_string(),
            parameters: vec![RpcDataCapsule::int(42)],
            return_dtypes: vec![],
        };
        let bytes = encode(&env).expect("encode");
        let decoded = decode(&bytes).expect("decode");
        match decoded {
            Envelope::RpcRequest { parameters, .. } => {
                assert_eq!(parameters[0].as_int().unwrap(), 42);
                assert!(parameters[0].as_uint().is_err(), "int capsule must not decode as uint");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
