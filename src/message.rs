//! Invocation and response messages and their mapping to encoded [Value]s.
//!
//! Every [Packet] is a single encoded object with a `type` tag and the request
//! number `id`. When decoding, unknown keys are skipped and the first
//! occurrence of a repeated key wins.
use std::convert::TryFrom as _;

use crate::decode::{decode, DecodeError, Input, Source};
use crate::encode::{check, to_vec, EncodeError};
use crate::error::RemoteError;
use crate::value::{ArgLists, Value};

/// One step of selecting a nested RPC interface.
#[derive(Debug, Clone, PartialEq)]
pub struct GetterLink {
    pub name: String,
    pub arg_lists: ArgLists,
}

impl GetterLink {
    pub fn new(name: impl ToString, arg_lists: ArgLists) -> Self {
        Self {
            name: name.to_string(),
            arg_lists,
        }
    }
}

/// Operation name and arguments together with the getter chain that leads
/// to the receiver of the operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub name: String,
    pub arg_lists: ArgLists,
    pub getter_chain: Vec<GetterLink>,
}

impl Invocation {
    pub fn new(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            arg_lists: Vec::new(),
            getter_chain: Vec::new(),
        }
    }

    /// Append an argument list.
    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.arg_lists.push(args);
        self
    }

    /// Append a getter to the chain. Getters are resolved in the order they
    /// were added.
    pub fn through(mut self, link: GetterLink) -> Self {
        self.getter_chain.push(link);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvocationMessage {
    /// Fire and forget. The server never responds.
    Procedure(Invocation),
    /// Call with a single success or failure response.
    Function(Invocation),
    /// Subscription to an ack gated stream of responses.
    Observable(Invocation),
}

impl InvocationMessage {
    pub fn invocation(&self) -> &Invocation {
        match self {
            InvocationMessage::Procedure(invocation)
            | InvocationMessage::Function(invocation)
            | InvocationMessage::Observable(invocation) => invocation,
        }
    }

    pub fn into_invocation(self) -> Invocation {
        match self {
            InvocationMessage::Procedure(invocation)
            | InvocationMessage::Function(invocation)
            | InvocationMessage::Observable(invocation) => invocation,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            InvocationMessage::Procedure(_) => "procedure",
            InvocationMessage::Function(_) => "function",
            InvocationMessage::Observable(_) => "observable",
        }
    }
}

/// Acknowledgement of a stream element sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Continue,
    Cancel,
}

/// Message sent from the client to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Invoke {
        number: u32,
        message: InvocationMessage,
    },
    Ack {
        number: u32,
        ack: Ack,
    },
}

impl Request {
    pub fn number(&self) -> u32 {
        match self {
            Request::Invoke { number, .. } | Request::Ack { number, .. } => *number,
        }
    }
}

/// Error kind of the failure sent in place of a result that cannot be
/// encoded.
pub const ENCODE_ERROR: &str = "ENCODE_ERROR";

/// Message sent from the server to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success { number: u32, value: Value },
    Failure { number: u32, error: RemoteError },
    Heartbeat { number: u32 },
    StreamCompleted { number: u32 },
}

impl Response {
    /// Success response carrying `value`. If the packet could not be encoded,
    /// for example because `value` is nested too deeply, this is an
    /// [ENCODE_ERROR] failure instead.
    pub fn success(number: u32, value: Value) -> Self {
        // The value is a field of the packet object
        match check(&value, 1) {
            Ok(()) => Response::Success { number, value },
            Err(error) => Response::Failure {
                number,
                error: RemoteError::new(ENCODE_ERROR, error),
            },
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Response::Failure { .. })
    }

    pub fn number(&self) -> u32 {
        match self {
            Response::Success { number, .. }
            | Response::Failure { number, .. }
            | Response::Heartbeat { number }
            | Response::StreamCompleted { number } => *number,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Request(Request),
    Response(Response),
}

#[derive(Debug, thiserror::Error)]
pub enum PacketParseError {
    #[error("Failed to decode packet")]
    Decode(
        #[source]
        #[from]
        DecodeError,
    ),
    #[error("Packet is missing field \"{field}\"")]
    MissingField { field: &'static str },
    #[error("Unknown packet type \"{type_}\"")]
    UnknownType { type_: String },
    #[error("Invalid request number {value}")]
    InvalidRequestNumber { value: i64 },
}

impl PacketParseError {
    /// Returns true if the packet was decoded completely but is not a valid
    /// request or response. The input is positioned after such a packet.
    pub fn is_invalid_packet(&self) -> bool {
        !matches!(self, PacketParseError::Decode(_))
    }
}

impl Packet {
    /// Parse one packet from `source`. On success the source is positioned
    /// after the packet.
    pub fn parse(source: &mut Source<'_>) -> Result<Self, PacketParseError> {
        let fields = Fields::parse(decode(source)?)?;
        let type_ = fields.type_.clone().ok_or(PacketParseError::MissingField { field: "type" })?;
        let number = fields.number()?;
        let packet = match type_.as_str() {
            "procedure" => Packet::Request(Request::Invoke {
                number,
                message: InvocationMessage::Procedure(fields.invocation()?),
            }),
            "function" => Packet::Request(Request::Invoke {
                number,
                message: InvocationMessage::Function(fields.invocation()?),
            }),
            "observable" => Packet::Request(Request::Invoke {
                number,
                message: InvocationMessage::Observable(fields.invocation()?),
            }),
            "continue" => Packet::Request(Request::Ack {
                number,
                ack: Ack::Continue,
            }),
            "cancel" => Packet::Request(Request::Ack {
                number,
                ack: Ack::Cancel,
            }),
            "success" => Packet::Response(Response::Success {
                number,
                value: fields
                    .value
                    .ok_or(PacketParseError::MissingField { field: "value" })?,
            }),
            "failure" => Packet::Response(Response::Failure {
                number,
                error: RemoteError {
                    kind: fields
                        .kind
                        .ok_or(PacketParseError::MissingField { field: "kind" })?,
                    message: fields
                        .message
                        .ok_or(PacketParseError::MissingField { field: "message" })?,
                },
            }),
            "heartbeat" => Packet::Response(Response::Heartbeat { number }),
            "completed" => Packet::Response(Response::StreamCompleted { number }),
            other => {
                return Err(PacketParseError::UnknownType {
                    type_: other.to_string(),
                })
            }
        };
        Ok(packet)
    }

    pub fn into_value(self) -> Value {
        let (type_, number, mut fields) = match self {
            Packet::Request(Request::Invoke { number, message }) => {
                let type_ = message.type_name();
                (type_, number, invocation_fields(message.into_invocation()))
            }
            Packet::Request(Request::Ack { number, ack }) => {
                let type_ = match ack {
                    Ack::Continue => "continue",
                    Ack::Cancel => "cancel",
                };
                (type_, number, vec![])
            }
            Packet::Response(Response::Success { number, value }) => {
                ("success", number, vec![field("value", value)])
            }
            Packet::Response(Response::Failure { number, error }) => (
                "failure",
                number,
                vec![
                    field("kind", Value::String(error.kind)),
                    field("message", Value::String(error.message)),
                ],
            ),
            Packet::Response(Response::Heartbeat { number }) => ("heartbeat", number, vec![]),
            Packet::Response(Response::StreamCompleted { number }) => {
                ("completed", number, vec![])
            }
        };
        let mut entries = vec![
            field("type", Value::String(type_.to_string())),
            field("id", Value::Long(i64::from(number))),
        ];
        entries.append(&mut fields);
        Value::Object(entries)
    }

    pub fn build(self) -> Result<Vec<u8>, EncodeError> {
        to_vec(&self.into_value())
    }
}

fn field(key: &str, value: Value) -> (String, Value) {
    (key.to_string(), value)
}

fn arg_lists_value(arg_lists: ArgLists) -> Value {
    Value::List(arg_lists.into_iter().map(Value::List).collect())
}

fn invocation_fields(invocation: Invocation) -> Vec<(String, Value)> {
    let Invocation {
        name,
        arg_lists,
        getter_chain,
    } = invocation;
    let getters = getter_chain
        .into_iter()
        .map(|GetterLink { name, arg_lists }| {
            Value::Object(vec![
                field("name", Value::String(name)),
                field("args", arg_lists_value(arg_lists)),
            ])
        })
        .collect();
    vec![
        field("name", Value::String(name)),
        field("args", arg_lists_value(arg_lists)),
        field("getters", Value::List(getters)),
    ]
}

/// Fields of a packet object. Only the first occurrence of a key is kept.
#[derive(Debug, Default)]
struct Fields {
    type_: Option<String>,
    id: Option<i64>,
    name: Option<String>,
    args: Option<ArgLists>,
    getters: Option<Vec<GetterLink>>,
    value: Option<Value>,
    kind: Option<String>,
    message: Option<String>,
}

impl Fields {
    fn parse(input: Input<'_, '_>) -> Result<Self, PacketParseError> {
        let mut fields = Self::default();
        let mut object = input.read_object()?;
        while object.has_next()? {
            let (key, input) = object.next()?;
            match key.as_str() {
                "type" if fields.type_.is_none() => fields.type_ = Some(input.read_string()?),
                "id" if fields.id.is_none() => fields.id = Some(input.read_long()?),
                "name" if fields.name.is_none() => fields.name = Some(input.read_string()?),
                "args" if fields.args.is_none() => fields.args = Some(read_arg_lists(input)?),
                "getters" if fields.getters.is_none() => {
                    fields.getters = Some(read_getters(input)?)
                }
                "value" if fields.value.is_none() => fields.value = Some(input.read_value()?),
                "kind" if fields.kind.is_none() => fields.kind = Some(input.read_string()?),
                "message" if fields.message.is_none() => {
                    fields.message = Some(input.read_string()?)
                }
                _ => input.skip()?,
            }
        }
        Ok(fields)
    }

    fn number(&self) -> Result<u32, PacketParseError> {
        let value = self
            .id
            .ok_or(PacketParseError::MissingField { field: "id" })?;
        match u32::try_from(value) {
            Ok(number) if number > 0 => Ok(number),
            _ => Err(PacketParseError::InvalidRequestNumber { value }),
        }
    }

    fn invocation(self) -> Result<Invocation, PacketParseError> {
        Ok(Invocation {
            name: self
                .name
                .ok_or(PacketParseError::MissingField { field: "name" })?,
            arg_lists: self.args.unwrap_or_default(),
            getter_chain: self.getters.unwrap_or_default(),
        })
    }
}

fn read_arg_lists(input: Input<'_, '_>) -> Result<ArgLists, DecodeError> {
    let mut lists = input.read_list()?;
    let mut arg_lists = Vec::new();
    while lists.has_next()? {
        let mut list = lists.next()?.read_list()?;
        let mut args = Vec::new();
        while list.has_next()? {
            args.push(list.next()?.read_value()?);
        }
        arg_lists.push(args);
    }
    Ok(arg_lists)
}

fn read_getters(input: Input<'_, '_>) -> Result<Vec<GetterLink>, PacketParseError> {
    let mut list = input.read_list()?;
    let mut getters = Vec::new();
    while list.has_next()? {
        let mut object = list.next()?.read_object()?;
        let mut name = None;
        let mut arg_lists = None;
        while object.has_next()? {
            let (key, input) = object.next()?;
            match key.as_str() {
                "name" if name.is_none() => name = Some(input.read_string()?),
                "args" if arg_lists.is_none() => arg_lists = Some(read_arg_lists(input)?),
                _ => input.skip()?,
            }
        }
        getters.push(GetterLink {
            name: name.ok_or(PacketParseError::MissingField { field: "getters.name" })?,
            arg_lists: arg_lists.unwrap_or_default(),
        });
    }
    Ok(getters)
}
