//! Wire frames and the per-boundary message unions.
//!
//! Every boundary exchanges the same JSON shape:
//! `{ nonce, domain?, method, data, err? }`. Frames are decoded into a
//! [`Frame`] first, then classified into the finite method set of the
//! boundary they arrived on. Anything unknown lands in an `Unrecognized`
//! variant so the router can reject it explicitly.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::credential::ChildKey;
use crate::identifier::{classify, Classification, Identifier};

/// Method name used to deliver a module's credential.
pub const PRESENT_KEY: &str = "presentKey";

/// Methods only the kernel itself may send to a module.
pub const PRIVILEGED_METHODS: &[&str] = &["presentSeed", PRESENT_KEY];

/// Nonce used when replying to a frame that carried none.
pub const MISSING_NONCE: &str = "N/A";

/// Frame decoding errors.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Not an object, or `method` missing or not a string.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// The frame carries no `nonce`.
    #[error("frame has no nonce")]
    MissingNonce,
}

/// The JSON frame exchanged at every boundary.
///
/// `data` and `err` distinguish "absent" (`None`) from "present and null"
/// (`Some(Value::Null)`), which the response rules depend on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Correlation token. Opaque for callers, router-assigned towards sandboxes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<Value>,
    /// Calling domain, or the domain an extension declares for itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<Value>,
    /// Method name.
    pub method: String,
    /// Payload.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Value>,
    /// Error payload, only meaningful on responses.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub err: Option<Value>,
    /// Caller asks to be told the kernel nonce of a new query.
    #[serde(
        default,
        rename = "sendKernelNonce",
        deserialize_with = "exactly_true",
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub send_kernel_nonce: bool,
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

fn exactly_true<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Value::deserialize(deserializer)? == Value::Bool(true))
}

impl Frame {
    /// Decode an untrusted JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Malformed`] when the value is not a frame.
    pub fn decode(value: Value) -> Result<Self, FrameError> {
        serde_json::from_value(value).map_err(|e| FrameError::Malformed(e.to_string()))
    }

    fn bare(method: &str) -> Self {
        Self {
            nonce: None,
            domain: None,
            method: method.to_owned(),
            data: None,
            err: None,
            send_kernel_nonce: false,
        }
    }

    /// Successful terminal response.
    pub fn response(nonce: Value, data: Value) -> Self {
        Self {
            nonce: Some(nonce),
            data: Some(data),
            err: Some(Value::Null),
            ..Self::bare("response")
        }
    }

    /// Failed terminal response.
    pub fn error(nonce: Value, err: impl Into<String>) -> Self {
        Self {
            nonce: Some(nonce),
            data: Some(Value::Null),
            err: Some(Value::String(err.into())),
            ..Self::bare("response")
        }
    }

    /// Call frame opening a query on a sandbox.
    pub fn call(nonce: &str, caller_domain: &str, method: &str, data: Value) -> Self {
        Self {
            nonce: Some(Value::String(nonce.to_owned())),
            domain: Some(Value::String(caller_domain.to_owned())),
            data: Some(data),
            ..Self::bare(method)
        }
    }

    /// Non-terminal update (`queryUpdate` or `responseUpdate`).
    pub fn update(nonce: Value, method: &str, data: Value) -> Self {
        Self {
            nonce: Some(nonce),
            data: Some(data),
            ..Self::bare(method)
        }
    }

    /// Discloses the kernel nonce of a freshly opened query to its caller.
    pub fn response_nonce(caller_nonce: Value, kernel_nonce: &str) -> Self {
        Self {
            nonce: Some(caller_nonce),
            data: Some(json!({ "nonce": kernel_nonce })),
            ..Self::bare("responseNonce")
        }
    }

    /// First frame every sandbox receives.
    pub fn present_key(key: &ChildKey) -> Self {
        Self {
            domain: Some(Value::String("root".to_owned())),
            data: Some(json!({ "key": key.to_base64() })),
            ..Self::bare(PRESENT_KEY)
        }
    }

    /// The nonce, when it is a string.
    pub fn nonce_str(&self) -> Option<&str> {
        self.nonce.as_ref().and_then(Value::as_str)
    }
}

/// Messages accepted from an external caller (page or extension).
#[derive(Debug, Clone, PartialEq)]
pub enum CallerMessage {
    /// Kernel version probe.
    Version {
        /// Caller nonce.
        nonce: Value,
    },
    /// Request for the diagnostics list.
    CheckErrs {
        /// Caller nonce.
        nonce: Value,
    },
    /// Call into a module.
    ModuleCall {
        /// Caller nonce.
        nonce: Value,
        /// Declared domain (honoured only for extension origins).
        domain: Option<Value>,
        /// Raw call payload, validated by [`ModuleCallRequest::parse`].
        data: Option<Value>,
        /// Whether to disclose the kernel nonce.
        send_kernel_nonce: bool,
    },
    /// Update for an open query, addressed by kernel nonce.
    QueryUpdate {
        /// Kernel nonce of the query.
        nonce: Value,
        /// Update payload.
        data: Option<Value>,
    },
    /// Anything else.
    Unrecognized {
        /// Caller nonce.
        nonce: Value,
        /// The method that was asked for.
        method: String,
    },
}

impl CallerMessage {
    /// Classify a caller frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::MissingNonce`] for frames without a nonce.
    pub fn from_frame(frame: Frame) -> Result<Self, FrameError> {
        let nonce = frame.nonce.ok_or(FrameError::MissingNonce)?;
        Ok(match frame.method.as_str() {
            "version" => Self::Version { nonce },
            "checkErrs" => Self::CheckErrs { nonce },
            "moduleCall" => Self::ModuleCall {
                nonce,
                domain: frame.domain,
                data: frame.data,
                send_kernel_nonce: frame.send_kernel_nonce,
            },
            "queryUpdate" => Self::QueryUpdate {
                nonce,
                data: frame.data,
            },
            _ => Self::Unrecognized {
                nonce,
                method: frame.method,
            },
        })
    }
}

/// A validated `log` payload from a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Log text.
    pub message: String,
    /// Whether the module flagged this as an error.
    pub is_err: bool,
}

/// Messages accepted from a sandbox.
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxMessage {
    /// Module log line.
    Log(LogRecord),
    /// A `log` frame whose payload failed validation.
    MalformedLog {
        /// Nonce to answer on.
        nonce: Value,
        /// What was wrong.
        reason: &'static str,
    },
    /// A non-log frame without a nonce.
    MissingNonce {
        /// The method that was sent.
        method: String,
    },
    /// Kernel version probe.
    Version {
        /// Sandbox nonce.
        nonce: Value,
    },
    /// Nested call into another module.
    ModuleCall {
        /// Sandbox nonce.
        nonce: Value,
        /// Raw call payload.
        data: Option<Value>,
        /// Whether to disclose the kernel nonce.
        send_kernel_nonce: bool,
    },
    /// Update from a calling sandbox towards the module it called.
    QueryUpdate {
        /// Kernel nonce.
        nonce: Value,
        /// Payload.
        data: Option<Value>,
    },
    /// Update from a serving sandbox back towards its caller.
    ResponseUpdate {
        /// Kernel nonce.
        nonce: Value,
        /// Payload.
        data: Option<Value>,
    },
    /// Terminal response from a serving sandbox.
    Response {
        /// Kernel nonce.
        nonce: Value,
        /// Result payload.
        data: Option<Value>,
        /// Error payload.
        err: Option<Value>,
    },
    /// Anything else.
    Unrecognized {
        /// The method that was sent.
        method: String,
    },
}

impl SandboxMessage {
    /// Classify a sandbox frame. Never fails; problems become variants.
    pub fn from_frame(frame: Frame) -> Self {
        if frame.method == "log" {
            return Self::decode_log(frame);
        }
        let Some(nonce) = frame.nonce else {
            return Self::MissingNonce {
                method: frame.method,
            };
        };
        match frame.method.as_str() {
            "version" => Self::Version { nonce },
            "moduleCall" => Self::ModuleCall {
                nonce,
                data: frame.data,
                send_kernel_nonce: frame.send_kernel_nonce,
            },
            "queryUpdate" => Self::QueryUpdate {
                nonce,
                data: frame.data,
            },
            "responseUpdate" => Self::ResponseUpdate {
                nonce,
                data: frame.data,
            },
            "response" => Self::Response {
                nonce,
                data: frame.data,
                err: frame.err,
            },
            _ => Self::Unrecognized {
                method: frame.method,
            },
        }
    }

    fn decode_log(frame: Frame) -> Self {
        let nonce = frame
            .nonce
            .unwrap_or_else(|| Value::String(MISSING_NONCE.to_owned()));
        let Some(data) = frame.data else {
            return Self::MalformedLog {
                nonce,
                reason: "received log message with no data field",
            };
        };
        let Some(message) = data.get("message").and_then(Value::as_str) else {
            return Self::MalformedLog {
                nonce,
                reason: "received log message with no message field",
            };
        };
        let is_err = match data.get("isErr") {
            None => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                return Self::MalformedLog {
                    nonce,
                    reason: "received log message with invalid isErr field",
                }
            }
        };
        Self::Log(LogRecord {
            message: message.to_owned(),
            is_err,
        })
    }
}

/// Input validation failures for `moduleCall`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidCall {
    /// No `data.module`.
    #[error("moduleCall is missing 'module' field")]
    MissingModule,
    /// `data.module` is not an accepted identifier.
    #[error("'module' field in moduleCall is expected to be a raw CID or a resolver CID")]
    MalformedModule,
    /// No `data.method`.
    #[error("no 'data.method' specified, module does not know what method to run")]
    MissingMethod,
    /// `data.method` is not a string.
    #[error("'data.method' needs to be a string")]
    MethodNotString,
    /// A root-only method was requested.
    #[error("{0} is a privileged method, only root is allowed to use it")]
    PrivilegedMethod(String),
    /// No `data.data`.
    #[error("no field data.data in moduleCall, data.data contains the module input")]
    MissingInput,
}

/// A validated `moduleCall` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleCallRequest {
    /// Target module as named by the caller.
    pub module: Identifier,
    /// Method to run in the module.
    pub method: String,
    /// Input for the module.
    pub input: Value,
}

impl ModuleCallRequest {
    /// Validate the `data` field of a `moduleCall` frame.
    ///
    /// # Errors
    ///
    /// Returns the first [`InvalidCall`] found, checking module, method and
    /// input in that order.
    pub fn parse(data: Option<&Value>) -> Result<Self, InvalidCall> {
        let call = data
            .and_then(Value::as_object)
            .ok_or(InvalidCall::MissingModule)?;
        let module = call.get("module").ok_or(InvalidCall::MissingModule)?;
        let module = match classify(module) {
            Classification::Immutable(id) | Classification::Resolver(id) => id,
            Classification::Invalid(_) => return Err(InvalidCall::MalformedModule),
        };
        let method = call
            .get("method")
            .ok_or(InvalidCall::MissingMethod)?
            .as_str()
            .ok_or(InvalidCall::MethodNotString)?;
        if PRIVILEGED_METHODS.contains(&method) {
            return Err(InvalidCall::PrivilegedMethod(method.to_owned()));
        }
        let input = call.get("data").cloned().ok_or(InvalidCall::MissingInput)?;
        Ok(Self {
            module,
            method: method.to_owned(),
            input,
        })
    }
}
