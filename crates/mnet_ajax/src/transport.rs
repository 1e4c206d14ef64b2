//! Transport strategy: the seam between the dispatcher and the host.
//!
//! A [`Host`] is probed on every dispatch for the transports it offers. Both
//! transports implement the same [`Transport`] trait; they differ in
//! capability (only the modern one exposes [`HeaderConfig`]) and in the
//! [`TransportEvent`]s they emit after `send`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{DispatchError, Result};
use crate::types::Method;

/// Which of the two transport families handled a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Ready-state driven, header capable.
    Modern,
    /// Cross-domain fallback: load/error/timeout only.
    Legacy,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Modern => "modern",
            TransportKind::Legacy => "legacy",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Modern transport ready states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    #[default]
    Unsent = 0,
    Opened = 1,
    HeadersReceived = 2,
    Loading = 3,
    Done = 4,
}

/// What a transport reports after `send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Modern transport readiness change. Fires repeatedly.
    ReadyStateChange {
        ready_state: ReadyState,
        status: u16,
        status_text: String,
        response_text: String,
    },
    /// Legacy: body fully received.
    Load { response_text: String },
    /// Legacy: request failed.
    Error,
    /// Legacy: transport timeout elapsed.
    Timeout,
    /// Legacy: part of the body arrived. Not a completion.
    Progress,
}

/// Where a transport delivers its events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once nobody is listening anymore, i.e. the request
    /// already settled.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Request body handed to `Transport::send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Nothing sent.
    Empty,
    /// The payload as the host coerces it to a string.
    Coerced(String),
    /// The payload serialized as JSON text.
    Json(String),
}

impl Body {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Empty => None,
            Body::Coerced(s) | Body::Json(s) => Some(s),
        }
    }
}

/// Header and credential configuration. Only the modern transport has it.
pub trait HeaderConfig {
    fn set_with_credentials(&mut self, enabled: bool);
    fn set_request_header(&mut self, name: &str, value: &str) -> Result<()>;
}

/// One in-flight request, from `open` to `send`.
///
/// Call order is `open`, `set_timeout`, header configuration, `send`. The
/// timeout must not be set before `open`.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Response-type introspection. A modern transport lacking it is
    /// replaced by the legacy one.
    fn supports_response_type(&self) -> bool {
        true
    }

    fn open(&mut self, method: Method, url: &str) -> Result<()>;

    fn set_timeout(&mut self, timeout: Duration);

    fn headers(&mut self) -> Option<&mut dyn HeaderConfig> {
        None
    }

    /// Start the request. Events are delivered later through `events`,
    /// never from inside this call.
    fn send(self: Box<Self>, body: Body, events: EventSink) -> Result<()>;
}

/// The environment a dispatcher runs in.
pub trait Host: Send + Sync {
    /// A fresh modern transport, or `None` when the host has none.
    fn modern_transport(&self) -> Result<Option<Box<dyn Transport>>>;

    /// A fresh legacy cross-domain transport.
    fn legacy_transport(&self) -> Result<Box<dyn Transport>>;

    fn user_agent(&self) -> &str;

    /// Host-application segment flag, when the embedding page sets one.
    fn segment(&self) -> Option<&str>;
}

/// How much of the modern transport the host exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModernSupport {
    #[default]
    Full,
    /// Constructible, but without response-type support.
    NoResponseType,
    Absent,
}

impl FromStr for ModernSupport {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" | "auto" | "modern" => Ok(ModernSupport::Full),
            "no-response-type" => Ok(ModernSupport::NoResponseType),
            "absent" | "legacy" => Ok(ModernSupport::Absent),
            other => Err(DispatchError::Transport(format!(
                "unknown transport support '{other}'"
            ))),
        }
    }
}

/// Static description of a host environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostProfile {
    #[serde(default)]
    pub modern: ModernSupport,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub segment: Option<String>,
}

impl Default for HostProfile {
    fn default() -> Self {
        Self {
            modern: ModernSupport::Full,
            user_agent: concat!("mnet_ajax/", env!("CARGO_PKG_VERSION")).into(),
            segment: None,
        }
    }
}
