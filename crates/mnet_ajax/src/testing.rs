//! Deterministic host for tests.
//!
//! [`ScriptedHost`] hands out transports that record everything configured on
//! them and answer from a queue of [`Script`]s. `Script::Manual` leaves the
//! request open so a test can drive its events one by one.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{DispatchError, Result};
use crate::transport::{
    Body, EventSink, HeaderConfig, Host, HostProfile, ModernSupport, ReadyState, Transport,
    TransportEvent, TransportKind,
};
use crate::types::{Callback, Method, ResponseHandle};

/// How a scripted transport answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    Respond {
        status: u16,
        status_text: String,
        body: String,
    },
    NetworkError,
    Timeout,
    /// Stay open; events come from [`ScriptedHost::emit`].
    Manual,
    /// `open` fails.
    FailOpen,
}

impl Script {
    pub fn ok(body: impl Into<String>) -> Self {
        Script::Respond {
            status: 200,
            status_text: "OK".into(),
            body: body.into(),
        }
    }

    pub fn status(status: u16, status_text: impl Into<String>, body: impl Into<String>) -> Self {
        Script::Respond {
            status,
            status_text: status_text.into(),
            body: body.into(),
        }
    }
}

/// Everything a transport was told before `send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRequest {
    pub kind: TransportKind,
    pub method: Method,
    pub url: String,
    pub timeout: Option<Duration>,
    /// `set_timeout` was called before `open`.
    pub timeout_before_open: bool,
    pub with_credentials: bool,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl SentRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
struct ScriptState {
    scripts: VecDeque<Script>,
    sent: Vec<SentRequest>,
    manual: Vec<EventSink>,
    modern_built: usize,
    legacy_built: usize,
}

#[derive(Clone)]
pub struct ScriptedHost {
    profile: HostProfile,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedHost {
    pub fn new(profile: HostProfile) -> Self {
        Self {
            profile,
            state: Arc::default(),
        }
    }

    pub fn modern() -> Self {
        Self::new(HostProfile::default())
    }

    pub fn legacy() -> Self {
        Self::new(HostProfile {
            modern: ModernSupport::Absent,
            ..HostProfile::default()
        })
    }

    /// Queue the answer for the next opened request. Unscripted requests
    /// answer `200 OK` with an empty body.
    pub fn push(&self, script: Script) -> &Self {
        self.lock().scripts.push_back(script);
        self
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.lock().sent.clone()
    }

    pub fn last_sent(&self) -> Option<SentRequest> {
        self.lock().sent.last().cloned()
    }

    /// Transports constructed so far, as `(modern, legacy)`.
    pub fn built(&self) -> (usize, usize) {
        let state = self.lock();
        (state.modern_built, state.legacy_built)
    }

    /// Deliver `event` to the `index`-th manual request. False when that
    /// request already settled or does not exist.
    pub fn emit(&self, index: usize, event: TransportEvent) -> bool {
        match self.lock().manual.get(index) {
            Some(sink) => sink.emit(event),
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transport(&self, kind: TransportKind, supports_response_type: bool) -> ScriptedTransport {
        ScriptedTransport {
            kind,
            supports_response_type,
            host: self.clone(),
            script: None,
            method: None,
            url: String::new(),
            timeout: None,
            timeout_before_open: false,
            with_credentials: false,
            headers: Vec::new(),
        }
    }
}

impl Host for ScriptedHost {
    fn modern_transport(&self) -> Result<Option<Box<dyn Transport>>> {
        let supports_response_type = match self.profile.modern {
            ModernSupport::Absent => return Ok(None),
            ModernSupport::Full => true,
            ModernSupport::NoResponseType => false,
        };
        self.lock().modern_built += 1;
        Ok(Some(Box::new(
            self.transport(TransportKind::Modern, supports_response_type),
        )))
    }

    fn legacy_transport(&self) -> Result<Box<dyn Transport>> {
        self.lock().legacy_built += 1;
        Ok(Box::new(self.transport(TransportKind::Legacy, true)))
    }

    fn user_agent(&self) -> &str {
        &self.profile.user_agent
    }

    fn segment(&self) -> Option<&str> {
        self.profile.segment.as_deref()
    }
}

struct ScriptedTransport {
    kind: TransportKind,
    supports_response_type: bool,
    host: ScriptedHost,
    script: Option<Script>,
    method: Option<Method>,
    url: String,
    timeout: Option<Duration>,
    timeout_before_open: bool,
    with_credentials: bool,
    headers: Vec<(String, String)>,
}

impl ScriptedTransport {
    fn events(&self, script: &Script) -> Vec<TransportEvent> {
        match (self.kind, script) {
            (
                TransportKind::Modern,
                Script::Respond {
                    status,
                    status_text,
                    body,
                },
            ) => [ReadyState::HeadersReceived, ReadyState::Loading, ReadyState::Done]
                .into_iter()
                .map(|ready_state| TransportEvent::ReadyStateChange {
                    ready_state,
                    status: *status,
                    status_text: status_text.clone(),
                    response_text: if ready_state == ReadyState::Done {
                        body.clone()
                    } else {
                        String::new()
                    },
                })
                .collect(),
            (TransportKind::Modern, Script::NetworkError | Script::Timeout) => {
                vec![TransportEvent::ReadyStateChange {
                    ready_state: ReadyState::Done,
                    status: 0,
                    status_text: String::new(),
                    response_text: String::new(),
                }]
            }
            (TransportKind::Legacy, Script::Respond { status, body, .. }) => {
                if (200..300).contains(status) {
                    vec![
                        TransportEvent::Progress,
                        TransportEvent::Load {
                            response_text: body.clone(),
                        },
                    ]
                } else {
                    vec![TransportEvent::Error]
                }
            }
            (TransportKind::Legacy, Script::NetworkError) => vec![TransportEvent::Error],
            (TransportKind::Legacy, Script::Timeout) => vec![TransportEvent::Timeout],
            (_, Script::Manual | Script::FailOpen) => Vec::new(),
        }
    }
}

impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn supports_response_type(&self) -> bool {
        self.supports_response_type
    }

    fn open(&mut self, method: Method, url: &str) -> Result<()> {
        let script = self
            .host
            .lock()
            .scripts
            .pop_front()
            .unwrap_or_else(|| Script::ok(""));
        if script == Script::FailOpen {
            return Err(DispatchError::Transport(format!("open {url} refused")));
        }
        self.script = Some(script);
        self.method = Some(method);
        self.url = url.to_string();
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) {
        if self.method.is_none() {
            self.timeout_before_open = true;
        }
        self.timeout = Some(timeout);
    }

    fn headers(&mut self) -> Option<&mut dyn HeaderConfig> {
        match self.kind {
            TransportKind::Modern => Some(self),
            TransportKind::Legacy => None,
        }
    }

    fn send(self: Box<Self>, body: Body, events: EventSink) -> Result<()> {
        let (Some(method), Some(script)) = (self.method, self.script.clone()) else {
            return Err(DispatchError::Transport("send before open".into()));
        };
        let scripted = self.events(&script);
        let mut state = self.host.lock();
        state.sent.push(SentRequest {
            kind: self.kind,
            method,
            url: self.url.clone(),
            timeout: self.timeout,
            timeout_before_open: self.timeout_before_open,
            with_credentials: self.with_credentials,
            headers: self.headers.clone(),
            body,
        });
        if script == Script::Manual {
            state.manual.push(events);
            return Ok(());
        }
        drop(state);
        tokio::spawn(async move {
            for event in scripted {
                tokio::task::yield_now().await;
                if !events.emit(event) {
                    break;
                }
            }
        });
        Ok(())
    }
}

impl HeaderConfig for ScriptedTransport {
    fn set_with_credentials(&mut self, enabled: bool) {
        self.with_credentials = enabled;
    }

    fn set_request_header(&mut self, name: &str, value: &str) -> Result<()> {
        if name.is_empty() {
            return Err(DispatchError::InvalidHeader { name: name.into() });
        }
        self.headers.push((name.to_string(), value.to_string()));
        Ok(())
    }
}

/// A callback outcome captured by [`recorder`].
#[derive(Debug)]
pub enum Outcome {
    Success {
        body: String,
        handle: Arc<ResponseHandle>,
    },
    Error {
        reason: String,
        handle: Arc<ResponseHandle>,
    },
}

impl Outcome {
    pub fn handle(&self) -> &Arc<ResponseHandle> {
        match self {
            Outcome::Success { handle, .. } | Outcome::Error { handle, .. } => handle,
        }
    }
}

/// Callback pair that forwards into a channel. The channel closes once the
/// callbacks are dropped, so a second `recv` returning `None` proves a
/// single invocation.
pub fn recorder() -> (Callback, mpsc::UnboundedReceiver<Outcome>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let err_tx = tx.clone();
    let callback = Callback::handlers(
        move |body, handle| {
            let _ = tx.send(Outcome::Success { body, handle });
        },
        move |reason, handle| {
            let _ = err_tx.send(Outcome::Error { reason, handle });
        },
    );
    (callback, rx)
}

/// Single-function callback that forwards successes only.
pub fn success_recorder() -> (Callback, mpsc::UnboundedReceiver<Outcome>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = Callback::success(move |body, handle| {
        let _ = tx.send(Outcome::Success { body, handle });
    });
    (callback, rx)
}
