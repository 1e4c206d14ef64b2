use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error};

use crate::error::DispatchError;
use crate::transport::{ReadyState, TransportKind};

/// HTTP method accepted by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            other => Err(DispatchError::UnsupportedMethod(other.to_string())),
        }
    }
}

/// Per-request configuration. Every field is optional.
///
/// Deserializes from the camelCase shape callers already use:
///
/// ```json
/// { "method": "POST", "withCredentials": true, "customHeaders": {"X-A": "1"},
///   "preflight": true, "contentType": "application/json" }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    /// Explicit method. Inferred from the payload when absent.
    #[serde(default)]
    pub method: Option<Method>,
    #[serde(default)]
    pub with_credentials: bool,
    #[serde(default)]
    pub custom_headers: BTreeMap<String, String>,
    /// Force a non-simple request so the browser-style CORS preflight runs.
    #[serde(default)]
    pub preflight: bool,
    /// Content-Type header. `text/plain` when absent.
    #[serde(default)]
    pub content_type: Option<String>,
}

impl RequestOptions {
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(name.into(), value.into());
        self
    }

    pub fn with_credentials(mut self) -> Self {
        self.with_credentials = true;
        self
    }

    pub fn preflight(mut self) -> Self {
        self.preflight = true;
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Default)]
struct HandleState {
    ready_state: ReadyState,
    status: u16,
    status_text: String,
    response_text: String,
}

/// The raw handle passed to both callbacks: what was sent and what came back.
#[derive(Debug)]
pub struct ResponseHandle {
    id: u64,
    kind: TransportKind,
    method: Method,
    url: String,
    timeout: Duration,
    state: Mutex<HandleState>,
}

impl ResponseHandle {
    pub(crate) fn new(kind: TransportKind, method: Method, url: String, timeout: Duration) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            method,
            url,
            timeout,
            state: Mutex::new(HandleState::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Final address, after any GET payload merge.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Timeout in force when the request was issued.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn ready_state(&self) -> ReadyState {
        self.lock().ready_state
    }

    /// HTTP status. Always 0 on the legacy transport, which does not expose it.
    pub fn status(&self) -> u16 {
        self.lock().status
    }

    pub fn status_text(&self) -> String {
        self.lock().status_text.clone()
    }

    pub fn response_text(&self) -> String {
        self.lock().response_text.clone()
    }

    pub(crate) fn record_ready_state(
        &self,
        ready_state: ReadyState,
        status: u16,
        status_text: &str,
        response_text: &str,
    ) {
        let mut state = self.lock();
        state.ready_state = ready_state;
        state.status = status;
        state.status_text = status_text.to_string();
        state.response_text = response_text.to_string();
    }

    pub(crate) fn record_load(&self, response_text: &str) {
        let mut state = self.lock();
        state.ready_state = ReadyState::Done;
        state.response_text = response_text.to_string();
    }

    pub(crate) fn record_failure(&self) {
        self.lock().ready_state = ReadyState::Done;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HandleState> {
        // state is plain data, a poisoned lock still holds a usable snapshot
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub type SuccessFn = Box<dyn FnOnce(String, Arc<ResponseHandle>) + Send>;
pub type ErrorFn = Box<dyn FnOnce(String, Arc<ResponseHandle>) + Send>;

/// Resolved success/error pair. Consuming either side drops the other, so
/// at most one of them ever runs.
pub struct CallbackSet {
    success: SuccessFn,
    error: ErrorFn,
}

impl CallbackSet {
    pub fn new<S, E>(success: S, error: E) -> Self
    where
        S: FnOnce(String, Arc<ResponseHandle>) + Send + 'static,
        E: FnOnce(String, Arc<ResponseHandle>) + Send + 'static,
    {
        Self {
            success: Box::new(success),
            error: Box::new(error),
        }
    }

    /// Log-only handlers. `hostname` is included in error logs when known.
    pub fn logging(hostname: Option<String>) -> Self {
        Self {
            success: default_success(),
            error: default_error(hostname),
        }
    }

    pub(crate) fn succeed(self, response_text: String, handle: Arc<ResponseHandle>) {
        (self.success)(response_text, handle)
    }

    pub(crate) fn fail(self, reason: String, handle: Arc<ResponseHandle>) {
        (self.error)(reason, handle)
    }
}

impl fmt::Debug for CallbackSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSet").finish_non_exhaustive()
    }
}

/// What a caller hands to `dispatch`.
#[derive(Default)]
pub enum Callback {
    /// Both handlers supplied.
    Handlers(CallbackSet),
    /// A single function, installed as `success`.
    Success(SuccessFn),
    /// Log-only defaults.
    #[default]
    None,
}

impl Callback {
    pub fn success<F>(f: F) -> Self
    where
        F: FnOnce(String, Arc<ResponseHandle>) + Send + 'static,
    {
        Callback::Success(Box::new(f))
    }

    pub fn handlers<S, E>(success: S, error: E) -> Self
    where
        S: FnOnce(String, Arc<ResponseHandle>) + Send + 'static,
        E: FnOnce(String, Arc<ResponseHandle>) + Send + 'static,
    {
        Callback::Handlers(CallbackSet::new(success, error))
    }

    /// Fill in whatever the caller left out with the logging defaults.
    pub(crate) fn resolve(self, hostname: Option<String>) -> CallbackSet {
        match self {
            Callback::Handlers(set) => set,
            Callback::Success(success) => CallbackSet {
                success,
                error: default_error(hostname),
            },
            Callback::None => CallbackSet::logging(hostname),
        }
    }
}

impl From<CallbackSet> for Callback {
    fn from(set: CallbackSet) -> Self {
        Callback::Handlers(set)
    }
}

fn default_success() -> SuccessFn {
    Box::new(|_, handle| {
        debug!(url = %handle.url(), "xhr success");
    })
}

fn default_error(hostname: Option<String>) -> ErrorFn {
    Box::new(move |reason, handle| {
        error!(
            hostname = hostname.as_deref().unwrap_or_default(),
            reason = %reason,
            status = handle.status(),
            "xhr error"
        );
    })
}
