//! Request dispatch: shape the request, pick a transport, route the outcome.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, warn};

use crate::address::{AddressCodec, ParsedAddress, UrlCodec};
use crate::config::TimeoutSetting;
use crate::error::{DispatchError, Result};
use crate::pending::{PendingGuard, PendingRegistry};
use crate::transport::{Body, EventSink, Host, ReadyState, Transport, TransportEvent, TransportKind};
use crate::types::{Callback, CallbackSet, Method, RequestOptions, ResponseHandle};
use crate::value::{is_truthy, to_host_string};

/// Header forced by `preflight`. Any non-safelisted header makes the request
/// non-simple.
pub const PREFLIGHT_HEADER: (&str, &str) = ("X-Requested-With", "XMLHttpRequest");

pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Host segment under which legacy engines get a JSON body.
pub const JSON_BODY_SEGMENT: &str = "8";

/// Dispatches requests over a [`Host`].
#[derive(Clone)]
pub struct Dispatcher {
    host: Arc<dyn Host>,
    codec: Arc<dyn AddressCodec>,
    timeout: TimeoutSetting,
    pending: PendingRegistry,
}

impl Dispatcher {
    /// Dispatcher over `host`, reading the process-wide timeout.
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self {
            host,
            codec: Arc::new(UrlCodec::new()),
            timeout: TimeoutSetting::global(),
            pending: PendingRegistry::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: TimeoutSetting) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn AddressCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn timeout(&self) -> &TimeoutSetting {
        &self.timeout
    }

    pub fn pending(&self) -> &PendingRegistry {
        &self.pending
    }

    /// Issue a request. Returns immediately; the outcome reaches `callback`
    /// later from a spawned task.
    ///
    /// Failures before the address is known (no runtime, unparseable
    /// address) are only logged. Any later setup failure is logged and then
    /// reported to the resolved `error` handler, still asynchronously.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn dispatch(
        &self,
        address: &str,
        callback: Callback,
        payload: Option<Value>,
        options: RequestOptions,
    ) {
        let (runtime, prepared) = match self.prepare(address, payload, &options) {
            Ok(prepared) => prepared,
            Err(err) => {
                error!(error = %err, "xhr construction");
                return;
            }
        };
        let hostname = prepared.address.host.clone();
        let callbacks = callback.resolve(Some(hostname.clone()));

        let mut attempt = Attempt {
            kind: TransportKind::Modern,
            method: prepared.method,
            url: address.to_string(),
            timeout: None,
        };
        let issued = match self.issue(prepared, &options, &mut attempt) {
            Ok(issued) => issued,
            Err(err) => {
                error!(hostname = %hostname, error = %err, "xhr construction");
                let handle = Arc::new(ResponseHandle::new(
                    attempt.kind,
                    attempt.method,
                    attempt.url,
                    attempt.timeout.unwrap_or_else(|| self.timeout.get()),
                ));
                handle.record_failure();
                let reason = err.to_string();
                runtime.spawn(async move { callbacks.fail(reason, handle) });
                return;
            }
        };

        let Issued {
            kind,
            handle,
            events,
        } = issued;
        match kind {
            TransportKind::Legacy => {
                let guard = self.pending.acquire(&handle);
                runtime.spawn(route_legacy(events, handle, callbacks, guard));
            }
            TransportKind::Modern => {
                self.pending.track(&handle);
                runtime.spawn(route_modern(events, handle, callbacks));
            }
        }
    }

    fn prepare(
        &self,
        address: &str,
        payload: Option<Value>,
        options: &RequestOptions,
    ) -> Result<(tokio::runtime::Handle, Prepared)> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;
        let payload = payload.filter(is_truthy);
        let method = options.method.unwrap_or(if payload.is_some() {
            Method::Post
        } else {
            Method::Get
        });
        let address = self.codec.parse(address)?;
        Ok((
            runtime,
            Prepared {
                method,
                payload,
                address,
            },
        ))
    }

    /// Build, configure and send the transport request. `attempt` tracks
    /// what is known so far, for reporting a failure.
    fn issue(
        &self,
        prepared: Prepared,
        options: &RequestOptions,
        attempt: &mut Attempt,
    ) -> Result<Issued> {
        let Prepared {
            method,
            payload,
            address: mut parsed,
        } = prepared;

        let mut transport = self.select_transport(&mut attempt.kind)?;
        let kind = transport.kind();
        attempt.kind = kind;

        match (&method, &payload) {
            (Method::Get, Some(Value::Object(data))) => parsed.merge_query(data),
            (Method::Get, Some(_)) => {
                warn!(hostname = %parsed.host, "GET payload is not a mapping, not merged into the query")
            }
            _ => {}
        }
        // always the resolved form, relative and protocol-relative input included
        let url = self.codec.format(&parsed)?;
        attempt.url = url.clone();

        transport.open(method, &url)?;
        // read once, the in-flight request keeps this value
        let timeout = self.timeout.get();
        attempt.timeout = Some(timeout);
        transport.set_timeout(timeout);

        if let Some(headers) = transport.headers() {
            if options.with_credentials {
                headers.set_with_credentials(true);
            }
            for (name, value) in &options.custom_headers {
                headers.set_request_header(name, value)?;
            }
            if options.preflight {
                headers.set_request_header(PREFLIGHT_HEADER.0, PREFLIGHT_HEADER.1)?;
            }
            headers.set_request_header(
                "Content-Type",
                options.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE),
            )?;
        }

        let body = select_body(
            method,
            payload.as_ref(),
            self.host.user_agent(),
            self.host.segment(),
        )?;

        let handle = Arc::new(ResponseHandle::new(kind, method, url, timeout));
        let (sink, events) = EventSink::channel();
        transport.send(body, sink)?;
        debug!(handle = handle.id(), %kind, %method, url = %handle.url(), "xhr sent");

        Ok(Issued {
            kind,
            handle,
            events,
        })
    }

    /// Probe the host. Runs on every dispatch. `probing` names the family
    /// being constructed, so a construction failure can be attributed.
    fn select_transport(&self, probing: &mut TransportKind) -> Result<Box<dyn Transport>> {
        *probing = TransportKind::Modern;
        let modern = self.host.modern_transport()?;
        match modern {
            Some(modern) if modern.supports_response_type() => return Ok(modern),
            Some(_) => debug!("modern transport lacks response types, using legacy transport"),
            None => {}
        }
        *probing = TransportKind::Legacy;
        self.host.legacy_transport()
    }
}

/// Request shape once the address has been parsed.
struct Prepared {
    method: Method,
    payload: Option<Value>,
    address: ParsedAddress,
}

struct Attempt {
    kind: TransportKind,
    method: Method,
    url: String,
    timeout: Option<Duration>,
}

struct Issued {
    kind: TransportKind,
    handle: Arc<ResponseHandle>,
    events: UnboundedReceiver<TransportEvent>,
}

/// Pick the request body.
///
/// A POST payload is serialized as JSON only for legacy Microsoft engines
/// (`msie`/`trident` user agents) running under host segment `"8"`. In every
/// other case the body is `method == POST && payload`: nothing for GET, and
/// the host's string coercion of the payload for POST, so an object payload
/// goes out as `[object Object]`. Likely a historical defect, kept as is.
pub fn select_body(
    method: Method,
    payload: Option<&Value>,
    user_agent: &str,
    segment: Option<&str>,
) -> Result<Body> {
    let payload = match (method, payload) {
        (Method::Post, Some(p)) if is_truthy(p) => p,
        _ => return Ok(Body::Empty),
    };
    if is_legacy_microsoft(user_agent) && segment == Some(JSON_BODY_SEGMENT) {
        let text = match payload {
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other)?,
        };
        return Ok(Body::Json(text));
    }
    Ok(Body::Coerced(to_host_string(payload)))
}

fn is_legacy_microsoft(user_agent: &str) -> bool {
    let ua = user_agent.to_ascii_lowercase();
    ua.contains("msie") || ua.contains("trident")
}

async fn route_legacy(
    mut events: UnboundedReceiver<TransportEvent>,
    handle: Arc<ResponseHandle>,
    callbacks: CallbackSet,
    mut guard: PendingGuard,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Load { response_text } => {
                handle.record_load(&response_text);
                callbacks.succeed(response_text, Arc::clone(&handle));
                guard.release();
                return;
            }
            TransportEvent::Error => {
                handle.record_failure();
                callbacks.fail("error".into(), Arc::clone(&handle));
                guard.release();
                return;
            }
            TransportEvent::Timeout => {
                handle.record_failure();
                callbacks.fail("timeout".into(), Arc::clone(&handle));
                guard.release();
                return;
            }
            TransportEvent::Progress => debug!(handle = handle.id(), "xhr onprogress"),
            TransportEvent::ReadyStateChange { .. } => {
                warn!(handle = handle.id(), "legacy transport reported a ready state, ignored")
            }
        }
    }
    warn!(handle = handle.id(), "legacy transport closed without a terminal event");
}

async fn route_modern(
    mut events: UnboundedReceiver<TransportEvent>,
    handle: Arc<ResponseHandle>,
    callbacks: CallbackSet,
) {
    while let Some(event) = events.recv().await {
        let (ready_state, status, status_text, response_text) = match event {
            TransportEvent::ReadyStateChange {
                ready_state,
                status,
                status_text,
                response_text,
            } => (ready_state, status, status_text, response_text),
            other => {
                warn!(handle = handle.id(), event = ?other, "modern transport reported a legacy event, ignored");
                continue;
            }
        };
        handle.record_ready_state(ready_state, status, &status_text, &response_text);
        if ready_state != ReadyState::Done {
            continue;
        }
        if (200..300).contains(&status) || status == 304 {
            callbacks.succeed(response_text, handle);
        } else {
            callbacks.fail(status_text, handle);
        }
        return;
    }
    warn!(handle = handle.id(), "modern transport closed without reaching DONE");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const IE11: &str = "Mozilla/5.0 (Windows NT 10.0; Trident/7.0; rv:11.0) like Gecko";
    const CHROME: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 Chrome/120.0";

    #[test]
    fn get_never_has_a_body() {
        let body = select_body(Method::Get, Some(&json!({"a": 1})), IE11, Some("8")).unwrap();
        assert_eq!(body, Body::Empty);
    }

    #[test]
    fn post_without_payload_is_empty() {
        assert_eq!(select_body(Method::Post, None, CHROME, None).unwrap(), Body::Empty);
        assert_eq!(
            select_body(Method::Post, Some(&json!("")), CHROME, None).unwrap(),
            Body::Empty
        );
    }

    // Outside the legacy-engine carve-out an object payload is coerced, not
    // serialized. Probable historical defect, asserted as observed.
    #[test]
    fn post_object_payload_is_coerced_not_serialized() {
        let payload = json!({"a": 1});
        let body = select_body(Method::Post, Some(&payload), CHROME, Some("8")).unwrap();
        assert_eq!(body, Body::Coerced("[object Object]".into()));
        assert_ne!(body.as_text(), Some(payload.to_string().as_str()));
    }

    #[test]
    fn post_string_payload_is_sent_verbatim() {
        let body = select_body(Method::Post, Some(&json!("{\"a\":1}")), CHROME, None).unwrap();
        assert_eq!(body, Body::Coerced("{\"a\":1}".into()));
    }

    #[test]
    fn legacy_engine_under_segment_gets_json() {
        let body = select_body(Method::Post, Some(&json!({"a": 1})), IE11, Some("8")).unwrap();
        assert_eq!(body, Body::Json("{\"a\":1}".into()));

        let msie = "Mozilla/4.0 (compatible; MSIE 9.0; Windows NT 6.1)";
        let body = select_body(Method::Post, Some(&json!([1, 2])), msie, Some("8")).unwrap();
        assert_eq!(body, Body::Json("[1,2]".into()));
    }

    #[test]
    fn legacy_engine_needs_the_segment() {
        let body = select_body(Method::Post, Some(&json!({"a": 1})), IE11, Some("7")).unwrap();
        assert_eq!(body, Body::Coerced("[object Object]".into()));
        let body = select_body(Method::Post, Some(&json!({"a": 1})), IE11, None).unwrap();
        assert_eq!(body, Body::Coerced("[object Object]".into()));
    }

    #[test]
    fn user_agent_match_is_case_insensitive() {
        assert!(is_legacy_microsoft("something TRIDENT something"));
        assert!(is_legacy_microsoft("msie"));
        assert!(!is_legacy_microsoft(CHROME));
    }
}
