//! Native host: both transport families over `reqwest`.
//!
//! - `FetchTransport` plays the modern role: headers, credentials (a
//!   cookie-jar client), ready-state events. Network failures and timeouts
//!   end in DONE with status 0.
//! - `CrossDomainTransport` plays the legacy role: no header API, a progress
//!   event per body chunk, load on 2xx, error otherwise, timeout on client
//!   timeout.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::config::DEFAULT_TIMEOUT_MS;
use crate::error::{DispatchError, Result};
use crate::transport::{
    Body, EventSink, HeaderConfig, Host, HostProfile, ModernSupport, ReadyState, Transport,
    TransportEvent, TransportKind,
};
use crate::types::Method;

/// Host that performs real network IO.
#[derive(Clone)]
pub struct NativeHost {
    profile: HostProfile,
    plain: Client,
    credentialed: Client,
}

impl NativeHost {
    pub fn new(profile: HostProfile) -> Result<Self> {
        let plain = Client::builder()
            .user_agent(profile.user_agent.clone())
            .build()
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        let credentialed = Client::builder()
            .user_agent(profile.user_agent.clone())
            .cookie_store(true)
            .build()
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        Ok(Self {
            profile,
            plain,
            credentialed,
        })
    }

    pub fn profile(&self) -> &HostProfile {
        &self.profile
    }

    fn request(&self) -> PreparedRequest {
        PreparedRequest {
            method: None,
            url: String::new(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

impl Host for NativeHost {
    fn modern_transport(&self) -> Result<Option<Box<dyn Transport>>> {
        let supports_response_type = match self.profile.modern {
            ModernSupport::Absent => return Ok(None),
            ModernSupport::Full => true,
            ModernSupport::NoResponseType => false,
        };
        Ok(Some(Box::new(FetchTransport {
            plain: self.plain.clone(),
            credentialed: self.credentialed.clone(),
            request: self.request(),
            supports_response_type,
            with_credentials: false,
            headers: HeaderMap::new(),
        })))
    }

    fn legacy_transport(&self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(CrossDomainTransport {
            client: self.plain.clone(),
            request: self.request(),
        }))
    }

    fn user_agent(&self) -> &str {
        &self.profile.user_agent
    }

    fn segment(&self) -> Option<&str> {
        self.profile.segment.as_deref()
    }
}

struct PreparedRequest {
    method: Option<Method>,
    url: String,
    timeout: Duration,
}

impl PreparedRequest {
    fn open(&mut self, method: Method, url: &str) -> Result<()> {
        reqwest::Url::parse(url).map_err(DispatchError::Address)?;
        self.method = Some(method);
        self.url = url.to_string();
        Ok(())
    }

    fn build(&self, client: &Client, body: Body) -> Result<reqwest::RequestBuilder> {
        let method = self
            .method
            .ok_or_else(|| DispatchError::Transport("send before open".into()))?;
        let mut req = match method {
            Method::Get => client.get(&self.url),
            Method::Post => client.post(&self.url),
        };
        req = req.timeout(self.timeout);
        if let Some(text) = body.as_text() {
            req = req.body(text.to_string());
        }
        Ok(req)
    }
}

struct FetchTransport {
    plain: Client,
    credentialed: Client,
    request: PreparedRequest,
    supports_response_type: bool,
    with_credentials: bool,
    headers: HeaderMap,
}

impl Transport for FetchTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Modern
    }

    fn supports_response_type(&self) -> bool {
        self.supports_response_type
    }

    fn open(&mut self, method: Method, url: &str) -> Result<()> {
        self.request.open(method, url)
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.request.timeout = timeout;
    }

    fn headers(&mut self) -> Option<&mut dyn HeaderConfig> {
        Some(self)
    }

    fn send(self: Box<Self>, body: Body, events: EventSink) -> Result<()> {
        let client = if self.with_credentials {
            &self.credentialed
        } else {
            &self.plain
        };
        let req = self.request.build(client, body)?.headers(self.headers.clone());
        tokio::spawn(async move {
            let done = |status: u16, status_text: String, response_text: String| {
                TransportEvent::ReadyStateChange {
                    ready_state: ReadyState::Done,
                    status,
                    status_text,
                    response_text,
                }
            };
            let resp = match req.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    debug!(error = %e, timeout = e.is_timeout(), "fetch failed before headers");
                    events.emit(done(0, String::new(), String::new()));
                    return;
                }
            };
            let status = resp.status();
            let status_text = status.canonical_reason().unwrap_or_default().to_string();
            let code = status.as_u16();
            for ready_state in [ReadyState::HeadersReceived, ReadyState::Loading] {
                events.emit(TransportEvent::ReadyStateChange {
                    ready_state,
                    status: code,
                    status_text: status_text.clone(),
                    response_text: String::new(),
                });
            }
            match resp.text().await {
                Ok(text) => events.emit(done(code, status_text, text)),
                Err(e) => {
                    debug!(error = %e, "fetch failed while reading body");
                    events.emit(done(0, String::new(), String::new()))
                }
            };
        });
        Ok(())
    }
}

impl HeaderConfig for FetchTransport {
    fn set_with_credentials(&mut self, enabled: bool) {
        self.with_credentials = enabled;
    }

    fn set_request_header(&mut self, name: &str, value: &str) -> Result<()> {
        let invalid = || DispatchError::InvalidHeader { name: name.into() };
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
        let value = HeaderValue::from_str(value).map_err(|_| invalid())?;
        self.headers.insert(name, value);
        Ok(())
    }
}

struct CrossDomainTransport {
    client: Client,
    request: PreparedRequest,
}

impl Transport for CrossDomainTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Legacy
    }

    fn open(&mut self, method: Method, url: &str) -> Result<()> {
        self.request.open(method, url)
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.request.timeout = timeout;
    }

    fn send(self: Box<Self>, body: Body, events: EventSink) -> Result<()> {
        let req = self.request.build(&self.client, body)?;
        tokio::spawn(async move {
            let failed = |e: reqwest::Error| {
                if e.is_timeout() {
                    TransportEvent::Timeout
                } else {
                    TransportEvent::Error
                }
            };
            let mut resp = match req.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    events.emit(failed(e));
                    return;
                }
            };
            if !resp.status().is_success() {
                events.emit(TransportEvent::Error);
                return;
            }
            let mut bytes = Vec::new();
            loop {
                match resp.chunk().await {
                    Ok(Some(chunk)) => {
                        bytes.extend_from_slice(&chunk);
                        events.emit(TransportEvent::Progress);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        events.emit(failed(e));
                        return;
                    }
                }
            }
            events.emit(TransportEvent::Load {
                response_text: String::from_utf8_lossy(&bytes).into_owned(),
            });
        });
        Ok(())
    }
}
