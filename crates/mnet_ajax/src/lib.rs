//! mnet ajax: one callback contract over two incompatible HTTP transports.
//!
//! A request goes through whichever transport the host exposes. The modern
//! transport reports readiness changes and supports headers; the legacy
//! cross-domain transport only reports load/error/timeout. The dispatcher
//! hides that difference behind `success(body, handle)` / `error(reason, handle)`.
//!
//! # Architecture
//!
//! ```text
//! Dispatcher::dispatch(address, callback, payload, options)
//!   │
//!   ├─ AddressCodec::parse / merge GET payload / format
//!   ├─ Host probe ──► modern Transport   (headers, ready state)
//!   │             └─► legacy Transport   (load / error / timeout)
//!   │
//!   ▼  open → set_timeout → configure → send(body, EventSink)
//! router task (spawned)
//!   │
//!   ▼
//! CallbackSet::succeed | CallbackSet::fail   (exactly one, at most once)
//! ```
//!
//! `dispatch` never returns a value and never propagates a failure. A setup
//! error is logged; once the address has parsed it also reaches the `error`
//! handler. Transport outcomes always reach the callbacks.

pub mod address;
pub mod config;
pub mod dispatch;
pub mod error;
#[cfg(feature = "http")]
pub mod http;
pub mod pending;
pub mod testing;
pub mod transport;
pub mod types;
pub mod value;

pub use address::{AddressCodec, ParsedAddress, UrlCodec};
pub use config::{set_ajax_timeout, DispatchConfig, TimeoutSetting};
pub use dispatch::Dispatcher;
pub use error::DispatchError;
pub use pending::PendingRegistry;
pub use transport::{
    Body, EventSink, HeaderConfig, Host, HostProfile, ModernSupport, ReadyState, Transport,
    TransportEvent, TransportKind,
};
pub use types::{Callback, CallbackSet, Method, RequestOptions, ResponseHandle};
