use colored::Colorize;
use mnet_ajax::http::NativeHost;
use mnet_ajax::{
    set_ajax_timeout, Callback, Dispatcher, HostProfile, Method, ModernSupport, RequestOptions,
    TransportKind,
};
use serde_json::Value;
use std::fs;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::RequestArgs;

pub struct HostArgs {
    pub transport: String,
    pub user_agent: Option<String>,
    pub segment: Option<String>,
    pub timeout_ms: u64,
}

enum Reply {
    Done {
        body: String,
        status: u16,
        kind: TransportKind,
    },
    Failed {
        reason: String,
        status: u16,
        kind: TransportKind,
    },
}

// ── request ─────────────────────────────────────────────────────

pub async fn send(host: &HostArgs, method: Method, args: &RequestArgs) -> Result<(), String> {
    let modern: ModernSupport = host
        .transport
        .parse()
        .map_err(|e| format!("invalid --transport: {e}"))?;
    let mut profile = HostProfile {
        modern,
        segment: host.segment.clone(),
        ..HostProfile::default()
    };
    if let Some(ua) = &host.user_agent {
        profile.user_agent = ua.clone();
    }
    let native = NativeHost::new(profile).map_err(|e| format!("host: {e}"))?;
    set_ajax_timeout(host.timeout_ms);
    let dispatcher = Dispatcher::new(Arc::new(native));

    let payload = args.data.as_deref().map(read_payload).transpose()?;
    let options = build_options(method, args)?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let err_tx = tx.clone();
    let callback = Callback::handlers(
        move |body, handle| {
            let _ = tx.send(Reply::Done {
                body,
                status: handle.status(),
                kind: handle.kind(),
            });
        },
        move |reason, handle| {
            let _ = err_tx.send(Reply::Failed {
                reason,
                status: handle.status(),
                kind: handle.kind(),
            });
        },
    );
    dispatcher.dispatch(&args.url, callback, payload, options);

    // transport enforces the timeout, this only guards against a stuck host
    let deadline = Duration::from_millis(host.timeout_ms) + Duration::from_secs(5);
    let reply = tokio::time::timeout(deadline, rx.recv())
        .await
        .map_err(|_| "request never settled".to_string())?
        .ok_or_else(|| "request was not issued (see log)".to_string())?;

    match reply {
        Reply::Done { body, status, kind } => {
            eprintln!(
                "{} {} via {} transport",
                "✓".green().bold(),
                status_label(status),
                kind
            );
            println!("{body}");
            Ok(())
        }
        Reply::Failed { reason, .. } if reason == "timeout" => {
            Err(format!("timeout after {}ms", host.timeout_ms))
        }
        Reply::Failed {
            reason,
            status,
            kind,
        } => Err(format!(
            "transport error via {kind} transport: {} ({})",
            if reason.is_empty() { "no response" } else { reason.as_str() },
            status_label(status)
        )),
    }
}

fn status_label(status: u16) -> String {
    if status == 0 {
        "status n/a".into()
    } else {
        format!("HTTP {status}")
    }
}

fn build_options(method: Method, args: &RequestArgs) -> Result<RequestOptions, String> {
    let mut options = RequestOptions::default().method(method);
    for raw in &args.headers {
        let (name, value) = parse_header(raw)?;
        options = options.header(name, value);
    }
    if args.with_credentials {
        options = options.with_credentials();
    }
    if args.preflight {
        options = options.preflight();
    }
    if let Some(ct) = &args.content_type {
        options = options.content_type(ct.clone());
    }
    Ok(options)
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    // whichever separator comes first; values may contain the other one
    let (name, value) = raw
        .find([':', '='])
        .map(|at| (&raw[..at], &raw[at + 1..]))
        .ok_or_else(|| format!("invalid header '{raw}', expected 'Name: value'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("invalid header '{raw}', empty name"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn read_payload(arg: &str) -> Result<Value, String> {
    let content = if arg == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| format!("read stdin: {e}"))?;
        buf
    } else if let Some(path) = arg.strip_prefix('@') {
        fs::read_to_string(path).map_err(|e| format!("read file: {e}"))?
    } else {
        arg.to_string()
    };
    Ok(serde_json::from_str(&content).unwrap_or(Value::String(content)))
}
