use mnet_ajax::testing::{recorder, success_recorder, Outcome, Script, ScriptedHost};
use mnet_ajax::{
    Body, Callback, Dispatcher, HostProfile, Method, ModernSupport, ReadyState, RequestOptions,
    TimeoutSetting, TransportEvent, TransportKind, UrlCodec,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn dispatcher(host: &ScriptedHost) -> Dispatcher {
    Dispatcher::new(Arc::new(host.clone())).with_timeout(TimeoutSetting::new(3_000))
}

async fn next(rx: &mut UnboundedReceiver<Outcome>) -> Option<Outcome> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("callback channel stalled")
}

fn query_of(url: &str) -> Vec<(String, String)> {
    url::Url::parse(url)
        .unwrap()
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

// ── request shaping ─────────────────────────────────────────────

#[tokio::test]
async fn get_payload_is_merged_into_query() {
    for host in [ScriptedHost::modern(), ScriptedHost::legacy()] {
        let d = dispatcher(&host);
        let (cb, mut rx) = recorder();
        d.dispatch(
            "https://bids.example.com/v1/auction",
            cb,
            Some(json!({"a": 1, "b": 2})),
            RequestOptions::default().method(Method::Get),
        );
        assert!(matches!(next(&mut rx).await, Some(Outcome::Success { .. })));

        let sent = host.last_sent().unwrap();
        let q = query_of(&sent.url);
        assert!(q.contains(&("a".into(), "1".into())), "{}", sent.url);
        assert!(q.contains(&("b".into(), "2".into())), "{}", sent.url);
        assert_eq!(sent.body, Body::Empty);
    }
}

#[tokio::test]
async fn get_payload_overrides_existing_query_key() {
    let host = ScriptedHost::modern();
    let d = dispatcher(&host);
    d.dispatch(
        "https://bids.example.com/v1?a=0&keep=yes",
        Callback::None,
        Some(json!({"a": 1})),
        RequestOptions::default().method(Method::Get),
    );
    tokio::task::yield_now().await;
    let q = query_of(&host.last_sent().unwrap().url);
    assert_eq!(
        q,
        vec![("a".to_string(), "1".to_string()), ("keep".to_string(), "yes".to_string())]
    );
}

#[tokio::test]
async fn method_inferred_from_payload() {
    let host = ScriptedHost::modern();
    let d = dispatcher(&host);
    d.dispatch("https://x.example.com/", Callback::None, Some(json!("k=v")), Default::default());
    d.dispatch("https://x.example.com/", Callback::None, None, Default::default());
    // falsy payloads count as absent
    d.dispatch("https://x.example.com/", Callback::None, Some(json!(0)), Default::default());

    let sent = host.sent();
    assert_eq!(sent[0].method, Method::Post);
    assert_eq!(sent[0].body, Body::Coerced("k=v".into()));
    assert_eq!(sent[1].method, Method::Get);
    assert_eq!(sent[2].method, Method::Get);
    assert_eq!(sent[2].body, Body::Empty);
}

#[tokio::test]
async fn address_left_alone_without_get_payload() {
    let host = ScriptedHost::modern();
    let d = dispatcher(&host);
    let address = "https://x.example.com/path?z=1";
    d.dispatch(address, Callback::None, Some(json!({"a": 1})), Default::default());
    assert_eq!(host.last_sent().unwrap().url, address);
}

#[tokio::test]
async fn relative_address_is_resolved_on_every_branch() {
    let host = ScriptedHost::modern();
    let codec = UrlCodec::with_base("https://page.example.com/dir/index.html").unwrap();
    let d = dispatcher(&host).with_codec(Arc::new(codec));

    d.dispatch("bid", Callback::None, None, Default::default());
    d.dispatch("bid", Callback::None, Some(json!("k=v")), Default::default());
    d.dispatch(
        "bid",
        Callback::None,
        Some(json!({"x": 1})),
        RequestOptions::default().method(Method::Get),
    );

    let sent = host.sent();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0].method, Method::Get);
    assert_eq!(sent[0].url, "https://page.example.com/dir/bid");
    assert_eq!(sent[1].method, Method::Post);
    assert_eq!(sent[1].url, "https://page.example.com/dir/bid");
    assert_eq!(sent[2].url, "https://page.example.com/dir/bid?x=1");
}

#[tokio::test]
async fn protocol_relative_address_gets_https_on_every_branch() {
    for host in [ScriptedHost::modern(), ScriptedHost::legacy()] {
        let d = dispatcher(&host);
        let (cb, mut rx) = recorder();
        d.dispatch("//cdn.example.net/bid", cb, Some(json!("k=v")), Default::default());
        assert!(matches!(next(&mut rx).await, Some(Outcome::Success { .. })));
        d.dispatch("//cdn.example.net/bid", Callback::None, None, Default::default());

        let sent = host.sent();
        assert_eq!(sent[0].method, Method::Post);
        assert_eq!(sent[0].url, "https://cdn.example.net/bid");
        assert_eq!(sent[1].method, Method::Get);
        assert_eq!(sent[1].url, "https://cdn.example.net/bid");
    }
}

// Probable historical defect: outside the legacy-engine/segment carve-out an
// object payload is not serialized; the host coerces it instead.
#[tokio::test]
async fn post_object_payload_is_not_sent_as_json() {
    let host = ScriptedHost::modern();
    let d = dispatcher(&host);
    let payload = json!({"bid": 1.5});
    d.dispatch("https://x.example.com/", Callback::None, Some(payload.clone()), Default::default());

    let sent = host.last_sent().unwrap();
    assert_eq!(sent.method, Method::Post);
    assert_ne!(sent.body, Body::Json(payload.to_string()));
    assert_eq!(sent.body, Body::Coerced("[object Object]".into()));
}

#[tokio::test]
async fn post_payload_is_json_for_legacy_engine_in_segment() {
    let host = ScriptedHost::new(HostProfile {
        modern: ModernSupport::Full,
        user_agent: "Mozilla/5.0 (Windows NT 6.1; Trident/7.0; rv:11.0) like Gecko".into(),
        segment: Some("8".into()),
    });
    let d = dispatcher(&host);
    d.dispatch("https://x.example.com/", Callback::None, Some(json!({"bid": 2})), Default::default());
    assert_eq!(host.last_sent().unwrap().body, Body::Json("{\"bid\":2}".into()));
}

#[tokio::test]
async fn modern_transport_gets_headers_and_credentials() {
    let host = ScriptedHost::modern();
    let d = dispatcher(&host);
    d.dispatch(
        "https://x.example.com/",
        Callback::None,
        None,
        RequestOptions::default()
            .with_credentials()
            .preflight()
            .header("X-Bidder", "mnet"),
    );
    let sent = host.last_sent().unwrap();
    assert_eq!(sent.kind, TransportKind::Modern);
    assert!(sent.with_credentials);
    assert_eq!(sent.header("X-Bidder"), Some("mnet"));
    assert_eq!(sent.header("X-Requested-With"), Some("XMLHttpRequest"));
    assert_eq!(sent.header("Content-Type"), Some("text/plain"));
}

#[tokio::test]
async fn explicit_content_type_wins() {
    let host = ScriptedHost::modern();
    let d = dispatcher(&host);
    d.dispatch(
        "https://x.example.com/",
        Callback::None,
        None,
        RequestOptions::default().content_type("application/json"),
    );
    let sent = host.last_sent().unwrap();
    assert_eq!(sent.header("Content-Type"), Some("application/json"));
    assert_eq!(sent.header("X-Requested-With"), None);
    assert!(!sent.with_credentials);
}

#[tokio::test]
async fn header_options_are_inert_on_legacy_transport() {
    let host = ScriptedHost::legacy();
    let d = dispatcher(&host);
    d.dispatch(
        "https://x.example.com/",
        Callback::None,
        None,
        RequestOptions::default()
            .with_credentials()
            .preflight()
            .header("X-Bidder", "mnet")
            .content_type("application/json"),
    );
    let sent = host.last_sent().unwrap();
    assert_eq!(sent.kind, TransportKind::Legacy);
    assert!(sent.headers.is_empty());
    assert!(!sent.with_credentials);
}

#[tokio::test]
async fn timeout_is_set_after_open() {
    for host in [ScriptedHost::modern(), ScriptedHost::legacy()] {
        let d = dispatcher(&host);
        d.dispatch("https://x.example.com/", Callback::None, None, Default::default());
        let sent = host.last_sent().unwrap();
        assert_eq!(sent.timeout, Some(Duration::from_millis(3_000)));
        assert!(!sent.timeout_before_open);
    }
}

// ── transport selection ─────────────────────────────────────────

#[tokio::test]
async fn selection_follows_host_capability() {
    let cases = [
        (ModernSupport::Full, TransportKind::Modern, (1, 0)),
        (ModernSupport::NoResponseType, TransportKind::Legacy, (1, 1)),
        (ModernSupport::Absent, TransportKind::Legacy, (0, 1)),
    ];
    for (modern, kind, built) in cases {
        let host = ScriptedHost::new(HostProfile {
            modern,
            ..HostProfile::default()
        });
        let d = dispatcher(&host);
        d.dispatch("https://x.example.com/", Callback::None, None, Default::default());
        assert_eq!(host.last_sent().unwrap().kind, kind, "{modern:?}");
        assert_eq!(host.built(), built, "{modern:?}");
    }
}

#[tokio::test]
async fn host_is_probed_on_every_dispatch() {
    let host = ScriptedHost::modern();
    let d = dispatcher(&host);
    for _ in 0..3 {
        d.dispatch("https://x.example.com/", Callback::None, None, Default::default());
    }
    assert_eq!(host.built(), (3, 0));
}

// ── completion routing ──────────────────────────────────────────

#[tokio::test]
async fn outcome_is_never_delivered_inside_dispatch() {
    let host = ScriptedHost::modern();
    let d = dispatcher(&host);
    let (cb, mut rx) = recorder();
    d.dispatch("https://x.example.com/", cb, None, Default::default());
    assert!(rx.try_recv().is_err());
    assert!(next(&mut rx).await.is_some());
}

#[tokio::test]
async fn status_200_succeeds_exactly_once() {
    for host in [ScriptedHost::modern(), ScriptedHost::legacy()] {
        host.push(Script::ok("{\"bids\":[]}"));
        let d = dispatcher(&host);
        let (cb, mut rx) = recorder();
        d.dispatch("https://x.example.com/", cb, None, Default::default());

        match next(&mut rx).await {
            Some(Outcome::Success { body, handle }) => {
                assert_eq!(body, "{\"bids\":[]}");
                assert_eq!(handle.response_text(), body);
                assert_eq!(handle.ready_state(), ReadyState::Done);
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert!(next(&mut rx).await.is_none(), "callbacks must fire once");
    }
}

#[tokio::test]
async fn status_500_fails_with_status_text() {
    let host = ScriptedHost::modern();
    host.push(Script::status(500, "Internal Server Error", "boom"));
    let d = dispatcher(&host);
    let (cb, mut rx) = recorder();
    d.dispatch("https://x.example.com/", cb, None, Default::default());

    match next(&mut rx).await {
        Some(Outcome::Error { reason, handle }) => {
            assert_eq!(reason, "Internal Server Error");
            assert_eq!(handle.status(), 500);
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert!(next(&mut rx).await.is_none());
}

#[tokio::test]
async fn status_304_counts_as_success() {
    let host = ScriptedHost::modern();
    host.push(Script::status(304, "Not Modified", ""));
    let d = dispatcher(&host);
    let (cb, mut rx) = recorder();
    d.dispatch("https://x.example.com/", cb, None, Default::default());
    assert!(matches!(next(&mut rx).await, Some(Outcome::Success { .. })));
}

#[tokio::test]
async fn legacy_failure_reports_literal_error() {
    let host = ScriptedHost::legacy();
    host.push(Script::status(500, "Internal Server Error", ""));
    host.push(Script::NetworkError);
    let d = dispatcher(&host);
    for _ in 0..2 {
        let (cb, mut rx) = recorder();
        d.dispatch("https://x.example.com/", cb, None, Default::default());
        match next(&mut rx).await {
            Some(Outcome::Error { reason, .. }) => assert_eq!(reason, "error"),
            other => panic!("expected error, got {other:?}"),
        }
    }
    assert!(d.pending().is_empty());
}

#[tokio::test]
async fn modern_network_failure_reports_empty_status_text() {
    let host = ScriptedHost::modern();
    host.push(Script::NetworkError);
    let d = dispatcher(&host);
    let (cb, mut rx) = recorder();
    d.dispatch("https://x.example.com/", cb, None, Default::default());
    match next(&mut rx).await {
        Some(Outcome::Error { reason, handle }) => {
            assert_eq!(reason, "");
            assert_eq!(handle.status(), 0);
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn modern_acts_only_on_done() {
    let host = ScriptedHost::modern();
    host.push(Script::Manual);
    let d = dispatcher(&host);
    let (cb, mut rx) = recorder();
    d.dispatch("https://x.example.com/", cb, None, Default::default());

    for ready_state in [ReadyState::Opened, ReadyState::HeadersReceived, ReadyState::Loading] {
        assert!(host.emit(
            0,
            TransportEvent::ReadyStateChange {
                ready_state,
                status: 200,
                status_text: "OK".into(),
                response_text: String::new(),
            }
        ));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err(), "{ready_state:?} must not complete");
    }
    host.emit(
        0,
        TransportEvent::ReadyStateChange {
            ready_state: ReadyState::Done,
            status: 200,
            status_text: "OK".into(),
            response_text: "done".into(),
        },
    );
    match next(&mut rx).await {
        Some(Outcome::Success { body, .. }) => assert_eq!(body, "done"),
        other => panic!("expected success, got {other:?}"),
    }
}

#[tokio::test]
async fn legacy_progress_is_not_a_completion() {
    let host = ScriptedHost::legacy();
    host.push(Script::Manual);
    let d = dispatcher(&host);
    let (cb, mut rx) = recorder();
    d.dispatch("https://x.example.com/", cb, None, Default::default());

    host.emit(0, TransportEvent::Progress);
    host.emit(0, TransportEvent::Progress);
    tokio::task::yield_now().await;
    assert!(rx.try_recv().is_err());
    assert_eq!(d.pending().len(), 1);

    host.emit(0, TransportEvent::Load { response_text: "ok".into() });
    assert!(matches!(next(&mut rx).await, Some(Outcome::Success { .. })));
    assert!(d.pending().is_empty());
}

#[tokio::test]
async fn legacy_timeout_fails_once_and_releases_once() {
    let host = ScriptedHost::legacy();
    host.push(Script::Manual);
    let d = dispatcher(&host);
    let (cb, mut rx) = recorder();
    d.dispatch("https://x.example.com/", cb, None, Default::default());
    assert_eq!(d.pending().len(), 1);

    assert!(host.emit(0, TransportEvent::Timeout));
    match next(&mut rx).await {
        Some(Outcome::Error { reason, handle }) => {
            assert_eq!(reason, "timeout");
            assert_eq!(handle.kind(), TransportKind::Legacy);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(next(&mut rx).await.is_none());

    // late events find nobody listening
    assert!(!host.emit(0, TransportEvent::Load { response_text: "late".into() }));
    assert!(!host.emit(0, TransportEvent::Error));
    assert!(d.pending().is_empty());
    assert_eq!(d.pending().releases(), 1);
}

#[tokio::test]
async fn modern_handles_lapse_without_explicit_release() {
    let host = ScriptedHost::modern();
    host.push(Script::Manual);
    let d = dispatcher(&host);
    let (cb, mut rx) = recorder();
    d.dispatch("https://x.example.com/", cb, None, Default::default());
    assert_eq!(d.pending().len(), 1);

    host.emit(
        0,
        TransportEvent::ReadyStateChange {
            ready_state: ReadyState::Done,
            status: 204,
            status_text: "No Content".into(),
            response_text: String::new(),
        },
    );
    let outcome = next(&mut rx).await.unwrap();
    // still reachable while the caller holds the handle
    assert_eq!(d.pending().len(), 1);
    drop(outcome);
    assert_eq!(d.pending().len(), 0);
    assert_eq!(d.pending().releases(), 0);
}

// ── callbacks ───────────────────────────────────────────────────

#[tokio::test]
async fn single_function_is_success_only() {
    let host = ScriptedHost::modern();
    host.push(Script::ok("yes"));
    host.push(Script::status(500, "Internal Server Error", ""));
    let d = dispatcher(&host);

    let (cb, mut rx) = success_recorder();
    d.dispatch("https://x.example.com/", cb, None, Default::default());
    match next(&mut rx).await {
        Some(Outcome::Success { body, .. }) => assert_eq!(body, "yes"),
        other => panic!("expected success, got {other:?}"),
    }

    // the error goes to the default logging handler, not the function
    let (cb, mut rx) = success_recorder();
    d.dispatch("https://x.example.com/", cb, None, Default::default());
    assert!(next(&mut rx).await.is_none());
}

#[tokio::test]
async fn default_handlers_need_no_callback() {
    let host = ScriptedHost::legacy();
    host.push(Script::Timeout);
    let d = dispatcher(&host);
    d.dispatch("https://x.example.com/", Callback::None, None, Default::default());
    assert_eq!(d.pending().len(), 1);
    for _ in 0..100 {
        if d.pending().is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(d.pending().is_empty());
    assert_eq!(d.pending().releases(), 1);
}

// ── timeout setting ─────────────────────────────────────────────

#[tokio::test]
async fn timeout_is_read_at_dispatch_time() {
    let host = ScriptedHost::modern();
    host.push(Script::Manual);
    host.push(Script::Manual);
    let timeout = TimeoutSetting::new(1_000);
    let d = Dispatcher::new(Arc::new(host.clone())).with_timeout(timeout.clone());

    let (first_cb, mut first) = recorder();
    d.dispatch("https://x.example.com/1", first_cb, None, Default::default());
    timeout.set(5_000);
    d.dispatch("https://x.example.com/2", Callback::None, None, Default::default());

    let sent = host.sent();
    assert_eq!(sent[0].timeout, Some(Duration::from_millis(1_000)));
    assert_eq!(sent[1].timeout, Some(Duration::from_millis(5_000)));

    host.emit(
        0,
        TransportEvent::ReadyStateChange {
            ready_state: ReadyState::Done,
            status: 200,
            status_text: "OK".into(),
            response_text: String::new(),
        },
    );
    let outcome = next(&mut first).await.unwrap();
    assert_eq!(outcome.handle().timeout(), Duration::from_millis(1_000));
}

// ── setup failures ──────────────────────────────────────────────

#[tokio::test]
async fn bad_address_is_logged_not_raised() {
    let host = ScriptedHost::modern();
    let d = dispatcher(&host);
    let (cb, mut rx) = recorder();
    d.dispatch("not an address", cb, None, Default::default());
    assert!(host.sent().is_empty());
    assert!(next(&mut rx).await.is_none());
}

#[tokio::test]
async fn transport_open_failure_reaches_error_handler() {
    let host = ScriptedHost::modern();
    host.push(Script::FailOpen);
    let d = dispatcher(&host);
    let (cb, mut rx) = recorder();
    d.dispatch("https://x.example.com/", cb, None, Default::default());
    // reported later, not from inside dispatch
    assert!(rx.try_recv().is_err());
    assert!(host.sent().is_empty());

    match next(&mut rx).await {
        Some(Outcome::Error { reason, handle }) => {
            assert_eq!(reason, "transport: open https://x.example.com/ refused");
            assert_eq!(handle.kind(), TransportKind::Modern);
            assert_eq!(handle.url(), "https://x.example.com/");
            assert_eq!(handle.status(), 0);
            assert_eq!(handle.ready_state(), ReadyState::Done);
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert!(next(&mut rx).await.is_none());
    assert!(d.pending().is_empty());
}

#[tokio::test]
async fn legacy_open_failure_reaches_error_handler() {
    let host = ScriptedHost::legacy();
    host.push(Script::FailOpen);
    let d = dispatcher(&host);
    let (cb, mut rx) = recorder();
    d.dispatch("https://x.example.com/", cb, Some(json!("k=v")), Default::default());

    let outcome = next(&mut rx).await.unwrap();
    assert!(matches!(&outcome, Outcome::Error { .. }));
    assert_eq!(outcome.handle().kind(), TransportKind::Legacy);
    assert_eq!(outcome.handle().method(), Method::Post);
    assert_eq!(d.pending().releases(), 0);
}

#[tokio::test]
async fn invalid_header_reaches_error_handler() {
    let host = ScriptedHost::modern();
    let d = dispatcher(&host);
    let (cb, mut rx) = recorder();
    d.dispatch(
        "https://x.example.com/",
        cb,
        None,
        RequestOptions::default().header("", "x"),
    );
    assert!(host.sent().is_empty());
    match next(&mut rx).await {
        Some(Outcome::Error { reason, handle }) => {
            assert_eq!(reason, "header: invalid header ''");
            // open already ran, so the timeout was read
            assert_eq!(handle.timeout(), Duration::from_millis(3_000));
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn setup_failure_with_default_handlers_is_only_logged() {
    let host = ScriptedHost::modern();
    host.push(Script::FailOpen);
    let d = dispatcher(&host);
    d.dispatch("https://x.example.com/", Callback::None, None, Default::default());
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(host.sent().is_empty());
    assert!(d.pending().is_empty());
}

#[test]
fn dispatch_outside_a_runtime_is_logged_not_raised() {
    let host = ScriptedHost::modern();
    let d = dispatcher(&host);
    let (cb, mut rx) = recorder();
    d.dispatch("https://x.example.com/", cb, None, Default::default());
    assert!(host.sent().is_empty());
    assert!(rx.try_recv().is_err());
}
