//! Sandbox integration tests with real scripts.
//!
//! Scripts are written into a temp directory and loaded through the full
//! `init` path; HTTP-facing hooks are exercised against a local TCP server
//! that answers 204 or 500 by path and counts what it sees.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use logtap_runtime::{RecordHandle, Sandbox, SandboxError};
use logtap_types::Record;

struct ScriptDir {
    dir: TempDir,
}

impl ScriptDir {
    fn new() -> Self {
        Self {
            dir: TempDir::new().expect("create temp dir"),
        }
    }

    fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).expect("write script");
        path
    }
}

struct Hits {
    ok: AtomicUsize,
    fail: AtomicUsize,
}

/// Minimal HTTP responder: 500 for paths containing `fail`, 204 otherwise.
async fn spawn_server() -> (SocketAddr, Arc<Hits>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let hits = Arc::new(Hits {
        ok: AtomicUsize::new(0),
        fail: AtomicUsize::new(0),
    });

    let counters = Arc::clone(&hits);
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let counters = Arc::clone(&counters);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let head = String::from_utf8_lossy(&buf[..n]);
                let failing = head.lines().next().is_some_and(|l| l.contains("fail"));
                let response = if failing {
                    counters.fail.fetch_add(1, Ordering::SeqCst);
                    "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                } else {
                    counters.ok.fetch_add(1, Ordering::SeqCst);
                    "HTTP/1.1 204 No Content\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                };
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, hits)
}

async fn wait_for(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    tokio::task::spawn_blocking(f).await.expect("blocking task")
}

#[tokio::test(flavor = "multi_thread")]
async fn on_log_mutates_the_record() {
    let scripts = ScriptDir::new();
    let script = scripts.write(
        "mutate.rhai",
        r#"
fn on_log(rec) {
    logd::log_set(rec, "seen", "yes");
    logd::log_set(rec, "level", "WARN");
    logd::log_remove(rec, "drop_me");
}
"#,
    );

    let sandbox = Sandbox::new();
    let sb = sandbox.clone();
    blocking(move || sb.init(&script)).await.expect("init");

    let mut record = Record::new();
    record.set("drop_me", "1");
    record.set("keep", "2");
    let handle = RecordHandle::new(record);

    let sb = sandbox.clone();
    let h = handle.clone();
    blocking(move || sb.call_on_log(&h)).await.expect("on_log");

    let record = handle.into_record();
    assert_eq!(record.get("seen"), Some("yes".to_owned()));
    assert_eq!(record.level(), "WARN");
    assert_eq!(record.get("drop_me"), None);
    assert_eq!(record.get("keep"), Some("2".to_owned()));

    blocking(move || sandbox.close()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn serializers_are_reachable_from_scripts() {
    let scripts = ScriptDir::new();
    let script = scripts.write(
        "serialize.rhai",
        r#"
fn on_log(rec) {
    let text = logd::log_string(rec);
    let json = logd::log_json(rec);
    logd::log_set(rec, "text", text);
    logd::log_set(rec, "json", json);
}
"#,
    );

    let sandbox = Sandbox::new();
    let sb = sandbox.clone();
    blocking(move || sb.init(&script)).await.expect("init");

    let mut record = Record::new();
    record.set("timestamp", "2017-09-07 14:54:39,474");
    record.set("level", "INFO");
    let handle = RecordHandle::new(record);

    let sb = sandbox.clone();
    let h = handle.clone();
    blocking(move || sb.call_on_log(&h)).await.expect("on_log");

    let record = handle.into_record();
    assert_eq!(
        record.get("text"),
        Some("2017-09-07 14:54:39,474\tINFO\t[-]\t-".to_owned())
    );
    assert_eq!(
        record.get("json"),
        Some(
            "{\"timestamp\":\"2017-09-07 14:54:39,474\",\"level\":\"INFO\",\"thread\":\"\",\"class\":\"\"}"
                .to_owned()
        )
    );

    blocking(move || sandbox.close()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_on_log_is_reported() {
    let scripts = ScriptDir::new();
    let script = scripts.write("empty.rhai", "let loaded = true;");

    let sandbox = Sandbox::new();
    let sb = sandbox.clone();
    blocking(move || sb.init(&script)).await.expect("init");

    let handle = RecordHandle::default();
    let sb = sandbox.clone();
    let err = blocking(move || sb.call_on_log(&handle)).await.unwrap_err();
    assert!(matches!(err, SandboxError::HookNotDefined("on_log")));

    blocking(move || sandbox.close()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn protected_mode_routes_errors_to_on_error() {
    let scripts = ScriptDir::new();
    let script = scripts.write(
        "protected.rhai",
        r#"
logd::config_set("protected", true);

fn on_log(rec) {
    throw "boom";
}

fn on_error(rec, err) {
    logd::log_set(rec, "processed", "true");
    logd::log_set(rec, "cause", err);
}
"#,
    );

    let sandbox = Sandbox::new();
    let sb = sandbox.clone();
    blocking(move || sb.init(&script)).await.expect("init");
    assert!(sandbox.protected_mode());

    let handle = RecordHandle::default();
    let sb = sandbox.clone();
    let h = handle.clone();
    blocking(move || sb.protected_call_on_log(&h))
        .await
        .expect("protected call must swallow script errors");

    let record = handle.into_record();
    assert_eq!(record.get("processed"), Some("true".to_owned()));
    let cause = record.get("cause").expect("on_error got the message");
    assert!(cause.contains("on_log"), "unexpected cause: {cause}");

    blocking(move || sandbox.close()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unprotected_errors_surface() {
    let scripts = ScriptDir::new();
    let script = scripts.write(
        "raising.rhai",
        r#"
fn on_log(rec) {
    throw "boom";
}
"#,
    );

    let sandbox = Sandbox::new();
    let sb = sandbox.clone();
    blocking(move || sb.init(&script)).await.expect("init");

    let handle = RecordHandle::default();
    let sb = sandbox.clone();
    let err = blocking(move || sb.call_on_log(&handle)).await.unwrap_err();
    assert!(matches!(err, SandboxError::Script { hook: "on_log", .. }));

    blocking(move || sandbox.close()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn protected_without_on_error_fails_at_load() {
    let scripts = ScriptDir::new();
    let script = scripts.write(
        "bad_protected.rhai",
        r#"
logd::config_set("protected", true);

fn on_log(rec) { }
"#,
    );

    let sandbox = Sandbox::new();
    let err = blocking(move || sandbox.init(&script)).await.unwrap_err();
    assert!(matches!(err, SandboxError::Load { .. }), "got {err:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_config_keys_fail_at_load() {
    let scripts = ScriptDir::new();
    let script = scripts.write("bad_key.rhai", r#"logd::config_set("bogus", 1);"#);

    let sandbox = Sandbox::new();
    let err = blocking(move || sandbox.init(&script)).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("unknown config key"), "got: {message}");
}

#[tokio::test(flavor = "multi_thread")]
async fn kafka_config_keys_land_in_the_producer_map() {
    let scripts = ScriptDir::new();
    let script = scripts.write(
        "kafka_cfg.rhai",
        r#"
logd::config_set("kafka.bootstrap.servers", "localhost:9092");
logd::config_set("kafka.message.timeout.ms", 30000);
"#,
    );

    let sandbox = Sandbox::new();
    let sb = sandbox.clone();
    blocking(move || sb.init(&script)).await.expect("init");

    let config = sandbox.config();
    assert_eq!(
        config.kafka.get("bootstrap.servers").map(String::as_str),
        Some("localhost:9092")
    );
    // script override beats the seeded default
    assert_eq!(
        config.kafka.get("message.timeout.ms").map(String::as_str),
        Some("30000")
    );
    // untouched defaults survive
    assert_eq!(
        config.kafka.get("request.required.acks").map(String::as_str),
        Some("1")
    );

    blocking(move || sandbox.close()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn kafka_offsets_parse_in_scripts() {
    let scripts = ScriptDir::new();
    let script = scripts.write(
        "offsets.rhai",
        r#"
fn on_log(rec) {
    let good = logd::kafka_offset("beginning");
    if good.err != () { throw "beginning must parse"; }
    let msg = logd::kafka_message("k", "v", "topic", -1, good.offset);
    logd::log_set(rec, "topic", msg.topic);
    logd::log_set(rec, "offset", msg.offset.to_string());

    let bad = logd::kafka_offset("garbage");
    if bad.err == () { throw "garbage must not parse"; }
}
"#,
    );

    let sandbox = Sandbox::new();
    let sb = sandbox.clone();
    blocking(move || sb.init(&script)).await.expect("init");

    let handle = RecordHandle::default();
    let sb = sandbox.clone();
    let h = handle.clone();
    blocking(move || sb.call_on_log(&h)).await.expect("on_log");

    let record = handle.into_record();
    assert_eq!(record.get("topic"), Some("topic".to_owned()));
    assert_eq!(record.get("offset"), Some("-2".to_owned()));

    blocking(move || sandbox.close()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn http_get_returns_body_and_error() {
    let (addr, _hits) = spawn_server().await;
    let scripts = ScriptDir::new();
    let script = scripts.write(
        "get.rhai",
        &format!(
            r#"
fn on_log(rec) {{
    let ok = logd::http_get("http://{addr}/data");
    logd::log_set(rec, "ok", if ok.err == () {{ "yes" }} else {{ "no" }});
    let bad = logd::http_get("http://{addr}/fail");
    logd::log_set(rec, "bad", if bad.err == () {{ "no-error" }} else {{ bad.err }});
}}
"#
        ),
    );

    let sandbox = Sandbox::new();
    let sb = sandbox.clone();
    blocking(move || sb.init(&script)).await.expect("init");

    let handle = RecordHandle::default();
    let sb = sandbox.clone();
    let h = handle.clone();
    blocking(move || sb.call_on_log(&h)).await.expect("on_log");

    let record = handle.into_record();
    assert_eq!(record.get("ok"), Some("yes".to_owned()));
    let bad = record.get("bad").expect("error string recorded");
    assert!(bad.contains("500"), "unexpected error: {bad}");

    blocking(move || sandbox.close()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn http_errors_reach_the_error_hook() {
    let (addr, hits) = spawn_server().await;
    let scripts = ScriptDir::new();
    let script = scripts.write(
        "http_err.rhai",
        &format!(
            r#"
fn on_log(rec) {{
    logd::http_post("http://{addr}/fail", logd::log_string(rec), "text/plain");
}}

fn on_http_error(url, method, err) {{
    logd::http_post("http://{addr}/from-error-hook", err, "text/plain", 0);
}}
"#
        ),
    );

    let sandbox = Sandbox::new();
    let sb = sandbox.clone();
    blocking(move || sb.init(&script)).await.expect("init");

    let handle = RecordHandle::default();
    let sb = sandbox.clone();
    blocking(move || sb.call_on_log(&handle)).await.expect("on_log");

    // failed post -> error channel -> on_http_error -> second post
    let seen = wait_for(Duration::from_secs(10), || {
        hits.ok.load(Ordering::SeqCst) >= 1
    })
    .await;
    assert!(seen, "on_http_error never fired");
    assert!(hits.fail.load(Ordering::SeqCst) >= 1);

    blocking(move || sandbox.close()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn ticker_fires_and_stops_on_close() {
    let (addr, hits) = spawn_server().await;
    let scripts = ScriptDir::new();
    let script = scripts.write(
        "tick.rhai",
        &format!(
            r#"
logd::config_set("tick", 25);

fn on_tick() {{
    logd::http_post("http://{addr}/tick", "", "text/plain");
}}
"#
        ),
    );

    let sandbox = Sandbox::new();
    let sb = sandbox.clone();
    blocking(move || sb.init(&script)).await.expect("init");
    assert_eq!(sandbox.config().tick_ms, 25);

    let fired = wait_for(Duration::from_secs(10), || {
        hits.ok.load(Ordering::SeqCst) >= 2
    })
    .await;
    assert!(fired, "ticker never fired");

    let sb = sandbox.clone();
    blocking(move || sb.close()).await;

    let after_close = hits.ok.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    // allow one in-flight tick to land, but the ticker must be gone
    assert!(
        hits.ok.load(Ordering::SeqCst) <= after_close + 1,
        "ticker kept firing after close"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn reload_replaces_the_script() {
    let scripts = ScriptDir::new();
    let first = scripts.write(
        "first.rhai",
        r#"
fn on_log(rec) {
    logd::log_set(rec, "version", "first");
}
"#,
    );
    let second = scripts.write(
        "second.rhai",
        r#"
fn on_log(rec) {
    logd::log_set(rec, "version", "second");
}
"#,
    );

    let sandbox = Sandbox::new();
    let sb = sandbox.clone();
    blocking(move || sb.init(&first)).await.expect("first init");

    let sb = sandbox.clone();
    blocking(move || sb.init(&second)).await.expect("reload");

    let handle = RecordHandle::default();
    let sb = sandbox.clone();
    let h = handle.clone();
    blocking(move || sb.call_on_log(&h)).await.expect("on_log");
    assert_eq!(
        handle.into_record().get("version"),
        Some("second".to_owned())
    );

    blocking(move || sandbox.close()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn flush_is_safe_at_any_point() {
    let scripts = ScriptDir::new();
    let script = scripts.write("noop.rhai", "fn on_log(rec) { }");

    let sandbox = Sandbox::new();
    // flushing an uninitialized sandbox is a no-op
    let sb = sandbox.clone();
    blocking(move || sb.flush()).await;

    let sb = sandbox.clone();
    blocking(move || sb.init(&script)).await.expect("init");

    let sb = sandbox.clone();
    blocking(move || {
        sb.flush();
        sb.flush();
    })
    .await;

    blocking(move || sandbox.close()).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn close_marks_the_sandbox_uninitialized() {
    let scripts = ScriptDir::new();
    let script = scripts.write("noop.rhai", "fn on_log(rec) { }");

    let sandbox = Sandbox::new();
    let sb = sandbox.clone();
    blocking(move || sb.init(&script)).await.expect("init");
    assert!(sandbox.is_initialized());

    let sb = sandbox.clone();
    blocking(move || sb.close()).await;
    assert!(!sandbox.is_initialized());

    let handle = RecordHandle::default();
    let sb = sandbox.clone();
    let err = blocking(move || sb.call_on_log(&handle)).await.unwrap_err();
    assert!(matches!(err, SandboxError::Uninitialized));
}

#[tokio::test(flavor = "multi_thread")]
async fn script_relative_imports_resolve() {
    let scripts = ScriptDir::new();
    scripts.write(
        "helper.rhai",
        r#"
fn tag() { "from-helper" }
"#,
    );
    let script = scripts.write(
        "importer.rhai",
        r#"
import "helper" as helper;

fn on_log(rec) {
    logd::log_set(rec, "tag", helper::tag());
}
"#,
    );

    let sandbox = Sandbox::new();
    let sb = sandbox.clone();
    blocking(move || sb.init(&script)).await.expect("init");

    let handle = RecordHandle::default();
    let sb = sandbox.clone();
    let h = handle.clone();
    blocking(move || sb.call_on_log(&h)).await.expect("on_log");
    assert_eq!(
        handle.into_record().get("tag"),
        Some("from-helper".to_owned())
    );

    blocking(move || sandbox.close()).await;
}
