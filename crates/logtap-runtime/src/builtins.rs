//! The `logd` builtin module exposed to sandboxed scripts.
//!
//! Builtins that reach sandbox state capture a weak handle to it; argument
//! and configuration violations are raised through the engine's error
//! mechanism so scripts see them (and may trap them in protected mode).
//! Builtins whose failures are part of normal script flow (`http_get`,
//! `kafka_offset`) return an object map with an `err` field instead of
//! raising.

use std::sync::{Arc, Weak};

use rhai::{Dynamic, EvalAltResult, ImmutableString, Map, Module};
use tracing::debug;

use crate::config::{
    AVAILABLE_CONFIG_KEYS, CONFIG_HTTP_CHANNEL_BUFFER, CONFIG_HTTP_CONCURRENCY,
    CONFIG_HTTP_TIMEOUT, CONFIG_KAFKA_PREFIX, CONFIG_PROTECTED, CONFIG_TICK,
};
use crate::handle::RecordHandle;
use crate::kafka::{KafkaMessage, KafkaOffset};
use crate::sandbox::{self, lock_mutex, Inner};

type BuiltinResult<T> = Result<T, Box<EvalAltResult>>;

/// Build the `logd` module. `inner` is the capability handle builtins use
/// to reach the sandbox's collaborators; it is invalidated when the
/// sandbox goes away.
pub(crate) fn logd_module(inner: Weak<Inner>) -> Module {
    let mut module = Module::new();

    /* record manipulation */

    module.set_native_fn(
        "log_get",
        |record: RecordHandle, key: ImmutableString| -> BuiltinResult<ImmutableString> {
            Ok(record.lock().get(&key).unwrap_or_default().into())
        },
    );

    module.set_native_fn(
        "log_set",
        |record: RecordHandle,
         key: ImmutableString,
         value: ImmutableString|
         -> BuiltinResult<bool> {
            record
                .lock()
                .checked_set(&key, &value)
                .map_err(|e| e.to_string().into())
        },
    );

    module.set_native_fn(
        "log_remove",
        |record: RecordHandle, key: ImmutableString| -> BuiltinResult<bool> {
            Ok(record.lock().remove(&key))
        },
    );

    module.set_native_fn("log_reset", |record: RecordHandle| -> BuiltinResult<()> {
        record.lock().reset();
        Ok(())
    });

    module.set_native_fn(
        "log_string",
        |record: RecordHandle| -> BuiltinResult<ImmutableString> {
            Ok(record.lock().to_text_string().into())
        },
    );

    module.set_native_fn(
        "log_json",
        |record: RecordHandle| -> BuiltinResult<ImmutableString> {
            Ok(record.lock().to_json_string().into())
        },
    );

    /* http */

    let weak = inner.clone();
    module.set_native_fn(
        "http_get",
        move |url: ImmutableString| -> BuiltinResult<Map> {
            let inner = upgrade(&weak)?;
            Ok(http_get_impl(&inner, &url, None))
        },
    );

    let weak = inner.clone();
    module.set_native_fn(
        "http_get",
        move |url: ImmutableString, headers: Map| -> BuiltinResult<Map> {
            let inner = upgrade(&weak)?;
            Ok(http_get_impl(&inner, &url, Some(&headers)))
        },
    );

    let weak = inner.clone();
    module.set_native_fn(
        "http_post",
        move |url: ImmutableString,
              body: ImmutableString,
              content_type: ImmutableString|
              -> BuiltinResult<()> {
            let inner = upgrade(&weak)?;
            http_post_impl(&inner, &url, &body, &content_type, -1)
        },
    );

    let weak = inner.clone();
    module.set_native_fn(
        "http_post",
        move |url: ImmutableString,
              body: ImmutableString,
              content_type: ImmutableString,
              affinity: i64|
              -> BuiltinResult<()> {
            let inner = upgrade(&weak)?;
            http_post_impl(&inner, &url, &body, &content_type, affinity)
        },
    );

    /* kafka */

    module.set_native_fn(
        "kafka_offset",
        |name: ImmutableString| -> BuiltinResult<Map> {
            let mut out = Map::new();
            match KafkaOffset::parse(&name) {
                Ok(offset) => {
                    out.insert("offset".into(), Dynamic::from(offset));
                    out.insert("err".into(), Dynamic::UNIT);
                }
                Err(e) => {
                    out.insert("offset".into(), Dynamic::UNIT);
                    out.insert("err".into(), e.into());
                }
            }
            Ok(out)
        },
    );

    module.set_native_fn(
        "kafka_message",
        |key: ImmutableString,
         value: ImmutableString,
         topic: ImmutableString,
         partition: i64,
         offset: KafkaOffset|
         -> BuiltinResult<KafkaMessage> {
            let partition = i32::try_from(partition).map_err(|_| {
                Box::<EvalAltResult>::from(format!(
                    "partition out of range in call to builtin 'kafka_message': {partition}"
                ))
            })?;
            Ok(KafkaMessage {
                key: key.into(),
                value: value.into(),
                topic: topic.into(),
                partition,
                offset: offset.raw(),
            })
        },
    );

    let weak = inner.clone();
    module.set_native_fn(
        "kafka_produce",
        move |message: KafkaMessage| -> BuiltinResult<()> {
            let inner = upgrade(&weak)?;
            sandbox::ensure_kafka(&inner).map_err(script_err)?;
            let slot = lock_mutex(&inner.kafka, "kafka").map_err(script_err)?;
            let producer = slot
                .as_ref()
                .ok_or_else(|| Box::<EvalAltResult>::from("kafka producer not initialized"))?;
            producer.produce(&message).map_err(script_err)
        },
    );

    /* configuration */

    let weak = inner.clone();
    module.set_native_fn(
        "config_set",
        move |key: ImmutableString, value: Dynamic| -> BuiltinResult<()> {
            let inner = upgrade(&weak)?;
            apply_config(&inner, &key, &value)
        },
    );

    /* diagnostics */

    module.set_native_fn("debug", |message: ImmutableString| -> BuiltinResult<()> {
        debug!(target: "script", "{message}");
        Ok(())
    });

    module.set_native_fn("debug", |fields: Map| -> BuiltinResult<()> {
        let rendered = fields
            .iter()
            .map(|(k, v)| format!("{k}: {}", display_dynamic(v)))
            .collect::<Vec<_>>()
            .join(", ");
        debug!(target: "script", "{rendered}");
        Ok(())
    });

    module
}

fn upgrade(weak: &Weak<Inner>) -> BuiltinResult<Arc<Inner>> {
    weak.upgrade()
        .ok_or_else(|| "sandbox is closed".into())
}

fn script_err(e: crate::error::SandboxError) -> Box<EvalAltResult> {
    e.to_string().into()
}

fn display_dynamic(value: &Dynamic) -> String {
    if value.is_string() {
        value
            .clone()
            .into_immutable_string()
            .map(|s| s.to_string())
            .unwrap_or_default()
    } else {
        value.to_string()
    }
}

fn int_arg(value: &Dynamic, context: &str) -> BuiltinResult<i64> {
    value.as_int().map_err(|found| {
        Box::<EvalAltResult>::from(format!(
            "argument must be an integer in call to builtin '{context}': found {found}"
        ))
    })
}

fn http_get_impl(inner: &Arc<Inner>, url: &str, headers: Option<&Map>) -> Map {
    let mut out = Map::new();
    match try_http_get(inner, url, headers) {
        Ok(body) => {
            out.insert("body".into(), body.into());
            out.insert("err".into(), Dynamic::UNIT);
        }
        Err(error) => {
            out.insert("body".into(), Dynamic::UNIT);
            out.insert("err".into(), error.into());
        }
    }
    out
}

fn try_http_get(inner: &Arc<Inner>, url: &str, headers: Option<&Map>) -> Result<String, String> {
    let client = sandbox::blocking_http_client(inner).map_err(|e| e.to_string())?;

    let mut request = client.get(url);
    if let Some(headers) = headers {
        for (key, value) in headers {
            request = request.header(key.as_str(), display_dynamic(value));
        }
    }

    let response = request.send().map_err(|e| e.to_string())?;
    let status = response.status();
    let body = response.text().map_err(|e| e.to_string())?;
    if !status.is_success() {
        return Err(format!("request to '{url}' status: {status}"));
    }
    Ok(body)
}

fn http_post_impl(
    inner: &Arc<Inner>,
    url: &str,
    body: &str,
    content_type: &str,
    affinity: i64,
) -> BuiltinResult<()> {
    sandbox::ensure_http(inner).map_err(script_err)?;
    let slot = lock_mutex(&inner.http, "http").map_err(script_err)?;
    let client = slot
        .as_ref()
        .ok_or_else(|| Box::<EvalAltResult>::from("http client not initialized"))?;
    client
        .post(url, body, content_type, affinity)
        .map_err(|e| e.to_string().into())
}

fn apply_config(inner: &Arc<Inner>, key: &str, value: &Dynamic) -> BuiltinResult<()> {
    match key {
        CONFIG_TICK => {
            let tick = int_arg(value, "config_set#tick")?;
            if tick < 0 {
                return Err("tick must be non-negative".into());
            }
            sandbox::set_tick(inner, tick as u64).map_err(script_err)
        }
        CONFIG_PROTECTED => {
            let enabled = value.as_bool().map_err(|found| {
                Box::<EvalAltResult>::from(format!(
                    "argument must be a bool in call to builtin 'config_set#protected': found {found}"
                ))
            })?;
            sandbox::set_protected(inner, enabled).map_err(script_err)
        }
        CONFIG_HTTP_CONCURRENCY => {
            let concurrency = int_arg(value, "config_set#http.concurrency")?;
            if concurrency < 1 {
                return Err("min http concurrency is 1".into());
            }
            lock_mutex(&inner.config, "config")
                .map_err(script_err)?
                .http
                .concurrency = concurrency as usize;
            sandbox::reinit_http(inner).map_err(script_err)
        }
        CONFIG_HTTP_CHANNEL_BUFFER => {
            let buffer = int_arg(value, "config_set#http.channel_buffer")?;
            if buffer < 1 {
                return Err("min http channel buffer is 1".into());
            }
            lock_mutex(&inner.config, "config")
                .map_err(script_err)?
                .http
                .channel_buffer = buffer as usize;
            sandbox::reinit_http(inner).map_err(script_err)
        }
        CONFIG_HTTP_TIMEOUT => {
            let raw = value.clone().into_immutable_string().map_err(|found| {
                Box::<EvalAltResult>::from(format!(
                    "argument must be a duration string in call to builtin 'config_set#http.timeout': found {found}"
                ))
            })?;
            let timeout = humantime::parse_duration(&raw)
                .map_err(|e| Box::<EvalAltResult>::from(format!("invalid duration '{raw}': {e}")))?;
            lock_mutex(&inner.config, "config")
                .map_err(script_err)?
                .http
                .timeout = timeout;
            sandbox::reinit_http(inner).map_err(script_err)
        }
        _ => {
            if let Some(kafka_key) = key.strip_prefix(CONFIG_KAFKA_PREFIX) {
                if kafka_key.is_empty() {
                    return Err("empty kafka config key".into());
                }
                let rendered = config_value(value, key)?;
                lock_mutex(&inner.config, "config")
                    .map_err(script_err)?
                    .kafka
                    .insert(kafka_key.to_owned(), rendered);
                return Ok(());
            }
            Err(format!(
                "unknown config key in call to 'config_set': '{key}'. Available keys: {AVAILABLE_CONFIG_KEYS}"
            )
            .into())
        }
    }
}

// librdkafka takes every value as a string; scripts may pass strings,
// integers, booleans or floats
fn config_value(value: &Dynamic, key: &str) -> BuiltinResult<String> {
    if value.is_string() {
        return Ok(display_dynamic(value));
    }
    if value.is_int() || value.is_bool() || value.is_float() {
        return Ok(value.to_string());
    }
    Err(format!(
        "unsupported value type '{}' for config key '{key}' (expected string, int, bool or float)",
        value.type_name()
    )
    .into())
}
