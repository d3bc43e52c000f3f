//! Request classification for the storage endpoint.
//!
//! Precedence is fixed: diagnostic, then the unconfigured guard, then the
//! HTTP method, then what the POST body asks for.

use axum::http::Method;
use serde_json::{Map, Value};
use url::Url;

/// What a storage request asks for, decided once before dispatch
#[derive(Debug, Clone, PartialEq)]
pub enum RequestIntent {
    /// `?diag=1`: report configuration flags without touching the database
    Diagnostic,
    /// No database variables are present
    Unconfigured,
    /// GET: return the saved state
    Load,
    /// POST with a truthy `ping`: write-then-read consistency probe
    Ping,
    /// POST otherwise: replace the saved state
    Save(Value),
    /// Anything other than GET or POST
    MethodNotAllowed,
}

impl RequestIntent {
    /// Classify a request. `target` is the raw request target (path and query).
    pub fn classify(method: &Method, target: &str, configured: bool, body: &[u8]) -> Self {
        if is_diagnostic(target) {
            return RequestIntent::Diagnostic;
        }

        if !configured {
            return RequestIntent::Unconfigured;
        }

        match *method {
            Method::GET => RequestIntent::Load,
            Method::POST => {
                let body = parse_body(body);
                if is_truthy(body.get("ping")) {
                    RequestIntent::Ping
                } else {
                    RequestIntent::Save(extract_kv(body))
                }
            }
            _ => RequestIntent::MethodNotAllowed,
        }
    }

    /// Whether classification will look at the body; only a configured POST does
    pub fn needs_body(method: &Method, target: &str, configured: bool) -> bool {
        *method == Method::POST && configured && !is_diagnostic(target)
    }

    /// Metric/log label
    pub fn label(&self) -> &'static str {
        match self {
            RequestIntent::Diagnostic => "diagnostic",
            RequestIntent::Unconfigured => "unconfigured",
            RequestIntent::Load => "load",
            RequestIntent::Ping => "ping",
            RequestIntent::Save(_) => "save",
            RequestIntent::MethodNotAllowed => "method_not_allowed",
        }
    }
}

/// True when the query carries `diag=1` or `diag=true`.
///
/// Targets that do not parse fall back to a plain substring check.
pub fn is_diagnostic(target: &str) -> bool {
    let parsed = Url::parse(target)
        .or_else(|_| Url::parse("http://localhost").and_then(|base| base.join(target)));

    match parsed {
        Ok(url) => url
            .query_pairs()
            .any(|(key, value)| key == "diag" && (value == "1" || value == "true")),
        Err(_) => target.contains("diag=1"),
    }
}

/// Decode a request body into a JSON object.
///
/// Accepts an object, or a JSON string that itself holds an object. Anything
/// else, including malformed JSON, yields an empty object.
pub fn parse_body(body: &[u8]) -> Value {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(Value::String(inner)) => match serde_json::from_str::<Value>(&inner) {
            Ok(Value::Object(map)) => Value::Object(map),
            _ => empty_object(),
        },
        _ => empty_object(),
    }
}

/// `body.kv` when it is an object, otherwise `{}`
pub fn extract_kv(body: Value) -> Value {
    match body {
        Value::Object(mut map) => match map.remove("kv") {
            Some(kv @ Value::Object(_)) => kv,
            _ => empty_object(),
        },
        _ => empty_object(),
    }
}

/// JavaScript truthiness, so clients may send `ping: 1` or `ping: "yes"`
pub fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map_or(true, |f| f != 0.0 && !f.is_nan()),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

pub fn empty_object() -> Value {
    Value::Object(Map::new())
}
