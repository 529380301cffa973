//! JSON response bodies and the translators that build them.
//!
//! The server never formats bodies itself. Ordinary handlers wrap their payload through the
//! active `ResponseTranslator`, the dispatcher builds 404/500 bodies through it, and the SSE
//! handshake asks the `RequestTranslator` which subjects a subscriber wants.
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::error::Error as StdError;

pub const STATUS_OK: &str = "ok";
pub const STATUS_ERROR: &str = "error";

/// Query/body parameter holding a subscriber's comma-separated subjects.
pub const SUBJECTS_PARAM: &str = "subjects";

const ALL_SUBJECTS: &str = "*";

#[derive(Debug, Serialize)]
pub struct ErrorBody<'a> {
    pub status: &'static str,
    pub error: &'a str,
    pub code: u16,
    pub method: &'a str,
    pub uri: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OkBody {
    pub status: &'static str,
    pub payload: Value,
}

pub trait ResponseTranslator: Send + Sync {
    fn make_error(
        &self,
        code: u16,
        message: &str,
        method: &str,
        uri: &str,
        cause: Option<&(dyn StdError + 'static)>,
    ) -> Value {
        let body = ErrorBody {
            status: STATUS_ERROR,
            error: message,
            code,
            method,
            uri,
            trace: cause.map(build_exception_trace),
        };
        serde_json::to_value(body).unwrap_or(Value::Null)
    }

    fn make_response(&self, payload: Value) -> Value {
        serde_json::to_value(OkBody {
            status: STATUS_OK,
            payload,
        })
        .unwrap_or(Value::Null)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultResponseTranslator;

impl ResponseTranslator for DefaultResponseTranslator {}

/// Formats `error` and its `source()` chain, one line per error.
pub fn build_exception_trace(error: &(dyn StdError + 'static)) -> String {
    let mut trace = format!("Exception: {error}");
    let mut source = error.source();
    while let Some(cause) = source {
        trace.push_str(&format!("\nCaused by: {cause}"));
        source = cause.source();
    }
    trace
}

pub trait RequestTranslator: Send + Sync {
    /// Subjects an SSE subscriber asked for. An empty set means every subject.
    fn sse_subjects(&self, params: &HashMap<String, String>) -> HashSet<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRequestTranslator;

impl RequestTranslator for DefaultRequestTranslator {
    fn sse_subjects(&self, params: &HashMap<String, String>) -> HashSet<String> {
        let Some(subjects) = params.get(SUBJECTS_PARAM) else {
            return HashSet::new();
        };
        let subjects: HashSet<String> = subjects
            .split(',')
            .map(str::trim)
            .filter(|subject| !subject.is_empty())
            .map(str::to_string)
            .collect();
        if subjects.contains(ALL_SUBJECTS) {
            HashSet::new()
        } else {
            subjects
        }
    }
}
