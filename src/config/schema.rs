//! Declarative schema for the configuration document.
//!
//! Checks presence, type and range of every known key, and flags keys the
//! schema does not know about. Cross-field constraints run on the same raw
//! document, so one pass reports type errors and constraint errors together.

use std::path::Path;

use toml::{Table, Value};

use crate::error::Violations;

#[derive(Debug, Clone, Copy)]
enum Kind {
    Integer { min: i64, max: i64 },
    Float { min: f64, max: f64 },
    Text,
    Bool,
    TextList,
    OneOf(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    path: &'static str,
    kind: Kind,
    required: bool,
}

const fn field(path: &'static str, kind: Kind, required: bool) -> FieldSpec {
    FieldSpec {
        path,
        kind,
        required,
    }
}

const SECTIONS: &[(&str, bool)] = &[
    ("watch", true),
    ("workers", true),
    ("rate", true),
    ("retry", true),
    ("checkpoint", false),
    ("recognizer", true),
    ("endpoints", false),
    ("status", false),
];

const HOUR_MS: i64 = 3_600_000;

const SCHEMA: &[FieldSpec] = &[
    field("watch.root", Kind::Text, true),
    field("watch.extensions", Kind::TextList, false),
    field("watch.fingerprint", Kind::OneOf(&["content", "mtime"]), false),
    field("watch.identity", Kind::OneOf(&["path", "path_and_content"]), false),
    field("watch.poll_interval_ms", Kind::Integer { min: 50, max: HOUR_MS }, false),
    field("watch.channel_capacity", Kind::Integer { min: 1, max: 1_000_000 }, false),
    field("watch.force_polling", Kind::Bool, false),
    field("watch.settle_ms", Kind::Integer { min: 0, max: 60_000 }, false),
    field("watch.rescan_interval_ms", Kind::Integer { min: 1_000, max: 24 * HOUR_MS }, false),
    field("workers.concurrency", Kind::Integer { min: 1, max: 1_024 }, true),
    field("workers.call_timeout_ms", Kind::Integer { min: 1, max: 24 * HOUR_MS }, false),
    field("rate.max_concurrent", Kind::Integer { min: 1, max: 100_000 }, true),
    field("rate.max_calls_per_window", Kind::Integer { min: 1, max: 10_000_000 }, false),
    field("rate.window_ms", Kind::Integer { min: 1, max: 24 * HOUR_MS }, false),
    field("rate.acquire_timeout_ms", Kind::Integer { min: 1, max: HOUR_MS }, false),
    field("retry.max_attempts", Kind::Integer { min: 1, max: 1_000 }, true),
    field("retry.backoff_initial_ms", Kind::Integer { min: 0, max: HOUR_MS }, true),
    field("retry.backoff_max_ms", Kind::Integer { min: 0, max: 24 * HOUR_MS }, true),
    field("retry.backoff_multiplier", Kind::Float { min: 1.0, max: 100.0 }, false),
    field("checkpoint.path", Kind::Text, false),
    field("checkpoint.batch_size", Kind::Integer { min: 1, max: 100_000 }, false),
    field("checkpoint.write_retry_ms", Kind::Integer { min: 1, max: HOUR_MS }, false),
    field("recognizer.endpoint", Kind::Text, false),
    field("recognizer.credentials_env", Kind::Text, true),
    field("recognizer.command", Kind::Text, false),
    field("recognizer.output_dir", Kind::Text, false),
    field("status.bind", Kind::Text, false),
    field("status.recent_failures", Kind::Integer { min: 0, max: 100_000 }, false),
    field("status.run_summary_path", Kind::Text, false),
    field("status.summary_interval_ms", Kind::Integer { min: 100, max: 24 * HOUR_MS }, false),
];

/// Fields of one `[endpoints.<name>]` table.
const ENDPOINT_SCHEMA: &[FieldSpec] = &[
    field("url", Kind::Text, true),
    field("concurrency", Kind::Integer { min: 1, max: 1_024 }, false),
    field("credentials_env", Kind::Text, false),
];

/// Check `doc` against the schema.
pub fn check_document(doc: &Table) -> Violations {
    let mut v = Violations::default();

    for (key, value) in doc {
        match SECTIONS.iter().find(|(name, _)| *name == key.as_str()) {
            None => v.push(key.as_str(), "unknown section"),
            Some(_) if !value.is_table() => v.push(key.as_str(), "expected a table"),
            Some(_) if key == "endpoints" => {
                for (name, endpoint) in value.as_table().into_iter().flatten() {
                    check_endpoint(name, endpoint, &mut v);
                }
            }
            Some(_) => {
                for inner in value.as_table().into_iter().flat_map(|t| t.keys()) {
                    let path = format!("{key}.{inner}");
                    if !SCHEMA.iter().any(|f| f.path == path) {
                        v.push(path, "unknown field");
                    }
                }
            }
        }
    }

    for (name, required) in SECTIONS {
        if *required && !doc.contains_key(*name) {
            v.push(*name, "missing required section");
        }
    }

    for spec in SCHEMA {
        let Some((section, key)) = spec.path.split_once('.') else {
            continue;
        };
        let Some(table) = doc.get(section).and_then(Value::as_table) else {
            // reported above when the section itself is required
            continue;
        };
        match table.get(key) {
            None if spec.required => v.push(spec.path, "missing required field"),
            None => {}
            Some(value) => check_value(spec.path, spec.kind, value, &mut v),
        }
    }

    v
}

fn check_endpoint(name: &str, endpoint: &Value, v: &mut Violations) {
    let prefix = format!("endpoints.{name}");
    let Some(table) = endpoint.as_table() else {
        v.push(prefix, "expected a table");
        return;
    };
    for key in table.keys() {
        if !ENDPOINT_SCHEMA.iter().any(|f| f.path == key.as_str()) {
            v.push(format!("{prefix}.{key}"), "unknown field");
        }
    }
    for spec in ENDPOINT_SCHEMA {
        let path = format!("{prefix}.{}", spec.path);
        match table.get(spec.path) {
            None if spec.required => v.push(path, "missing required field"),
            None => {}
            Some(value) => check_value(&path, spec.kind, value, v),
        }
    }
}

/// Cross-field constraints a per-field schema cannot express.
///
/// Each rule only looks at values of the expected type; a wrong type is
/// already reported by [`check_document`]. Absent optional values take their
/// defaults.
pub fn check_constraints(doc: &Table) -> Violations {
    let mut v = Violations::default();

    if let Some(root) = text(doc, "watch", "root") {
        if !Path::new(root).is_dir() {
            v.push("watch.root", format!("{root} is not a directory"));
        }
    }
    if let Some(extensions) = get(doc, "watch", "extensions").and_then(Value::as_array) {
        let usable = extensions
            .iter()
            .filter_map(Value::as_str)
            .any(|e| !e.trim_start_matches('.').is_empty());
        if !usable {
            v.push("watch.extensions", "at least one extension is required");
        }
    }

    if let (Some(initial), Some(max)) = (
        integer(doc, "retry", "backoff_initial_ms"),
        integer(doc, "retry", "backoff_max_ms"),
    ) {
        if initial > max {
            v.push(
                "retry.backoff_initial_ms",
                format!("must not exceed retry.backoff_max_ms ({max})"),
            );
        }
    }

    match (
        get(doc, "rate", "max_calls_per_window"),
        get(doc, "rate", "window_ms"),
    ) {
        (Some(_), None) => v.push(
            "rate.window_ms",
            "required when rate.max_calls_per_window is set",
        ),
        (None, Some(_)) => v.push(
            "rate.max_calls_per_window",
            "required when rate.window_ms is set",
        ),
        _ => {}
    }
    let acquire = integer_or(doc, "rate", "acquire_timeout_ms", super::default_acquire_timeout_ms());
    let call = integer_or(doc, "workers", "call_timeout_ms", super::default_call_timeout_ms());
    if let (Some(acquire), Some(call)) = (acquire, call) {
        if acquire >= call {
            v.push(
                "rate.acquire_timeout_ms",
                "must be shorter than workers.call_timeout_ms",
            );
        }
    }

    if let Some(output) = text(doc, "recognizer", "output_dir") {
        let output = Path::new(output);
        let parent_missing = output
            .parent()
            .is_some_and(|p| !p.as_os_str().is_empty() && !p.is_dir());
        if !output.is_dir() && parent_missing {
            v.push(
                "recognizer.output_dir",
                format!("parent of {} does not exist", output.display()),
            );
        }
    }

    let single = get(doc, "recognizer", "endpoint").is_some();
    let named = doc
        .get("endpoints")
        .and_then(Value::as_table)
        .is_some_and(|t| !t.is_empty());
    if doc.contains_key("recognizer") {
        match (single, named) {
            (false, false) => v.push(
                "recognizer.endpoint",
                "required unless [endpoints] lists at least one endpoint",
            ),
            (true, true) => v.push(
                "recognizer.endpoint",
                "set either recognizer.endpoint or [endpoints], not both",
            ),
            _ => {}
        }
    }

    v
}

fn get<'a>(doc: &'a Table, section: &str, key: &str) -> Option<&'a Value> {
    doc.get(section).and_then(Value::as_table).and_then(|t| t.get(key))
}

fn text<'a>(doc: &'a Table, section: &str, key: &str) -> Option<&'a str> {
    get(doc, section, key).and_then(Value::as_str)
}

fn integer(doc: &Table, section: &str, key: &str) -> Option<i64> {
    get(doc, section, key).and_then(Value::as_integer)
}

/// The integer at `section.key`, its default when absent, `None` when it has
/// the wrong type.
fn integer_or(doc: &Table, section: &str, key: &str, default: u64) -> Option<i64> {
    match get(doc, section, key) {
        None => Some(default as i64),
        Some(value) => value.as_integer(),
    }
}

fn check_value(path: &str, kind: Kind, value: &Value, v: &mut Violations) {
    match kind {
        Kind::Integer { min, max } => match value.as_integer() {
            Some(n) if n < min || n > max => {
                v.push(path, format!("must be between {min} and {max}, got {n}"))
            }
            Some(_) => {}
            None => v.push(path, format!("expected an integer, got {}", value.type_str())),
        },
        Kind::Float { min, max } => {
            let n = value
                .as_float()
                .or_else(|| value.as_integer().map(|i| i as f64));
            match n {
                Some(n) if !(min..=max).contains(&n) => {
                    v.push(path, format!("must be between {min} and {max}, got {n}"))
                }
                Some(_) => {}
                None => v.push(path, format!("expected a number, got {}", value.type_str())),
            }
        }
        Kind::Text => match value.as_str() {
            Some(s) if s.trim().is_empty() => v.push(path, "must not be empty"),
            Some(_) => {}
            None => v.push(path, format!("expected a string, got {}", value.type_str())),
        },
        Kind::Bool => {
            if !value.is_bool() {
                v.push(path, format!("expected a boolean, got {}", value.type_str()));
            }
        }
        Kind::TextList => match value.as_array() {
            Some(items) if items.iter().all(Value::is_str) => {}
            _ => v.push(path, "expected a list of strings"),
        },
        Kind::OneOf(allowed) => match value.as_str() {
            Some(s) if allowed.contains(&s) => {}
            _ => v.push(
                path,
                format!("expected one of: {}", allowed.join(", ")),
            ),
        },
    }
}
