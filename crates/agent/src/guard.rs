//! Repetition guard: flags identical tool invocations repeated within one run.

use std::collections::HashMap;
use std::fmt::Write as _;

use parking_lot::Mutex;
use tracing::warn;

/// Counts tool invocations by name and canonical arguments.
///
/// One guard lives for exactly one run. Concurrent batch sub-invocations
/// may share a key, so counters sit behind a mutex.
#[derive(Debug)]
pub struct RepetitionGuard {
    threshold: u32,
    counts: Mutex<HashMap<String, u32>>,
}

impl RepetitionGuard {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// `name:canonical-arguments`. Object keys are sorted at every level, so
    /// argument order does not create distinct keys.
    pub fn key(name: &str, arguments: &serde_json::Value) -> String {
        let mut key = String::with_capacity(name.len() + 16);
        key.push_str(name);
        key.push(':');
        write_canonical(&mut key, arguments);
        key
    }

    /// Count one invocation. Returns the advisory warning once the count
    /// exceeds the threshold, and on every call after that.
    pub fn record(&self, name: &str, arguments: &serde_json::Value) -> Option<String> {
        let key = Self::key(name, arguments);
        let count = {
            let mut counts = self.counts.lock();
            let count = counts.entry(key).or_insert(0);
            *count += 1;
            *count
        };

        if count <= self.threshold {
            return None;
        }

        warn!(tool = name, count, threshold = self.threshold, "Repeated identical tool call");
        Some(format!(
            "[repetition warning] `{name}` has now been called {count} times with identical \
             arguments. Repeating it will not produce new information; stop calling it and \
             continue with the results you already have."
        ))
    }

    /// How many times this exact invocation has been seen.
    pub fn count(&self, name: &str, arguments: &serde_json::Value) -> u32 {
        self.counts
            .lock()
            .get(&Self::key(name, arguments))
            .copied()
            .unwrap_or(0)
    }
}

fn write_canonical(out: &mut String, value: &serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}:", serde_json::Value::String(k.clone()));
                write_canonical(out, v);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}
