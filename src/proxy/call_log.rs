use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::util::now_ms;

#[derive(Debug, Clone, Serialize)]
pub struct CallAccountInfo {
    pub id: i64,
    pub email: Option<String>,
    pub tier: Option<String>,
}

/// One upstream invocation, as observed at the client boundary. Only
/// calls that actually reached the upstream are recorded here; inbound
/// requests rejected earlier never appear.
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub kind: String,
    pub provider: &'static str,
    pub endpoint: String,
    pub model: String,
    pub stream: bool,
    pub status: String,
    pub latency_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<CallAccountInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub created_at: i64,
}

impl CallRecord {
    pub fn new(kind: impl Into<String>, endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            provider: "antigravity",
            endpoint: endpoint.into(),
            model: model.into(),
            stream: false,
            status: "success".to_string(),
            latency_ms: 0,
            account: None,
            request: None,
            response: None,
            chunks: None,
            error: None,
            created_at: now_ms(),
        }
    }
}

/// Append-only, size-bounded sink of per-call diagnostics. The oldest
/// record is evicted at capacity; a poisoned lock means diagnostics are
/// silently dropped, never an error surfaced to the request path.
pub struct CallLogger {
    entries: Mutex<VecDeque<CallRecord>>,
    capacity: usize,
}

impl CallLogger {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, record: CallRecord) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    /// Keep the raw bytes of a stream chunk that failed to parse; the
    /// chunk is dropped from the stream but stays inspectable here.
    pub fn record_invalid_chunk(&self, model: &str, raw: &str) {
        let mut record = CallRecord::new("invalid_chunk", "streamGenerateContent", model);
        record.stream = true;
        record.status = "dropped".to_string();
        record.error = Some(Value::String(raw.to_string()));
        self.record(record);
    }

    pub fn snapshot(&self) -> Vec<CallRecord> {
        self.entries
            .lock()
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_entry_is_evicted_at_capacity() {
        let logger = CallLogger::new(2);
        for i in 0..3 {
            logger.record(CallRecord::new(format!("call-{}", i), "generateContent", "m"));
        }
        let snapshot = logger.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].kind, "call-1");
        assert_eq!(snapshot[1].kind, "call-2");
    }

    #[test]
    fn invalid_chunks_keep_raw_bytes() {
        let logger = CallLogger::new(8);
        logger.record_invalid_chunk("gemini-3-pro", "data: {not json");
        let snapshot = logger.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, "dropped");
        assert_eq!(
            snapshot[0].error.as_ref().and_then(|v| v.as_str()),
            Some("data: {not json")
        );
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let logger = CallLogger::new(0);
        logger.record(CallRecord::new("a", "e", "m"));
        logger.record(CallRecord::new("b", "e", "m"));
        assert_eq!(logger.len(), 1);
    }
}
