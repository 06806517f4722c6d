// ── Operation history ────────────────────────────────────────────────────────

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub path: String,
}

/// Capped in-memory log of completed mutations and transfers, newest
/// last. The queue records mkdir/rename/delete, the orchestrator records
/// finished transfers.
pub struct History {
    records: StdMutex<VecDeque<OperationRecord>>,
    cap: usize,
}

impl History {
    pub fn new(cap: usize) -> Self {
        Self {
            records: StdMutex::new(VecDeque::new()),
            cap,
        }
    }

    pub fn record(&self, operation: &str, path: &str) {
        let mut records = self.records.lock().expect("history lock");
        if records.len() == self.cap {
            records.pop_front();
        }
        records.push_back(OperationRecord {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            path: path.to_string(),
        });
    }

    pub fn list(&self) -> Vec<OperationRecord> {
        self.records
            .lock()
            .expect("history lock")
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.records.lock().expect("history lock").clear();
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_order_and_caps() {
        let history = History::new(3);
        for i in 0..5 {
            history.record("mkdir", &format!("/d{}", i));
        }
        let records = history.list();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].path, "/d2");
        assert_eq!(records[2].path, "/d4");

        history.clear();
        assert!(history.list().is_empty());
    }
}
