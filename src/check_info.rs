//! Component B: the per-topic check-info table (§4.B). Guards schema
//! alters against touching a column a live subscription depends on.
//! Concurrent-mutation safety is explicitly not required here (schema
//! alters are single-threaded per partition), so a plain mutex suffices.

use std::sync::Mutex;

use hashbrown::HashMap;

use crate::data::CheckInfo;
use crate::error::TqResult;

pub struct CheckInfoTable {
    entries: Mutex<HashMap<String, CheckInfo>>,
}

impl CheckInfoTable {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    pub fn insert(&self, info: CheckInfo) -> TqResult<()> {
        self.entries.lock().unwrap().insert(info.topic.clone(), info);
        Ok(())
    }

    pub fn remove(&self, topic: &str) -> TqResult<()> {
        if self.entries.lock().unwrap().remove(topic).is_none() {
            tracing::debug!(topic, "check-info delete: no entry");
        }
        Ok(())
    }

    /// `true` iff `col_id` may still be altered on `table_uid` — i.e. no
    /// entry forbids it.
    pub fn check_column_modifiable(&self, table_uid: i64, col_id: i32) -> bool {
        !self
            .entries
            .lock()
            .unwrap()
            .values()
            .any(|info| info.table_uid == table_uid && info.forbidden_column_ids.contains(&col_id))
    }
}

impl Default for CheckInfoTable {
    fn default() -> Self {
        Self::new()
    }
}
