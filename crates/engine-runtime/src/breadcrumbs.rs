use engine_core::{EngineError, EngineErrorCategory, GroupKey};
use engine_platform::{BreadcrumbStore, BreadcrumbStoreError, Breadcrumbs};
use tracing::{debug, warn};

/// Remembers the last selected room of every group.
#[derive(Debug)]
pub struct BreadcrumbTracker<S: BreadcrumbStore> {
    store: S,
    entries: Breadcrumbs,
}

impl<S: BreadcrumbStore> BreadcrumbTracker<S> {
    /// Load persisted breadcrumbs; an unreadable store starts empty.
    pub fn new(store: S) -> Self {
        let entries = match store.load() {
            Ok(entries) => entries,
            Err(err) => {
                let err = store_error(&err);
                warn!(code = %err.code, error = %err, "failed loading breadcrumbs, starting empty");
                Breadcrumbs::new()
            }
        };
        debug!(entry_count = entries.len(), "breadcrumbs loaded");
        Self { store, entries }
    }

    pub fn remembered(&self, group: &GroupKey) -> Option<&str> {
        self.entries.get(group.as_key()).map(String::as_str)
    }

    /// Remember `room_id` for `group` if it is one of the group's `members`.
    ///
    /// Returns whether the breadcrumb was recorded. On a persist failure the
    /// in-memory entry is kept and the store error is returned.
    pub fn record(
        &mut self,
        group: &GroupKey,
        room_id: &str,
        members: &[String],
    ) -> Result<bool, EngineError> {
        if !members.iter().any(|member| member == room_id) {
            debug!(group = %group, room_id = %room_id, "room outside group, breadcrumb not recorded");
            return Ok(false);
        }
        if self.remembered(group) == Some(room_id) {
            return Ok(true);
        }

        self.entries
            .insert(group.as_key().to_owned(), room_id.to_owned());
        self.store.save(&self.entries).map_err(|err| {
            let err = store_error(&err);
            warn!(group = %group, room_id = %room_id, code = %err.code, error = %err, "failed persisting breadcrumb");
            err
        })?;
        Ok(true)
    }

    /// Room to select when switching to `group`.
    ///
    /// The remembered room while it is still a member, else the first member
    /// in resolution order, else none.
    pub fn restore(&self, group: &GroupKey, members: &[String]) -> Option<String> {
        self.remembered(group)
            .filter(|remembered| members.iter().any(|member| member == remembered))
            .map(str::to_owned)
            .or_else(|| members.first().cloned())
    }
}

fn store_error(err: &BreadcrumbStoreError) -> EngineError {
    match err {
        BreadcrumbStoreError::Corrupt(_) => EngineError::new(
            EngineErrorCategory::Serialization,
            "breadcrumb_store_corrupt",
            err.to_string(),
        ),
        BreadcrumbStoreError::Unavailable(_) | BreadcrumbStoreError::Backend(_) => {
            EngineError::new(
                EngineErrorCategory::Storage,
                "breadcrumb_store_error",
                err.to_string(),
            )
        }
    }
}
