//! Notable non-fatal events, served to callers through `checkErrs`.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

/// Maximum number of entries kept; the oldest are dropped first.
const MAX_ENTRIES: usize = 256;

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotableError {
    /// When it was recorded.
    pub at: DateTime<Utc>,
    /// What happened.
    pub message: String,
}

/// Bounded diagnostics list.
#[derive(Debug, Default)]
pub(crate) struct Diagnostics {
    entries: VecDeque<NotableError>,
}

impl Diagnostics {
    pub(crate) fn record(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(%message, "notable error recorded");
        if self.entries.len() >= MAX_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(NotableError {
            at: Utc::now(),
            message,
        });
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &NotableError> {
        self.entries.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
