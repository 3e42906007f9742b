//! API request/response models for events.

use relay::{EventFilter, EventId, EventStatus};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Response to a successful ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventCreateResponse {
    pub event_id: EventId,
    pub status: EventStatus,
}

/// Query parameters for listing events
#[derive(Debug, Default, Deserialize)]
pub struct ListEventsQuery {
    /// `PENDING`, `DELIVERED` or `FAILED`
    pub status: Option<String>,
    /// Page size, at most 100
    pub limit: Option<usize>,
    /// `next_cursor` from the previous page
    pub cursor: Option<String>,
}

impl ListEventsQuery {
    pub fn into_filter(self) -> Result<EventFilter> {
        let status = self
            .status
            .as_deref()
            .map(str::parse::<EventStatus>)
            .transpose()
            .map_err(Error::from)?;
        Ok(EventFilter {
            status,
            limit: self.limit,
            cursor: self.cursor,
        })
    }
}
