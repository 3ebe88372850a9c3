use chrono::{DateTime, TimeDelta, Utc};

use crate::db::{Filter, Measurement, Store, UtcTimestamp};
use crate::error::StorageError;

/// Rows returned when no (or an unknown) range is requested.
pub const LIVE_LIMIT: i64 = 50;

/// Time window selected by the dashboard's `range` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Range {
    Live,
    LastHour,
    Last12Hours,
    Last24Hours,
    Last7Days,
    Last15Days,
}

impl Range {
    /// Unknown tokens fall back to [`Range::Live`].
    pub fn from_token(token: Option<&str>) -> Range {
        match token {
            Some("1h") => Range::LastHour,
            Some("12h") => Range::Last12Hours,
            Some("24h") => Range::Last24Hours,
            Some("7d") => Range::Last7Days,
            Some("15d") => Range::Last15Days,
            _ => Range::Live,
        }
    }

    pub fn window(self) -> Option<TimeDelta> {
        match self {
            Range::Live => None,
            Range::LastHour => Some(TimeDelta::hours(1)),
            Range::Last12Hours => Some(TimeDelta::hours(12)),
            Range::Last24Hours => Some(TimeDelta::hours(24)),
            Range::Last7Days => Some(TimeDelta::days(7)),
            Range::Last15Days => Some(TimeDelta::days(15)),
        }
    }

    pub fn filter(self, now: DateTime<Utc>) -> Filter {
        match self.window() {
            Some(window) => Filter::Since(UtcTimestamp::from(now - window)),
            None => Filter::Latest(LIVE_LIMIT),
        }
    }
}

/// Serves range-bounded reads to the dashboard.
#[derive(Clone)]
pub struct QueryService {
    store: Store,
}

impl QueryService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn fetch(&self, token: Option<&str>) -> Result<Vec<Measurement>, StorageError> {
        let range = Range::from_token(token);
        log::debug!("Fetching measurements for {range:?}");

        self.store.query(range.filter(Utc::now())).await
    }
}
