use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewBlinkEvent {
    pub user_id: String,
    /// `None` only when the session row could not be opened.
    pub session_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlinkEvent {
    pub id: i64,
    pub user_id: String,
    pub session_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub synced: bool,
}
