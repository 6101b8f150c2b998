use serde::Deserialize;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Cursor over a conversation's history, newest first.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HistoryCursor {
    /// Only return messages with an id strictly below this one.
    pub before: Option<i64>,
    pub limit: Option<u32>,
}

impl HistoryCursor {
    pub fn latest(limit: u32) -> Self {
        Self {
            before: None,
            limit: Some(limit),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }
}

impl Default for HistoryCursor {
    fn default() -> Self {
        Self {
            before: None,
            limit: Some(DEFAULT_PAGE_SIZE),
        }
    }
}
