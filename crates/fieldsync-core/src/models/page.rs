//! Paginated listings

use serde::{Deserialize, Serialize};

/// One page of a larger listing; pages are 1-based
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: usize, page: usize, page_size: usize) -> Self {
        let seen = page.saturating_sub(1).saturating_mul(page_size) + items.len();
        Self {
            has_more: seen < total,
            items,
            total,
            page,
            page_size,
        }
    }

    /// Row offset of a 1-based page
    pub const fn offset(page: usize, page_size: usize) -> usize {
        page.saturating_sub(1).saturating_mul(page_size)
    }
}
