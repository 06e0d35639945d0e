use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fetchable::QueryParams;
use crate::lists::ListState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub count: u64,
    pub size: u64,
}

/// Entries and page metadata derived from one list response.
#[derive(Debug, Clone, PartialEq)]
pub struct PaginationResult {
    pub list: Vec<Value>,
    pub page_info: Option<PageInfo>,
}

/// Reads and writes page position in list query parameters.
pub trait Paginator: Send + Sync {
    /// Seeds paging parameters into a freshly built paginated list.
    fn initialize(&self, state: &mut ListState);

    fn current_page(&self, state: &ListState) -> u64;

    /// Parameters selecting `page`, derived from `params`.
    fn with_page(&self, params: Option<&QueryParams>, page: u64) -> QueryParams;

    /// `None` until page info is known.
    fn total_pages(&self, state: &ListState) -> Option<u64>;
}

/// `page`/`size` query parameters with 1-based pages.
#[derive(Debug, Clone, Copy)]
pub struct DefaultPaginator {
    page_size: u32,
}

impl DefaultPaginator {
    pub fn new(page_size: u32) -> Self {
        Self { page_size }
    }
}

impl Paginator for DefaultPaginator {
    fn initialize(&self, state: &mut ListState) {
        let params = state.meta.params.get_or_insert_with(QueryParams::new);
        params
            .entry("page".to_string())
            .or_insert_with(|| "1".to_string());
        params
            .entry("size".to_string())
            .or_insert_with(|| self.page_size.to_string());
    }

    fn current_page(&self, state: &ListState) -> u64 {
        state
            .meta
            .params
            .as_ref()
            .and_then(|params| params.get("page"))
            .and_then(|page| page.parse().ok())
            .unwrap_or(1)
    }

    fn with_page(&self, params: Option<&QueryParams>, page: u64) -> QueryParams {
        let mut params = params.cloned().unwrap_or_default();
        params.insert("page".to_string(), page.to_string());
        params
    }

    fn total_pages(&self, state: &ListState) -> Option<u64> {
        let info = state.page_info?;
        if info.size == 0 {
            return Some(1);
        }
        Some(info.count.div_ceil(info.size).max(1))
    }
}
