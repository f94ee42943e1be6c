//! Page values and the host page loader.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use lowtide_core::Result;

/// What a [`PageLoader`] returns for one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageData<T> {
    /// Items on the page, in order
    pub items: Vec<T>,
    /// Total items in the whole dataset
    pub total_items: u64,
}

impl<T> PageData<T> {
    /// Build page data.
    pub fn new(items: Vec<T>, total_items: u64) -> Self {
        Self { items, total_items }
    }

    /// An empty dataset.
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total_items: 0,
        }
    }
}

/// One page of a paginated dataset.
///
/// The navigation fields are derived from `total_items` and `page_size`, so
/// they always agree with each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    /// 1-based page number
    pub page_number: u32,
    /// Items per page when this page was loaded
    pub page_size: u32,
    /// Items on the page
    pub items: Vec<T>,
    /// Total items in the dataset
    pub total_items: u64,
    /// Total pages in the dataset
    pub total_pages: u32,
    /// A later page exists
    pub has_next: bool,
    /// An earlier page exists
    pub has_previous: bool,
}

impl<T> Page<T> {
    pub(crate) fn from_data(page_number: u32, page_size: u32, data: PageData<T>) -> Self {
        let total_pages = total_pages(data.total_items, page_size);
        Self {
            page_number,
            page_size,
            items: data.items,
            total_items: data.total_items,
            total_pages,
            has_next: page_number < total_pages,
            has_previous: page_number > 1 && total_pages > 0,
        }
    }

    /// Number of items on this page.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the page holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub(crate) fn total_pages(total_items: u64, page_size: u32) -> u32 {
    if page_size == 0 {
        return 0;
    }
    total_items
        .div_ceil(u64::from(page_size))
        .min(u64::from(u32::MAX)) as u32
}

/// Fetches pages for a [`PaginatedCache`](crate::PaginatedCache). Implemented
/// by the host.
#[async_trait]
pub trait PageLoader<T>: Send + Sync {
    /// Fetch page `page` (1-based) of `page_size` items.
    async fn load_page(&self, page: u32, page_size: u32) -> Result<PageData<T>>;
}
