//! # Lowtide Cache
//!
//! Bounded, de-duplicating caches for data the UI pulls on demand.
//!
//! - [`PaginatedCache`] keeps a handful of pages from a host [`PageLoader`],
//!   prefetches around the current page, adapts the page size to observed
//!   load times and evicts by a combined frequency/recency score while
//!   protecting the current page and its neighbours.
//! - [`LazyResourceLoader`] loads registered items (images, modules, data)
//!   through closures or a host [`UrlFetcher`], dependencies first, with at
//!   most three loads at once, linear-backoff retries and a FIFO cache.
//!
//! Both share one loader call between concurrent requests for the same key,
//! and both stop loading ahead while their shared [`PrefetchGate`] is closed.
//!
//! ```rust
//! use std::sync::Arc;
//! use lowtide_cache::{PageCacheConfig, PageData, PageLoader, PaginatedCache};
//!
//! struct Numbers;
//!
//! #[async_trait::async_trait]
//! impl PageLoader<u64> for Numbers {
//!     async fn load_page(&self, page: u32, size: u32) -> lowtide_core::Result<PageData<u64>> {
//!         let start = u64::from((page - 1) * size);
//!         Ok(PageData::new((start..start + u64::from(size)).collect(), 100))
//!     }
//! }
//!
//! # tokio_test_block_on(async {
//! let cache = Arc::new(PaginatedCache::new(PageCacheConfig::default(), Arc::new(Numbers))?);
//! let page = cache.get_page(2).await?;
//! assert_eq!(page.items.first(), Some(&20));
//! assert_eq!(page.total_pages, 5);
//! # Ok::<(), lowtide_core::Error>(())
//! # })?;
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! # Ok::<(), lowtide_core::Error>(())
//! ```

#![deny(missing_docs)]

pub mod gate;
pub mod item;
pub mod loader;
pub mod page;
pub mod paginated;

pub use gate::PrefetchGate;
pub use item::{ItemKind, ItemSource, LoadFn, LoadState, LoadStatus, LoadableItem, UrlFetcher};
pub use loader::{BatchReport, LazyResourceLoader, LoaderConfig, LoaderEvent};
pub use page::{Page, PageData, PageLoader};
pub use paginated::{CacheStats, PageCacheConfig, PaginatedCache, PageCacheEvent};
