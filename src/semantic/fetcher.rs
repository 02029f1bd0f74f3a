//! Paginated retrieval of the whole pair collection.
//!
//! Page 1 is fetched first to learn the total and the page size the backend
//! actually honours; the remaining pages go out concurrently, gated by a
//! semaphore, and are reassembled in page order.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::semantic::snapshot::Item;

/// One page of the backend's paginated listing.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct Page {
    #[serde(default)]
    pub results: Vec<Item>,
    #[serde(default)]
    pub total: usize,
    /// `true`/`false`, a URL, or null depending on the endpoint.
    #[serde(default)]
    pub next: Option<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("reqwest error: {0:?}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned status {status} for page {page}")]
    Status { page: usize, status: u16 },

    #[error("could not decode page {page}: {reason}")]
    Decode { page: usize, reason: String },

    #[error("page {page} timed out after {secs}s")]
    Timeout { page: usize, secs: u64 },

    #[error("page task failed: {0}")]
    Join(String),
}

/// Source of pages. Pages are 1-based.
#[async_trait::async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, page: usize, count: usize) -> Result<Page, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub page_size: usize,
    pub max_concurrency: usize,
    pub timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            page_size: 1000,
            max_concurrency: 8,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of a full fetch.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub items: Vec<Item>,
    /// Total reported by the backend on page 1.
    pub total: usize,
    pub pages: usize,
    pub failed_pages: Vec<usize>,
}

impl FetchReport {
    pub fn is_consistent(&self) -> bool {
        self.items.len() == self.total
    }
}

pub struct PaginatedFetcher {
    source: Arc<dyn PageSource>,
    options: FetchOptions,
}

impl PaginatedFetcher {
    pub fn new(source: Arc<dyn PageSource>, options: FetchOptions) -> Self {
        Self { source, options }
    }

    /// Fetch every item. Only a page-1 failure is fatal.
    pub async fn fetch_all(&self) -> Result<FetchReport, FetchError> {
        let requested = self.options.page_size.max(1);
        let max_concurrency = self.options.max_concurrency.max(1);
        let timeout = self.options.timeout;

        let first = fetch_with_timeout(self.source.as_ref(), 1, requested, timeout).await?;
        let total = first.total;
        let page_size = effective_page_size(requested, first.results.len(), total);

        if total == 0 {
            if !first.results.is_empty() {
                log::warn!(
                    "backend reported total=0 but returned {} items on page 1",
                    first.results.len()
                );
            }
            return Ok(FetchReport {
                items: first.results,
                total,
                pages: 1,
                failed_pages: Vec::new(),
            });
        }

        if first.results.is_empty() {
            // pagination offset quirk: keep going
            log::warn!("page 1 empty with total={total}, fetching remaining pages");
        }

        let num_pages = total.div_ceil(page_size);
        if num_pages <= 1 {
            let report = FetchReport {
                items: first.results,
                total,
                pages: 1,
                failed_pages: Vec::new(),
            };
            warn_on_mismatch(&report);
            return Ok(report);
        }

        log::debug!(
            "fetching {num_pages} pages of {page_size} ({total} items), {max_concurrency} at a time"
        );

        let semaphore = Arc::new(Semaphore::new(max_concurrency));
        let mut tasks = JoinSet::new();

        for page in 2..=num_pages {
            let source = Arc::clone(&self.source);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        fetch_with_timeout(source.as_ref(), page, page_size, timeout).await
                    }
                    Err(e) => Err(FetchError::Join(e.to_string())),
                };
                (page, result)
            });
        }

        // index 0 holds page 2
        let mut pages: Vec<Option<Vec<Item>>> = vec![None; num_pages - 1];
        let mut failed_pages = Vec::new();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((page, Ok(body))) => pages[page - 2] = Some(body.results),
                Ok((page, Err(err))) => {
                    log::warn!("page {page} failed, continuing without it: {err}");
                    failed_pages.push(page);
                }
                Err(err) => log::warn!("page task aborted: {err}"),
            }
        }

        // a panicked task never reported its page number
        for (offset, slot) in pages.iter().enumerate() {
            let page = offset + 2;
            if slot.is_none() && !failed_pages.contains(&page) {
                failed_pages.push(page);
            }
        }
        failed_pages.sort_unstable();

        let mut items = first.results;
        for body in pages.into_iter().flatten() {
            items.extend(body);
        }

        let report = FetchReport {
            items,
            total,
            pages: num_pages,
            failed_pages,
        };
        warn_on_mismatch(&report);

        Ok(report)
    }
}

/// Page size the backend honoured on page 1.
///
/// A short first page that is not the whole collection means the backend
/// capped `count`; later pages are addressed with the capped size.
fn effective_page_size(requested: usize, returned: usize, total: usize) -> usize {
    if returned > 0 && returned < requested && returned < total {
        log::warn!("backend capped page size at {returned} (requested {requested})");
        returned
    } else {
        requested
    }
}

fn warn_on_mismatch(report: &FetchReport) {
    if !report.is_consistent() {
        log::warn!(
            "fetched {} items but backend reported {} (failed pages: {:?})",
            report.items.len(),
            report.total,
            report.failed_pages
        );
    }
}

async fn fetch_with_timeout(
    source: &dyn PageSource,
    page: usize,
    count: usize,
    timeout: Duration,
) -> Result<Page, FetchError> {
    match tokio::time::timeout(timeout, source.fetch_page(page, count)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout {
            page,
            secs: timeout.as_secs(),
        }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory backend. Records requested pages and peak concurrency.
    pub(crate) struct StubSource {
        pub items: Vec<Item>,
        /// reported total; defaults to items.len()
        pub total: Option<usize>,
        pub delay: Duration,
        pub failing_pages: HashSet<usize>,
        pub hanging_pages: HashSet<usize>,
        pub fail_everything: bool,
        /// largest `count` the stub honours
        pub max_count: Option<usize>,
        pub requested: Mutex<Vec<usize>>,
        pub calls: AtomicUsize,
        in_flight: AtomicUsize,
        pub peak_in_flight: AtomicUsize,
    }

    impl StubSource {
        pub(crate) fn new(items: Vec<Item>) -> Self {
            Self {
                items,
                total: None,
                delay: Duration::ZERO,
                failing_pages: HashSet::new(),
                hanging_pages: HashSet::new(),
                fail_everything: false,
                max_count: None,
                requested: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }
        }

        pub(crate) fn failing() -> Self {
            let mut stub = Self::new(Vec::new());
            stub.fail_everything = true;
            stub
        }
    }

    #[async_trait::async_trait]
    impl PageSource for StubSource {
        async fn fetch_page(&self, page: usize, count: usize) -> Result<Page, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requested.lock().unwrap().push(page);

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.hanging_pages.contains(&page) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_everything || self.failing_pages.contains(&page) {
                return Err(FetchError::Status { page, status: 500 });
            }

            let count = self.max_count.map_or(count, |max| count.min(max));
            let start = (page - 1) * count;
            let results = self
                .items
                .iter()
                .skip(start)
                .take(count)
                .cloned()
                .collect();

            Ok(Page {
                results,
                total: self.total.unwrap_or(self.items.len()),
                next: None,
            })
        }
    }

    pub(crate) fn items(n: usize) -> Vec<Item> {
        (1..=n as u64)
            .map(|id| Item {
                id,
                item1: format!("x{id}"),
                item2: format!("y{id}"),
                vector_embedding: None,
            })
            .collect()
    }

    fn fetcher(source: Arc<StubSource>, page_size: usize, max_concurrency: usize) -> PaginatedFetcher {
        PaginatedFetcher::new(
            source,
            FetchOptions {
                page_size,
                max_concurrency,
                timeout: Duration::from_secs(5),
            },
        )
    }

    #[tokio::test]
    async fn test_250_items_in_pages_of_100() {
        let source = Arc::new(StubSource::new(items(250)));

        let report = fetcher(source.clone(), 100, 4).fetch_all().await.unwrap();

        let mut requested = source.requested.lock().unwrap().clone();
        requested.sort_unstable();
        assert_eq!(requested, vec![1, 2, 3]);
        assert_eq!(report.pages, 3);

        let ids: Vec<u64> = report.items.iter().map(|i| i.id).collect();
        assert_eq!(ids, (1..=250).collect::<Vec<u64>>());
        assert!(report.is_consistent());
    }

    #[tokio::test]
    async fn test_capped_page_size_still_fetches_everything() {
        let mut stub = StubSource::new(items(250));
        stub.max_count = Some(100);
        let source = Arc::new(stub);

        let report = fetcher(source.clone(), 1000, 4).fetch_all().await.unwrap();

        assert_eq!(report.pages, 3);
        assert_eq!(report.items.len(), 250);
        assert!(report.is_consistent());
        let ids: Vec<u64> = report.items.iter().map(|i| i.id).collect();
        assert_eq!(ids, (1..=250).collect::<Vec<u64>>());
    }

    #[test]
    fn test_effective_page_size() {
        assert_eq!(effective_page_size(1000, 100, 250), 100);
        // last and only page
        assert_eq!(effective_page_size(1000, 40, 40), 1000);
        // empty first page
        assert_eq!(effective_page_size(100, 0, 250), 100);
        assert_eq!(effective_page_size(100, 100, 250), 100);
    }

    #[tokio::test]
    async fn test_single_page_returns_immediately() {
        let source = Arc::new(StubSource::new(items(40)));

        let report = fetcher(source.clone(), 100, 4).fetch_all().await.unwrap();

        assert_eq!(report.items.len(), 40);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_collection() {
        let source = Arc::new(StubSource::new(Vec::new()));

        let report = fetcher(source.clone(), 100, 4).fetch_all().await.unwrap();

        assert!(report.items.is_empty());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_is_bounded() {
        let mut stub = StubSource::new(items(1000));
        stub.delay = Duration::from_millis(20);
        let source = Arc::new(stub);

        // page 1 plus 10 pending pages
        let report = fetcher(source.clone(), 91, 4).fetch_all().await.unwrap();

        assert_eq!(report.pages, 11);
        assert_eq!(report.items.len(), 1000);
        let peak = source.peak_in_flight.load(Ordering::SeqCst);
        assert!(peak <= 4, "peak in flight was {peak}");
        assert!(peak >= 2, "pages were not fetched concurrently");
    }

    #[tokio::test]
    async fn test_failed_page_degrades_to_empty() {
        let mut stub = StubSource::new(items(300));
        stub.failing_pages.insert(2);
        let source = Arc::new(stub);

        let report = fetcher(source, 100, 2).fetch_all().await.unwrap();

        assert_eq!(report.failed_pages, vec![2]);
        assert_eq!(report.items.len(), 200);
        assert!(!report.is_consistent());
        let ids: Vec<u64> = report.items.iter().map(|i| i.id).collect();
        assert_eq!(ids[..100], (1..=100).collect::<Vec<u64>>()[..]);
        assert_eq!(ids[100], 201);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_page_does_not_cancel_siblings() {
        let mut stub = StubSource::new(items(400));
        stub.hanging_pages.insert(3);
        let source = Arc::new(stub);

        let report = fetcher(source, 100, 4).fetch_all().await.unwrap();

        assert_eq!(report.failed_pages, vec![3]);
        assert_eq!(report.items.len(), 300);
    }

    #[tokio::test]
    async fn test_first_page_failure_is_fatal() {
        let source = Arc::new(StubSource::failing());
        let result = fetcher(source, 100, 4).fetch_all().await;
        assert!(matches!(result, Err(FetchError::Status { page: 1, .. })));
    }

    #[tokio::test]
    async fn test_empty_first_page_with_total_keeps_fetching() {
        struct Quirky;

        #[async_trait::async_trait]
        impl PageSource for Quirky {
            async fn fetch_page(&self, page: usize, _count: usize) -> Result<Page, FetchError> {
                let results = if page == 1 { Vec::new() } else { items(2) };
                Ok(Page {
                    results,
                    total: 2,
                    next: None,
                })
            }
        }

        let fetcher = PaginatedFetcher::new(
            Arc::new(Quirky),
            FetchOptions {
                page_size: 1,
                max_concurrency: 2,
                timeout: Duration::from_secs(1),
            },
        );

        let report = fetcher.fetch_all().await.unwrap();
        assert_eq!(report.pages, 2);
        assert_eq!(report.items.len(), 2);
    }

    #[test]
    fn test_page_accepts_next_variants() {
        let with_url: Page =
            serde_json::from_str(r#"{"results": [], "total": 3, "next": "http://x/?page=2"}"#)
                .unwrap();
        let with_bool: Page =
            serde_json::from_str(r#"{"results": [], "total": 3, "next": false}"#).unwrap();
        let without: Page = serde_json::from_str(r#"{"results": []}"#).unwrap();

        assert!(with_url.next.is_some());
        assert!(with_bool.next.is_some());
        assert_eq!(without.total, 0);
    }
}
