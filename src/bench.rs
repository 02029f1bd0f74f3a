use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::semantic::{FetchOptions, PageSource, PaginatedFetcher};

#[derive(Debug)]
pub struct BenchRow {
    pub count: usize,
    pub max_concurrent: usize,
    pub elapsed: Duration,
    pub status: String,
}

impl std::fmt::Display for BenchRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "count={}, max_concurrent={}, time={:.2}s, status={}",
            self.count,
            self.max_concurrent,
            self.elapsed.as_secs_f64(),
            self.status
        )
    }
}

/// Run one full fetch per (page size, concurrency) combination.
pub async fn bench_fetch(
    source: Arc<dyn PageSource>,
    counts: &[usize],
    concurrency: &[usize],
    timeout: Duration,
) -> Vec<BenchRow> {
    let mut rows = Vec::with_capacity(counts.len() * concurrency.len());

    for &count in counts {
        for &max_concurrent in concurrency {
            let fetcher = PaginatedFetcher::new(
                Arc::clone(&source),
                FetchOptions {
                    page_size: count,
                    max_concurrency: max_concurrent,
                    timeout,
                },
            );

            let start = Instant::now();
            let status = match fetcher.fetch_all().await {
                Ok(report) if report.is_consistent() => "OK".to_string(),
                Ok(report) => format!(
                    "PARTIAL {}/{} (failed pages {:?})",
                    report.items.len(),
                    report.total,
                    report.failed_pages
                ),
                Err(err) => err.to_string(),
            };

            rows.push(BenchRow {
                count,
                max_concurrent,
                elapsed: start.elapsed(),
                status,
            });
        }
    }

    rows
}
