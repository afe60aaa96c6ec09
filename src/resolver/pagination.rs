//! Cursor-driven pagination with the two failure policies the resolver needs.
//!
//! Candidate listing must see every page: an incomplete candidate set could
//! hide the real match, so any failed page fails the listing. Binding
//! fetches are per candidate and degrade instead: once one page has arrived,
//! a later failure returns what was collected so far.

use std::{collections::HashSet, future::Future};

use tokio_util::sync::CancellationToken;

use super::ResolveError;

/// One page of results plus the opaque cursor for the next page.
#[derive(Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<String>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, next: Option<String>) -> Self {
        // Some APIs signal the last page with an empty cursor instead of omitting it.
        let next = next.filter(|cursor| !cursor.is_empty());
        Self { items, next }
    }

    pub fn last(items: Vec<T>) -> Self {
        Self { items, next: None }
    }
}

/// Fetch every page, failing the whole walk if any page fails.
///
/// `fetch` receives `None` for the first page and the previous page's cursor
/// afterwards.
pub async fn collect_all<T, F, Fut>(mut fetch: F) -> Result<Vec<T>, ResolveError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>, ResolveError>>,
{
    let mut items = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor = None;

    loop {
        let page = fetch(cursor.take()).await?;
        items.extend(page.items);

        let Some(next) = page.next else {
            return Ok(items);
        };
        if !seen.insert(next.clone()) {
            return Err(ResolveError::Upstream(format!(
                "pagination cursor repeated: {next}"
            )));
        }
        cursor = Some(next);
    }
}

/// Fetch pages until exhausted, cancelled, or a page fails.
///
/// A failure on the first page is returned as an error. A failure on any
/// later page is logged and the items gathered so far are returned.
/// Cancellation is checked before every request.
pub async fn collect_degraded<T, F, Fut>(
    cancel: &CancellationToken,
    mut fetch: F,
) -> Result<Vec<T>, ResolveError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>, ResolveError>>,
{
    let mut items = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor = None;
    let mut pages = 0usize;

    loop {
        if cancel.is_cancelled() {
            tracing::trace!(pages, "Pagination stopped by cancellation");
            return Ok(items);
        }

        let page = match fetch(cursor.take()).await {
            Ok(page) => page,
            Err(e) if pages == 0 => return Err(e),
            Err(e) => {
                tracing::warn!(
                    pages,
                    collected = items.len(),
                    error = %e,
                    "Page request failed, continuing with partial results"
                );
                return Ok(items);
            }
        };
        pages += 1;
        items.extend(page.items);

        let Some(next) = page.next else {
            return Ok(items);
        };
        if !seen.insert(next.clone()) {
            tracing::warn!(cursor = %next, "Pagination cursor repeated, stopping");
            return Ok(items);
        }
        cursor = Some(next);
    }
}
