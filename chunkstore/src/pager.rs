//! Resumable pagination over scans and queries.
//!
//! A [`Pager`] issues exactly one store call per [`Pager::next`] and stops
//! after the first page without a continuation token. Nothing is fetched
//! ahead of the caller. At any point [`Pager::resume_token`] is the token a
//! fresh pager needs to continue right after the last page produced, so an
//! interrupted iteration can be picked up later (in another process, given
//! the token bytes) without skipping or repeating rows. Rows written
//! concurrently may or may not be observed.

use std::sync::Arc;

use futures::Stream;

use crate::error::Result;
use crate::model::{ContinuationToken, Page, QueryRequest, ScanRequest};
use crate::store::ItemStore;

enum Request {
    Scan(ScanRequest),
    Query(QueryRequest),
}

pub struct Pager {
    store: Arc<dyn ItemStore>,
    request: Request,
    token: Option<ContinuationToken>,
    done: bool,
}

impl Pager {
    /// Pages through a scan, starting at the request's token.
    pub fn scan(store: Arc<dyn ItemStore>, mut request: ScanRequest) -> Self {
        let token = request.token.take();
        Self {
            store,
            request: Request::Scan(request),
            token,
            done: false,
        }
    }

    /// Pages through a query, starting at the request's token.
    pub fn query(store: Arc<dyn ItemStore>, mut request: QueryRequest) -> Self {
        let token = request.token.take();
        Self {
            store,
            request: Request::Query(request),
            token,
            done: false,
        }
    }

    /// Fetches the next page, or `None` once the last page was produced.
    ///
    /// A failed call leaves the pager where it was, so `next` can be called
    /// again to retry the same page.
    pub async fn next(&mut self) -> Result<Option<Page>> {
        if self.done {
            return Ok(None);
        }
        let token = self.token.clone();
        let page = match &self.request {
            Request::Scan(request) => {
                self.store
                    .scan(request.clone().with_token(token))
                    .await?
            }
            Request::Query(request) => {
                self.store
                    .query(request.clone().with_token(token))
                    .await?
            }
        };
        self.token = page.next_token.clone();
        self.done = self.token.is_none();
        Ok(Some(page))
    }

    /// Token that resumes after the last produced page. `None` before the
    /// first page of an unresumed pager, and after the last page.
    pub fn resume_token(&self) -> Option<&ContinuationToken> {
        self.token.as_ref()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Adapts the pager into a stream of pages. The stream ends after the
    /// last page or the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Page>> {
        futures::stream::unfold(Some(self), |pager| async move {
            let mut pager = pager?;
            match pager.next().await {
                Ok(Some(page)) => Some((Ok(page), Some(pager))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}
