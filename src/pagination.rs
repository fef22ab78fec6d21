//! Lazy iterators over remote paged resources

use std::collections::{BTreeMap, VecDeque};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::prefetch::{PrefetchConfig, Prefetcher};

/// Default number of records requested per page
pub const DEFAULT_PAGE_LIMIT: usize = 100;

/// Query key carrying the page size
pub const LIMIT_KEY: &str = "limit";

/// Query key carrying the continuation cursor
pub const CURSOR_KEY: &str = "next";

/// Default query key carrying an identifier window
pub const IDS_KEY: &str = "ids";

/// Query parameters sent with a page fetch, ordered deterministically
pub type QueryParams = BTreeMap<String, String>;

/// One batch of raw records returned by a single page fetch, plus the
/// opaque cursor identifying where the next fetch should resume (absent on
/// the final page).
#[derive(Debug, Clone, Default)]
pub struct RawPage {
    /// Raw records in server order
    pub records: Vec<Value>,

    /// Continuation cursor, if the resource has more pages
    pub next_cursor: Option<String>,
}

/// The transport boundary: one call fetches one page of raw records.
///
/// Implementations are expected to be retryable by the caller; the
/// paginators never retry a failed fetch themselves.
pub trait PageFetcher {
    /// Fetch one page of `resource` with the given query parameters
    fn fetch(&self, resource: &str, params: &QueryParams) -> Result<RawPage>;
}

impl<T: PageFetcher + ?Sized> PageFetcher for &T {
    fn fetch(&self, resource: &str, params: &QueryParams) -> Result<RawPage> {
        (**self).fetch(resource, params)
    }
}

type EntityFn<E> = Box<dyn Fn(Value) -> Result<E> + Send>;

fn serde_entity<E: DeserializeOwned>() -> impl Fn(Value) -> Result<E> + Send + 'static {
    |record| serde_json::from_value(record).map_err(Error::from)
}

/// A lazy iterator over a cursor-paged resource.
///
/// Each page fetch sends the page limit and the cursor returned by the
/// previous fetch; the resource is exhausted once a response carries no
/// cursor or returns fewer than `limit` records. Records are buffered raw
/// and deserialized one at a time as they are yielded, oldest first.
///
/// A fetch error is yielded once and exhausts the paginator; records
/// already yielded stay valid.
pub struct CursorPaginator<E, F> {
    fetcher: F,
    resource: String,
    params: QueryParams,
    limit: usize,
    cursor: Option<String>,
    last_page: bool,
    buffered: VecDeque<Value>,
    deserialize: EntityFn<E>,
}

impl<E: DeserializeOwned, F: PageFetcher> CursorPaginator<E, F> {
    /// Create a paginator deserializing records with serde
    pub fn new(fetcher: F, resource: impl Into<String>, params: QueryParams) -> Self {
        Self::with_deserializer(fetcher, resource, params, serde_entity::<E>())
    }
}

impl<E, F: PageFetcher> CursorPaginator<E, F> {
    /// Create a paginator with a custom record-to-entity conversion
    pub fn with_deserializer<D>(
        fetcher: F,
        resource: impl Into<String>,
        params: QueryParams,
        deserialize: D,
    ) -> Self
    where
        D: Fn(Value) -> Result<E> + Send + 'static,
    {
        Self {
            fetcher,
            resource: resource.into(),
            params,
            limit: DEFAULT_PAGE_LIMIT,
            cursor: None,
            last_page: false,
            buffered: VecDeque::new(),
            deserialize: Box::new(deserialize),
        }
    }

    /// Set the page size (clamped to at least one record per page)
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    fn fetch_next_page(&mut self) -> Result<()> {
        let mut params = self.params.clone();
        params.insert(LIMIT_KEY.to_string(), self.limit.to_string());
        if let Some(cursor) = &self.cursor {
            params.insert(CURSOR_KEY.to_string(), cursor.clone());
        }

        let page = self.fetcher.fetch(&self.resource, &params)?;
        debug!(
            resource = %self.resource,
            records = page.records.len(),
            has_cursor = page.next_cursor.is_some(),
            "fetched page"
        );
        self.last_page = page.next_cursor.is_none() || page.records.len() < self.limit;
        self.cursor = page.next_cursor;
        self.buffered.extend(page.records);
        Ok(())
    }
}

impl<E, F: PageFetcher> Iterator for CursorPaginator<E, F> {
    type Item = Result<E>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffered.pop_front() {
                return Some((self.deserialize)(record));
            }
            if self.last_page {
                return None;
            }
            if let Err(error) = self.fetch_next_page() {
                self.last_page = true;
                return Some(Err(error));
            }
        }
    }
}

impl<E, F> CursorPaginator<E, F>
where
    E: Send + 'static,
    F: PageFetcher + Send + 'static,
{
    /// Move the paginator onto a worker thread so page fetches are
    /// pipelined with consumption
    pub fn prefetch(self, config: PrefetchConfig) -> Result<Prefetcher<E>> {
        Prefetcher::spawn(self, |entity: Result<E>| entity.map(Some), config)
    }
}

/// A lazy iterator over a resource keyed by a fixed identifier list.
///
/// The identifier list is partitioned into windows of `limit`; each page
/// fetch sends one window (comma-joined under the identifiers key, merged
/// over the user params). The window index advances unconditionally per
/// fetch, so the last page is determined by arithmetic over the list
/// length, never by response content. An empty list issues no fetches.
pub struct IdentifierPaginator<E, F> {
    fetcher: F,
    resource: String,
    params: QueryParams,
    identifiers: Vec<String>,
    identifiers_key: String,
    limit: usize,
    next_index: usize,
    last_page: bool,
    buffered: VecDeque<Value>,
    deserialize: EntityFn<E>,
}

impl<E: DeserializeOwned, F: PageFetcher> IdentifierPaginator<E, F> {
    /// Create a paginator deserializing records with serde
    pub fn new(
        fetcher: F,
        resource: impl Into<String>,
        identifiers: Vec<String>,
        params: QueryParams,
    ) -> Self {
        Self::with_deserializer(fetcher, resource, identifiers, params, serde_entity::<E>())
    }
}

impl<E, F: PageFetcher> IdentifierPaginator<E, F> {
    /// Create a paginator with a custom record-to-entity conversion
    pub fn with_deserializer<D>(
        fetcher: F,
        resource: impl Into<String>,
        identifiers: Vec<String>,
        params: QueryParams,
        deserialize: D,
    ) -> Self
    where
        D: Fn(Value) -> Result<E> + Send + 'static,
    {
        Self {
            fetcher,
            resource: resource.into(),
            params,
            identifiers,
            identifiers_key: IDS_KEY.to_string(),
            limit: DEFAULT_PAGE_LIMIT,
            next_index: 0,
            last_page: false,
            buffered: VecDeque::new(),
            deserialize: Box::new(deserialize),
        }
    }

    /// Set the identifier window size (clamped to at least one)
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Override the query key the identifier window is sent under
    pub fn with_identifiers_key(mut self, key: impl Into<String>) -> Self {
        self.identifiers_key = key.into();
        self
    }

    fn fetch_next_page(&mut self) -> Result<()> {
        let start = self.next_index;
        let end = (start + self.limit).min(self.identifiers.len());
        self.next_index = start + self.limit;
        if self.next_index >= self.identifiers.len() {
            self.last_page = true;
        }
        if start >= end {
            return Ok(());
        }

        let mut params = self.params.clone();
        params.insert(
            self.identifiers_key.clone(),
            self.identifiers[start..end].join(","),
        );

        let page = self.fetcher.fetch(&self.resource, &params)?;
        debug!(
            resource = %self.resource,
            window_start = start,
            window_end = end,
            records = page.records.len(),
            "fetched identifier window"
        );
        self.buffered.extend(page.records);
        Ok(())
    }
}

impl<E, F: PageFetcher> Iterator for IdentifierPaginator<E, F> {
    type Item = Result<E>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffered.pop_front() {
                return Some((self.deserialize)(record));
            }
            if self.last_page {
                return None;
            }
            if let Err(error) = self.fetch_next_page() {
                self.last_page = true;
                return Some(Err(error));
            }
        }
    }
}

impl<E, F> IdentifierPaginator<E, F>
where
    E: Send + 'static,
    F: PageFetcher + Send + 'static,
{
    /// Move the paginator onto a worker thread so page fetches are
    /// pipelined with consumption
    pub fn prefetch(self, config: PrefetchConfig) -> Result<Prefetcher<E>> {
        Prefetcher::spawn(self, |entity: Result<E>| entity.map(Some), config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Mutex;
    use test_case::test_case;

    #[derive(Debug, Deserialize, PartialEq)]
    struct DataRow {
        id: String,
    }

    /// Echoes every requested identifier back as a record and logs each call
    #[derive(Default)]
    struct EchoFetcher {
        calls: Mutex<Vec<QueryParams>>,
    }

    impl EchoFetcher {
        fn call_params(&self) -> Vec<QueryParams> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl PageFetcher for EchoFetcher {
        fn fetch(&self, _resource: &str, params: &QueryParams) -> Result<RawPage> {
            self.calls.lock().unwrap().push(params.clone());
            let records = params
                .get(IDS_KEY)
                .map(|ids| {
                    ids.split(',')
                        .map(|id| json!({ "id": id }))
                        .collect::<Vec<Value>>()
                })
                .unwrap_or_default();
            Ok(RawPage {
                records,
                next_cursor: None,
            })
        }
    }

    /// Replays a fixed sequence of pages, erroring once they run out
    struct ScriptedFetcher {
        pages: Mutex<VecDeque<Result<RawPage>>>,
        calls: Mutex<Vec<QueryParams>>,
    }

    impl ScriptedFetcher {
        fn new(pages: Vec<Result<RawPage>>) -> Self {
            Self {
                pages: Mutex::new(pages.into_iter().collect()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_params(&self) -> Vec<QueryParams> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl PageFetcher for ScriptedFetcher {
        fn fetch(&self, _resource: &str, params: &QueryParams) -> Result<RawPage> {
            self.calls.lock().unwrap().push(params.clone());
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::Transport("no scripted page left".into())))
        }
    }

    fn ids(count: usize) -> Vec<String> {
        (0..count).map(|id| format!("row-{id}")).collect()
    }

    fn page(ids: &[&str], next_cursor: Option<&str>) -> RawPage {
        RawPage {
            records: ids.iter().map(|id| json!({ "id": id })).collect(),
            next_cursor: next_cursor.map(str::to_string),
        }
    }

    #[test_case(1000, 200, 5; "five full windows")]
    #[test_case(5, 2, 3; "ragged final window")]
    #[test_case(3, 200, 1; "single short window")]
    #[test_case(0, 100, 0; "empty identifier list")]
    fn identifier_windows_cover_every_id(count: usize, limit: usize, expected_calls: usize) {
        let all_ids = ids(count);
        let fetcher = EchoFetcher::default();
        let paginator = IdentifierPaginator::<DataRow, _>::new(
            &fetcher,
            "data-rows",
            all_ids.clone(),
            QueryParams::new(),
        )
        .with_limit(limit);

        let rows: Vec<DataRow> = paginator.map(|row| row.unwrap()).collect();
        let calls = fetcher.call_params();

        assert_eq!(calls.len(), expected_calls);
        assert_eq!(rows.len(), count);

        // Each call carries exactly one window, in order, covering the list
        for (index, call) in calls.iter().enumerate() {
            let start = index * limit;
            let end = (start + limit).min(count);
            assert_eq!(call[IDS_KEY], all_ids[start..end].join(","));
        }
        let requested: Vec<String> = rows.into_iter().map(|row| row.id).collect();
        assert_eq!(requested, all_ids);
    }

    #[test]
    fn identifier_fetch_merges_user_params() {
        let fetcher = EchoFetcher::default();
        let mut params = QueryParams::new();
        params.insert("project_id".to_string(), "proj-1".to_string());

        let paginator =
            IdentifierPaginator::<DataRow, _>::new(&fetcher, "data-rows", ids(4), params)
                .with_limit(2);
        let rows: Vec<DataRow> = paginator.map(|row| row.unwrap()).collect();
        assert_eq!(rows.len(), 4);

        for call in fetcher.call_params() {
            assert_eq!(call["project_id"], "proj-1");
            assert!(call.contains_key(IDS_KEY));
        }
    }

    #[test]
    fn identifier_key_is_configurable() {
        let fetcher = ScriptedFetcher::new(vec![Ok(page(&["a"], None))]);
        let paginator = IdentifierPaginator::<DataRow, _>::new(
            &fetcher,
            "data-rows",
            vec!["a".to_string()],
            QueryParams::new(),
        )
        .with_identifiers_key("data_row_ids");

        let rows: Vec<DataRow> = paginator.map(|row| row.unwrap()).collect();
        assert_eq!(rows, vec![DataRow { id: "a".to_string() }]);

        let calls = fetcher.call_params();
        assert_eq!(calls[0]["data_row_ids"], "a");
        assert!(!calls[0].contains_key(IDS_KEY));
    }

    #[test]
    fn cursor_paginator_walks_cursor_chain_in_order() {
        let fetcher = ScriptedFetcher::new(vec![
            Ok(page(&["a", "b"], Some("c1"))),
            Ok(page(&["c", "d"], Some("c2"))),
            Ok(page(&["e", "f"], None)),
        ]);
        let paginator =
            CursorPaginator::<DataRow, _>::new(&fetcher, "labels", QueryParams::new())
                .with_limit(2);

        let yielded: Vec<String> = paginator.map(|row| row.unwrap().id).collect();
        assert_eq!(yielded, vec!["a", "b", "c", "d", "e", "f"]);

        let calls = fetcher.call_params();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0][LIMIT_KEY], "2");
        assert!(!calls[0].contains_key(CURSOR_KEY));
        assert_eq!(calls[1][CURSOR_KEY], "c1");
        assert_eq!(calls[2][CURSOR_KEY], "c2");
    }

    #[test]
    fn short_page_ends_cursor_iteration() {
        // Fewer records than the limit means the final page even though the
        // server handed back a cursor.
        let fetcher = ScriptedFetcher::new(vec![Ok(page(&["a", "b", "c"], Some("c1")))]);
        let paginator =
            CursorPaginator::<DataRow, _>::new(&fetcher, "labels", QueryParams::new())
                .with_limit(10);

        let yielded: Vec<DataRow> = paginator.map(|row| row.unwrap()).collect();
        assert_eq!(yielded.len(), 3);
        assert_eq!(fetcher.call_params().len(), 1);
    }

    #[test]
    fn fetch_error_is_yielded_once_then_exhausted() {
        let fetcher = ScriptedFetcher::new(vec![
            Ok(page(&["a", "b"], Some("c1"))),
            Err(Error::Transport("503 from export endpoint".into())),
        ]);
        let mut paginator =
            CursorPaginator::<DataRow, _>::new(&fetcher, "labels", QueryParams::new())
                .with_limit(2);

        assert_eq!(paginator.next().unwrap().unwrap().id, "a");
        assert_eq!(paginator.next().unwrap().unwrap().id, "b");
        match paginator.next() {
            Some(Err(Error::Transport(message))) => {
                assert_eq!(message, "503 from export endpoint");
            }
            other => panic!("expected transport error, got {other:?}"),
        }
        assert!(paginator.next().is_none());
        assert!(paginator.next().is_none());
    }

    #[test]
    fn malformed_record_surfaces_as_deserialization_error() {
        let fetcher = ScriptedFetcher::new(vec![Ok(RawPage {
            records: vec![json!({ "identifier": 7 })],
            next_cursor: None,
        })]);
        let mut paginator =
            CursorPaginator::<DataRow, _>::new(&fetcher, "labels", QueryParams::new());

        assert!(matches!(
            paginator.next(),
            Some(Err(Error::Deserialization(_)))
        ));
    }

    #[test]
    fn deserializer_is_overridable() {
        let fetcher = ScriptedFetcher::new(vec![Ok(page(&["a", "b"], None))]);
        let paginator = CursorPaginator::<String, _>::with_deserializer(
            &fetcher,
            "labels",
            QueryParams::new(),
            |record: Value| Ok(record["id"].as_str().unwrap_or_default().to_uppercase()),
        );

        let yielded: Vec<String> = paginator.map(|row| row.unwrap()).collect();
        assert_eq!(yielded, vec!["A", "B"]);
    }

    #[test]
    fn prefetched_paginator_streams_every_entity_in_order() {
        let fetcher = EchoFetcher::default();
        let all_ids = ids(10);
        let paginator = IdentifierPaginator::<DataRow, _>::new(
            fetcher,
            "data-rows",
            all_ids.clone(),
            QueryParams::new(),
        )
        .with_limit(3);

        let prefetcher = paginator.prefetch(PrefetchConfig::default()).unwrap();
        let yielded: Vec<String> = prefetcher.map(|row| row.unwrap().id).collect();
        assert_eq!(yielded, all_ids);
    }
}
