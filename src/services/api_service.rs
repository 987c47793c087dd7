use crate::api::client::{HttpTransport, RequestOptions, Transport};
use crate::config::ApiConfig;
use crate::error::RequestError;
use crate::models::cache::ResponseCache;
use crate::models::filters::FilterSet;
use crate::services::filter_service::FilterService;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

pub const OVERVIEW: &str = "/overview";
pub const FILTERED_OVERVIEW: &str = "/overview/filtered";
pub const BASIC_STATS: &str = "/data/basic-stats";
pub const REPRESENTATION_OUTCOMES: &str = "/findings/representation-outcomes";
pub const TIME_SERIES: &str = "/findings/time-series";
pub const CHI_SQUARE: &str = "/findings/chi-square";
pub const OUTCOME_PERCENTAGES: &str = "/findings/outcome-percentages";
pub const COUNTRIES: &str = "/findings/countries";
pub const FILTER_OPTIONS: &str = "/meta/options";
pub const DATA_STATUS: &str = "/data-status";
pub const FORCE_RELOAD: &str = "/force-reload-data";
pub const HEALTH: &str = "/health";

pub const DEFAULT_RETRIES: u32 = 2;

type SharedRequest = Shared<BoxFuture<'static, Result<Value, RequestError>>>;

struct PendingRequest {
    id: u64,
    future: SharedRequest,
}

enum Lookup {
    Cached(Value),
    InFlight(SharedRequest),
    Started(u64, SharedRequest),
}

/// Findings-page chart payloads. A chart whose request failed is `None` and
/// has a matching entry in `errors`.
#[derive(Debug, Clone, Default)]
pub struct ChartData {
    pub representation_outcomes: Option<Value>,
    pub time_series_analysis: Option<Value>,
    pub chi_square_analysis: Option<Value>,
    pub outcome_percentages: Option<Value>,
    pub countries_chart: Option<Value>,
    pub errors: Vec<ChartError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartError {
    pub chart: &'static str,
    pub error: RequestError,
}

/// Client for the statistics backend with response caching, in-flight
/// request sharing and retry with linear backoff.
pub struct ApiService {
    config: ApiConfig,
    transport: Arc<dyn Transport>,
    filters: Arc<FilterService>,
    cache: ResponseCache,
    pending: Mutex<HashMap<String, PendingRequest>>,
    next_request_id: AtomicU64,
}

impl ApiService {
    pub fn new(config: ApiConfig, filters: Arc<FilterService>) -> Self {
        Self::with_transport(config, Arc::new(HttpTransport::new()), filters)
    }

    pub fn with_transport(
        config: ApiConfig,
        transport: Arc<dyn Transport>,
        filters: Arc<FilterService>,
    ) -> Self {
        let cache = ResponseCache::new(config.cache_ttl);
        Self {
            config,
            transport,
            filters,
            cache,
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    pub fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.base_url, endpoint)
    }

    /// Base URL plus endpoint plus every filter not set to `"all"`. Without
    /// explicit filters the current selection of the filter service is used.
    pub fn build_url_with_filters(&self, endpoint: &str, filters: Option<&FilterSet>) -> String {
        let query = match filters {
            Some(filters) => filters.to_query_string(),
            None => self.filters.get_filters().to_query_string(),
        };

        if query.is_empty() {
            self.url(endpoint)
        } else {
            format!("{}?{}", self.url(endpoint), query)
        }
    }

    /// Serves a fresh cached response, joins an identical request already in
    /// flight, or starts a new one with up to `retries` extra attempts.
    pub async fn fetch_with_retry(
        &self,
        url: &str,
        options: &RequestOptions,
        retries: u32,
    ) -> Result<Value, RequestError> {
        let cache_key = cache_key(url, options)?;

        let lookup = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(in_flight) = pending.get(&cache_key) {
                Lookup::InFlight(in_flight.future.clone())
            } else if let Some(data) = self.cache.get(&cache_key) {
                Lookup::Cached(data)
            } else {
                let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
                let future = request_with_backoff(
                    Arc::clone(&self.transport),
                    url.to_string(),
                    options.clone(),
                    self.retry_policy(retries),
                )
                .boxed()
                .shared();
                pending.insert(
                    cache_key.clone(),
                    PendingRequest {
                        id,
                        future: future.clone(),
                    },
                );
                Lookup::Started(id, future)
            }
        };

        match lookup {
            Lookup::Cached(data) => {
                debug!("Using cached data for {}", url);
                Ok(data)
            }
            Lookup::InFlight(request) => {
                debug!("Request already pending for {}, waiting for it", url);
                request.await
            }
            Lookup::Started(id, request) => {
                debug!("Cache miss for {}", url);
                let _pending = PendingGuard {
                    pending: &self.pending,
                    key: &cache_key,
                    id,
                };
                let result = request.await;
                if let Ok(data) = &result {
                    self.cache.insert(cache_key.clone(), data.clone());
                }
                result
            }
        }
    }

    /// Goes to the network even when a cached or in-flight response exists.
    /// The result is not cached.
    pub async fn fetch_uncached(
        &self,
        url: &str,
        options: &RequestOptions,
        retries: u32,
    ) -> Result<Value, RequestError> {
        request_with_backoff(
            Arc::clone(&self.transport),
            url.to_string(),
            options.clone(),
            self.retry_policy(retries),
        )
        .await
    }

    /// Drops every cached response and forgets in-flight requests, so the
    /// next call of each kind goes to the network.
    pub fn clear_cache(&self) {
        self.cache.clear();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("Request cache cleared");
    }

    async fn get(&self, url: String) -> Result<Value, RequestError> {
        self.fetch_with_retry(&url, &RequestOptions::default(), DEFAULT_RETRIES)
            .await
    }

    pub async fn get_overview(&self) -> Result<Value, RequestError> {
        self.get(self.url(OVERVIEW)).await
    }

    pub async fn get_filtered_overview(
        &self,
        filters: Option<&FilterSet>,
    ) -> Result<Value, RequestError> {
        self.get(self.build_url_with_filters(FILTERED_OVERVIEW, filters))
            .await
    }

    pub async fn get_basic_statistics(
        &self,
        filters: Option<&FilterSet>,
    ) -> Result<Value, RequestError> {
        self.get(self.build_url_with_filters(BASIC_STATS, filters))
            .await
    }

    pub async fn get_representation_outcomes(
        &self,
        filters: Option<&FilterSet>,
    ) -> Result<Value, RequestError> {
        self.get(self.build_url_with_filters(REPRESENTATION_OUTCOMES, filters))
            .await
    }

    pub async fn get_time_series_analysis(
        &self,
        filters: Option<&FilterSet>,
    ) -> Result<Value, RequestError> {
        self.get(self.build_url_with_filters(TIME_SERIES, filters))
            .await
    }

    pub async fn get_chi_square_analysis(
        &self,
        filters: Option<&FilterSet>,
    ) -> Result<Value, RequestError> {
        self.get(self.build_url_with_filters(CHI_SQUARE, filters))
            .await
    }

    pub async fn get_outcome_percentages(
        &self,
        filters: Option<&FilterSet>,
    ) -> Result<Value, RequestError> {
        self.get(self.build_url_with_filters(OUTCOME_PERCENTAGES, filters))
            .await
    }

    pub async fn get_countries_chart(
        &self,
        filters: Option<&FilterSet>,
    ) -> Result<Value, RequestError> {
        self.get(self.build_url_with_filters(COUNTRIES, filters))
            .await
    }

    pub async fn get_filter_options(&self) -> Result<Value, RequestError> {
        self.get(self.url(FILTER_OPTIONS)).await
    }

    pub async fn get_data_status(&self) -> Result<Value, RequestError> {
        self.get(self.url(DATA_STATUS)).await
    }

    pub async fn force_reload_data(&self) -> Result<Value, RequestError> {
        self.get(self.url(FORCE_RELOAD)).await
    }

    /// Single attempt, no retries.
    pub async fn health_check(&self) -> Result<Value, RequestError> {
        self.fetch_with_retry(&self.url(HEALTH), &RequestOptions::default(), 0)
            .await
    }

    /// Loads the five findings charts concurrently. Failures are collected
    /// per chart instead of failing the whole batch.
    pub async fn get_all_chart_data(&self, filters: Option<&FilterSet>) -> ChartData {
        let filters = match filters {
            Some(filters) => filters.clone(),
            None => self.filters.get_filters(),
        };
        let filters = Some(&filters);

        let (representation, time_series, chi_square, percentages, countries) = tokio::join!(
            self.get_representation_outcomes(filters),
            self.get_time_series_analysis(filters),
            self.get_chi_square_analysis(filters),
            self.get_outcome_percentages(filters),
            self.get_countries_chart(filters),
        );

        let mut errors = Vec::new();
        let mut settle = |chart: &'static str, result: Result<Value, RequestError>| match result {
            Ok(data) => Some(data),
            Err(error) => {
                warn!("Failed to load {} chart: {}", chart, error);
                errors.push(ChartError { chart, error });
                None
            }
        };

        let representation_outcomes = settle("representation_outcomes", representation);
        let time_series_analysis = settle("time_series_analysis", time_series);
        let chi_square_analysis = settle("chi_square_analysis", chi_square);
        let outcome_percentages = settle("outcome_percentages", percentages);
        let countries_chart = settle("countries_chart", countries);

        ChartData {
            representation_outcomes,
            time_series_analysis,
            chi_square_analysis,
            outcome_percentages,
            countries_chart,
            errors,
        }
    }

    fn retry_policy(&self, retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            delay: self.config.retry_delay,
            timeout: self.config.request_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    retries: u32,
    delay: Duration,
    timeout: Option<Duration>,
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.delay * (attempt + 1)
    }
}

async fn request_with_backoff(
    transport: Arc<dyn Transport>,
    url: String,
    options: RequestOptions,
    policy: RetryPolicy,
) -> Result<Value, RequestError> {
    let mut attempt = 0;

    loop {
        debug!("Making request to {} (attempt {})", url, attempt + 1);
        let outcome = match policy.timeout {
            Some(limit) => timeout(limit, transport.perform_request(&url, &options))
                .await
                .unwrap_or_else(|_| Err(RequestError::Timeout(limit))),
            None => transport.perform_request(&url, &options).await,
        };

        match outcome {
            Ok(data) => return Ok(data),
            Err(e) => {
                warn!("Attempt {} failed for {}: {}", attempt + 1, url, e);
                if attempt >= policy.retries {
                    return Err(e);
                }
                sleep(policy.backoff(attempt)).await;
                attempt += 1;
            }
        }
    }
}

fn cache_key(url: &str, options: &RequestOptions) -> Result<String, RequestError> {
    let options = serde_json::to_string(options)?;
    Ok(format!("{}_{}", url, options))
}

/// Removes the pending entry for a request when its originator finishes,
/// unless the slot has since been taken by a newer request.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<String, PendingRequest>>,
    key: &'a str,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.get(self.key).is_some_and(|entry| entry.id == self.id) {
            pending.remove(self.key);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::time::Instant;

    type Handler = dyn Fn(&str) -> Result<Value, RequestError> + Send + Sync;

    /// In-memory backend that records every call it receives.
    pub(crate) struct ScriptedTransport {
        handler: Box<Handler>,
        latency: Duration,
        calls: Mutex<Vec<(String, Instant)>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new<F>(handler: F) -> Self
        where
            F: Fn(&str) -> Result<Value, RequestError> + Send + Sync + 'static,
        {
            Self {
                handler: Box::new(handler),
                latency: Duration::ZERO,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        pub(crate) fn calls(&self) -> Vec<(String, Instant)> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn perform_request(
            &self,
            url: &str,
            _options: &RequestOptions,
        ) -> Result<Value, RequestError> {
            self.calls
                .lock()
                .unwrap()
                .push((url.to_string(), Instant::now()));
            if !self.latency.is_zero() {
                sleep(self.latency).await;
            }
            (self.handler)(url)
        }
    }

    fn server_error() -> RequestError {
        RequestError::Http {
            status: 500,
            status_text: "Internal Server Error".to_string(),
        }
    }

    fn service(transport: &Arc<ScriptedTransport>) -> ApiService {
        let transport: Arc<dyn Transport> = transport.clone();
        ApiService::with_transport(
            ApiConfig::with_base_url("http://stats.test/api"),
            transport,
            Arc::new(FilterService::new()),
        )
    }

    fn filters(time_period: &str, representation: &str, case_type: &str) -> FilterSet {
        FilterSet {
            time_period: time_period.to_string(),
            representation: representation.to_string(),
            case_type: case_type.to_string(),
        }
    }

    #[test]
    fn url_omits_exactly_the_all_dimensions() {
        let transport = Arc::new(ScriptedTransport::new(|_| Ok(json!({}))));
        let api = service(&transport);

        for time_period in ["all", "biden"] {
            for representation in ["all", "represented"] {
                for case_type in ["all", "asylum"] {
                    let set = filters(time_period, representation, case_type);
                    let url = api.build_url_with_filters("/overview/filtered", Some(&set));

                    assert_eq!(url.contains("time_period="), time_period != "all", "{url}");
                    assert_eq!(url.contains("representation="), representation != "all", "{url}");
                    assert_eq!(url.contains("case_type="), case_type != "all", "{url}");
                    assert_eq!(url.contains('?'), !set.is_unconstrained(), "{url}");
                }
            }
        }
    }

    #[test]
    fn url_uses_current_filters_by_default() {
        let transport = Arc::new(ScriptedTransport::new(|_| Ok(json!({}))));
        let api = service(&transport);
        api.filters.set_filter("representation", "unrepresented");

        assert_eq!(
            api.build_url_with_filters("/data/basic-stats", None),
            "http://stats.test/api/data/basic-stats?representation=unrepresented"
        );
        assert_eq!(
            api.build_url_with_filters("/data/basic-stats", Some(&FilterSet::default())),
            "http://stats.test/api/data/basic-stats"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_identical_requests_share_one_call() {
        let transport = Arc::new(
            ScriptedTransport::new(|_| Ok(json!({"total_cases": 120})))
                .with_latency(Duration::from_millis(200)),
        );
        let api = service(&transport);

        let (first, second) = tokio::join!(
            api.get_filtered_overview(None),
            api.get_filtered_overview(None)
        );

        assert_eq!(first, Ok(json!({"total_cases": 120})));
        assert_eq!(second, Ok(json!({"total_cases": 120})));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_receive_the_same_error() {
        let transport = Arc::new(
            ScriptedTransport::new(|_| Err(server_error())).with_latency(Duration::from_millis(50)),
        );
        let api = service(&transport);
        let url = api.url(HEALTH);
        let options = RequestOptions::default();

        let (first, second) = tokio::join!(
            api.fetch_with_retry(&url, &options, 0),
            api.fetch_with_retry(&url, &options, 0)
        );

        assert_eq!(first, Err(server_error()));
        assert_eq!(second, Err(server_error()));
        assert_eq!(transport.call_count(), 1);
        assert!(api.pending.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn different_options_are_cached_separately() {
        let transport = Arc::new(ScriptedTransport::new(|_| Ok(json!(1))));
        let api = service(&transport);
        let url = api.url(OVERVIEW);

        api.fetch_with_retry(&url, &RequestOptions::default(), 0)
            .await
            .unwrap();
        api.fetch_with_retry(&url, &RequestOptions::default().header("X-Trace", "1"), 0)
            .await
            .unwrap();

        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn responses_are_cached_for_thirty_seconds() {
        let transport = Arc::new(ScriptedTransport::new(|_| Ok(json!({"rows": []}))));
        let api = service(&transport);

        api.get_overview().await.unwrap();
        tokio::time::advance(Duration::from_secs(29)).await;
        api.get_overview().await.unwrap();
        assert_eq!(transport.call_count(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        api.get_overview().await.unwrap();
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_not_cached() {
        let transport = Arc::new(ScriptedTransport::new(|_| Err(server_error())));
        let api = service(&transport);

        assert!(api.health_check().await.is_err());
        assert!(api.health_check().await.is_err());
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cache_forces_a_fresh_fetch() {
        let transport = Arc::new(ScriptedTransport::new(|_| Ok(json!({"loaded": true}))));
        let api = service(&transport);

        api.get_data_status().await.unwrap();
        api.clear_cache();
        api.get_data_status().await.unwrap();

        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cache_detaches_in_flight_requests() {
        let transport = Arc::new(
            ScriptedTransport::new(|_| Ok(json!(1))).with_latency(Duration::from_millis(100)),
        );
        let api = service(&transport);
        let url = api.url(OVERVIEW);
        let options = RequestOptions::default();

        let first = api.fetch_with_retry(&url, &options, 0);
        let second = async {
            sleep(Duration::from_millis(10)).await;
            api.clear_cache();
            assert!(api.pending.lock().unwrap().is_empty());
            api.fetch_with_retry(&url, &options, 0).await
        };
        // The first request finishes at 100ms; the second is still running at 105ms.
        let pending_after_first = async {
            sleep(Duration::from_millis(105)).await;
            api.pending.lock().unwrap().len()
        };

        let (first, second, pending_after_first) = tokio::join!(first, second, pending_after_first);

        assert_eq!(first, Ok(json!(1)));
        assert_eq!(second, Ok(json!(1)));
        assert_eq!(transport.call_count(), 2);
        assert_eq!(pending_after_first, 1);
        assert!(api.pending.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_back_off_linearly() {
        let transport = Arc::new(ScriptedTransport::new(|_| Err(server_error())));
        let api = service(&transport);

        let result = api.get_overview().await;

        assert_eq!(result, Err(server_error()));
        let calls = transport.calls();
        assert_eq!(calls.len(), 3);
        let first_wait = calls[1].1 - calls[0].1;
        let second_wait = calls[2].1 - calls[1].1;
        assert!(first_wait >= Duration::from_secs(1) && first_wait < Duration::from_millis(1100));
        assert!(second_wait >= Duration::from_secs(2) && second_wait < Duration::from_millis(2100));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_after_transient_failure() {
        let attempts = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&attempts);
        let transport = Arc::new(ScriptedTransport::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(RequestError::Transport("connection refused".to_string()))
            } else {
                Ok(json!({"status": "ok"}))
            }
        }));
        let api = service(&transport);

        assert_eq!(api.get_data_status().await, Ok(json!({"status": "ok"})));
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_does_not_retry() {
        let transport = Arc::new(ScriptedTransport::new(|_| Err(server_error())));
        let api = service(&transport);

        assert!(api.health_check().await.is_err());
        assert_eq!(transport.call_count(), 1);
        assert!(transport.calls()[0].0.ends_with("/health"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out() {
        let transport = Arc::new(
            ScriptedTransport::new(|_| Ok(json!({}))).with_latency(Duration::from_secs(60)),
        );
        let api = service(&transport);

        assert_eq!(
            api.health_check().await,
            Err(RequestError::Timeout(Duration::from_secs(15)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn chart_failures_are_collected() {
        let transport = Arc::new(ScriptedTransport::new(|url| {
            if url.contains("chi-square") || url.contains("countries") {
                Err(server_error())
            } else {
                Ok(json!({"url": url}))
            }
        }));
        let api = service(&transport);
        let set = filters("biden", "all", "all");

        let charts = api.get_all_chart_data(Some(&set)).await;

        assert!(charts.representation_outcomes.is_some());
        assert!(charts.time_series_analysis.is_some());
        assert!(charts.outcome_percentages.is_some());
        assert!(charts.chi_square_analysis.is_none());
        assert!(charts.countries_chart.is_none());
        assert_eq!(charts.errors.len(), 2);
        assert_eq!(charts.errors[0].chart, "chi_square_analysis");
        assert_eq!(charts.errors[1].chart, "countries_chart");
        assert!(transport
            .calls()
            .iter()
            .all(|(url, _)| url.ends_with("?time_period=biden")));
    }
}
