use crate::api::client::RequestOptions;
use crate::error::RequestError;
use crate::models::filters::{
    filter_labels, ActiveFilter, FilterKey, FilterLabels, FilterOptions, FilterSet,
    OptionsResponse,
};
use crate::services::api_service::{ApiService, FILTER_OPTIONS};
use std::collections::HashMap;
use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, error, info};

pub type ListenerError = Box<dyn Error + Send + Sync>;

type Listener =
    dyn Fn(&FilterSet, Option<&FilterOptions>) -> Result<(), ListenerError> + Send + Sync;

#[derive(Default)]
struct FilterState {
    filters: FilterSet,
    available_options: Option<FilterOptions>,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    callbacks: HashMap<u64, Arc<Listener>>,
}

/// Handle returned by [`FilterService::subscribe`].
///
/// Dropping it keeps the listener registered; call [`Subscription::unsubscribe`]
/// to remove it.
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .callbacks
                .remove(&self.id);
        }
    }
}

/// Holds the active filter selection and tells listeners when it changes.
#[derive(Default)]
pub struct FilterService {
    state: Mutex<FilterState>,
    listeners: Arc<Mutex<Listeners>>,
}

impl FilterService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the backend for the valid values of each dimension. If that fails
    /// for any reason the built-in option set is used instead, so the filter
    /// controls stay usable. Listeners are notified either way.
    pub async fn load_filter_options(&self, api: &ApiService) -> FilterOptions {
        let url = api.url(FILTER_OPTIONS);
        let loaded = api
            .fetch_uncached(&url, &RequestOptions::default(), 0)
            .await
            .and_then(|body| {
                serde_json::from_value::<OptionsResponse>(body).map_err(RequestError::from)
            });

        let options = match loaded {
            Ok(response) => {
                info!("Loaded filter options from {}", url);
                response.options
            }
            Err(e) => {
                error!("Error loading filter options, using defaults: {}", e);
                FilterOptions::fallback()
            }
        };

        self.lock_state().available_options = Some(options.clone());
        self.notify_listeners();
        options
    }

    pub fn get_filters(&self) -> FilterSet {
        self.lock_state().filters.clone()
    }

    pub fn get_available_options(&self) -> Option<FilterOptions> {
        self.lock_state().available_options.clone()
    }

    /// Sets one dimension by name. Unknown names and unchanged values are
    /// ignored; returns whether anything changed.
    pub fn set_filter(&self, key: &str, value: &str) -> bool {
        self.set_filters([(key, value)])
    }

    /// Applies a partial update, notifying listeners once if any recognized
    /// dimension changed.
    pub fn set_filters<I, K, V>(&self, updates: I) -> bool
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let changed = {
            let mut state = self.lock_state();
            let mut changed = false;
            for (key, value) in updates {
                match key.as_ref().parse::<FilterKey>() {
                    Ok(key) => changed |= state.filters.set(key, value.as_ref()),
                    Err(e) => debug!("Ignoring {}", e),
                }
            }
            changed
        };

        if changed {
            self.notify_listeners();
        }
        changed
    }

    pub fn clear_filters(&self) {
        self.lock_state().filters = FilterSet::default();
        self.notify_listeners();
    }

    /// Query string of every filter not set to `"all"`, without a leading `?`.
    pub fn to_query_params(&self) -> String {
        self.lock_state().filters.to_query_params()
    }

    /// Replaces the selection with the filters found in a query string.
    /// Both `time_period` and `timePeriod` style names are accepted; missing
    /// dimensions reset to `"all"`.
    pub fn from_query_params(&self, query: &str) -> bool {
        let query = query.strip_prefix('?').unwrap_or(query);
        let params: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();

        let mut parsed = FilterSet::default();
        for key in FilterKey::DIMENSIONS {
            let value = key.param_names().iter().find_map(|name| {
                params
                    .iter()
                    .find(|(param, _)| param.as_str() == *name)
                    .map(|(_, value)| value.as_str())
                    .filter(|value| !value.is_empty())
            });
            if let Some(value) = value {
                parsed.set(key, value);
            }
        }

        self.set_filters(parsed.iter())
    }

    /// Registers a listener called with the current filters and options after
    /// every change.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&FilterSet, Option<&FilterOptions>) -> Result<(), ListenerError>
            + Send
            + Sync
            + 'static,
    {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.callbacks.insert(id, Arc::new(callback));

        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .len()
    }

    fn notify_listeners(&self) {
        let (filters, options) = {
            let state = self.lock_state();
            (state.filters.clone(), state.available_options.clone())
        };
        let callbacks: Vec<Arc<Listener>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .values()
            .cloned()
            .collect();

        for callback in callbacks {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(&filters, options.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Error in filter listener: {}", e),
                Err(_) => error!("Filter listener panicked"),
            }
        }
    }

    pub fn get_filter_labels(&self) -> FilterLabels {
        filter_labels()
    }

    /// Display label for a value; unknown dimensions or values yield the raw value.
    pub fn get_filter_label<'a>(&self, key: &str, value: &'a str) -> &'a str {
        match key.parse::<FilterKey>() {
            Ok(key) => key.label(value),
            Err(_) => value,
        }
    }

    pub fn has_active_filters(&self) -> bool {
        self.lock_state().filters != FilterSet::default()
    }

    pub fn get_active_filters_summary(&self) -> Vec<ActiveFilter> {
        let defaults = FilterSet::default();
        let filters = self.get_filters();

        filters
            .iter()
            .filter(|(key, value)| defaults.get(*key) != *value)
            .map(|(key, value)| ActiveFilter {
                key,
                value: value.to_string(),
                label: key.label(value).to_string(),
            })
            .collect()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, FilterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
