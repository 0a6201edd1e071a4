//! Task module: the units of crawl work and their payloads
//!
//! - `Task`: work description (handler name + request) plus retry counters
//! - `Request`: the request configuration handed to the transport
//! - `Data`: terminal handler output

mod data;
mod request;

pub use data::Data;
pub use request::{Method, Request};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Range the default priority is drawn from, so that equal-default tasks
/// do not all land on one priority level
pub const DEFAULT_PRIORITY_RANGE: std::ops::RangeInclusive<i32> = 80..=100;

/// Draws a default priority
pub fn random_priority() -> i32 {
    rand::thread_rng().gen_range(DEFAULT_PRIORITY_RANGE)
}

/// A unit of crawl work
///
/// The name selects the handler; the URL (or the explicit request, when set)
/// selects what gets fetched. Everything else is retry bookkeeping and the
/// free-form `extras` bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub url: String,

    /// Explicit request configuration; a GET of `url` is used when absent
    #[serde(default)]
    pub request: Option<Request>,

    /// Lower values dequeue first
    pub priority: i32,
    #[serde(default)]
    pub priority_set_explicitly: bool,

    #[serde(default)]
    pub network_try_count: u32,
    #[serde(default)]
    pub task_try_count: u32,

    /// Time until the task becomes eligible for dequeue
    #[serde(default)]
    pub delay: Option<Duration>,

    #[serde(default)]
    pub refresh_cache: bool,
    #[serde(default)]
    pub disable_cache: bool,

    /// Status codes accepted for this task on top of the crawler-wide set
    #[serde(default)]
    pub valid_status: Vec<u16>,

    #[serde(default)]
    pub extras: BTreeMap<String, Value>,
}

impl Task {
    /// Creates a task fetching `url` with a GET, handled by `name`
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            request: None,
            priority: random_priority(),
            priority_set_explicitly: false,
            network_try_count: 0,
            task_try_count: 1,
            delay: None,
            refresh_cache: false,
            disable_cache: false,
            valid_status: Vec::new(),
            extras: BTreeMap::new(),
        }
    }

    /// Creates a task from an explicit request; the URL is taken from it
    pub fn from_request(name: impl Into<String>, request: Request) -> Self {
        let mut task = Self::new(name, request.url.clone());
        task.request = Some(request);
        task
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self.priority_set_explicitly = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_request(mut self, request: Request) -> Self {
        self.url = request.url.clone();
        self.request = Some(request);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    pub fn with_valid_status(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.valid_status.extend(codes);
        self
    }

    pub fn refresh_cache(mut self) -> Self {
        self.refresh_cache = true;
        self
    }

    pub fn disable_cache(mut self) -> Self {
        self.disable_cache = true;
        self
    }

    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extras.get(key)
    }

    /// The request the transport should execute for this task
    pub fn effective_request(&self) -> Request {
        self.request
            .clone()
            .unwrap_or_else(|| Request::get(self.url.clone()))
    }

    /// Replaces the request configuration, e.g. with a pre-fetch snapshot
    pub fn restore_request(&mut self, snapshot: Request) {
        self.url = snapshot.url.clone();
        self.request = Some(snapshot);
    }

    /// True for GET tasks that may be served from or stored into the cache
    pub fn is_cacheable(&self) -> bool {
        !self.disable_cache && self.effective_request().is_get()
    }

    /// Clones the task for another full try
    ///
    /// The network try counter restarts at zero, the task try counter goes
    /// up by one, and the embedded request object is not carried over.
    /// A priority that was never set explicitly is drawn again.
    pub fn clone_for_retry(&self) -> Self {
        Self {
            name: self.name.clone(),
            url: self.url.clone(),
            request: None,
            priority: if self.priority_set_explicitly {
                self.priority
            } else {
                random_priority()
            },
            priority_set_explicitly: self.priority_set_explicitly,
            network_try_count: 0,
            task_try_count: self.task_try_count + 1,
            delay: self.delay,
            refresh_cache: self.refresh_cache,
            disable_cache: self.disable_cache,
            valid_status: self.valid_status.clone(),
            extras: self.extras.clone(),
        }
    }
}
