use std::rc::Rc;
use std::time::Duration;

use tokio::time::Instant;

use crate::common::backoff::Backoff;
use crate::k8s::Crd;
use crate::k8s::api::{CustomObjectApi, Scope, WatchEvent};

/// Resource version that asks the API server for the current state of the collection.
pub const INITIAL_RESOURCE_VERSION: &str = "0";

pub type WatchCallback = Box<dyn FnMut(WatchEvent)>;

/// Position of a watch in the event stream of its collection.
#[derive(Debug)]
pub struct WatchCursor {
    resource_version: String,
    backoff: Backoff,
    /// Set after a failed request, no request is made before this instant.
    retry_at: Option<Instant>,
}

impl WatchCursor {
    pub fn new(resource_version: String, backoff: Backoff) -> Self {
        Self {
            resource_version,
            backoff,
            retry_at: None,
        }
    }

    pub fn resource_version(&self) -> &str {
        &self.resource_version
    }

    fn reset(&mut self) {
        self.resource_version = INITIAL_RESOURCE_VERSION.to_string();
    }

    fn advance(&mut self, resource_version: &str) {
        self.resource_version = resource_version.to_string();
    }

    fn can_poll(&self, now: Instant) -> bool {
        self.retry_at.map(|at| now >= at).unwrap_or(true)
    }

    fn on_failure(&mut self, now: Instant) -> Duration {
        let delay = self.backoff.on_failure();
        self.retry_at = Some(now + delay);
        delay
    }

    fn on_success(&mut self) {
        self.backoff.on_success();
        self.retry_at = None;
    }
}

enum Delivery {
    Completed,
    /// The server forgot our resource version, the watch has to start over.
    Gone,
}

/// Watches one collection and hands every event to a callback, in delivery order.
pub struct ResourceWatch {
    api: Rc<dyn CustomObjectApi>,
    crd: Crd,
    namespace: String,
    cursor: WatchCursor,
    callback: WatchCallback,
}

impl ResourceWatch {
    pub fn new(
        api: Rc<dyn CustomObjectApi>,
        crd: Crd,
        namespace: &str,
        cursor: WatchCursor,
        callback: WatchCallback,
    ) -> Self {
        Self {
            api,
            crd,
            namespace: namespace.to_string(),
            cursor,
            callback,
        }
    }

    pub fn cursor(&self) -> &WatchCursor {
        &self.cursor
    }

    /// Runs one watch window. A stale resource version restarts the watch from scratch
    /// right away, but only once per poll; a second stale answer waits for the next one.
    pub async fn poll(&mut self) {
        if !self.cursor.can_poll(Instant::now()) {
            return;
        }
        let mut restarted = false;
        loop {
            let result = self
                .api
                .watch(
                    &self.crd,
                    Scope::Namespaced(&self.namespace),
                    self.cursor.resource_version(),
                )
                .await;
            let delivery = match result {
                Ok(events) => {
                    self.cursor.on_success();
                    self.deliver(events)
                }
                Err(error) if error.is_gone() => {
                    log::debug!(
                        "Resource version of {} watch is too old, restarting from {INITIAL_RESOURCE_VERSION}: {error}",
                        self.crd.plural
                    );
                    self.cursor.reset();
                    Delivery::Gone
                }
                Err(error) => {
                    let delay = self.cursor.on_failure(Instant::now());
                    log::warn!(
                        "Watch of {} failed, retrying in {}: {error}",
                        self.crd.plural,
                        humantime::format_duration(delay)
                    );
                    return;
                }
            };
            match delivery {
                Delivery::Gone if !restarted => restarted = true,
                _ => return,
            }
        }
    }

    fn deliver(&mut self, events: Vec<WatchEvent>) -> Delivery {
        for event in events {
            match &event {
                WatchEvent::Error { code: 410, message } => {
                    log::debug!(
                        "Resource version of {} watch is too old, restarting from {INITIAL_RESOURCE_VERSION}: {message}",
                        self.crd.plural
                    );
                    self.cursor.reset();
                    return Delivery::Gone;
                }
                WatchEvent::Error { code, message } => {
                    log::warn!("Watch of {} reported error {code}: {message}", self.crd.plural);
                    continue;
                }
                _ => {}
            }
            if let Some(version) = event.resource_version() {
                self.cursor.advance(version);
            }
            if !matches!(event, WatchEvent::Bookmark { .. }) {
                (self.callback)(event);
            }
        }
        Delivery::Completed
    }
}

/// All watches of the service. They are polled together, from one periodic trigger.
#[derive(Default)]
pub struct Watchers {
    watches: Vec<ResourceWatch>,
}

impl Watchers {
    pub fn add_watch(&mut self, watch: ResourceWatch) {
        self.watches.push(watch);
    }

    pub async fn poll_all(&mut self) {
        for watch in &mut self.watches {
            watch.poll().await;
        }
    }
}

/// Polls every registered watch each `interval`, forever.
pub async fn watchers_process(mut watchers: Watchers, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        watchers.poll_all().await;
    }
}
