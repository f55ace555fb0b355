//! Page Surface Adapter.
//!
//! Wraps a renderer handle ([`PageHost`]) with readiness tracking, a single
//! automatic retry for "not ready" failures, and bounded waits for URL changes
//! and navigation settling. Nothing here blocks past its timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::HostError;

/// Navigation lifecycle notifications emitted by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum LifecycleEvent {
    DomReady,
    DidStartLoading,
    DidNavigate { url: String },
    DidNavigateInPage { url: String },
    DidStopLoading,
    DidFailLoad { url: String, error: String },
}

/// A webview or browser tab that can run scripts and load URLs.
#[async_trait]
pub trait PageHost: Send + Sync {
    fn url(&self) -> String;

    async fn execute_javascript(&self, script: &str) -> Result<Value, HostError>;

    async fn load_url(&self, url: &str) -> Result<(), HostError>;

    fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent>;

    fn is_attached(&self) -> bool {
        true
    }

    /// Whether the host has fired its first readiness event.
    fn is_ready(&self) -> bool;
}

/// How a navigation wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleOutcome {
    Event(LifecycleEvent),
    UrlChanged(String),
    TimedOut,
}

impl SettleOutcome {
    pub fn settled(&self) -> bool {
        !matches!(self, SettleOutcome::TimedOut)
    }
}

struct Readiness {
    events: broadcast::Receiver<LifecycleEvent>,
    ready: bool,
}

impl Readiness {
    fn apply(&mut self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::DidStartLoading => self.ready = false,
            LifecycleEvent::DomReady
            | LifecycleEvent::DidStopLoading
            | LifecycleEvent::DidNavigateInPage { .. }
            | LifecycleEvent::DidFailLoad { .. } => self.ready = true,
            LifecycleEvent::DidNavigate { .. } => {}
        }
    }

    fn drain(&mut self, host: &dyn PageHost) {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.apply(&event),
                Err(TryRecvError::Lagged(_)) => self.ready = host.is_ready(),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }
}

struct SurfaceInner {
    host: Arc<dyn PageHost>,
    readiness: Mutex<Readiness>,
    ready_timeout: Duration,
    poll_interval: Duration,
}

/// Cloneable handle over a [`PageHost`].
#[derive(Clone)]
pub struct SurfaceAdapter {
    inner: Arc<SurfaceInner>,
}

impl SurfaceAdapter {
    pub fn new(host: Arc<dyn PageHost>, ready_timeout: Duration, poll_interval: Duration) -> Self {
        let readiness = Readiness {
            events: host.subscribe(),
            ready: host.is_ready(),
        };
        Self {
            inner: Arc::new(SurfaceInner {
                host,
                readiness: Mutex::new(readiness),
                ready_timeout,
                poll_interval,
            }),
        }
    }

    pub fn url(&self) -> String {
        self.inner.host.url()
    }

    pub async fn is_ready(&self) -> bool {
        let mut readiness = self.inner.readiness.lock().await;
        readiness.drain(self.inner.host.as_ref());
        readiness.ready
    }

    /// Wait until the host reports readiness, at most `timeout`.
    pub async fn wait_for_ready(&self, timeout: Duration) -> bool {
        let host = self.inner.host.as_ref();
        let deadline = Instant::now() + timeout;
        let mut readiness = self.inner.readiness.lock().await;
        loop {
            readiness.drain(host);
            if readiness.ready {
                return true;
            }
            match tokio::time::timeout_at(deadline, readiness.events.recv()).await {
                Ok(Ok(event)) => readiness.apply(&event),
                Ok(Err(RecvError::Lagged(_))) => readiness.ready = host.is_ready(),
                Ok(Err(RecvError::Closed)) | Err(_) => {
                    readiness.ready = host.is_attached() && host.is_ready();
                    return readiness.ready;
                }
            }
        }
    }

    async fn mark_not_ready(&self) {
        self.inner.readiness.lock().await.ready = false;
    }

    /// Run `script` in the page. Failures and `null` results both come back as `None`.
    pub async fn execute(&self, script: &str) -> Option<Value> {
        let host = &self.inner.host;
        if !host.is_attached() {
            debug!("script skipped: surface detached");
            return None;
        }
        if !self.is_ready().await {
            debug!("script skipped: surface has not fired dom-ready");
            return None;
        }
        match host.execute_javascript(script).await {
            Ok(value) => non_null(value),
            Err(err) if err.is_not_ready() => {
                debug!(error = %err, "surface not ready, retrying once after readiness wait");
                self.mark_not_ready().await;
                if !self.wait_for_ready(self.inner.ready_timeout).await {
                    warn!("surface did not become ready within {:?}", self.inner.ready_timeout);
                    return None;
                }
                match host.execute_javascript(script).await {
                    Ok(value) => non_null(value),
                    Err(err) => {
                        warn!(error = %err, "script failed after retry");
                        None
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "script execution failed");
                None
            }
        }
    }

    pub async fn navigate(&self, url: &str) -> Result<(), HostError> {
        debug!(%url, "loading url");
        self.inner.host.load_url(url).await
    }

    /// Poll the URL until it differs from `before_url`. Returns the new URL, if any.
    pub async fn wait_for_url_change(&self, before_url: &str, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        let mut poll = tokio::time::interval(self.inner.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let current = self.url();
            if current != before_url {
                return Some(current);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::select! {
                _ = poll.tick() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Subscribe to lifecycle events now, before triggering a possible navigation.
    pub fn watch(&self) -> NavigationWatch {
        NavigationWatch {
            events: self.inner.host.subscribe(),
            surface: self.clone(),
        }
    }
}

fn non_null(value: Value) -> Option<Value> {
    (!value.is_null()).then_some(value)
}

/// Scripts return structured data as JSON strings; accept either form.
pub fn decode_json(value: Value) -> Value {
    match value {
        Value::String(text) => {
            let trimmed = text.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            } else {
                Value::String(text)
            }
        }
        other => other,
    }
}

/// Pending wait for a navigation that an action may have started.
pub struct NavigationWatch {
    events: broadcast::Receiver<LifecycleEvent>,
    surface: SurfaceAdapter,
}

impl NavigationWatch {
    /// Resolve on the first lifecycle event or URL change, or give up after `timeout`.
    pub async fn settle(mut self, before_url: &str, timeout: Duration) -> SettleOutcome {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(self.surface.inner.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    debug!(url = %before_url, "navigation wait timed out");
                    return SettleOutcome::TimedOut;
                }
                received = self.events.recv(), if events_open => match received {
                    Ok(LifecycleEvent::DidStartLoading) => {}
                    Ok(event) => return SettleOutcome::Event(event),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => events_open = false,
                },
                _ = poll.tick() => {
                    let current = self.surface.url();
                    if current != before_url {
                        return SettleOutcome::UrlChanged(current);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct ScriptedHost {
        url: StdMutex<String>,
        ready: AtomicBool,
        fail_not_ready_once: AtomicBool,
        calls: AtomicUsize,
        events: broadcast::Sender<LifecycleEvent>,
    }

    impl ScriptedHost {
        fn new(ready: bool) -> Arc<Self> {
            let (events, _) = broadcast::channel(32);
            Arc::new(Self {
                url: StdMutex::new("about:blank".into()),
                ready: AtomicBool::new(ready),
                fail_not_ready_once: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
                events,
            })
        }
    }

    #[async_trait]
    impl PageHost for ScriptedHost {
        fn url(&self) -> String {
            self.url.lock().unwrap().clone()
        }

        async fn execute_javascript(&self, _script: &str) -> Result<Value, HostError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_not_ready_once.swap(false, Ordering::SeqCst) {
                let _ = self.events.send(LifecycleEvent::DomReady);
                return Err(HostError::NotReady("dom-ready not emitted".into()));
            }
            Ok(Value::from(42))
        }

        async fn load_url(&self, url: &str) -> Result<(), HostError> {
            *self.url.lock().unwrap() = url.to_string();
            let _ = self.events.send(LifecycleEvent::DidStartLoading);
            let _ = self.events.send(LifecycleEvent::DidNavigate { url: url.into() });
            let _ = self.events.send(LifecycleEvent::DomReady);
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
            self.events.subscribe()
        }

        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }
    }

    fn adapter(host: Arc<ScriptedHost>) -> SurfaceAdapter {
        SurfaceAdapter::new(host, Duration::from_millis(200), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn execute_fails_fast_before_first_ready() {
        let host = ScriptedHost::new(false);
        let surface = adapter(host.clone());
        assert_eq!(surface.execute("1").await, None);
        assert_eq!(host.calls.load(Ordering::SeqCst), 0);

        let _ = host.events.send(LifecycleEvent::DomReady);
        assert_eq!(surface.execute("1").await, Some(Value::from(42)));
    }

    #[tokio::test]
    async fn not_ready_error_is_retried_once() {
        let host = ScriptedHost::new(true);
        host.fail_not_ready_once.store(true, Ordering::SeqCst);
        let surface = adapter(host.clone());
        assert_eq!(surface.execute("1").await, Some(Value::from(42)));
        assert_eq!(host.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn url_change_wait_is_bounded() {
        let host = ScriptedHost::new(true);
        let surface = adapter(host.clone());
        let started = Instant::now();
        assert_eq!(surface.wait_for_url_change("about:blank", Duration::from_millis(60)).await, None);
        assert!(started.elapsed() < Duration::from_secs(1));

        *host.url.lock().unwrap() = "https://example.com/".into();
        assert_eq!(
            surface.wait_for_url_change("about:blank", Duration::from_millis(60)).await,
            Some("https://example.com/".into())
        );
    }

    #[tokio::test]
    async fn settle_prefers_lifecycle_events() {
        let host = ScriptedHost::new(true);
        let surface = adapter(host.clone());
        let watch = surface.watch();
        surface.navigate("https://example.com/").await.unwrap();
        let outcome = watch.settle("about:blank", Duration::from_millis(500)).await;
        assert!(outcome.settled());
        assert!(surface.is_ready().await);

        let watch = surface.watch();
        let outcome = watch.settle("https://example.com/", Duration::from_millis(40)).await;
        assert_eq!(outcome, SettleOutcome::TimedOut);
    }

    #[test]
    fn decodes_stringified_json() {
        assert_eq!(decode_json(Value::from("{\"a\":1}"))["a"], 1);
        assert_eq!(decode_json(Value::from("plain")), Value::from("plain"));
        assert_eq!(decode_json(Value::from("{broken")), Value::from("{broken"));
    }
}
