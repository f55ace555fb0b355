#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pagepilot::actions::{ACTIONS_PAYLOAD_PREFIX, ACTIONS_SCRIPT_MARKER};
use pagepilot::dom::{PAGE_STATE_SCRIPT_MARKER, SCHEMA_SCRIPT_MARKER};
use pagepilot::oracle::{AnswerContext, CompletionQuery, Oracle, PageContext};
use pagepilot::skills::{SkillEntry, SkillMemory};
use pagepilot::types::PageSchema;
use pagepilot::{
    Copilot, EngineConfig, HostError, LifecycleEvent, MemoryStore, OracleError, PageHost,
    RecordStore, SkillLimits, StoreError, VisitMemory,
};
use serde_json::{Value, json};
use tokio::sync::{Notify, broadcast};

/// Title a simulated site would show.
fn title_for(url: &str) -> String {
    let lower = url.to_lowercase();
    if lower.contains("wikipedia.org") {
        "Wikipedia".into()
    } else if lower.contains("youtube.com/results") {
        "Search results - YouTube".into()
    } else if lower.contains("youtube.com") {
        "YouTube".into()
    } else if lower.contains("google.com/search") {
        "Google Search".into()
    } else if lower.contains("example.com") {
        "Example Shop".into()
    } else if lower.starts_with("about:") {
        String::new()
    } else {
        "Some page".into()
    }
}

/// In-memory page host: navigations succeed instantly and fire the usual
/// lifecycle events; scripts are answered by their leading marker.
pub struct FakeHost {
    url: Mutex<String>,
    events: broadcast::Sender<LifecycleEvent>,
    ready: AtomicBool,
    attached: AtomicBool,
    /// Selectors the page does not contain.
    missing: Mutex<HashSet<String>>,
    /// URL to land on when an action plan clicks or presses something.
    navigate_on_actions: Mutex<Option<String>>,
    pub loads: Mutex<Vec<String>>,
    pub action_batches: Mutex<Vec<Vec<Option<Value>>>>,
    pub scripts: AtomicUsize,
}

impl FakeHost {
    pub fn new(url: &str) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            url: Mutex::new(url.to_string()),
            events,
            ready: AtomicBool::new(true),
            attached: AtomicBool::new(true),
            missing: Mutex::new(HashSet::new()),
            navigate_on_actions: Mutex::new(None),
            loads: Mutex::new(Vec::new()),
            action_batches: Mutex::new(Vec::new()),
            scripts: AtomicUsize::new(0),
        })
    }

    pub fn current_url(&self) -> String {
        self.url.lock().unwrap().clone()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_attached(&self, attached: bool) {
        self.attached.store(attached, Ordering::SeqCst);
    }

    pub fn remove_selector(&self, selector: &str) {
        self.missing.lock().unwrap().insert(selector.to_string());
    }

    pub fn navigate_on_actions(&self, url: &str) {
        *self.navigate_on_actions.lock().unwrap() = Some(url.to_string());
    }

    pub fn loads(&self) -> Vec<String> {
        self.loads.lock().unwrap().clone()
    }

    fn land(&self, url: &str) {
        *self.url.lock().unwrap() = url.to_string();
        let _ = self.events.send(LifecycleEvent::DidStartLoading);
        let _ = self.events.send(LifecycleEvent::DidNavigate { url: url.to_string() });
        let _ = self.events.send(LifecycleEvent::DomReady);
        let _ = self.events.send(LifecycleEvent::DidStopLoading);
    }

    fn schema(&self) -> Value {
        let url = self.current_url();
        json!({
            "title": title_for(&url),
            "url": url,
            "inputs": [{"selector": "#q", "tag": "input", "type": "text", "name": "q",
                        "label": "Search", "placeholder": "Search", "value": ""}],
            "buttons": [{"selector": "#add-to-cart", "text": "Add to cart"}],
            "links": [{"selector": "a.first", "text": "First result", "href": "/first"}],
            "headings": [{"level": 1, "text": title_for(&url)}],
            "forms": [],
            "htmlSnippet": "<main>...</main>"
        })
    }

    fn run_actions(&self, script: &str) -> Result<Value, HostError> {
        let payload = script
            .lines()
            .find_map(|line| line.trim().strip_prefix(ACTIONS_PAYLOAD_PREFIX))
            .ok_or_else(|| HostError::Script("no action payload".into()))?;
        let actions: Vec<Option<Value>> = serde_json::from_str(payload.trim_end_matches(';'))
            .map_err(|e| HostError::Script(e.to_string()))?;
        let missing = self.missing.lock().unwrap().clone();
        let statuses: Vec<&str> = actions
            .iter()
            .map(|action| match action {
                None => "skipped",
                Some(action) => match action.get("selector").and_then(Value::as_str) {
                    Some(selector) if missing.contains(selector) => "not_found",
                    _ => "ok",
                },
            })
            .collect();
        let navigating = actions.iter().zip(&statuses).any(|(action, status)| {
            *status == "ok"
                && action
                    .as_ref()
                    .and_then(|a| a.get("type"))
                    .and_then(Value::as_str)
                    .is_some_and(|kind| matches!(kind, "click" | "press"))
        });
        self.action_batches.lock().unwrap().push(actions);
        if navigating {
            let target = self.navigate_on_actions.lock().unwrap().clone();
            if let Some(target) = target {
                self.land(&target);
            }
        }
        Ok(Value::String(serde_json::to_string(&statuses).unwrap()))
    }
}

#[async_trait]
impl PageHost for FakeHost {
    fn url(&self) -> String {
        self.current_url()
    }

    async fn execute_javascript(&self, script: &str) -> Result<Value, HostError> {
        self.scripts.fetch_add(1, Ordering::SeqCst);
        if script.starts_with(SCHEMA_SCRIPT_MARKER) {
            Ok(Value::String(self.schema().to_string()))
        } else if script.starts_with(PAGE_STATE_SCRIPT_MARKER) {
            let url = self.current_url();
            let state = json!({
                "url": url,
                "title": title_for(&url),
                "content": format!("Content of {url}"),
            });
            Ok(Value::String(state.to_string()))
        } else if script.starts_with(ACTIONS_SCRIPT_MARKER) {
            self.run_actions(script)
        } else {
            Ok(Value::Null)
        }
    }

    async fn load_url(&self, url: &str) -> Result<(), HostError> {
        self.loads.lock().unwrap().push(url.to_string());
        self.land(url);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Scripted oracle with per-endpoint call counters.
#[derive(Default)]
pub struct StubOracle {
    goal: Mutex<Option<String>>,
    checks: Mutex<VecDeque<String>>,
    browsing: Mutex<Option<String>>,
    page_actions: Mutex<Option<String>>,
    answer: Mutex<Option<String>>,
    refinement: Mutex<Option<String>>,
    failing: AtomicBool,
    /// When set, completion checks wait here until notified.
    check_gate: Mutex<Option<Arc<Notify>>>,
    pub plan_goal_calls: AtomicUsize,
    pub check_calls: AtomicUsize,
    pub browsing_calls: AtomicUsize,
    pub page_action_calls: AtomicUsize,
    pub refine_calls: AtomicUsize,
    pub answer_calls: AtomicUsize,
}

impl StubOracle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let oracle = Self::default();
        oracle.failing.store(true, Ordering::SeqCst);
        Arc::new(oracle)
    }

    pub fn set_goal(&self, reply: Value) {
        *self.goal.lock().unwrap() = Some(reply.to_string());
    }

    pub fn push_check(&self, reply: Value) {
        self.checks.lock().unwrap().push_back(reply.to_string());
    }

    /// Completion checks answer `completed: true` with `response`.
    pub fn push_completed(&self, response: &str) {
        self.push_check(json!({"completed": true, "response": response}));
    }

    pub fn set_browsing(&self, reply: Value) {
        *self.browsing.lock().unwrap() = Some(reply.to_string());
    }

    pub fn set_page_actions(&self, reply: Value) {
        *self.page_actions.lock().unwrap() = Some(reply.to_string());
    }

    pub fn set_answer(&self, reply: &str) {
        *self.answer.lock().unwrap() = Some(reply.to_string());
    }

    pub fn set_refinement(&self, reply: Value) {
        *self.refinement.lock().unwrap() = Some(reply.to_string());
    }

    pub fn gate_checks(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.check_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Let later completion checks through; calls already waiting stay parked.
    pub fn ungate_checks(&self) {
        *self.check_gate.lock().unwrap() = None;
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn reply(&self, slot: &Mutex<Option<String>>, fallback: &str) -> Result<String, OracleError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(OracleError::Unavailable("stub offline".into()));
        }
        Ok(slot.lock().unwrap().clone().unwrap_or_else(|| fallback.to_string()))
    }
}

#[async_trait]
impl Oracle for StubOracle {
    async fn plan_goal(&self, request: &str) -> Result<String, OracleError> {
        self.plan_goal_calls.fetch_add(1, Ordering::SeqCst);
        let fallback = json!({"goal": request}).to_string();
        self.reply(&self.goal, &fallback)
    }

    async fn check_goal_completion(&self, _query: &CompletionQuery) -> Result<String, OracleError> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.check_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(OracleError::Unavailable("stub offline".into()));
        }
        let next = self.checks.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| json!({"completed": false}).to_string()))
    }

    async fn plan_browsing_action(
        &self,
        _request: &str,
        _context: &PageContext,
    ) -> Result<String, OracleError> {
        self.browsing_calls.fetch_add(1, Ordering::SeqCst);
        self.reply(&self.browsing, "{}")
    }

    async fn plan_page_actions(
        &self,
        _request: &str,
        _schema: &PageSchema,
    ) -> Result<String, OracleError> {
        self.page_action_calls.fetch_add(1, Ordering::SeqCst);
        self.reply(&self.page_actions, "{\"actions\": []}")
    }

    async fn refine_skill(&self, _entry: &SkillEntry) -> Result<String, OracleError> {
        self.refine_calls.fetch_add(1, Ordering::SeqCst);
        self.reply(&self.refinement, "{}")
    }

    async fn answer(&self, _request: &str, _context: &AnswerContext) -> Result<String, OracleError> {
        self.answer_calls.fetch_add(1, Ordering::SeqCst);
        self.reply(&self.answer, "")
    }
}

/// Defaults with waits short enough for tests.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        navigation_timeout: Duration::from_millis(300),
        ready_timeout: Duration::from_millis(200),
        url_poll_interval: Duration::from_millis(20),
        skills: SkillLimits::default(),
        data_dir: std::env::temp_dir().join("pagepilot-tests"),
        ..EngineConfig::default()
    }
}

/// Skill store whose writes can be made to fail, like a full disk.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore<SkillEntry>,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordStore<SkillEntry> for FlakyStore {
    async fn load_all(&self) -> Result<Vec<SkillEntry>, StoreError> {
        self.inner.load_all().await
    }

    async fn replace_all(&self, records: &[SkillEntry]) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("disk full").into());
        }
        self.inner.replace_all(records).await
    }
}

pub struct Harness {
    pub host: Arc<FakeHost>,
    pub oracle: Arc<StubOracle>,
    pub skills: Arc<SkillMemory>,
    pub skill_store: Arc<FlakyStore>,
    pub copilot: Arc<Copilot>,
}

pub async fn harness(start_url: &str, oracle: Arc<StubOracle>) -> Harness {
    let host = FakeHost::new(start_url);
    let skill_store = Arc::new(FlakyStore::default());
    let skills = Arc::new(
        SkillMemory::open(skill_store.clone(), SkillLimits::default())
            .await
            .unwrap(),
    );
    let visits = Arc::new(VisitMemory::open(Arc::new(MemoryStore::new())).await.unwrap());
    let copilot = Arc::new(Copilot::new(
        host.clone(),
        oracle.clone(),
        skills.clone(),
        visits,
        fast_config(),
    ));
    Harness {
        host,
        oracle,
        skills,
        skill_store,
        copilot,
    }
}
