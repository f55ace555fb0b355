//! Skill memory: replayable action sequences keyed by a normalised trigger.
//!
//! A skill is recorded when a goal completes and is looked up by the
//! [`signature`] of the next request. A hit replays the stored steps without
//! any planning. Every few saves the oracle is asked, in the background, to
//! generalise the newest skill into a reusable procedure.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SkillLimits;
use crate::error::StoreError;
use crate::oracle::Oracle;
use crate::reply;
use crate::store::RecordStore;
use crate::types::{ActionPlan, BrowsingAction};

/// One replayable step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SkillStep {
    OpenUrl { url: String },
    PageActions { plan: ActionPlan },
}

impl SkillStep {
    /// Only http(s) navigations and page actions are worth replaying.
    pub fn from_action(action: &BrowsingAction) -> Option<Self> {
        match action {
            BrowsingAction::OpenUrl { url, .. } if is_http_url(url) => {
                Some(SkillStep::OpenUrl { url: url.clone() })
            }
            BrowsingAction::PageActions { plan } if !plan.actions.is_empty() => {
                Some(SkillStep::PageActions { plan: plan.clone() })
            }
            _ => None,
        }
    }
}

fn is_http_url(url: &str) -> bool {
    let lower = url.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionNode {
    pub condition: String,
    pub action: String,
    pub children: Vec<DecisionNode>,
}

/// Generalised description of a skill, attached after it was saved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SkillRefinement {
    pub generalized_trigger: Option<String>,
    pub algorithm: Vec<String>,
    pub tree: Vec<DecisionNode>,
    pub reusable_subpaths: Vec<String>,
    pub refined_at: Option<DateTime<Utc>>,
}

impl SkillRefinement {
    pub fn is_empty(&self) -> bool {
        self.generalized_trigger
            .as_deref()
            .is_none_or(|t| t.trim().is_empty())
            && self.algorithm.is_empty()
            && self.tree.is_empty()
            && self.reusable_subpaths.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillEntry {
    pub id: String,
    pub trigger: String,
    pub signature: String,
    #[serde(default)]
    pub goal: Option<String>,
    pub steps: Vec<SkillStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub use_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub refinement: Option<SkillRefinement>,
}

/// Fields that [`SkillMemory::update`] may overwrite.
#[derive(Debug, Clone, Default)]
pub struct SkillPatch {
    pub trigger: Option<String>,
    pub goal: Option<String>,
    pub steps: Option<Vec<SkillStep>>,
    pub refinement: Option<SkillRefinement>,
}

/// Lower-cased, non-alphanumerics collapsed to single spaces, trimmed.
pub fn signature(trigger: &str) -> String {
    trigger
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Collapse consecutive duplicates, then cap the length.
pub fn normalize_steps(steps: Vec<SkillStep>, max_steps: usize) -> Vec<SkillStep> {
    let mut steps = steps;
    steps.dedup();
    steps.truncate(max_steps);
    steps
}

fn bump(timestamp: &mut DateTime<Utc>) {
    let now = Utc::now();
    if now > *timestamp {
        *timestamp = now;
    }
}

/// Result of [`SkillMemory::save`].
#[derive(Debug, Clone)]
pub struct SavedSkill {
    pub entry: SkillEntry,
    /// This save crossed a refinement boundary.
    pub refine: bool,
}

/// In-memory view of the skill store, written through on every change.
pub struct SkillMemory {
    store: Arc<dyn RecordStore<SkillEntry>>,
    /// Newest-created first.
    entries: Mutex<Vec<SkillEntry>>,
    /// Saves since this memory was opened. Not persisted, so the refinement
    /// cadence restarts with every session.
    saves: AtomicU64,
    limits: SkillLimits,
}

impl SkillMemory {
    pub async fn open(
        store: Arc<dyn RecordStore<SkillEntry>>,
        limits: SkillLimits,
    ) -> Result<Self, StoreError> {
        let mut entries = store.load_all().await?;
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let mut seen = HashSet::new();
        entries.retain(|entry| seen.insert(entry.signature.clone()));
        entries.truncate(limits.max_entries);
        debug!(skills = entries.len(), "skill memory loaded");
        Ok(Self {
            store,
            entries: Mutex::new(entries),
            saves: AtomicU64::new(0),
            limits,
        })
    }

    async fn persist(&self, entries: &[SkillEntry]) -> Result<(), StoreError> {
        self.store.replace_all(entries).await.inspect_err(|err| {
            warn!(error = %err, "failed to persist skills");
        })
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn list(&self) -> Vec<SkillEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<SkillEntry> {
        self.entries.lock().await.iter().find(|e| e.id == id).cloned()
    }

    /// Skill whose signature equals the signature of `text`.
    pub async fn find(&self, text: &str) -> Option<SkillEntry> {
        let wanted = signature(text);
        if wanted.is_empty() {
            return None;
        }
        self.entries
            .lock()
            .await
            .iter()
            .find(|entry| entry.signature == wanted)
            .cloned()
    }

    /// Record a successful step sequence. An existing signature is updated in
    /// place; a new one may evict the oldest-created skill. Returns `None`
    /// when nothing replayable is left after collapsing duplicates.
    pub async fn save(
        &self,
        trigger: &str,
        signature: &str,
        goal: Option<&str>,
        steps: Vec<SkillStep>,
    ) -> Result<Option<SavedSkill>, StoreError> {
        let steps = normalize_steps(steps, self.limits.max_steps);
        let signature = signature.trim();
        if steps.is_empty() || signature.is_empty() {
            debug!(trigger, "skill not saved: nothing to replay");
            return Ok(None);
        }

        let mut entries = self.entries.lock().await;
        let entry = if let Some(existing) = entries.iter_mut().find(|e| e.signature == signature) {
            existing.steps = steps;
            existing.trigger = trigger.to_string();
            if let Some(goal) = goal {
                existing.goal = Some(goal.to_string());
            }
            existing.success_count += 1;
            bump(&mut existing.updated_at);
            existing.clone()
        } else {
            let now = Utc::now();
            let entry = SkillEntry {
                id: format!("skill-{:016x}", rand::random::<u64>()),
                trigger: trigger.to_string(),
                signature: signature.to_string(),
                goal: goal.map(str::to_string),
                steps,
                created_at: now,
                updated_at: now,
                last_used_at: None,
                use_count: 0,
                success_count: 1,
                refinement: None,
            };
            entries.insert(0, entry.clone());
            while entries.len() > self.limits.max_entries {
                if let Some(evicted) = entries.pop() {
                    info!(skill_id = %evicted.id, trigger = %evicted.trigger, "evicted oldest skill");
                }
            }
            entry
        };
        self.persist(&entries).await?;
        drop(entries);

        let saves = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        let refine = self.limits.refine_every > 0 && saves % self.limits.refine_every == 0;
        info!(skill_id = %entry.id, signature = %entry.signature, steps = entry.steps.len(), "skill saved");
        Ok(Some(SavedSkill { entry, refine }))
    }

    /// Count a replay of `id`.
    pub async fn record_use(&self, id: &str) -> Result<Option<SkillEntry>, StoreError> {
        self.modify(id, |entry| {
            entry.use_count += 1;
            entry.last_used_at = Some(Utc::now());
        })
        .await
    }

    /// Count a replay of `id` that the completion check confirmed.
    pub async fn record_success(&self, id: &str) -> Result<Option<SkillEntry>, StoreError> {
        self.modify(id, |entry| {
            entry.success_count += 1;
            bump(&mut entry.updated_at);
        })
        .await
    }

    pub async fn update(&self, id: &str, patch: SkillPatch) -> Result<Option<SkillEntry>, StoreError> {
        let max_steps = self.limits.max_steps;
        self.modify(id, move |entry| {
            if let Some(trigger) = patch.trigger {
                entry.trigger = trigger;
            }
            if let Some(goal) = patch.goal {
                entry.goal = Some(goal);
            }
            if let Some(steps) = patch.steps {
                let steps = normalize_steps(steps, max_steps);
                if !steps.is_empty() {
                    entry.steps = steps;
                }
            }
            if let Some(refinement) = patch.refinement {
                entry.refinement = Some(refinement);
            }
            bump(&mut entry.updated_at);
        })
        .await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        if entries.len() == before {
            return Ok(false);
        }
        self.persist(&entries).await?;
        info!(skill_id = %id, "skill deleted");
        Ok(true)
    }

    async fn modify<F>(&self, id: &str, change: F) -> Result<Option<SkillEntry>, StoreError>
    where
        F: FnOnce(&mut SkillEntry),
    {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.iter_mut().find(|entry| entry.id == id) else {
            return Ok(None);
        };
        change(entry);
        let updated = entry.clone();
        self.persist(&entries).await?;
        Ok(Some(updated))
    }
}

/// Steps recorded during one goal loop, committed only when the goal completes.
#[derive(Debug, Default)]
pub struct SkillCapture {
    steps: Vec<SkillStep>,
}

impl SkillCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `action` if it is replayable. Returns whether it was kept.
    pub fn record(&mut self, action: &BrowsingAction) -> bool {
        match SkillStep::from_action(action) {
            Some(step) => {
                self.steps.push(step);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn into_steps(self) -> Vec<SkillStep> {
        self.steps
    }
}

/// Background generaliser. At most one refinement per skill id is in flight.
#[derive(Clone)]
pub struct SkillRefiner {
    memory: Arc<SkillMemory>,
    oracle: Arc<dyn Oracle>,
    in_flight: Arc<StdMutex<HashSet<String>>>,
}

struct InFlight {
    id: String,
    set: Arc<StdMutex<HashSet<String>>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.id);
        }
    }
}

impl SkillRefiner {
    pub fn new(memory: Arc<SkillMemory>, oracle: Arc<dyn Oracle>) -> Self {
        Self {
            memory,
            oracle,
            in_flight: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    pub fn is_refining(&self, id: &str) -> bool {
        self.in_flight
            .lock()
            .map(|set| set.contains(id))
            .unwrap_or(false)
    }

    /// Start refining `entry` unless a refinement for it is already running.
    pub fn spawn(&self, entry: SkillEntry) -> Option<JoinHandle<()>> {
        {
            let mut set = self.in_flight.lock().ok()?;
            if !set.insert(entry.id.clone()) {
                debug!(skill_id = %entry.id, "refinement already in flight");
                return None;
            }
        }
        let guard = InFlight {
            id: entry.id.clone(),
            set: self.in_flight.clone(),
        };
        let memory = self.memory.clone();
        let oracle = self.oracle.clone();

        Some(tokio::spawn(async move {
            let _guard = guard;
            let raw = match oracle.refine_skill(&entry).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(skill_id = %entry.id, error = %err, "skill refinement failed");
                    return;
                }
            };
            let Some(mut refinement) = reply::parse_refinement(&raw) else {
                debug!(skill_id = %entry.id, "skill refinement reply was not usable");
                return;
            };
            refinement.refined_at = Some(Utc::now());
            let patch = SkillPatch {
                refinement: Some(refinement),
                ..SkillPatch::default()
            };
            match memory.update(&entry.id, patch).await {
                Ok(Some(_)) => info!(skill_id = %entry.id, "skill refined"),
                Ok(None) => debug!(skill_id = %entry.id, "refined skill no longer exists"),
                Err(err) => warn!(skill_id = %entry.id, error = %err, "failed to store refinement"),
            }
        }))
    }
}
