//! Per-domain visit memory, handed to the browsing planner as context.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::resolve::{domain_of, is_relevant};
use crate::store::RecordStore;

pub const MAX_VISIT_DOMAINS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitRecord {
    pub domain: String,
    /// Most recent URL seen on this domain.
    pub url: String,
    pub title: String,
    pub visits: u64,
    pub first_visited_at: DateTime<Utc>,
    pub last_visited_at: DateTime<Utc>,
}

pub struct VisitMemory {
    store: Arc<dyn RecordStore<VisitRecord>>,
    records: Mutex<Vec<VisitRecord>>,
    max_domains: usize,
}

impl VisitMemory {
    pub async fn open(store: Arc<dyn RecordStore<VisitRecord>>) -> Result<Self, StoreError> {
        let records = store.load_all().await?;
        debug!(domains = records.len(), "visit memory loaded");
        Ok(Self {
            store,
            records: Mutex::new(records),
            max_domains: MAX_VISIT_DOMAINS,
        })
    }

    pub fn with_capacity(mut self, max_domains: usize) -> Self {
        self.max_domains = max_domains.max(1);
        self
    }

    pub async fn list(&self) -> Vec<VisitRecord> {
        self.records.lock().await.clone()
    }

    /// Count a visit to `url`. Non-http(s) URLs are ignored.
    pub async fn record(&self, url: &str, title: &str) -> Result<Option<VisitRecord>, StoreError> {
        let Some(domain) = domain_of(url) else {
            return Ok(None);
        };
        let now = Utc::now();
        let mut records = self.records.lock().await;
        let record = match records.iter_mut().find(|r| r.domain == domain) {
            Some(existing) => {
                existing.visits += 1;
                existing.url = url.to_string();
                if !title.trim().is_empty() {
                    existing.title = title.trim().to_string();
                }
                if now > existing.last_visited_at {
                    existing.last_visited_at = now;
                }
                existing.clone()
            }
            None => {
                let record = VisitRecord {
                    domain,
                    url: url.to_string(),
                    title: title.trim().to_string(),
                    visits: 1,
                    first_visited_at: now,
                    last_visited_at: now,
                };
                records.push(record.clone());
                if records.len() > self.max_domains {
                    records.sort_by(|a, b| b.last_visited_at.cmp(&a.last_visited_at));
                    records.truncate(self.max_domains);
                }
                record
            }
        };
        if let Err(err) = self.store.replace_all(&records).await {
            warn!(error = %err, "failed to persist visits");
            return Err(err);
        }
        Ok(Some(record))
    }

    /// A few lines about previously visited sites, goal-relevant domains first.
    pub async fn context_for(&self, goal: &str, limit: usize) -> Option<String> {
        let records = self.records.lock().await;
        let mut ranked: Vec<(bool, &VisitRecord)> = records
            .iter()
            .map(|record| (is_relevant(goal, &record.url, &record.title), record))
            .collect();
        ranked.sort_by(|(a_rel, a), (b_rel, b)| {
            b_rel
                .cmp(a_rel)
                .then(b.visits.cmp(&a.visits))
                .then(b.last_visited_at.cmp(&a.last_visited_at))
        });
        let lines: Vec<String> = ranked
            .into_iter()
            .take(limit)
            .map(|(_, record)| {
                let title = if record.title.is_empty() { "untitled" } else { &record.title };
                format!("- {} ({} visits): {} <{}>", record.domain, record.visits, title, record.url)
            })
            .collect();
        (!lines.is_empty()).then(|| format!("Previously visited sites:\n{}", lines.join("\n")))
    }
}
