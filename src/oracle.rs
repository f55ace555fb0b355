//! The LLM text service, seen as an opaque oracle.
//!
//! Every endpoint returns raw text; [`crate::reply`] turns it into typed
//! values. Implementations decide prompts, models and transport.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::OracleError;
use crate::skills::SkillEntry;
use crate::types::{PageSchema, PageState};

/// Input of the completion check.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionQuery {
    pub goal: String,
    pub request: String,
    pub page: PageState,
    pub plan_steps: Vec<String>,
    pub success_criteria: Vec<String>,
    pub last_action_summary: Option<String>,
}

/// Input of the browsing planner.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageContext {
    pub goal: String,
    pub step_index: usize,
    pub outline_step: Option<String>,
    pub plan_steps: Vec<String>,
    pub last_action_summary: Option<String>,
    pub url: String,
    pub title: String,
    pub schema: Option<PageSchema>,
    /// Site-visit memory; withheld once the goal plan has structured steps.
    pub visit_memory: Option<String>,
}

/// Input of the free-form answer endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerContext {
    pub page_content: String,
    pub schema: Option<PageSchema>,
    pub snapshot: Option<String>,
    pub context_notes: Option<String>,
}

#[async_trait]
pub trait Oracle: Send + Sync {
    /// Decompose a request into a goal, step outline and success criteria.
    async fn plan_goal(&self, request: &str) -> Result<String, OracleError>;

    async fn check_goal_completion(&self, query: &CompletionQuery) -> Result<String, OracleError>;

    async fn plan_browsing_action(
        &self,
        request: &str,
        context: &PageContext,
    ) -> Result<String, OracleError>;

    async fn plan_page_actions(
        &self,
        request: &str,
        schema: &PageSchema,
    ) -> Result<String, OracleError>;

    /// Generalise a saved skill into a reusable procedure.
    async fn refine_skill(&self, entry: &SkillEntry) -> Result<String, OracleError>;

    async fn answer(&self, request: &str, context: &AnswerContext) -> Result<String, OracleError>;
}
