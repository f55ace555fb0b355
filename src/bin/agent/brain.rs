use anyhow::{Result, anyhow};
use async_trait::async_trait;
use pagepilot::OracleError;
use pagepilot::oracle::{AnswerContext, CompletionQuery, Oracle, PageContext};
use pagepilot::skills::SkillEntry;
use pagepilot::types::PageSchema;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const GOAL_PROMPT: &str = r#"You turn a browsing request into a goal outline.
Reply with ONLY a JSON object:
{"goal":"...","steps":["..."],"successCriteria":["..."],"questions":[]}
Only add questions when the request cannot be attempted without an answer."#;

const CHECK_PROMPT: &str = r#"You judge whether a browsing goal is satisfied by the current page.
Reply with ONLY a JSON object:
{"completed":true|false,"response":"message for the user","needsUserInput":false,"question":null,"evidence":"what on the page shows it","confidence":0.0}
Judge against the success criteria when given. Ask a question only when the user must decide something."#;

const BROWSING_PROMPT: &str = r#"You choose the next browsing action toward a goal.
Reply with ONLY a JSON object {"actions":[...],"response":"optional text"} where each action is one of:
- {"type":"open_url","url":"https://...","inNewTab":false}
- {"type":"search","query":"..."}
- {"type":"suggest_sites","suggestions":[{"title":"...","url":"...","reason":"..."}]}
- {"type":"page_actions","plan":{"actions":[{"type":"click|type|select|scroll|press|focus","selector":"css","text":"...","value":"...","key":"Enter","by":400,"to":"bottom"}]}}
Prefer page_actions on the current page when it is relevant. Use selectors from the schema."#;

const PAGE_ACTIONS_PROMPT: &str = r#"You plan DOM actions for the current page.
Reply with ONLY a JSON object {"actions":[{"type":"click|type|select|scroll|press|focus","selector":"css",...}],"notes":"..."}.
Use only selectors present in the schema."#;

const REFINE_PROMPT: &str = r#"You generalise a recorded browser skill into a reusable procedure.
Reply with ONLY a JSON object:
{"generalizedTrigger":"...","algorithm":["..."],"tree":[{"condition":"...","action":"...","children":[]}],"reusableSubpaths":["..."]}"#;

const ANSWER_PROMPT: &str = r#"You answer the user's request from the page content given.
Reply with plain text, concise, citing what the page says."#;

/// OpenAI-compatible chat-completions client behind the [`Oracle`] endpoints.
pub struct OpenAiOracle {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiOracle {
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY not set in environment"))?;
        let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            client: Client::new(),
            api_key,
            model,
            base_url,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        endpoint: &'static str,
        system: &str,
        user: String,
    ) -> Result<String, OracleError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user},
                ],
                "temperature": 0.2,
            }))
            .send()
            .await
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;

        if !status.is_success() {
            let message = body["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error")
                .to_string();
            warn!(endpoint, %status, %message, "oracle api error");
            return Err(OracleError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(OracleError::Empty)?;
        debug!(endpoint, reply = %content, "oracle replied");
        Ok(content.to_string())
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

#[async_trait]
impl Oracle for OpenAiOracle {
    async fn plan_goal(&self, request: &str) -> Result<String, OracleError> {
        self.complete("plan_goal", GOAL_PROMPT, format!("Request: {request}"))
            .await
    }

    async fn check_goal_completion(&self, query: &CompletionQuery) -> Result<String, OracleError> {
        self.complete("check_goal_completion", CHECK_PROMPT, to_json(query))
            .await
    }

    async fn plan_browsing_action(
        &self,
        request: &str,
        context: &PageContext,
    ) -> Result<String, OracleError> {
        let user = format!("Request: {request}\n\nContext:\n{}", to_json(context));
        self.complete("plan_browsing_action", BROWSING_PROMPT, user)
            .await
    }

    async fn plan_page_actions(
        &self,
        request: &str,
        schema: &PageSchema,
    ) -> Result<String, OracleError> {
        let user = format!("Request: {request}\n\nPage schema:\n{}", to_json(schema));
        self.complete("plan_page_actions", PAGE_ACTIONS_PROMPT, user)
            .await
    }

    async fn refine_skill(&self, entry: &SkillEntry) -> Result<String, OracleError> {
        self.complete("refine_skill", REFINE_PROMPT, to_json(entry))
            .await
    }

    async fn answer(&self, request: &str, context: &AnswerContext) -> Result<String, OracleError> {
        let user = format!("Request: {request}\n\nPage:\n{}", to_json(context));
        self.complete("answer", ANSWER_PROMPT, user).await
    }
}
