use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-item text cap applied to schema fields.
pub const SCHEMA_TEXT_MAX_CHARS: usize = 160;
/// Raw page text handed to the completion check.
pub const PAGE_CONTENT_MAX_CHARS: usize = 6000;

/// Goal outline produced once per fresh request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalPlan {
    pub goal: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default, alias = "success_criteria")]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub questions: Vec<String>,
}

impl GoalPlan {
    /// Plan used when the oracle gives nothing usable: the request is the goal.
    pub fn from_request(request: &str) -> Self {
        Self {
            goal: request.trim().to_string(),
            ..Self::default()
        }
    }

    pub fn outline_step(&self, step: usize) -> Option<&str> {
        self.steps
            .get(step.saturating_sub(1))
            .or_else(|| self.steps.last())
            .map(String::as_str)
    }
}

/// Oracle verdict on whether the goal is satisfied by the current page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalCheck {
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default, alias = "needs_user_input")]
    pub needs_user_input: bool,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub evidence: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl GoalCheck {
    pub fn wants_input(&self) -> bool {
        self.needs_user_input || self.question.as_deref().is_some_and(|q| !q.trim().is_empty())
    }
}

/// One browsing decision proposed by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowsingAction {
    OpenUrl {
        url: String,
        #[serde(default, rename = "inNewTab", alias = "in_new_tab")]
        in_new_tab: bool,
    },
    Search {
        query: String,
    },
    SuggestSites {
        #[serde(default)]
        suggestions: Vec<SiteSuggestion>,
    },
    PageActions {
        plan: ActionPlan,
    },
    CreateSite {
        prompt: String,
        #[serde(default, rename = "creationType", alias = "creation_type")]
        creation_type: Option<String>,
    },
}

impl BrowsingAction {
    pub fn kind(&self) -> &'static str {
        match self {
            BrowsingAction::OpenUrl { .. } => "open_url",
            BrowsingAction::Search { .. } => "search",
            BrowsingAction::SuggestSites { .. } => "suggest_sites",
            BrowsingAction::PageActions { .. } => "page_actions",
            BrowsingAction::CreateSite { .. } => "create_site",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteSuggestion {
    #[serde(default)]
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Planner reply: zero or more actions plus optional free text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatBrowsingPlan {
    #[serde(default)]
    pub actions: Vec<BrowsingAction>,
    #[serde(default)]
    pub response: Option<String>,
}

impl ChatBrowsingPlan {
    pub fn page_actions(&self) -> Option<&ActionPlan> {
        self.actions.iter().find_map(|action| match action {
            BrowsingAction::PageActions { plan } if !plan.actions.is_empty() => Some(plan),
            _ => None,
        })
    }

    pub fn suggestions(&self) -> Vec<&SiteSuggestion> {
        self.actions
            .iter()
            .filter_map(|action| match action {
                BrowsingAction::SuggestSites { suggestions } => Some(suggestions.iter()),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Type,
    Select,
    Scroll,
    Press,
    Focus,
}

/// Scroll destination: a pixel offset or a keyword such as `top`/`bottom`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScrollTarget {
    Offset(f64),
    Named(String),
}

/// A primitive DOM operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<ScrollTarget>,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            selector: None,
            text: None,
            value: None,
            key: None,
            by: None,
            to: None,
        }
    }

    pub fn click(selector: impl Into<String>) -> Self {
        Self::new(ActionKind::Click).with_selector(selector)
    }

    pub fn focus(selector: impl Into<String>) -> Self {
        Self::new(ActionKind::Focus).with_selector(selector)
    }

    pub fn type_text(selector: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::new(ActionKind::Type).with_selector(selector)
        }
    }

    pub fn press(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::new(ActionKind::Press)
        }
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    /// Missing operands make an action malformed; it is skipped, not sent.
    pub fn is_well_formed(&self) -> bool {
        match self.kind {
            ActionKind::Click | ActionKind::Focus => true,
            ActionKind::Type => self.text.is_some() || self.value.is_some(),
            ActionKind::Select => self.value.is_some() || self.text.is_some(),
            ActionKind::Press => self.key.as_deref().is_some_and(|k| !k.is_empty()),
            ActionKind::Scroll => self.by.is_some() || self.to.is_some(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionPlan {
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl ActionPlan {
    pub fn new(actions: Vec<Action>) -> Self {
        Self {
            actions,
            notes: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Ok,
    NotFound,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action: Action,
    pub status: ActionStatus,
}

/// Outcome of running an [`ActionPlan`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub executed: usize,
    pub attempted: usize,
    pub results: Vec<ActionResult>,
}

impl ExecutionReport {
    pub fn from_results(results: Vec<ActionResult>) -> Self {
        Self {
            executed: results
                .iter()
                .filter(|r| r.status == ActionStatus::Ok)
                .count(),
            attempted: results.len(),
            results,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputSummary {
    pub selector: String,
    pub tag: String,
    #[serde(rename = "type")]
    pub input_type: String,
    pub name: String,
    pub label: String,
    pub placeholder: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElementSummary {
    pub selector: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSummary {
    pub selector: String,
    pub text: String,
    pub href: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadingSummary {
    pub level: u8,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormSummary {
    pub selector: String,
    pub action: String,
    pub method: String,
    pub fields: usize,
}

/// Bounded, selector-annotated structural summary of a page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PageSchema {
    pub title: String,
    pub url: String,
    pub inputs: Vec<InputSummary>,
    pub buttons: Vec<ElementSummary>,
    pub links: Vec<LinkSummary>,
    pub headings: Vec<HeadingSummary>,
    pub forms: Vec<FormSummary>,
    pub html_snippet: String,
}

impl PageSchema {
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
            && self.buttons.is_empty()
            && self.links.is_empty()
            && self.headings.is_empty()
            && self.forms.is_empty()
    }
}

/// What the completion check sees of the current page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageState {
    pub url: String,
    pub title: String,
    pub content: String,
}

/// Short-lived memory of the previous turn, used to read short replies as continuations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingFollowUp {
    pub goal_text: String,
    pub last_user_message: String,
    pub last_assistant_message: String,
    #[serde(default)]
    pub plan_steps: Option<Vec<String>>,
    #[serde(default)]
    pub success_criteria: Option<Vec<String>>,
    #[serde(default)]
    pub last_action_summary: Option<String>,
    pub url: String,
    pub title: String,
    pub completed: bool,
    pub asked_at: DateTime<Utc>,
    pub requires_follow_up: bool,
}
