//! Tolerant parsing of raw oracle replies.
//!
//! The oracle answers with either bare JSON or JSON wrapped in a fenced code
//! block, sometimes surrounded by prose. Anything that cannot be read is
//! reported as `None` ("no actionable result"), never as an error.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::skills::SkillRefinement;
use crate::types::{Action, ActionPlan, BrowsingAction, ChatBrowsingPlan, GoalCheck, GoalPlan};

/// Pull the first JSON document out of `text`.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    if let Some(value) = fenced_blocks(trimmed).find_map(|block| serde_json::from_str(block).ok()) {
        return Some(value);
    }
    balanced_span(trimmed, '{', '}')
        .or_else(|| balanced_span(trimmed, '[', ']'))
        .and_then(|span| serde_json::from_str(span).ok())
}

fn fenced_blocks(text: &str) -> impl Iterator<Item = &str> {
    text.split("```").skip(1).step_by(2).map(|block| {
        let block = block.trim_start();
        let block = block
            .strip_prefix("json")
            .or_else(|| block.strip_prefix("JSON"))
            .unwrap_or(block);
        block.trim()
    })
}

fn balanced_span(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

fn parse_as<T: DeserializeOwned>(text: &str) -> Option<T> {
    serde_json::from_value(extract_json(text)?).ok()
}

pub fn parse_goal_plan(text: &str) -> Option<GoalPlan> {
    let mut plan: GoalPlan = parse_as(text)?;
    plan.goal = plan.goal.trim().to_string();
    plan.steps.retain(|s| !s.trim().is_empty());
    plan.success_criteria.retain(|s| !s.trim().is_empty());
    plan.questions.retain(|s| !s.trim().is_empty());
    (!plan.goal.is_empty()).then_some(plan)
}

pub fn parse_goal_check(text: &str) -> Option<GoalCheck> {
    let mut value = extract_json(text)?;
    // Some models answer "completed": "yes".
    for key in ["completed", "needsUserInput", "needs_user_input"] {
        if let Some(flag) = value.get(key).and_then(Value::as_str) {
            let flag = matches!(flag.trim().to_ascii_lowercase().as_str(), "true" | "yes");
            value[key] = Value::Bool(flag);
        }
    }
    serde_json::from_value(value).ok()
}

/// Individual malformed actions are dropped; the rest of the plan survives.
pub fn parse_action_plan(text: &str) -> Option<ActionPlan> {
    action_plan_from_value(&extract_json(text)?)
}

fn action_plan_from_value(value: &Value) -> Option<ActionPlan> {
    let (items, notes) = match value {
        Value::Array(items) => (items.as_slice(), None),
        Value::Object(map) => {
            let inner = map.get("plan").filter(|p| p.is_object()).unwrap_or(value);
            let items = inner.get("actions").and_then(Value::as_array)?;
            let notes = inner.get("notes").and_then(Value::as_str).map(str::to_string);
            (items.as_slice(), notes)
        }
        _ => return None,
    };
    let actions: Vec<Action> = items
        .iter()
        .filter_map(|item| serde_json::from_value(item.clone()).ok())
        .collect();
    Some(ActionPlan { actions, notes })
}

pub fn parse_browsing_plan(text: &str) -> Option<ChatBrowsingPlan> {
    let value = extract_json(text)?;
    let map = value.as_object()?;

    let mut raw_actions: Vec<&Value> = Vec::new();
    if map.contains_key("type") {
        raw_actions.push(&value);
    } else {
        match map.get("actions") {
            Some(Value::Array(items)) => raw_actions.extend(items),
            Some(single @ Value::Object(_)) => raw_actions.push(single),
            _ => {}
        }
        if let Some(single @ Value::Object(_)) = map.get("action") {
            raw_actions.push(single);
        }
    }

    let actions = raw_actions
        .into_iter()
        .filter_map(browsing_action_from_value)
        .collect();
    let response = map
        .get("response")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string);
    Some(ChatBrowsingPlan { actions, response })
}

fn browsing_action_from_value(value: &Value) -> Option<BrowsingAction> {
    if value.get("type").and_then(Value::as_str) == Some("page_actions") {
        let plan = action_plan_from_value(value)?;
        return Some(BrowsingAction::PageActions { plan });
    }
    serde_json::from_value(value.clone()).ok()
}

pub fn parse_refinement(text: &str) -> Option<SkillRefinement> {
    let refinement: SkillRefinement = parse_as(text)?;
    (!refinement.is_empty()).then_some(refinement)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActionKind;

    #[test]
    fn extracts_bare_fenced_and_embedded_json() {
        assert!(extract_json(r#"{"goal":"x"}"#).is_some());
        assert!(extract_json("```json\n{\"goal\":\"x\"}\n```").is_some());
        assert!(extract_json("Sure! Here you go:\n```\n{\"goal\":\"x\"}\n```\nanything else?").is_some());
        assert!(extract_json("The plan is {\"goal\": \"x\"} as requested").is_some());
        assert!(extract_json("I cannot help with that.").is_none());
        assert!(extract_json("   ").is_none());
    }

    #[test]
    fn goal_plan_requires_goal() {
        assert!(parse_goal_plan(r#"{"goal":"  ","steps":["a"]}"#).is_none());
        let plan = parse_goal_plan(
            r#"{"goal":"Find tickets","steps":["open site",""],"success_criteria":["price shown"]}"#,
        )
        .unwrap();
        assert_eq!(plan.steps, vec!["open site"]);
        assert_eq!(plan.success_criteria, vec!["price shown"]);
    }

    #[test]
    fn goal_check_accepts_string_flags() {
        let check = parse_goal_check(r#"{"completed":"yes","response":"Done"}"#).unwrap();
        assert!(check.completed);
        let check = parse_goal_check(r#"{"needsUserInput":true,"question":"Which city?"}"#).unwrap();
        assert!(!check.completed);
        assert!(check.wants_input());
    }

    #[test]
    fn action_plan_drops_unknown_actions() {
        let plan = parse_action_plan(
            r##"{"actions":[{"type":"click","selector":"#a"},{"type":"hover","selector":"#b"}],"notes":"n"}"##,
        )
        .unwrap();
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].kind, ActionKind::Click);
        assert_eq!(plan.notes.as_deref(), Some("n"));

        let plan = parse_action_plan(r#"[{"type":"scroll","by":400}]"#).unwrap();
        assert_eq!(plan.actions[0].by, Some(400.0));
    }

    #[test]
    fn browsing_plan_shapes() {
        let plan = parse_browsing_plan(
            r##"```json
            {"actions":[
                {"type":"open_url","url":"https://news.ycombinator.com"},
                {"type":"teleport"},
                {"type":"page_actions","plan":{"actions":[{"type":"type","selector":"#q","text":"rust"}]}}
            ],"response":"Opening HN"}
            ```"##,
        )
        .unwrap();
        assert_eq!(plan.actions.len(), 2);
        assert_eq!(plan.response.as_deref(), Some("Opening HN"));
        assert!(plan.page_actions().is_some());

        let plan = parse_browsing_plan(r#"{"action":{"type":"search","query":"weather"}}"#).unwrap();
        assert_eq!(
            plan.actions,
            vec![BrowsingAction::Search {
                query: "weather".into()
            }]
        );

        let plan = parse_browsing_plan(r#"{"type":"page_actions","actions":[{"type":"focus","selector":"input"}]}"#)
            .unwrap();
        assert!(plan.page_actions().is_some());
    }
}
