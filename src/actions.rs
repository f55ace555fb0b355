//! Action Plan Executor.
//!
//! A whole [`ActionPlan`] is sent to the page as one script. Each action is
//! resolved and dispatched the way a person would trigger it, and reports its
//! own status; per-action failures never fail the plan.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;
use tracing::{debug, warn};

use crate::events::{EngineEvent, EventSender};
use crate::surface::{SurfaceAdapter, decode_json};
use crate::types::{Action, ActionKind, ActionPlan, ActionResult, ActionStatus, ExecutionReport};

/// Marker the action script starts with.
pub const ACTIONS_SCRIPT_MARKER: &str = "/*pagepilot:actions*/";
/// Prefix of the script line carrying the JSON action payload.
pub const ACTIONS_PAYLOAD_PREFIX: &str = "const actions = ";

/// Per-action dispatch. `null` entries were rejected as malformed before sending.
///
///   - click: `el.click()`
///   - focus: `el.focus()`
///   - type/select: native value setter, then `input` + `change` events
///   - press: keydown/keypress/keyup on the target (focused element when no
///     selector); `Enter` also submits the enclosing form
///   - scroll: `scrollBy` for `by`, `scrollTo` for `to` (`top`, `bottom`,
///     a pixel offset, or a selector to bring into view)
const ACTIONS_JS_BODY: &str = r#"
  const find = (sel) => { try { return document.querySelector(sel); } catch (e) { return null; } };
  const resolve = (a) => {
    if (a.selector) return find(a.selector);
    if (a.type === 'press') return document.activeElement || document.body;
    if (a.type === 'scroll') return window;
    return null;
  };
  const setValue = (el, value) => {
    if (el.isContentEditable) {
      el.focus();
      el.textContent = value;
    } else {
      const proto = el instanceof HTMLTextAreaElement ? HTMLTextAreaElement.prototype
        : el instanceof HTMLSelectElement ? HTMLSelectElement.prototype
        : HTMLInputElement.prototype;
      const desc = Object.getOwnPropertyDescriptor(proto, 'value');
      if (desc && desc.set && el instanceof proto.constructor) desc.set.call(el, value); else el.value = value;
    }
    el.dispatchEvent(new Event('input', { bubbles: true }));
    el.dispatchEvent(new Event('change', { bubbles: true }));
  };
  const run = (a) => {
    if (!a) return 'skipped';
    const el = resolve(a);
    if (!el) return 'not_found';
    switch (a.type) {
      case 'click':
        if (el.scrollIntoView) el.scrollIntoView({ block: 'center' });
        el.click();
        return 'ok';
      case 'focus':
        el.focus();
        return 'ok';
      case 'type':
        if (el.focus) el.focus();
        setValue(el, a.text ?? a.value ?? '');
        return 'ok';
      case 'select': {
        const wanted = a.value ?? a.text ?? '';
        if (el instanceof HTMLSelectElement) {
          const opt = [...el.options].find(o => o.value === wanted || o.text.trim() === wanted);
          if (!opt) return 'not_found';
          setValue(el, opt.value);
        } else {
          setValue(el, wanted);
        }
        return 'ok';
      }
      case 'press': {
        const init = { key: a.key, bubbles: true, cancelable: true };
        el.dispatchEvent(new KeyboardEvent('keydown', init));
        el.dispatchEvent(new KeyboardEvent('keypress', init));
        el.dispatchEvent(new KeyboardEvent('keyup', init));
        if (a.key === 'Enter') {
          const form = el.form || (el.closest ? el.closest('form') : null);
          if (form) { try { form.requestSubmit ? form.requestSubmit() : form.submit(); } catch (e) {} }
        }
        return 'ok';
      }
      case 'scroll': {
        if (typeof a.by === 'number') { el.scrollBy(0, a.by); return 'ok'; }
        if (typeof a.to === 'number') { el.scrollTo(0, a.to); return 'ok'; }
        if (a.to === 'top') { el.scrollTo(0, 0); return 'ok'; }
        if (a.to === 'bottom') {
          const height = el === window ? document.body.scrollHeight : el.scrollHeight;
          el.scrollTo(0, height);
          return 'ok';
        }
        const target = find(a.to);
        if (!target) return 'not_found';
        target.scrollIntoView({ block: 'center' });
        return 'ok';
      }
      default:
        return 'skipped';
    }
  };
  return JSON.stringify(actions.map(a => { try { return run(a); } catch (e) { return 'skipped'; } }));
"#;

/// True iff the plan may trigger a navigation, so the caller should wait for the page to settle.
pub fn action_plan_may_navigate(plan: &ActionPlan) -> bool {
    plan.actions.iter().any(|action| {
        matches!(
            action.kind,
            ActionKind::Click | ActionKind::Press | ActionKind::Select
        )
    })
}

fn plan_script(payload: &[Option<&Action>]) -> Option<String> {
    let json = serde_json::to_string(payload).ok()?;
    Some(format!(
        "{ACTIONS_SCRIPT_MARKER}\n(() => {{\n  {ACTIONS_PAYLOAD_PREFIX}{json};\n{ACTIONS_JS_BODY}}})()\n"
    ))
}

fn parse_status(value: &Value) -> ActionStatus {
    match value.as_str() {
        Some("ok") => ActionStatus::Ok,
        Some("not_found") => ActionStatus::NotFound,
        _ => ActionStatus::Skipped,
    }
}

/// Holds one level of the shared busy depth while alive.
pub struct BusyGuard {
    depth: Arc<AtomicUsize>,
    events: Option<EventSender>,
}

impl BusyGuard {
    fn enter(depth: Arc<AtomicUsize>, events: Option<EventSender>) -> Self {
        let now = depth.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(events) = &events {
            let _ = events.send(EngineEvent::Busy { depth: now });
        }
        Self { depth, events }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let now = self.depth.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if let Some(events) = &self.events {
            let _ = events.send(EngineEvent::Busy { depth: now });
        }
    }
}

pub struct ActionExecutor {
    surface: SurfaceAdapter,
    depth: Arc<AtomicUsize>,
    events: Option<EventSender>,
}

impl ActionExecutor {
    pub fn new(surface: SurfaceAdapter) -> Self {
        Self {
            surface,
            depth: Arc::new(AtomicUsize::new(0)),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Current nesting depth of plans and their navigation waits.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Mark the surface busy, e.g. across a navigation wait that follows a plan.
    pub fn enter(&self) -> BusyGuard {
        BusyGuard::enter(self.depth.clone(), self.events.clone())
    }

    /// Run `plan` against the page. Results follow submission order and have
    /// one entry per action; a failure to talk to the page yields an empty report.
    pub async fn execute(&self, plan: &ActionPlan) -> ExecutionReport {
        if plan.actions.is_empty() {
            return ExecutionReport::default();
        }
        let _busy = self.enter();

        let payload: Vec<Option<&Action>> = plan
            .actions
            .iter()
            .map(|action| action.is_well_formed().then_some(action))
            .collect();

        let statuses: Vec<ActionStatus> = if payload.iter().all(Option::is_none) {
            vec![ActionStatus::Skipped; payload.len()]
        } else {
            let Some(script) = plan_script(&payload) else {
                warn!("action plan could not be serialized");
                return ExecutionReport::default();
            };
            let Some(value) = self.surface.execute(&script).await else {
                warn!(actions = plan.actions.len(), "action plan did not reach the page");
                return ExecutionReport::default();
            };
            match decode_json(value) {
                Value::Array(items) => items.iter().map(parse_status).collect(),
                other => {
                    warn!(reply = %other, "action script returned an unexpected shape");
                    return ExecutionReport::default();
                }
            }
        };

        let results: Vec<ActionResult> = plan
            .actions
            .iter()
            .zip(&payload)
            .enumerate()
            .map(|(index, (action, sent))| ActionResult {
                action: action.clone(),
                status: match sent {
                    Some(_) => statuses.get(index).copied().unwrap_or(ActionStatus::Skipped),
                    None => ActionStatus::Skipped,
                },
            })
            .collect();

        let report = ExecutionReport::from_results(results);
        debug!(
            executed = report.executed,
            attempted = report.attempted,
            "action plan finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScrollTarget;

    #[test]
    fn navigation_capable_kinds() {
        assert!(action_plan_may_navigate(&ActionPlan::new(vec![Action::click("a")])));
        assert!(action_plan_may_navigate(&ActionPlan::new(vec![Action::press("Enter")])));
        assert!(!action_plan_may_navigate(&ActionPlan::new(vec![
            Action::focus("#q"),
            Action::type_text("#q", "rust"),
            Action {
                by: Some(300.0),
                ..Action::new(ActionKind::Scroll)
            },
        ])));
        assert!(!action_plan_may_navigate(&ActionPlan::default()));
    }

    #[test]
    fn script_embeds_payload_on_one_line() {
        let action = Action {
            to: Some(ScrollTarget::Named("bottom".into())),
            ..Action::new(ActionKind::Scroll)
        };
        let payload = vec![Some(&action), None];
        let script = plan_script(&payload).unwrap();
        assert!(script.starts_with(ACTIONS_SCRIPT_MARKER));
        let line = script
            .lines()
            .find_map(|line| line.trim().strip_prefix(ACTIONS_PAYLOAD_PREFIX))
            .unwrap();
        let parsed: Vec<Option<Action>> = serde_json::from_str(line.trim_end_matches(';')).unwrap();
        assert_eq!(parsed, vec![Some(action), None]);
    }

    #[test]
    fn unknown_statuses_are_skipped() {
        assert_eq!(parse_status(&Value::from("ok")), ActionStatus::Ok);
        assert_eq!(parse_status(&Value::from("not_found")), ActionStatus::NotFound);
        assert_eq!(parse_status(&Value::from("boom")), ActionStatus::Skipped);
        assert_eq!(parse_status(&Value::Null), ActionStatus::Skipped);
    }
}
