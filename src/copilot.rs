//! Goal Planner & Completion Loop.
//!
//! One [`Copilot`] drives one page surface. Each user message is a turn:
//!
//! 1. A message that continues the pending follow-up reuses its goal.
//!    Otherwise skill memory is searched and a hit is replayed without planning.
//! 2. A fresh request is turned into a [`GoalPlan`]. Clarifying questions end
//!    the turn right away.
//! 3. Up to `max_steps` iterations of: read the page, ask whether the goal is
//!    met, plan, resolve one action, execute it and wait for the page.
//!
//! Steps that reached the goal are saved as a skill. Starting a turn cancels
//! the previous one, and every mutation after an await re-checks the token.

use std::future::Future;
use std::sync::{Arc, LazyLock, Mutex as StdMutex};

use chrono::Utc;
use regex::Regex;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actions::{ActionExecutor, action_plan_may_navigate};
use crate::config::EngineConfig;
use crate::dom::SchemaExtractor;
use crate::error::{EngineError, OracleError, Result};
use crate::events::{self, EngineEvent, EventSender};
use crate::followup::{self, FollowUpMemory};
use crate::oracle::{AnswerContext, CompletionQuery, Oracle, PageContext};
use crate::reply;
use crate::resolve::{self, ResolveContext};
use crate::skills::{self, SkillCapture, SkillEntry, SkillMemory, SkillRefiner, SkillStep};
use crate::surface::{PageHost, SettleOutcome, SurfaceAdapter};
use crate::types::{
    ActionPlan, BrowsingAction, ChatBrowsingPlan, ExecutionReport, GoalCheck, GoalPlan, PageSchema,
    PageState, PendingFollowUp,
};
use crate::visits::VisitMemory;

const DONE_SUFFIX: &str = "✅ Task done.";
const VISIT_CONTEXT_LIMIT: usize = 8;

static READS_AS_DONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(✅|\b(task (is )?(done|complete)|done|completed|finished)\b)")
        .expect("valid completion regex")
});

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Completed,
    NeedsInput,
    /// Step budget exhausted, or nothing left to do on a relevant page.
    Inconclusive,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    /// Chat messages emitted by this turn, in order.
    pub messages: Vec<String>,
    /// Goal-loop iterations started.
    pub steps_taken: usize,
    /// Skill replayed or saved by this turn.
    pub skill_id: Option<String>,
    pub replayed: bool,
}

impl TurnOutcome {
    fn new() -> Self {
        Self {
            status: TurnStatus::Inconclusive,
            messages: Vec::new(),
            steps_taken: 0,
            skill_id: None,
            replayed: false,
        }
    }
}

pub struct Copilot {
    oracle: Arc<dyn Oracle>,
    surface: SurfaceAdapter,
    extractor: SchemaExtractor,
    executor: ActionExecutor,
    skills: Arc<SkillMemory>,
    refiner: SkillRefiner,
    visits: Arc<VisitMemory>,
    follow_ups: FollowUpMemory,
    config: EngineConfig,
    events: EventSender,
    current: StdMutex<CancellationToken>,
    turn_lock: Mutex<()>,
}

impl Copilot {
    pub fn new(
        host: Arc<dyn PageHost>,
        oracle: Arc<dyn Oracle>,
        skills: Arc<SkillMemory>,
        visits: Arc<VisitMemory>,
        config: EngineConfig,
    ) -> Self {
        let events = events::channel();
        let surface = SurfaceAdapter::new(host, config.ready_timeout, config.url_poll_interval);
        let extractor = SchemaExtractor::new(surface.clone(), config.schema_ttl);
        let executor = ActionExecutor::new(surface.clone()).with_events(events.clone());
        let refiner = SkillRefiner::new(skills.clone(), oracle.clone());
        let follow_ups = FollowUpMemory::new(config.follow_up_ttl);
        Self {
            oracle,
            surface,
            extractor,
            executor,
            skills,
            refiner,
            visits,
            follow_ups,
            config,
            events,
            current: StdMutex::new(CancellationToken::new()),
            turn_lock: Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    pub fn skills(&self) -> &Arc<SkillMemory> {
        &self.skills
    }

    pub fn visits(&self) -> &Arc<VisitMemory> {
        &self.visits
    }

    /// The follow-up record the next message would be compared against.
    pub fn pending_follow_up(&self) -> Option<PendingFollowUp> {
        self.follow_ups.peek(Utc::now())
    }

    /// Drop the follow-up record so the next message starts a fresh goal.
    pub fn forget_follow_up(&self) {
        self.follow_ups.clear();
    }

    /// Cancel the in-flight turn, if any.
    pub fn stop(&self) {
        if let Ok(current) = self.current.lock() {
            current.cancel();
        }
        info!("stop requested");
    }

    fn begin_turn(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut current) = self.current.lock() {
            current.cancel();
            *current = token.clone();
        }
        token
    }

    /// Run one user turn to completion. Errors never escape: cancellation is
    /// silent and anything else becomes a single chat message.
    pub async fn handle_turn(&self, message: &str) -> TurnOutcome {
        let token = self.begin_turn();
        self.run_turn(token, message).await
    }

    /// Supersede the running turn now and run `message` on a spawned task.
    ///
    /// The previous turn is cancelled before this returns, so turns started
    /// back to back keep their submission order.
    pub fn start_turn(self: &Arc<Self>, message: impl Into<String>) -> JoinHandle<TurnOutcome> {
        let token = self.begin_turn();
        let copilot = self.clone();
        let message = message.into();
        tokio::spawn(async move { copilot.run_turn(token, &message).await })
    }

    async fn run_turn(&self, token: CancellationToken, message: &str) -> TurnOutcome {
        let _turn = self.turn_lock.lock().await;
        info!(request = %message, "turn started");

        let mut turn = Turn {
            copilot: self,
            token,
            message: message.trim().to_string(),
            outcome: TurnOutcome::new(),
            last_state: PageState::default(),
            last_visited: None,
        };
        let status = match turn.run().await {
            Ok(status) => status,
            Err(EngineError::Cancelled) => {
                debug!("turn cancelled");
                TurnStatus::Cancelled
            }
            Err(err) => {
                error!(error = %err, "turn failed");
                turn.emit_message(format!("Something went wrong: {err}"));
                TurnStatus::Failed
            }
        };
        turn.outcome.status = status;
        info!(status = ?status, steps = turn.outcome.steps_taken, "turn finished");
        self.emit(EngineEvent::Ready);
        turn.outcome
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}

/// State of the turn in progress.
struct Turn<'a> {
    copilot: &'a Copilot,
    token: CancellationToken,
    message: String,
    outcome: TurnOutcome,
    last_state: PageState,
    last_visited: Option<String>,
}

impl Turn<'_> {
    fn checkpoint(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn cancellable<F: Future>(&self, work: F) -> Result<F::Output> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(EngineError::Cancelled),
            output = work => Ok(output),
        }
    }

    /// Oracle call that yields `None` on failure and aborts on cancellation.
    async fn ask<F>(&self, endpoint: &'static str, call: F) -> Result<Option<String>>
    where
        F: Future<Output = std::result::Result<String, OracleError>>,
    {
        self.checkpoint()?;
        let reply = self.cancellable(call).await?;
        self.checkpoint()?;
        match reply {
            Ok(text) => Ok(Some(text)),
            Err(err) => {
                warn!(endpoint, error = %err, "oracle call failed");
                Ok(None)
            }
        }
    }

    fn emit_message(&mut self, text: String) {
        self.copilot.emit(EngineEvent::Message { text: text.clone() });
        self.outcome.messages.push(text);
    }

    fn say(&mut self, text: String) -> Result<()> {
        self.checkpoint()?;
        self.emit_message(text);
        Ok(())
    }

    fn step(&self, number: usize, description: String) {
        debug!(step = number, %description, "step");
        self.copilot.emit(EngineEvent::Step { number, description });
    }

    async fn run(&mut self) -> Result<TurnStatus> {
        self.checkpoint()?;
        let copilot = self.copilot;
        copilot.emit(EngineEvent::Thinking);

        let pending = copilot
            .follow_ups
            .take_active(Utc::now())
            .filter(|pending| followup::continues(pending, &self.message));
        let mut capture = SkillCapture::new();

        if pending.is_none() {
            if let Some(skill) = copilot.skills.find(&self.message).await {
                if self.replay(&skill, &mut capture).await? {
                    return Ok(TurnStatus::Completed);
                }
            }
        }

        let (plan, request) = match &pending {
            Some(pending) => {
                debug!(goal = %pending.goal_text, "continuing pending goal");
                let plan = GoalPlan {
                    goal: pending.goal_text.clone(),
                    steps: pending.plan_steps.clone().unwrap_or_default(),
                    success_criteria: pending.success_criteria.clone().unwrap_or_default(),
                    questions: Vec::new(),
                };
                let request = format!("{}\nUser follow-up: {}", pending.goal_text, self.message);
                (plan, request)
            }
            None => (self.plan_goal().await?, self.message.clone()),
        };

        if !plan.questions.is_empty() {
            let question = plan.questions.join("\n");
            self.say(question.clone())?;
            copilot.emit(EngineEvent::NeedsInput { question: question.clone() });
            self.remember(&plan, question, None, false, true);
            return Ok(TurnStatus::NeedsInput);
        }

        self.goal_loop(plan, request, pending, capture).await
    }

    async fn plan_goal(&self) -> Result<GoalPlan> {
        let copilot = self.copilot;
        let raw = self
            .ask("plan_goal", copilot.oracle.plan_goal(&self.message))
            .await?;
        let plan = raw.as_deref().and_then(reply::parse_goal_plan);
        if plan.is_none() {
            debug!("no usable goal plan, using the request as the goal");
        }
        Ok(plan.unwrap_or_else(|| GoalPlan::from_request(&self.message)))
    }

    /// Replay `skill` without planning. True when the completion check confirms it.
    async fn replay(&mut self, skill: &SkillEntry, capture: &mut SkillCapture) -> Result<bool> {
        let copilot = self.copilot;
        info!(skill_id = %skill.id, steps = skill.steps.len(), "replaying skill");
        self.checkpoint()?;
        if let Err(err) = copilot.skills.record_use(&skill.id).await {
            warn!(skill_id = %skill.id, error = %err, "skill use not recorded");
        }
        self.outcome.replayed = true;
        self.outcome.skill_id = Some(skill.id.clone());

        for (index, step) in skill.steps.iter().enumerate() {
            self.checkpoint()?;
            match step {
                SkillStep::OpenUrl { url } => {
                    self.step(index + 1, format!("Replaying: open {url}"));
                    self.open(url).await?;
                    capture.record(&BrowsingAction::OpenUrl {
                        url: url.clone(),
                        in_new_tab: false,
                    });
                }
                SkillStep::PageActions { plan } => {
                    self.step(index + 1, format!("Replaying: {}", describe_plan(plan)));
                    let report = self.run_actions(plan).await?;
                    if report.executed > 0 {
                        capture.record(&BrowsingAction::PageActions { plan: plan.clone() });
                    }
                }
            }
        }

        let plan = GoalPlan::from_request(skill.goal.as_deref().unwrap_or(&skill.trigger));
        let state = self.page_state().await?;
        let summary = Some(format!("Replayed skill \"{}\"", skill.trigger));
        let check = self
            .check_completion(&plan, &self.message.clone(), state, summary.clone())
            .await?;
        let Some(check) = check.filter(|check| check.completed) else {
            debug!(skill_id = %skill.id, "replay not confirmed, falling back to planning");
            return Ok(false);
        };

        let text = completion_text(&check);
        self.say(text.clone())?;
        copilot.emit(EngineEvent::TaskComplete { summary: text.clone() });
        self.checkpoint()?;
        if let Err(err) = copilot.skills.record_success(&skill.id).await {
            warn!(skill_id = %skill.id, error = %err, "skill success not recorded");
        }
        self.remember(&plan, text, summary, true, false);
        Ok(true)
    }

    async fn goal_loop(
        &mut self,
        plan: GoalPlan,
        request: String,
        pending: Option<PendingFollowUp>,
        mut capture: SkillCapture,
    ) -> Result<TurnStatus> {
        let copilot = self.copilot;
        let follow_up = pending.is_some();
        let explicit_in_page = resolve::wants_in_page(&self.message);
        let mut last_summary = pending.and_then(|p| p.last_action_summary);
        let mut last_response: Option<String> = None;
        let mut schema_stale = false;

        if !follow_up && !explicit_in_page {
            let current = copilot.surface.url();
            let direct = resolve::direct_navigation(&self.message, &current)
                .or_else(|| resolve::direct_navigation(&plan.goal, &current));
            if let Some(url) = direct {
                self.step(0, format!("Open {url}"));
                self.open(&url).await?;
                capture.record(&BrowsingAction::OpenUrl {
                    url: url.clone(),
                    in_new_tab: false,
                });
                last_summary = Some(format!("Opened {url}"));
            }
        }

        for step in 1..=copilot.config.max_steps {
            self.checkpoint()?;
            self.outcome.steps_taken = step;
            copilot.emit(EngineEvent::Thinking);
            let state = self.page_state().await?;

            if step == 1 && follow_up && explicit_in_page {
                debug!("skipping completion check for in-page follow-up");
            } else if let Some(check) = self
                .check_completion(&plan, &request, state.clone(), last_summary.clone())
                .await?
            {
                if check.completed {
                    return self.complete(check, capture, &plan, follow_up, last_summary).await;
                }
                if check.wants_input() {
                    let question = check
                        .question
                        .clone()
                        .filter(|q| !q.trim().is_empty())
                        .or_else(|| check.response.clone())
                        .unwrap_or_else(|| "Could you tell me more about what you need?".to_string());
                    self.say(question.clone())?;
                    copilot.emit(EngineEvent::NeedsInput { question: question.clone() });
                    debug!(discarded = capture.len(), "skill capture discarded");
                    self.remember(&plan, question, last_summary, false, true);
                    return Ok(TurnStatus::NeedsInput);
                }
                if let Some(response) = check.response.filter(|r| !r.trim().is_empty()) {
                    last_response = Some(response);
                }
            }

            if let Some(query) = resolve::youtube_search_query(&plan.goal, &state.url)
                .or_else(|| resolve::youtube_search_query(&self.message, &state.url))
            {
                self.step(step, format!("Search YouTube for \"{query}\""));
                let search = resolve::youtube_search_plan(&query);
                let report = self.run_actions(&search).await?;
                if copilot.surface.url() == state.url {
                    let url = resolve::youtube_results_url(&query);
                    debug!(%url, "youtube search box did not navigate, opening results directly");
                    self.open(&url).await?;
                    capture.record(&BrowsingAction::OpenUrl { url, in_new_tab: false });
                } else if report.executed > 0 {
                    capture.record(&BrowsingAction::PageActions { plan: search });
                }
                last_summary = Some(format!("Searched YouTube for \"{query}\""));
                schema_stale = true;
                continue;
            }

            let schema = if schema_stale {
                copilot.extractor.refresh().await
            } else {
                copilot.extractor.extract().await
            };
            schema_stale = false;
            self.checkpoint()?;

            let visit_memory = if plan.steps.is_empty() {
                copilot.visits.context_for(&plan.goal, VISIT_CONTEXT_LIMIT).await
            } else {
                None
            };
            let context = PageContext {
                goal: plan.goal.clone(),
                step_index: step,
                outline_step: plan.outline_step(step).map(str::to_string),
                plan_steps: plan.steps.clone(),
                last_action_summary: last_summary.clone(),
                url: state.url.clone(),
                title: state.title.clone(),
                schema: schema.clone(),
                visit_memory,
            };
            let raw = self
                .ask(
                    "plan_browsing_action",
                    copilot.oracle.plan_browsing_action(&request, &context),
                )
                .await?;
            let mut browsing = raw
                .as_deref()
                .and_then(reply::parse_browsing_plan)
                .unwrap_or_default();
            if let Some(response) = browsing.response.clone().filter(|r| !r.trim().is_empty()) {
                last_response = Some(response);
            }

            let relevant = explicit_in_page
                || resolve::is_relevant(&plan.goal, &state.url, &state.title)
                || resolve::is_relevant(&request, &state.url, &state.title);
            if relevant && browsing.page_actions().is_none() {
                if let Some(schema) = &schema {
                    if let Some(actions) = self.top_up_page_actions(&request, schema).await? {
                        browsing.actions.push(BrowsingAction::PageActions { plan: actions });
                    }
                }
            }

            let ctx = ResolveContext {
                goal: &plan.goal,
                request: &request,
                current_url: &state.url,
                current_title: &state.title,
                plan: &browsing,
                explicit_in_page,
            };
            let Some((resolver, action)) = resolve::resolve(&ctx) else {
                return self
                    .unresolved(&plan, &request, &browsing, &state, schema, last_summary)
                    .await;
            };
            debug!(step, resolver, action = action.kind(), "resolved action");

            match &action {
                BrowsingAction::OpenUrl { url, .. } => {
                    self.step(step, format!("Open {url}"));
                    self.open(url).await?;
                    capture.record(&action);
                    last_summary = Some(format!("Opened {url}"));
                }
                BrowsingAction::Search { query } => {
                    self.step(step, format!("Search for \"{query}\""));
                    let url = copilot.config.search_url_for(query);
                    self.open(&url).await?;
                    last_summary = Some(format!("Searched the web for \"{query}\""));
                }
                BrowsingAction::PageActions { plan: actions } => {
                    self.step(step, describe_plan(actions));
                    let report = self.run_actions(actions).await?;
                    if report.executed > 0 {
                        capture.record(&action);
                    } else if report.attempted > 0 {
                        copilot.emit(EngineEvent::StepError {
                            message: "None of the page actions could be performed".to_string(),
                        });
                    }
                    last_summary = Some(summarize_report(actions, &report));
                    schema_stale = true;
                }
                other => debug!(action = other.kind(), "resolved action is not executable"),
            }
        }

        info!(
            steps = copilot.config.max_steps,
            discarded = capture.len(),
            "step budget exhausted without completion"
        );
        let last = last_response.unwrap_or_default();
        self.remember(&plan, last, last_summary, false, false);
        Ok(TurnStatus::Inconclusive)
    }

    async fn complete(
        &mut self,
        check: GoalCheck,
        capture: SkillCapture,
        plan: &GoalPlan,
        follow_up: bool,
        last_summary: Option<String>,
    ) -> Result<TurnStatus> {
        let copilot = self.copilot;
        let text = completion_text(&check);
        self.say(text.clone())?;
        copilot.emit(EngineEvent::TaskComplete { summary: text.clone() });

        if follow_up {
            debug!(steps = capture.len(), "follow-up turn, skill not saved");
        } else if !capture.is_empty() {
            self.checkpoint()?;
            let trigger = self.message.clone();
            let signature = skills::signature(&trigger);
            match copilot
                .skills
                .save(&trigger, &signature, Some(&plan.goal), capture.into_steps())
                .await
            {
                Ok(Some(saved)) => {
                    self.outcome.skill_id = Some(saved.entry.id.clone());
                    if saved.refine {
                        copilot.refiner.spawn(saved.entry);
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(%signature, error = %err, "skill not saved"),
            }
        }

        self.remember(plan, text, last_summary, true, false);
        Ok(TurnStatus::Completed)
    }

    /// No action resolved on a relevant page: list suggestions, or answer from the page.
    async fn unresolved(
        &mut self,
        plan: &GoalPlan,
        request: &str,
        browsing: &ChatBrowsingPlan,
        state: &PageState,
        schema: Option<PageSchema>,
        last_summary: Option<String>,
    ) -> Result<TurnStatus> {
        let copilot = self.copilot;
        let suggestions = browsing.suggestions();
        if !suggestions.is_empty() {
            let mut text = String::from("Here are some sites that could help:");
            for suggestion in suggestions {
                let title = if suggestion.title.is_empty() { &suggestion.url } else { &suggestion.title };
                text.push_str(&format!("\n- {title}: {}", suggestion.url));
                if let Some(reason) = suggestion.reason.as_deref().filter(|r| !r.is_empty()) {
                    text.push_str(&format!(" ({reason})"));
                }
            }
            self.say(text.clone())?;
            copilot.emit(EngineEvent::NeedsInput { question: text.clone() });
            self.remember(plan, text, last_summary, false, true);
            return Ok(TurnStatus::NeedsInput);
        }

        let context = AnswerContext {
            page_content: state.content.clone(),
            schema,
            snapshot: None,
            context_notes: last_summary.clone(),
        };
        let raw = self.ask("answer", copilot.oracle.answer(request, &context)).await?;
        let text = raw
            .as_deref()
            .map(answer_text)
            .filter(|text| !text.is_empty())
            .or_else(|| browsing.response.clone().filter(|r| !r.trim().is_empty()))
            .unwrap_or_else(|| "Sorry, I couldn't work out what to do next on this page.".to_string());
        self.say(text.clone())?;
        self.remember(plan, text, last_summary, false, false);
        Ok(TurnStatus::Inconclusive)
    }

    async fn top_up_page_actions(&self, request: &str, schema: &PageSchema) -> Result<Option<ActionPlan>> {
        let copilot = self.copilot;
        let raw = self
            .ask("plan_page_actions", copilot.oracle.plan_page_actions(request, schema))
            .await?;
        Ok(raw
            .as_deref()
            .and_then(reply::parse_action_plan)
            .filter(|plan| !plan.actions.is_empty()))
    }

    async fn check_completion(
        &self,
        plan: &GoalPlan,
        request: &str,
        page: PageState,
        last_action_summary: Option<String>,
    ) -> Result<Option<GoalCheck>> {
        let query = CompletionQuery {
            goal: plan.goal.clone(),
            request: request.to_string(),
            page,
            plan_steps: plan.steps.clone(),
            success_criteria: plan.success_criteria.clone(),
            last_action_summary,
        };
        let raw = self
            .ask(
                "check_goal_completion",
                self.copilot.oracle.check_goal_completion(&query),
            )
            .await?;
        Ok(raw.as_deref().and_then(reply::parse_goal_check))
    }

    /// Read the page, counting a visit whenever the URL moved.
    async fn page_state(&mut self) -> Result<PageState> {
        let copilot = self.copilot;
        let state = self.cancellable(copilot.extractor.page_state()).await?;
        self.checkpoint()?;
        if self.last_visited.as_deref() != Some(state.url.as_str()) {
            if let Err(err) = copilot.visits.record(&state.url, &state.title).await {
                debug!(error = %err, "visit not recorded");
            }
            self.last_visited = Some(state.url.clone());
        }
        self.last_state = state.clone();
        Ok(state)
    }

    /// Navigate and wait, bounded, for the page to settle and become ready.
    async fn open(&self, url: &str) -> Result<SettleOutcome> {
        let surface = &self.copilot.surface;
        let config = &self.copilot.config;
        let before = surface.url();
        let watch = surface.watch();
        self.checkpoint()?;
        if let Err(err) = surface.navigate(url).await {
            warn!(%url, error = %err, "navigation failed");
            self.copilot.emit(EngineEvent::StepError {
                message: format!("Could not open {url}: {err}"),
            });
        }
        let outcome = self
            .cancellable(watch.settle(&before, config.navigation_timeout))
            .await?;
        if !outcome.settled() {
            warn!(%url, "page did not settle in time, continuing");
        }
        self.cancellable(surface.wait_for_ready(config.ready_timeout))
            .await?;
        Ok(outcome)
    }

    /// Execute a plan, waiting for a possible navigation while still marked busy.
    async fn run_actions(&self, plan: &ActionPlan) -> Result<ExecutionReport> {
        let copilot = self.copilot;
        let before = copilot.surface.url();
        let watch = action_plan_may_navigate(plan).then(|| copilot.surface.watch());
        let _busy = copilot.executor.enter();
        self.checkpoint()?;
        let report = self.cancellable(copilot.executor.execute(plan)).await?;
        if let Some(watch) = watch.filter(|_| report.executed > 0) {
            let outcome = self
                .cancellable(watch.settle(&before, copilot.config.navigation_timeout))
                .await?;
            if outcome.settled() {
                self.cancellable(copilot.surface.wait_for_ready(copilot.config.ready_timeout))
                    .await?;
            }
        }
        Ok(report)
    }

    /// Store the follow-up record for the next turn, unless cancelled.
    fn remember(
        &self,
        plan: &GoalPlan,
        assistant: String,
        last_action_summary: Option<String>,
        completed: bool,
        requires_follow_up: bool,
    ) {
        if self.token.is_cancelled() {
            return;
        }
        let url = if self.last_state.url.is_empty() {
            self.copilot.surface.url()
        } else {
            self.last_state.url.clone()
        };
        self.copilot.follow_ups.store(PendingFollowUp {
            goal_text: plan.goal.clone(),
            last_user_message: self.message.clone(),
            last_assistant_message: assistant,
            plan_steps: (!plan.steps.is_empty()).then(|| plan.steps.clone()),
            success_criteria: (!plan.success_criteria.is_empty()).then(|| plan.success_criteria.clone()),
            last_action_summary,
            url,
            title: self.last_state.title.clone(),
            completed,
            asked_at: Utc::now(),
            requires_follow_up,
        });
    }
}

fn completion_text(check: &GoalCheck) -> String {
    let text = check
        .response
        .as_deref()
        .or(check.evidence.as_deref())
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .unwrap_or("The goal looks complete.");
    if READS_AS_DONE.is_match(text) {
        text.to_string()
    } else {
        format!("{text}\n\n{DONE_SUFFIX}")
    }
}

/// The answer endpoint may reply with prose or with `{"response": ...}`.
fn answer_text(raw: &str) -> String {
    reply::extract_json(raw)
        .and_then(|value| {
            value
                .get("response")
                .or_else(|| value.get("answer"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| raw.to_string())
        .trim()
        .to_string()
}

fn describe_plan(plan: &ActionPlan) -> String {
    let parts: Vec<String> = plan
        .actions
        .iter()
        .map(|action| {
            let kind = serde_json::to_value(action.kind)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            match action.selector.as_deref() {
                Some(selector) => format!("{kind} {selector}"),
                None => kind,
            }
        })
        .collect();
    format!("Page actions: {}", parts.join(", "))
}

fn summarize_report(plan: &ActionPlan, report: &ExecutionReport) -> String {
    let notes = plan.notes.as_deref().map(|n| format!(" ({n})")).unwrap_or_default();
    format!(
        "Performed {} of {} page actions{notes}",
        report.executed, report.attempted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Action;

    #[test]
    fn completion_text_appends_marker_once() {
        let check = GoalCheck {
            completed: true,
            response: Some("Wikipedia is open.".into()),
            ..GoalCheck::default()
        };
        assert_eq!(completion_text(&check), format!("Wikipedia is open.\n\n{DONE_SUFFIX}"));

        let check = GoalCheck {
            completed: true,
            response: Some("Done! The video is playing.".into()),
            ..GoalCheck::default()
        };
        assert_eq!(completion_text(&check), "Done! The video is playing.");

        let check = GoalCheck {
            completed: true,
            evidence: Some("Results for cats are listed".into()),
            ..GoalCheck::default()
        };
        assert!(completion_text(&check).ends_with(DONE_SUFFIX));
    }

    #[test]
    fn answer_text_accepts_json_or_prose() {
        assert_eq!(answer_text(r#"{"response": "It costs $5."}"#), "It costs $5.");
        assert_eq!(answer_text("  It costs $5.  "), "It costs $5.");
    }

    #[test]
    fn plan_descriptions() {
        let plan = ActionPlan::new(vec![Action::click("#go"), Action::press("Enter")]);
        assert_eq!(describe_plan(&plan), "Page actions: click #go, press");
        let report = ExecutionReport {
            executed: 1,
            attempted: 2,
            results: Vec::new(),
        };
        assert_eq!(summarize_report(&plan, &report), "Performed 1 of 2 page actions");
    }
}
