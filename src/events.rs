use serde::Serialize;
use tokio::sync::broadcast;

/// Progress notifications for whatever UI sits on top of the engine.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Thinking,
    Step { number: usize, description: String },
    StepError { message: String },
    /// A chat message for the transcript.
    Message { text: String },
    TaskComplete { summary: String },
    NeedsInput { question: String },
    /// Nesting depth of in-flight action plans; 0 means idle.
    Busy { depth: usize },
    Ready,
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::Thinking => "thinking",
            EngineEvent::Step { .. } => "step",
            EngineEvent::StepError { .. } => "step_error",
            EngineEvent::Message { .. } => "message",
            EngineEvent::TaskComplete { .. } => "task_complete",
            EngineEvent::NeedsInput { .. } => "needs_input",
            EngineEvent::Busy { .. } => "busy",
            EngineEvent::Ready => "ready",
        }
    }
}

pub type EventSender = broadcast::Sender<EngineEvent>;

pub fn channel() -> EventSender {
    broadcast::channel(64).0
}
