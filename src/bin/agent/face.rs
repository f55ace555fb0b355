use anyhow::{Result, anyhow};
use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::response::sse::{Event, Sse};
use axum::routing::{delete, get, post};
use pagepilot::events::EventSender;
use pagepilot::{Copilot, EngineEvent, SkillEntry, VisitRecord};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

fn to_sse_event(event: &EngineEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.name()).data(data)
}

#[derive(Clone)]
pub struct AppState {
    pub copilot: Arc<Copilot>,
    pub events: EventSender,
}

#[derive(Deserialize)]
struct CommandPayload {
    command: String,
}

/// Serve the web UI on the first free port in `first_port..first_port + 10`.
pub async fn start_server(copilot: Arc<Copilot>, first_port: u16) -> Result<u16> {
    let state = Arc::new(AppState {
        events: copilot.events(),
        copilot,
    });

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/command", post(command_handler))
        .route("/stop", post(stop_handler))
        .route("/reset", post(reset_handler))
        .route("/skills", get(skills_handler))
        .route("/skills/{id}", delete(delete_skill_handler))
        .route("/visits", get(visits_handler))
        .route("/events", get(sse_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT })) // Silence 404
        .with_state(state);

    let mut bound = None;
    for port in first_port..first_port.saturating_add(10) {
        if let Ok(listener) = tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
            bound = Some((listener, port));
            break;
        }
    }
    let (listener, port) = bound.ok_or_else(|| {
        anyhow!(
            "Could not bind to any port {}-{}. Kill the old agent first.",
            first_port,
            first_port.saturating_add(9)
        )
    })?;

    info!("Web UI running at http://localhost:{}", port);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "web server stopped");
        }
    });

    Ok(port)
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn command_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CommandPayload>,
) -> &'static str {
    info!(command = %payload.command, "POST /command");
    // Detached: the turn outlives this request, and the previous one is already cancelled.
    drop(state.copilot.start_turn(payload.command));
    "ok"
}

async fn stop_handler(State(state): State<Arc<AppState>>) -> &'static str {
    info!("POST /stop");
    state.copilot.stop();
    "ok"
}

/// Start the next message as a fresh request.
async fn reset_handler(State(state): State<Arc<AppState>>) -> &'static str {
    info!("POST /reset");
    state.copilot.forget_follow_up();
    "ok"
}

async fn skills_handler(State(state): State<Arc<AppState>>) -> Json<Vec<SkillEntry>> {
    Json(state.copilot.skills().list().await)
}

async fn delete_skill_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> StatusCode {
    match state.copilot.skills().delete(&id).await {
        Ok(true) => StatusCode::NO_CONTENT,
        Ok(false) => StatusCode::NOT_FOUND,
        Err(e) => {
            warn!(skill_id = %id, error = %e, "could not delete skill");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn visits_handler(State(state): State<Arc<AppState>>) -> Json<Vec<VisitRecord>> {
    Json(state.copilot.visits().list().await)
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(event) => Some(Ok::<_, Infallible>(to_sse_event(&event))),
        Err(_) => None,
    });
    Sse::new(stream)
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>pagepilot</title>
<style>
  :root { --ink: #1f2328; --muted: #6e7781; --line: #d0d7de; --accent: #0969da; --ok: #1a7f37; --bad: #cf222e; }
  body { margin: 0; font: 14px/1.5 system-ui, sans-serif; color: var(--ink); background: #f6f8fa; }
  .shell { display: grid; grid-template-columns: 1fr 280px; height: 100vh; }
  .chat { display: flex; flex-direction: column; min-width: 0; }
  .bar { display: flex; align-items: center; gap: 10px; padding: 12px 20px; border-bottom: 1px solid var(--line); background: #fff; }
  .bar h1 { font-size: 16px; margin: 0; flex: 1; }
  #state { font-size: 12px; color: var(--muted); }
  #state.busy { color: var(--accent); }
  #transcript { flex: 1; overflow-y: auto; padding: 16px 20px; }
  .line { margin: 0 0 8px; padding: 6px 10px; border-radius: 6px; white-space: pre-wrap; }
  .line.you { background: #ddf4ff; }
  .line.bot { background: #fff; border: 1px solid var(--line); }
  .line.step { color: var(--muted); font: 12px ui-monospace, monospace; }
  .line.err { color: var(--bad); }
  .line.done { border-color: var(--ok); }
  form { display: flex; gap: 8px; padding: 12px 20px; border-top: 1px solid var(--line); background: #fff; }
  #request { flex: 1; padding: 8px 10px; border: 1px solid var(--line); border-radius: 6px; font: inherit; }
  button { padding: 6px 12px; border: 1px solid var(--line); border-radius: 6px; background: #fff; font: inherit; cursor: pointer; }
  button.primary { background: var(--accent); border-color: var(--accent); color: #fff; }
  aside { border-left: 1px solid var(--line); background: #fff; overflow-y: auto; padding: 12px 16px; }
  aside h2 { font-size: 13px; text-transform: uppercase; color: var(--muted); margin: 4px 0 8px; }
  .skill { display: flex; justify-content: space-between; gap: 6px; padding: 6px 0; border-bottom: 1px solid #eaeef2; }
  .skill small { display: block; color: var(--muted); }
  .skill button { padding: 0 6px; }
</style>
</head>
<body>
<div class="shell">
  <section class="chat">
    <div class="bar">
      <h1>pagepilot</h1>
      <span id="state">idle</span>
      <button type="button" onclick="post('/stop')">Stop</button>
      <button type="button" onclick="post('/reset').then(() => note('step', 'Next message starts a new goal.'))">New goal</button>
    </div>
    <div id="transcript"></div>
    <form id="composer">
      <input id="request" autocomplete="off" placeholder="What should I do in the browser?" autofocus>
      <button class="primary">Go</button>
    </form>
  </section>
  <aside>
    <h2>Skills</h2>
    <div id="skills"></div>
  </aside>
</div>
<script>
  const transcript = document.getElementById('transcript');
  const stateEl = document.getElementById('state');
  const request = document.getElementById('request');

  function note(kind, text) {
    const p = document.createElement('p');
    p.className = 'line ' + kind;
    p.textContent = text;
    transcript.appendChild(p);
    transcript.scrollTop = transcript.scrollHeight;
    return p;
  }

  function post(path, body) {
    return fetch(path, {
      method: 'POST',
      headers: body ? { 'Content-Type': 'application/json' } : {},
      body: body ? JSON.stringify(body) : undefined,
    });
  }

  function working(on) {
    stateEl.textContent = on ? 'working' : 'idle';
    stateEl.className = on ? 'busy' : '';
  }

  async function refreshSkills() {
    const list = document.getElementById('skills');
    const skills = await (await fetch('/skills')).json();
    list.replaceChildren(...skills.map(skill => {
      const row = document.createElement('div');
      row.className = 'skill';
      const label = document.createElement('div');
      label.textContent = skill.trigger;
      const meta = document.createElement('small');
      meta.textContent = skill.steps.length + ' steps, used ' + skill.useCount + 'x';
      label.appendChild(meta);
      const forget = document.createElement('button');
      forget.textContent = 'x';
      forget.title = 'Forget this skill';
      forget.onclick = () => fetch('/skills/' + encodeURIComponent(skill.id), { method: 'DELETE' }).then(refreshSkills);
      row.append(label, forget);
      return row;
    }));
  }

  document.getElementById('composer').addEventListener('submit', e => {
    e.preventDefault();
    const text = request.value.trim();
    if (!text) return;
    request.value = '';
    note('you', text);
    working(true);
    post('/command', { command: text });
  });

  const events = new EventSource('/events');
  const on = (name, fn) => events.addEventListener(name, e => fn(JSON.parse(e.data)));
  on('step', d => note('step', d.number + '. ' + d.description));
  on('step_error', d => note('err', d.message));
  on('message', d => note('bot', d.text));
  on('task_complete', () => {
    const last = transcript.lastElementChild;
    if (last) last.classList.add('done');
  });
  on('busy', d => { if (d.depth > 0) working(true); });
  on('ready', () => { working(false); refreshSkills(); request.focus(); });

  refreshSkills();
</script>
</body>
</html>
"##;
