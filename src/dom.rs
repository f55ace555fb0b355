use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::surface::{SurfaceAdapter, decode_json};
use crate::types::{PAGE_CONTENT_MAX_CHARS, PageSchema, PageState};

/// Marker the schema script starts with.
pub const SCHEMA_SCRIPT_MARKER: &str = "/*pagepilot:schema*/";
/// Marker the page-state script starts with.
pub const PAGE_STATE_SCRIPT_MARKER: &str = "/*pagepilot:page-state*/";

/// JavaScript injected into the page to describe its interactive structure.
/// READ-ONLY: it never mutates the DOM.
///
/// The script:
///   1. Collects inputs, buttons, links, headings and forms, skipping hidden ones.
///   2. Caps each list (inputs 60, buttons 60, links 80, headings 40, forms 20)
///      and each text field (160 chars).
///   3. Synthesises a CSS selector per element: `#id` when the id is unique,
///      otherwise a path of at most 4 ancestors built from `tag.class1.class2`,
///      with `:nth-of-type(n)` appended only when same-tag siblings make the
///      step ambiguous.
///   4. Returns everything as one JSON string.
const SCHEMA_JS: &str = r#"/*pagepilot:schema*/
(() => {
  const TEXT_MAX = 160;
  const clip = (s) => (s || '').replace(/\s+/g, ' ').trim().slice(0, TEXT_MAX);
  const visible = (el) => {
    if (!el || !el.isConnected) return false;
    const s = getComputedStyle(el);
    if (s.display === 'none' || s.visibility === 'hidden') return false;
    return el.getClientRects().length > 0 || el.tagName === 'INPUT';
  };
  const esc = (v) => (window.CSS && CSS.escape) ? CSS.escape(v) : v.replace(/([^a-zA-Z0-9_-])/g, '\\$1');
  const selectorFor = (el) => {
    if (el.id && document.querySelectorAll('#' + esc(el.id)).length === 1) return '#' + esc(el.id);
    const parts = [];
    let node = el;
    for (let depth = 0; node && node.nodeType === 1 && depth < 4; depth++) {
      const tag = node.tagName.toLowerCase();
      if (tag === 'html' || tag === 'body') break;
      let part = tag;
      const classes = [...node.classList].filter(c => /^[a-zA-Z_-][\w-]*$/.test(c)).slice(0, 2);
      if (classes.length) part += '.' + classes.join('.');
      const parent = node.parentElement;
      if (parent) {
        const same = [...parent.children].filter(c => c.tagName === node.tagName);
        if (same.length > 1) part += ':nth-of-type(' + (same.indexOf(node) + 1) + ')';
      }
      parts.unshift(part);
      if (depth > 0 && node.id) { parts[0] = '#' + esc(node.id) + part.slice(tag.length); break; }
      node = parent;
    }
    return parts.join(' > ');
  };
  const labelFor = (el) => {
    if (el.labels && el.labels.length) return clip(el.labels[0].innerText);
    return clip(el.getAttribute('aria-label') || el.getAttribute('title') || '');
  };
  const take = (query, limit, map) => [...document.querySelectorAll(query)].filter(visible).slice(0, limit).map(map);

  const inputs = take('input:not([type=hidden]), textarea, select, [contenteditable=true]', 60, el => ({
    selector: selectorFor(el),
    tag: el.tagName.toLowerCase(),
    type: clip(el.type || ''),
    name: clip(el.name || ''),
    label: labelFor(el),
    placeholder: clip(el.placeholder || ''),
    value: clip(el.type === 'password' ? '' : (el.value || '')),
  }));
  const buttons = take('button, [role=button], input[type=submit], input[type=button]', 60, el => ({
    selector: selectorFor(el),
    text: clip(el.innerText || el.value || el.getAttribute('aria-label') || ''),
  }));
  const links = take('a[href]', 80, el => ({
    selector: selectorFor(el),
    text: clip(el.innerText || el.getAttribute('aria-label') || el.title || ''),
    href: (el.href || '').slice(0, 300),
  }));
  const headings = take('h1, h2, h3', 40, el => ({
    level: Number(el.tagName.slice(1)),
    text: clip(el.innerText),
  }));
  const forms = take('form', 20, el => ({
    selector: selectorFor(el),
    action: (el.getAttribute('action') || '').slice(0, 300),
    method: (el.getAttribute('method') || 'get').toLowerCase(),
    fields: el.elements ? el.elements.length : 0,
  }));
  const body = document.body ? document.body.innerText : '';
  return JSON.stringify({
    title: clip(document.title),
    url: location.href,
    inputs, buttons, links, headings, forms,
    htmlSnippet: (body || '').replace(/\s+/g, ' ').trim().slice(0, 2000),
  });
})()
"#;

/// Title, URL and visible text, for completion checks.
const PAGE_STATE_JS: &str = r#"/*pagepilot:page-state*/
(() => JSON.stringify({
  url: location.href,
  title: document.title || '',
  content: (document.body ? document.body.innerText : '').replace(/\s+/g, ' ').trim().slice(0, 6000),
}))()
"#;

struct CachedSchema {
    at: Instant,
    schema: PageSchema,
}

/// DOM Schema Extractor with a short per-URL cache.
pub struct SchemaExtractor {
    surface: SurfaceAdapter,
    ttl: Duration,
    cache: Mutex<HashMap<String, CachedSchema>>,
}

impl SchemaExtractor {
    pub fn new(surface: SurfaceAdapter, ttl: Duration) -> Self {
        Self {
            surface,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Cached schema for the current URL, extracting when stale or missing.
    pub async fn extract(&self) -> Option<PageSchema> {
        let url = self.surface.url();
        {
            let cache = self.cache.lock().await;
            if let Some(hit) = cache.get(&url) {
                if hit.at.elapsed() < self.ttl {
                    debug!(%url, "schema cache hit");
                    return Some(hit.schema.clone());
                }
            }
        }
        self.refresh().await
    }

    /// Extract a new schema regardless of the cache. `None` means "unavailable".
    pub async fn refresh(&self) -> Option<PageSchema> {
        let url = self.surface.url();
        let value = self.surface.execute(SCHEMA_JS).await?;
        let schema: PageSchema = match serde_json::from_value(decode_json(value)) {
            Ok(schema) => schema,
            Err(err) => {
                debug!(error = %err, "schema script returned an unexpected shape");
                return None;
            }
        };
        let mut cache = self.cache.lock().await;
        let ttl = self.ttl;
        cache.retain(|_, cached| cached.at.elapsed() < ttl);
        cache.insert(
            url,
            CachedSchema {
                at: Instant::now(),
                schema: schema.clone(),
            },
        );
        Some(schema)
    }

    /// Read the current page's URL, title and text. Never fails: missing
    /// fields fall back to the host URL and empty strings.
    pub async fn page_state(&self) -> PageState {
        let fallback = || PageState {
            url: self.surface.url(),
            ..PageState::default()
        };
        let Some(value) = self.surface.execute(PAGE_STATE_JS).await else {
            return fallback();
        };
        match serde_json::from_value::<PageState>(decode_json(value)) {
            Ok(mut state) => {
                if state.url.is_empty() {
                    state.url = self.surface.url();
                }
                state.content = state.content.chars().take(PAGE_CONTENT_MAX_CHARS).collect();
                state
            }
            Err(_) => fallback(),
        }
    }
}
