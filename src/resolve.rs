//! Choosing the one action a step will actually run.
//!
//! Planners often propose `open_url` for a page that is already open, or
//! in-page clicks on a page that has nothing to do with the goal. The
//! resolvers below are tried in order and the first hit wins:
//!
//! 1. `direct_site`: a known site or bare domain named in the goal, unless already open.
//! 2. `in_page`: the plan's `page_actions`, when the page is relevant or the
//!    user asked for in-page interaction.
//! 3. `plan_navigation`: the plan's `open_url`/`search`.
//! 4. `search_fallback`: search for the goal itself when the page is irrelevant.
//!
//! Every resolver is a pure function of [`ResolveContext`].

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::types::{Action, ActionPlan, BrowsingAction, ChatBrowsingPlan};

/// Keyword → homepage. Multi-word and more specific entries come first.
const KNOWN_SITES: &[(&str, &str)] = &[
    ("google maps", "https://maps.google.com"),
    ("hacker news", "https://news.ycombinator.com"),
    ("stack overflow", "https://stackoverflow.com"),
    ("stackoverflow", "https://stackoverflow.com"),
    ("gmail", "https://mail.google.com"),
    ("youtube", "https://www.youtube.com"),
    ("wikipedia", "https://www.wikipedia.org"),
    ("github", "https://github.com"),
    ("reddit", "https://www.reddit.com"),
    ("amazon", "https://www.amazon.com"),
    ("twitter", "https://x.com"),
    ("linkedin", "https://www.linkedin.com"),
    ("facebook", "https://www.facebook.com"),
    ("instagram", "https://www.instagram.com"),
    ("netflix", "https://www.netflix.com"),
    ("duckduckgo", "https://duckduckgo.com"),
    ("bing", "https://www.bing.com"),
    ("google", "https://www.google.com"),
];

const STOPWORDS: &[&str] = &[
    "about", "after", "also", "and", "best", "could", "find", "from", "have", "into", "look",
    "make", "more", "open", "page", "please", "search", "show", "site", "some", "that", "than",
    "their", "them", "then", "there", "this", "want", "what", "when", "where", "which", "with",
    "would", "your", "website", "navigate", "visit",
];

static URL_IN_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s'<>]+").expect("valid url regex"));

static BARE_DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b((?:[a-z0-9](?:[a-z0-9-]*[a-z0-9])?\.)+(?:com|org|net|io|dev|app|edu|gov|co|uk|de|fr|es|it|nl|ai|me|tv|info|news|us|ca|jp|in|ru|br|au))\b",
    )
    .expect("valid domain regex")
});

static IN_PAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(click|tap|press|type|fill( in| out)?|enter|select|choose|pick|scroll|submit|tick|check the|sign in|log in|login|add to cart|this page|on the page|current page|here)\b",
    )
    .expect("valid in-page regex")
});

static SEARCH_INTENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(search( for)?|find|look up|look for|watch|play|show me)\b")
        .expect("valid search-intent regex")
});

/// Host with `www.`/`m.` stripped, for http(s) URLs only.
pub fn domain_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?.to_ascii_lowercase();
    let host = host
        .strip_prefix("www.")
        .or_else(|| host.strip_prefix("m."))
        .unwrap_or(&host)
        .to_string();
    Some(host)
}

/// `en.wikipedia.org` → `wikipedia.org`, `bbc.co.uk` → `bbc.co.uk`.
pub fn registrable_domain(domain: &str) -> String {
    let labels: Vec<&str> = domain.split('.').filter(|l| !l.is_empty()).collect();
    let keep = match labels.as_slice() {
        [.., second, last]
            if last.len() == 2 && matches!(*second, "co" | "com" | "org" | "net" | "ac" | "gov") =>
        {
            3
        }
        _ => 2,
    };
    labels[labels.len().saturating_sub(keep)..].join(".")
}

/// The name people use for a site: `www.youtube.com` → `youtube`.
pub fn site_label(domain: &str) -> String {
    registrable_domain(domain)
        .split('.')
        .next()
        .unwrap_or_default()
        .to_string()
}

pub fn same_site(a: &str, b: &str) -> bool {
    match (domain_of(a), domain_of(b)) {
        (Some(a), Some(b)) => registrable_domain(&a) == registrable_domain(&b),
        _ => false,
    }
}

fn contains_word(haystack: &str, needle: &str) -> bool {
    word_position(haystack, needle).is_some()
}

/// Byte offset of the first whole-word occurrence of `needle`.
fn word_position(haystack: &str, needle: &str) -> Option<usize> {
    haystack
        .match_indices(needle)
        .map(|(at, _)| at)
        .find(|&at| {
            let before = haystack[..at].chars().next_back();
            let after = haystack[at + needle.len()..].chars().next();
            !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
        })
}

/// The site mentioned first in `text`. At the same offset the longer name
/// wins, so "google maps" beats "google".
pub fn known_site(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    KNOWN_SITES
        .iter()
        .filter_map(|(keyword, url)| word_position(&lower, keyword).map(|at| (at, keyword.len(), *url)))
        .min_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
        .map(|(_, _, url)| url)
}

/// An explicit URL or a bare domain such as `rust-lang.org` mentioned in `text`.
pub fn explicit_url(text: &str) -> Option<String> {
    if let Some(found) = URL_IN_TEXT.find(text) {
        let url = found.as_str().trim_end_matches(['.', ',', ')', '!', '?', '"']);
        return Some(url.to_string());
    }
    let lower = text.to_lowercase();
    BARE_DOMAIN
        .captures(&lower)
        .map(|caps| format!("https://{}", &caps[1]))
}

/// Site to open straight away for `text`, unless `current_url` is already on it.
pub fn direct_navigation(text: &str, current_url: &str) -> Option<String> {
    let target = explicit_url(text).or_else(|| known_site(text).map(str::to_string))?;
    (!same_site(&target, current_url)).then_some(target)
}

/// Whether the user asked to interact with the page in front of them.
pub fn wants_in_page(text: &str) -> bool {
    IN_PAGE.is_match(&text.to_lowercase())
}

fn keywords(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.len() >= 4 && !STOPWORDS.contains(word))
        .map(str::to_string)
        .collect()
}

/// Keyword/domain overlap between the goal and the current page.
pub fn is_relevant(goal: &str, url: &str, title: &str) -> bool {
    let Some(domain) = domain_of(url) else {
        return false;
    };
    let goal_lower = goal.to_lowercase();
    let label = site_label(&domain);
    if label.len() >= 2 && contains_word(&goal_lower, &label) {
        return true;
    }
    // A goal that names some other site is not served by this one.
    if let Some(target) = explicit_url(goal).or_else(|| known_site(goal).map(str::to_string)) {
        if !same_site(&target, url) {
            return false;
        }
    }
    let words = keywords(goal);
    if words.iter().any(|word| domain.contains(word.as_str())) {
        return true;
    }
    let title = title.to_lowercase();
    words.iter().filter(|word| contains_word(&title, word)).count() >= 2
}

fn normalized(url: &str) -> String {
    url.trim().trim_end_matches('/').to_ascii_lowercase()
}

/// Everything a resolver may look at.
#[derive(Debug, Clone, Copy)]
pub struct ResolveContext<'a> {
    pub goal: &'a str,
    pub request: &'a str,
    pub current_url: &'a str,
    pub current_title: &'a str,
    pub plan: &'a ChatBrowsingPlan,
    pub explicit_in_page: bool,
}

impl ResolveContext<'_> {
    pub fn page_relevant(&self) -> bool {
        is_relevant(self.goal, self.current_url, self.current_title)
            || is_relevant(self.request, self.current_url, self.current_title)
    }
}

pub type Resolver = fn(&ResolveContext<'_>) -> Option<BrowsingAction>;

pub const RESOLVERS: &[(&str, Resolver)] = &[
    ("direct_site", resolve_direct_site),
    ("in_page", resolve_in_page),
    ("plan_navigation", resolve_plan_navigation),
    ("search_fallback", resolve_search_fallback),
];

/// First resolver hit, with the resolver's name.
pub fn resolve(ctx: &ResolveContext<'_>) -> Option<(&'static str, BrowsingAction)> {
    RESOLVERS
        .iter()
        .find_map(|(name, resolver)| resolver(ctx).map(|action| (*name, action)))
}

pub fn resolve_direct_site(ctx: &ResolveContext<'_>) -> Option<BrowsingAction> {
    if ctx.explicit_in_page {
        return None;
    }
    let url = direct_navigation(ctx.goal, ctx.current_url)
        .or_else(|| direct_navigation(ctx.request, ctx.current_url))?;
    // Only when neither text already points at the open site.
    if known_site(ctx.goal).is_some_and(|site| same_site(site, ctx.current_url)) {
        return None;
    }
    Some(BrowsingAction::OpenUrl {
        url,
        in_new_tab: false,
    })
}

pub fn resolve_in_page(ctx: &ResolveContext<'_>) -> Option<BrowsingAction> {
    if !(ctx.explicit_in_page || ctx.page_relevant()) {
        return None;
    }
    ctx.plan.page_actions().map(|plan| BrowsingAction::PageActions { plan: plan.clone() })
}

pub fn resolve_plan_navigation(ctx: &ResolveContext<'_>) -> Option<BrowsingAction> {
    let current = normalized(ctx.current_url);
    ctx.plan.actions.iter().find_map(|action| match action {
        BrowsingAction::OpenUrl { url, in_new_tab } => {
            let url = if url.contains("://") {
                url.trim().to_string()
            } else {
                format!("https://{}", url.trim())
            };
            (domain_of(&url).is_some() && normalized(&url) != current).then(|| {
                BrowsingAction::OpenUrl {
                    url,
                    in_new_tab: *in_new_tab,
                }
            })
        }
        BrowsingAction::Search { query } if !query.trim().is_empty() => {
            Some(BrowsingAction::Search {
                query: query.trim().to_string(),
            })
        }
        _ => None,
    })
}

pub fn resolve_search_fallback(ctx: &ResolveContext<'_>) -> Option<BrowsingAction> {
    if ctx.explicit_in_page || ctx.page_relevant() || ctx.goal.trim().is_empty() {
        return None;
    }
    Some(BrowsingAction::Search {
        query: ctx.goal.trim().to_string(),
    })
}

fn is_youtube_home(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let on_youtube = domain_of(url).is_some_and(|domain| registrable_domain(&domain) == "youtube.com");
    on_youtube && matches!(parsed.path(), "" | "/") && parsed.query().is_none_or(|q| !q.contains("search_query"))
}

/// Query to type into YouTube's own search box, when the goal is a search
/// and the page is the YouTube home page.
pub fn youtube_search_query(goal: &str, current_url: &str) -> Option<String> {
    if !is_youtube_home(current_url) {
        return None;
    }
    let lower = goal.to_lowercase();
    let intent = SEARCH_INTENT.find(&lower)?;
    let after_intent = &lower[intent.end()..];
    let rest = match after_intent.find(" for ") {
        Some(at) => &after_intent[at + " for ".len()..],
        None => after_intent,
    };
    let mut query = rest.trim().to_string();
    for suffix in [" on youtube", " in youtube", " from youtube", " youtube"] {
        if let Some(stripped) = query.strip_suffix(suffix) {
            query = stripped.trim().to_string();
        }
    }
    for prefix in ["youtube for ", "youtube ", "for "] {
        if let Some(stripped) = query.strip_prefix(prefix) {
            query = stripped.trim().to_string();
        }
    }
    let query = query.trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace());
    (!query.is_empty()).then(|| query.to_string())
}

pub const YOUTUBE_SEARCH_BOX: &str = "input[name=\"search_query\"]";

/// Focus the search box, type the query, press Enter.
pub fn youtube_search_plan(query: &str) -> ActionPlan {
    ActionPlan {
        actions: vec![
            Action::focus(YOUTUBE_SEARCH_BOX),
            Action::type_text(YOUTUBE_SEARCH_BOX, query),
            Action::press("Enter").with_selector(YOUTUBE_SEARCH_BOX),
        ],
        notes: Some("youtube search shortcut".to_string()),
    }
}

pub fn youtube_results_url(query: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
    format!("https://www.youtube.com/results?search_query={encoded}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActionKind;

    fn ctx<'a>(goal: &'a str, url: &'a str, title: &'a str, plan: &'a ChatBrowsingPlan) -> ResolveContext<'a> {
        ResolveContext {
            goal,
            request: goal,
            current_url: url,
            current_title: title,
            plan,
            explicit_in_page: false,
        }
    }

    fn page_plan() -> ChatBrowsingPlan {
        ChatBrowsingPlan {
            actions: vec![
                BrowsingAction::OpenUrl {
                    url: "https://www.youtube.com/".into(),
                    in_new_tab: false,
                },
                BrowsingAction::PageActions {
                    plan: ActionPlan::new(vec![Action::click("a#video-title")]),
                },
            ],
            response: None,
        }
    }

    #[test]
    fn domains_and_sites() {
        assert_eq!(domain_of("https://www.youtube.com/watch?v=1").as_deref(), Some("youtube.com"));
        assert_eq!(domain_of("about:blank"), None);
        assert_eq!(registrable_domain("en.wikipedia.org"), "wikipedia.org");
        assert_eq!(registrable_domain("news.bbc.co.uk"), "bbc.co.uk");
        assert_eq!(site_label("m.youtube.com"), "youtube");
        assert!(same_site("https://en.wikipedia.org/wiki/Rust", "https://www.wikipedia.org"));
    }

    #[test]
    fn direct_navigation_targets() {
        assert_eq!(
            direct_navigation("open wikipedia", "about:blank").as_deref(),
            Some("https://www.wikipedia.org")
        );
        assert_eq!(direct_navigation("open wikipedia", "https://en.wikipedia.org/wiki/Main_Page"), None);
        assert_eq!(
            direct_navigation("go to rust-lang.org please", "about:blank").as_deref(),
            Some("https://rust-lang.org")
        );
        assert_eq!(
            direct_navigation("read https://example.com/docs.", "about:blank").as_deref(),
            Some("https://example.com/docs")
        );
        assert_eq!(known_site("check my gmail"), Some("https://mail.google.com"));
        assert_eq!(known_site("googled"), None);
    }

    #[test]
    fn first_mentioned_site_wins() {
        assert_eq!(
            direct_navigation("open reddit and search for github", "about:blank").as_deref(),
            Some("https://www.reddit.com")
        );
        assert_eq!(
            direct_navigation("search google for youtube alternatives", "about:blank").as_deref(),
            Some("https://www.google.com")
        );
        assert_eq!(known_site("google maps directions to the airport"), Some("https://maps.google.com"));
        assert_eq!(known_site("find it on stack overflow, not github"), Some("https://stackoverflow.com"));
    }

    #[test]
    fn relevance() {
        assert!(is_relevant("search youtube for cats", "https://www.youtube.com/", "YouTube"));
        assert!(!is_relevant("open wikipedia", "https://www.youtube.com/", "YouTube"));
        assert!(is_relevant(
            "find rust tutorials",
            "https://www.google.com/search?q=rust+tutorials",
            "rust tutorials - Google Search"
        ));
        assert!(!is_relevant("find rust tutorials", "about:blank", ""));
    }

    #[test]
    fn in_page_wording() {
        assert!(wants_in_page("now click the first result"));
        assert!(wants_in_page("Scroll down a bit"));
        assert!(!wants_in_page("open wikipedia"));
    }

    #[test]
    fn chain_prefers_direct_site_then_in_page() {
        let plan = page_plan();
        let (name, action) = resolve(&ctx("search youtube for cats", "about:blank", "", &plan)).unwrap();
        assert_eq!(name, "direct_site");
        assert!(matches!(action, BrowsingAction::OpenUrl { ref url, .. } if url == "https://www.youtube.com"));

        let (name, action) = resolve(&ctx(
            "search youtube for cats",
            "https://www.youtube.com/results?search_query=cats",
            "cats - YouTube",
            &plan,
        ))
        .unwrap();
        assert_eq!(name, "in_page");
        assert_eq!(action.kind(), "page_actions");
    }

    #[test]
    fn plan_navigation_skips_the_open_page() {
        let plan = page_plan();
        let resolved = resolve_plan_navigation(&ctx("x", "https://www.youtube.com", "", &plan));
        assert_eq!(resolved, None);

        let plan = ChatBrowsingPlan {
            actions: vec![BrowsingAction::OpenUrl {
                url: "docs.rs".into(),
                in_new_tab: false,
            }],
            response: None,
        };
        let resolved = resolve_plan_navigation(&ctx("x", "about:blank", "", &plan));
        assert!(matches!(resolved, Some(BrowsingAction::OpenUrl { ref url, .. }) if url == "https://docs.rs"));
    }

    #[test]
    fn irrelevant_page_falls_back_to_search() {
        let plan = ChatBrowsingPlan::default();
        let (name, action) = resolve(&ctx("cheap flights to lisbon", "https://www.example.com/", "Example", &plan)).unwrap();
        assert_eq!(name, "search_fallback");
        assert_eq!(
            action,
            BrowsingAction::Search {
                query: "cheap flights to lisbon".into()
            }
        );

        let relevant = ctx(
            "cheap flights to lisbon",
            "https://www.flights.com/",
            "Cheap flights to Lisbon",
            &plan,
        );
        assert_eq!(resolve(&relevant), None);
    }

    #[test]
    fn youtube_shortcut() {
        assert_eq!(
            youtube_search_query("search youtube for lofi beats", "https://www.youtube.com/").as_deref(),
            Some("lofi beats")
        );
        assert_eq!(
            youtube_search_query("play never gonna give you up on youtube", "https://www.youtube.com").as_deref(),
            Some("never gonna give you up")
        );
        assert_eq!(youtube_search_query("search youtube for cats", "https://www.youtube.com/results?search_query=cats"), None);
        assert_eq!(youtube_search_query("open youtube", "https://www.youtube.com/"), None);

        let plan = youtube_search_plan("cats");
        let kinds: Vec<ActionKind> = plan.actions.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![ActionKind::Focus, ActionKind::Type, ActionKind::Press]);
        assert_eq!(youtube_results_url("lofi beats"), "https://www.youtube.com/results?search_query=lofi+beats");
    }
}
