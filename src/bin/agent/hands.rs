use anyhow::{Result, anyhow};
use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use pagepilot::{HostError, LifecycleEvent, PageHost};
use serde_json::Value;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const DEBUG_ENDPOINT: &str = "http://127.0.0.1:9222";

pub struct HostOptions {
    /// Try attaching to a Chrome started with `--remote-debugging-port=9222` first.
    pub attach: bool,
    pub headless: bool,
    pub profile_dir: PathBuf,
}

/// One Chrome tab behind the [`PageHost`] contract. Created once, reused for all turns.
pub struct ChromeHost {
    _browser: Browser,
    tab: Arc<Tab>,
    events: broadcast::Sender<LifecycleEvent>,
    ready: Arc<AtomicBool>,
}

impl ChromeHost {
    /// Blocking; call from `spawn_blocking`.
    pub fn launch(options: &HostOptions) -> Result<Self> {
        if options.attach {
            info!("attempting to attach to existing Chrome on port 9222");
            match Browser::connect(DEBUG_ENDPOINT.to_string()) {
                Ok(browser) => {
                    let existing = {
                        let tabs = browser
                            .get_tabs()
                            .lock()
                            .map_err(|_| anyhow!("tab list lock poisoned"))?;
                        tabs.first().cloned()
                    };
                    let tab = match existing {
                        Some(tab) => {
                            info!("attached, using existing tab");
                            tab
                        }
                        None => browser.new_tab()?,
                    };
                    return Ok(Self::with_tab(browser, tab));
                }
                Err(e) => warn!(error = %e, "could not attach, launching a dedicated profile"),
            }
        }

        std::fs::create_dir_all(&options.profile_dir)?;
        let launch = LaunchOptions {
            headless: options.headless,
            path: find_chrome(),
            user_data_dir: Some(options.profile_dir.clone()),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-infobars"),
                OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: std::time::Duration::from_secs(600),
            ..Default::default()
        };

        info!(profile = %options.profile_dir.display(), "starting Chrome");
        let browser = Browser::new(launch).map_err(|e| anyhow!("Browser launch failed: {}", e))?;
        let tab = browser.new_tab()?;
        tab.navigate_to("about:blank")?;
        info!("Chrome ready");
        Ok(Self::with_tab(browser, tab))
    }

    fn with_tab(browser: Browser, tab: Arc<Tab>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            _browser: browser,
            tab,
            events,
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl PageHost for ChromeHost {
    fn url(&self) -> String {
        self.tab.get_url()
    }

    async fn execute_javascript(&self, script: &str) -> Result<Value, HostError> {
        let tab = self.tab.clone();
        let script = script.to_string();
        let evaluated = tokio::task::spawn_blocking(move || tab.evaluate(&script, true))
            .await
            .map_err(|e| HostError::Script(format!("evaluation task failed: {e}")))?;
        match evaluated {
            Ok(object) => Ok(object.value.unwrap_or(Value::Null)),
            Err(e) => Err(HostError::Script(e.to_string())),
        }
    }

    async fn load_url(&self, url: &str) -> Result<(), HostError> {
        self.ready.store(false, Ordering::SeqCst);
        self.emit(LifecycleEvent::DidStartLoading);

        let tab = self.tab.clone();
        let target = url.to_string();
        let navigated = tokio::task::spawn_blocking(move || -> Result<String> {
            tab.navigate_to(&target)?.wait_until_navigated()?;
            Ok(tab.get_url())
        })
        .await
        .map_err(|e| HostError::Navigation(format!("navigation task failed: {e}")))?;

        self.ready.store(true, Ordering::SeqCst);
        match navigated {
            Ok(landed) => {
                debug!(url = %landed, "navigated");
                self.emit(LifecycleEvent::DidNavigate { url: landed });
                self.emit(LifecycleEvent::DomReady);
                self.emit(LifecycleEvent::DidStopLoading);
                Ok(())
            }
            Err(e) => {
                let error = e.to_string();
                self.emit(LifecycleEvent::DidFailLoad {
                    url: url.to_string(),
                    error: error.clone(),
                });
                Err(HostError::Navigation(error))
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Well-known install locations; `None` lets headless_chrome search on its own.
fn find_chrome() -> Option<PathBuf> {
    let mut candidates = vec![
        PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
        PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
        PathBuf::from("/usr/bin/google-chrome"),
        PathBuf::from("/usr/bin/chromium"),
        PathBuf::from("/usr/bin/chromium-browser"),
    ];
    if let Some(local) = dirs::data_local_dir() {
        candidates.push(
            local
                .join("Google")
                .join("Chrome")
                .join("Application")
                .join("chrome.exe"),
        );
    }
    candidates.into_iter().find(|p| p.exists())
}
