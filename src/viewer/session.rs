use super::config::DemoConfig;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "rare_event_session";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum View {
    #[default]
    Home,
    Domain(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialog {
    pub title: String,
    pub text: String,
}

/// Navigation state of one browser session. Purely presentational.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NavState {
    pub view: View,
    pub trained: HashSet<String>,
    pub show_generated: HashSet<String>,
    pub show_classification: HashSet<String>,
    pub uploaded_names: HashMap<String, Vec<String>>,
    pub dialog: Option<Dialog>,
}

impl NavState {
    /// Select `key` if the config knows it. Returns whether the view changed.
    pub fn open_domain(&mut self, config: &DemoConfig, key: &str) -> bool {
        if config.domain(key).is_none() {
            return false;
        }
        self.view = View::Domain(key.to_string());
        true
    }

    pub fn go_home(&mut self) {
        self.view = View::Home;
    }

    #[must_use]
    pub fn selected_domain(&self) -> Option<&str> {
        match &self.view {
            View::Domain(key) => Some(key),
            View::Home => None,
        }
    }

    #[must_use]
    pub fn is_trained(&self, key: &str) -> bool {
        self.trained.contains(key)
    }

    pub fn mark_trained(&mut self, key: &str) {
        self.trained.insert(key.to_string());
    }

    /// Reveal generated samples; only a trained domain can generate.
    pub fn reveal_generated(&mut self, key: &str) -> bool {
        self.is_trained(key) && {
            self.show_generated.insert(key.to_string());
            true
        }
    }

    /// Reveal classification results; only a trained domain can classify.
    pub fn reveal_classification(&mut self, key: &str, uploaded: Vec<String>) -> bool {
        if !self.is_trained(key) {
            return false;
        }
        self.show_classification.insert(key.to_string());
        self.uploaded_names.insert(key.to_string(), uploaded);
        true
    }

    pub fn open_dialog(&mut self, title: impl Into<String>, text: impl Into<String>) {
        self.dialog = Some(Dialog {
            title: title.into(),
            text: text.into(),
        });
    }

    pub fn close_dialog(&mut self) {
        self.dialog = None;
    }
}

/// Sessions untouched for this long are dropped on the next insert.
pub const SESSION_IDLE_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug)]
struct Entry {
    state: NavState,
    last_seen: Instant,
}

/// Per-browser navigation state, keyed by the session cookie.
///
/// A session is only stored once an action changes it, so read-only visits
/// leave nothing behind. Idle sessions are swept whenever a new one is stored.
#[derive(Debug)]
pub struct SessionStore {
    sessions: Mutex<HashMap<Uuid, Entry>>,
    idle_ttl: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::with_idle_ttl(SESSION_IDLE_TTL)
    }
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_idle_ttl(idle_ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle_ttl,
        }
    }

    /// Session id for a cookie value. The flag is true when the cookie was
    /// missing or malformed and a fresh id must be handed to the browser.
    /// An id that is well formed but unknown reads as a fresh session.
    #[must_use]
    pub fn resolve(&self, cookie: Option<&str>) -> (Uuid, bool) {
        match cookie.and_then(|c| Uuid::parse_str(c).ok()) {
            Some(id) => (id, false),
            None => (Uuid::new_v4(), true),
        }
    }

    #[must_use]
    pub fn snapshot(&self, id: Uuid) -> NavState {
        let mut sessions = self.sessions.lock();
        sessions.get_mut(&id).map_or_else(NavState::default, |entry| {
            entry.last_seen = Instant::now();
            entry.state.clone()
        })
    }

    pub fn update<R>(&self, id: Uuid, f: impl FnOnce(&mut NavState) -> R) -> R {
        let mut sessions = self.sessions.lock();
        let now = Instant::now();
        if !sessions.contains_key(&id) {
            let ttl = self.idle_ttl;
            let before = sessions.len();
            sessions.retain(|_, entry| now.duration_since(entry.last_seen) < ttl);
            let evicted = before - sessions.len();
            if evicted > 0 {
                tracing::debug!(evicted, "dropped idle viewer sessions");
            }
        }
        let entry = sessions.entry(id).or_insert_with(|| Entry {
            state: NavState::default(),
            last_seen: now,
        });
        entry.last_seen = now;
        f(&mut entry.state)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

/// Find the session id in a `Cookie` header value.
#[must_use]
pub fn session_from_cookie_header(header: &str) -> Option<&str> {
    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then_some(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config() -> DemoConfig {
        DemoConfig::from_json(
            r#"{"branding": {"name": "Demo"},
                "domains": {"flood": {"title": "Flood"}, "wildfire": {"title": "Wildfire"}}}"#,
            PathBuf::from("."),
        )
        .unwrap()
    }

    #[test]
    fn only_known_domains_can_be_selected() {
        let config = config();
        let mut state = NavState::default();
        assert!(!state.open_domain(&config, "volcano"));
        assert_eq!(state.view, View::Home);

        assert!(state.open_domain(&config, "flood"));
        assert_eq!(state.selected_domain(), Some("flood"));

        state.go_home();
        assert_eq!(state.selected_domain(), None);
    }

    #[test]
    fn generation_and_classification_require_training() {
        let mut state = NavState::default();
        assert!(!state.reveal_generated("flood"));
        assert!(!state.reveal_classification("flood", vec![]));
        assert!(state.show_generated.is_empty());

        state.mark_trained("flood");
        assert!(state.reveal_generated("flood"));
        assert!(state.reveal_classification("flood", vec!["a.jpg".into()]));
        assert!(state.show_classification.contains("flood"));
        assert_eq!(state.uploaded_names["flood"], vec!["a.jpg"]);
        assert!(!state.is_trained("wildfire"));
    }

    #[test]
    fn dialog_opens_and_closes() {
        let mut state = NavState::default();
        state.open_dialog("Few-shot description", "Smoke plume");
        assert_eq!(state.dialog.as_ref().unwrap().text, "Smoke plume");
        state.close_dialog();
        assert!(state.dialog.is_none());
    }

    #[test]
    fn resolve_keeps_well_formed_ids() {
        let store = SessionStore::new();
        let (id, created) = store.resolve(None);
        assert!(created);

        let (same, created) = store.resolve(Some(&id.to_string()));
        assert_eq!(same, id);
        assert!(!created);

        let (other, created) = store.resolve(Some("garbage"));
        assert_ne!(other, id);
        assert!(created);
    }

    #[test]
    fn reads_do_not_store_sessions() {
        let store = SessionStore::new();
        for _ in 0..50 {
            let (id, _) = store.resolve(None);
            assert_eq!(store.snapshot(id), NavState::default());
        }
        assert!(store.is_empty());
    }

    #[test]
    fn idle_sessions_are_evicted_on_insert() {
        let store = SessionStore::with_idle_ttl(Duration::ZERO);
        let first = Uuid::new_v4();
        store.update(first, |s| s.mark_trained("flood"));
        assert_eq!(store.len(), 1);

        store.update(Uuid::new_v4(), NavState::go_home);
        assert_eq!(store.len(), 1);
        assert!(!store.snapshot(first).is_trained("flood"));
    }

    #[test]
    fn active_sessions_survive_sweeps() {
        let store = SessionStore::new();
        let first = Uuid::new_v4();
        store.update(first, |s| s.mark_trained("flood"));
        store.update(Uuid::new_v4(), NavState::go_home);
        assert_eq!(store.len(), 2);
        assert!(store.snapshot(first).is_trained("flood"));
    }

    #[test]
    fn updates_are_visible_in_snapshots() {
        let store = SessionStore::new();
        let (id, _) = store.resolve(None);
        store.update(id, |s| s.mark_trained("flood"));
        assert!(store.snapshot(id).is_trained("flood"));
    }

    #[test]
    fn cookie_header_parsing() {
        let header = format!("theme=dark; {SESSION_COOKIE}=abc-123; other=1");
        assert_eq!(session_from_cookie_header(&header), Some("abc-123"));
        assert_eq!(session_from_cookie_header("theme=dark"), None);
    }
}
