//! Demo viewer: replays pre-authored assets from a JSON config.
//!
//! Nothing here touches a model. Each browser gets its own navigation state,
//! keyed by a session cookie, and every action is a form post answered with a
//! redirect back to the rendered page.

pub mod config;
pub mod overlay;
pub mod render;
pub mod session;

use crate::diffusion::encode_png;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{FromRequestParts, Multipart, Path, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::Router;
use config::DemoConfig;
use render::{CROP_HEALTH, NO_DESCRIPTION};
use session::{session_from_cookie_header, NavState, SessionStore, View, SESSION_COOKIE};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

pub const TRAIN_DELAY: Duration = Duration::from_millis(600);
const MAX_CROP_UPLOADS: usize = 2;

#[derive(Clone, Debug)]
pub struct ViewerState {
    pub config: Arc<DemoConfig>,
    pub sessions: Arc<SessionStore>,
    pub train_delay: Duration,
}

impl ViewerState {
    #[must_use]
    pub fn new(config: DemoConfig) -> Self {
        Self {
            config: Arc::new(config),
            sessions: Arc::new(SessionStore::new()),
            train_delay: TRAIN_DELAY,
        }
    }

    #[must_use]
    pub const fn with_train_delay(mut self, delay: Duration) -> Self {
        self.train_delay = delay;
        self
    }
}

/// The caller's session id. Nothing is stored until a handler changes it.
struct Session {
    id: Uuid,
    created: bool,
}

impl FromRequestParts<ViewerState> for Session {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &ViewerState) -> Result<Self, Self::Rejection> {
        let cookie = parts
            .headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(session_from_cookie_header);
        let (id, created) = state.sessions.resolve(cookie);
        if created {
            tracing::debug!(session = %id, "new viewer session");
        }
        Ok(Self { id, created })
    }
}

impl Session {
    /// Attach the session cookie when this request started the session.
    fn respond(&self, response: impl IntoResponse) -> Response {
        let mut response = response.into_response();
        if self.created {
            let cookie = format!("{SESSION_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax", self.id);
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
        }
        response
    }
}

fn domain_url(key: &str) -> String {
    format!("/domains/{key}")
}

fn render_state(config: &DemoConfig, state: &NavState) -> Html<String> {
    match &state.view {
        View::Domain(key) => match config.domain(key) {
            Some(domain) => Html(render::render_domain(config, key, domain, state)),
            None => Html(render::render_home(config)),
        },
        View::Home => Html(render::render_home(config)),
    }
}

async fn index(State(state): State<ViewerState>, session: Session) -> Response {
    let nav = state.sessions.snapshot(session.id);
    session.respond(render_state(&state.config, &nav))
}

async fn open_domain(
    State(state): State<ViewerState>,
    session: Session,
    Path(key): Path<String>,
) -> Response {
    let config = &state.config;
    let nav = state.sessions.update(session.id, |nav| {
        nav.open_domain(config, &key).then(|| nav.clone())
    });
    match nav {
        Some(nav) => session.respond(render_state(config, &nav)),
        None => {
            tracing::debug!(domain = %key, "unknown domain, going home");
            session.respond(Redirect::to("/"))
        }
    }
}

async fn go_home(State(state): State<ViewerState>, session: Session) -> Response {
    state.sessions.update(session.id, NavState::go_home);
    session.respond(Redirect::to("/"))
}

async fn train(
    State(state): State<ViewerState>,
    session: Session,
    Path(key): Path<String>,
) -> Response {
    if state.config.domain(&key).is_none() {
        return session.respond(Redirect::to("/"));
    }
    tokio::time::sleep(state.train_delay).await;
    state.sessions.update(session.id, |nav| nav.mark_trained(&key));
    tracing::info!(domain = %key, "Few-shot model marked as trained");
    session.respond(Redirect::to(&domain_url(&key)))
}

async fn generate(
    State(state): State<ViewerState>,
    session: Session,
    Path(key): Path<String>,
) -> Response {
    if state.config.domain(&key).is_none() {
        return session.respond(Redirect::to("/"));
    }
    state.sessions.update(session.id, |nav| nav.reveal_generated(&key));
    session.respond(Redirect::to(&domain_url(&key)))
}

/// File names of the uploaded images. Their content is never inspected.
async fn uploaded_names(multipart: Result<Multipart, MultipartRejection>) -> Vec<String> {
    let Ok(mut multipart) = multipart else {
        return Vec::new();
    };
    let mut names = Vec::new();
    while let Ok(Some(field)) = multipart.next_field().await {
        if let Some(name) = field.file_name().filter(|n| !n.is_empty()) {
            names.push(name.to_string());
        }
    }
    names
}

async fn classify(
    State(state): State<ViewerState>,
    session: Session,
    Path(key): Path<String>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    if state.config.domain(&key).is_none() {
        return session.respond(Redirect::to("/"));
    }
    let mut names = uploaded_names(multipart).await;
    if key == CROP_HEALTH {
        names.truncate(MAX_CROP_UPLOADS);
    } else {
        names.clear();
    }
    state
        .sessions
        .update(session.id, |nav| nav.reveal_classification(&key, names));
    session.respond(Redirect::to(&domain_url(&key)))
}

async fn describe(
    State(state): State<ViewerState>,
    session: Session,
    Path((key, section, index)): Path<(String, String, usize)>,
) -> Response {
    let Some(domain) = state.config.domain(&key) else {
        return session.respond(Redirect::to("/"));
    };
    let dialog = match section.as_str() {
        "fewshot" if index < domain.fewshot.len() => {
            Some(("Few-shot description", domain.fewshot_caption(index)))
        }
        "generated" => domain.generated_items().get(index).map(|item| {
            let text = item.caption.clone().unwrap_or_else(|| NO_DESCRIPTION.to_string());
            ("Generated sample description", text)
        }),
        _ => None,
    };
    if let Some((title, text)) = dialog {
        state
            .sessions
            .update(session.id, |nav| nav.open_dialog(title, text));
    }
    session.respond(Redirect::to(&domain_url(&key)))
}

async fn close_dialog(State(state): State<ViewerState>, session: Session) -> Response {
    state.sessions.update(session.id, NavState::close_dialog);
    session.respond(Redirect::to("/"))
}

async fn asset(State(state): State<ViewerState>, Path(id): Path<usize>) -> Response {
    let Some(path) = state.config.asset_path(id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mime = image::ImageFormat::from_path(&path)
                .map_or("application/octet-stream", |format| format.to_mime_type());
            ([(header::CONTENT_TYPE, mime)], bytes).into_response()
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "asset unreadable");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

async fn heatmap_overlay(
    State(state): State<ViewerState>,
    Path((key, index)): Path<(String, usize)>,
) -> Response {
    let item = state
        .config
        .domain(&key)
        .and_then(|domain| domain.classification_items().get(index).copied().cloned());
    let Some(item) = item.filter(|item| state.config.has_overlay(item)) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let config = Arc::clone(&state.config);
    let rendered = tokio::task::spawn_blocking(move || {
        let base = item.test_image.as_deref().and_then(|s| config.local_path(s));
        let heat = item.heatmap.as_deref().and_then(|s| config.local_path(s));
        overlay::overlay_heatmap(base.as_deref(), heat.as_deref(), item.heatmap_alpha)
            .map(|image| encode_png(&image))
    })
    .await;

    match rendered {
        Ok(Some(Ok(png))) => ([(header::CONTENT_TYPE, "image/png")], png).into_response(),
        Ok(Some(Err(e))) => {
            tracing::warn!(domain = %key, index, error = %e, "overlay encoding failed");
            StatusCode::NOT_FOUND.into_response()
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::error!(error = %e, "overlay task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn create_viewer_router(state: ViewerState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/home", post(go_home))
        .route("/domains/{key}", get(open_domain))
        .route("/domains/{key}/train", post(train))
        .route("/domains/{key}/generate", post(generate))
        .route("/domains/{key}/classify", post(classify))
        .route("/domains/{key}/describe/{section}/{index}", post(describe))
        .route("/dialog/close", post(close_dialog))
        .route("/assets/{id}", get(asset))
        .route("/overlay/{key}/{index}", get(heatmap_overlay))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
