//! Axum + Askama form for registering sources and downloading harvest reports.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Form, Router,
};
use harvest_core::{HarvestRequest, Source};
use harvest_engine::{render_csv_report, report_file_name, HarvestConfig, Harvester};
use harvest_storage::SourceRegistry;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "harvest-web";

pub const DEFAULT_POST_COUNT: usize = 10;

#[derive(Clone)]
pub struct AppState {
    pub registry: SourceRegistry,
    pub harvester: Harvester,
    pub max_age: Option<chrono::Duration>,
}

impl AppState {
    pub fn new(registry: SourceRegistry, harvester: Harvester) -> Self {
        Self {
            registry,
            harvester,
            max_age: None,
        }
    }

    pub fn with_max_age(mut self, max_age: Option<chrono::Duration>) -> Self {
        self.max_age = max_age;
        self
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    sources: Vec<Source>,
    post_count: usize,
    message: Option<String>,
}

/// Submitted form. Checkbox values repeat under one name, so the body is read
/// as raw pairs.
#[derive(Debug, Default)]
struct HarvestForm {
    selected_source_ids: Vec<String>,
    post_count: Option<String>,
    new_source_id: String,
    new_source_alias: String,
}

impl HarvestForm {
    fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let mut form = Self::default();
        for (key, value) in pairs {
            match key.as_str() {
                "selected_source_ids" if !value.trim().is_empty() => {
                    form.selected_source_ids.push(value)
                }
                "post_count" => form.post_count = Some(value),
                "new_source_id" => form.new_source_id = value,
                "new_source_alias" => form.new_source_alias = value,
                _ => {}
            }
        }
        form
    }

    fn post_limit(&self) -> Result<usize, String> {
        match self.post_count.as_deref().map(str::trim) {
            None | Some("") => Ok(DEFAULT_POST_COUNT),
            Some(raw) => match raw.parse::<usize>() {
                Ok(count) if count >= 1 => Ok(count),
                _ => Err(format!("post count must be a whole number of at least 1, got {raw:?}")),
            },
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler).post(submit_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = HarvestConfig::from_env();
    let harvester = config.build_harvester().await?;
    let state = AppState::new(config.registry(), harvester).with_max_age(config.max_age());
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "serving harvest form");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    render_index(&state, DEFAULT_POST_COUNT, None, StatusCode::OK).await
}

async fn submit_handler(
    State(state): State<Arc<AppState>>,
    Form(pairs): Form<Vec<(String, String)>>,
) -> Response {
    let form = HarvestForm::from_pairs(pairs);
    let mut notice = None;

    let new_id = form.new_source_id.trim();
    let new_alias = form.new_source_alias.trim();
    match (new_id.is_empty(), new_alias.is_empty()) {
        (true, true) => {}
        (false, false) => {
            if let Err(err) = state.registry.add(Source::new(new_id, new_alias)).await {
                return server_error(err.into());
            }
            notice = Some(format!("Registered {new_alias} ({new_id})."));
        }
        _ => notice = Some("A new source needs both an id and a display name.".to_string()),
    }

    let post_limit = match form.post_limit() {
        Ok(limit) => limit,
        Err(message) => {
            return render_index(&state, DEFAULT_POST_COUNT, Some(message), StatusCode::BAD_REQUEST)
                .await
        }
    };

    if form.selected_source_ids.is_empty() {
        return render_index(&state, post_limit, notice, StatusCode::OK).await;
    }

    let sources = match state.registry.resolve(&form.selected_source_ids).await {
        Ok(sources) => sources,
        Err(err) => return server_error(err.into()),
    };
    let request = match HarvestRequest::new(sources, post_limit) {
        Ok(request) => request,
        Err(err) => {
            warn!(%err, selected = form.selected_source_ids.len(), "nothing to harvest");
            let message = "None of the selected sources are registered.".to_string();
            return render_index(&state, post_limit, Some(message), StatusCode::OK).await;
        }
    };
    let request = match state.max_age {
        Some(max_age) => request.with_max_age(max_age),
        None => request,
    };

    let result = state.harvester.harvest(&request).await;
    match render_csv_report(&result, request.sources()) {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", report_file_name(&result)),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn render_index(
    state: &AppState,
    post_count: usize,
    message: Option<String>,
    status: StatusCode,
) -> Response {
    match state.registry.load().await {
        Ok(sources) => {
            let mut resp = render_html(IndexTemplate {
                sources,
                post_count,
                message,
            });
            if resp.status() == StatusCode::OK {
                *resp.status_mut() = status;
            }
            resp
        }
        Err(err) => server_error(err.into()),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use harvest_engine::testing::CountingFactory;
    use harvest_engine::{PoolConfig, SessionPool};
    use harvest_listing::testing::{listing_table, MockListing, MockWeb};
    use harvest_listing::{CrawlSettings, ListingLayout};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state(dir: &std::path::Path, web: MockWeb) -> AppState {
        let pool = SessionPool::new(
            Arc::new(CountingFactory::new(web)),
            PoolConfig::default(),
        );
        let settings = CrawlSettings {
            element_timeout: Duration::from_millis(20),
            control_timeout: Duration::from_millis(5),
            settle_delay: Duration::ZERO,
            overscan_pages: 2,
        };
        let harvester =
            Harvester::new(pool, ListingLayout::default(), settings).expect("layout");
        AppState::new(SourceRegistry::new(dir.join("sources.yaml")), harvester)
    }

    fn sample_web() -> MockWeb {
        let table = listing_table(&[
            ("First light", "/PostView.naver?blogId=moon&logNo=1", "2024.03.07."),
            ("Second light", "/PostView.naver?blogId=moon&logNo=2", "2024.03.05."),
        ]);
        MockWeb::new(ListingLayout::default()).with_site("moon", MockListing::new().with_page(table))
    }

    fn post_form(body: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri("/")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn body_text(resp: Response) -> String {
        let body = resp.into_body().collect().await.expect("body").to_bytes();
        String::from_utf8(body.to_vec()).expect("utf8")
    }

    #[tokio::test]
    async fn index_lists_registered_sources() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(dir.path(), sample_web());
        state
            .registry
            .add(Source::new("moon", "Moonlight Diary"))
            .await
            .expect("add");

        let resp = app(state)
            .oneshot(axum::http::Request::builder().uri("/").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("Moonlight Diary"));
        assert!(text.contains(r#"name="selected_source_ids" value="moon""#));
    }

    #[tokio::test]
    async fn registering_without_selection_rerenders_page() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(dir.path(), sample_web());
        let registry = state.registry.clone();

        let resp = app(state)
            .oneshot(post_form("new_source_id=moon&new_source_alias=Moonlight+Diary&post_count=5"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_text(resp).await.contains("Registered Moonlight Diary"));
        assert_eq!(
            registry.load().await.expect("load"),
            vec![Source::new("moon", "Moonlight Diary")]
        );
    }

    #[tokio::test]
    async fn selected_sources_come_back_as_csv_attachment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = state(dir.path(), sample_web());
        state
            .registry
            .add(Source::new("moon", "Moonlight Diary"))
            .await
            .expect("add");

        let resp = app(state)
            .oneshot(post_form(
                "selected_source_ids=moon&selected_source_ids=unknown&post_count=1",
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .expect("header")
            .starts_with("attachment; filename="));
        let text = body_text(resp).await;
        let lines: Vec<_> = text.trim_start_matches('\u{feff}').lines().collect();
        assert_eq!(
            lines,
            vec![
                "name,date,title,link",
                "Moonlight Diary,*(03.07),First light,https://blog.naver.com/PostView.naver?blogId=moon&logNo=1",
            ]
        );
    }

    #[tokio::test]
    async fn unknown_selection_rerenders_with_notice() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resp = app(state(dir.path(), sample_web()))
            .oneshot(post_form("selected_source_ids=ghost"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_text(resp).await.contains("None of the selected sources are registered."));
    }

    #[tokio::test]
    async fn invalid_post_count_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let resp = app(state(dir.path(), sample_web()))
            .oneshot(post_form("selected_source_ids=moon&post_count=0"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
