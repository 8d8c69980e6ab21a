use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use harvest_listing::{RenderingSession, SessionError};
use reqwest::Method;
use serde_json::{json, Value as JsonValue};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

/// W3C identifier key for element references.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Attributes that only exist as DOM properties.
const PROPERTY_NAMES: [&str; 4] = ["outerHTML", "innerHTML", "textContent", "innerText"];

#[derive(Debug, Clone)]
pub struct WebDriverConfig {
    /// Driver endpoint, e.g. a local chromedriver.
    pub endpoint: String,
    pub headless: bool,
    pub extra_args: Vec<String>,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9515".to_string(),
            headless: true,
            extra_args: Vec::new(),
            request_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Starts browser sessions through a WebDriver endpoint.
#[derive(Debug, Clone)]
pub struct WebDriverLauncher {
    client: reqwest::Client,
    config: WebDriverConfig,
}

impl WebDriverLauncher {
    pub fn new(config: WebDriverConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("building webdriver http client")?;
        Ok(Self { client, config })
    }

    fn browser_args(&self, profile_dir: &Path) -> Vec<String> {
        let mut args = vec![
            "--no-sandbox".to_string(),
            "--disable-dev-shm-usage".to_string(),
            format!("--user-data-dir={}", profile_dir.display()),
        ];
        if self.config.headless {
            args.push("--headless=new".to_string());
        }
        args.extend(self.config.extra_args.iter().cloned());
        args
    }

    /// Launch a browser whose profile lives in `profile_dir`.
    pub async fn launch(&self, profile_dir: &Path) -> Result<WebDriverSession, SessionError> {
        let endpoint = self.config.endpoint.trim_end_matches('/').to_string();
        let body = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": self.browser_args(profile_dir) }
                }
            }
        });

        let value = send(&self.client, Method::POST, &format!("{endpoint}/session"), Some(body))
            .await
            .map_err(|err| SessionError::Launch(err.to_string()))?;
        let session_id = value
            .get("sessionId")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| SessionError::Launch("driver returned no session id".to_string()))?;

        debug!(session_id, "webdriver session started");
        Ok(WebDriverSession {
            client: self.client.clone(),
            base: format!("{endpoint}/session/{session_id}"),
            poll_interval: self.config.poll_interval,
            closed: false,
        })
    }
}

/// One live browser session.
#[derive(Debug)]
pub struct WebDriverSession {
    client: reqwest::Client,
    base: String,
    poll_interval: Duration,
    closed: bool,
}

#[derive(Debug)]
enum WireError {
    NoSuchElement,
    Driver { error: String, message: String },
    Transport(String),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::NoSuchElement => f.write_str("no such element"),
            WireError::Driver { error, message } => write!(f, "{error}: {message}"),
            WireError::Transport(message) => write!(f, "transport: {message}"),
        }
    }
}

impl WireError {
    fn is_retryable_click(&self) -> bool {
        matches!(self, WireError::NoSuchElement)
            || matches!(self, WireError::Driver { error, .. }
                if error == "element not interactable"
                    || error == "element click intercepted"
                    || error == "stale element reference")
    }
}

async fn send(
    client: &reqwest::Client,
    method: Method,
    url: &str,
    body: Option<JsonValue>,
) -> Result<JsonValue, WireError> {
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request
        .send()
        .await
        .map_err(|err| WireError::Transport(err.to_string()))?;
    let status = response.status();
    let payload: JsonValue = response
        .json()
        .await
        .map_err(|err| WireError::Transport(err.to_string()))?;
    let value = payload.get("value").cloned().unwrap_or(JsonValue::Null);

    if status.is_success() {
        return Ok(value);
    }
    let error = value
        .get("error")
        .and_then(JsonValue::as_str)
        .unwrap_or("unknown error")
        .to_string();
    if error == "no such element" || error == "no such frame" {
        return Err(WireError::NoSuchElement);
    }
    let message = value
        .get("message")
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string();
    Err(WireError::Driver { error, message })
}

impl WebDriverSession {
    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<JsonValue>,
    ) -> Result<JsonValue, WireError> {
        send(&self.client, method, &format!("{}{}", self.base, path), body).await
    }

    async fn find(&self, selector: &str) -> Result<Option<String>, WireError> {
        let body = json!({ "using": "css selector", "value": selector });
        match self.command(Method::POST, "/element", Some(body)).await {
            Ok(value) => Ok(value
                .get(ELEMENT_KEY)
                .and_then(JsonValue::as_str)
                .map(str::to_string)),
            Err(WireError::NoSuchElement) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn find_within(&self, selector: &str, timeout: Duration) -> Result<String, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.find(selector).await {
                Ok(Some(element)) => return Ok(element),
                Ok(None) => {}
                Err(err) => return Err(transport(err)),
            }
            if Instant::now() >= deadline {
                return Err(SessionError::ElementTimeout {
                    selector: selector.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

fn transport(err: WireError) -> SessionError {
    SessionError::Transport(err.to_string())
}

fn optional_string(value: JsonValue) -> Option<String> {
    match value {
        JsonValue::String(text) => Some(text),
        JsonValue::Null => None,
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl RenderingSession for WebDriverSession {
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        let span = info_span!("webdriver_navigate", url);
        self.command(Method::POST, "/url", Some(json!({ "url": url })))
            .instrument(span)
            .await
            .map(|_| ())
            .map_err(|err| SessionError::Navigation {
                url: url.to_string(),
                message: err.to_string(),
            })
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<(), SessionError> {
        self.find_within(selector, timeout).await.map(|_| ())
    }

    async fn click(&mut self, selector: &str, timeout: Duration) -> Result<(), SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let element = self.find_within(selector, remaining).await?;
            match self
                .command(Method::POST, &format!("/element/{element}/click"), Some(json!({})))
                .await
            {
                Ok(_) => return Ok(()),
                Err(err) if err.is_retryable_click() && Instant::now() < deadline => {
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(err) if err.is_retryable_click() => {
                    return Err(SessionError::ElementTimeout {
                        selector: selector.to_string(),
                        timeout,
                    })
                }
                Err(err) => {
                    return Err(SessionError::Interaction {
                        selector: selector.to_string(),
                        message: err.to_string(),
                    })
                }
            }
        }
    }

    async fn read_text(&mut self, selector: &str) -> Result<Option<String>, SessionError> {
        let Some(element) = self.find(selector).await.map_err(transport)? else {
            return Ok(None);
        };
        let value = self
            .command(Method::GET, &format!("/element/{element}/text"), None)
            .await
            .map_err(transport)?;
        Ok(optional_string(value))
    }

    async fn read_attribute(
        &mut self,
        selector: &str,
        name: &str,
    ) -> Result<Option<String>, SessionError> {
        let Some(element) = self.find(selector).await.map_err(transport)? else {
            return Ok(None);
        };
        let kind = if PROPERTY_NAMES.contains(&name) {
            "property"
        } else {
            "attribute"
        };
        let value = self
            .command(Method::GET, &format!("/element/{element}/{kind}/{name}"), None)
            .await
            .map_err(transport)?;
        Ok(optional_string(value))
    }

    async fn enter_frame(&mut self, selector: &str, timeout: Duration) -> Result<(), SessionError> {
        let element = self.find_within(selector, timeout).await?;
        let body = json!({ "id": { ELEMENT_KEY: element } });
        self.command(Method::POST, "/frame", Some(body))
            .await
            .map(|_| ())
            .map_err(|err| SessionError::Interaction {
                selector: selector.to_string(),
                message: err.to_string(),
            })
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.command(Method::DELETE, "", None)
            .await
            .map(|_| ())
            .map_err(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn launcher(server: &MockServer) -> WebDriverLauncher {
        WebDriverLauncher::new(WebDriverConfig {
            endpoint: server.uri(),
            poll_interval: Duration::from_millis(10),
            ..WebDriverConfig::default()
        })
        .expect("launcher")
    }

    async fn mount_session(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": { "sessionId": "s1", "capabilities": {} }
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn launch_passes_isolated_profile() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .and(body_partial_json(json!({
                "capabilities": { "alwaysMatch": { "browserName": "chrome" } }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": { "sessionId": "s1", "capabilities": {} }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let launcher = launcher(&server);
        let args = launcher.browser_args(Path::new("/tmp/profile-a"));
        assert!(args.contains(&"--user-data-dir=/tmp/profile-a".to_string()));
        assert!(args.contains(&"--headless=new".to_string()));

        launcher
            .launch(Path::new("/tmp/profile-a"))
            .await
            .expect("launch");
    }

    #[tokio::test]
    async fn reads_table_markup_through_property_endpoint() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/session/s1/url"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/s1/element"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": { ELEMENT_KEY: "e7" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/session/s1/element/e7/property/outerHTML"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": "<table></table>"
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/session/s1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .expect(1)
            .mount(&server)
            .await;

        let mut session = launcher(&server)
            .launch(Path::new("/tmp/profile-b"))
            .await
            .expect("launch");
        session.navigate("https://example.test/list").await.expect("navigate");
        session
            .wait_for("table.list", Duration::from_millis(100))
            .await
            .expect("table present");
        let markup = session
            .read_attribute("table.list", "outerHTML")
            .await
            .expect("read");
        assert_eq!(markup.as_deref(), Some("<table></table>"));

        session.close().await.expect("close");
        session.close().await.expect("second close is a no-op");
    }

    #[tokio::test]
    async fn missing_element_times_out() {
        let server = MockServer::start().await;
        mount_session(&server).await;
        Mock::given(method("POST"))
            .and(path("/session/s1/element"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "value": { "error": "no such element", "message": "nothing matched" }
            })))
            .mount(&server)
            .await;

        let mut session = launcher(&server)
            .launch(Path::new("/tmp/profile-c"))
            .await
            .expect("launch");
        let err = session
            .click("a.next", Duration::from_millis(40))
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "{err}");
        assert_eq!(session.read_text("a.next").await.expect("read"), None);
    }

    #[tokio::test]
    async fn launch_failure_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "value": { "error": "session not created", "message": "chrome not found" }
            })))
            .mount(&server)
            .await;

        let err = launcher(&server)
            .launch(Path::new("/tmp/profile-d"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Launch(ref m) if m.contains("chrome not found")));
    }
}
