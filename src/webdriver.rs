use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::browser::{Browser, Element, Launcher, Rect};
use crate::config::BrowserSettings;
use crate::error::BrowserError;

/// W3C element reference key.
const ELEMENT_KEY: &str = "element-6066-11e4-a52f-4a7c6b5d1a8e";
const ESCAPE_KEY: &str = "\u{E00C}";

/// One W3C WebDriver session (chromedriver, geckodriver, selenium standalone…).
pub struct WebDriver {
    client: reqwest::Client,
    base_url: String,
    session_id: String,
}

impl WebDriver {
    pub async fn start(settings: &BrowserSettings) -> Result<Self, BrowserError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        let base_url = settings.webdriver_url.trim_end_matches('/').to_string();

        let mut chrome_args = vec![format!("--window-size={},{}", settings.width, settings.height)];
        let mut firefox_args = Vec::new();
        if settings.headless {
            chrome_args.push("--headless=new".to_string());
            firefox_args.push("-headless".to_string());
        }
        let caps = json!({
            "capabilities": {
                "alwaysMatch": {
                    "goog:chromeOptions": { "args": chrome_args },
                    "moz:firefoxOptions": { "args": firefox_args },
                }
            }
        });

        let value = send(&client, Method::POST, &format!("{}/session", base_url), Some(caps)).await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| BrowserError::Driver {
                status: 0,
                message: format!("no sessionId in new-session reply: {value}"),
            })?
            .to_string();

        info!(session = %session_id, "webdriver session started");
        Ok(Self {
            client,
            base_url,
            session_id,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/session/{}{}", self.base_url, self.session_id, path)
    }

    async fn get(&self, path: &str) -> Result<Value, BrowserError> {
        send(&self.client, Method::GET, &self.url(path), None).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, BrowserError> {
        send(&self.client, Method::POST, &self.url(path), Some(body)).await
    }

    async fn execute(&self, script: &str, args: Vec<Value>) -> Result<Value, BrowserError> {
        self.post("/execute/sync", json!({ "script": script, "args": args }))
            .await
    }

    async fn actions(&self, actions: Value) -> Result<(), BrowserError> {
        self.post("/actions", json!({ "actions": actions })).await?;
        Ok(())
    }
}

async fn send(
    client: &reqwest::Client,
    method: Method,
    url: &str,
    body: Option<Value>,
) -> Result<Value, BrowserError> {
    debug!(%method, url, "webdriver");
    let mut req = client.request(method, url);
    if let Some(body) = body {
        req = req.json(&body);
    }
    let resp = req.send().await?;
    let status = resp.status();
    let payload: Value = resp.json().await.unwrap_or(Value::Null);
    let value = payload.get("value").cloned().unwrap_or(Value::Null);

    if status.is_success() {
        return Ok(value);
    }

    let error = value.get("error").and_then(Value::as_str).unwrap_or("");
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    Err(match error {
        "no such element" => BrowserError::NoSuchElement(message),
        "stale element reference" => BrowserError::StaleElement(message),
        "timeout" | "script timeout" => BrowserError::Timeout(Duration::ZERO, message),
        _ => BrowserError::Driver {
            status: status.as_u16(),
            message: if message.is_empty() {
                format!("{error} ({url})")
            } else {
                message
            },
        },
    })
}

fn elements_from(value: Value) -> Vec<Element> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.get(ELEMENT_KEY).and_then(Value::as_str))
                .map(|id| Element(id.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn decode_png(value: Value) -> Result<Vec<u8>, BrowserError> {
    let encoded = value.as_str().unwrap_or_default();
    BASE64.decode(encoded).map_err(|e| BrowserError::Driver {
        status: 0,
        message: format!("bad screenshot payload: {e}"),
    })
}

#[async_trait]
impl Browser for WebDriver {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.post("/url", json!({ "url": url })).await?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, BrowserError> {
        Ok(self.get("/url").await?.as_str().unwrap_or_default().to_string())
    }

    async fn find_all(&self, selector: &str) -> Result<Vec<Element>, BrowserError> {
        let value = self
            .post("/elements", json!({ "using": "css selector", "value": selector }))
            .await?;
        Ok(elements_from(value))
    }

    async fn find_within(
        &self,
        parent: &Element,
        selector: &str,
    ) -> Result<Vec<Element>, BrowserError> {
        let value = self
            .post(
                &format!("/element/{}/elements", parent.0),
                json!({ "using": "css selector", "value": selector }),
            )
            .await?;
        Ok(elements_from(value))
    }

    async fn attribute(&self, el: &Element, name: &str) -> Result<Option<String>, BrowserError> {
        let kind = if name.ends_with("HTML") { "property" } else { "attribute" };
        let value = self.get(&format!("/element/{}/{}/{}", el.0, kind, name)).await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn text(&self, el: &Element) -> Result<String, BrowserError> {
        let value = self.get(&format!("/element/{}/text", el.0)).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn is_displayed(&self, el: &Element) -> Result<bool, BrowserError> {
        let value = self.get(&format!("/element/{}/displayed", el.0)).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn rect(&self, el: &Element) -> Result<Rect, BrowserError> {
        let v = self.get(&format!("/element/{}/rect", el.0)).await?;
        let num = |k: &str| v.get(k).and_then(Value::as_f64).unwrap_or(0.0);
        Ok(Rect {
            x: num("x"),
            y: num("y"),
            width: num("width"),
            height: num("height"),
        })
    }

    async fn click(&self, el: &Element) -> Result<(), BrowserError> {
        self.post(&format!("/element/{}/click", el.0), json!({})).await?;
        Ok(())
    }

    async fn type_text(&self, el: &Element, text: &str) -> Result<(), BrowserError> {
        self.post(&format!("/element/{}/value", el.0), json!({ "text": text }))
            .await?;
        Ok(())
    }

    async fn press_escape(&self) -> Result<(), BrowserError> {
        self.actions(json!([{
            "type": "key",
            "id": "keyboard",
            "actions": [
                { "type": "keyDown", "value": ESCAPE_KEY },
                { "type": "keyUp", "value": ESCAPE_KEY },
            ]
        }]))
        .await
    }

    async fn scroll_to(&self, y: f64) -> Result<(), BrowserError> {
        self.execute("window.scrollTo(0, arguments[0]);", vec![json!(y)])
            .await?;
        Ok(())
    }

    async fn scroll_y(&self) -> Result<f64, BrowserError> {
        let v = self.execute("return window.scrollY;", vec![]).await?;
        Ok(v.as_f64().unwrap_or(0.0))
    }

    async fn element_screenshot(&self, el: &Element) -> Result<Vec<u8>, BrowserError> {
        decode_png(self.get(&format!("/element/{}/screenshot", el.0)).await?)
    }

    async fn move_pointer(&self, x: i64, y: i64) -> Result<(), BrowserError> {
        self.actions(json!([{
            "type": "pointer",
            "id": "mouse",
            "parameters": { "pointerType": "mouse" },
            "actions": [{ "type": "pointerMove", "duration": 250, "origin": "viewport", "x": x, "y": y }]
        }]))
        .await
    }

    async fn quit(&self) -> Result<(), BrowserError> {
        send(
            &self.client,
            Method::DELETE,
            &format!("{}/session/{}", self.base_url, self.session_id),
            None,
        )
        .await?;
        info!(session = %self.session_id, "webdriver session closed");
        Ok(())
    }
}

pub struct WebDriverLauncher {
    settings: BrowserSettings,
}

impl WebDriverLauncher {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Launcher for WebDriverLauncher {
    async fn launch(&self) -> Result<Box<dyn Browser>, BrowserError> {
        Ok(Box::new(WebDriver::start(&self.settings).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(url: &str) -> BrowserSettings {
        BrowserSettings {
            webdriver_url: url.to_string(),
            ..BrowserSettings::default()
        }
    }

    async fn started(server: &MockServer) -> WebDriver {
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "value": { "sessionId": "s1", "capabilities": {} } })),
            )
            .mount(server)
            .await;
        WebDriver::start(&settings(&server.uri())).await.unwrap()
    }

    #[tokio::test]
    async fn finds_elements_by_css() {
        let server = MockServer::start().await;
        let wd = started(&server).await;
        Mock::given(method("POST"))
            .and(path("/session/s1/elements"))
            .and(body_partial_json(json!({ "using": "css selector", "value": "div.unit" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [ { ELEMENT_KEY: "e1" }, { ELEMENT_KEY: "e2" } ]
            })))
            .mount(&server)
            .await;

        let found = wd.find_all("div.unit").await.unwrap();
        assert_eq!(found, vec![Element("e1".into()), Element("e2".into())]);
    }

    #[tokio::test]
    async fn maps_driver_errors() {
        let server = MockServer::start().await;
        let wd = started(&server).await;
        Mock::given(method("GET"))
            .and(path("/session/s1/element/gone/text"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "value": { "error": "stale element reference", "message": "detached" }
            })))
            .mount(&server)
            .await;

        let err = wd.text(&Element("gone".into())).await.unwrap_err();
        assert!(matches!(err, BrowserError::StaleElement(m) if m == "detached"));
    }

    #[tokio::test]
    async fn reads_rect_and_outer_html() {
        let server = MockServer::start().await;
        let wd = started(&server).await;
        Mock::given(method("GET"))
            .and(path("/session/s1/element/e1/rect"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": { "x": 12.0, "y": 340.5, "width": 500, "height": 200 }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/session/s1/element/e1/property/outerHTML"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "value": "<div>x</div>" })),
            )
            .mount(&server)
            .await;

        let el = Element("e1".into());
        let r = wd.rect(&el).await.unwrap();
        assert_eq!((r.x, r.y, r.width, r.height), (12.0, 340.5, 500.0, 200.0));
        assert_eq!(
            wd.attribute(&el, "outerHTML").await.unwrap().as_deref(),
            Some("<div>x</div>")
        );
    }
}
