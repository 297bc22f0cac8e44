//! Timetable screenshot parsing through a vision-language model.

use std::sync::OnceLock;
use std::time::Duration;

use base64::Engine;
use futures::future::BoxFuture;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::VisionConfig;
use crate::error::{Result, WorkerError};
use crate::models::Period;

/// Vision calls are slow; a full-page screenshot can take most of a minute.
const REQUEST_TIMEOUT_SECS: u64 = 90;

const DEFAULT_MEDIA_TYPE: &str = "image/png";

const TIMETABLE_PROMPT: &str = r#"This is a screenshot of a school timetable.

Entries are written like: "Day 4, Period 1, Computer Science HL (12 CSHL FAr[D]), DG69"
- Map day numbers to weekdays: 1=Mon, 2=Tue, 3=Wed, 4=Thu, 5=Fri
- For every slot give: day, period number (0 for homeroom or registration), name, start, end, type, room
- The name is the text after the period marker up to the opening parenthesis, trimmed
- The room is the last comma-separated token outside parentheses
- Skip anything inside parentheses
- type is "break" when the name mentions Break or Lunch, "study" when it mentions Study, otherwise "class"
- Times are 24h HH:MM (7:40am is 07:40, 1:55pm is 13:55); use "" when a time is not shown

Reply with a JSON array only, nothing else:
[{"day":"Mon","num":1,"name":"Computer Science HL","start":"10:20","end":"11:15","type":"class","room":"DG69"}]"#;

/// Turns a timetable screenshot into periods.
pub trait ScreenshotParser: Send + Sync {
    fn parse_screenshot<'a>(
        &'a self,
        image: &'a [u8],
        media_type: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Vec<Period>>>;
}

#[derive(Debug, Deserialize)]
struct MessagesReply {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    error: Option<ReplyError>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReplyError {
    #[serde(default)]
    message: String,
}

/// Client for the messages API of the vision provider.
#[derive(Clone)]
pub struct VisionClient {
    client: Client,
    config: VisionConfig,
    api_key: String,
}

impl VisionClient {
    pub fn new(config: &VisionConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| WorkerError::Validation("vision API key is not configured".to_string()))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| WorkerError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            config: config.clone(),
            api_key,
        })
    }

    fn request_body(&self, image: &[u8], media_type: &str) -> Value {
        let data = base64::engine::general_purpose::STANDARD.encode(image);
        json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "image", "source": { "type": "base64", "media_type": media_type, "data": data } },
                    { "type": "text", "text": TIMETABLE_PROMPT }
                ]
            }]
        })
    }

    async fn send(&self, image: &[u8], media_type: Option<&str>) -> Result<Vec<Period>> {
        if image.is_empty() {
            return Err(WorkerError::Validation("No image provided".to_string()));
        }
        let media_type = media_type.filter(|m| !m.is_empty()).unwrap_or(DEFAULT_MEDIA_TYPE);
        debug!(bytes = image.len(), media_type, model = %self.config.model, "Parsing screenshot");

        let response = self
            .client
            .post(&self.config.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.config.api_version)
            .json(&self.request_body(image, media_type))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        // Error objects can arrive with any status
        let reply: MessagesReply = match serde_json::from_str(&body) {
            Ok(reply) => reply,
            Err(_) if !status.is_success() => return Err(WorkerError::from_status(status, &body)),
            Err(e) => return Err(e.into()),
        };
        if let Some(error) = reply.error {
            warn!(status = status.as_u16(), error = %error.message, "Vision provider error");
            return Err(WorkerError::Upstream(error.message));
        }
        if !status.is_success() {
            return Err(WorkerError::from_status(status, &body));
        }
        periods_from_reply(&reply)
    }
}

impl ScreenshotParser for VisionClient {
    fn parse_screenshot<'a>(
        &'a self,
        image: &'a [u8],
        media_type: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Vec<Period>>> {
        Box::pin(self.send(image, media_type))
    }
}

impl std::fmt::Debug for VisionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionClient")
            .field("api_url", &self.config.api_url)
            .field("model", &self.config.model)
            .finish_non_exhaustive()
    }
}

fn fence_pattern() -> &'static Regex {
    static FENCES: OnceLock<Regex> = OnceLock::new();
    FENCES.get_or_init(|| Regex::new(r"```json|```").expect("fence pattern is valid"))
}

/// Remove markdown code fences the model sometimes wraps its JSON in.
pub fn strip_fences(text: &str) -> String {
    fence_pattern().replace_all(text, "").trim().to_string()
}

fn periods_from_reply(reply: &MessagesReply) -> Result<Vec<Period>> {
    let text = reply
        .content
        .iter()
        .find(|block| block.kind == "text")
        .and_then(|block| block.text.as_deref())
        .ok_or_else(|| WorkerError::Upstream("reply has no text block".to_string()))?;
    parse_periods(text)
}

/// Parse the model's text answer into periods, filling in missing kinds.
pub fn parse_periods(text: &str) -> Result<Vec<Period>> {
    let periods: Vec<Period> = serde_json::from_str(&strip_fences(text)).map_err(|e| {
        WorkerError::Upstream(format!("Failed to parse timetable: {}", e))
    })?;
    Ok(periods.into_iter().map(Period::normalized).collect())
}
