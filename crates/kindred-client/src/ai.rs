//! AI text generation through the authenticated proxy.
//!
//! The proxy owns the provider key and the per-user daily call quota; the
//! client only forwards a prompt and a session token. Every AI feature has a
//! non-AI fallback so a failing proxy never blocks a user action.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use kindred_store::{MatchInsight, UserProfile};

use crate::error::AiError;

/// Sent when the AI cannot produce an icebreaker.
pub const DEFAULT_ICEBREAKER: &str = "Hey! What's your favorite way to stay active?";

const PLACEHOLDER_SCORE: u8 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    Json,
}

#[async_trait]
pub trait AiClient: Send + Sync {
    async fn generate_text(&self, prompt: &str, format: ResponseFormat) -> Result<String, AiError>;
}

#[derive(Serialize)]
struct ProxyRequest<'a> {
    prompt: &'a str,
    response_format: ResponseFormat,
}

#[derive(Deserialize)]
struct ProxyResponse {
    text: String,
}

/// [`AiClient`] speaking to the AI proxy over HTTPS.
pub struct ProxyAiClient {
    http: reqwest::Client,
    endpoint: String,
    session_token: Option<String>,
}

impl ProxyAiClient {
    pub fn new(endpoint: &str, session_token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.to_string(),
            session_token,
        }
    }
}

#[async_trait]
impl AiClient for ProxyAiClient {
    async fn generate_text(&self, prompt: &str, format: ResponseFormat) -> Result<String, AiError> {
        let mut request = self.http.post(&self.endpoint).json(&ProxyRequest {
            prompt,
            response_format: format,
        });
        if let Some(ref token) = self.session_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AiError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AiError::QuotaExceeded);
        }
        if !status.is_success() {
            return Err(AiError::Http(status.as_u16()));
        }

        let body: ProxyResponse = response
            .json()
            .await
            .map_err(|e| AiError::InvalidResponse(e.to_string()))?;
        Ok(body.text)
    }
}

/// Used when no proxy is configured.
pub struct DisabledAi;

#[async_trait]
impl AiClient for DisabledAi {
    async fn generate_text(&self, _prompt: &str, _format: ResponseFormat) -> Result<String, AiError> {
        Err(AiError::Unavailable("no AI proxy configured".into()))
    }
}

fn describe(profile: &UserProfile) -> String {
    let interests = if profile.interests.is_empty() {
        "none listed".to_string()
    } else {
        profile.interests.join(", ")
    };
    format!(
        "{} (bio: {}; interests: {})",
        profile.display_name,
        profile.bio.as_deref().unwrap_or("none"),
        interests
    )
}

pub fn compatibility_prompt(a: &UserProfile, b: &UserProfile) -> String {
    format!(
        "Rate the fitness-partner compatibility of two people.\n\
         Person A: {}\nPerson B: {}\n\
         Reply with JSON only: {{\"score\": 0-100, \"reason\": string, \"key_factors\": [string]}}",
        describe(a),
        describe(b)
    )
}

pub fn icebreaker_prompt(sender: &UserProfile, recipient: &UserProfile) -> String {
    format!(
        "Write one short, friendly opening message from {} to {} for a fitness \
         partner app. Mention a shared interest if there is one. Reply with the message only.",
        describe(sender),
        describe(recipient)
    )
}

#[derive(Deserialize)]
struct RawInsight {
    score: f64,
    reason: String,
    #[serde(default)]
    key_factors: Vec<String>,
}

/// Parse the proxy's JSON answer. Tolerates a fenced code block around the
/// object and clamps the score to `0..=100`.
pub fn parse_insight(raw: &str) -> Result<MatchInsight, AiError> {
    let trimmed = raw.trim();
    let body = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => return Err(AiError::InvalidResponse("no JSON object in response".into())),
    };

    let parsed: RawInsight =
        serde_json::from_str(body).map_err(|e| AiError::InvalidResponse(e.to_string()))?;
    if !parsed.score.is_finite() {
        return Err(AiError::InvalidResponse("score is not a number".into()));
    }

    Ok(MatchInsight {
        score: parsed.score.round().clamp(0.0, 100.0) as u8,
        reason: parsed.reason,
        key_factors: parsed.key_factors,
    })
}

/// Neutral insight stored when the AI is unavailable.
pub fn placeholder_insight() -> MatchInsight {
    MatchInsight {
        score: PLACEHOLDER_SCORE,
        reason: "You both liked each other".to_string(),
        key_factors: Vec::new(),
    }
}

/// Ask the AI for a compatibility insight, falling back to the placeholder.
pub async fn compatibility_insight(
    ai: &dyn AiClient,
    a: &UserProfile,
    b: &UserProfile,
) -> MatchInsight {
    let raw = match ai
        .generate_text(&compatibility_prompt(a, b), ResponseFormat::Json)
        .await
    {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "Compatibility insight unavailable, using placeholder");
            return placeholder_insight();
        }
    };

    parse_insight(&raw).unwrap_or_else(|e| {
        warn!(error = %e, "Unparseable compatibility insight, using placeholder");
        placeholder_insight()
    })
}
