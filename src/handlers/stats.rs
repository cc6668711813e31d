//! Office headcount report fetched from the company scripts endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::{HandlerRegistry, IntentHandler, Services};
use crate::config::StatsConfig;
use crate::error::HandlerError;
use crate::state::Outcome;
use crate::task::{EventSnapshot, Task};

/// Leading report fields that are column headers, not offices.
const HEADER_FIELDS: usize = 2;

pub(super) fn register(registry: &mut HandlerRegistry, services: &Services) {
    registry.register(Arc::new(GalateanCount {
        stats: services.stats.clone(),
    }));
}

/// One labelled cell of the headcount report.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReportField {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub value: String,
}

/// Headcount per office: two header fields, then (office, count) pairs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeadcountReport {
    pub text: String,
    pub fields: Vec<ReportField>,
}

impl HeadcountReport {
    /// Headers plus the field pair of `office`, if the report lists it.
    pub fn for_office(&self, office: &str) -> Vec<ReportField> {
        let mut fields: Vec<ReportField> =
            self.fields.iter().take(HEADER_FIELDS).cloned().collect();
        let rows = self.fields.get(HEADER_FIELDS..).unwrap_or(&[]);
        for (i, field) in rows.iter().enumerate() {
            if field.value == office {
                fields.push(field.clone());
                if let Some(count) = rows.get(i + 1) {
                    fields.push(count.clone());
                }
            }
        }
        fields
    }
}

/// Source of the headcount report.
#[async_trait]
pub trait StatsClient: Send + Sync {
    async fn headcount(&self, event: &EventSnapshot) -> Result<HeadcountReport, HandlerError>;
}

/// Calls the `count_galateans` function of the scripts endpoint.
pub struct ScriptsStats {
    http: reqwest::Client,
    url: Option<String>,
    token: SecretString,
}

#[derive(Deserialize)]
struct ScriptsResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    attachments: Vec<Attachment>,
}

#[derive(Deserialize)]
struct Attachment {
    #[serde(default)]
    fields: Vec<ReportField>,
}

impl ScriptsStats {
    pub fn new(config: &StatsConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: config.url.clone(),
            token: config.token.clone(),
        }
    }
}

#[async_trait]
impl StatsClient for ScriptsStats {
    async fn headcount(&self, event: &EventSnapshot) -> Result<HeadcountReport, HandlerError> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| HandlerError::Stats("SCRIPTS_URL is not configured".into()))?;

        let response = self
            .http
            .get(url)
            .query(&[
                ("function", "count_galateans"),
                ("text", "show count of Galateans"),
                ("token", self.token.expose_secret()),
                ("user_name", event.user_name.as_str()),
                ("user_id", event.user_id.as_str()),
                ("channel_name", event.channel_name.as_str()),
                ("channel_id", event.channel_id.as_str()),
                ("action", "hal"),
            ])
            .send()
            .await
            .map_err(|e| HandlerError::Stats(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HandlerError::Stats(format!("{status}: {body}")));
        }
        let body: ScriptsResponse = response
            .json()
            .await
            .map_err(|e| HandlerError::Stats(e.to_string()))?;

        Ok(HeadcountReport {
            text: body.text,
            fields: body
                .attachments
                .into_iter()
                .next()
                .map(|a| a.fields)
                .unwrap_or_default(),
        })
    }
}

/// Office code for a spoken location. `None` means report every office.
pub fn normalize_location(location: &str) -> Option<&'static str> {
    match location.trim().to_lowercase().as_str() {
        "london" | "england" | "britain" | "great britain" | "uk" => Some("LN"),
        "boston" | "somerville" | "davis" | "davis square" | "davis sq" | "massachusetts"
        | "mass" => Some("MA"),
        "tampa" | "florida" => Some("FL"),
        _ => None,
    }
}

fn render(text: &str, fields: &[ReportField]) -> String {
    let mut reply = text.to_string();
    for field in fields {
        let line = match (field.title.is_empty(), field.value.is_empty()) {
            (false, false) => format!("{}: {}", field.title, field.value),
            (false, true) => field.title.clone(),
            _ => field.value.clone(),
        };
        if !reply.is_empty() {
            reply.push('\n');
        }
        reply.push_str(&line);
    }
    reply
}

/// Answers "how many of us are in <office>".
pub struct GalateanCount {
    stats: Arc<dyn StatsClient>,
}

impl GalateanCount {
    pub fn new(stats: Arc<dyn StatsClient>) -> Self {
        Self { stats }
    }
}

#[async_trait]
impl IntentHandler for GalateanCount {
    fn intent(&self) -> &str {
        "galatean-count"
    }

    fn example(&self) -> &str {
        "How many Galateans are in Boston?"
    }

    async fn handle(&self, task: &Task) -> Result<Outcome, HandlerError> {
        let event = task.event();
        let office = task.entities().best_value("location").and_then(normalize_location);
        let report = self.stats.headcount(event).await?;

        let reply = match office {
            Some(office) => {
                tracing::debug!(office, "Reporting headcount for one office");
                render(&report.text, &report.for_office(office))
            }
            None => render(&report.text, &report.fields),
        };
        task.output().send(&event.channel_id, reply).await?;
        Ok(Outcome::Done)
    }
}
