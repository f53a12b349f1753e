use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use pmr_core::{HealthCheckRequest, HealthCheckResponse};
use pmr_storage::HttpFetcher;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::AdapterError;

/// Verifies whether a listing is still live on its portal.
///
/// Implementations report transport problems through
/// [`HealthCheckResponse::error`] instead of failing the call.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self, request: &HealthCheckRequest) -> HealthCheckResponse;
}

/// Per-source hints for reading a listing detail page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRules {
    #[serde(default)]
    pub price_selector: Option<String>,
    #[serde(default = "default_sold_markers")]
    pub sold_markers: Vec<String>,
    #[serde(default = "default_removed_markers")]
    pub removed_markers: Vec<String>,
}

impl Default for PageRules {
    fn default() -> Self {
        Self {
            price_selector: None,
            sold_markers: default_sold_markers(),
            removed_markers: default_removed_markers(),
        }
    }
}

fn default_sold_markers() -> Vec<String> {
    vec!["predané".into(), "rezervované - predané".into()]
}

fn default_removed_markers() -> Vec<String> {
    vec![
        "inzerát už nie je aktívny".into(),
        "inzerát bol odstránený".into(),
        "listing is no longer available".into(),
    ]
}

/// Classifies a fetched detail page. Markers are matched case-insensitively.
pub fn classify_listing_page(
    status: u16,
    body: &str,
    rules: &PageRules,
    current_price: f64,
) -> Result<HealthCheckResponse, AdapterError> {
    if status == 404 || status == 410 {
        return Ok(HealthCheckResponse::inactive(format!("http_{status}")));
    }

    let lower = body.to_lowercase();
    if let Some(marker) = rules
        .sold_markers
        .iter()
        .find(|m| lower.contains(&m.to_lowercase()))
    {
        return Ok(HealthCheckResponse::inactive(format!("sold: {marker}")));
    }
    if let Some(marker) = rules
        .removed_markers
        .iter()
        .find(|m| lower.contains(&m.to_lowercase()))
    {
        return Ok(HealthCheckResponse::inactive(format!("removed: {marker}")));
    }

    let Some(selector) = rules.price_selector.as_deref() else {
        return Ok(HealthCheckResponse::unchanged());
    };
    let document = Html::parse_document(body);
    let price = select_first_text(&document, selector)?
        .as_deref()
        .and_then(parse_price_text)
        .filter(|p| *p > 0.0);
    match price {
        Some(price) if (price - current_price).abs() >= 1.0 => {
            Ok(HealthCheckResponse::price_changed(price))
        }
        _ => Ok(HealthCheckResponse::unchanged()),
    }
}

fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, AdapterError> {
    let sel = Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))?;
    Ok(document
        .select(&sel)
        .next()
        .map(|n| n.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty()))
}

/// Reads the first amount from portal price text such as `189 000 €`,
/// `189.000 €` or `1 250,50 €/mes.`.
pub fn parse_price_text(text: &str) -> Option<f64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let run: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, ' ' | '\u{a0}' | '\u{202f}' | '.' | ','))
        .collect();
    let run = run.trim_end_matches(|c: char| !c.is_ascii_digit());

    // A trailing separator followed by one or two digits is a decimal point;
    // every other separator groups thousands.
    let decimal_at = run
        .rfind(['.', ','])
        .filter(|idx| matches!(run.len() - idx - 1, 1 | 2));
    let mut normalized = String::with_capacity(run.len());
    for (idx, ch) in run.char_indices() {
        if ch.is_ascii_digit() {
            normalized.push(ch);
        } else if Some(idx) == decimal_at {
            normalized.push('.');
        }
    }
    normalized.parse::<f64>().ok()
}

/// Fetches the listing's detail page and reads its state with [`classify_listing_page`].
#[derive(Debug, Clone)]
pub struct HttpHealthChecker {
    http: Arc<HttpFetcher>,
    rules: HashMap<String, PageRules>,
    run_id: Uuid,
}

impl HttpHealthChecker {
    pub fn new(http: Arc<HttpFetcher>, rules: HashMap<String, PageRules>) -> Self {
        Self {
            http,
            rules,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    fn rules_for(&self, source: &str) -> PageRules {
        self.rules.get(source).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl HealthChecker for HttpHealthChecker {
    async fn check(&self, request: &HealthCheckRequest) -> HealthCheckResponse {
        let rules = self.rules_for(&request.source);
        let (status, body) = match self
            .http
            .fetch_bytes(self.run_id, &request.source, &request.source_url)
            .await
        {
            Ok(resp) => (resp.status.as_u16(), resp.text()),
            Err(err) => match err.status() {
                Some(status @ (404 | 410)) => (status, String::new()),
                _ => return HealthCheckResponse::failed(err.to_string()),
            },
        };
        match classify_listing_page(status, &body, &rules, request.price) {
            Ok(resp) => resp,
            Err(err) => {
                debug!(property_id = %request.property_id, error = %err, "page rules failed");
                HealthCheckResponse::failed(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> PageRules {
        PageRules {
            price_selector: Some(".price strong".into()),
            ..PageRules::default()
        }
    }

    #[test]
    fn parses_common_price_formats() {
        assert_eq!(parse_price_text("189 000 €"), Some(189_000.0));
        assert_eq!(parse_price_text("Cena: 189.000 €"), Some(189_000.0));
        assert_eq!(parse_price_text("1\u{a0}250,50 €/mes."), Some(1_250.5));
        assert_eq!(parse_price_text("Cena dohodou"), None);
    }

    #[test]
    fn gone_status_means_inactive() {
        let resp = classify_listing_page(410, "", &rules(), 100_000.0).unwrap();
        assert!(!resp.is_active);
        assert_eq!(resp.removal_reason.as_deref(), Some("http_410"));
    }

    #[test]
    fn sold_marker_wins_over_price() {
        let html = r#"<div class="badge">PREDANÉ</div><p class="price"><strong>99 000 €</strong></p>"#;
        let resp = classify_listing_page(200, html, &rules(), 100_000.0).unwrap();
        assert!(!resp.is_active);
        assert!(pmr_core::removal_reason_indicates_sale(
            resp.removal_reason.as_deref().unwrap()
        ));
    }

    #[test]
    fn reads_new_price_from_selector() {
        let html = r#"<p class="price"><strong>95 500 €</strong></p>"#;
        let resp = classify_listing_page(200, html, &rules(), 100_000.0).unwrap();
        assert!(resp.price_changed);
        assert_eq!(resp.new_price, Some(95_500.0));

        let same = classify_listing_page(200, html, &rules(), 95_500.0).unwrap();
        assert_eq!(same, HealthCheckResponse::unchanged());
    }

    #[test]
    fn invalid_selector_is_an_error() {
        let bad = PageRules {
            price_selector: Some("<<".into()),
            ..PageRules::default()
        };
        assert!(classify_listing_page(200, "<p></p>", &bad, 1.0).is_err());
    }
}
