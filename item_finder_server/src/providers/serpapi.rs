use std::time::Duration;

use async_trait::async_trait;
use item_finder::{CapabilityError, ProductMatch, ProductSearcher};
use serde::Deserialize;

use super::{check_status, transport_error};

const UNTITLED: &str = "Untitled";

#[derive(Debug, Default, Deserialize)]
struct LensResponse {
    #[serde(default)]
    visual_matches: Vec<VisualMatch>,
    #[serde(default)]
    inline_shopping_results: Vec<ShoppingResult>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VisualMatch {
    title: Option<String>,
    link: Option<String>,
    thumbnail: Option<String>,
    price: Option<VisualPrice>,
}

#[derive(Debug, Deserialize)]
struct VisualPrice {
    extracted_value: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ShoppingResult {
    title: Option<String>,
    link: Option<String>,
    thumbnail: Option<String>,
    extracted_price: Option<f64>,
}

/// Reverse image search through SerpAPI's `google_lens` engine.
pub struct LensSearcher {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    limit: usize,
    timeout: Duration,
}

impl LensSearcher {
    pub fn new(
        client: reqwest::Client,
        endpoint: &str,
        api_key: &str,
        limit: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            limit,
            timeout,
        }
    }
}

/// Visual matches first, then inline shopping results, skipping entries without a
/// link, capped at `limit`. SerpAPI's "no results" error is an empty list.
fn collect_matches(response: LensResponse, limit: usize) -> Result<Vec<ProductMatch>, CapabilityError> {
    if let Some(error) = response.error {
        if error.contains("hasn't returned any results") {
            return Ok(Vec::new());
        }
        return Err(CapabilityError::Failed(error));
    }

    let visual = response.visual_matches.into_iter().filter_map(|m| {
        Some(ProductMatch {
            link: m.link.filter(|l| !l.is_empty())?,
            title: m.title.unwrap_or_else(|| UNTITLED.to_string()),
            thumbnail: m.thumbnail,
            price: m.price.and_then(|p| p.extracted_value),
        })
    });
    let shopping = response.inline_shopping_results.into_iter().filter_map(|s| {
        Some(ProductMatch {
            link: s.link.filter(|l| !l.is_empty())?,
            title: s.title.unwrap_or_else(|| UNTITLED.to_string()),
            thumbnail: s.thumbnail,
            price: s.extracted_price,
        })
    });

    Ok(visual.chain(shopping).take(limit).collect())
}

#[async_trait]
impl ProductSearcher for LensSearcher {
    async fn search(&self, url: &str) -> Result<Vec<ProductMatch>, CapabilityError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("engine", "google_lens"),
                ("hl", "en"),
                ("url", url),
                ("api_key", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;
        let parsed: LensResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;
        let matches = collect_matches(parsed, self.limit)?;
        tracing::debug!(matches = matches.len(), "lens search returned");
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> LensResponse {
        serde_json::from_str(body).expect("parse lens response")
    }

    #[test]
    fn visual_matches_come_before_shopping_results() {
        let response = parse(
            r#"{
                "visual_matches": [
                    {"title": "Oak chair", "link": "https://a.example/1", "thumbnail": "https://t/1.jpg",
                     "price": {"value": "$49.99", "extracted_value": 49.99}},
                    {"title": "No link"},
                    {"link": "https://a.example/2"}
                ],
                "inline_shopping_results": [
                    {"title": "Pine chair", "link": "https://b.example/1", "extracted_price": 30.0}
                ]
            }"#,
        );

        let matches = collect_matches(response, 5).expect("matches");

        assert_eq!(matches.len(), 3);
        assert_eq!(matches[0].title, "Oak chair");
        assert_eq!(matches[0].price, Some(49.99));
        assert_eq!(matches[0].thumbnail.as_deref(), Some("https://t/1.jpg"));
        assert_eq!(matches[1].title, UNTITLED);
        assert_eq!(matches[1].price, None);
        assert_eq!(matches[2].link, "https://b.example/1");
        assert_eq!(matches[2].price, Some(30.0));
    }

    #[test]
    fn results_are_capped() {
        let items: Vec<String> = (0..9)
            .map(|i| format!(r#"{{"title": "t{i}", "link": "https://x/{i}"}}"#))
            .collect();
        let response = parse(&format!(r#"{{"visual_matches": [{}]}}"#, items.join(",")));
        assert_eq!(collect_matches(response, 3).expect("matches").len(), 3);
    }

    #[test]
    fn no_results_error_is_an_empty_list() {
        let response = parse(r#"{"error": "Google Lens hasn't returned any results for this query."}"#);
        assert!(collect_matches(response, 5).expect("empty").is_empty());
    }

    #[test]
    fn other_errors_fail() {
        let response = parse(r#"{"error": "Invalid API key."}"#);
        assert_eq!(
            collect_matches(response, 5).expect_err("error"),
            CapabilityError::Failed("Invalid API key.".to_string())
        );
    }
}
