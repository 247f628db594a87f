// src/concept.rs
// CONCEPT INGESTION
// Turns the caller's concept (text and/or product page URL) into the stimulus
// block every persona is shown.

use std::time::Duration;

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, SsrError};

const MAX_DESCRIPTION_CHARS: usize = 2000;
const MAX_PAGE_BLOCKS: usize = 20;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConceptInput {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
}

/// Structured concept content for prompting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConceptArtifact {
    pub title: Option<String>,
    pub description: String,
    pub price: Option<String>,
    pub url: Option<String>,
}

impl ConceptArtifact {
    pub fn from_text(description: &str) -> Self {
        Self {
            title: None,
            description: description.trim().to_string(),
            price: None,
            url: None,
        }
    }

    pub fn as_prompt_block(&self) -> String {
        let mut parts = Vec::new();
        if let Some(title) = &self.title {
            parts.push(format!("Product: {}", title));
        }
        if let Some(price) = &self.price {
            parts.push(format!("Price: {}", price));
        }
        parts.push(self.description.trim().to_string());
        if let Some(url) = &self.url {
            parts.push(format!("Source: {}", url));
        }
        parts.join("\n")
    }
}

fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Extracts `(title, description)` from a product page.
pub fn extract_page_text(html: &str) -> (Option<String>, String) {
    let document = Html::parse_document(html);

    let title = Selector::parse("title").ok().and_then(|selector| {
        document
            .select(&selector)
            .next()
            .map(|node| clean_text(&node.text().collect::<String>()))
            .filter(|t| !t.is_empty())
    });

    let article = match Selector::parse("p, li") {
        Ok(selector) => document
            .select(&selector)
            .take(MAX_PAGE_BLOCKS)
            .map(|node| clean_text(&node.text().collect::<Vec<_>>().join(" ")))
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
        Err(_) => String::new(),
    };

    let description: String = clean_text(&article).chars().take(MAX_DESCRIPTION_CHARS).collect();
    (title, description)
}

async fn fetch_url_text(client: &reqwest::Client, url: &str) -> Result<(Option<String>, String)> {
    info!(%url, "fetching concept page");
    let body = client
        .get(url)
        .timeout(Duration::from_secs(15))
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    Ok(extract_page_text(&body))
}

/// Resolves a concept into its artifact. Only fetches the URL when the caller
/// did not supply a description or title.
pub async fn ingest_concept(client: &reqwest::Client, concept: &ConceptInput) -> Result<ConceptArtifact> {
    let mut title = non_blank(&concept.title);
    let mut description = non_blank(&concept.text).unwrap_or_default();
    let url = non_blank(&concept.url);

    if let Some(url) = &url {
        if description.is_empty() || title.is_none() {
            match fetch_url_text(client, url).await {
                Ok((fetched_title, fetched_desc)) => {
                    title = title.or(fetched_title);
                    if description.is_empty() {
                        description = fetched_desc;
                    }
                }
                Err(err) if !description.is_empty() => {
                    warn!(%url, error = %err, "concept page fetch failed, using supplied text");
                }
                Err(err) => return Err(err),
            }
        }
    }

    if description.trim().is_empty() {
        return Err(SsrError::validation("concept description could not be determined"));
    }

    Ok(ConceptArtifact {
        title,
        description,
        price: non_blank(&concept.price),
        url,
    })
}
