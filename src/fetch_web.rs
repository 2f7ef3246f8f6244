//! Web article fetcher.
//!
//! Retrieves a page over HTTP (optionally through the rotating proxy) and
//! parses it into a [`StructuredDocument`]: an ordered list of heading,
//! paragraph, code, and list-item blocks the web chunker can respect. The
//! flat form consumed by the global embedder is produced by [`linearize`].

use std::time::Duration;

use reqwest::Url;
use scraper::{Html, Selector};

use crate::config::{FetcherConfig, ProxyConfig};
use crate::error::FetchError;
use crate::models::{BlockKind, DocBlock, StructuredDocument};

/// Build the shared HTTP client honoring timeout and optional proxy.
pub fn http_client(
    fetcher: &FetcherConfig,
    proxy: &ProxyConfig,
) -> Result<reqwest::Client, FetchError> {
    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(fetcher.timeout_secs))
        .user_agent("curator/0.3");
    if let Some(url) = &proxy.url {
        let proxy = reqwest::Proxy::all(url)
            .map_err(|e| FetchError::Unavailable(format!("invalid proxy url: {}", e)))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| FetchError::Network(e.to_string()))
}

/// Fetch a web page and parse it into structure + linearized text.
pub async fn fetch_page(
    fetcher: &FetcherConfig,
    proxy: &ProxyConfig,
    url: &str,
) -> Result<(StructuredDocument, String), FetchError> {
    let client = http_client(fetcher, proxy)?;
    let html = get_with_retries(&client, url, fetcher.max_retries).await?;
    let doc = parse_html(&html);
    if doc.blocks.is_empty() {
        return Err(FetchError::Malformed(format!(
            "no readable content at {}",
            url
        )));
    }
    let linearized = linearize(&doc);
    Ok((doc, linearized))
}

/// GET with exponential backoff on network errors and 5xx.
pub async fn get_with_retries(
    client: &reqwest::Client,
    url: &str,
    max_retries: u32,
) -> Result<String, FetchError> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        match client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response
                        .text()
                        .await
                        .map_err(|e| FetchError::Network(e.to_string()));
                }
                match status.as_u16() {
                    429 => return Err(FetchError::RateLimited),
                    404 | 410 => return Err(FetchError::NotFound(url.to_string())),
                    401 | 403 => return Err(FetchError::Forbidden(url.to_string())),
                    s if status.is_server_error() => {
                        last_err = Some(FetchError::Network(format!("HTTP {} from {}", s, url)));
                        continue;
                    }
                    s => {
                        return Err(FetchError::Unavailable(format!("HTTP {} from {}", s, url)))
                    }
                }
            }
            Err(e) => {
                last_err = Some(FetchError::Network(e.to_string()));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| FetchError::Network("fetch failed after retries".into())))
}

/// Parse HTML into an ordered block structure.
///
/// Headings, paragraphs, `<pre>` code blocks, and list items are kept in
/// document order; navigation, scripts, and styling fall away because only
/// these content tags are selected. Paragraphs nested inside list items or
/// `<pre>` are skipped to avoid duplicate text.
pub fn parse_html(html: &str) -> StructuredDocument {
    let document = Html::parse_document(html);

    let title = Selector::parse("title")
        .ok()
        .and_then(|sel| {
            document
                .select(&sel)
                .next()
                .map(|el| collapse_ws(&el.text().collect::<String>()))
        })
        .filter(|t| !t.is_empty());

    let mut blocks = Vec::new();
    let content_sel = match Selector::parse("h1, h2, h3, h4, h5, h6, p, pre, li") {
        Ok(sel) => sel,
        Err(_) => return StructuredDocument { title, blocks },
    };

    for element in document.select(&content_sel) {
        let name = element.value().name();

        // Skip nested content containers; the ancestor carries the text.
        let nested = element.ancestors().any(|node| {
            node.value()
                .as_element()
                .map(|e| matches!(e.name(), "li" | "pre"))
                .unwrap_or(false)
        });
        if nested {
            continue;
        }

        let kind = match name {
            "h1" => BlockKind::Heading(1),
            "h2" => BlockKind::Heading(2),
            "h3" => BlockKind::Heading(3),
            "h4" => BlockKind::Heading(4),
            "h5" => BlockKind::Heading(5),
            "h6" => BlockKind::Heading(6),
            "pre" => BlockKind::Code,
            "li" => BlockKind::ListItem,
            _ => BlockKind::Paragraph,
        };

        let text = if kind == BlockKind::Code {
            element.text().collect::<String>().trim_matches('\n').to_string()
        } else {
            collapse_ws(&element.text().collect::<Vec<_>>().join(" "))
        };
        if text.is_empty() {
            continue;
        }

        blocks.push(DocBlock { kind, text });
    }

    StructuredDocument { title, blocks }
}

/// Flatten a structured document: blocks joined by blank lines.
///
/// This is the canonical raw text archived for web articles, and the string
/// chunk offsets index into.
pub fn linearize(doc: &StructuredDocument) -> String {
    doc.blocks
        .iter()
        .map(|b| b.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Derive the stable `web:<domain>/<slug>` content id and the source domain.
pub fn web_content_id(url: &str) -> Result<(String, String), FetchError> {
    let parsed =
        Url::parse(url).map_err(|e| FetchError::Malformed(format!("bad url {}: {}", url, e)))?;
    let domain = parsed
        .host_str()
        .ok_or_else(|| FetchError::Malformed(format!("no host in {}", url)))?
        .trim_start_matches("www.")
        .to_string();

    let slug = parsed
        .path_segments()
        .and_then(|mut segs| segs.next_back().filter(|s| !s.is_empty()).map(sanitize_slug))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "index".to_string());

    Ok((format!("web:{}/{}", domain, slug), domain))
}

fn sanitize_slug(seg: &str) -> String {
    seg.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .trim_matches('-')
        .to_lowercase()
}

fn collapse_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
