use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::semantic::{FetchError, Page, PageSource};

/// Header the backend expects the agent token in.
const TOKEN_HEADER: &str = "x-agent-token";

/// Backend client for the paginated contrast-pair listing.
pub struct PairsRemote {
    remote_addr: String,
    client: reqwest::Client,
}

impl PairsRemote {
    pub fn new(addr: &str, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let remote_addr = addr.strip_suffix("/").unwrap_or(addr).to_string();

        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let mut value = HeaderValue::from_str(&token)?;
            value.set_sensitive(true);
            headers.insert(TOKEN_HEADER, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(PairsRemote {
            remote_addr,
            client,
        })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        log::debug!("{}{}", self.remote_addr, url);
        let url = format!("{}{}", self.remote_addr, url);

        self.client.get(&url)
    }
}

#[async_trait::async_trait]
impl PageSource for PairsRemote {
    async fn fetch_page(&self, page: usize, count: usize) -> Result<Page, FetchError> {
        let resp = self
            .get("/contrast-pairs/")
            .query(&[
                ("page", page.to_string()),
                ("count", count.to_string()),
                ("include_embeddings", "true".to_string()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                page,
                status: status.as_u16(),
            });
        }

        let text = resp.text().await?;

        serde_json::from_str::<Page>(&text).map_err(|err| {
            log::error!("{err}. tried to parse page {page}: {:.200}", text);
            FetchError::Decode {
                page,
                reason: err.to_string(),
            }
        })
    }
}
