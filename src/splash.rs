//! Client for the tagging/event collaborator service.
//!
//! The service speaks plain JSON over HTTP and is treated as a black box:
//! post a tagging event, register dataset records, page through stored
//! project records. Unreachable service maps to
//! [`Error::BackendUnavailable`](crate::errors::Error::BackendUnavailable).

use serde_json::json;

use crate::errors::Error;

/// Page size used when listing stored dataset records.
const PAGE_LIMIT: usize = 5000;

pub struct SplashClient {
    uri: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for SplashClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SplashClient <{}>", self.uri)
    }
}

impl SplashClient {
    pub fn new(uri: &str) -> SplashClient {
        SplashClient {
            uri: uri.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, url: &str, body: serde_json::Value) -> Result<serde_json::Value, Error> {
        let resp = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::BackendUnavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Error::Fetch {
                uri: url.to_string(),
                reason: format!("status {}", resp.status()),
            });
        }

        resp.json().await.map_err(|e| Error::Fetch {
            uri: url.to_string(),
            reason: e.to_string(),
        })
    }

    /// Register a new tagging event and return its uid.
    pub async fn post_event(&self, tagger_id: &str) -> Result<String, Error> {
        let url = format!("{}/events", self.uri);
        let body = json!({
            "tagger_id": tagger_id,
            "run_time": chrono::Utc::now().to_rfc3339(),
        });

        let doc = self.post(&url, body).await?;
        doc["uid"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Fetch {
                uri: url,
                reason: "event response carries no uid".into(),
            })
    }

    /// Register dataset records and return their uids, in input order.
    pub async fn post_datasets(&self, records: &[serde_json::Value]) -> Result<Vec<String>, Error> {
        let url = format!("{}/datasets", self.uri);
        let doc = self.post(&url, json!(records)).await?;

        doc.as_array()
            .map(|uids| {
                uids.iter()
                    .filter_map(|u| u.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .ok_or_else(|| Error::Fetch {
                uri: url,
                reason: "dataset response is not a list of uids".into(),
            })
    }

    /// Fetch every stored dataset record of a project, paging until a short
    /// page signals the end.
    pub async fn project_datasets(
        &self,
        project_id: &str,
    ) -> Result<Vec<serde_json::Value>, Error> {
        let mut records = Vec::new();
        let mut offset = 0;

        loop {
            let url = format!(
                "{}?page%5Boffset%5D={}&page%5Blimit%5D={}",
                self.uri, offset, PAGE_LIMIT
            );
            let page = self.post(&url, json!({ "project": project_id })).await?;
            let page = page.as_array().cloned().ok_or_else(|| Error::Fetch {
                uri: url,
                reason: "dataset listing is not a list".into(),
            })?;

            let n = page.len();
            records.extend(page);
            if n < PAGE_LIMIT {
                break;
            }
            offset += PAGE_LIMIT;
        }

        Ok(records)
    }
}
