use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::live::derive::{map_label, mode_label};
use crate::live::model::parse_timestamp;
use crate::live::MatchId;

/// Bearer credential for the match API. Refresh and storage are the
/// caller's business.
#[derive(Clone)]
pub struct Session {
    pub access_token: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Session(***)")
    }
}

/// A match the backend is currently tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveMatch {
    pub id: i64,
    pub match_uuid: String,
    #[serde(deserialize_with = "lenient_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "lenient_optional_timestamp")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Unknown until the first snapshot reaches the backend
    #[serde(default, deserialize_with = "null_as_empty")]
    pub game_map: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub game_mode: String,
}

impl ActiveMatch {
    /// Picker label, e.g. "Bind · Competitive".
    pub fn label(&self) -> String {
        format!("{} · {}", map_label(&self.game_map), mode_label(&self.game_mode))
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
}

fn lenient_optional_timestamp<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw))),
        None => Ok(None),
    }
}

/// Client for the `/active_matches/` REST resource.
#[derive(Clone)]
pub struct ActiveMatchClient {
    http: Client,
    api_url: Url,
    session: Option<Session>,
}

impl ActiveMatchClient {
    pub fn new(api_url: &str, session: Option<Session>) -> Result<Self> {
        let api_url = Url::parse(api_url).context("Invalid active match API URL")?;
        if api_url.cannot_be_a_base() {
            anyhow::bail!("Active match API URL {} cannot carry a path", api_url);
        }
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(ActiveMatchClient {
            http,
            api_url,
            session,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.api_url.clone();
        // Cannot fail: `new` rejected cannot-be-a-base URLs.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.session {
            Some(session) => request.bearer_auth(&session.access_token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let resp = self
            .authorized(request)
            .send()
            .await
            .with_context(|| format!("Active match API request failed ({})", what))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Active match API error {} ({}): {}", status, what, body);
        }
        Ok(resp)
    }

    /// GET /active_matches/
    pub async fn list(&self) -> Result<Vec<ActiveMatch>> {
        let url = self.endpoint(&["active_matches", ""]);
        debug!("Fetching active matches: {}", url);
        let resp = self.send(self.http.get(url), "list").await?;
        let matches: Vec<ActiveMatch> = resp
            .json()
            .await
            .context("Failed to parse active match list")?;
        debug!("{} active match(es)", matches.len());
        Ok(matches)
    }

    /// GET /active_matches/{id}/
    pub async fn get(&self, id: i64) -> Result<ActiveMatch> {
        let url = self.endpoint(&["active_matches", &id.to_string(), ""]);
        let resp = self.send(self.http.get(url), "get").await?;
        resp.json().await.context("Failed to parse active match")
    }

    /// POST /active_matches/
    pub async fn create(&self, match_id: &MatchId) -> Result<ActiveMatch> {
        let url = self.endpoint(&["active_matches", ""]);
        let body = serde_json::json!({ "match_uuid": match_id.as_str() });
        let resp = self.send(self.http.post(url).json(&body), "create").await?;
        let created: ActiveMatch = resp
            .json()
            .await
            .context("Failed to parse created active match")?;
        info!("Registered active match {} (id={})", match_id, created.id);
        Ok(created)
    }

    /// PATCH /active_matches/{id}/ with `ended_at` set to now.
    pub async fn end(&self, id: i64) -> Result<ActiveMatch> {
        let url = self.endpoint(&["active_matches", &id.to_string(), ""]);
        let body = serde_json::json!({ "ended_at": Utc::now().to_rfc3339() });
        let resp = self.send(self.http.patch(url).json(&body), "end").await?;
        resp.json().await.context("Failed to parse ended active match")
    }

    /// DELETE /active_matches/{id}/
    pub async fn delete(&self, id: i64) -> Result<()> {
        let url = self.endpoint(&["active_matches", &id.to_string(), ""]);
        self.send(self.http.delete(url), "delete").await?;
        Ok(())
    }

    /// DELETE /active_matches/uuid/{match_uuid}
    pub async fn deregister(&self, match_id: &MatchId) -> Result<()> {
        let url = self.endpoint(&["active_matches", "uuid", match_id.as_str()]);
        self.send(self.http.delete(url), "deregister").await?;
        info!("Deregistered active match {}", match_id);
        Ok(())
    }
}


/// Minimal local stand-in for the active match API.
#[cfg(test)]
pub(crate) mod stub {
    use axum::http::{HeaderMap, Method, StatusCode, Uri};
    use axum::response::{IntoResponse, Response};
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorded {
        hits: Vec<String>,
        auth: Vec<String>,
    }

    pub struct StubApi {
        pub base_url: String,
        recorded: Arc<Mutex<Recorded>>,
    }

    impl StubApi {
        /// "METHOD /path" for every request received, in order.
        pub fn hits(&self) -> Vec<String> {
            self.recorded.lock().unwrap().hits.clone()
        }

        pub fn auth_headers(&self) -> Vec<String> {
            self.recorded.lock().unwrap().auth.clone()
        }
    }

    /// Serve on an ephemeral port. With `fail` set every request gets a 500.
    pub async fn spawn(fail: bool) -> StubApi {
        let recorded: Arc<Mutex<Recorded>> = Arc::default();
        let shared = Arc::clone(&recorded);
        let app = Router::new().fallback(move |method: Method, uri: Uri, headers: HeaderMap| {
            let shared = Arc::clone(&shared);
            async move { respond(&shared, fail, method, uri, headers) }
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        StubApi {
            base_url: format!("http://{}", addr),
            recorded,
        }
    }

    fn respond(
        recorded: &Mutex<Recorded>,
        fail: bool,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
    ) -> Response {
        {
            let mut recorded = recorded.lock().unwrap();
            recorded.hits.push(format!("{} {}", method, uri.path()));
            if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
                recorded.auth.push(auth.to_string());
            }
        }
        if fail {
            return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
        }
        let row = json!({
            "id": 1,
            "match_uuid": "u1",
            "created_at": "2024-05-01T12:00:00",
            "game_map": null,
            "game_mode": null
        });
        match method {
            Method::DELETE => StatusCode::NO_CONTENT.into_response(),
            Method::GET if uri.path() == "/active_matches/" => Json(json!([row])).into_response(),
            _ => Json(row).into_response(),
        }
    }
}
