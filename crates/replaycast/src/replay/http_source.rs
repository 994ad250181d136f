//! HTTP implementation of [`FrameSource`].
//!
//! Talks to a JSON feed laid out as
//! `<base>/events/<id>/frames?since=<iso>` for window frames and
//! `<base>/events/<id>/frames/details?since=<iso>` for details frames.
//! Requests follow redirects, cap the response body, and decode into the
//! engine's frame types.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use http_body_util::{BodyExt, Empty};
use hyper::{body::Bytes, header, Request, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::trace;
use url::Url;

use super::error::FetchError;
use super::frame::{floor_to_slice, slice_start, Frame, MatchMeta, MatchPhase};
use super::source::{CancelSignal, DetailsBatch, EventId, FrameSource, WindowBatch};

/// Max body size for one feed response. Frame pages are small JSON.
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

const MAX_REDIRECTS: usize = 5;

/// Frame feed over HTTP(S).
pub struct HttpFrameSource {
    base: Url,
    client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
}

impl HttpFrameSource {
    /// Builds a source rooted at `base_url`. The client is constructed once
    /// and reused across requests.
    pub fn new(base_url: &str) -> Result<Self, FetchError> {
        let base = normalize_base(base_url)?;

        let https = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|err| {
                tracing::error!("failed to load native root certificates: {err}");
                FetchError::TlsConfig
            })?
            .https_or_http()
            .enable_http1()
            .build();
        let client: Client<_, Empty<Bytes>> = Client::builder(TokioExecutor::new()).build(https);

        Ok(Self { base, client })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        mut cancel: CancelSignal,
    ) -> Result<T, FetchError> {
        trace!(%url, "feed request");
        let bytes = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            result = self.request_with_redirects(url) => result?,
        };
        serde_json::from_slice(&bytes).map_err(|err| FetchError::Decode(err.to_string()))
    }

    async fn request_with_redirects(&self, url: Url) -> Result<Vec<u8>, FetchError> {
        let mut current_uri: Uri = url.as_str().parse().map_err(|_| FetchError::Uri)?;
        let mut redirects = 0;

        let res = loop {
            let authority = current_uri.authority().ok_or(FetchError::Uri)?.clone();

            let req = Request::builder()
                .uri(current_uri.clone())
                .header(header::HOST, authority.as_str())
                .header(header::ACCEPT, "application/json")
                .body(Empty::<Bytes>::new())
                .map_err(|e| FetchError::Transport(Box::new(e)))?;

            let res = self
                .client
                .request(req)
                .await
                .map_err(|e| FetchError::Transport(Box::new(e)))?;

            if res.status().is_redirection() {
                if redirects >= MAX_REDIRECTS {
                    return Err(FetchError::TooManyRedirects);
                }

                let location = res
                    .headers()
                    .get(header::LOCATION)
                    .ok_or_else(|| {
                        FetchError::Transport("redirect response missing Location header".into())
                    })?
                    .to_str()
                    .map_err(|_| {
                        FetchError::Transport("redirect Location header is not valid text".into())
                    })?
                    .to_string();

                // Drain the redirect body so the connection can be reused.
                res.into_body()
                    .collect()
                    .await
                    .map_err(|e| FetchError::Transport(Box::new(e)))?;

                current_uri = resolve_redirect(&current_uri, &location)?;
                redirects += 1;
                continue;
            } else if !res.status().is_success() {
                return Err(FetchError::Status(res.status().as_u16()));
            } else {
                break res;
            }
        };

        let content_length: Option<usize> = res
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|s| s.to_str().ok())
            .and_then(|s| s.parse::<usize>().ok());

        if let Some(len) = content_length {
            if len > MAX_BODY_BYTES {
                return Err(FetchError::BodyTooLarge);
            }
        }

        // Collect incrementally, checking the cap before growing.
        let mut body = res.into_body();
        let mut bytes = Vec::with_capacity(content_length.unwrap_or(0).min(MAX_BODY_BYTES));

        while let Some(frame_result) = body.frame().await {
            let frame = frame_result.map_err(|e| FetchError::Transport(Box::new(e)))?;

            if let Ok(chunk) = frame.into_data() {
                if bytes.len() + chunk.len() > MAX_BODY_BYTES {
                    return Err(FetchError::BodyTooLarge);
                }
                bytes.extend_from_slice(&chunk);
            }
        }

        Ok(bytes)
    }
}

#[async_trait]
impl FrameSource for HttpFrameSource {
    async fn fetch_window(
        &self,
        event: &EventId,
        since: DateTime<Utc>,
        cancel: CancelSignal,
    ) -> Result<WindowBatch, FetchError> {
        let url = endpoint_url(&self.base, &format!("events/{}/frames", event.as_str()), since)?;
        let wire: WireWindow = self.get_json(url, cancel).await?;
        Ok(WindowBatch {
            frames: wire.frames.into_iter().map(WireFrame::into_frame).collect(),
            meta: wire.metadata,
        })
    }

    async fn fetch_details(
        &self,
        event: &EventId,
        since: DateTime<Utc>,
        cancel: CancelSignal,
    ) -> Result<DetailsBatch, FetchError> {
        let url = endpoint_url(
            &self.base,
            &format!("events/{}/frames/details", event.as_str()),
            since,
        )?;
        let wire: WireDetails = self.get_json(url, cancel).await?;
        Ok(DetailsBatch {
            frames: wire.frames.into_iter().map(WireFrame::into_frame).collect(),
        })
    }
}

/// Window page as it appears on the wire.
#[derive(Debug, Deserialize)]
struct WireWindow {
    #[serde(default)]
    frames: Vec<WireFrame>,
    #[serde(default)]
    metadata: Option<MatchMeta>,
}

/// Details page as it appears on the wire.
#[derive(Debug, Deserialize)]
struct WireDetails {
    #[serde(default)]
    frames: Vec<WireFrame>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFrame {
    /// Recording instant, ISO formatted on the wire.
    recorded_at: DateTime<Utc>,
    #[serde(default)]
    phase: Option<MatchPhase>,
    #[serde(default)]
    data: Value,
}

impl WireFrame {
    fn into_frame(self) -> Frame {
        Frame {
            recorded_at: self.recorded_at.timestamp_millis(),
            payload: self.data,
            phase: self.phase,
        }
    }
}

/// Parses the base URL and guarantees a trailing slash so joins append
/// instead of replacing the last path segment.
fn normalize_base(base_url: &str) -> Result<Url, FetchError> {
    let mut base = Url::parse(base_url).map_err(|_| FetchError::Uri)?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base)
}

fn endpoint_url(base: &Url, path: &str, since: DateTime<Utc>) -> Result<Url, FetchError> {
    let mut url = base.join(path).map_err(|_| FetchError::Uri)?;
    url.query_pairs_mut()
        .append_pair("since", &format_since(since));
    Ok(url)
}

/// The feed takes `since` aligned to its 10s grid, ISO formatted in UTC.
fn format_since(since: DateTime<Utc>) -> String {
    let aligned = slice_start(floor_to_slice(since.timestamp_millis()));
    aligned.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn resolve_redirect(current: &Uri, location: &str) -> Result<Uri, FetchError> {
    if let Ok(uri) = location.parse::<Uri>() {
        if uri.scheme().is_some() {
            return Ok(uri);
        }
    }

    let base = Url::parse(&current.to_string()).map_err(|_| FetchError::Uri)?;
    let joined = base.join(location).map_err(|_| FetchError::Uri)?;

    joined.as_str().parse::<Uri>().map_err(|_| FetchError::Uri)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        normalize_base("https://feeds.example.com/api").unwrap()
    }

    #[test]
    fn test_base_url_gains_trailing_slash() {
        assert_eq!(base().as_str(), "https://feeds.example.com/api/");
        let kept = normalize_base("https://feeds.example.com/api/").unwrap();
        assert_eq!(kept.as_str(), "https://feeds.example.com/api/");
    }

    #[test]
    fn test_endpoint_urls() {
        let since = slice_start(1_700_000_000_000);
        let url = endpoint_url(&base(), "events/match-9/frames", since).unwrap();
        assert_eq!(
            url.as_str(),
            "https://feeds.example.com/api/events/match-9/frames?since=2023-11-14T22%3A13%3A20Z"
        );

        let details = endpoint_url(&base(), "events/match-9/frames/details", since).unwrap();
        assert!(details.path().ends_with("frames/details"));
    }

    #[test]
    fn test_since_is_grid_aligned_iso() {
        // 22:13:27 floors to the 22:13:20 boundary.
        let ragged = slice_start(1_700_000_007_000);
        assert_eq!(format_since(ragged), "2023-11-14T22:13:20Z");
    }

    #[test]
    fn test_resolve_redirect_absolute_and_relative() {
        let current: Uri = "https://feeds.example.com/api/events/x/frames"
            .parse()
            .unwrap();

        let absolute = resolve_redirect(&current, "https://other.example.com/v2/frames").unwrap();
        assert_eq!(absolute.host(), Some("other.example.com"));

        let relative = resolve_redirect(&current, "/v2/frames").unwrap();
        assert_eq!(relative.host(), Some("feeds.example.com"));
        assert_eq!(relative.path(), "/v2/frames");
    }

    #[test]
    fn test_window_page_decodes() {
        let body = r#"{
            "frames": [
                { "recordedAt": "2023-11-14T22:13:20Z", "phase": "inProgress", "data": { "score": [1, 0] } },
                { "recordedAt": "2023-11-14T22:13:30Z", "data": {} }
            ],
            "metadata": { "homeTeam": "North", "awayTeam": "South" }
        }"#;

        let wire: WireWindow = serde_json::from_str(body).unwrap();
        assert_eq!(wire.frames.len(), 2);
        let meta = wire.metadata.unwrap();
        assert_eq!(meta.home_team.as_deref(), Some("North"));

        let frame = wire.frames.into_iter().next().unwrap().into_frame();
        assert_eq!(frame.recorded_at, 1_700_000_000_000);
        assert_eq!(frame.phase, Some(MatchPhase::InProgress));
    }

    #[test]
    fn test_missing_optionals_default() {
        let wire: WireWindow = serde_json::from_str(r#"{}"#).unwrap();
        assert!(wire.frames.is_empty());
        assert!(wire.metadata.is_none());

        let details: WireDetails = serde_json::from_str(r#"{"frames": []}"#).unwrap();
        assert!(details.frames.is_empty());
    }
}
