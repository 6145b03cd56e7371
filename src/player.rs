use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::Context as _;
use bytes::Bytes;
use hyper::{Request, Response, StatusCode};
use tokio::sync::OnceCell;

use crate::{
    archive::read_archive,
    body::{DvrBody, ReplayBody, drain_body},
    error::{DvrError, DvrFailure, FailureKind},
    exchange::{Exchange, RecordedRequest, RecordedResponse, to_header_map},
    matching::{Matcher, ReplayEntry},
    transport::TransportError,
};

const BODY_PREVIEW_LIMIT: usize = 512;
const TRUNCATION_MARKER: &str = "... (content truncated)";

/// Answers requests from a previously recorded archive. Never touches the network.
pub struct Player {
    path: PathBuf,
    entries: OnceCell<Result<Arc<Mutex<Vec<ReplayEntry>>>, DvrFailure>>,
    matcher: Arc<dyn Matcher>,
}

impl Player {
    pub fn new(path: impl Into<PathBuf>, matcher: Arc<dyn Matcher>) -> Self {
        Self {
            path: path.into(),
            entries: OnceCell::new(),
            matcher,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.entries.get(), Some(Ok(_)))
    }

    /// Reads the whole archive into memory. Only the first call does any work; a failed load
    /// is not retried.
    pub async fn load(&self) -> Result<(), DvrFailure> {
        self.entries().await.map(|_| ())
    }

    async fn entries(&self) -> Result<&Arc<Mutex<Vec<ReplayEntry>>>, DvrFailure> {
        let loaded = self
            .entries
            .get_or_init(|| async {
                let path = self.path.clone();
                let records = tokio::task::spawn_blocking(move || read_archive(path))
                    .await
                    .context("join archive load task")
                    .map_err(|err| DvrFailure::new(FailureKind::Setup, err))??;
                tracing::info!(
                    path = %self.path.display(),
                    records = records.len(),
                    "loaded archive for replay"
                );
                let entries: Vec<ReplayEntry> = records
                    .into_iter()
                    .map(|record| ReplayEntry::new(record.exchange))
                    .collect();
                Ok::<_, DvrFailure>(Arc::new(Mutex::new(entries)))
            })
            .await;
        loaded.as_ref().map_err(DvrFailure::clone)
    }

    pub fn remaining(&self) -> usize {
        self.entries
            .get()
            .and_then(|loaded| loaded.as_ref().ok())
            .and_then(|entries| {
                entries
                    .lock()
                    .ok()
                    .map(|entries| entries.iter().filter(|entry| !entry.is_consumed()).count())
            })
            .unwrap_or(0)
    }

    /// Answers `request` with the first unused recorded exchange that matches it.
    ///
    /// A request with no match is a [`FailureKind::ReplayMiss`] failure; there is no fallback
    /// to a live transport.
    pub async fn replay(&self, request: Request<DvrBody>) -> Result<Response<DvrBody>, DvrError> {
        let entries = self.entries().await?;

        let (parts, body) = request.into_parts();
        let captured = drain_body(body).await;
        let live = Exchange::from_request(RecordedRequest::from_parts(&parts, &captured));

        let matched = {
            let mut entries = entries.lock().map_err(|_| {
                DvrFailure::new(FailureKind::Io, anyhow::anyhow!("replay entries lock poisoned"))
            })?;
            entries.iter_mut().enumerate().find_map(|(index, entry)| {
                if entry.is_consumed() || !self.matcher.matches(&live, entry) {
                    return None;
                }
                entry.mark_consumed();
                Some((index, entry.exchange().clone()))
            })
        };

        let Some((index, exchange)) = matched else {
            return Err(DvrFailure::new(
                FailureKind::ReplayMiss,
                anyhow::Error::msg(miss_report(&live.request)),
            )
            .into());
        };
        tracing::debug!(
            index,
            method = %live.request.method,
            url = %live.request.url,
            "replaying recorded exchange"
        );

        rebuild_outcome(exchange)
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("path", &self.path)
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}

fn rebuild_outcome(exchange: Exchange) -> Result<Response<DvrBody>, DvrError> {
    match (exchange.response, exchange.error) {
        (Some(response), _) => rebuild_response(response).map_err(DvrError::from),
        (None, Some(error)) => Err(TransportError::from_recorded(&error).into()),
        (None, None) => Err(DvrFailure::new(
            FailureKind::Codec,
            anyhow::anyhow!(
                "recorded exchange for {} has neither a response nor an error",
                exchange.request.url
            ),
        )
        .into()),
    }
}

fn rebuild_response(recorded: RecordedResponse) -> Result<Response<DvrBody>, DvrFailure> {
    let status = StatusCode::from_u16(recorded.status)
        .with_context(|| format!("recorded status {}", recorded.status))
        .map_err(|err| DvrFailure::new(FailureKind::Codec, err))?;

    let body = ReplayBody::new(
        Bytes::from(recorded.body),
        Some(to_header_map(&recorded.trailers)),
        recorded.body_error,
    );
    let mut response = Response::new(body.boxed());
    *response.status_mut() = status;
    *response.headers_mut() = to_header_map(&recorded.headers);
    Ok(response)
}

fn miss_report(request: &RecordedRequest) -> String {
    let mut report = String::from("no unused recorded exchange matches the request\n");
    let _ = writeln!(report, "  Method: {}", request.method);
    let _ = writeln!(report, "  URL: {}", request.url);
    let _ = writeln!(report, "  Headers: {:?}", request.headers);
    let _ = writeln!(report, "  Trailers: {:?}", request.trailers);
    let _ = write!(report, "  Body: {}", body_preview(&request.body));
    if let Some(error) = request.body_error.as_ref() {
        let _ = write!(report, "\n  Body error: {} ({})", error.message, error.kind.as_str());
    }
    report
}

fn body_preview(body: &[u8]) -> String {
    if body.len() <= BODY_PREVIEW_LIMIT {
        return String::from_utf8_lossy(body).into_owned();
    }
    format!(
        "{}{TRUNCATION_MARKER}",
        String::from_utf8_lossy(&body[..BODY_PREVIEW_LIMIT])
    )
}

#[cfg(test)]
mod tests {
    use std::{fs::File, path::Path, sync::Arc};

    use http_body_util::BodyExt as _;
    use hyper::{Request, body::Body as _};

    use super::{Player, TRUNCATION_MARKER, body_preview};
    use crate::{
        archive::write_archive,
        body::{DvrBody, boxed_full, empty},
        error::{DvrError, FailureKind},
        exchange::{
            Exchange, HeaderBytes, RecordedError, RecordedRequest, RecordedResponse, RequestUrl,
        },
        matching::{DefaultMatcher, ReplayEntry},
        transport::TransportErrorKind,
    };

    fn recorded_request(path: &str, body: &[u8]) -> RecordedRequest {
        RecordedRequest {
            method: "GET".to_owned(),
            url: RequestUrl {
                scheme: "http".to_owned(),
                host: "127.0.0.1:9".to_owned(),
                path: path.to_owned(),
                ..RequestUrl::default()
            },
            headers: Default::default(),
            trailers: Default::default(),
            body: body.to_vec(),
            body_error: None,
        }
    }

    fn live(path: &str, body: DvrBody) -> Request<DvrBody> {
        Request::get(format!("http://127.0.0.1:9{path}"))
            .body(body)
            .unwrap()
    }

    fn archive(dir: &Path, exchanges: &[Exchange]) -> std::path::PathBuf {
        let path = dir.join("archive.dvr");
        write_archive(File::create(&path).unwrap(), exchanges).unwrap();
        path
    }

    fn ok_exchange(path: &str, status: u16, body: &[u8]) -> Exchange {
        Exchange {
            request: recorded_request(path, b""),
            response: Some(RecordedResponse {
                status,
                headers: [("x-recorded".to_owned(), vec![HeaderBytes::from("yes")])].into(),
                trailers: [("x-digest".to_owned(), vec![HeaderBytes::from("abc")])].into(),
                body: body.to_vec(),
                body_error: None,
            }),
            error: None,
        }
    }

    #[tokio::test]
    async fn replays_status_headers_body_and_trailers() {
        let dir = tempfile::tempdir().unwrap();
        let path = archive(dir.path(), &[ok_exchange("/resp_header", 200, b"hello")]);
        let player = Player::new(path, Arc::new(DefaultMatcher));

        let response = player.replay(live("/resp_header", empty())).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["x-recorded"], "yes");

        let collected = response.into_body().collect().await.unwrap();
        assert_eq!(collected.trailers().unwrap()["x-digest"], "abc");
        assert_eq!(&collected.to_bytes()[..], b"hello");
    }

    #[tokio::test]
    async fn each_entry_answers_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = archive(
            dir.path(),
            &[ok_exchange("/201", 201, b""), ok_exchange("/201", 201, b"")],
        );
        let player = Player::new(path, Arc::new(DefaultMatcher));

        player.load().await.unwrap();
        assert_eq!(player.remaining(), 2);
        player.replay(live("/201", empty())).await.unwrap();
        player.replay(live("/201", empty())).await.unwrap();
        assert_eq!(player.remaining(), 0);

        let err = player.replay(live("/201", empty())).await.unwrap_err();
        let failure = err.as_failure().unwrap();
        assert_eq!(failure.kind(), FailureKind::ReplayMiss);
    }

    #[tokio::test]
    async fn recorded_error_is_returned_without_response() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = Exchange {
            request: recorded_request("/close", b""),
            response: None,
            error: Some(RecordedError {
                kind: TransportErrorKind::Closed,
                message: "connection closed before message completed".to_owned(),
            }),
        };
        let path = archive(dir.path(), &[exchange]);
        let player = Player::new(path, Arc::new(DefaultMatcher));

        let err = player.replay(live("/close", empty())).await.unwrap_err();
        let DvrError::Transport(err) = err else {
            panic!("expected a transport error");
        };
        assert_eq!(err.kind(), TransportErrorKind::Closed);
        assert_eq!(err.message(), "connection closed before message completed");
    }

    #[tokio::test]
    async fn recorded_body_error_ends_the_replayed_body() {
        let dir = tempfile::tempdir().unwrap();
        let mut exchange = ok_exchange("/partial", 200, b"par");
        exchange.response.as_mut().unwrap().body_error = Some(RecordedError {
            kind: TransportErrorKind::Body,
            message: "error reading a body from connection".to_owned(),
        });
        let path = archive(dir.path(), &[exchange]);
        let player = Player::new(path, Arc::new(DefaultMatcher));

        let response = player.replay(live("/partial", empty())).await.unwrap();
        let body = response.into_body();
        assert!(!body.is_end_stream());
        let err = body.collect().await.unwrap_err();
        assert_eq!(err.to_string(), "error reading a body from connection");
    }

    #[tokio::test]
    async fn miss_report_describes_the_live_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = archive(dir.path(), &[ok_exchange("/201", 201, b"")]);
        let player = Player::new(path, Arc::new(DefaultMatcher));

        let request = Request::post("http://127.0.0.1:9/missing?q=1")
            .header("x-client-header", "test")
            .body(boxed_full(vec![b'a'; 600]))
            .unwrap();
        let err = player.replay(request).await.unwrap_err();
        let report = err.to_string();

        assert!(report.contains("Method: POST"), "{report}");
        assert!(report.contains("URL: http://127.0.0.1:9/missing?q=1"), "{report}");
        assert!(report.contains("x-client-header"), "{report}");
        assert!(report.contains(TRUNCATION_MARKER), "{report}");
        assert!(!report.contains(&"a".repeat(513)), "{report}");
        // The miss does not consume anything.
        assert_eq!(player.remaining(), 1);
    }

    #[tokio::test]
    async fn entry_without_outcome_is_a_codec_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = archive(
            dir.path(),
            &[Exchange::from_request(recorded_request("/broken", b""))],
        );
        let player = Player::new(path, Arc::new(DefaultMatcher));

        let err = player.replay(live("/broken", empty())).await.unwrap_err();
        assert_eq!(err.as_failure().unwrap().kind(), FailureKind::Codec);
    }

    #[tokio::test]
    async fn player_consumes_even_when_matcher_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let path = archive(dir.path(), &[ok_exchange("/any", 204, b"")]);
        let lenient = |_live: &Exchange, _entry: &mut ReplayEntry| true;
        let player = Player::new(path, Arc::new(lenient));

        player.replay(live("/something-else", empty())).await.unwrap();
        let err = player.replay(live("/any", empty())).await.unwrap_err();
        assert_eq!(err.as_failure().unwrap().kind(), FailureKind::ReplayMiss);
    }

    #[tokio::test]
    async fn missing_archive_fails_setup() {
        let dir = tempfile::tempdir().unwrap();
        let player = Player::new(dir.path().join("absent.dvr"), Arc::new(DefaultMatcher));

        let failure = player.load().await.unwrap_err();
        assert_eq!(failure.kind(), FailureKind::Setup);
        assert!(!player.is_loaded());
        assert_eq!(player.remaining(), 0);
    }

    #[tokio::test]
    async fn failed_load_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let player = Player::new(dir.path().join("archive.dvr"), Arc::new(DefaultMatcher));
        assert_eq!(player.load().await.unwrap_err().kind(), FailureKind::Setup);

        archive(dir.path(), &[ok_exchange("/201", 201, b"created")]);
        assert_eq!(player.load().await.unwrap_err().kind(), FailureKind::Setup);
        let err = player.replay(live("/201", empty())).await.unwrap_err();
        assert_eq!(err.as_failure().unwrap().kind(), FailureKind::Setup);
        assert!(!player.is_loaded());
    }

    #[tokio::test]
    async fn concurrent_identical_requests_each_get_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let exchanges: Vec<Exchange> = (0..6).map(|_| ok_exchange("/201", 201, b"")).collect();
        let path = archive(dir.path(), &exchanges);
        let player = Arc::new(Player::new(path, Arc::new(DefaultMatcher)));

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let player = Arc::clone(&player);
            tasks.push(tokio::spawn(async move {
                player.replay(live("/201", empty())).await.map(|r| r.status())
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 201);
        }
        assert_eq!(player.remaining(), 0);
    }

    #[test]
    fn short_bodies_are_previewed_whole() {
        assert_eq!(body_preview(b"body1"), "body1");
        let exact = vec![b'z'; 512];
        assert_eq!(body_preview(&exact).len(), 512);
    }
}
