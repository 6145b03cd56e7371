use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::Context as _;
use hyper::{Request, Response};
use tokio::sync::OnceCell;

use crate::{
    archive::{ArchiveWriter, decode_exchange, encode_exchange},
    body::{DvrBody, ReplayBody, drain_body},
    error::{DvrError, DvrFailure, FailureKind},
    exchange::{Exchange, RecordedRequest, RecordedResponse},
    obfuscator::Obfuscator,
    transport::Transport,
};

/// Forwards requests to a live transport and appends every exchange to the archive.
pub struct Recorder {
    path: PathBuf,
    writer: OnceCell<Result<Arc<Mutex<ArchiveWriter>>, DvrFailure>>,
    obfuscator: Option<Arc<dyn Obfuscator>>,
}

impl Recorder {
    pub fn new(path: impl Into<PathBuf>, obfuscator: Option<Arc<dyn Obfuscator>>) -> Self {
        Self {
            path: path.into(),
            writer: OnceCell::new(),
            obfuscator,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        matches!(self.writer.get(), Some(Ok(_)))
    }

    /// Creates the archive (truncating any previous one). Only the first call does any work; if
    /// it fails, every later call returns the same failure.
    pub async fn open(&self) -> Result<(), DvrFailure> {
        self.writer().await.map(|_| ())
    }

    async fn writer(&self) -> Result<&Arc<Mutex<ArchiveWriter>>, DvrFailure> {
        let opened = self
            .writer
            .get_or_init(|| async {
                let path = self.path.clone();
                let writer = tokio::task::spawn_blocking(move || ArchiveWriter::create(path))
                    .await
                    .context("join archive create task")
                    .map_err(|err| DvrFailure::new(FailureKind::Setup, err))??;
                tracing::info!(path = %self.path.display(), "recording exchanges to archive");
                Ok::<_, DvrFailure>(Arc::new(Mutex::new(writer)))
            })
            .await;
        opened.as_ref().map_err(DvrFailure::clone)
    }

    /// Sends `request` through `transport` and persists the resulting exchange.
    ///
    /// Bodies are buffered in full; the caller receives bodies that replay the same bytes,
    /// trailers and read errors. A transport error is persisted too and then returned as
    /// [`DvrError::Transport`].
    pub async fn record<T: Transport>(
        &self,
        transport: &T,
        request: Request<DvrBody>,
    ) -> Result<Response<DvrBody>, DvrError> {
        let writer = self.writer().await?;

        let (parts, body) = request.into_parts();
        let captured = drain_body(body).await;
        let mut exchange = Exchange::from_request(RecordedRequest::from_parts(&parts, &captured));
        let forwarded = Request::from_parts(parts, ReplayBody::from_captured(captured).boxed());

        let outcome = match transport.execute(forwarded).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                let captured = drain_body(body).await;
                exchange.response = Some(RecordedResponse::from_parts(&parts, &captured));
                Ok(Response::from_parts(
                    parts,
                    ReplayBody::from_captured(captured).boxed(),
                ))
            }
            Err(err) => {
                exchange.error = Some(err.to_recorded());
                Err(err)
            }
        };

        let payload = self.persisted_payload(&exchange)?;
        let sequence = append(writer, payload).await?;
        tracing::debug!(
            sequence,
            method = %exchange.request.method,
            url = %exchange.request.url,
            failed = exchange.error.is_some(),
            "recorded exchange"
        );

        outcome.map_err(DvrError::Transport)
    }

    // The obfuscator works on a decoded copy so nothing it changes reaches the caller.
    fn persisted_payload(&self, exchange: &Exchange) -> Result<Vec<u8>, DvrFailure> {
        let payload = encode_exchange(exchange)?;
        let Some(obfuscator) = self.obfuscator.as_ref() else {
            return Ok(payload);
        };

        let mut copy = decode_exchange(&payload)?;
        obfuscator.obfuscate(&mut copy);
        encode_exchange(&copy)
    }

    pub fn records_written(&self) -> u64 {
        self.writer
            .get()
            .and_then(|opened| opened.as_ref().ok())
            .and_then(|writer| writer.lock().ok().map(|writer| writer.records_written()))
            .unwrap_or(0)
    }

    pub async fn finish(&self) -> Result<(), DvrFailure> {
        let Some(Ok(writer)) = self.writer.get() else {
            return Ok(());
        };
        let writer = Arc::clone(writer);
        tokio::task::spawn_blocking(move || lock_writer(&writer)?.finish())
            .await
            .context("join archive finish task")
            .map_err(|err| DvrFailure::new(FailureKind::Io, err))?
    }
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .field("obfuscator", &self.obfuscator.is_some())
            .finish()
    }
}

async fn append(writer: &Arc<Mutex<ArchiveWriter>>, payload: Vec<u8>) -> Result<u64, DvrFailure> {
    let writer = Arc::clone(writer);
    tokio::task::spawn_blocking(move || lock_writer(&writer)?.append(&payload))
        .await
        .context("join archive append task")
        .map_err(|err| DvrFailure::new(FailureKind::Io, err))?
}

fn lock_writer(
    writer: &Mutex<ArchiveWriter>,
) -> Result<std::sync::MutexGuard<'_, ArchiveWriter>, DvrFailure> {
    writer.lock().map_err(|_| {
        DvrFailure::new(
            FailureKind::Io,
            anyhow::anyhow!("archive writer lock poisoned"),
        )
    })
}
