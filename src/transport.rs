use std::{error::Error as StdError, future::Future, sync::Arc};

use hyper::{Request, Response, http::request};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use serde::{Deserialize, Serialize};

use crate::{
    body::{BoxError, DvrBody, boxed_incoming},
    error::DvrFailure,
    exchange::RecordedError,
};

/// Something that turns a request into a response.
///
/// The interceptor wraps one of these and is itself one, so interceptors can be dropped in
/// wherever the real client is used.
pub trait Transport: Send + Sync + 'static {
    fn execute(
        &self,
        request: Request<DvrBody>,
    ) -> impl Future<Output = Result<Response<DvrBody>, TransportError>> + Send;

    fn cancel(&self, _request: &request::Parts) {}
}

impl<T: Transport> Transport for Arc<T> {
    fn execute(
        &self,
        request: Request<DvrBody>,
    ) -> impl Future<Output = Result<Response<DvrBody>, TransportError>> + Send {
        (**self).execute(request)
    }

    fn cancel(&self, request: &request::Parts) {
        (**self).cancel(request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Connect,
    Closed,
    Timeout,
    Canceled,
    Body,
    Other,
    /// An interceptor used as a plain transport hit a run-fatal failure.
    Fatal,
}

impl TransportErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Closed => "closed",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
            Self::Body => "body",
            Self::Other => "other",
            Self::Fatal => "fatal",
        }
    }
}

#[derive(Debug)]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
    source: Option<BoxError>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        Self::new(classify(err), render_chain(err))
    }

    pub fn from_boxed(err: BoxError) -> Self {
        match err.downcast::<TransportError>() {
            Ok(err) => *err,
            Err(err) => {
                let mut converted = Self::from_error(&*err);
                converted.source = Some(err);
                converted
            }
        }
    }

    pub fn from_recorded(recorded: &RecordedError) -> Self {
        Self::new(recorded.kind, recorded.message.clone())
    }

    pub fn fatal(failure: DvrFailure) -> Self {
        Self {
            kind: TransportErrorKind::Fatal,
            message: failure.to_string(),
            source: Some(Box::new(failure)),
        }
    }

    pub fn to_recorded(&self) -> RecordedError {
        RecordedError {
            kind: self.kind,
            message: self.message.clone(),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn StdError + 'static))
    }
}

fn classify(err: &(dyn StdError + 'static)) -> TransportErrorKind {
    if let Some(client_err) = err.downcast_ref::<hyper_util::client::legacy::Error>()
        && client_err.is_connect()
    {
        return TransportErrorKind::Connect;
    }

    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(transport) = err.downcast_ref::<TransportError>() {
            return transport.kind;
        }
        if let Some(hyper_err) = err.downcast_ref::<hyper::Error>() {
            if hyper_err.is_incomplete_message() || hyper_err.is_closed() {
                return TransportErrorKind::Closed;
            }
            if hyper_err.is_canceled() {
                return TransportErrorKind::Canceled;
            }
            if hyper_err.is_timeout() {
                return TransportErrorKind::Timeout;
            }
            if hyper_err.is_body_write_aborted() || hyper_err.is_user() {
                return TransportErrorKind::Body;
            }
        }
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            match io_err.kind() {
                std::io::ErrorKind::ConnectionRefused => return TransportErrorKind::Connect,
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof => return TransportErrorKind::Closed,
                std::io::ErrorKind::TimedOut => return TransportErrorKind::Timeout,
                _ => {}
            }
        }
        current = err.source();
    }

    TransportErrorKind::Other
}

fn render_chain(err: &(dyn StdError + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut current = err.source();
    while let Some(source) = current {
        let text = source.to_string();
        if !rendered.ends_with(&text) {
            rendered.push_str(": ");
            rendered.push_str(&text);
        }
        current = source.source();
    }
    rendered
}

type HttpsClient = Client<HttpsConnector<HttpConnector>, DvrBody>;

#[derive(Clone)]
pub struct HyperTransport {
    client: HttpsClient,
}

impl HyperTransport {
    pub fn new() -> anyhow::Result<Self> {
        ensure_rustls_crypto_provider()?;
        let connector = build_https_connector();
        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
        })
    }
}

impl std::fmt::Debug for HyperTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperTransport").finish_non_exhaustive()
    }
}

impl Transport for HyperTransport {
    async fn execute(&self, request: Request<DvrBody>) -> Result<Response<DvrBody>, TransportError> {
        match self.client.request(request).await {
            Ok(response) => Ok(response.map(boxed_incoming)),
            Err(err) => Err(TransportError::from_boxed(Box::new(err))),
        }
    }
}

fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}

fn build_https_connector() -> HttpsConnector<HttpConnector> {
    match HttpsConnectorBuilder::new().with_native_roots() {
        Ok(builder) => builder.https_or_http().enable_http1().enable_http2().build(),
        Err(err) => {
            tracing::debug!("native TLS roots unavailable, using bundled webpki roots: {err}");
            HttpsConnectorBuilder::new()
                .with_webpki_roots()
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .build()
        }
    }
}
