use std::{
    io::Write,
    sync::{Arc, Mutex},
};

use crate::transport::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Setup,
    Io,
    Codec,
    UnsupportedVersion,
    ReplayMiss,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Io => "io",
            Self::Codec => "codec",
            Self::UnsupportedVersion => "unsupported_version",
            Self::ReplayMiss => "replay_miss",
        }
    }
}

/// A condition after which the archive can no longer be trusted for the rest of the run.
#[derive(Debug, Clone)]
pub struct DvrFailure {
    kind: FailureKind,
    cause: Arc<anyhow::Error>,
}

impl DvrFailure {
    pub fn new(kind: FailureKind, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            kind,
            cause: Arc::new(cause.into()),
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }
}

impl std::fmt::Display for DvrFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#}", self.cause)
    }
}

impl std::error::Error for DvrFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.source()
    }
}

/// Outcome of an intercepted call that did not produce a response.
#[derive(Debug)]
pub enum DvrError {
    Transport(TransportError),
    Failure(DvrFailure),
}

impl DvrError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn as_transport(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(err) => Some(err),
            Self::Failure(_) => None,
        }
    }

    pub fn as_failure(&self) -> Option<&DvrFailure> {
        match self {
            Self::Transport(_) => None,
            Self::Failure(failure) => Some(failure),
        }
    }
}

impl std::fmt::Display for DvrError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "{err}"),
            Self::Failure(failure) => write!(f, "{failure}"),
        }
    }
}

impl std::error::Error for DvrError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(err) => Some(err),
            Self::Failure(failure) => Some(failure),
        }
    }
}

impl From<TransportError> for DvrError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl From<DvrFailure> for DvrError {
    fn from(failure: DvrFailure) -> Self {
        Self::Failure(failure)
    }
}

#[derive(Clone)]
pub struct DiagnosticSink {
    writer: Option<Arc<Mutex<Box<dyn Write + Send>>>>,
}

impl DiagnosticSink {
    pub fn stderr() -> Self {
        Self::to_writer(std::io::stderr())
    }

    pub fn discard() -> Self {
        Self { writer: None }
    }

    pub fn to_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Some(Arc::new(Mutex::new(Box::new(writer)))),
        }
    }

    pub fn report(&self, failure: &DvrFailure) {
        tracing::error!(kind = failure.kind().as_str(), "{failure}");

        let Some(writer) = self.writer.as_ref() else {
            return;
        };
        let Ok(mut writer) = writer.lock() else {
            return;
        };
        let report = format!(
            "httpdvr hit an error it cannot recover from.\n\
             The archive can no longer be trusted for this run, so the remaining\n\
             results would be inconsistent. Fix the problem below and run again.\n\
             \n\
             kind: {}\n\
             {failure}\n",
            failure.kind().as_str(),
        );
        let _ = writer.write_all(report.as_bytes());
        let _ = writer.flush();
    }
}

impl Default for DiagnosticSink {
    fn default() -> Self {
        Self::stderr()
    }
}

impl std::fmt::Debug for DiagnosticSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticSink")
            .field("enabled", &self.writer.is_some())
            .finish()
    }
}
