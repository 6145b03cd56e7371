use std::{path::PathBuf, sync::Arc};

use hyper::{Request, Response, http::request};

use crate::{
    body::DvrBody,
    config::{Config, DEFAULT_ARCHIVE_PATH},
    error::{DiagnosticSink, DvrError, DvrFailure},
    matching::{DefaultMatcher, Matcher},
    mode::{Mode, ModeFlags},
    obfuscator::Obfuscator,
    player::Player,
    recorder::Recorder,
    transport::{Transport, TransportError},
};

/// Wraps a transport and, per call, records through it, replays from the archive, or passes
/// straight through depending on the current mode.
///
/// Every interceptor owns its own flags, archive state and diagnostics; two interceptors in the
/// same process never see each other's recordings.
pub struct Interceptor<T> {
    transport: T,
    flags: Arc<ModeFlags>,
    recorder: Recorder,
    player: Player,
    diagnostics: DiagnosticSink,
}

impl<T: Transport> Interceptor<T> {
    pub fn new(transport: T, config: &Config) -> Self {
        Self::builder(transport).config(config).build()
    }

    pub fn builder(transport: T) -> InterceptorBuilder<T> {
        InterceptorBuilder::new(transport)
    }

    pub fn mode(&self) -> Mode {
        self.flags.resolve()
    }

    pub fn flags(&self) -> &Arc<ModeFlags> {
        &self.flags
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn player(&self) -> &Player {
        &self.player
    }

    /// Prepares the archive for the current mode ahead of the first request: creates it when
    /// recording, loads it when replaying.
    pub async fn open(&self) -> Result<(), DvrFailure> {
        let result = match self.mode() {
            Mode::Recording => self.recorder.open().await,
            Mode::Replaying => self.player.load().await,
            Mode::PassThrough => Ok(()),
        };
        if let Err(failure) = &result {
            self.diagnostics.report(failure);
        }
        result
    }

    pub async fn finish(&self) -> Result<(), DvrFailure> {
        let result = self.recorder.finish().await;
        if let Err(failure) = &result {
            self.diagnostics.report(failure);
        }
        result
    }

    pub async fn execute(&self, request: Request<DvrBody>) -> Result<Response<DvrBody>, DvrError> {
        let mode = self.mode();
        tracing::debug!(
            mode = mode.as_str(),
            method = %request.method(),
            uri = %request.uri(),
            "intercepting request"
        );

        let result = match mode {
            Mode::Recording => self.recorder.record(&self.transport, request).await,
            Mode::Replaying => self.player.replay(request).await,
            Mode::PassThrough => self
                .transport
                .execute(request)
                .await
                .map_err(DvrError::Transport),
        };

        if let Err(DvrError::Failure(failure)) = &result {
            self.diagnostics.report(failure);
        }
        result
    }

    pub fn cancel(&self, request: &request::Parts) {
        if self.mode().is_replaying() {
            return;
        }
        self.transport.cancel(request);
    }
}

impl<T: Transport> Transport for Interceptor<T> {
    async fn execute(&self, request: Request<DvrBody>) -> Result<Response<DvrBody>, TransportError> {
        Interceptor::execute(self, request)
            .await
            .map_err(|err| match err {
                DvrError::Transport(err) => err,
                DvrError::Failure(failure) => TransportError::fatal(failure),
            })
    }

    fn cancel(&self, request: &request::Parts) {
        Interceptor::cancel(self, request)
    }
}

impl<T> std::fmt::Debug for Interceptor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("mode", &self.flags.resolve())
            .field("recorder", &self.recorder)
            .field("player", &self.player)
            .finish_non_exhaustive()
    }
}

pub struct InterceptorBuilder<T> {
    transport: T,
    archive_path: PathBuf,
    flags: Option<Arc<ModeFlags>>,
    matcher: Arc<dyn Matcher>,
    obfuscator: Option<Arc<dyn Obfuscator>>,
    diagnostics: DiagnosticSink,
}

impl<T: Transport> InterceptorBuilder<T> {
    fn new(transport: T) -> Self {
        Self {
            transport,
            archive_path: PathBuf::from(DEFAULT_ARCHIVE_PATH),
            flags: None,
            matcher: Arc::new(DefaultMatcher),
            obfuscator: None,
            diagnostics: DiagnosticSink::default(),
        }
    }

    pub fn config(mut self, config: &Config) -> Self {
        self.archive_path = config.archive.path.clone();
        self.flags = Some(Arc::new(ModeFlags::from_config(&config.mode)));
        self
    }

    pub fn archive_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.archive_path = path.into();
        self
    }

    pub fn flags(mut self, flags: Arc<ModeFlags>) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn matcher(mut self, matcher: impl Matcher + 'static) -> Self {
        self.matcher = Arc::new(matcher);
        self
    }

    pub fn obfuscator(mut self, obfuscator: impl Obfuscator + 'static) -> Self {
        self.obfuscator = Some(Arc::new(obfuscator));
        self
    }

    pub fn diagnostics(mut self, diagnostics: DiagnosticSink) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn build(self) -> Interceptor<T> {
        Interceptor {
            transport: self.transport,
            flags: self.flags.unwrap_or_default(),
            recorder: Recorder::new(self.archive_path.clone(), self.obfuscator),
            player: Player::new(self.archive_path, self.matcher),
            diagnostics: self.diagnostics,
        }
    }
}
