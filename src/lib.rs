pub mod archive;
pub mod body;
pub mod config;
pub mod error;
pub mod exchange;
pub mod interceptor;
pub mod logging;
pub mod matching;
pub mod mode;
pub mod obfuscator;
pub mod player;
pub mod recorder;
pub mod transport;

pub use error::{DiagnosticSink, DvrError, DvrFailure, FailureKind};
pub use interceptor::{Interceptor, InterceptorBuilder};
pub use mode::{Mode, ModeFlags};
pub use transport::{HyperTransport, Transport, TransportError, TransportErrorKind};
