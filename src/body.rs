use std::{
    error::Error as StdError,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt as _, Empty, Full, combinators::BoxBody};
use hyper::{
    HeaderMap,
    body::{Body, Frame, Incoming, SizeHint},
};

use crate::{exchange::RecordedError, transport::TransportError};

pub type BoxError = Box<dyn StdError + Send + Sync>;
pub type DvrBody = BoxBody<Bytes, BoxError>;

#[derive(Debug, Clone, Default)]
pub struct CapturedBody {
    pub bytes: Bytes,
    pub trailers: Option<HeaderMap>,
    pub error: Option<RecordedError>,
}

// A read error ends the drain and is kept in the result instead of being returned.
pub async fn drain_body<B>(body: B) -> CapturedBody
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    let mut body = body;
    let mut buffered = BytesMut::new();
    let mut trailers: Option<HeaderMap> = None;
    let mut error = None;

    while let Some(frame_result) = body.frame().await {
        let frame = match frame_result {
            Ok(frame) => frame,
            Err(err) => {
                error = Some(TransportError::from_boxed(err.into()).to_recorded());
                break;
            }
        };
        match frame.into_data() {
            Ok(data) => buffered.extend_from_slice(&data),
            Err(frame) => {
                if let Ok(more) = frame.into_trailers() {
                    match trailers.as_mut() {
                        Some(existing) => existing.extend(more),
                        None => trailers = Some(more),
                    }
                }
            }
        }
    }

    CapturedBody {
        bytes: buffered.freeze(),
        trailers,
        error,
    }
}

#[derive(Debug, Default)]
pub struct ReplayBody {
    data: Option<Bytes>,
    trailers: Option<HeaderMap>,
    error: Option<RecordedError>,
}

impl ReplayBody {
    pub fn new(data: Bytes, trailers: Option<HeaderMap>, error: Option<RecordedError>) -> Self {
        Self {
            data: Some(data).filter(|data| !data.is_empty()),
            trailers: trailers.filter(|trailers| !trailers.is_empty()),
            error,
        }
    }

    pub fn from_captured(captured: CapturedBody) -> Self {
        Self::new(captured.bytes, captured.trailers, captured.error)
    }

    pub fn boxed(self) -> DvrBody {
        http_body_util::BodyExt::boxed(self)
    }
}

impl Body for ReplayBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if let Some(data) = this.data.take() {
            return Poll::Ready(Some(Ok(Frame::data(data))));
        }
        if let Some(trailers) = this.trailers.take() {
            return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
        }
        if let Some(error) = this.error.take() {
            return Poll::Ready(Some(Err(Box::new(TransportError::from_recorded(&error)))));
        }
        Poll::Ready(None)
    }

    fn is_end_stream(&self) -> bool {
        self.data.is_none() && self.trailers.is_none() && self.error.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        let len = self.data.as_ref().map_or(0, |data| data.len() as u64);
        if self.error.is_none() {
            SizeHint::with_exact(len)
        } else {
            let mut hint = SizeHint::new();
            hint.set_lower(len);
            hint
        }
    }
}

pub fn boxed_full(body: impl Into<Bytes>) -> DvrBody {
    Full::new(body.into())
        .map_err(|never| -> BoxError { match never {} })
        .boxed()
}

pub fn empty() -> DvrBody {
    Empty::<Bytes>::new()
        .map_err(|never| -> BoxError { match never {} })
        .boxed()
}

pub fn boxed_incoming(body: Incoming) -> DvrBody {
    body.map_err(|err| -> BoxError { Box::new(err) }).boxed()
}
