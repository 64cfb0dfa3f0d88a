//! Body relay
//!
//! The engine consumes the request body, so the relay buffers it first,
//! hands the engine an independent reader over the buffer, and afterwards
//! rebuilds a body for downstream that yields, in order:
//!
//! 1. the engine's retained copy of what it consumed
//! 2. buffered bytes the engine did not consume
//! 3. anything still left in the original body
//! 4. trailers, if the client sent any

use crate::error::BoxError;
use bytes::{Bytes, BytesMut};
use axum::http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use std::io::{Cursor, ErrorKind, Read};
use std::pin::Pin;
use std::task::{Context, Poll};

const REPLAY_CHUNK: usize = 8 * 1024;

/// Body read into memory, ready to be handed to the engine
pub struct Buffered<B> {
    bytes: Bytes,
    residual: B,
    trailers: Option<HeaderMap>,
}

/// Read `raw` to its end, keeping trailers aside
pub async fn prepare<B>(mut raw: B) -> Result<Buffered<B>, BoxError>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    let mut buf = BytesMut::new();
    let mut trailers: Option<HeaderMap> = None;

    while let Some(frame) = raw.frame().await {
        let frame = frame.map_err(Into::into)?;
        match frame.into_data() {
            Ok(data) => buf.extend_from_slice(&data),
            Err(frame) => {
                if let Ok(t) = frame.into_trailers() {
                    match trailers.as_mut() {
                        Some(existing) => existing.extend(t),
                        None => trailers = Some(t),
                    }
                }
            }
        }
    }

    Ok(Buffered {
        bytes: buf.freeze(),
        residual: raw,
        trailers,
    })
}

impl<B> Buffered<B> {
    /// Buffered bytes
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Independent reader over the buffer for the engine
    pub fn reader(&self) -> Cursor<Bytes> {
        Cursor::new(self.bytes.clone())
    }

    /// Rebuild the downstream body
    ///
    /// `consumed` is how far the engine read into the buffer. Without an
    /// engine copy the whole buffer is replayed as-is.
    pub fn into_replay(self, engine_copy: Option<Box<dyn Read + Send>>, consumed: usize) -> RelayBody<B> {
        let tail = match engine_copy {
            Some(_) => self.bytes.slice(consumed.min(self.bytes.len())..),
            None => self.bytes,
        };
        RelayBody {
            engine_copy,
            tail,
            inner: self.residual,
            inner_done: false,
            trailers: self.trailers,
        }
    }
}

/// Replay body handed downstream
pub struct RelayBody<B> {
    engine_copy: Option<Box<dyn Read + Send>>,
    tail: Bytes,
    inner: B,
    inner_done: bool,
    trailers: Option<HeaderMap>,
}

impl<B> RelayBody<B> {
    fn read_engine_copy(&mut self) -> Option<Result<Bytes, BoxError>> {
        let reader = self.engine_copy.as_mut()?;
        let mut chunk = vec![0u8; REPLAY_CHUNK];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => {
                    self.engine_copy = None;
                    return None;
                }
                Ok(n) => {
                    chunk.truncate(n);
                    return Some(Ok(Bytes::from(chunk)));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.engine_copy = None;
                    return Some(Err(e.into()));
                }
            }
        }
    }
}

impl<B> Body for RelayBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();

        if let Some(chunk) = this.read_engine_copy() {
            return Poll::Ready(Some(chunk.map(Frame::data)));
        }

        if !this.tail.is_empty() {
            return Poll::Ready(Some(Ok(Frame::data(std::mem::take(&mut this.tail)))));
        }

        if !this.inner_done {
            match Pin::new(&mut this.inner).poll_frame(cx) {
                Poll::Ready(Some(frame)) => return Poll::Ready(Some(frame.map_err(Into::into))),
                Poll::Ready(None) => this.inner_done = true,
                Poll::Pending => return Poll::Pending,
            }
        }

        Poll::Ready(this.trailers.take().map(|t| Ok(Frame::trailers(t))))
    }

    fn is_end_stream(&self) -> bool {
        self.engine_copy.is_none()
            && self.tail.is_empty()
            && (self.inner_done || self.inner.is_end_stream())
            && self.trailers.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        match self.engine_copy {
            Some(_) => SizeHint::default(),
            None => {
                let inner = if self.inner_done {
                    SizeHint::with_exact(0)
                } else {
                    self.inner.size_hint()
                };
                let tail = self.tail.len() as u64;

                // upper first: set_lower asserts lower <= upper
                let mut hint = SizeHint::new();
                if let Some(upper) = inner.upper() {
                    hint.set_upper(upper.saturating_add(tail));
                }
                hint.set_lower(inner.lower().saturating_add(tail));
                hint
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use proptest::prelude::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread().build().unwrap()
    }

    async fn collect<B>(body: B) -> (Bytes, Option<HeaderMap>)
    where
        B: Body<Data = Bytes>,
        B::Error: std::fmt::Debug,
    {
        let collected = body.collect().await.unwrap();
        let trailers = collected.trailers().cloned();
        (collected.to_bytes(), trailers)
    }

    #[tokio::test]
    async fn test_full_consumption_replays_engine_copy() {
        let buffered = prepare(Full::new(Bytes::from_static(b"name=value"))).await.unwrap();
        let mut reader = buffered.reader();
        let mut seen = Vec::new();
        reader.read_to_end(&mut seen).unwrap();

        let copy: Box<dyn Read + Send> = Box::new(Cursor::new(seen.clone()));
        let replay = buffered.into_replay(Some(copy), reader.position() as usize);
        let (bytes, trailers) = collect(replay).await;
        assert_eq!(&bytes[..], b"name=value");
        assert!(trailers.is_none());
    }

    #[tokio::test]
    async fn test_partial_consumption_appends_unread_tail() {
        let buffered = prepare(Full::new(Bytes::from_static(b"0123456789"))).await.unwrap();
        let mut reader = buffered.reader();
        let mut head = vec![0u8; 4];
        reader.read_exact(&mut head).unwrap();

        let copy: Box<dyn Read + Send> = Box::new(Cursor::new(head));
        let replay = buffered.into_replay(Some(copy), reader.position() as usize);
        let (bytes, _) = collect(replay).await;
        assert_eq!(&bytes[..], b"0123456789");
    }

    #[tokio::test]
    async fn test_without_engine_copy_replays_buffer() {
        let buffered = prepare(Full::new(Bytes::from_static(b"abc"))).await.unwrap();
        assert_eq!(buffered.bytes().len(), 3);
        let (bytes, _) = collect(buffered.into_replay(None, 2)).await;
        assert_eq!(&bytes[..], b"abc");
    }

    #[tokio::test]
    async fn test_size_hint_counts_unread_tail() {
        let buffered = prepare(Full::new(Bytes::from_static(b"payload"))).await.unwrap();
        let replay = buffered.into_replay(None, 0);
        assert_eq!(replay.size_hint().exact(), Some(7));

        let buffered = prepare(Full::new(Bytes::from_static(b"0123456789"))).await.unwrap();
        let copy: Box<dyn Read + Send> = Box::new(Cursor::new(b"0123".to_vec()));
        let mut replay = buffered.into_replay(Some(copy), 4);
        assert_eq!(replay.size_hint().exact(), None);

        // drain the engine copy; the buffered tail remains
        let first = replay.frame().await.unwrap().unwrap().into_data().unwrap();
        assert_eq!(&first[..], b"0123");
        assert_eq!(replay.size_hint().exact(), None);
        let _ = replay.read_engine_copy();
        assert_eq!(replay.size_hint().exact(), Some(6));

        let (bytes, _) = collect(replay).await;
        assert_eq!(&bytes[..], b"456789");
    }

    #[tokio::test]
    async fn test_trailers_are_preserved() {
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", "abc".parse().unwrap());
        let raw = Full::new(Bytes::from_static(b"data")).with_trailers(std::future::ready(Some(Ok(trailers))));

        let buffered = prepare(raw).await.unwrap();
        let replay = buffered.into_replay(None, 0);
        let (bytes, trailers) = collect(replay).await;
        assert_eq!(&bytes[..], b"data");
        assert_eq!(trailers.unwrap().get("x-checksum").unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_read_failure_propagates() {
        let result = prepare(crate::testing::FailingBody::new()).await;
        assert!(result.is_err());
    }

    proptest! {
        #[test]
        fn prop_replay_equals_original(
            body in proptest::collection::vec(any::<u8>(), 0..40_000),
            consumed_frac in 0.0f64..=1.0,
        ) {
            let replayed = runtime().block_on(async {
                let buffered = prepare(Full::new(Bytes::from(body.clone()))).await.unwrap();
                let take = (body.len() as f64 * consumed_frac) as usize;
                let mut reader = buffered.reader();
                let mut head = vec![0u8; take];
                reader.read_exact(&mut head).unwrap();
                let copy: Box<dyn Read + Send> = Box::new(Cursor::new(head));
                collect(buffered.into_replay(Some(copy), reader.position() as usize)).await.0
            });
            prop_assert_eq!(replayed.to_vec(), body);
        }
    }
}
