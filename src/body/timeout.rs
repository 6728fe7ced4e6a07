//! Idle-timeout monitoring for streams and bodies.

use std::fmt;
use std::future::Future as _;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use futures_core::Stream;
use http_body::Body as _;
use pin_project::{pin_project, pinned_drop};

use crate::abort::{Aborted, Phase, TimeoutAbort};
use crate::{BoxError, Error};

/// Timer bookkeeping for one monitored stream.
struct Monitor {
    abort: TimeoutAbort,
    aborted: Aborted,
    idle: Option<Duration>,
    phase: Phase,
    terminate: bool,
    finished: bool,
}

impl Monitor {
    fn start(abort: TimeoutAbort, idle: Option<Duration>, terminate: bool) -> Self {
        let phase = if terminate {
            Phase::Response
        } else {
            Phase::Upload
        };

        match idle {
            Some(timeout) => {
                abort.reset_for(phase, timeout);
            }
            None => abort.clear_for(phase),
        }

        Self {
            aborted: abort.signal().aborted(),
            abort,
            idle,
            phase,
            terminate,
            finished: false,
        }
    }

    /// Registers interest in the signal, returning `true` once it has fired.
    fn poll_aborted(&mut self, cx: &mut Context<'_>) -> bool {
        Pin::new(&mut self.aborted).poll(cx).is_ready()
    }

    fn activity(&self) {
        if let Some(timeout) = self.idle {
            self.abort.reset_for(self.phase, timeout);
        }
    }

    fn finish(&mut self) {
        if std::mem::replace(&mut self.finished, true) {
            return;
        }

        if self.terminate {
            tracing::trace!(timeout.phase = %self.phase, "stream finished, terminating");
            self.abort.abort();
        } else {
            tracing::trace!(timeout.phase = %self.phase, "stream finished, clearing idle timer");
            self.abort.clear_for(self.phase);
        }
    }
}

/// A stream or body which resets an idle timeout every time it yields a chunk.
///
/// `TimeoutStream` wraps either a [`Stream`] of `Result`s or an
/// [`http_body::Body`], and shares a [`TimeoutAbort`] with the rest of the
/// exchange. Chunks pass through unchanged and in order.
///
/// - When constructed, the idle timer is armed (or, with no idle timeout,
///   cleared), so a source which never yields still times out.
/// - Every chunk re-arms the idle timer with the same duration.
/// - When the source ends, errors or the wrapper is dropped, the coordinator is
///   either aborted (for [`TimeoutStream::terminating`]) or just has its idle
///   timer cleared (for [`TimeoutStream::new`]).
///
/// Once the shared signal fires, the next poll yields [`Error::Aborted`] and
/// the stream then ends.
#[pin_project(PinnedDrop)]
pub struct TimeoutStream<S> {
    #[pin]
    inner: S,
    monitor: Monitor,
}

impl<S> TimeoutStream<S> {
    /// Wrap `inner`, clearing the idle timer when it ends so the coordinator
    /// stays usable afterwards. Used for request bodies.
    pub fn new(inner: S, abort: TimeoutAbort, idle: Option<Duration>) -> Self {
        Self::with_end_policy(inner, abort, idle, false)
    }

    /// Wrap `inner`, aborting the coordinator when it ends. Used for response
    /// bodies, after which no more timer activity should happen.
    pub fn terminating(inner: S, abort: TimeoutAbort, idle: Option<Duration>) -> Self {
        Self::with_end_policy(inner, abort, idle, true)
    }

    /// Wrap `inner`, choosing the end-of-stream policy explicitly.
    pub fn with_end_policy(
        inner: S,
        abort: TimeoutAbort,
        idle: Option<Duration>,
        terminate_on_end: bool,
    ) -> Self {
        Self {
            inner,
            monitor: Monitor::start(abort, idle, terminate_on_end),
        }
    }

    /// The coordinator shared by this stream.
    pub fn abort(&self) -> &TimeoutAbort {
        &self.monitor.abort
    }

    /// The idle timeout applied between chunks.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.monitor.idle
    }

    /// A reference to the wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: fmt::Debug> fmt::Debug for TimeoutStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutStream")
            .field("inner", &self.inner)
            .field("abort", &self.monitor.abort)
            .field("idle", &self.monitor.idle)
            .field("terminate", &self.monitor.terminate)
            .finish()
    }
}

#[pinned_drop]
impl<S> PinnedDrop for TimeoutStream<S> {
    fn drop(self: Pin<&mut Self>) {
        self.project().monitor.finish();
    }
}

impl<S, T, E> Stream for TimeoutStream<S>
where
    S: Stream<Item = Result<T, E>>,
    E: Into<BoxError>,
{
    type Item = Result<T, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let monitor = this.monitor;

        if monitor.finished {
            return Poll::Ready(None);
        }

        if monitor.poll_aborted(cx) {
            monitor.finish();
            return Poll::Ready(Some(Err(Error::Aborted)));
        }

        match ready!(this.inner.poll_next(cx)) {
            Some(Ok(item)) => {
                monitor.activity();
                Poll::Ready(Some(Ok(item)))
            }
            Some(Err(error)) => {
                monitor.finish();
                Poll::Ready(Some(Err(Error::transport(error))))
            }
            None => {
                monitor.finish();
                Poll::Ready(None)
            }
        }
    }
}

impl<B> http_body::Body for TimeoutStream<B>
where
    B: http_body::Body,
    B::Error: Into<BoxError>,
{
    type Data = B::Data;
    type Error = Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let monitor = this.monitor;

        if monitor.finished {
            return Poll::Ready(None);
        }

        if monitor.poll_aborted(cx) {
            monitor.finish();
            return Poll::Ready(Some(Err(Error::Aborted)));
        }

        match ready!(this.inner.poll_frame(cx)) {
            Some(Ok(frame)) => {
                monitor.activity();
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(error)) => {
                monitor.finish();
                Poll::Ready(Some(Err(Error::transport(error))))
            }
            None => {
                monitor.finish();
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.monitor.finished || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        if self.monitor.finished {
            return http_body::SizeHint::with_exact(0);
        }
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use bytes::Bytes;
    use futures_util::StreamExt as _;
    use http_body_util::BodyExt;
    use static_assertions::assert_impl_all;
    use tokio::sync::mpsc;

    use crate::abort::TimerState;

    type Chunk = Result<Bytes, std::io::Error>;

    assert_impl_all!(TimeoutStream<crate::Body>: http_body::Body, Send);

    fn channel_stream() -> (
        mpsc::Sender<Chunk>,
        impl Stream<Item = Chunk> + Send + Unpin + 'static,
    ) {
        let (tx, mut rx) = mpsc::channel::<Chunk>(8);
        let stream = futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx));
        (tx, stream)
    }

    fn chunks(parts: &[&'static str]) -> Vec<Chunk> {
        parts.iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect()
    }

    #[tokio::test]
    async fn pass_through_without_idle() {
        let abort = TimeoutAbort::new(None);
        let source = futures_util::stream::iter(chunks(&["a", "b", "c"]));
        let stream = TimeoutStream::new(source, abort.clone(), None);

        let items: Vec<Bytes> = stream.map(|item| item.unwrap()).collect().await;
        assert_eq!(items, vec!["a", "b", "c"]);
        assert_eq!(abort.state(), TimerState::Idle);
        assert!(!abort.is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn start_arms_idle_timer() {
        let abort = TimeoutAbort::new(None);
        let (_tx, source) = channel_stream();
        let mut stream = TimeoutStream::new(source, abort.clone(), Some(Duration::from_millis(20)));
        assert_eq!(abort.state(), TimerState::Armed(Phase::Upload));

        // The source never yields: the idle deadline passes while waiting.
        let item = stream.next().await.unwrap();
        assert!(item.unwrap_err().is_aborted());
        assert!(stream.next().await.is_none());
        assert!(abort.is_aborted());
    }

    #[tokio::test]
    async fn start_clears_earlier_timer() {
        let abort = TimeoutAbort::new(None);
        abort.reset_timeout(Duration::from_secs(10));

        let source = futures_util::stream::iter(chunks(&["a"]));
        let _stream = TimeoutStream::new(source, abort.clone(), None);
        assert_eq!(abort.state(), TimerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn frequent_chunks_keep_stream_alive() {
        let abort = TimeoutAbort::new(None);
        let (tx, source) = channel_stream();
        let stream = TimeoutStream::new(source, abort.clone(), Some(Duration::from_millis(50)));

        let producer = tokio::spawn(async move {
            for _ in 0..20 {
                tokio::time::sleep(Duration::from_millis(30)).await;
                tx.send(Ok(Bytes::from_static(b"tick"))).await.unwrap();
            }
        });

        let items: Vec<_> = stream.collect().await;
        producer.await.unwrap();

        assert_eq!(items.len(), 20);
        assert!(items.iter().all(|item| item.is_ok()));
        assert!(!abort.is_aborted());
        assert_eq!(abort.state(), TimerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn gap_between_chunks_aborts() {
        let abort = TimeoutAbort::new(None);
        let (tx, source) = channel_stream();
        let mut stream =
            TimeoutStream::terminating(source, abort.clone(), Some(Duration::from_millis(50)));

        tx.send(Ok(Bytes::from_static(b"first"))).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "first");

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            let _ = tx.send(Ok(Bytes::from_static(b"late"))).await;
        });

        let error = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(error, Error::Aborted));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn terminating_aborts_on_end() {
        let abort = TimeoutAbort::new(None);
        let source = futures_util::stream::iter(chunks(&["only"]));
        let stream = TimeoutStream::terminating(source, abort.clone(), None);

        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 1);
        assert!(abort.is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn non_terminating_leaves_coordinator_usable() {
        let abort = TimeoutAbort::new(Some(Duration::from_millis(200)));
        let source = futures_util::stream::iter(chunks(&["a", "b"]));
        let stream = TimeoutStream::new(source, abort.clone(), Some(Duration::from_millis(50)));

        let _items: Vec<_> = stream.collect().await;
        assert!(!abort.is_aborted());
        assert_eq!(abort.state(), TimerState::Idle);

        // Still abortable later, by the lifespan timer.
        abort.signal().aborted().await;
        assert!(abort.is_aborted());
    }

    #[tokio::test]
    async fn dropping_runs_end_policy() {
        let abort = TimeoutAbort::new(None);
        let (_tx, source) = channel_stream();
        let stream = TimeoutStream::terminating(source, abort.clone(), None);
        drop(stream);
        assert!(abort.is_aborted());
    }

    #[tokio::test]
    async fn source_error_passes_through() {
        let abort = TimeoutAbort::new(None);
        let source = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"ok")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ]);
        let mut stream = TimeoutStream::terminating(source, abort.clone(), None);

        assert!(stream.next().await.unwrap().is_ok());
        let error = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(error, Error::Transport(_)));
        assert!(!error.is_aborted());
        assert!(abort.is_aborted());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn zero_idle_fails_first_read() {
        let abort = TimeoutAbort::new(None);
        let source = futures_util::stream::iter(chunks(&["a", "b"]));
        let mut stream = TimeoutStream::terminating(source, abort.clone(), Some(Duration::ZERO));

        // Arming a zero deadline has already fired the signal.
        let first = stream.next().await.unwrap();
        assert!(first.unwrap_err().is_aborted());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn external_abort_fails_reads() {
        let abort = TimeoutAbort::new(None);
        let (_tx, source) = channel_stream();
        let mut stream = TimeoutStream::new(source, abort.clone(), None);

        let reader = tokio::spawn(async move { stream.next().await });
        tokio::task::yield_now().await;
        abort.abort();

        let item = reader.await.unwrap().unwrap();
        assert!(matches!(item, Err(Error::Aborted)));
    }

    #[tokio::test]
    async fn body_frames_reset_and_terminate() {
        let abort = TimeoutAbort::new(None);
        let body = crate::Body::from("hello body");
        let body = TimeoutStream::terminating(body, abort.clone(), Some(Duration::from_secs(5)));
        assert_eq!(abort.state(), TimerState::Armed(Phase::Response));

        let bytes = BodyExt::collect(body).await.unwrap().to_bytes();
        assert_eq!(bytes, "hello body");
        assert!(abort.is_aborted());
    }
}
