//! The streaming request-body channel: a lazy, single-producer
//! single-consumer queue of byte chunks, bound to the connection's
//! executor, with size accounting and consumer-driven read resumption.

use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    future::poll_fn,
    rc::Rc,
    task::{Poll, Waker},
};

use bytes::Bytes;

use crate::error::StreamError;
use crate::types::{Body, BodyChunk};

enum Chunk {
    Data(Bytes),
    End,
    Error(StreamError),
}

struct Inner {
    queue: VecDeque<Chunk>,

    /// bytes currently queued and not yet consumed
    buffered: u64,

    /// lifetime bytes accepted from the producer, checked against
    /// `max_size`
    fed: u64,

    max_size: u64,
    content_len: Option<u64>,

    /// a terminator (`End` or `Error`) has been queued; later feeds are
    /// ignored
    terminated: bool,

    /// the consumer has observed the terminator
    eof: bool,

    /// the consumer went away; remaining and future chunks are discarded
    draining: bool,

    waker: Option<Waker>,
    on_consume: Option<Rc<dyn Fn(usize)>>,
}

impl Inner {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// Create a streamer pair: the consumer handle that rides inside a
/// [`crate::RequestBody::Streamed`], and the producer handle the
/// connection's read pump feeds.
pub(crate) fn pair(max_size: u64, content_len: Option<u64>) -> (ByteStream, StreamFeeder) {
    let inner = Rc::new(RefCell::new(Inner {
        queue: VecDeque::new(),
        buffered: 0,
        fed: 0,
        max_size,
        content_len,
        terminated: false,
        eof: false,
        draining: false,
        waker: None,
        on_consume: None,
    }));
    (
        ByteStream {
            inner: inner.clone(),
        },
        StreamFeeder { inner },
    )
}

/// The consumer half of a streaming request body.
///
/// Chunks arrive in FIFO order; exactly one end-of-stream or error
/// terminator is ever delivered, and reads past it keep returning
/// [`BodyChunk::Done`]. Dropping the handle drains the stream: anything
/// still queued (or still arriving) is discarded.
pub struct ByteStream {
    inner: Rc<RefCell<Inner>>,
}

impl ByteStream {
    /// Bytes fed but not yet consumed.
    pub fn buffered(&self) -> u64 {
        self.inner.borrow().buffered
    }
}

impl Body for ByteStream {
    fn content_len(&self) -> Option<u64> {
        self.inner.borrow().content_len
    }

    fn eof(&self) -> bool {
        self.inner.borrow().eof
    }

    async fn next_chunk(&mut self) -> Result<BodyChunk, StreamError> {
        poll_fn(|cx| {
            let mut inner = self.inner.borrow_mut();
            if inner.eof {
                return Poll::Ready(Ok(BodyChunk::Done));
            }
            match inner.queue.pop_front() {
                Some(Chunk::Data(data)) => {
                    inner.buffered -= data.len() as u64;
                    let on_consume = inner.on_consume.clone();
                    drop(inner);
                    if let Some(cb) = on_consume {
                        cb(data.len());
                    }
                    Poll::Ready(Ok(BodyChunk::Chunk(data)))
                }
                Some(Chunk::End) => {
                    inner.eof = true;
                    Poll::Ready(Ok(BodyChunk::Done))
                }
                Some(Chunk::Error(e)) => {
                    inner.eof = true;
                    Poll::Ready(Err(e))
                }
                None => {
                    inner.waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        })
        .await
    }
}

impl Drop for ByteStream {
    fn drop(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.draining = true;
        let mut discarded = 0usize;
        for chunk in inner.queue.drain(..) {
            if let Chunk::Data(data) = chunk {
                discarded += data.len();
            }
        }
        inner.buffered = 0;
        let on_consume = inner.on_consume.take();
        drop(inner);
        // unparks a read pump that was waiting out backpressure
        if let (Some(cb), true) = (on_consume, discarded > 0) {
            cb(discarded);
        }
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ByteStream")
            .field("buffered", &inner.buffered)
            .field("fed", &inner.fed)
            .field("eof", &inner.eof)
            .finish()
    }
}

/// The producer half: owned by the connection's read pump.
pub(crate) struct StreamFeeder {
    inner: Rc<RefCell<Inner>>,
}

impl StreamFeeder {
    /// Append a chunk. If accepting it would push the lifetime byte count
    /// past the ceiling, the stream is terminated with
    /// [`StreamError::PayloadTooLarge`] instead and that error is
    /// returned so the caller can arrange to close the transport.
    pub(crate) fn feed_data(&self, data: Bytes) -> Result<(), StreamError> {
        let mut inner = self.inner.borrow_mut();
        if inner.terminated {
            // feeds after the terminator are drain-through; ignore them
            return Ok(());
        }
        if inner.fed + data.len() as u64 > inner.max_size {
            let limit = inner.max_size;
            inner.queue.push_back(Chunk::Error(StreamError::PayloadTooLarge { limit }));
            inner.terminated = true;
            inner.wake();
            return Err(StreamError::PayloadTooLarge { limit });
        }
        inner.fed += data.len() as u64;
        if !inner.draining {
            inner.buffered += data.len() as u64;
            inner.queue.push_back(Chunk::Data(data));
            inner.wake();
        }
        Ok(())
    }

    pub(crate) fn feed_end(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.terminated {
            return;
        }
        inner.terminated = true;
        if inner.draining {
            inner.eof = true;
        } else {
            inner.queue.push_back(Chunk::End);
            inner.wake();
        }
    }

    pub(crate) fn feed_error(&self, err: StreamError) {
        let mut inner = self.inner.borrow_mut();
        if inner.terminated {
            return;
        }
        inner.terminated = true;
        if inner.draining {
            inner.eof = true;
        } else {
            inner.queue.push_back(Chunk::Error(err));
            inner.wake();
        }
    }

    pub(crate) fn buffered(&self) -> u64 {
        self.inner.borrow().buffered
    }

    /// The consumer dropped its handle; feeds are discards from here on.
    pub(crate) fn draining(&self) -> bool {
        self.inner.borrow().draining
    }

    /// Install the consume hook: called with each consumed chunk's length,
    /// on the connection's executor. The read pump uses it to resume
    /// transport reads once the buffer drops back under the threshold.
    pub(crate) fn set_on_consume(&self, cb: impl Fn(usize) + 'static) {
        self.inner.borrow_mut().on_consume = Some(Rc::new(cb));
    }
}

impl Drop for StreamFeeder {
    fn drop(&mut self) {
        // the producer going away without a terminator means the
        // transport died mid-body
        let mut inner = self.inner.borrow_mut();
        if !inner.terminated {
            inner.terminated = true;
            inner.queue.push_back(Chunk::Error(StreamError::Closed));
            inner.wake();
        }
    }
}

impl fmt::Debug for StreamFeeder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("StreamFeeder")
            .field("buffered", &inner.buffered)
            .field("terminated", &inner.terminated)
            .finish()
    }
}
