//! The per-connection (per-stream, on HTTP/2) state machine that turns
//! codec events into request values, coalescing small bodies into a
//! single buffer and promoting larger ones into a streaming body.

use bytes::Bytes;

use crate::error::StreamError;
use crate::streamer::{self, StreamFeeder};
use crate::types::{Request, RequestBody, RequestHead};

/// One head/body/end event out of the HTTP codec.
#[derive(Debug)]
pub(crate) enum CodecEvent {
    Head(RequestHead),
    Body(Bytes),
    End,
}

#[derive(Default)]
enum AssemblyState {
    /// between requests
    #[default]
    Idle,

    /// saw the head, no body bytes yet
    HaveHead(RequestHead),

    /// head plus exactly one body chunk; if `end` comes next this was a
    /// small body and ships fully buffered
    HaveFirstChunk(RequestHead, Bytes),

    /// the body outgrew one chunk; everything flows through the streamer
    Streaming(StreamFeeder),

    /// a codec error poisoned the cycle; events are ignored until `end`
    Failed,
}

pub(crate) struct Assembler {
    state: AssemblyState,
    max_upload: u64,

    /// sticky: some request body on this connection ran past the ceiling
    body_too_large: bool,
}

impl Assembler {
    pub(crate) fn new(max_upload: u64) -> Self {
        Self {
            state: AssemblyState::Idle,
            max_upload,
            body_too_large: false,
        }
    }

    /// Feed one codec event. Returns the completed request exactly once
    /// per head/body*/end cycle: on `end` for empty and single-chunk
    /// bodies, on the second body chunk for promoted ones.
    pub(crate) fn on_event(&mut self, event: CodecEvent) -> Option<Request> {
        match (std::mem::take(&mut self.state), event) {
            (AssemblyState::Idle, CodecEvent::Head(head)) => {
                self.state = AssemblyState::HaveHead(head);
                None
            }
            (AssemblyState::HaveHead(head), CodecEvent::Body(chunk)) => {
                if chunk.len() as u64 > self.max_upload {
                    // doomed however the cycle continues; hand the
                    // consumer a stream that errors out immediately
                    return Some(self.promote(head, [chunk]));
                }
                self.state = AssemblyState::HaveFirstChunk(head, chunk);
                None
            }
            (AssemblyState::HaveHead(head), CodecEvent::End) => {
                self.state = AssemblyState::Idle;
                Some(Request {
                    head,
                    body: RequestBody::Empty,
                })
            }
            (AssemblyState::HaveFirstChunk(head, first), CodecEvent::Body(chunk)) => {
                Some(self.promote(head, [first, chunk]))
            }
            (AssemblyState::HaveFirstChunk(head, first), CodecEvent::End) => {
                self.state = AssemblyState::Idle;
                if first.len() as u64 > self.max_upload {
                    return Some(self.promote(head, [first]));
                }
                Some(Request {
                    head,
                    body: RequestBody::Buffered(first),
                })
            }
            (AssemblyState::Streaming(feeder), CodecEvent::Body(chunk)) => {
                if feeder.feed_data(chunk).is_err() {
                    self.body_too_large = true;
                }
                self.state = AssemblyState::Streaming(feeder);
                None
            }
            (AssemblyState::Streaming(feeder), CodecEvent::End) => {
                feeder.feed_end();
                self.state = AssemblyState::Idle;
                None
            }
            (AssemblyState::Failed, CodecEvent::End) => {
                self.state = AssemblyState::Idle;
                None
            }
            (AssemblyState::Failed, _) => {
                self.state = AssemblyState::Failed;
                None
            }
            (state, event) => {
                // events in impossible states are codec contract
                // violations
                debug_assert!(false, "codec event {event:?} in invalid assembly state");
                let _ = state;
                self.state = AssemblyState::Failed;
                None
            }
        }
    }

    /// A codec-level error. Returns true if it was absorbed by an active
    /// streaming body (the consumer will observe it); false means the
    /// caller owns propagation.
    pub(crate) fn on_error(&mut self, err: StreamError) -> bool {
        match std::mem::replace(&mut self.state, AssemblyState::Failed) {
            AssemblyState::Streaming(feeder) => {
                feeder.feed_error(err);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_streaming(&self) -> bool {
        matches!(self.state, AssemblyState::Streaming(_))
    }

    pub(crate) fn is_idle(&self) -> bool {
        matches!(self.state, AssemblyState::Idle)
    }

    /// Sticky: a body on this connection tripped the upload ceiling, so
    /// the transport must close once the in-flight response is out.
    pub(crate) fn body_too_large(&self) -> bool {
        self.body_too_large
    }

    /// The feeder of the in-flight streaming body, for backpressure
    /// accounting.
    pub(crate) fn feeder(&self) -> Option<&StreamFeeder> {
        match &self.state {
            AssemblyState::Streaming(feeder) => Some(feeder),
            _ => None,
        }
    }

    fn promote(
        &mut self,
        head: RequestHead,
        chunks: impl IntoIterator<Item = Bytes>,
    ) -> Request {
        let content_len = head.content_length();
        let (stream, feeder) = streamer::pair(self.max_upload, content_len);
        for chunk in chunks {
            if feeder.feed_data(chunk).is_err() {
                self.body_too_large = true;
                break;
            }
        }
        self.state = AssemblyState::Streaming(feeder);
        Request {
            head,
            body: RequestBody::Streamed(stream),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Body, BodyChunk};
    use proptest::prelude::*;
    use proptest::test_runner::TestCaseError;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
    }

    fn head() -> RequestHead {
        RequestHead::default()
    }

    #[test]
    fn empty_body_request() {
        let mut asm = Assembler::new(1024);
        assert!(asm.on_event(CodecEvent::Head(head())).is_none());
        let req = asm.on_event(CodecEvent::End).unwrap();
        assert!(matches!(req.body, RequestBody::Empty));
        assert!(asm.is_idle());
    }

    #[test]
    fn single_chunk_stays_buffered() {
        let mut asm = Assembler::new(1024);
        asm.on_event(CodecEvent::Head(head()));
        assert!(asm
            .on_event(CodecEvent::Body(Bytes::from_static(b"small")))
            .is_none());
        let req = asm.on_event(CodecEvent::End).unwrap();
        match req.body {
            RequestBody::Buffered(b) => assert_eq!(&b[..], b"small"),
            other => panic!("expected buffered body, got {other:?}"),
        }
    }

    #[test]
    fn second_chunk_promotes_to_streaming() {
        rt().block_on(async {
            let mut asm = Assembler::new(1024);
            asm.on_event(CodecEvent::Head(head()));
            asm.on_event(CodecEvent::Body(Bytes::from_static(b"first")));
            let req = asm
                .on_event(CodecEvent::Body(Bytes::from_static(b"second")))
                .unwrap();
            assert!(asm.is_streaming());

            asm.on_event(CodecEvent::Body(Bytes::from_static(b"third")));
            asm.on_event(CodecEvent::End);
            assert!(asm.is_idle());

            let mut body = req.body;
            let mut got = Vec::new();
            loop {
                match body.next_chunk().await.unwrap() {
                    BodyChunk::Chunk(b) => got.extend_from_slice(&b),
                    BodyChunk::Done => break,
                }
            }
            assert_eq!(got, b"firstsecondthird");
        });
    }

    #[test]
    fn oversized_single_chunk_errors_out() {
        rt().block_on(async {
            let mut asm = Assembler::new(4);
            asm.on_event(CodecEvent::Head(head()));
            asm.on_event(CodecEvent::Body(Bytes::from_static(b"abc")));
            let req = asm.on_event(CodecEvent::End).unwrap();
            // 3 bytes <= 4: stays buffered
            assert!(matches!(req.body, RequestBody::Buffered(_)));

            let mut asm = Assembler::new(4);
            asm.on_event(CodecEvent::Head(head()));
            let req = asm
                .on_event(CodecEvent::Body(Bytes::from_static(b"abcdef")))
                .unwrap();
            assert!(asm.body_too_large());
            let mut body = req.body;
            assert!(matches!(
                body.next_chunk().await,
                Err(crate::error::StreamError::PayloadTooLarge { .. })
            ));
        });
    }

    #[test]
    fn codec_error_mid_stream_reaches_consumer() {
        rt().block_on(async {
            let mut asm = Assembler::new(1024);
            asm.on_event(CodecEvent::Head(head()));
            asm.on_event(CodecEvent::Body(Bytes::from_static(b"a")));
            let req = asm
                .on_event(CodecEvent::Body(Bytes::from_static(b"b")))
                .unwrap();
            assert!(asm.on_error(crate::error::StreamError::Closed));

            let mut body = req.body;
            let _ = body.next_chunk().await.unwrap();
            let _ = body.next_chunk().await.unwrap();
            assert!(matches!(
                body.next_chunk().await,
                Err(crate::error::StreamError::Closed)
            ));
        });
    }

    proptest! {
        /// For any head/body*/end sequence, exactly one request comes out
        /// and its fully-consumed body equals the concatenation of the
        /// body chunks.
        #[test]
        fn reassembly_roundtrip(chunks in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..48),
            0..12,
        )) {
            rt().block_on(async {
                let expected: Vec<u8> = chunks.concat();
                let mut asm = Assembler::new(u64::MAX);

                let mut emitted = Vec::new();
                if let Some(r) = asm.on_event(CodecEvent::Head(head())) {
                    emitted.push(r);
                }
                for chunk in &chunks {
                    if let Some(r) = asm.on_event(CodecEvent::Body(Bytes::from(chunk.clone()))) {
                        emitted.push(r);
                    }
                }
                if let Some(r) = asm.on_event(CodecEvent::End) {
                    emitted.push(r);
                }

                prop_assert_eq!(emitted.len(), 1);
                prop_assert!(asm.is_idle());

                let req = emitted.pop().unwrap();
                let mut body = req.body;
                let mut got = Vec::new();
                loop {
                    match body.next_chunk().await {
                        Ok(BodyChunk::Chunk(b)) => got.extend_from_slice(&b),
                        Ok(BodyChunk::Done) => break,
                        Err(e) => return Err(TestCaseError::fail(format!("{e}"))),
                    }
                }
                prop_assert_eq!(got, expected);
                Ok(())
            })?;
        }
    }
}
