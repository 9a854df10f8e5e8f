use std::rc::Rc;
use std::time::Duration;

use http::{header, HeaderValue, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Notify};
use tracing::{debug, trace};

use crate::assemble::{Assembler, CodecEvent};
use crate::error::{ServeError, StreamError};
use crate::h1::encode::{encode_chunk, encode_head, strip_invalid_headers, CHUNKED_END};
use crate::h1::parse::{DecodeError, Decoder};
use crate::init::Middleware;
use crate::types::{Response, ResponseBody, ServeOutcome};
use crate::{Responder, RespondContext, ServerConf};

/// Serve HTTP/1.1 on one connection until it closes.
///
/// Requests are processed strictly in arrival order; response N+1 never
/// starts before response N has fully ended, which is what keeps
/// pipelined clients honest. Flipping `quiesce` to true makes the
/// connection close once idle, finishing any in-flight request first.
pub async fn serve<IO, R>(
    io: IO,
    conf: Rc<ServerConf>,
    responder: Rc<R>,
    mut middleware: Vec<Box<dyn Middleware>>,
    mut quiesce: watch::Receiver<bool>,
    rcx: RespondContext,
) -> Result<ServeOutcome, ServeError<R::Error>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
    R: Responder,
{
    let (mut rd, mut wr) = tokio::io::split(io);

    let mut dec = Decoder::new(conf.max_header_bytes);
    let mut asm = Assembler::new(conf.max_upload_size);
    let read_t = conf.h1_idle_timeout.map(|t| t.read);
    let write_t = conf.h1_idle_timeout.map(|t| t.write);

    let mut requests_in_progress: u32 = 0;
    let mut close_after_response = false;

    if *quiesce.borrow_and_update() {
        return Ok(ServeOutcome::ServerRequestedConnectionClose);
    }

    'conn: loop {
        // idle phase: wait for the next request head
        let first_event = {
            let idle = sleep_or_never(read_t);
            tokio::pin!(idle);
            loop {
                tokio::select! {
                    biased;
                    _ = quiesce.changed() => {
                        // a dropped sender means the server is gone; treat
                        // it like quiesce
                        if *quiesce.borrow() || quiesce.has_changed().is_err() {
                            debug!("quiesce while idle, closing");
                            return Ok(ServeOutcome::ServerRequestedConnectionClose);
                        }
                    }
                    _ = &mut idle => {
                        debug!("read-idle timeout between requests");
                        return Ok(ServeOutcome::IdleTimeout);
                    }
                    event = dec.next_event(&mut rd) => match event {
                        Ok(Some(event)) => break event,
                        Ok(None) => {
                            debug!("client went away before sending request headers");
                            return Ok(ServeOutcome::ClientClosedConnectionBetweenRequests);
                        }
                        Err(e) => {
                            return inbound_error_outcome(e, &mut wr, &conf, write_t).await;
                        }
                    },
                }
            }
        };

        // gather events until the assembler hands us a request
        let mut event = Some(first_event);
        let request = loop {
            if let Some(event) = event.take() {
                if let Some(request) = asm.on_event(event) {
                    break request;
                }
                continue;
            }
            tokio::select! {
                biased;
                _ = quiesce.changed(), if !close_after_response => {
                    if *quiesce.borrow() || quiesce.has_changed().is_err() {
                        // a request is mid-assembly: finish it, then close
                        close_after_response = true;
                    }
                }
                next = dec.next_event(&mut rd) => match next {
                    Ok(Some(ev)) => event = Some(ev),
                    Ok(None) => {
                        debug!("client went away mid-request");
                        return Ok(ServeOutcome::ClientClosedConnectionBetweenRequests);
                    }
                    Err(e) => {
                        return inbound_error_outcome(e, &mut wr, &conf, write_t).await;
                    }
                },
            }
        };

        let client_keep_alive = request.head.is_keep_alive();
        let version = request.head.version;
        debug!(head = ?request.head, "got request");

        // backpressure plumbing for a promoted body: the read pump parks
        // on `resume` whenever the streamer is over the buffer ceiling
        let resume = Rc::new(Notify::new());
        if let Some(feeder) = asm.feeder() {
            let resume = resume.clone();
            feeder.set_on_consume(move |_| resume.notify_one());
        }

        let mut request = request;
        for mw in middleware.iter_mut() {
            mw.on_request(&mut request);
        }

        requests_in_progress += 1;
        trace!(requests_in_progress, "dispatching request");
        let mut pump_failed = false;

        // invoke the responder; keep the request body flowing while it
        // runs
        let result = {
            let respond = responder.respond(request, &rcx);
            tokio::pin!(respond);
            loop {
                let pumping = asm.is_streaming() && !pump_failed;
                tokio::select! {
                    biased;
                    result = &mut respond => break result,
                    _ = quiesce.changed(), if !close_after_response => {
                        if *quiesce.borrow() || quiesce.has_changed().is_err() {
                            close_after_response = true;
                        }
                    }
                    step = pump_step(&mut dec, &mut rd, &asm, &conf, &resume), if pumping => {
                        match step {
                            Ok(Some(ev)) => {
                                let emitted = asm.on_event(ev);
                                debug_assert!(emitted.is_none(), "request emitted mid-flight");
                            }
                            Ok(None) => {} // backpressure nap
                            Err(e) => {
                                let absorbed = asm.on_error(decode_to_stream_error(e));
                                debug_assert!(absorbed);
                                pump_failed = true;
                                close_after_response = true;
                            }
                        }
                    }
                }
            }
        };

        let mut response = match result {
            Ok(response) => response,
            Err(e) => crate::error::error_to_response(&e),
        };
        for mw in middleware.iter_mut().rev() {
            mw.on_response(&mut response);
        }

        let keep_alive = client_keep_alive
            && !close_after_response
            && !asm.body_too_large()
            // streamed responses to HTTP/1.0 clients are close-delimited
            && !(version == Version::HTTP_10
                && matches!(response.body, ResponseBody::Streamed(_)));

        let chunked = version != Version::HTTP_10;
        finalize_headers(&mut response, &conf, keep_alive, chunked);

        // write the response, pumping the request body all the while (a
        // streamed response may be fed from it)
        let mut aborted = false;
        {
            let forbids_body = response.means_empty_body();
            let head = encode_head(response.status, version, &response.headers);
            timed(write_t, wr.write_all(&head)).await?;

            match response.body {
                ResponseBody::Empty => {}
                ResponseBody::Buffered(body) => {
                    if !forbids_body {
                        timed(write_t, wr.write_all(&body)).await?;
                    }
                }
                ResponseBody::Streamed(mut rx) => {
                    loop {
                        let pumping = asm.is_streaming() && !pump_failed;
                        tokio::select! {
                            biased;
                            chunk = rx.recv() => match chunk {
                                Some(Ok(data)) => {
                                    if data.is_empty() {
                                        continue;
                                    }
                                    if chunked {
                                        timed(write_t, wr.write_all(&encode_chunk(&data))).await?;
                                    } else {
                                        timed(write_t, wr.write_all(&data)).await?;
                                    }
                                    timed(write_t, wr.flush()).await?;
                                }
                                Some(Err(_)) => {
                                    // headers are out; all we can do is
                                    // terminate the body and hang up
                                    debug!("response body producer aborted mid-stream");
                                    aborted = true;
                                    break;
                                }
                                None => break,
                            },
                            step = pump_step(&mut dec, &mut rd, &asm, &conf, &resume), if pumping => {
                                match step {
                                    Ok(Some(ev)) => { asm.on_event(ev); }
                                    Ok(None) => {}
                                    Err(e) => {
                                        asm.on_error(decode_to_stream_error(e));
                                        pump_failed = true;
                                        close_after_response = true;
                                    }
                                }
                            }
                        }
                    }
                    if chunked {
                        timed(write_t, wr.write_all(CHUNKED_END)).await?;
                    }
                }
            }
            timed(write_t, wr.flush()).await?;
        }

        requests_in_progress -= 1;
        trace!(requests_in_progress, "response written");

        if aborted || pump_failed {
            return Ok(ServeOutcome::ServerRequestedConnectionClose);
        }
        if asm.body_too_large() {
            debug!("request body ran past the upload ceiling, closing");
            close_cleanly(&mut dec, &mut rd, &mut wr, &mut asm, &conf).await;
            return Ok(ServeOutcome::RequestBodyTooLarge);
        }
        if !keep_alive {
            close_cleanly(&mut dec, &mut rd, &mut wr, &mut asm, &conf).await;
            return Ok(if close_after_response {
                ServeOutcome::ServerRequestedConnectionClose
            } else {
                ServeOutcome::ClientRequestedConnectionClose
            });
        }

        // read through whatever is left of the request body so the next
        // head parses from a clean slate; the dropped streamer discards
        // what we feed it
        while !asm.is_idle() {
            match dec.next_event(&mut rd).await {
                Ok(Some(ev)) => {
                    asm.on_event(ev);
                    if asm.body_too_large() {
                        return Ok(ServeOutcome::RequestBodyTooLarge);
                    }
                }
                Ok(None) => return Ok(ServeOutcome::ClientClosedConnectionBetweenRequests),
                Err(DecodeError::Http(_)) => return Ok(ServeOutcome::MalformedRequest),
                Err(_) => return Ok(ServeOutcome::ClientClosedConnectionBetweenRequests),
            }
        }

        continue 'conn;
    }
}

/// Close without slamming the door: send FIN first, then read the tail
/// of an unfinished request body so the peer's in-flight bytes aren't
/// answered with a reset that could eat the response. The drain is
/// bounded; a peer with absurd amounts left to say gets the reset.
async fn close_cleanly<Rd, W>(
    dec: &mut Decoder,
    rd: &mut Rd,
    wr: &mut W,
    asm: &mut Assembler,
    conf: &ServerConf,
) where
    Rd: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let _ = wr.shutdown().await;
    let cap = conf.max_upload_size.saturating_mul(4);
    let mut discarded = 0u64;
    while !asm.is_idle() && discarded <= cap {
        match dec.next_event(rd).await {
            Ok(Some(event)) => {
                if let CodecEvent::Body(data) = &event {
                    discarded += data.len() as u64;
                }
                asm.on_event(event);
            }
            _ => break,
        }
    }
}

/// One step of the request-body read pump. Parks on `resume` instead of
/// reading while the streamer sits at or above the buffer ceiling.
async fn pump_step<R>(
    dec: &mut Decoder,
    rd: &mut R,
    asm: &Assembler,
    conf: &ServerConf,
    resume: &Notify,
) -> Result<Option<CodecEvent>, DecodeError>
where
    R: AsyncRead + Unpin,
{
    if let Some(feeder) = asm.feeder() {
        if !feeder.draining() && feeder.buffered() >= conf.max_streaming_buffer_size {
            resume.notified().await;
            return Ok(None);
        }
    }
    dec.next_event(rd).await
}

fn decode_to_stream_error(e: DecodeError) -> StreamError {
    match e {
        DecodeError::Io(e) => StreamError::Transport(e),
        DecodeError::Http(crate::error::HttpError::MalformedRequest(what)) => {
            StreamError::Malformed(what)
        }
        DecodeError::Http(crate::error::HttpError::HeadersTooLarge { .. }) => {
            StreamError::Malformed("oversized trailer section")
        }
        DecodeError::UnexpectedEof => StreamError::Closed,
    }
}

/// Inbound parse failure while no request was in flight: auto-reply when
/// configured, then close.
async fn inbound_error_outcome<W, E>(
    e: DecodeError,
    wr: &mut W,
    conf: &ServerConf,
    write_t: Option<Duration>,
) -> Result<ServeOutcome, ServeError<E>>
where
    W: AsyncWrite + Unpin,
{
    match e {
        DecodeError::Http(http_err) => {
            debug!(error = %http_err, "inbound http error");
            let status = http_err.status();
            if conf.http_error_handling {
                let mut response = Response::new(status);
                finalize_headers(&mut response, conf, false, false);
                let head = encode_head(response.status, Version::HTTP_11, &response.headers);
                timed(write_t, wr.write_all(&head)).await?;
                timed(write_t, wr.flush()).await?;
            }
            Ok(match status {
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE => {
                    ServeOutcome::RequestHeadersTooLarge
                }
                _ => ServeOutcome::MalformedRequest,
            })
        }
        DecodeError::Io(e) => {
            debug!(error = %e, "read error from downstream");
            Ok(ServeOutcome::ClientClosedConnectionBetweenRequests)
        }
        DecodeError::UnexpectedEof => {
            debug!("client went away mid-request");
            Ok(ServeOutcome::ClientClosedConnectionBetweenRequests)
        }
    }
}

/// Compute the response's framing and policy headers.
fn finalize_headers(response: &mut Response, conf: &ServerConf, keep_alive: bool, chunked: bool) {
    let forbids_body = response.means_empty_body();
    match &response.body {
        ResponseBody::Buffered(body) if !forbids_body => {
            let len = body.len();
            response
                .headers
                .entry(header::CONTENT_LENGTH)
                .or_insert_with(|| HeaderValue::from_str(&len.to_string()).unwrap());
        }
        ResponseBody::Empty if !forbids_body => {
            response
                .headers
                .entry(header::CONTENT_LENGTH)
                .or_insert(HeaderValue::from_static("0"));
        }
        ResponseBody::Streamed(_) if chunked => {
            response
                .headers
                .insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        }
        _ => {}
    }

    if let Some(name) = &conf.server_name {
        if let Ok(value) = HeaderValue::from_str(name) {
            response.headers.entry(header::SERVER).or_insert(value);
        }
    }

    // the connection header is an HTTP/1.x-only affair
    response.headers.insert(
        header::CONNECTION,
        HeaderValue::from_static(if keep_alive { "keep-alive" } else { "close" }),
    );

    if conf.outbound_header_validation {
        strip_invalid_headers(&mut response.headers);
    }
}

async fn timed<T>(
    limit: Option<Duration>,
    fut: impl std::future::Future<Output = std::io::Result<T>>,
) -> std::io::Result<T> {
    match limit {
        Some(d) => match tokio::time::timeout(d, fut).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "write-idle timeout",
            )),
        },
        None => fut.await,
    }
}

async fn sleep_or_never(limit: Option<Duration>) {
    match limit {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}
