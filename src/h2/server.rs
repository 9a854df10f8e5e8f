use std::{
    cell::{Cell, RefCell},
    future::poll_fn,
    rc::Rc,
};

use bytes::Bytes;
use http::{header, HeaderValue, Version};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::assemble::{Assembler, CodecEvent};
use crate::error::{ServeError, StreamError};
use crate::h2::tracker::{StreamTracker, TrackerEvent, TrackerState, TrackerVerdict};
use crate::init::Middleware;
use crate::types::{RequestHead, Response, ResponseBody, ServeOutcome};
use crate::{Responder, RespondContext, ServerConf};

/// Serve HTTP/2 on one connection until it closes.
///
/// Every stream runs as its own task on the connection's executor.
/// Flipping `quiesce` to true sends GOAWAY and lets in-flight streams
/// drain: the connection closes exactly when the last of them does.
/// Requires a running [`tokio::task::LocalSet`].
pub async fn serve<IO, R>(
    io: IO,
    conf: Rc<ServerConf>,
    responder: Rc<R>,
    middleware: Vec<Box<dyn Middleware>>,
    mut quiesce: watch::Receiver<bool>,
    rcx: RespondContext,
) -> Result<ServeOutcome, ServeError<R::Error>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
    R: Responder + 'static,
    R::Error: 'static,
{
    let mut conn = h2::server::handshake(io).await?;

    let tracker = Rc::new(RefCell::new(StreamTracker::new()));
    let stream_events = Rc::new(Notify::new());
    let middleware = Rc::new(RefCell::new(middleware));
    let last_read = Rc::new(Cell::new(Instant::now()));
    let last_write = Rc::new(Cell::new(Instant::now()));

    let mut quiesced = false;
    let mut outcome = ServeOutcome::ConnectionDrained;

    'conn: loop {
        tokio::select! {
            biased;
            _ = quiesce.changed(), if !quiesced => {
                if *quiesce.borrow() || quiesce.has_changed().is_err() {
                    quiesced = true;
                    debug!("quiescing, sending GOAWAY");
                    conn.graceful_shutdown();
                    outcome = ServeOutcome::ServerRequestedConnectionClose;
                    if tracker.borrow_mut().on_event(TrackerEvent::Quiesce)
                        == TrackerVerdict::Close
                    {
                        break 'conn;
                    }
                }
            }
            _ = stream_events.notified() => {
                if tracker.borrow().state() == TrackerState::Closing {
                    break 'conn;
                }
            }
            verdict = idle_tick(&conf, &tracker, &last_read, &last_write),
                if conf.h2_idle_timeout.is_some() =>
            {
                if verdict == TrackerVerdict::Close {
                    debug!("idle timeout, closing HTTP/2 connection");
                    outcome = ServeOutcome::IdleTimeout;
                    conn.abrupt_shutdown(h2::Reason::NO_ERROR);
                    break 'conn;
                }
            }
            accepted = conn.accept() => match accepted {
                Some(Ok((request, respond))) => {
                    last_read.set(Instant::now());
                    if tracker.borrow().is_quiescing() {
                        // raced with GOAWAY; refuse so the client retries
                        // elsewhere
                        let mut respond = respond;
                        respond.send_reset(h2::Reason::REFUSED_STREAM);
                        continue;
                    }
                    tracker.borrow_mut().on_event(TrackerEvent::StreamCreated);
                    trace!(open = tracker.borrow().open_streams(), "stream accepted");

                    tokio::task::spawn_local(stream_task(StreamContext {
                        request,
                        respond,
                        conf: conf.clone(),
                        responder: responder.clone(),
                        middleware: middleware.clone(),
                        rcx: rcx.clone(),
                        tracker: tracker.clone(),
                        stream_events: stream_events.clone(),
                        last_read: last_read.clone(),
                        last_write: last_write.clone(),
                    }));
                }
                Some(Err(e)) => {
                    debug!(error = %e, "HTTP/2 accept error");
                    return Err(ServeError::H2(e));
                }
                None => break 'conn,
            },
        }
    }

    // flush whatever the drained streams still have queued
    if let Err(e) = poll_fn(|cx| conn.poll_closed(cx)).await {
        debug!(error = %e, "HTTP/2 connection closed uncleanly");
    }
    Ok(outcome)
}

/// Fires tracker idle events once the respective deadline passes.
async fn idle_tick(
    conf: &ServerConf,
    tracker: &Rc<RefCell<StreamTracker>>,
    last_read: &Rc<Cell<Instant>>,
    last_write: &Rc<Cell<Instant>>,
) -> TrackerVerdict {
    let Some(idle) = conf.h2_idle_timeout else {
        return std::future::pending().await;
    };
    loop {
        let read_deadline = last_read.get() + idle.read;
        let write_deadline = last_write.get() + idle.write;
        tokio::time::sleep_until(read_deadline.min(write_deadline)).await;

        let now = Instant::now();
        if now >= last_read.get() + idle.read {
            last_read.set(now);
            if tracker.borrow_mut().on_event(TrackerEvent::IdleRead) == TrackerVerdict::Close {
                return TrackerVerdict::Close;
            }
        }
        if now >= last_write.get() + idle.write {
            last_write.set(now);
            if tracker.borrow_mut().on_event(TrackerEvent::IdleWrite) == TrackerVerdict::Close {
                return TrackerVerdict::Close;
            }
        }
    }
}

struct StreamContext<R: Responder> {
    request: http::Request<h2::RecvStream>,
    respond: h2::server::SendResponse<Bytes>,
    conf: Rc<ServerConf>,
    responder: Rc<R>,
    middleware: Rc<RefCell<Vec<Box<dyn Middleware>>>>,
    rcx: RespondContext,
    tracker: Rc<RefCell<StreamTracker>>,
    stream_events: Rc<Notify>,
    last_read: Rc<Cell<Instant>>,
    last_write: Rc<Cell<Instant>>,
}

/// One HTTP/2 stream: assemble the request, run the responder while the
/// body keeps flowing, write the response, account the close.
async fn stream_task<R>(cx: StreamContext<R>)
where
    R: Responder,
{
    let StreamContext {
        request,
        mut respond,
        conf,
        responder,
        middleware,
        rcx,
        tracker,
        stream_events,
        last_read,
        last_write,
    } = cx;

    let (parts, mut recv) = request.into_parts();
    let head = RequestHead {
        method: parts.method,
        uri: parts.uri,
        version: Version::HTTP_2,
        headers: parts.headers,
    };

    let mut flow = recv.flow_control().clone();
    let mut asm = Assembler::new(conf.max_upload_size);
    let mut pump_done = false;
    let mut pump_failed = false;

    asm.on_event(CodecEvent::Head(head));

    // gather data frames until the assembler hands us the request
    let mut pending_release = 0usize;
    let request = loop {
        if recv.is_end_stream() {
            pump_done = true;
        }
        let event = if pump_done {
            CodecEvent::End
        } else {
            match recv.data().await {
                Some(Ok(data)) => {
                    last_read.set(Instant::now());
                    pending_release += data.len();
                    CodecEvent::Body(data)
                }
                Some(Err(e)) => {
                    debug!(error = %e, "stream errored before dispatch, resetting");
                    respond.send_reset(h2::Reason::INTERNAL_ERROR);
                    finish_stream(&tracker, &stream_events);
                    return;
                }
                None => {
                    pump_done = true;
                    CodecEvent::End
                }
            }
        };
        let emitted = asm.on_event(event);
        if let Some(request) = emitted {
            break request;
        }
        if pump_done {
            debug!("stream ended without producing a request");
            respond.send_reset(h2::Reason::PROTOCOL_ERROR);
            finish_stream(&tracker, &stream_events);
            return;
        }
    };

    // flow-control hand-off: a buffered body releases its window now, a
    // promoted one releases as the consumer drains the streamer
    if let Some(feeder) = asm.feeder() {
        let flow = flow.clone();
        feeder.set_on_consume(move |n| {
            let mut flow = flow.clone();
            let _ = flow.release_capacity(n);
        });
    } else {
        let _ = flow.release_capacity(pending_release);
    }

    let mut request = request;
    for mw in middleware.borrow_mut().iter_mut() {
        mw.on_request(&mut request);
    }

    // run the responder, pumping remaining data frames into the streamer
    let result = {
        let respond_fut = responder.respond(request, &rcx);
        tokio::pin!(respond_fut);
        loop {
            let pumping = !pump_done && !pump_failed && asm.is_streaming();
            tokio::select! {
                biased;
                result = &mut respond_fut => break result,
                data = recv.data(), if pumping => match data {
                    Some(Ok(data)) => {
                        last_read.set(Instant::now());
                        asm.on_event(CodecEvent::Body(data));
                    }
                    Some(Err(e)) => {
                        asm.on_error(StreamError::Transport(std::io::Error::other(e)));
                        pump_failed = true;
                    }
                    None => {
                        asm.on_event(CodecEvent::End);
                        pump_done = true;
                    }
                },
            }
        }
    };

    let mut response = match result {
        Ok(response) => response,
        Err(e) => crate::error::error_to_response(&e),
    };
    for mw in middleware.borrow_mut().iter_mut().rev() {
        mw.on_response(&mut response);
    }

    let Response {
        status,
        headers,
        body,
    } = response;

    let mut head = http::Response::new(());
    *head.status_mut() = status;
    *head.headers_mut() = headers;
    if let ResponseBody::Buffered(buf) = &body {
        let value = HeaderValue::from_str(&buf.len().to_string()).unwrap();
        head.headers_mut()
            .entry(header::CONTENT_LENGTH)
            .or_insert(value);
    }
    if let Some(name) = &conf.server_name {
        if let Ok(value) = HeaderValue::from_str(name) {
            head.headers_mut().entry(header::SERVER).or_insert(value);
        }
    }

    let write_result = match body {
        ResponseBody::Empty => respond.send_response(head, true).map(|_| ()),
        ResponseBody::Buffered(buf) => {
            if buf.is_empty() {
                respond.send_response(head, true).map(|_| ())
            } else {
                match respond.send_response(head, false) {
                    Ok(mut stream) => {
                        send_streamed_body(
                            &mut stream,
                            BodySource::Fixed(Some(buf)),
                            &mut recv,
                            &mut asm,
                            &mut pump_done,
                            &mut pump_failed,
                            &last_read,
                        )
                        .await
                    }
                    Err(e) => Err(e),
                }
            }
        }
        ResponseBody::Streamed(rx) => match respond.send_response(head, false) {
            Ok(mut stream) => {
                send_streamed_body(
                    &mut stream,
                    BodySource::Channel(rx),
                    &mut recv,
                    &mut asm,
                    &mut pump_done,
                    &mut pump_failed,
                    &last_read,
                )
                .await
            }
            Err(e) => Err(e),
        },
    };

    match write_result {
        Ok(()) => last_write.set(Instant::now()),
        Err(e) => {
            debug!(error = %e, "error writing HTTP/2 response, resetting stream");
            respond.send_reset(h2::Reason::INTERNAL_ERROR);
        }
    }

    finish_stream(&tracker, &stream_events);
}

fn finish_stream(tracker: &Rc<RefCell<StreamTracker>>, stream_events: &Rc<Notify>) {
    let verdict = tracker.borrow_mut().on_event(TrackerEvent::StreamClosed);
    trace!(?verdict, open = tracker.borrow().open_streams(), "stream closed");
    stream_events.notify_one();
}

enum BodySource {
    Fixed(Option<Bytes>),
    Channel(crate::types::BodyReceiver),
}

/// Write a response body chunk by chunk, respecting the stream's send
/// window, while still pumping the request body (an echoing responder
/// feeds one from the other).
async fn send_streamed_body(
    stream: &mut h2::SendStream<Bytes>,
    mut source: BodySource,
    recv: &mut h2::RecvStream,
    asm: &mut Assembler,
    pump_done: &mut bool,
    pump_failed: &mut bool,
    last_read: &Rc<Cell<Instant>>,
) -> Result<(), h2::Error> {
    'body: loop {
        // next chunk from the producer
        let mut data = loop {
            let pumping = !*pump_done && !*pump_failed && asm.is_streaming();
            match &mut source {
                BodySource::Fixed(slot) => match slot.take() {
                    Some(data) => break data,
                    None => break 'body,
                },
                BodySource::Channel(rx) => {
                    tokio::select! {
                        biased;
                        chunk = rx.recv() => match chunk {
                            Some(Ok(data)) => {
                                if data.is_empty() {
                                    continue;
                                }
                                break data;
                            }
                            Some(Err(_)) => {
                                debug!("response body producer aborted, resetting stream");
                                stream.send_reset(h2::Reason::INTERNAL_ERROR);
                                return Ok(());
                            }
                            None => break 'body,
                        },
                        pulled = recv.data(), if pumping => {
                            pump_request_body(pulled, asm, pump_done, pump_failed, last_read);
                        }
                    }
                }
            }
        };

        // push it through the send window
        while !data.is_empty() {
            stream.reserve_capacity(data.len());
            let pumping = !*pump_done && !*pump_failed && asm.is_streaming();
            tokio::select! {
                biased;
                capacity = poll_fn(|pcx| stream.poll_capacity(pcx)) => {
                    let available = match capacity {
                        Some(Ok(n)) => n,
                        Some(Err(e)) => return Err(e),
                        None => return Err(h2::Reason::CANCEL.into()),
                    };
                    if available > 0 {
                        let chunk = data.split_to(available.min(data.len()));
                        stream.send_data(chunk, false)?;
                    }
                }
                pulled = recv.data(), if pumping => {
                    pump_request_body(pulled, asm, pump_done, pump_failed, last_read);
                }
            }
        }
    }

    stream.send_data(Bytes::new(), true)?;
    Ok(())
}

fn pump_request_body(
    pulled: Option<Result<Bytes, h2::Error>>,
    asm: &mut Assembler,
    pump_done: &mut bool,
    pump_failed: &mut bool,
    last_read: &Rc<Cell<Instant>>,
) {
    match pulled {
        Some(Ok(data)) => {
            last_read.set(Instant::now());
            asm.on_event(CodecEvent::Body(data));
        }
        Some(Err(e)) => {
            asm.on_error(StreamError::Transport(std::io::Error::other(e)));
            *pump_failed = true;
        }
        None => {
            asm.on_event(CodecEvent::End);
            *pump_done = true;
        }
    }
}
