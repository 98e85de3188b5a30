//! Decoding of the upstream `text/event-stream` body into event records.
//!
//! Bytes are handed over as the transport delivers them. Partial lines,
//! partial fields and UTF-8 sequences split across chunks stay buffered
//! until a blank line completes the frame; only then is a record emitted.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::task::Context;
use std::task::Poll;

use bytes::Bytes;
use bytes::BytesMut;
use eventsource_stream::Event;
use eventsource_stream::EventStreamError;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::error::RelayErr;
use crate::error::Result;

const BOM: &[u8] = b"\xEF\xBB\xBF";

/// One decoded frame of the upstream stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRecord {
    /// A frame with a `data` payload. Multi-line data is joined with `\n`.
    Event { data: String },
    /// The server asked clients to wait `value` milliseconds before
    /// reconnecting.
    ReconnectInterval { value: u64 },
}

/// Turns a chunked byte stream into a stream of [`EventRecord`]s.
///
/// A frame that carries both `retry:` and `data:` yields the reconnect
/// interval first. A frame with only `retry:` yields just the interval.
/// Transport errors and undecodable bytes are surfaced as
/// [`RelayErr::Stream`] items.
pub fn decode_events<S>(stream: S) -> BoxStream<'static, Result<EventRecord>>
where
    S: Stream<Item = Result<Bytes>> + Send + Unpin + 'static,
{
    let scanner = Arc::new(Mutex::new(RetryScanner::default()));
    let tap = Arc::clone(&scanner);
    let events = stream
        .inspect(move |item| {
            if let Ok(chunk) = item {
                tap.lock().unwrap_or_else(PoisonError::into_inner).feed(chunk);
            }
        })
        .eventsource()
        .boxed();

    EventRecords {
        events,
        scanner,
        ready: VecDeque::new(),
        dispatched: 0,
        finished: false,
    }
    .boxed()
}

/// Merges the events framed by `eventsource-stream` with the reconnect
/// intervals of frames it does not dispatch (frames without data).
struct EventRecords {
    events: BoxStream<'static, std::result::Result<Event, EventStreamError<RelayErr>>>,
    scanner: Arc<Mutex<RetryScanner>>,
    ready: VecDeque<Result<EventRecord>>,
    /// Events yielded so far.
    dispatched: u64,
    finished: bool,
}

impl EventRecords {
    /// Queues the intervals of retry-only frames that precede the
    /// `limit`-th dispatched event.
    fn release_intervals(&mut self, limit: u64) {
        let mut scanner = self.scanner.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(&(before, value)) = scanner.intervals.front() {
            if before > limit {
                break;
            }
            scanner.intervals.pop_front();
            self.ready
                .push_back(Ok(EventRecord::ReconnectInterval { value }));
        }
    }
}

impl Stream for EventRecords {
    type Item = Result<EventRecord>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if let Some(record) = this.ready.pop_front() {
                return Poll::Ready(Some(record));
            }
            if this.finished {
                return Poll::Ready(None);
            }

            match this.events.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    this.release_intervals(this.dispatched);
                    this.dispatched += 1;
                    this.ready
                        .extend(records_from_event(event).into_iter().map(Ok));
                }
                Poll::Ready(Some(Err(err))) => this.ready.push_back(Err(stream_error(err))),
                Poll::Ready(None) => {
                    this.release_intervals(u64::MAX);
                    this.finished = true;
                }
                Poll::Pending => {
                    this.release_intervals(this.dispatched);
                    if this.ready.is_empty() {
                        return Poll::Pending;
                    }
                }
            }
        }
    }
}

fn records_from_event(event: Event) -> Vec<EventRecord> {
    let mut records = Vec::with_capacity(2);
    if let Some(retry) = event.retry {
        records.push(EventRecord::ReconnectInterval {
            value: u64::try_from(retry.as_millis()).unwrap_or(u64::MAX),
        });
    }
    records.push(EventRecord::Event { data: event.data });
    records
}

fn stream_error(err: EventStreamError<RelayErr>) -> RelayErr {
    match err {
        EventStreamError::Transport(err) => err,
        EventStreamError::Utf8(err) => RelayErr::Stream(format!("invalid UTF-8 in event stream: {err}")),
        EventStreamError::Parser(err) => RelayErr::Stream(format!("malformed event stream: {err}")),
    }
}

/// Follows the line framing of the event stream to find frames that carry
/// `retry:` but no `data:`. Each is recorded with the number of data frames
/// completed before it, which places it among the dispatched events.
#[derive(Debug, Default)]
struct RetryScanner {
    line: BytesMut,
    started: bool,
    after_cr: bool,
    frame_has_data: bool,
    frame_retry: Option<u64>,
    data_frames: u64,
    intervals: VecDeque<(u64, u64)>,
}

impl RetryScanner {
    fn feed(&mut self, chunk: &[u8]) {
        let mut chunk = chunk;
        if !self.started && !chunk.is_empty() {
            self.started = true;
            chunk = chunk.strip_prefix(BOM).unwrap_or(chunk);
        }

        for &byte in chunk {
            match byte {
                b'\n' if self.after_cr => self.after_cr = false,
                b'\n' | b'\r' => {
                    self.after_cr = byte == b'\r';
                    self.end_line();
                }
                _ => {
                    self.after_cr = false;
                    self.line.extend_from_slice(&[byte]);
                }
            }
        }
    }

    fn end_line(&mut self) {
        let line = self.line.split();
        if line.is_empty() {
            self.end_frame();
            return;
        }
        if line.starts_with(b":") {
            return;
        }

        let (name, value) = match line.iter().position(|&b| b == b':') {
            Some(idx) => (&line[..idx], &line[idx + 1..]),
            None => (&line[..], &[][..]),
        };
        let value = value.strip_prefix(b" ").unwrap_or(value);
        match name {
            b"data" => self.frame_has_data = true,
            b"retry" => {
                if let Some(ms) = std::str::from_utf8(value).ok().and_then(|v| v.parse().ok()) {
                    self.frame_retry = Some(ms);
                }
            }
            _ => {}
        }
    }

    fn end_frame(&mut self) {
        if self.frame_has_data {
            self.data_frames += 1;
        } else if let Some(value) = self.frame_retry {
            self.intervals.push_back((self.data_frames, value));
        }
        self.frame_has_data = false;
        self.frame_retry = None;
    }
}
