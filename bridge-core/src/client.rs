//! Client façade and the engine-context side that owns the stream table.
//!
//! [`Client`] is what foreign threads hold. Every call becomes a [`Command`] on the engine queue;
//! nothing is mutated on the calling thread and nothing blocks. [`BridgeEngine`] drains the queue
//! on the engine thread, owns the stream table, and records one outcome per stream.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::buffer::Watermark;
use crate::codec::{ApiListener, NewStream, ResponseEncoder, ResponseEvent, SyntheticAddress};
use crate::config::{BridgeConfig, StreamOptions};
use crate::dispatcher::{self, DeferredDeleter, Dispatcher, Poster};
use crate::inbound::{HttpCallbacks, InboundAdapter, InboundEvent, Progress, Terminal};
use crate::outbound::{OutboundError, OutboundStream};
use crate::routing::{self, Network, PreferredNetwork, Random, ThreadRandom};
use crate::stats::{ClientStats, StatsSnapshot};
use crate::stream::{DirectStream, DirectStreamRef, DirectStreamWrapper};
use crate::table::{StreamKey, StreamTable};
use crate::types::{HeaderList, StreamError, StreamId, StreamResetReason, CANCEL_DETAILS};

/// Work for the engine context.
pub(crate) enum Command {
    Start {
        id: StreamId,
        callbacks: Box<dyn HttpCallbacks>,
        options: StreamOptions,
    },
    SendHeaders {
        id: StreamId,
        headers: HeaderList,
        end_stream: bool,
    },
    SendData {
        id: StreamId,
        data: Bytes,
        end_stream: bool,
    },
    SendMetadata {
        id: StreamId,
        metadata: HeaderList,
    },
    SendTrailers {
        id: StreamId,
        trailers: HeaderList,
    },
    Cancel {
        id: StreamId,
    },
    Resume {
        id: StreamId,
        bytes: u64,
    },
    Response {
        id: StreamId,
        key: StreamKey,
        event: ResponseEvent,
    },
    Shutdown,
}

/// Foreign-facing handle. Clone freely and call from any thread.
#[derive(Clone)]
pub struct Client {
    poster: Poster<Command>,
    stats: Arc<ClientStats>,
    network: Arc<PreferredNetwork>,
}

impl Client {
    /// Create a client and the engine half that will serve it. Calls made before
    /// [`ProvisionalEngine::start`] wait in the queue and replay in order.
    pub fn new(config: BridgeConfig) -> (Client, ProvisionalEngine) {
        let (poster, rx) = dispatcher::channel();
        let stats = Arc::new(ClientStats::new());
        let network = Arc::new(PreferredNetwork::default());
        let client = Client {
            poster: poster.clone(),
            stats: stats.clone(),
            network: network.clone(),
        };
        let provisional = ProvisionalEngine {
            poster,
            rx,
            stats,
            network,
            config,
        };
        (client, provisional)
    }

    /// Open a stream. Returns immediately; creation may still fail later, which is reported
    /// through `on_error`.
    pub fn start_stream<C: HttpCallbacks + 'static>(&self, id: StreamId, callbacks: C) {
        self.start_stream_with_options(id, callbacks, StreamOptions::default());
    }

    pub fn start_stream_with_options<C: HttpCallbacks + 'static>(
        &self,
        id: StreamId,
        callbacks: C,
        options: StreamOptions,
    ) {
        self.start_boxed(id, Box::new(callbacks), options);
    }

    pub(crate) fn start_boxed(
        &self,
        id: StreamId,
        callbacks: Box<dyn HttpCallbacks>,
        options: StreamOptions,
    ) {
        self.post(Command::Start {
            id,
            callbacks,
            options,
        });
    }

    /// Must be the first frame. Dropped if the stream is gone.
    pub fn send_headers(&self, id: StreamId, headers: HeaderList, end_stream: bool) {
        self.post(Command::SendHeaders {
            id,
            headers,
            end_stream,
        });
    }

    pub fn send_data(&self, id: StreamId, data: Bytes, end_stream: bool) {
        self.post(Command::SendData {
            id,
            data,
            end_stream,
        });
    }

    pub fn send_metadata(&self, id: StreamId, metadata: HeaderList) {
        self.post(Command::SendMetadata { id, metadata });
    }

    /// Closes the local side.
    pub fn send_trailers(&self, id: StreamId, trailers: HeaderList) {
        self.post(Command::SendTrailers { id, trailers });
    }

    /// Close both sides. Reported as `on_cancel` unless the stream already finished.
    pub fn cancel_stream(&self, id: StreamId) {
        self.post(Command::Cancel { id });
    }

    /// Ask for up to `bytes` more response body bytes. Async-mode streams only.
    pub fn resume_data(&self, id: StreamId, bytes: u64) {
        self.post(Command::Resume { id, bytes });
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn set_preferred_network(&self, network: Network) {
        self.network.set(network);
    }

    /// Cancel every live stream, then stop the engine loop.
    pub fn shutdown(&self) {
        self.post(Command::Shutdown);
    }

    fn post(&self, cmd: Command) {
        if let Err(cmd) = self.poster.try_post(cmd) {
            refuse(cmd, &self.stats);
        }
    }
}

/// Answer a command the engine will never run. A refused start is cancelled on the calling
/// thread so the caller still gets its one terminal callback.
fn refuse(cmd: Command, stats: &ClientStats) {
    match cmd {
        Command::Start { id, mut callbacks, .. } => {
            tracing::debug!(stream = id, "engine stopped, stream cancelled");
            callbacks.on_cancel();
            stats.record_cancel();
        }
        _ => tracing::debug!("engine stopped, call dropped"),
    }
}

/// Engine half before the engine thread is ready. Send it to the engine thread and start it there.
pub struct ProvisionalEngine {
    poster: Poster<Command>,
    rx: mpsc::UnboundedReceiver<Command>,
    stats: Arc<ClientStats>,
    network: Arc<PreferredNetwork>,
    config: BridgeConfig,
}

impl ProvisionalEngine {
    pub fn start(self, listener: Box<dyn ApiListener>) -> BridgeEngine {
        self.start_with_random(listener, Box::new(ThreadRandom))
    }

    pub fn start_with_random(
        mut self,
        listener: Box<dyn ApiListener>,
        random: Box<dyn Random>,
    ) -> BridgeEngine {
        // Leave a closed, empty queue behind for our own drop.
        let (_, spent) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(std::mem::replace(&mut self.rx, spent));
        let deleter = dispatcher.deleter().clone();
        BridgeEngine {
            dispatcher,
            http: HttpClient {
                streams: StreamTable::new(),
                listener,
                poster: self.poster.clone(),
                deleter,
                stats: self.stats.clone(),
                network: self.network.clone(),
                random,
                address: Arc::new(SyntheticAddress),
                config: self.config.clone(),
            },
            stopped: false,
        }
    }
}

impl Drop for ProvisionalEngine {
    /// Never started: answer what callers already queued.
    fn drop(&mut self) {
        self.rx.close();
        while let Ok(cmd) = self.rx.try_recv() {
            refuse(cmd, &self.stats);
        }
    }
}

/// Engine context. Lives on one thread.
pub struct BridgeEngine {
    dispatcher: Dispatcher<Command>,
    http: HttpClient,
    stopped: bool,
}

impl BridgeEngine {
    /// Process everything queued, one dispatch turn per command. Returns commands processed.
    pub fn run_pending(&mut self) -> usize {
        let mut n = 0;
        while !self.stopped {
            let Some(cmd) = self.dispatcher.try_next() else {
                break;
            };
            self.turn(cmd);
            n += 1;
        }
        n
    }

    /// Serve commands until `Client::shutdown` is processed. Dropping the engine without a
    /// shutdown cancels whatever is still live or queued.
    pub async fn run(mut self) {
        while !self.stopped {
            match self.dispatcher.next().await {
                Some(cmd) => self.turn(cmd),
                None => break,
            }
        }
        tracing::info!("engine loop stopped");
    }

    pub fn active_streams(&self) -> usize {
        self.http.streams.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn deleter(&self) -> &DeferredDeleter {
        self.dispatcher.deleter()
    }

    fn turn(&mut self, cmd: Command) {
        if !self.http.dispatch(cmd) {
            self.stop();
        }
        self.dispatcher.end_turn();
    }

    /// Close the queue, then refuse whatever was posted before it closed.
    fn stop(&mut self) {
        self.stopped = true;
        self.dispatcher.close();
        while let Some(cmd) = self.dispatcher.try_next() {
            refuse(cmd, &self.http.stats);
        }
    }
}

impl Drop for BridgeEngine {
    fn drop(&mut self) {
        if !self.stopped {
            self.turn(Command::Shutdown);
        }
    }
}

/// Engine-side owner of the stream table.
struct HttpClient {
    streams: StreamTable<DirectStreamRef>,
    listener: Box<dyn ApiListener>,
    poster: Poster<Command>,
    deleter: DeferredDeleter,
    stats: Arc<ClientStats>,
    network: Arc<PreferredNetwork>,
    random: Box<dyn Random>,
    address: Arc<SyntheticAddress>,
    config: BridgeConfig,
}

impl HttpClient {
    /// Returns false when the loop should stop.
    fn dispatch(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Start {
                id,
                callbacks,
                options,
            } => self.start_stream(id, callbacks, options),
            Command::SendHeaders {
                id,
                mut headers,
                end_stream,
            } => {
                let alternate = self.random.random() % 2 == 0;
                routing::set_destination_cluster(&mut headers, self.network.get(), alternate);
                self.with_outbound(id, "send_headers", |s| s.send_headers(headers, end_stream));
            }
            Command::SendData {
                id,
                data,
                end_stream,
            } => self.with_outbound(id, "send_data", |s| s.send_data(data, end_stream)),
            Command::SendMetadata { id, metadata } => {
                self.with_outbound(id, "send_metadata", |s| s.send_metadata(metadata))
            }
            Command::SendTrailers { id, trailers } => {
                self.with_outbound(id, "send_trailers", |s| s.send_trailers(trailers))
            }
            Command::Cancel { id } => self.cancel_stream(id),
            Command::Resume { id, bytes } => {
                if let Some(stream) = self.lookup(id, "resume_data") {
                    let progress = stream.borrow_mut().inbound.handle(InboundEvent::Resume(bytes));
                    self.apply(id, &stream, progress);
                }
            }
            Command::Response { id, key, event } => self.on_response(id, key, event),
            Command::Shutdown => {
                if !self.streams.is_empty() {
                    tracing::debug!(live = self.streams.len(), "cancelling live streams");
                    for id in self.streams.ids() {
                        self.cancel_stream(id);
                    }
                }
                return false;
            }
        }
        true
    }

    fn start_stream(
        &mut self,
        id: StreamId,
        callbacks: Box<dyn HttpCallbacks>,
        options: StreamOptions,
    ) {
        if self.streams.contains(id) {
            tracing::warn!(stream = id, "stream id still live, start ignored");
            return;
        }
        let async_mode = options.async_mode.unwrap_or(self.config.async_mode);
        let stream = DirectStream::new(
            id,
            OutboundStream::new(id, self.address.clone(), self.config.buffer_limit),
            InboundAdapter::new(id, callbacks, async_mode, self.config.high_watermark),
        );
        let key = match self.streams.insert(id, stream.clone()) {
            Ok(key) => key,
            Err(_) => return,
        };
        let encoder = ResponseEncoder::new(id, key, self.poster.clone());
        let decoder = {
            let mut s = stream.borrow_mut();
            self.listener.new_stream(NewStream {
                encoder,
                stream: &mut s.outbound,
                deleter: &self.deleter,
            })
        };
        match decoder {
            Some(decoder) => {
                tracing::debug!(stream = id, async_mode, "stream started");
                stream.borrow_mut().outbound.bind_decoder(&decoder);
            }
            None => {
                tracing::warn!(stream = id, "engine declined stream");
                self.poster.post(Command::Response {
                    id,
                    key,
                    event: ResponseEvent::Reset(StreamResetReason::ConnectionFailure),
                });
            }
        }
    }

    fn cancel_stream(&mut self, id: StreamId) {
        if let Some(stream) = self.lookup(id, "cancel_stream") {
            let progress = stream.borrow_mut().inbound.handle(InboundEvent::Cancel);
            self.apply(id, &stream, progress);
        }
    }

    fn on_response(&mut self, id: StreamId, key: StreamKey, event: ResponseEvent) {
        let Some(stream) = self.streams.get_by_key(key).cloned() else {
            tracing::debug!(stream = id, "response for finished stream dropped");
            return;
        };
        let event = match event {
            ResponseEvent::Headers {
                headers,
                end_stream,
            } => InboundEvent::Headers {
                headers,
                end_stream,
            },
            ResponseEvent::Data { data, end_stream } => InboundEvent::Data { data, end_stream },
            ResponseEvent::Trailers(trailers) => InboundEvent::Trailers(trailers),
            ResponseEvent::Reset(reason) => {
                stream.borrow_mut().outbound.reset_stream(reason);
                InboundEvent::Error(StreamError::from_reset(reason))
            }
        };
        let progress = stream.borrow_mut().inbound.handle(event);
        self.apply(id, &stream, progress);
    }

    fn with_outbound<F>(&mut self, id: StreamId, op: &'static str, f: F)
    where
        F: FnOnce(&mut OutboundStream) -> Result<(), OutboundError>,
    {
        let Some(stream) = self.lookup(id, op) else {
            return;
        };
        let result = f(&mut stream.borrow_mut().outbound);
        if let Err(e) = result {
            tracing::debug!(stream = id, op, error = %e, "outbound frame dropped");
        }
    }

    fn lookup(&self, id: StreamId, op: &'static str) -> Option<DirectStreamRef> {
        let stream = self.streams.get(id).cloned();
        if stream.is_none() {
            tracing::debug!(stream = id, op, "unknown stream, call dropped");
        }
        stream
    }

    /// Act on watermark crossings and on the terminal outcome, if any.
    fn apply(&mut self, id: StreamId, stream: &DirectStreamRef, progress: Progress) {
        for w in progress.watermarks {
            let mut s = stream.borrow_mut();
            match w {
                Watermark::High => s.outbound.run_high_watermark_callbacks(),
                Watermark::Low => s.outbound.run_low_watermark_callbacks(),
            }
        }
        let Some(terminal) = progress.terminal else {
            return;
        };
        match terminal {
            Terminal::Complete { success: true } => self.stats.record_success(),
            Terminal::Complete { success: false } | Terminal::Error => self.stats.record_failure(),
            Terminal::Cancel => {
                self.stats.record_cancel();
                let mut s = stream.borrow_mut();
                s.outbound.set_response_details(CANCEL_DETAILS);
                s.outbound.reset_stream(StreamResetReason::LocalReset);
            }
        }
        tracing::debug!(stream = id, ?terminal, "stream finished");
        self.remove_stream(id);
    }

    fn remove_stream(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.remove(id) {
            self.deleter
                .deferred_delete(Box::new(DirectStreamWrapper::new(stream)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        drop_log, Delivered, DropTracker, Frame, TrackedCallbacks, RecordingCallbacks, TestEngine,
    };
    use crate::types::{names, ErrorCode};

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn handles_cross_threads() {
        assert_send::<Client>();
        assert_sync::<Client>();
        assert_send::<ProvisionalEngine>();
    }

    fn request_headers() -> HeaderList {
        [(":method", "POST"), (":path", "/echo")].into_iter().collect()
    }

    fn status(code: &str) -> HeaderList {
        [(":status", code)].into_iter().collect()
    }

    fn setup(config: BridgeConfig) -> (Client, BridgeEngine, TestEngine) {
        let (client, provisional) = Client::new(config);
        let test_engine = TestEngine::default();
        let engine = provisional.start(Box::new(test_engine.clone()));
        (client, engine, test_engine)
    }

    #[test]
    fn request_response_exchange_completes() {
        let (client, mut engine, te) = setup(BridgeConfig::default());
        let rec = RecordingCallbacks::default();
        client.start_stream(1, rec.clone());
        client.send_headers(1, request_headers(), false);
        client.send_data(1, Bytes::from_static(b"abc"), true);
        engine.run_pending();

        let frames = te.frames(1);
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            Frame::Headers(h, false) => assert_eq!(h.get(names::CLUSTER), Some("base")),
            other => panic!("expected headers, got {other:?}"),
        }
        assert_eq!(frames[1], Frame::Data(Bytes::from_static(b"abc"), true));

        let enc = te.encoder(1);
        enc.encode_headers(status("200"), false);
        enc.encode_data(Bytes::from_static(b"xyz"), true);
        engine.run_pending();

        assert_eq!(
            rec.events(),
            vec![
                Delivered::Headers(status("200"), false),
                Delivered::Data(b"xyz".to_vec(), true),
                Delivered::Complete,
            ]
        );
        assert_eq!(client.stats().stream_success, 1);
        assert_eq!(client.stats().total(), 1);
        assert_eq!(engine.active_streams(), 0);
    }

    #[test]
    fn async_stream_releases_body_on_request() {
        let (client, mut engine, te) = setup(BridgeConfig::default());
        let rec = RecordingCallbacks::default();
        client.start_stream_with_options(
            2,
            rec.clone(),
            StreamOptions {
                async_mode: Some(true),
            },
        );
        client.send_headers(2, request_headers(), true);
        engine.run_pending();

        let enc = te.encoder(2);
        enc.encode_headers(status("200"), false);
        enc.encode_data(Bytes::from(vec![1u8; 100]), true);
        engine.run_pending();
        assert_eq!(rec.events(), vec![Delivered::Headers(status("200"), false)]);

        client.resume_data(2, 50);
        engine.run_pending();
        assert_eq!(rec.events()[1], Delivered::Data(vec![1u8; 50], false));
        assert_eq!(rec.terminal_count(), 0);

        client.resume_data(2, 50);
        engine.run_pending();
        let ev = rec.events();
        assert_eq!(ev[2], Delivered::Data(vec![1u8; 50], true));
        assert_eq!(ev[3], Delivered::Complete);
        assert_eq!(client.stats().stream_success, 1);
    }

    #[test]
    fn cancel_before_response() {
        let (client, mut engine, te) = setup(BridgeConfig::default());
        let rec = RecordingCallbacks::default();
        client.start_stream(3, rec.clone());
        client.send_headers(3, request_headers(), false);
        client.cancel_stream(3);
        engine.run_pending();

        assert_eq!(rec.events(), vec![Delivered::Cancel]);
        assert_eq!(client.stats().stream_cancel, 1);
        assert_eq!(client.stats().total(), 1);
        assert_eq!(
            te.resets(),
            vec![(3, StreamResetReason::LocalReset, CANCEL_DETAILS.to_string())]
        );
    }

    #[test]
    fn calls_before_start_are_replayed() {
        let (client, provisional) = Client::new(BridgeConfig::default());
        let rec = RecordingCallbacks::default();
        client.start_stream(4, rec.clone());
        client.send_headers(4, request_headers(), true);

        let te = TestEngine::default();
        let mut engine = provisional.start(Box::new(te.clone()));
        assert_eq!(engine.run_pending(), 2);
        assert_eq!(te.frames(4).len(), 1);
    }

    #[test]
    fn sends_after_terminal_are_noops() {
        let (client, mut engine, te) = setup(BridgeConfig::default());
        let rec = RecordingCallbacks::default();
        client.start_stream(5, rec.clone());
        client.send_headers(5, request_headers(), false);
        engine.run_pending();
        te.encoder(5).encode_headers(status("200"), true);
        engine.run_pending();
        let before = client.stats();

        client.send_data(5, Bytes::from_static(b"late"), false);
        client.send_metadata(5, request_headers());
        client.send_trailers(5, request_headers());
        client.resume_data(5, 10);
        client.cancel_stream(5);
        engine.run_pending();

        assert_eq!(te.frames(5).len(), 1);
        assert_eq!(client.stats(), before);
        assert_eq!(rec.terminal_count(), 1);
    }

    #[test]
    fn unknown_ids_are_dropped() {
        let (client, mut engine, _te) = setup(BridgeConfig::default());
        client.send_headers(99, request_headers(), false);
        client.send_data(99, Bytes::new(), true);
        client.cancel_stream(99);
        client.resume_data(99, 1);
        assert_eq!(engine.run_pending(), 4);
        assert_eq!(client.stats().total(), 0);
    }

    #[test]
    fn completion_then_cancel_counts_once() {
        let (client, mut engine, te) = setup(BridgeConfig::default());
        let rec = RecordingCallbacks::default();
        client.start_stream(6, rec.clone());
        client.send_headers(6, request_headers(), true);
        engine.run_pending();
        te.encoder(6).encode_headers(status("204"), true);
        client.cancel_stream(6);
        engine.run_pending();
        let s = client.stats();
        assert_eq!((s.stream_success, s.stream_cancel), (1, 0));
        assert_eq!(rec.terminal_count(), 1);
    }

    #[test]
    fn cancel_then_late_response_counts_once() {
        let (client, mut engine, te) = setup(BridgeConfig::default());
        let rec = RecordingCallbacks::default();
        client.start_stream(7, rec.clone());
        client.send_headers(7, request_headers(), true);
        engine.run_pending();
        let enc = te.encoder(7);
        client.cancel_stream(7);
        engine.run_pending();
        enc.encode_headers(status("200"), true);
        engine.run_pending();
        let s = client.stats();
        assert_eq!((s.stream_success, s.stream_cancel), (0, 1));
        assert_eq!(rec.events(), vec![Delivered::Cancel]);
    }

    #[test]
    fn declined_stream_fails_later() {
        let (client, mut engine, te) = setup(BridgeConfig::default());
        te.set_decline(true);
        let rec = RecordingCallbacks::default();
        client.start_stream(8, rec.clone());
        client.send_headers(8, request_headers(), true);
        engine.run_pending();
        match rec.events().as_slice() {
            [Delivered::Error(e)] => assert_eq!(e.code, ErrorCode::ConnectionFailure),
            other => panic!("expected one error, got {other:?}"),
        }
        assert_eq!(client.stats().stream_failure, 1);
    }

    #[test]
    fn remote_reset_reports_error_and_runs_reset_callbacks() {
        let (client, mut engine, te) = setup(BridgeConfig::default());
        let rec = RecordingCallbacks::default();
        client.start_stream(9, rec.clone());
        client.send_headers(9, request_headers(), false);
        engine.run_pending();
        te.encoder(9).reset_stream(StreamResetReason::RemoteReset);
        engine.run_pending();
        assert!(matches!(
            rec.events().as_slice(),
            [Delivered::Error(StreamError {
                code: ErrorCode::StreamReset,
                ..
            })]
        ));
        assert_eq!(te.resets()[0].1, StreamResetReason::RemoteReset);
        assert_eq!(client.stats().stream_failure, 1);
    }

    #[test]
    fn non_2xx_completion_counts_as_failure() {
        let (client, mut engine, te) = setup(BridgeConfig::default());
        client.start_stream(10, RecordingCallbacks::default());
        client.send_headers(10, request_headers(), true);
        engine.run_pending();
        te.encoder(10).encode_headers(status("500"), true);
        engine.run_pending();
        assert_eq!(client.stats().stream_failure, 1);
        assert_eq!(client.stats().stream_success, 0);
    }

    #[test]
    fn engine_exchange_released_before_stream() {
        let (client, mut engine, te) = setup(BridgeConfig::default());
        let log = drop_log();
        te.set_drop_log(log.clone());
        client.start_stream(
            11,
            TrackedCallbacks::new(RecordingCallbacks::default(), DropTracker::new("stream", log.clone())),
        );
        client.send_headers(11, request_headers(), false);
        engine.run_pending();
        client.cancel_stream(11);
        engine.run_pending();
        assert_eq!(*log.lock(), vec!["exchange", "stream"]);
    }

    #[test]
    fn duplicate_live_id_is_ignored() {
        let (client, mut engine, te) = setup(BridgeConfig::default());
        let first = RecordingCallbacks::default();
        let second = RecordingCallbacks::default();
        client.start_stream(12, first.clone());
        client.start_stream(12, second.clone());
        client.send_headers(12, request_headers(), true);
        engine.run_pending();
        te.encoder(12).encode_headers(status("200"), true);
        engine.run_pending();
        assert_eq!(first.terminal_count(), 1);
        assert!(second.events().is_empty());
    }

    #[test]
    fn id_can_be_reused_after_terminal() {
        let (client, mut engine, te) = setup(BridgeConfig::default());
        let first = RecordingCallbacks::default();
        client.start_stream(13, first.clone());
        client.send_headers(13, request_headers(), true);
        engine.run_pending();
        let stale = te.encoder(13);
        client.cancel_stream(13);
        engine.run_pending();

        let second = RecordingCallbacks::default();
        client.start_stream(13, second.clone());
        engine.run_pending();
        stale.encode_headers(status("200"), true);
        engine.run_pending();
        assert!(second.events().is_empty());
        assert_eq!(engine.active_streams(), 1);
    }

    #[test]
    fn watermarks_reach_engine() {
        let config = BridgeConfig {
            async_mode: true,
            high_watermark: 16,
            ..BridgeConfig::default()
        };
        let (client, mut engine, te) = setup(config);
        client.start_stream(14, RecordingCallbacks::default());
        client.send_headers(14, request_headers(), true);
        engine.run_pending();
        let enc = te.encoder(14);
        enc.encode_headers(status("200"), false);
        enc.encode_data(Bytes::from(vec![0u8; 20]), false);
        engine.run_pending();
        assert_eq!(te.watermarks(), vec![(14, Watermark::High)]);
        client.resume_data(14, 20);
        engine.run_pending();
        assert_eq!(
            te.watermarks(),
            vec![(14, Watermark::High), (14, Watermark::Low)]
        );
    }

    #[test]
    fn shutdown_cancels_live_streams_and_stops() {
        let (client, mut engine, te) = setup(BridgeConfig::default());
        let a = RecordingCallbacks::default();
        let b = RecordingCallbacks::default();
        let late = RecordingCallbacks::default();
        client.start_stream(15, a.clone());
        client.start_stream(16, b.clone());
        client.shutdown();
        client.start_stream(17, late.clone());
        client.send_headers(17, request_headers(), true);
        engine.run_pending();
        assert!(engine.is_stopped());
        assert_eq!(a.events(), vec![Delivered::Cancel]);
        assert_eq!(b.events(), vec![Delivered::Cancel]);
        assert_eq!(late.events(), vec![Delivered::Cancel]);
        assert_eq!(client.stats().stream_cancel, 3);
        assert_eq!(engine.active_streams(), 0);
        assert!(te.stream_ids().is_empty());
    }

    #[test]
    fn start_after_stop_is_cancelled_on_caller() {
        let (client, mut engine, _te) = setup(BridgeConfig::default());
        client.shutdown();
        engine.run_pending();
        let rec = RecordingCallbacks::default();
        client.start_stream(30, rec.clone());
        client.send_data(30, Bytes::from_static(b"x"), true);
        assert_eq!(rec.terminal_count(), 1);
        assert_eq!(rec.events(), vec![Delivered::Cancel]);
        assert_eq!(client.stats().stream_cancel, 1);
    }

    #[test]
    fn unstarted_engine_cancels_queued_starts_on_drop() {
        let (client, provisional) = Client::new(BridgeConfig::default());
        let rec = RecordingCallbacks::default();
        client.start_stream(34, rec.clone());
        client.send_headers(34, request_headers(), true);
        drop(provisional);
        assert_eq!(rec.events(), vec![Delivered::Cancel]);
        let late = RecordingCallbacks::default();
        client.start_stream(35, late.clone());
        assert_eq!(late.terminal_count(), 1);
        assert_eq!(client.stats().stream_cancel, 2);
    }

    #[test]
    fn dropping_engine_cancels_live_and_queued_streams() {
        let (client, mut engine, _te) = setup(BridgeConfig::default());
        let live = RecordingCallbacks::default();
        let queued = RecordingCallbacks::default();
        client.start_stream(31, live.clone());
        engine.run_pending();
        client.start_stream(32, queued.clone());
        drop(engine);
        assert_eq!(live.events(), vec![Delivered::Cancel]);
        assert_eq!(queued.events(), vec![Delivered::Cancel]);

        let after = RecordingCallbacks::default();
        client.start_stream(33, after.clone());
        assert_eq!(after.terminal_count(), 1);
        assert_eq!(client.stats().stream_cancel, 3);
    }

    #[test]
    fn stream_control_reported_to_engine() {
        let config = BridgeConfig {
            buffer_limit: 1234,
            ..BridgeConfig::default()
        };
        let (client, mut engine, te) = setup(config);
        client.start_stream(18, RecordingCallbacks::default());
        engine.run_pending();
        assert_eq!(te.buffer_limit(18), Some(1234));
        assert_eq!(te.local_address(18).as_deref(), Some("synthetic"));
    }

    #[test]
    fn concurrent_callers_get_exactly_one_terminal_each() {
        let (client, mut engine, te) = setup(BridgeConfig::default());
        let recorders: Vec<RecordingCallbacks> =
            (0..16).map(|_| RecordingCallbacks::default()).collect();
        let handles: Vec<_> = recorders
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, rec)| {
                let client = client.clone();
                std::thread::spawn(move || {
                    let id = 100 + i as u64;
                    client.start_stream(id, rec);
                    client.send_headers(id, request_headers(), true);
                    if i % 2 == 0 {
                        client.cancel_stream(id);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        engine.run_pending();
        for id in te.stream_ids() {
            te.encoder(id).encode_headers(status("200"), true);
        }
        // Racing cancels against queued completions.
        for id in (100..116u64).filter(|id| id % 3 == 0) {
            client.cancel_stream(id);
        }
        engine.run_pending();

        for rec in &recorders {
            assert_eq!(rec.terminal_count(), 1);
        }
        let s = client.stats();
        assert_eq!(s.total(), 16);
        assert!(s.stream_cancel >= 8);
        assert_eq!(engine.active_streams(), 0);
    }

    #[tokio::test]
    async fn run_loop_serves_foreign_thread_until_shutdown() {
        let (client, provisional) = Client::new(BridgeConfig::default());
        let te = TestEngine::default();
        let engine = provisional.start(Box::new(te.clone()));
        let rec = RecordingCallbacks::default();
        let caller = {
            let client = client.clone();
            let rec = rec.clone();
            std::thread::spawn(move || {
                client.start_stream(20, rec);
                client.send_headers(20, request_headers(), true);
                client.cancel_stream(20);
                client.shutdown();
            })
        };
        caller.join().unwrap();
        engine.run().await;
        assert_eq!(rec.events(), vec![Delivered::Cancel]);
        assert_eq!(client.stats().stream_cancel, 1);
    }

    #[test]
    fn preferred_network_selects_cluster() {
        let (client, mut engine, te) = setup(BridgeConfig::default());
        client.set_preferred_network(Network::Wlan);
        client.start_stream(21, RecordingCallbacks::default());
        client.send_headers(21, request_headers(), true);
        engine.run_pending();
        match &te.frames(21)[0] {
            Frame::Headers(h, true) => assert_eq!(h.get(names::CLUSTER), Some("base_wlan")),
            other => panic!("expected headers, got {other:?}"),
        }
    }
}
