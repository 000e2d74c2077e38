//! Request tracking and the server read/write loops.
//!
//! # Lifecycle
//!
//! ```text
//! submit ──► pending[id] ──► write queue ──► writer task ──► server stdin
//!                │
//!                └──◄── read loop ◄── server stdout
//!                        ├─ Response: remove pending[id], resolve handle
//!                        └─ Event: hand to the EventDispatcher
//! ```
//!
//! Every pending entry is removed exactly once: by the read loop on a
//! matching response, by a failed write, by a timed-out or dropped handle,
//! by connection loss, or by shutdown.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{Frame, FrameCodec};
use crate::bridge::protocol::{Arguments, Inbound, Request, Response, decode_inbound, encode_request};
use crate::bridge::transport::{BoxedReader, BoxedWriter, Channel};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, ErrorKind};
use crate::events::EventDispatcher;

/// Target for payload-level request/response logs.
const WIRE_TARGET: &str = "omnilink::wire";

/// Called with the correlation id of a request that failed at the transport level.
pub type ErrorHook = Arc<dyn Fn(u64, &BridgeError) + Send + Sync>;

type Completion = oneshot::Sender<Result<Response, BridgeError>>;

struct Outbound {
    correlation_id: u64,
    body: Bytes,
}

struct Shared {
    pending: DashMap<u64, Completion>,
    running: AtomicBool,
    connected: AtomicBool,
    config: Arc<BridgeConfig>,
    error_hook: Option<ErrorHook>,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("pending", &self.pending.len())
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn notify(&self, correlation_id: u64, error: &BridgeError) {
        if error.kind() != ErrorKind::Transport {
            return;
        }
        if let Some(ref hook) = self.error_hook
            && catch_unwind(AssertUnwindSafe(|| hook(correlation_id, error))).is_err()
        {
            tracing::error!(correlation_id, "Error hook panicked");
        }
    }

    /// Remove and resolve an entry. Returns false if it was already claimed.
    fn complete(&self, correlation_id: u64, result: Result<Response, BridgeError>) -> bool {
        let Some((_, tx)) = self.pending.remove(&correlation_id) else {
            return false;
        };
        if let Err(ref e) = result {
            self.notify(correlation_id, e);
        }
        if tx.send(result).is_err() {
            tracing::trace!(correlation_id, "Caller stopped waiting before resolution");
        }
        true
    }

    fn fail_all(&self, make_error: impl Fn() -> BridgeError) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter(|&id| self.complete(id, Err(make_error())))
            .count()
    }

    fn resolve(&self, response: Response) {
        let correlation_id = response.correlation_id;
        if self.config.log_responses {
            tracing::debug!(
                target: WIRE_TARGET,
                correlation_id,
                command = %response.command,
                success = response.success,
                body = ?response.body,
                "Received response"
            );
        }

        let result = if response.success {
            Ok(response)
        } else {
            let message = response
                .message
                .clone()
                .unwrap_or_else(|| format!("{} failed", response.command));
            Err(BridgeError::Server(message))
        };

        if !self.complete(correlation_id, result) {
            tracing::warn!(correlation_id, "Response for unknown request, discarding");
        }
    }

    fn connection_lost(&self) {
        self.connected.store(false, Ordering::Release);
        let failed = if self.running.load(Ordering::Acquire) {
            self.fail_all(|| BridgeError::transport("connection closed"))
        } else {
            self.fail_all(|| BridgeError::cancelled("tracker shut down"))
        };
        if failed > 0 {
            tracing::warn!(failed, "Failed pending requests after connection loss");
        }
    }
}

struct Tasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Owns the pending-request map and the read/write tasks for one connection.
pub struct RequestTracker {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Outbound>,
    shutdown: CancellationToken,
    tasks: Mutex<Option<Tasks>>,
}

impl RequestTracker {
    /// Spawn the read loop and writer task over `channel`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        channel: Channel,
        config: Arc<BridgeConfig>,
        dispatcher: Arc<EventDispatcher>,
        error_hook: Option<ErrorHook>,
    ) -> Self {
        let (reader, writer) = channel.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(config.write_queue_capacity.max(1));
        let shutdown = CancellationToken::new();
        let max_message_size = config.max_message_size;

        let shared = Arc::new(Shared {
            pending: DashMap::new(),
            running: AtomicBool::new(true),
            connected: AtomicBool::new(true),
            config,
            error_hook,
        });

        let reader = tokio::spawn(run_read_loop(
            FramedRead::new(reader, FrameCodec::new(max_message_size)),
            Arc::clone(&shared),
            dispatcher,
            shutdown.clone(),
        ));
        let writer = tokio::spawn(run_writer(
            FramedWrite::new(writer, FrameCodec::new(max_message_size)),
            outbound_rx,
            Arc::clone(&shared),
            shutdown.clone(),
        ));

        tracing::info!(max_message_size, "Request tracker started");

        Self {
            shared,
            outbound: outbound_tx,
            shutdown,
            tasks: Mutex::new(Some(Tasks { reader, writer })),
        }
    }

    /// Register and enqueue a request. Never blocks.
    ///
    /// Fails synchronously with [`BridgeError::NotRunning`] after shutdown, and
    /// with [`BridgeError::Transport`] when the connection is gone, the request
    /// cannot be encoded, or the write queue is full. No pending entry remains
    /// after a synchronous failure.
    pub fn submit(
        &self,
        command: impl Into<String>,
        arguments: Arguments,
    ) -> Result<ResponseHandle, BridgeError> {
        if !self.is_running() {
            return Err(BridgeError::NotRunning);
        }

        let request = Request::new(command, arguments);
        let correlation_id = request.correlation_id;

        let body = match self.encode(&request) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(correlation_id, command = %request.command, error = %e, "Rejecting request");
                self.shared.notify(correlation_id, &e);
                return Err(e);
            }
        };

        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(correlation_id, tx);
        let handle = ResponseHandle {
            correlation_id,
            rx,
            shared: Arc::clone(&self.shared),
        };

        if let Err(e) = self.outbound.try_send(Outbound {
            correlation_id,
            body,
        }) {
            let error = match e {
                mpsc::error::TrySendError::Full(_) => BridgeError::transport("write queue is full"),
                mpsc::error::TrySendError::Closed(_) => BridgeError::transport("writer has stopped"),
            };
            tracing::warn!(correlation_id, error = %error, "Failed to enqueue request");
            self.shared.pending.remove(&correlation_id);
            self.shared.notify(correlation_id, &error);
            return Err(error);
        }

        if let Some(error) = self.reclaim_if_stopped(correlation_id) {
            return Err(error);
        }

        tracing::trace!(correlation_id, command = %request.command, "Request submitted");
        Ok(handle)
    }

    /// Shutdown or connection loss may have drained the map between the
    /// early checks and the insert. Take the entry back if so.
    fn reclaim_if_stopped(&self, correlation_id: u64) -> Option<BridgeError> {
        if !self.is_running() {
            self.shared.pending.remove(&correlation_id)?;
            return Some(BridgeError::NotRunning);
        }
        if !self.is_connected() {
            self.shared.pending.remove(&correlation_id)?;
            let error = BridgeError::transport("connection closed");
            tracing::warn!(correlation_id, "Connection lost while submitting request");
            self.shared.notify(correlation_id, &error);
            return Some(error);
        }
        None
    }

    fn encode(&self, request: &Request) -> Result<Bytes, BridgeError> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(BridgeError::transport("connection closed"));
        }

        let body = encode_request(request)?;
        let max = self.shared.config.max_message_size;
        if body.len() > max {
            return Err(BridgeError::transport(format!(
                "request of {} bytes exceeds maximum message size {max}",
                body.len()
            )));
        }

        if self.shared.config.log_requests {
            tracing::debug!(
                target: WIRE_TARGET,
                correlation_id = request.correlation_id,
                command = %request.command,
                payload = %String::from_utf8_lossy(&body),
                "Sending request"
            );
        }
        Ok(Bytes::from(body))
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// False once the read loop has seen the server close the connection.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Stop both loops and cancel every pending request. Idempotent.
    pub async fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Shutting down request tracker");
        self.shutdown.cancel();

        let cancelled = self
            .shared
            .fail_all(|| BridgeError::cancelled("tracker shut down"));
        if cancelled > 0 {
            tracing::info!(cancelled, "Cancelled pending requests");
        }

        let Some(tasks) = lock(&self.tasks).take() else {
            return;
        };
        let grace = self.shared.config.shutdown_grace;
        await_task("reader", tasks.reader, grace).await;
        await_task("writer", tasks.writer, grace).await;
        tracing::info!("Request tracker stopped");
    }
}

impl Drop for RequestTracker {
    fn drop(&mut self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            self.shutdown.cancel();
            self.shared
                .fail_all(|| BridgeError::cancelled("tracker dropped"));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Tracker task lock poisoned - recovering");
        PoisonError::into_inner(poisoned)
    })
}

async fn await_task(name: &'static str, mut task: JoinHandle<()>, grace: Duration) {
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(task = name, error = %e, "Tracker task failed"),
        Err(_) => {
            tracing::warn!(task = name, grace_ms = grace.as_millis(), "Tracker task did not stop in time, aborting");
            task.abort();
        }
    }
}

async fn run_read_loop(
    mut frames: FramedRead<BoxedReader, FrameCodec>,
    shared: Arc<Shared>,
    dispatcher: Arc<EventDispatcher>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::debug!("Read loop stopping on shutdown");
                break;
            }
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(Frame::Payload(body))) => match decode_inbound(&body) {
                Ok(Inbound::Response(response)) => shared.resolve(response),
                Ok(Inbound::Event(event)) => {
                    tracing::trace!(event = %event.name, sequence = event.sequence, "Dispatching event");
                    drop(dispatcher.dispatch_event(event));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping unclassifiable message");
                }
            },
            Some(Ok(Frame::Malformed(reason))) => {
                tracing::warn!(%reason, "Dropping malformed frame");
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Server connection read failed");
                shared.connection_lost();
                break;
            }
            None => {
                tracing::warn!("Server closed the connection");
                shared.connection_lost();
                break;
            }
        }
    }
    tracing::debug!("Read loop exiting");
}

async fn run_writer(
    mut sink: FramedWrite<BoxedWriter, FrameCodec>,
    mut outbound: mpsc::Receiver<Outbound>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let Outbound {
            correlation_id,
            body,
        } = message;
        let result = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            result = sink.send(body) => result,
        };

        if let Err(e) = result {
            tracing::error!(correlation_id, error = %e, "Failed to write request");
            shared.complete(
                correlation_id,
                Err(BridgeError::transport_io("failed to write request", e)),
            );
        }
    }

    if let Err(e) = sink.close().await {
        tracing::debug!(error = %e, "Closing server input failed");
    }
    tracing::debug!("Writer exiting");
}

/// Pending result of a submitted request.
///
/// Dropping an unresolved handle removes its pending entry; a late response
/// for it is then discarded by the read loop.
#[derive(Debug)]
pub struct ResponseHandle {
    correlation_id: u64,
    rx: oneshot::Receiver<Result<Response, BridgeError>>,
    shared: Arc<Shared>,
}

impl ResponseHandle {
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// Wait using the configured request timeout.
    pub async fn wait(self) -> Result<Response, BridgeError> {
        let timeout = self.shared.config.request_timeout;
        match timeout {
            Some(timeout) => self.wait_timeout(timeout).await,
            None => self.wait_forever().await,
        }
    }

    /// Wait at most `timeout`. On expiry the pending entry is removed and
    /// [`BridgeError::Timeout`] returned, unless the response was claimed at
    /// the same moment, in which case that response is returned.
    pub async fn wait_timeout(mut self, timeout: Duration) -> Result<Response, BridgeError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(result) => flatten(result),
            Err(_) => {
                if self.shared.pending.remove(&self.correlation_id).is_some() {
                    tracing::debug!(
                        correlation_id = self.correlation_id,
                        timeout_ms = timeout.as_millis(),
                        "Request timed out"
                    );
                    Err(BridgeError::Timeout(timeout))
                } else {
                    flatten((&mut self.rx).await)
                }
            }
        }
    }

    pub async fn wait_forever(mut self) -> Result<Response, BridgeError> {
        flatten((&mut self.rx).await)
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        self.shared.pending.remove(&self.correlation_id);
    }
}

fn flatten(
    result: Result<Result<Response, BridgeError>, oneshot::error::RecvError>,
) -> Result<Response, BridgeError> {
    result.unwrap_or_else(|_| Err(BridgeError::cancelled("request abandoned")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::decode_request;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    /// Scripted server side of a duplex pipe.
    struct FakeServer {
        requests: FramedRead<ReadHalf<DuplexStream>, FrameCodec>,
        replies: FramedWrite<WriteHalf<DuplexStream>, FrameCodec>,
    }

    impl FakeServer {
        async fn next_request(&mut self) -> Request {
            match self.requests.next().await {
                Some(Ok(Frame::Payload(body))) => decode_request(&body).unwrap(),
                other => panic!("expected request frame, got {other:?}"),
            }
        }

        async fn send(&mut self, value: serde_json::Value) {
            self.replies
                .send(Bytes::from(serde_json::to_vec(&value).unwrap()))
                .await
                .unwrap();
        }

        async fn reply(&mut self, request: &Request, body: serde_json::Value) {
            self.send(json!({
                "command": request.command,
                "request_seq": request.correlation_id,
                "seq": 1,
                "type": "response",
                "success": true,
                "body": body,
            }))
            .await;
        }
    }

    fn start(config: BridgeConfig) -> (RequestTracker, FakeServer) {
        start_with_hook(config, None)
    }

    fn start_with_hook(
        config: BridgeConfig,
        hook: Option<ErrorHook>,
    ) -> (RequestTracker, FakeServer) {
        start_on_pipe(config, hook, 64 * 1024)
    }

    fn start_on_pipe(
        config: BridgeConfig,
        hook: Option<ErrorHook>,
        pipe_capacity: usize,
    ) -> (RequestTracker, FakeServer) {
        let (client, server) = tokio::io::duplex(pipe_capacity);
        let (read_half, write_half) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let tracker = RequestTracker::start(
            Channel::new(read_half, write_half),
            Arc::new(config),
            Arc::new(EventDispatcher::new(1)),
            hook,
        );
        let server = FakeServer {
            requests: FramedRead::new(server_read, FrameCodec::new(1024 * 1024)),
            replies: FramedWrite::new(server_write, FrameCodec::new(1024 * 1024)),
        };
        (tracker, server)
    }

    #[tokio::test]
    async fn submit_and_resolve() {
        let (tracker, mut server) = start(BridgeConfig::default());

        let handle = tracker
            .submit("autocomplete", json!({"Line": 3}).as_object().cloned().unwrap())
            .unwrap();
        assert_eq!(tracker.pending_count(), 1);

        let request = server.next_request().await;
        assert_eq!(request.correlation_id, handle.correlation_id());
        server.reply(&request, json!({"Items": []})).await;

        let response = handle.wait().await.unwrap();
        assert_eq!(response.body, Some(json!({"Items": []})));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn unsuccessful_response_is_server_error() {
        let (tracker, mut server) = start(BridgeConfig::default());
        let handle = tracker.submit("format", Arguments::new()).unwrap();

        let request = server.next_request().await;
        server
            .send(json!({
                "command": "format",
                "request_seq": request.correlation_id,
                "seq": 2,
                "success": false,
                "message": "file not found",
            }))
            .await;

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, BridgeError::Server(ref m) if m == "file not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_entry_and_late_response_is_discarded() {
        let (tracker, mut server) = start(BridgeConfig::default());
        let handle = tracker.submit("slow", Arguments::new()).unwrap();
        let request = server.next_request().await;

        let err = handle.wait_timeout(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(d) if d == Duration::from_millis(50)));
        assert_eq!(tracker.pending_count(), 0);

        // The late reply must not disturb a later request.
        server.reply(&request, json!(null)).await;
        let next = tracker.submit("fast", Arguments::new()).unwrap();
        let next_request = server.next_request().await;
        server.reply(&next_request, json!({"ok": true})).await;
        assert_eq!(next.wait().await.unwrap().body, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn dropped_handle_removes_entry() {
        let (tracker, _server) = start(BridgeConfig::default());
        let handle = tracker.submit("ignored", Arguments::new()).unwrap();
        assert_eq!(tracker.pending_count(), 1);
        drop(handle);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_and_rejects_new_submits() {
        let (tracker, _server) = start(BridgeConfig::default());
        let handles: Vec<_> = (0..3)
            .map(|_| tracker.submit("pending", Arguments::new()).unwrap())
            .collect();

        tracker.shutdown().await;
        tracker.shutdown().await;

        for handle in handles {
            assert!(handle.wait_forever().await.unwrap_err().is_cancelled());
        }
        assert!(!tracker.is_running());
        assert!(matches!(
            tracker.submit("late", Arguments::new()),
            Err(BridgeError::NotRunning)
        ));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_bounded_by_grace_and_drops_queued_frames() {
        let grace = Duration::from_millis(200);
        // Smaller than one frame, so the writer stalls on the first request.
        let (tracker, mut server) =
            start_on_pipe(BridgeConfig::default().with_shutdown_grace(grace), None, 16);
        let handles: Vec<_> = (0..5)
            .map(|_| tracker.submit("queued", Arguments::new()).unwrap())
            .collect();
        tokio::task::yield_now().await;

        let started = tokio::time::Instant::now();
        tracker.shutdown().await;
        assert!(started.elapsed() <= grace * 2);

        for handle in handles {
            assert!(handle.wait_forever().await.unwrap_err().is_cancelled());
        }
        let mut delivered = 0;
        while let Some(Ok(Frame::Payload(_))) = server.requests.next().await {
            delivered += 1;
        }
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn handle_debug_reports_pending_count() {
        let (tracker, _server) = start(BridgeConfig::default());
        let handle = tracker.submit("typelookup", Arguments::new()).unwrap();
        let rendered = format!("{handle:?}");
        assert!(rendered.contains("pending: 1"), "{rendered}");
        assert!(rendered.contains("running: true"), "{rendered}");
    }

    #[tokio::test]
    async fn connection_loss_fails_pending_with_transport_error() {
        let failures = Arc::new(AtomicUsize::new(0));
        let hook: ErrorHook = {
            let failures = Arc::clone(&failures);
            Arc::new(move |_id: u64, _err: &BridgeError| {
                failures.fetch_add(1, Ordering::SeqCst);
            })
        };
        let (tracker, mut server) = start_with_hook(BridgeConfig::default(), Some(hook));

        let handle = tracker.submit("doomed", Arguments::new()).unwrap();
        server.next_request().await;
        drop(server);

        let err = handle.wait_forever().await.unwrap_err();
        assert!(matches!(err, BridgeError::Transport { ref message, .. } if message == "connection closed"));
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        assert!(!tracker.is_connected());
        assert!(matches!(
            tracker.submit("after", Arguments::new()),
            Err(BridgeError::Transport { .. })
        ));
        assert_eq!(failures.load(Ordering::SeqCst), 2);

        tracker.shutdown().await;
        assert!(matches!(
            tracker.submit("after", Arguments::new()),
            Err(BridgeError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn submit_reclaims_entry_when_connection_drops_mid_insert() {
        let failures = Arc::new(AtomicUsize::new(0));
        let hook: ErrorHook = {
            let failures = Arc::clone(&failures);
            Arc::new(move |_id: u64, _err: &BridgeError| {
                failures.fetch_add(1, Ordering::SeqCst);
            })
        };
        let (tracker, _server) = start_with_hook(BridgeConfig::default(), Some(hook));

        // An entry inserted after the read loop drained the map.
        let (tx, _rx) = oneshot::channel();
        tracker.shared.pending.insert(7, tx);
        tracker.shared.connected.store(false, Ordering::Release);

        let err = tracker.reclaim_if_stopped(7).unwrap();
        assert!(matches!(err, BridgeError::Transport { ref message, .. } if message == "connection closed"));
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        // Already claimed elsewhere: nothing to report.
        assert!(tracker.reclaim_if_stopped(7).is_none());
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn submit_reclaims_entry_when_shutdown_races_insert() {
        let (tracker, _server) = start(BridgeConfig::default());
        let (tx, _rx) = oneshot::channel();
        tracker.shared.pending.insert(9, tx);
        tracker.shared.running.store(false, Ordering::Release);

        assert!(matches!(tracker.reclaim_if_stopped(9), Some(BridgeError::NotRunning)));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn full_write_queue_fails_synchronously() {
        // Nobody reads the server side, and the current-thread runtime does not
        // run the writer until we yield.
        let (tracker, _server) = start(BridgeConfig::default().with_write_queue_capacity(1));

        let first = tracker.submit("one", Arguments::new());
        let second = tracker.submit("two", Arguments::new());

        assert!(first.is_ok());
        assert!(matches!(second, Err(BridgeError::Transport { ref message, .. }) if message == "write queue is full"));
        assert_eq!(tracker.pending_count(), 1);
    }

    #[tokio::test]
    async fn oversized_request_is_rejected() {
        let (tracker, _server) = start(BridgeConfig::default().with_max_message_size(32));
        let mut args = Arguments::new();
        args.insert("Buffer".into(), json!("x".repeat(64)));

        assert!(matches!(
            tracker.submit("updatebuffer", args),
            Err(BridgeError::Transport { .. })
        ));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn read_loop_survives_garbage() {
        let (tracker, mut server) = start(BridgeConfig::default());
        let handle = tracker.submit("checkalivestatus", Arguments::new()).unwrap();
        let request = server.next_request().await;

        server.send(json!({"neither": "response nor event"})).await;
        server
            .send(json!({"command": "x", "request_seq": 999_999_999, "success": true}))
            .await;
        server.reply(&request, json!(true)).await;

        assert_eq!(handle.wait().await.unwrap().body, Some(json!(true)));
    }
}
