//! Request/response correlation over one worker instance's stdio.
//!
//! One writer task owns the worker's stdin; one reader task owns its
//! stdout and is the only place responses are matched to callers. Callers
//! register a pending entry, hand the frame to the writer and park on a
//! oneshot until the reader (or a cancellation, or `close`) resolves it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tsbridge_types::{
    InstanceId, RequestSeq, ServerResponse, WorkerError, WorkerEvent, WorkerResponse,
};

use crate::cancellation::RequestCanceller;
use crate::codec::{FrameReader, FrameWriter};
use crate::protocol::{IncomingFrame, ProtocolError, Request, parse_incoming};
use crate::supervisor::{SupervisorEvent, SupervisorSender};

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Receives decoded worker events on the reader task. Must not block.
pub(crate) trait WorkerEventSink: Send + Sync {
    fn on_event(&self, event: WorkerEvent);
}

/// Per-call options for [`RequestMultiplexer::execute`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Join this resource's cancellation group.
    pub cancel_on_resource_change: Option<String>,
    /// A failure of this request means the worker is unusable.
    pub non_recoverable: bool,
}

impl ExecuteOptions {
    pub fn for_resource(resource: impl Into<String>) -> Self {
        Self {
            cancel_on_resource_change: Some(resource.into()),
            non_recoverable: false,
        }
    }

    pub fn non_recoverable() -> Self {
        Self {
            cancel_on_resource_change: None,
            non_recoverable: true,
        }
    }
}

enum WriterCommand {
    Request {
        seq: RequestSeq,
        frame: serde_json::Value,
    },
    Notify(serde_json::Value),
    Shutdown,
}

struct PendingRequest {
    command: String,
    is_async: bool,
    written: bool,
    reply: oneshot::Sender<ServerResponse>,
    submitted_at: Instant,
}

type ResourceGroups = HashMap<String, HashMap<RequestSeq, CancellationToken>>;

/// State shared between callers, the reader task and the writer task.
struct Shared {
    instance: InstanceId,
    pending: Mutex<HashMap<RequestSeq, PendingRequest>>,
    groups: Mutex<ResourceGroups>,
    canceller: Arc<dyn RequestCanceller>,
    closed: AtomicBool,
    late_responses: AtomicU64,
    lifecycle: SupervisorSender,
}

impl Shared {
    fn take_pending(&self, seq: RequestSeq) -> Option<PendingRequest> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&seq)
    }

    /// Remove a pending request and resolve its caller with `Cancelled`.
    ///
    /// The worker is signalled only if the request already went out.
    fn cancel_request(&self, seq: RequestSeq) -> bool {
        let Some(entry) = self.take_pending(seq) else {
            return false;
        };
        if entry.written {
            let signalled = self.canceller.try_cancel(seq);
            tracing::debug!(%seq, command = %entry.command, signalled, "cancelled request");
        } else {
            tracing::debug!(%seq, command = %entry.command, "cancelled request before write");
        }
        let reason = format!("Cancelled request {seq} - {}", entry.command);
        let _ = entry.reply.send(ServerResponse::cancelled(reason));
        true
    }

    fn resolve(&self, seq: RequestSeq, response: ServerResponse) {
        match self.take_pending(seq) {
            Some(entry) => {
                tracing::trace!(
                    %seq,
                    command = %entry.command,
                    outcome = response.label(),
                    elapsed_ms = entry.submitted_at.elapsed().as_millis() as u64,
                    "request resolved"
                );
                let _ = entry.reply.send(response);
            }
            None => self.count_late(seq),
        }
    }

    fn count_late(&self, seq: RequestSeq) {
        self.late_responses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%seq, "dropping response with no pending request");
    }

    /// Mark closed and resolve every pending request with `NoServer`.
    fn fail_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<(RequestSeq, PendingRequest)> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        if !drained.is_empty() {
            tracing::debug!(instance = %self.instance, count = drained.len(), "failing pending requests");
        }
        for (_, entry) in drained {
            let _ = entry.reply.send(ServerResponse::NoServer);
        }
        self.groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn report_fatal(&self, command: Option<String>, error: String) {
        let _ = self.lifecycle.send(SupervisorEvent::Fatal {
            instance: self.instance,
            command,
            error,
        });
    }

    fn dispatch_frame(&self, frame: serde_json::Value, sink: &dyn WorkerEventSink) {
        match parse_incoming(frame) {
            Ok(IncomingFrame::Response(raw)) => {
                let seq = raw.request_seq;
                let response = raw.into_server_response();
                if response.is_success() && self.is_async_pending(seq) {
                    // Async requests finish with `requestCompleted`.
                    tracing::trace!(%seq, "ignoring interim response for async request");
                    return;
                }
                self.resolve(seq, response);
            }
            Ok(IncomingFrame::RequestCompleted { request_seq }) => {
                match self.take_pending(request_seq) {
                    Some(entry) => {
                        let _ = entry.reply.send(ServerResponse::Success(WorkerResponse {
                            request_seq,
                            command: entry.command,
                            body: None,
                        }));
                    }
                    None => self.count_late(request_seq),
                }
            }
            Ok(IncomingFrame::Event(event)) => sink.on_event(event),
            Err(ProtocolError::MalformedResponse {
                request_seq: Some(seq),
                source,
            }) => {
                tracing::warn!(%seq, "malformed response from worker: {source}");
                match self.take_pending(seq) {
                    Some(entry) => {
                        let error = WorkerError::new(
                            entry.command,
                            format!("malformed response: {source}"),
                        );
                        let _ = entry.reply.send(ServerResponse::Failed(error));
                    }
                    None => self.count_late(seq),
                }
            }
            Err(e) => tracing::warn!(instance = %self.instance, "ignoring worker message: {e}"),
        }
    }

    fn is_async_pending(&self, seq: RequestSeq) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&seq)
            .is_some_and(|entry| entry.is_async)
    }

    fn leave_group(&self, resource: &str, seq: RequestSeq) {
        let mut groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(members) = groups.get_mut(resource) {
            members.remove(&seq);
            if members.is_empty() {
                groups.remove(resource);
            }
        }
    }
}

/// Cancels the request if the caller stops waiting before it resolves.
struct RequestGuard<'a> {
    shared: &'a Shared,
    seq: RequestSeq,
    resource: Option<String>,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.shared.cancel_request(self.seq);
        if let Some(resource) = &self.resource {
            self.shared.leave_group(resource, self.seq);
        }
    }
}

pub(crate) struct RequestMultiplexer {
    shared: Arc<Shared>,
    next_seq: AtomicU64,
    writer_tx: mpsc::Sender<WriterCommand>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl RequestMultiplexer {
    pub fn new<R, W>(
        reader: R,
        writer: W,
        instance: InstanceId,
        canceller: Arc<dyn RequestCanceller>,
        sink: Arc<dyn WorkerEventSink>,
        lifecycle: SupervisorSender,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            instance,
            pending: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
            canceller,
            closed: AtomicBool::new(false),
            late_responses: AtomicU64::new(0),
            lifecycle,
        });

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_shared = Arc::clone(&shared);
        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer);
            while let Some(cmd) = writer_rx.recv().await {
                let (frame, command) = match cmd {
                    WriterCommand::Request { seq, frame } => {
                        let mut pending = writer_shared
                            .pending
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner);
                        let Some(entry) = pending.get_mut(&seq) else {
                            tracing::trace!(%seq, "skipping write of cancelled request");
                            continue;
                        };
                        entry.written = true;
                        let command = entry.command.clone();
                        drop(pending);
                        (frame, Some(command))
                    }
                    WriterCommand::Notify(frame) => (frame, None),
                    WriterCommand::Shutdown => break,
                };
                if let Err(e) = writer.write_frame(&frame).await {
                    tracing::warn!(instance = %writer_shared.instance, "worker write error: {e}");
                    writer_shared.report_fatal(command, e.to_string());
                    break;
                }
            }
        });

        let reader_shared = Arc::clone(&shared);
        let reader_handle = tokio::spawn(async move {
            let mut reader = FrameReader::new(reader);
            loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => reader_shared.dispatch_frame(frame, sink.as_ref()),
                    Ok(None) => {
                        tracing::info!(instance = %reader_shared.instance, "worker closed stdout");
                        reader_shared.fail_all();
                        break;
                    }
                    Err(e) => {
                        tracing::error!(instance = %reader_shared.instance, "worker stream error: {e}");
                        reader_shared.report_fatal(None, e.to_string());
                        reader_shared.fail_all();
                        break;
                    }
                }
            }
        });

        Self {
            shared,
            next_seq: AtomicU64::new(1),
            writer_tx,
            reader_handle,
            writer_handle,
        }
    }

    fn allocate_seq(&self) -> RequestSeq {
        RequestSeq::new(self.next_seq.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Fire-and-forget message. A closed writer is logged, not surfaced.
    pub async fn notify(&self, command: &str, arguments: Option<serde_json::Value>) {
        if self.is_closed() {
            tracing::warn!(command, "notify on closed worker connection dropped");
            return;
        }
        let seq = self.allocate_seq();
        let frame = match Request::new(seq, command, arguments).to_value() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(command, "failed to encode notification: {e}");
                return;
            }
        };
        if self.writer_tx.send(WriterCommand::Notify(frame)).await.is_err() {
            tracing::warn!(command, "worker writer closed, notification dropped");
        }
    }

    pub async fn execute(
        &self,
        command: &str,
        arguments: Option<serde_json::Value>,
        token: Option<CancellationToken>,
        options: &ExecuteOptions,
    ) -> ServerResponse {
        self.submit(command, arguments, token, options, false).await
    }

    /// Async worker command (`geterr`), resolved by `requestCompleted`.
    pub async fn execute_async(
        &self,
        command: &str,
        arguments: Option<serde_json::Value>,
        token: CancellationToken,
    ) -> ServerResponse {
        self.submit(command, arguments, Some(token), &ExecuteOptions::default(), true)
            .await
    }

    async fn submit(
        &self,
        command: &str,
        arguments: Option<serde_json::Value>,
        token: Option<CancellationToken>,
        options: &ExecuteOptions,
        is_async: bool,
    ) -> ServerResponse {
        if self.is_closed() {
            return ServerResponse::NoServer;
        }

        let seq = self.allocate_seq();
        let frame = match Request::new(seq, command, arguments).to_value() {
            Ok(frame) => frame,
            Err(e) => {
                return ServerResponse::Failed(WorkerError::new(
                    command,
                    format!("failed to encode request: {e}"),
                ));
            }
        };

        let (reply, mut rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                seq,
                PendingRequest {
                    command: command.to_string(),
                    is_async,
                    written: false,
                    reply,
                    submitted_at: Instant::now(),
                },
            );

        let caller_token = token.unwrap_or_else(CancellationToken::new);
        let wait_token = match &options.cancel_on_resource_change {
            Some(resource) => {
                let member = caller_token.child_token();
                self.shared
                    .groups
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entry(resource.clone())
                    .or_default()
                    .insert(seq, member.clone());
                member
            }
            None => caller_token,
        };
        let _guard = RequestGuard {
            shared: &self.shared,
            seq,
            resource: options.cancel_on_resource_change.clone(),
        };

        // `close` may have drained the table before our insert.
        if self.is_closed() {
            return ServerResponse::NoServer;
        }

        tracing::trace!(%seq, command, is_async, "sending request");
        // The writer queue is bounded; a cancel must not wait for room in it.
        let queued = tokio::select! {
            biased;
            () = wait_token.cancelled() => false,
            sent = self.writer_tx.send(WriterCommand::Request { seq, frame }) => {
                if sent.is_err() {
                    self.shared.take_pending(seq);
                    return ServerResponse::NoServer;
                }
                true
            }
        };

        let outcome = if queued {
            tokio::select! {
                biased;
                res = &mut rx => res.ok(),
                () = wait_token.cancelled() => {
                    self.shared.cancel_request(seq);
                    (&mut rx).await.ok()
                }
            }
        } else {
            self.shared.cancel_request(seq);
            (&mut rx).await.ok()
        };
        let response = outcome.unwrap_or(ServerResponse::NoServer);

        if options.non_recoverable
            && let ServerResponse::Failed(error) = &response
        {
            self.shared
                .report_fatal(Some(command.to_string()), error.message.clone());
        }
        response
    }

    /// Cancel every in-flight request registered for `resource`. Returns the
    /// number of requests cancelled.
    pub fn cancel_inflight_requests_for_resource(&self, resource: &str) -> usize {
        let members = self
            .shared
            .groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(resource)
            .unwrap_or_default();
        let mut cancelled = 0;
        for (seq, token) in members {
            if self.shared.cancel_request(seq) {
                cancelled += 1;
            }
            token.cancel();
        }
        if cancelled > 0 {
            tracing::debug!(resource, cancelled, "cancelled in-flight requests for resource");
        }
        cancelled
    }

    /// Resolve everything pending with `NoServer` and stop both tasks.
    /// Later calls return `NoServer` immediately.
    pub fn close(&self) {
        self.shared.fail_all();
        let _ = self.writer_tx.try_send(WriterCommand::Shutdown);
        self.reader_handle.abort();
    }

    pub fn pending_count(&self) -> usize {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Responses that arrived after their request was cancelled or closed.
    pub fn late_responses(&self) -> u64 {
        self.shared.late_responses.load(Ordering::Relaxed)
    }
}

impl Drop for RequestMultiplexer {
    fn drop(&mut self) {
        self.shared.fail_all();
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}
