use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use nodebind_frame::{Frame, FrameConfig, FrameError, FrameKind, FrameReader, FrameWriter};
use nodebind_promise::{join_bounded, Executor, ThreadPool};
use nodebind_transport::NodeStream;
use tracing::{debug, info, warn};

use crate::binder::BinderTable;
use crate::error::{BinderError, Result};
use crate::lock;
use crate::wire::pending::PendingTable;

/// Message carried by every EXCEPTION reply; the payload holds the cause.
pub const TRANSACTION_FAILURE: &str = "binder transaction failure";

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a connection. Only `Connected` accepts frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// Which end of the conversation this connection is.
pub(crate) enum Role {
    /// Outbound: sends requests, correlates replies.
    Client { pending: Arc<PendingTable> },
    /// Inbound: serves requests against the local binder table.
    Server {
        binders: Arc<BinderTable>,
        workers: Arc<ThreadPool>,
    },
}

type ClosedHook = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Threads {
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

/// One TCP connection with a reader thread and a writer thread.
///
/// Frames queued with [`send`](Self::send) are written in order by the
/// writer thread. The reader thread decodes frames and either settles
/// pending client transactions or queues server dispatch on the worker pool.
pub struct Connection {
    id: u64,
    peer: String,
    role: Role,
    max_payload: usize,
    shutdown_timeout: Duration,
    state: Mutex<ConnectionState>,
    outbox: Outbox,
    stream: NodeStream,
    threads: Mutex<Threads>,
    on_closed: Mutex<Vec<ClosedHook>>,
}

impl Connection {
    pub(crate) fn open(
        stream: NodeStream,
        role: Role,
        frame: FrameConfig,
        shutdown_timeout: Duration,
        peer: String,
    ) -> Result<Arc<Self>> {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %err, "could not disable nagle");
        }
        let reader = stream
            .try_clone()
            .map_err(|err| setup_error(&peer, err))
            .and_then(|s| {
                FrameReader::for_stream(s, frame.clone()).map_err(|err| setup_error(&peer, err))
            })?;
        let writer = stream
            .try_clone()
            .map_err(|err| setup_error(&peer, err))
            .and_then(|s| {
                FrameWriter::for_stream(s, frame.clone()).map_err(|err| setup_error(&peer, err))
            })?;

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(Self {
            id,
            peer,
            role,
            max_payload: frame.max_payload_size,
            shutdown_timeout,
            state: Mutex::new(ConnectionState::Connecting),
            outbox: Outbox::new(),
            stream,
            threads: Mutex::new(Threads::default()),
            on_closed: Mutex::new(Vec::new()),
        });
        *lock(&connection.state) = ConnectionState::Connected;

        let rx = Arc::clone(&connection);
        let reader_thread = std::thread::Builder::new()
            .name(format!("nodebind-conn-{id}-rx"))
            .spawn(move || reader_loop(&rx, reader));
        let tx = Arc::clone(&connection);
        let writer_thread = std::thread::Builder::new()
            .name(format!("nodebind-conn-{id}-tx"))
            .spawn(move || writer_loop(&tx, writer));

        let failure = {
            let mut threads = lock(&connection.threads);
            let mut failure = None;
            match reader_thread {
                Ok(handle) => threads.reader = Some(handle),
                Err(err) => failure = Some(err),
            }
            match writer_thread {
                Ok(handle) => threads.writer = Some(handle),
                Err(err) => failure = Some(err),
            }
            failure
        };

        if let Some(err) = failure {
            connection.close("failed to spawn connection thread");
            return Err(setup_error(&connection.peer, err));
        }

        debug!(conn = id, peer = %connection.peer, "connection open");
        Ok(connection)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Frames waiting for the writer thread.
    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    /// Queue a frame for the writer thread.
    pub fn send(&self, frame: Frame) -> Result<()> {
        if frame.payload.len() > self.max_payload {
            return Err(BinderError::Marshal(format!(
                "payload of {} bytes exceeds the {} byte frame limit",
                frame.payload.len(),
                self.max_payload
            )));
        }
        if !self.is_open() || !self.outbox.push(frame) {
            return Err(BinderError::Connection(format!(
                "connection to {} is closed",
                self.peer
            )));
        }
        Ok(())
    }

    /// Run `hook` once the connection is closed, after any hooks added
    /// earlier. Runs immediately if it already is.
    pub(crate) fn on_closed<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let state = lock(&self.state);
            if *state != ConnectionState::Closed {
                lock(&self.on_closed).push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    /// Tear the connection down.
    ///
    /// The first caller wins. Frames already queued are flushed by the
    /// writer before the socket is shut down. Both threads are joined (never
    /// the calling one) and every pending client transaction rejects with
    /// [`BinderError::Connection`].
    pub fn close(&self, reason: &str) {
        {
            let mut state = lock(&self.state);
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                return;
            }
            *state = ConnectionState::Closing;
        }
        info!(conn = self.id, peer = %self.peer, reason, "connection closing");

        let (reader, writer) = {
            let mut threads = lock(&self.threads);
            (threads.reader.take(), threads.writer.take())
        };
        self.outbox.close();
        self.join(writer);
        self.stream.shutdown();
        self.join(reader);

        if let Role::Client { pending } = &self.role {
            let orphaned = pending.drain();
            if !orphaned.is_empty() {
                debug!(conn = self.id, count = orphaned.len(), "rejecting pending transactions");
            }
            let error = BinderError::Connection(format!("connection to {} closed: {reason}", self.peer));
            for completion in orphaned {
                completion.reject(error.clone());
            }
        }

        let hooks: Vec<ClosedHook> = {
            let mut state = lock(&self.state);
            *state = ConnectionState::Closed;
            lock(&self.on_closed).drain(..).collect()
        };
        for hook in hooks {
            hook();
        }
    }

    fn join(&self, handle: Option<JoinHandle<()>>) {
        let Some(handle) = handle else {
            return;
        };
        if handle.thread().id() == std::thread::current().id() {
            return;
        }
        let name = handle.thread().name().unwrap_or("connection").to_string();
        if !join_bounded(handle, self.shutdown_timeout) {
            warn!(conn = self.id, thread = %name, "thread did not exit before timeout");
        }
    }

    fn dispatch(self: &Arc<Self>, frame: Frame) {
        match &self.role {
            Role::Client { pending } => self.settle_reply(pending, frame),
            Role::Server { binders, workers } => self.serve_request(binders, workers, frame),
        }
    }

    fn settle_reply(&self, pending: &PendingTable, frame: Frame) {
        let Some(completion) = pending.take(frame.transaction_id) else {
            warn!(
                conn = self.id,
                tid = frame.transaction_id,
                "invalid transaction id"
            );
            return;
        };
        match frame.kind {
            FrameKind::Transaction => {
                completion.fulfil(frame.payload);
            }
            FrameKind::Exception => {
                let cause = String::from_utf8_lossy(&frame.payload).into_owned();
                completion.reject(BinderError::Remote {
                    message: TRANSACTION_FAILURE.to_string(),
                    cause: (!cause.is_empty()).then_some(cause),
                });
            }
        }
    }

    fn serve_request(self: &Arc<Self>, binders: &BinderTable, workers: &ThreadPool, frame: Frame) {
        let Frame {
            kind,
            target_uri,
            transaction_id,
            what,
            payload,
        } = frame;

        if kind == FrameKind::Exception {
            warn!(conn = self.id, tid = transaction_id, "ignoring exception frame from client");
            return;
        }

        let Some(stub) = binders.lookup_uri(&target_uri) else {
            debug!(conn = self.id, uri = %target_uri, "transaction for unknown target");
            if transaction_id != 0 {
                let error = BinderError::not_found(&target_uri);
                self.reply(target_uri, transaction_id, what, Err(error));
            }
            return;
        };

        let connection = Arc::clone(self);
        workers.execute(Box::new(move || {
            let completion = stub.transact(what, payload);
            if transaction_id == 0 {
                return;
            }
            completion.on_settled(move |result| {
                connection.reply(target_uri, transaction_id, what, result);
            });
        }));
    }

    fn reply(&self, target_uri: String, transaction_id: u32, what: i32, result: Result<Bytes>) {
        let frame = match result {
            Ok(payload) if payload.len() <= self.max_payload => {
                Frame::transaction(target_uri, transaction_id, what, payload)
            }
            Ok(payload) => {
                let error = BinderError::Marshal(format!(
                    "reply of {} bytes exceeds the {} byte frame limit",
                    payload.len(),
                    self.max_payload
                ));
                Frame::exception(target_uri, transaction_id, what, error.to_string())
            }
            Err(error) => Frame::exception(target_uri, transaction_id, what, error.to_string()),
        };
        if let Err(err) = self.send(frame) {
            debug!(conn = self.id, tid = transaction_id, error = %err, "reply dropped");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

fn setup_error(peer: &str, err: impl std::fmt::Display) -> BinderError {
    BinderError::Connection(format!("failed to set up connection to {peer}: {err}"))
}

fn reader_loop(connection: &Arc<Connection>, mut reader: FrameReader<NodeStream>) {
    loop {
        match reader.read_frame() {
            Ok(frame) => connection.dispatch(frame),
            Err(FrameError::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
                    && connection.is_open() =>
            {
                continue;
            }
            Err(FrameError::ConnectionClosed) => {
                connection.close("peer closed the connection");
                return;
            }
            Err(err) => {
                if connection.is_open() {
                    warn!(conn = connection.id, error = %err, "read failed");
                }
                connection.close(&format!("read failed: {err}"));
                return;
            }
        }
    }
}

fn writer_loop(connection: &Arc<Connection>, mut writer: FrameWriter<NodeStream>) {
    while let Some(frame) = connection.outbox.pop() {
        if let Err(err) = writer.write_frame(&frame) {
            warn!(conn = connection.id, error = %err, "write failed");
            connection.close(&format!("write failed: {err}"));
            return;
        }
    }
}

/// FIFO of frames for the writer thread.
struct Outbox {
    queue: Mutex<OutboxState>,
    ready: Condvar,
}

struct OutboxState {
    frames: VecDeque<Frame>,
    closed: bool,
}

impl Outbox {
    fn new() -> Self {
        Self {
            queue: Mutex::new(OutboxState {
                frames: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn push(&self, frame: Frame) -> bool {
        let mut queue = lock(&self.queue);
        if queue.closed {
            return false;
        }
        queue.frames.push_back(frame);
        drop(queue);
        self.ready.notify_one();
        true
    }

    /// Next frame, blocking. `None` once closed and drained.
    fn pop(&self) -> Option<Frame> {
        let mut queue = lock(&self.queue);
        loop {
            if let Some(frame) = queue.frames.pop_front() {
                return Some(frame);
            }
            if queue.closed {
                return None;
            }
            queue = self
                .ready
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn close(&self) {
        let mut queue = lock(&self.queue);
        queue.closed = true;
        drop(queue);
        self.ready.notify_all();
    }

    fn len(&self) -> usize {
        lock(&self.queue).frames.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use nodebind_transport::{connect, NodeAddress, NodeListener};

    use super::*;
    use crate::stub::{Reply, Stub};
    use crate::Completion;

    fn stream_pair() -> (NodeStream, NodeStream) {
        let listener = NodeListener::bind(&NodeAddress::new("127.0.0.1", 0))
            .expect("listener should bind");
        let target = NodeAddress::from(listener.local_addr());
        let client = connect(&target, Duration::from_secs(2)).expect("client should connect");
        let server = listener.accept().expect("listener should accept");
        (client, server)
    }

    fn open(stream: NodeStream, role: Role) -> Arc<Connection> {
        Connection::open(
            stream,
            role,
            FrameConfig::default(),
            Duration::from_secs(2),
            "test-peer".to_string(),
        )
        .expect("connection should open")
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn client_and_server_exchange_frames() {
        let (client_stream, server_stream) = stream_pair();
        let binders = Arc::new(BinderTable::new(2, []));
        let id = binders
            .register(Arc::new(Stub::builder("t").on(1, Reply::ok).build()))
            .expect("stub should register");
        let workers = Arc::new(ThreadPool::new("conn-test", 1, 8).expect("pool should start"));
        let server = open(server_stream, Role::Server { binders, workers });

        let pending = Arc::new(PendingTable::new());
        let client = open(client_stream, Role::Client { pending: Arc::clone(&pending) });

        let completion = Completion::new();
        let tid = pending.insert(completion.clone()).expect("insert should succeed");
        client
            .send(Frame::transaction(format!("rpc://{id}"), tid, 1, "echo"))
            .expect("send should queue");

        assert_eq!(
            completion.wait_timeout(Duration::from_secs(2)),
            Ok(Bytes::from_static(b"echo"))
        );
        assert!(pending.is_empty());

        client.close("test done");
        assert!(wait_for(|| server.state() == ConnectionState::Closed));
    }

    #[test]
    fn unknown_target_gets_exception() {
        let (client_stream, server_stream) = stream_pair();
        let binders = Arc::new(BinderTable::new(2, []));
        let workers = Arc::new(ThreadPool::new("conn-test-x", 1, 8).expect("pool should start"));
        let _server = open(server_stream, Role::Server { binders, workers });

        let pending = Arc::new(PendingTable::new());
        let client = open(client_stream, Role::Client { pending: Arc::clone(&pending) });
        let completion = Completion::new();
        let tid = pending.insert(completion.clone()).expect("insert should succeed");
        client
            .send(Frame::transaction("rpc://2.77", tid, 1, Bytes::new()))
            .expect("send should queue");

        match completion.wait_timeout(Duration::from_secs(2)) {
            Err(BinderError::Remote { message, cause }) => {
                assert_eq!(message, TRANSACTION_FAILURE);
                assert!(cause.unwrap_or_default().contains("target not found"));
            }
            other => panic!("expected remote exception, got {other:?}"),
        }
    }

    #[test]
    fn close_rejects_every_pending_transaction() {
        let (client_stream, _server_stream) = stream_pair();
        let pending = Arc::new(PendingTable::new());
        let client = open(client_stream, Role::Client { pending: Arc::clone(&pending) });

        let completions: Vec<Completion> = (0..5)
            .map(|_| {
                let completion = Completion::new();
                pending.insert(completion.clone()).expect("insert should succeed");
                completion
            })
            .collect();

        let hook_runs = Arc::new(AtomicUsize::new(0));
        let runs = Arc::clone(&hook_runs);
        client.on_closed(move || {
            runs.fetch_add(1, Ordering::SeqCst);
        });

        client.close("test");
        client.close("again");

        assert!(pending.is_empty());
        for completion in completions {
            assert!(matches!(completion.try_result(), Some(Err(BinderError::Connection(_)))));
        }
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(hook_runs.load(Ordering::SeqCst), 1);
        assert!(matches!(
            client.send(Frame::transaction("rpc://2.1", 0, 0, Bytes::new())),
            Err(BinderError::Connection(_))
        ));

        let late = Arc::new(AtomicUsize::new(0));
        let late_runs = Arc::clone(&late);
        client.on_closed(move || {
            late_runs.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn peer_hangup_closes_connection() {
        let (client_stream, server_stream) = stream_pair();
        let pending = Arc::new(PendingTable::new());
        let client = open(client_stream, Role::Client { pending: Arc::clone(&pending) });
        let completion = Completion::new();
        pending.insert(completion.clone()).expect("insert should succeed");

        server_stream.shutdown();
        drop(server_stream);

        assert!(matches!(
            completion.wait_timeout(Duration::from_secs(2)),
            Err(BinderError::Connection(_))
        ));
        assert!(wait_for(|| client.state() == ConnectionState::Closed));
    }

    #[test]
    fn oversized_payload_is_refused_locally() {
        let (client_stream, _server_stream) = stream_pair();
        let frame = FrameConfig {
            max_payload_size: 8,
            ..FrameConfig::default()
        };
        let client = Connection::open(
            client_stream,
            Role::Client {
                pending: Arc::new(PendingTable::new()),
            },
            frame,
            Duration::from_secs(2),
            "small".to_string(),
        )
        .expect("connection should open");

        let err = client
            .send(Frame::transaction("rpc://2.1", 0, 0, vec![0u8; 64]))
            .unwrap_err();
        assert!(matches!(err, BinderError::Marshal(_)));
        assert!(client.is_open());
        client.close("done");
    }
}
