//! Stream actors: one owner per upstream feed, fanning records out to
//! independently paced subscribers.
//!
//! All registry mutation happens inside the actor's own loop. Callers talk
//! to it through a [`StreamHandle`], which only sends requests:
//!
//! - **subscribe** takes the first free slot (or appends one) and, when the
//!   actor is idle, opens the upstream connection
//! - **unsubscribe** clears a slot without compacting, so slot indices never shift
//! - every decoded line is offered to each occupied slot with a non-blocking
//!   send; a full queue drops the record for that subscriber only
//!
//! When a record arrives and no slot is occupied, the upstream connection is
//! closed and the actor goes back to idle. Unsubscribing alone never closes
//! it, so a burst of reconnecting clients does not thrash the upstream.

use crate::cache::RecentCache;
use crate::config::CacheConfig;
use crate::error::StreamError;
use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// One decoded upstream line, shared read-only by every subscriber.
pub type Record = Arc<Value>;

/// Raw lines read from an upstream connection. Dropping it closes the connection.
pub type LineStream = BoxStream<'static, std::io::Result<String>>;

const UPSTREAM_READ_BUFFER: usize = 32 * 1024;
/// Longer upstream lines are skipped.
const MAX_LINE_BYTES: usize = UPSTREAM_READ_BUFFER;

/// Source of upstream connections.
#[async_trait]
pub trait Upstream: Send + Sync + 'static {
    /// Opens a connection for the logical stream `name` and returns its lines.
    async fn connect(&self, name: &str) -> Result<LineStream, StreamError>;
}

/// Upstream reached over TCP: send the stream name on its own line, then
/// read newline-delimited JSON until the peer closes.
#[derive(Debug, Clone)]
pub struct TcpUpstream {
    address: String,
}

impl TcpUpstream {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Upstream for TcpUpstream {
    async fn connect(&self, name: &str) -> Result<LineStream, StreamError> {
        let mut socket = TcpStream::connect(&self.address)
            .await
            .map_err(|source| StreamError::Connect {
                address: self.address.clone(),
                source,
            })?;
        socket.write_all(format!("{}\n", name).as_bytes()).await?;

        let mut reader = BufReader::with_capacity(UPSTREAM_READ_BUFFER, socket);
        let name = name.to_string();
        let lines = try_stream! {
            let mut buf = Vec::new();
            loop {
                match read_line(&mut reader, &mut buf, MAX_LINE_BYTES).await? {
                    LineRead::Eof => break,
                    LineRead::TooLong => {
                        warn!(stream = %name, limit = MAX_LINE_BYTES, "skipping oversized upstream line");
                    }
                    LineRead::Line => match std::str::from_utf8(&buf) {
                        Ok(line) => {
                            yield line.to_string();
                        }
                        Err(e) => warn!(stream = %name, error = %e, "skipping non-utf8 upstream line"),
                    },
                }
            }
        };
        Ok(Box::pin(lines))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    /// `buf` holds one line without its terminator.
    Line,
    /// The line exceeded the limit and was discarded up to its newline.
    TooLong,
    Eof,
}

/// Reads one newline-terminated line into `buf`, never buffering more than
/// `limit` bytes of it.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let read = (&mut *reader)
        .take(limit as u64 + 1)
        .read_until(b'\n', buf)
        .await?;
    if read == 0 {
        return Ok(LineRead::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        return Ok(LineRead::Line);
    }
    if buf.len() <= limit {
        // Final line without a terminator.
        return Ok(LineRead::Line);
    }

    buf.clear();
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            break;
        }
        match chunk.iter().position(|&b| b == b'\n') {
            Some(end) => {
                reader.consume(end + 1);
                break;
            }
            None => {
                let len = chunk.len();
                reader.consume(len);
            }
        }
    }
    Ok(LineRead::TooLong)
}

/// Snapshot of an actor's registry and counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// High-water number of slots ever allocated
    pub slots: usize,
    /// Slots currently holding a subscriber
    pub occupied: usize,
    /// Whether an upstream connection is open
    pub streaming: bool,
    pub connections_opened: u64,
    pub delivered: u64,
    pub dropped: u64,
}

struct Granted {
    slot: usize,
    id: u64,
    records: mpsc::Receiver<Record>,
}

enum Request {
    Subscribe {
        capacity: usize,
        reply: oneshot::Sender<Result<Granted, StreamError>>,
    },
    Unsubscribe {
        slot: usize,
        id: u64,
    },
    Lookup {
        key: String,
        reply: oneshot::Sender<Option<Record>>,
    },
    Stats {
        reply: oneshot::Sender<StreamStats>,
    },
}

/// Cloneable handle to a running stream actor.
#[derive(Clone)]
pub struct StreamHandle {
    name: Arc<str>,
    // Unbounded so that `Subscription::drop` can always enqueue its unsubscribe.
    requests: mpsc::UnboundedSender<Request>,
}

impl StreamHandle {
    /// Starts an idle actor for the logical stream `name`.
    pub fn spawn(name: &str, upstream: Arc<dyn Upstream>, cache: &CacheConfig) -> Self {
        let (requests, inbox) = mpsc::unbounded_channel();
        let actor = StreamActor {
            name: Arc::from(name),
            upstream,
            inbox,
            slots: Vec::new(),
            lines: None,
            next_id: 0,
            cache: RecentCache::new(cache.key.clone(), cache.capacity),
            stats: StreamStats::default(),
        };
        tokio::spawn(actor.run());
        Self {
            name: Arc::from(name),
            requests,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a subscriber whose queue holds at most `capacity` records.
    pub async fn subscribe(&self, capacity: usize) -> Result<Subscription, StreamError> {
        let (reply, granted) = oneshot::channel();
        self.send(Request::Subscribe { capacity, reply })?;
        let granted = granted.await.map_err(|_| self.gone())??;
        Ok(Subscription {
            slot: granted.slot,
            id: granted.id,
            records: granted.records,
            handle: self.clone(),
        })
    }

    /// Fetches a recently seen record by its cache key.
    pub async fn lookup(&self, key: &str) -> Result<Option<Record>, StreamError> {
        let (reply, found) = oneshot::channel();
        self.send(Request::Lookup {
            key: key.to_string(),
            reply,
        })?;
        found.await.map_err(|_| self.gone())
    }

    pub async fn stats(&self) -> Result<StreamStats, StreamError> {
        let (reply, stats) = oneshot::channel();
        self.send(Request::Stats { reply })?;
        stats.await.map_err(|_| self.gone())
    }

    fn send(&self, request: Request) -> Result<(), StreamError> {
        self.requests.send(request).map_err(|_| self.gone())
    }

    fn gone(&self) -> StreamError {
        StreamError::ActorGone(self.name.to_string())
    }
}

/// A live registration with a stream actor. Dropping it unsubscribes.
pub struct Subscription {
    slot: usize,
    id: u64,
    records: mpsc::Receiver<Record>,
    handle: StreamHandle,
}

impl Subscription {
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Waits for the next record. `None` once the actor has released this
    /// subscription (upstream ended) or stopped.
    pub async fn recv(&mut self) -> Option<Record> {
        self.records.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Record, TryRecvError> {
        self.records.try_recv()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // The actor may already be gone; nothing left to release then.
        let _ = self.handle.requests.send(Request::Unsubscribe {
            slot: self.slot,
            id: self.id,
        });
    }
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<Record>,
}

struct StreamActor {
    name: Arc<str>,
    upstream: Arc<dyn Upstream>,
    inbox: mpsc::UnboundedReceiver<Request>,
    slots: Vec<Option<Subscriber>>,
    lines: Option<LineStream>,
    next_id: u64,
    cache: RecentCache,
    stats: StreamStats,
}

impl StreamActor {
    async fn run(mut self) {
        debug!(stream = %self.name, "stream actor started");
        loop {
            tokio::select! {
                request = self.inbox.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
                line = next_line(&mut self.lines), if self.lines.is_some() => self.on_line(line),
            }
        }
        debug!(stream = %self.name, "stream actor stopped");
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Subscribe { capacity, reply } => {
                let granted = self.subscribe(capacity).await;
                if let Err(Ok(granted)) = reply.send(granted) {
                    // Requester went away before the reply arrived.
                    self.unsubscribe(granted.slot, granted.id);
                }
            }
            Request::Unsubscribe { slot, id } => self.unsubscribe(slot, id),
            Request::Lookup { key, reply } => {
                let _ = reply.send(self.cache.get(&key));
            }
            Request::Stats { reply } => {
                let mut stats = self.stats.clone();
                stats.slots = self.slots.len();
                stats.occupied = self.slots.iter().filter(|s| s.is_some()).count();
                stats.streaming = self.lines.is_some();
                let _ = reply.send(stats);
            }
        }
    }

    async fn subscribe(&mut self, capacity: usize) -> Result<Granted, StreamError> {
        if self.lines.is_none() {
            match self.upstream.connect(&self.name).await {
                Ok(lines) => {
                    self.lines = Some(lines);
                    self.stats.connections_opened += 1;
                    info!(stream = %self.name, "opened upstream connection");
                }
                Err(e) => {
                    error!(stream = %self.name, error = %e, "failed to open upstream connection");
                    return Err(e);
                }
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        let (sender, records) = mpsc::channel(capacity.max(1));
        let subscriber = Some(Subscriber { id, sender });
        let slot = match self.slots.iter().position(Option::is_none) {
            Some(free) => {
                self.slots[free] = subscriber;
                free
            }
            None => {
                self.slots.push(subscriber);
                self.slots.len() - 1
            }
        };
        info!(stream = %self.name, slot, "added subscriber");
        Ok(Granted { slot, id, records })
    }

    fn unsubscribe(&mut self, slot: usize, id: u64) {
        match self.slots.get_mut(slot) {
            Some(entry) if entry.as_ref().map(|s| s.id) == Some(id) => {
                *entry = None;
                info!(stream = %self.name, slot, "dropped subscriber");
            }
            // Already released, e.g. after the upstream ended.
            _ => debug!(stream = %self.name, slot, "unsubscribe for a vacated slot"),
        }
    }

    fn on_line(&mut self, line: Option<std::io::Result<String>>) {
        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                error!(stream = %self.name, error = %e, "upstream read failed");
                self.release_all();
                return;
            }
            None => {
                info!(stream = %self.name, "upstream closed the connection");
                self.release_all();
                return;
            }
        };

        if self.slots.iter().all(Option::is_none) {
            self.close_idle();
            return;
        }
        if line.trim().is_empty() {
            return;
        }
        let record: Record = match serde_json::from_str::<Value>(&line) {
            Ok(value) => Arc::new(value),
            Err(e) => {
                warn!(stream = %self.name, error = %e, line = %line, "skipping undecodable line");
                return;
            }
        };

        self.cache.insert(&record);
        self.deliver(record);
    }

    fn deliver(&mut self, record: Record) {
        let mut occupied = 0;
        for (slot, entry) in self.slots.iter_mut().enumerate() {
            let Some(subscriber) = entry else {
                continue;
            };
            occupied += 1;
            let sent = subscriber.sender.try_send(Record::clone(&record));
            match sent {
                Ok(()) => self.stats.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.stats.dropped += 1;
                    warn!(stream = %self.name, slot, "subscriber queue full, dropping record");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(stream = %self.name, slot, "subscriber queue closed");
                    *entry = None;
                }
            }
        }

        if occupied == 0 {
            self.close_idle();
        }
    }

    fn close_idle(&mut self) {
        info!(stream = %self.name, "no subscribers left, closing upstream connection");
        self.lines = None;
    }

    /// Closes the upstream and releases every subscriber, whose queues then
    /// report end of stream.
    fn release_all(&mut self) {
        self.lines = None;
        for entry in self.slots.iter_mut() {
            *entry = None;
        }
    }
}

async fn next_line(lines: &mut Option<LineStream>) -> Option<std::io::Result<String>> {
    match lines {
        Some(lines) => lines.next().await,
        None => std::future::pending().await,
    }
}
