//! Channel/socket fan-out over the Redis pub/sub link.
//!
//! The manager owns two chained hashtables sharing the interner in
//! [`crate::pool`]: `channels` maps a canonical channel name to the sockets
//! subscribed to it, `sockets` maps a socket to the canonical names it is
//! subscribed to. Every public operation leaves the two mutually
//! consistent: `C in sockets[S]` if and only if `S in channels[C]`.
//!
//! Subscribes commit locally only when the Redis reply comes back through
//! [`PubSubManager::commit_subscribe`]; unsubscribes commit locally at call
//! time, because local presence is the authority for fan-out. Each live
//! (channel, socket) registration holds two pool references, one per table.
//!
//! Everything here runs on the single-threaded event loop and is therefore
//! unsynchronized. A port to a threaded runtime must wrap the manager (and
//! the connection registry) in a mutex or shard it by socket.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::envelope::Envelope;
use crate::errors::GatewayError;
use crate::frame::OpCode;
use crate::pool::{bucket_of, StringPool, NBUCKETS};

/// Identity of one client socket for table bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Cheap handle to a connection's outbound frame queue.
///
/// The fan-out table stores these instead of touching the connection
/// registry, so a broadcast needs no lookup beyond its own chain.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    id: SocketId,
    frames: mpsc::Sender<(OpCode, Bytes)>,
    shutdown: CancellationToken,
}

impl SocketHandle {
    pub fn new(
        id: SocketId,
        frames: mpsc::Sender<(OpCode, Bytes)>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            frames,
            shutdown,
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Queue one frame. A full queue means the peer is not draining its
    /// socket; the connection is marked for shutdown rather than letting
    /// the backlog grow without bound.
    pub fn send(&self, opcode: OpCode, payload: Bytes) {
        match self.frames.try_send((opcode, payload)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(socket = %self.id, "output backlog over high-water mark, shutting down");
                self.shutdown.cancel();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Connected/disconnected flags for the two Redis connections, shared
/// between the manager and the link tasks.
#[derive(Debug, Default)]
pub struct LinkState {
    pub_up: Cell<bool>,
    sub_up: Cell<bool>,
}

impl LinkState {
    pub fn set_pub(&self, up: bool) {
        self.pub_up.set(up);
    }

    pub fn set_sub(&self, up: bool) {
        self.sub_up.set(up);
    }

    pub fn pub_is_connected(&self) -> bool {
        self.pub_up.get()
    }

    pub fn sub_is_connected(&self) -> bool {
        self.sub_up.get()
    }
}

/// Work for the PUBLISH connection.
#[derive(Debug, PartialEq, Eq)]
pub enum PubCommand {
    Publish { channel: String, payload: Vec<u8> },
}

/// Work for the SUBSCRIBE connection.
#[derive(Debug)]
pub enum SubCommand {
    Subscribe {
        channel: String,
        socket: SocketHandle,
    },
    Unsubscribe {
        channel: String,
    },
}

/// The manager's outbound interface: one command channel per Redis
/// connection plus the shared connected flags.
#[derive(Debug)]
pub struct RedisLinks {
    pub pub_tx: mpsc::UnboundedSender<PubCommand>,
    pub sub_tx: mpsc::UnboundedSender<SubCommand>,
    pub state: Rc<LinkState>,
}

#[derive(Debug)]
struct ChannelEntry {
    name: Rc<str>,
    subscribers: Vec<SocketHandle>,
}

#[derive(Debug)]
struct SocketEntry {
    socket: SocketId,
    channels: Vec<Rc<str>>,
}

fn socket_bucket(socket: SocketId) -> usize {
    (socket.0 % NBUCKETS as u64) as usize
}

/// The fan-out manager.
#[derive(Debug)]
pub struct PubSubManager {
    pool: StringPool,
    channels: Vec<Vec<ChannelEntry>>,
    sockets: Vec<Vec<SocketEntry>>,
    /// Subscribes sent to Redis whose reply has not come back yet. Checked
    /// alongside the committed tables so a client hammering `sub` cannot
    /// trigger a second `SUBSCRIBE` while the first is in flight.
    pending: Vec<(String, SocketId)>,
    links: RedisLinks,
}

impl PubSubManager {
    pub fn new(links: RedisLinks) -> Self {
        let mut channels = Vec::with_capacity(NBUCKETS);
        channels.resize_with(NBUCKETS, Vec::new);
        let mut sockets = Vec::with_capacity(NBUCKETS);
        sockets.resize_with(NBUCKETS, Vec::new);
        Self {
            pool: StringPool::new(),
            channels,
            sockets,
            pending: Vec::new(),
            links,
        }
    }

    pub fn link_state(&self) -> &LinkState {
        &self.links.state
    }

    /// Fire-and-forget `PUBLISH channel payload`. Local state is never
    /// touched; the message comes back through the subscription connection
    /// like any other.
    pub fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), GatewayError> {
        if !self.links.state.pub_is_connected() {
            return Err(GatewayError::Disconnected);
        }
        self.links
            .pub_tx
            .send(PubCommand::Publish {
                channel: channel.to_owned(),
                payload: payload.to_vec(),
            })
            .map_err(|_| GatewayError::Disconnected)
    }

    /// Ask Redis to subscribe `socket` to `channel`.
    ///
    /// Idempotent: a socket already subscribed (or with a subscribe in
    /// flight) gets `Ok` without a second `SUBSCRIBE` being issued. The
    /// tables are not touched here; they commit on the Redis reply via
    /// [`commit_subscribe`](Self::commit_subscribe).
    pub fn subscribe(&mut self, channel: &str, socket: &SocketHandle) -> Result<(), GatewayError> {
        if !self.links.state.sub_is_connected() {
            return Err(GatewayError::Disconnected);
        }
        if self.is_subscribed(channel, socket.id()) || self.is_pending(channel, socket.id()) {
            debug!(socket = %socket.id(), channel, "not re-subscribing");
            return Ok(());
        }
        debug!(socket = %socket.id(), channel, "subscribing");
        self.pending.push((channel.to_owned(), socket.id()));
        self.links
            .sub_tx
            .send(SubCommand::Subscribe {
                channel: channel.to_owned(),
                socket: socket.clone(),
            })
            .map_err(|_| GatewayError::Disconnected)
    }

    /// Commit a subscription once Redis has confirmed it.
    ///
    /// If the pending record is gone the client unsubscribed while the
    /// reply was in flight; the confirmation is dropped and, when nobody
    /// else holds the channel, Redis is told to let it go again.
    pub fn commit_subscribe(&mut self, channel: &str, socket: SocketHandle) {
        let was_pending = self.take_pending(channel, socket.id());
        if !was_pending || self.is_subscribed(channel, socket.id()) {
            if !was_pending && !self.channel_is_live(channel) {
                let _ = self.links.sub_tx.send(SubCommand::Unsubscribe {
                    channel: channel.to_owned(),
                });
            }
            return;
        }

        // Both tables hold their own pool reference to the channel name,
        // which is what makes the refcount twice the live registrations.
        let name_for_channel_table = self.pool.acquire(channel);
        let name_for_socket_table = self.pool.acquire(channel);

        let bucket = &mut self.channels[bucket_of(channel.as_bytes())];
        match bucket.iter_mut().find(|e| &*e.name == channel) {
            Some(entry) => entry.subscribers.push(socket.clone()),
            None => bucket.push(ChannelEntry {
                name: name_for_channel_table,
                subscribers: vec![socket.clone()],
            }),
        }

        let bucket = &mut self.sockets[socket_bucket(socket.id())];
        match bucket.iter_mut().find(|e| e.socket == socket.id()) {
            Some(entry) => entry.channels.push(name_for_socket_table),
            None => bucket.push(SocketEntry {
                socket: socket.id(),
                channels: vec![name_for_socket_table],
            }),
        }
    }

    /// A subscribe was sent but Redis failed it; forget the pending record.
    pub fn abort_subscribe(&mut self, channel: &str, socket: SocketId) {
        self.take_pending(channel, socket);
    }

    /// Fan one Redis message out to every subscriber of `channel`, in
    /// subscription order.
    pub fn dispatch_message(&self, channel: &str, payload: &[u8]) {
        let bucket = &self.channels[bucket_of(channel.as_bytes())];
        let Some(entry) = bucket.iter().find(|e| &*e.name == channel) else {
            return;
        };
        let data = String::from_utf8_lossy(payload);
        let json = Bytes::from(
            Envelope {
                key: channel,
                data: &data,
            }
            .to_json(),
        );
        for socket in &entry.subscribers {
            debug!(socket = %socket.id(), channel, "fan-out");
            socket.send(OpCode::Text, json.clone());
        }
    }

    /// Drop one (channel, socket) registration.
    ///
    /// Local state is updated eagerly; `UNSUBSCRIBE` is issued only when
    /// the last subscriber of the channel goes.
    pub fn unsubscribe(&mut self, channel: &str, socket: SocketId) -> Result<(), GatewayError> {
        if !self.links.state.sub_is_connected() {
            return Err(GatewayError::Disconnected);
        }
        self.take_pending(channel, socket);

        let bucket = &mut self.sockets[socket_bucket(socket)];
        let Some(entry_pos) = bucket.iter().position(|e| e.socket == socket) else {
            return Ok(());
        };
        let entry = &mut bucket[entry_pos];
        let Some(chan_pos) = entry.channels.iter().position(|c| &**c == channel) else {
            return Ok(());
        };
        let canonical = entry.channels.remove(chan_pos);
        if entry.channels.is_empty() {
            bucket.swap_remove(entry_pos);
        }
        self.remove_socket_from_channel(channel, socket);
        self.pool.release(&canonical);
        Ok(())
    }

    /// Drop every registration of `socket`; used by connection teardown.
    pub fn unsubscribe_all(&mut self, socket: SocketId) -> Result<(), GatewayError> {
        if !self.links.state.sub_is_connected() {
            return Err(GatewayError::Disconnected);
        }
        self.pending.retain(|(_, s)| *s != socket);

        let bucket = &mut self.sockets[socket_bucket(socket)];
        let Some(entry_pos) = bucket.iter().position(|e| e.socket == socket) else {
            return Ok(());
        };
        let entry = bucket.swap_remove(entry_pos);
        for canonical in entry.channels {
            self.remove_socket_from_channel(&canonical, socket);
            self.pool.release(&canonical);
        }
        Ok(())
    }

    /// Channels with at least one committed subscriber, for resubscription
    /// after the Redis link drops and comes back.
    pub fn live_channels(&self) -> Vec<String> {
        self.channels
            .iter()
            .flatten()
            .map(|e| e.name.to_string())
            .collect()
    }

    fn remove_socket_from_channel(&mut self, channel: &str, socket: SocketId) {
        let bucket = &mut self.channels[bucket_of(channel.as_bytes())];
        let Some(pos) = bucket.iter().position(|e| &*e.name == channel) else {
            // The socket table said this pair existed; the channel table
            // must agree or the two have diverged.
            debug_assert!(false, "fan-out tables out of sync for channel {channel:?}");
            error!(channel, socket = %socket, "fan-out tables out of sync");
            return;
        };
        let entry = &mut bucket[pos];
        if let Some(i) = entry.subscribers.iter().position(|s| s.id() == socket) {
            entry.subscribers.remove(i);
        }
        let emptied = entry.subscribers.is_empty();
        let canonical = entry.name.clone();
        if emptied {
            bucket.swap_remove(pos);
        }
        self.pool.release(&canonical);
        if emptied {
            debug!(channel, "last subscriber gone, unsubscribing");
            let _ = self.links.sub_tx.send(SubCommand::Unsubscribe {
                channel: channel.to_owned(),
            });
        }
    }

    fn is_subscribed(&self, channel: &str, socket: SocketId) -> bool {
        self.sockets[socket_bucket(socket)]
            .iter()
            .find(|e| e.socket == socket)
            .is_some_and(|e| e.channels.iter().any(|c| &**c == channel))
    }

    fn is_pending(&self, channel: &str, socket: SocketId) -> bool {
        self.pending
            .iter()
            .any(|(c, s)| c == channel && *s == socket)
    }

    fn take_pending(&mut self, channel: &str, socket: SocketId) -> bool {
        let before = self.pending.len();
        self.pending
            .retain(|(c, s)| !(c == channel && *s == socket));
        self.pending.len() != before
    }

    fn channel_is_live(&self, channel: &str) -> bool {
        self.channels[bucket_of(channel.as_bytes())]
            .iter()
            .any(|e| &*e.name == channel)
    }

    /// Sockets subscribed to `channel`, in subscription order.
    pub fn channel_subscribers(&self, channel: &str) -> Vec<SocketId> {
        self.channels[bucket_of(channel.as_bytes())]
            .iter()
            .find(|e| &*e.name == channel)
            .map(|e| e.subscribers.iter().map(SocketHandle::id).collect())
            .unwrap_or_default()
    }

    /// Channels `socket` is subscribed to, in subscription order.
    pub fn socket_channels(&self, socket: SocketId) -> Vec<String> {
        self.sockets[socket_bucket(socket)]
            .iter()
            .find(|e| e.socket == socket)
            .map(|e| e.channels.iter().map(|c| c.to_string()).collect())
            .unwrap_or_default()
    }

    /// Pool refcount for `channel`; each live registration counts twice.
    pub fn pool_refcount(&self, channel: &str) -> usize {
        self.pool.refcount(channel)
    }

    /// Cross-check the two tables against each other; test support.
    pub fn tables_are_consistent(&self) -> bool {
        let channel_pairs: Vec<(String, SocketId)> = self
            .channels
            .iter()
            .flatten()
            .flat_map(|e| {
                e.subscribers
                    .iter()
                    .map(|s| (e.name.to_string(), s.id()))
                    .collect::<Vec<_>>()
            })
            .collect();
        let socket_pairs: Vec<(String, SocketId)> = self
            .sockets
            .iter()
            .flatten()
            .flat_map(|e| {
                e.channels
                    .iter()
                    .map(|c| (c.to_string(), e.socket))
                    .collect::<Vec<_>>()
            })
            .collect();
        channel_pairs.len() == socket_pairs.len()
            && channel_pairs
                .iter()
                .all(|pair| socket_pairs.contains(pair))
    }
}
