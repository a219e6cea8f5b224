//! Room membership and echo-suppressed fan-out.
//!
//! Each document id maps to the set of connections currently editing it.
//! A connection is represented in its room by the sending half of a bounded
//! outbound queue; the connection's own task drains the receiving half into
//! its socket.
//!
//! Membership mutations are short synchronous critical sections under one
//! registry-wide lock. Broadcast copies the member list under the lock and
//! delivers outside it, so a member leaving mid-broadcast never invalidates
//! the iteration. A full queue makes the broadcaster wait for that reader;
//! only a closed queue counts as a failed delivery, and those recipients are
//! evicted after delivery completes.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use uuid::Uuid;

/// One opaque binary message. Cloning shares the underlying buffer.
pub type Frame = tokio_tungstenite::tungstenite::Bytes;

/// Unique identity of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A connection's membership in one room, returned by [`RoomRegistry::join`].
///
/// Frames broadcast by other members arrive on [`RoomHandle::recv`]. When the
/// registry drops the connection and the queue drains, `recv` returns `None`.
#[derive(Debug)]
pub struct RoomHandle {
    connection_id: ConnectionId,
    doc_id: String,
    generation: u64,
    outbound: mpsc::Receiver<Frame>,
}

impl RoomHandle {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Wait for the next frame relayed to this connection.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.outbound.recv().await
    }

    /// Take the next queued frame without waiting.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.outbound.try_recv().ok()
    }
}

/// Point-in-time room and connection totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounts {
    pub rooms: usize,
    pub connections: usize,
}

/// Outcome of a single broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Recipients whose queue accepted the frame
    pub delivered: usize,
    /// Recipients removed from the room because their queue was closed
    pub evicted: usize,
}

/// Lifetime counters for monitoring relay health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub connections_joined: u64,
    pub frames_relayed: u64,
    pub bytes_relayed: u64,
    pub deliveries: u64,
    pub evictions: u64,
}

/// Counters updated outside the registry lock.
#[derive(Default)]
struct AtomicRelayStats {
    connections_joined: AtomicU64,
    frames_relayed: AtomicU64,
    bytes_relayed: AtomicU64,
    deliveries: AtomicU64,
    evictions: AtomicU64,
}

struct Member {
    queue: mpsc::Sender<Frame>,
    generation: u64,
}

#[derive(Default)]
struct Room {
    members: HashMap<ConnectionId, Member>,
}

/// Process-wide map from document id to its connected members.
///
/// Construct one per process and share it as `Arc<RoomRegistry>`.
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Room>>,
    outbound_capacity: usize,
    next_generation: AtomicU64,
    stats: AtomicRelayStats,
}

impl RoomRegistry {
    /// Create an empty registry.
    ///
    /// `outbound_capacity` bounds how many frames may wait for one
    /// connection before broadcasters to it have to wait.
    pub fn new(outbound_capacity: usize) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            outbound_capacity: outbound_capacity.max(1),
            next_generation: AtomicU64::new(0),
            stats: AtomicRelayStats::default(),
        }
    }

    // Every critical section leaves the map consistent, so a poisoned lock
    // still guards valid data.
    fn lock_rooms(&self) -> MutexGuard<'_, HashMap<String, Room>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection to the room for `doc_id`, creating the room if needed.
    ///
    /// Joining again with the same id replaces the previous membership; the
    /// older handle then no longer receives frames, and releasing it with
    /// [`RoomRegistry::release`] leaves the replacement in place.
    pub fn join(&self, doc_id: &str, connection_id: ConnectionId) -> RoomHandle {
        let (queue, outbound) = mpsc::channel(self.outbound_capacity);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let (created, members) = {
            let mut rooms = self.lock_rooms();
            let created = !rooms.contains_key(doc_id);
            let room = rooms.entry(doc_id.to_owned()).or_default();
            room.members
                .insert(connection_id, Member { queue, generation });
            (created, room.members.len())
        };

        self.stats.connections_joined.fetch_add(1, Ordering::Relaxed);
        if created {
            log::info!("Room '{doc_id}' created");
        }
        log::info!("Connection {connection_id} joined '{doc_id}' (total clients: {members})");

        RoomHandle {
            connection_id,
            doc_id: doc_id.to_owned(),
            generation,
            outbound,
        }
    }

    /// Remove a connection from its room, deleting the room once empty.
    ///
    /// Returns whether the connection was a member. Leaving twice, or
    /// leaving a room that does not exist, is a no-op.
    pub fn leave(&self, doc_id: &str, connection_id: ConnectionId) -> bool {
        self.remove_member(doc_id, connection_id, None)
    }

    /// Leave with the membership `handle` was issued for.
    ///
    /// Unlike [`RoomRegistry::leave`], this is a no-op if the id has since
    /// re-joined under a newer handle.
    pub fn release(&self, handle: &RoomHandle) -> bool {
        self.remove_member(&handle.doc_id, handle.connection_id, Some(handle.generation))
    }

    fn remove_member(
        &self,
        doc_id: &str,
        connection_id: ConnectionId,
        generation: Option<u64>,
    ) -> bool {
        let (removed, remaining) = {
            let mut rooms = self.lock_rooms();
            let Some(room) = rooms.get_mut(doc_id) else {
                return false;
            };
            let matches = room.members.get(&connection_id).is_some_and(|member| {
                generation.map_or(true, |generation| member.generation == generation)
            });
            if matches {
                room.members.remove(&connection_id);
            }
            let remaining = room.members.len();
            if remaining == 0 {
                rooms.remove(doc_id);
            }
            (matches, remaining)
        };

        if removed {
            log::info!(
                "Connection {connection_id} left '{doc_id}' (remaining clients: {remaining})"
            );
        }
        if remaining == 0 {
            log::info!("Room '{doc_id}' cleaned up (no active connections)");
        }
        removed
    }

    /// Deliver `payload` to every member of `doc_id` except `sender`.
    ///
    /// Waits while a recipient's queue is full, so a slow reader slows the
    /// sender down instead of losing frames. A missing room is a no-op.
    /// Recipients whose connection is gone are logged and evicted; the rest
    /// still receive the frame and the sender is never told.
    pub async fn broadcast(
        &self,
        doc_id: &str,
        sender: ConnectionId,
        payload: Frame,
    ) -> BroadcastReport {
        let targets: Vec<(ConnectionId, mpsc::Sender<Frame>)> = {
            let rooms = self.lock_rooms();
            let Some(room) = rooms.get(doc_id) else {
                return BroadcastReport::default();
            };
            room.members
                .iter()
                .filter(|(id, _)| **id != sender)
                .map(|(id, member)| (*id, member.queue.clone()))
                .collect()
        };

        self.stats.frames_relayed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_relayed
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();

        for (id, queue) in targets {
            match queue.send(payload.clone()).await {
                Ok(()) => report.delivered += 1,
                Err(_) => {
                    log::warn!("Failed to send to client {id} in '{doc_id}': connection closed");
                    failed.push((id, queue));
                }
            }
        }

        self.stats
            .deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);

        if !failed.is_empty() {
            report.evicted = self.evict(doc_id, &failed);
        }

        log::trace!(
            "Relayed {} bytes from {sender} in '{doc_id}' to {} clients",
            payload.len(),
            report.delivered
        );
        report
    }

    /// Drop members whose delivery failed.
    ///
    /// Only the exact queue that failed is removed, so a connection that
    /// re-joined under the same id in the meantime keeps its membership.
    fn evict(&self, doc_id: &str, failed: &[(ConnectionId, mpsc::Sender<Frame>)]) -> usize {
        let (evicted, emptied) = {
            let mut rooms = self.lock_rooms();
            let Some(room) = rooms.get_mut(doc_id) else {
                return 0;
            };

            let mut evicted = 0;
            for (id, queue) in failed {
                let same = room
                    .members
                    .get(id)
                    .is_some_and(|current| current.queue.same_channel(queue));
                if same {
                    room.members.remove(id);
                    evicted += 1;
                }
            }

            let emptied = room.members.is_empty();
            if emptied {
                rooms.remove(doc_id);
            }
            (evicted, emptied)
        };

        self.stats
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        if evicted > 0 {
            log::warn!("Evicted {evicted} unreachable clients from '{doc_id}'");
        }
        if emptied {
            log::info!("Room '{doc_id}' cleaned up (no active connections)");
        }
        evicted
    }

    /// Room count and total connection count, taken under one lock.
    pub fn snapshot_counts(&self) -> RegistryCounts {
        let rooms = self.lock_rooms();
        RegistryCounts {
            rooms: rooms.len(),
            connections: rooms.values().map(|room| room.members.len()).sum(),
        }
    }

    /// Number of connections in `doc_id` (0 if the room does not exist).
    pub fn member_count(&self, doc_id: &str) -> usize {
        self.lock_rooms()
            .get(doc_id)
            .map_or(0, |room| room.members.len())
    }

    /// Ids of the connections currently in `doc_id`.
    pub fn members(&self, doc_id: &str) -> Vec<ConnectionId> {
        self.lock_rooms()
            .get(doc_id)
            .map(|room| room.members.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Whether a room currently exists for `doc_id`.
    pub fn contains_room(&self, doc_id: &str) -> bool {
        self.lock_rooms().contains_key(doc_id)
    }

    /// Get all active document ids.
    pub fn active_documents(&self) -> Vec<String> {
        self.lock_rooms().keys().cloned().collect()
    }

    /// Lifetime counters (lock-free snapshot).
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            connections_joined: self.stats.connections_joined.load(Ordering::Relaxed),
            frames_relayed: self.stats.frames_relayed.load(Ordering::Relaxed),
            bytes_relayed: self.stats.bytes_relayed.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }

    /// Configured per-connection queue length.
    pub fn outbound_capacity(&self) -> usize {
        self.outbound_capacity
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(256)
    }
}
