//! Connection hub: the single owner of the live connection set
//!
//! This module handles everything that touches membership, including:
//! - Registration and idempotent removal of connections
//! - Fan-out of every broadcast to each member's outbound queue
//! - Backpressure eviction of members whose queue is full
//! - Statistics snapshots answered from inside the control loop
//!
//! The membership set is owned by [`Hub::run`] and nothing else. Other tasks
//! reach it only by sending events through a [`HubHandle`], and the control
//! loop applies those events one at a time, so no lock is needed.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};

/// Process-unique identity of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates an id never handed out before in this process
    pub fn allocate() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Errors returned by [`HubHandle`] operations
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HubError {
    #[error("hub control loop is not running")]
    Stopped,
}

/// The hub's side of a connection: its id, the producer end of its
/// outbound queue and the token that closes the connection
///
/// A member can only be created together with its queue and is consumed by
/// [`HubHandle::register`], so a connection that has been removed can never
/// be registered again.
#[derive(Debug)]
pub struct Member<M> {
    id: ConnectionId,
    outbound: mpsc::Sender<M>,
    closed: CancellationToken,
}

impl<M> Member<M> {
    /// Creates a member with a fresh id and a bounded outbound queue.
    ///
    /// The returned receiver is the consumer end that the connection's
    /// writer drains. It yields `None` once the hub drops the member.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<M>) {
        let (outbound, receiver) = mpsc::channel(capacity);
        let member = Self {
            id: ConnectionId::allocate(),
            outbound,
            closed: CancellationToken::new(),
        };
        (member, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Token cancelled as soon as the hub removes this member
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// A registered member as stored in the membership set
///
/// Removing the entry drops both fields: the queue closes and the
/// connection's close token fires, so its duties stop without draining.
struct Slot<M> {
    outbound: mpsc::Sender<M>,
    _closed: DropGuard,
}

/// Tunables for the hub control loop
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Slots in each event conduit before submitters wait
    pub event_capacity: usize,
    /// Whether a broadcast is also delivered back to the connection that sent it
    pub echo_to_sender: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            event_capacity: shared::EVENT_QUEUE_CAPACITY,
            echo_to_sender: true,
        }
    }
}

/// Point-in-time view of the hub, taken inside the control loop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Number of registered connections
    pub connections: usize,
    /// Ids of registered connections in ascending order
    pub members: Vec<ConnectionId>,
    /// Broadcast events processed since start
    pub broadcasts: u64,
    /// Messages successfully enqueued onto outbound queues
    pub deliveries: u64,
    /// Connections removed because their outbound queue was full
    pub evictions: u64,
}

/// Outcome of a single fan-out
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FanOut {
    /// Members whose queue accepted the message
    pub delivered: usize,
    /// Members evicted because their queue was full
    pub evicted: Vec<ConnectionId>,
    /// Members dropped because their writer had already gone away
    pub closed: Vec<ConnectionId>,
}

/// Membership bookkeeping applied by the control loop
///
/// Every method runs to completion without awaiting, which is what lets the
/// control loop treat each event as one atomic step.
pub struct Membership<M> {
    members: HashMap<ConnectionId, Slot<M>>,
    broadcasts: u64,
    deliveries: u64,
    evictions: u64,
}

impl<M: Clone> Membership<M> {
    pub fn new() -> Self {
        Self {
            members: HashMap::new(),
            broadcasts: 0,
            deliveries: 0,
            evictions: 0,
        }
    }

    /// Inserts a member. Returns false if the id is already present.
    pub fn join(&mut self, member: Member<M>) -> bool {
        match self.members.entry(member.id) {
            Entry::Occupied(_) => {
                warn!("Connection {} is already registered", member.id);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(Slot {
                    outbound: member.outbound,
                    _closed: member.closed.drop_guard(),
                });
                true
            }
        }
    }

    /// Removes a member and closes its outbound queue
    ///
    /// Returns true if the connection was registered, false if it was already
    /// gone. Removing an absent connection is a no-op, which makes it safe for
    /// the reader and a backpressure eviction to both request removal.
    pub fn leave(&mut self, id: ConnectionId) -> bool {
        // Dropping the slot closes the queue and fires the close token
        self.members.remove(&id).is_some()
    }

    /// Offers `payload` to every member without waiting
    ///
    /// Members whose queue is full are evicted on the spot and the fan-out
    /// carries on with the rest. `skip` excludes one member, used to suppress
    /// echoing a message back to its sender.
    pub fn fan_out(&mut self, payload: &M, skip: Option<ConnectionId>) -> FanOut {
        let mut report = FanOut::default();

        self.members.retain(|id, slot| {
            if Some(*id) == skip {
                return true;
            }
            match slot.outbound.try_send(payload.clone()) {
                Ok(()) => {
                    report.delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    report.evicted.push(*id);
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    report.closed.push(*id);
                    false
                }
            }
        });

        self.broadcasts += 1;
        self.deliveries += report.delivered as u64;
        self.evictions += report.evicted.len() as u64;
        report
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn stats(&self) -> HubStats {
        let mut members: Vec<ConnectionId> = self.members.keys().copied().collect();
        members.sort_unstable();
        HubStats {
            connections: members.len(),
            members,
            broadcasts: self.broadcasts,
            deliveries: self.deliveries,
            evictions: self.evictions,
        }
    }
}

impl<M: Clone> Default for Membership<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// A payload submitted for fan-out together with the connection that sent it
#[derive(Debug)]
struct Broadcast<M> {
    origin: ConnectionId,
    payload: M,
}

/// Cloneable entry point to a running hub
///
/// All operations are fire-and-forget: they return once the event has been
/// queued for the control loop, and wait only while the conduit is full.
#[derive(Debug)]
pub struct HubHandle<M> {
    join_tx: mpsc::Sender<Member<M>>,
    leave_tx: mpsc::Sender<ConnectionId>,
    broadcast_tx: mpsc::Sender<Broadcast<M>>,
    query_tx: mpsc::Sender<oneshot::Sender<HubStats>>,
}

impl<M> Clone for HubHandle<M> {
    fn clone(&self) -> Self {
        Self {
            join_tx: self.join_tx.clone(),
            leave_tx: self.leave_tx.clone(),
            broadcast_tx: self.broadcast_tx.clone(),
            query_tx: self.query_tx.clone(),
        }
    }
}

impl<M> HubHandle<M> {
    /// Submits a join event
    pub async fn register(&self, member: Member<M>) -> Result<(), HubError> {
        self.join_tx
            .send(member)
            .await
            .map_err(|_| HubError::Stopped)
    }

    /// Submits a leave event. Unregistering twice is harmless.
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubError> {
        self.leave_tx.send(id).await.map_err(|_| HubError::Stopped)
    }

    /// Submits a broadcast event on behalf of `origin`
    pub async fn broadcast(&self, origin: ConnectionId, payload: M) -> Result<(), HubError> {
        self.broadcast_tx
            .send(Broadcast { origin, payload })
            .await
            .map_err(|_| HubError::Stopped)
    }

    /// Asks the control loop for a statistics snapshot
    ///
    /// The snapshot reflects every join, leave and broadcast that was queued
    /// before this call.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.query_tx
            .send(reply_tx)
            .await
            .map_err(|_| HubError::Stopped)?;
        reply_rx.await.map_err(|_| HubError::Stopped)
    }
}

/// The hub control loop and the state only it may touch
pub struct Hub<M> {
    membership: Membership<M>,
    echo_to_sender: bool,
    join_rx: mpsc::Receiver<Member<M>>,
    leave_rx: mpsc::Receiver<ConnectionId>,
    broadcast_rx: mpsc::Receiver<Broadcast<M>>,
    query_rx: mpsc::Receiver<oneshot::Sender<HubStats>>,
}

impl<M: Clone + Send + 'static> Hub<M> {
    /// Creates an idle hub and the handle used to reach it
    ///
    /// Nothing is processed until [`Hub::run`] is spawned. The loop exits once
    /// every clone of the handle has been dropped.
    pub fn new(config: HubConfig) -> (Self, HubHandle<M>) {
        let capacity = config.event_capacity.max(1);
        let (join_tx, join_rx) = mpsc::channel(capacity);
        let (leave_tx, leave_rx) = mpsc::channel(capacity);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(capacity);
        let (query_tx, query_rx) = mpsc::channel(capacity);

        let hub = Self {
            membership: Membership::new(),
            echo_to_sender: config.echo_to_sender,
            join_rx,
            leave_rx,
            broadcast_rx,
            query_rx,
        };
        let handle = HubHandle {
            join_tx,
            leave_tx,
            broadcast_tx,
            query_tx,
        };
        (hub, handle)
    }

    /// Runs the control loop
    ///
    /// Conduits are polled in a fixed order (joins, leaves, broadcasts,
    /// queries). A connection queues its join before it can read anything,
    /// so its join is always applied before its own broadcasts or removal.
    pub async fn run(mut self) {
        info!(
            "Hub control loop started (echo to sender: {})",
            self.echo_to_sender
        );

        loop {
            tokio::select! {
                biased;
                Some(member) = self.join_rx.recv() => self.handle_join(member),
                Some(id) = self.leave_rx.recv() => self.handle_leave(id),
                Some(event) = self.broadcast_rx.recv() => self.handle_broadcast(event),
                Some(reply) = self.query_rx.recv() => {
                    // The requester may have given up waiting
                    let _ = reply.send(self.membership.stats());
                }
                else => break,
            }
        }

        info!(
            "Hub control loop stopped with {} connections",
            self.membership.len()
        );
    }

    fn handle_join(&mut self, member: Member<M>) {
        let id = member.id();
        if self.membership.join(member) {
            info!(
                "Connection {} joined ({} connected)",
                id,
                self.membership.len()
            );
        }
    }

    fn handle_leave(&mut self, id: ConnectionId) {
        if self.membership.leave(id) {
            info!(
                "Connection {} left ({} connected)",
                id,
                self.membership.len()
            );
        } else {
            debug!("Connection {} already removed", id);
        }
    }

    fn handle_broadcast(&mut self, event: Broadcast<M>) {
        let skip = (!self.echo_to_sender).then_some(event.origin);
        let report = self.membership.fan_out(&event.payload, skip);

        debug!(
            "Broadcast from {} delivered to {} connections",
            event.origin, report.delivered
        );
        for id in &report.evicted {
            warn!("Evicted connection {}: outbound queue full", id);
        }
        for id in &report.closed {
            debug!("Dropped connection {}: writer already gone", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio_test::assert_ok;

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut received = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            received.push(msg);
        }
        received
    }

    fn spawn_hub(config: HubConfig) -> HubHandle<String> {
        let (hub, handle) = Hub::new(config);
        tokio::spawn(hub.run());
        handle
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::allocate();
        let b = ConnectionId::allocate();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
        assert_eq!(format!("{}", a), format!("#{}", a.as_u64()));
    }

    #[test]
    fn test_join_and_leave() {
        let mut membership = Membership::<String>::new();
        let (member, _rx) = Member::channel(4);
        let id = member.id();

        assert!(membership.join(member));
        assert!(membership.contains(id));
        assert_eq!(membership.len(), 1);

        assert!(membership.leave(id));
        assert!(!membership.contains(id));
        assert!(membership.is_empty());
    }

    #[test]
    fn test_leave_is_idempotent() {
        let mut membership = Membership::<String>::new();
        let (member, _rx) = Member::channel(4);
        let id = member.id();
        membership.join(member);

        assert!(membership.leave(id));
        assert!(!membership.leave(id));
        assert!(!membership.leave(ConnectionId::allocate()));
        assert!(membership.is_empty());
    }

    #[test]
    fn test_leave_closes_outbound_queue() {
        let mut membership = Membership::<String>::new();
        let (member, mut rx) = Member::channel(4);
        let id = member.id();
        membership.join(member);

        membership.fan_out(&"last".to_string(), None);
        membership.leave(id);

        assert_eq!(rx.try_recv(), Ok("last".to_string()));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[test]
    fn test_leave_fires_close_token() {
        let mut membership = Membership::<String>::new();
        let (member, _rx) = Member::channel(4);
        let id = member.id();
        let closed = member.close_token();
        membership.join(member);
        assert!(!closed.is_cancelled());

        membership.leave(id);
        assert!(closed.is_cancelled());
    }

    #[test]
    fn test_eviction_fires_close_token() {
        let mut membership = Membership::<String>::new();
        let (slow, _slow_rx) = Member::channel(1);
        let (fast, _fast_rx) = Member::channel(8);
        let slow_closed = slow.close_token();
        let fast_closed = fast.close_token();
        membership.join(slow);
        membership.join(fast);

        membership.fan_out(&"1".to_string(), None);
        assert!(!slow_closed.is_cancelled());
        membership.fan_out(&"2".to_string(), None);

        assert!(slow_closed.is_cancelled());
        assert!(!fast_closed.is_cancelled());
    }

    #[test]
    fn test_fan_out_reaches_every_member_once() {
        let mut membership = Membership::<String>::new();
        let mut receivers = Vec::new();
        for _ in 0..5 {
            let (member, rx) = Member::channel(8);
            membership.join(member);
            receivers.push(rx);
        }

        let report = membership.fan_out(&"hello".to_string(), None);
        assert_eq!(report.delivered, 5);
        assert!(report.evicted.is_empty());

        for rx in receivers.iter_mut() {
            assert_eq!(drain(rx), vec!["hello".to_string()]);
        }
    }

    #[test]
    fn test_fan_out_skips_origin() {
        let mut membership = Membership::<String>::new();
        let (origin, mut origin_rx) = Member::channel(8);
        let (other, mut other_rx) = Member::channel(8);
        let origin_id = origin.id();
        membership.join(origin);
        membership.join(other);

        let report = membership.fan_out(&"x".to_string(), Some(origin_id));
        assert_eq!(report.delivered, 1);
        assert!(drain(&mut origin_rx).is_empty());
        assert_eq!(drain(&mut other_rx), vec!["x".to_string()]);
        assert!(membership.contains(origin_id));
    }

    #[test]
    fn test_full_queue_is_evicted() {
        let mut membership = Membership::<String>::new();
        let (slow, mut slow_rx) = Member::channel(2);
        let (fast, mut fast_rx) = Member::channel(16);
        let slow_id = slow.id();
        let fast_id = fast.id();
        membership.join(slow);
        membership.join(fast);

        membership.fan_out(&"1".to_string(), None);
        membership.fan_out(&"2".to_string(), None);
        let report = membership.fan_out(&"3".to_string(), None);

        assert_eq!(report.evicted, vec![slow_id]);
        assert_eq!(report.delivered, 1);
        assert!(!membership.contains(slow_id));
        assert!(membership.contains(fast_id));

        assert_eq!(drain(&mut slow_rx), vec!["1".to_string(), "2".to_string()]);
        assert_eq!(slow_rx.try_recv(), Err(TryRecvError::Disconnected));
        assert_eq!(drain(&mut fast_rx).len(), 3);

        let stats = membership.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.broadcasts, 3);
        assert_eq!(stats.deliveries, 5);
    }

    #[test]
    fn test_dropped_receiver_is_removed() {
        let mut membership = Membership::<String>::new();
        let (member, rx) = Member::channel(2);
        let id = member.id();
        membership.join(member);
        drop(rx);

        let report = membership.fan_out(&"x".to_string(), None);
        assert_eq!(report.closed, vec![id]);
        assert!(membership.is_empty());
        assert_eq!(membership.stats().evictions, 0);
    }

    #[test]
    fn test_stats_members_sorted() {
        let mut membership = Membership::<String>::new();
        let mut ids = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..4 {
            let (member, rx) = Member::channel(1);
            ids.push(member.id());
            membership.join(member);
            receivers.push(rx);
        }
        ids.sort_unstable();

        let stats = membership.stats();
        assert_eq!(stats.connections, 4);
        assert_eq!(stats.members, ids);
    }

    #[tokio::test]
    async fn test_hub_scenario_broadcast_then_eviction() {
        let hub = spawn_hub(HubConfig::default());

        let (a, mut a_rx) = Member::channel(64);
        let (b, mut b_rx) = Member::channel(4);
        let (c, mut c_rx) = Member::channel(64);
        let (a_id, b_id, c_id) = (a.id(), b.id(), c.id());
        assert_ok!(hub.register(a).await);
        assert_ok!(hub.register(b).await);
        assert_ok!(hub.register(c).await);

        assert_ok!(hub.broadcast(a_id, "hi".to_string()).await);
        let stats = assert_ok!(hub.stats().await);
        assert_eq!(stats.connections, 3);

        // Sender is echoed by default
        assert_eq!(drain(&mut a_rx), vec!["hi".to_string()]);
        assert_eq!(drain(&mut c_rx), vec!["hi".to_string()]);

        // Fill B to capacity without draining it
        for i in 0..3 {
            assert_ok!(hub.broadcast(a_id, format!("filler {}", i)).await);
        }
        assert_ok!(hub.broadcast(a_id, "second".to_string()).await);

        let stats = assert_ok!(hub.stats().await);
        assert_eq!(stats.connections, 2);
        assert!(!stats.members.contains(&b_id));
        assert!(stats.members.contains(&a_id));
        assert!(stats.members.contains(&c_id));
        assert_eq!(stats.evictions, 1);

        let c_received = drain(&mut c_rx);
        assert_eq!(c_received.last(), Some(&"second".to_string()));
        assert_eq!(c_received.len(), 4);

        let b_received = drain(&mut b_rx);
        assert_eq!(b_received.len(), 4);
        assert_eq!(b_received[0], "hi");
        assert!(!b_received.contains(&"second".to_string()));
        assert_eq!(b_rx.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[tokio::test]
    async fn test_hub_without_echo() {
        let hub = spawn_hub(HubConfig {
            echo_to_sender: false,
            ..HubConfig::default()
        });

        let (a, mut a_rx) = Member::channel(8);
        let (b, mut b_rx) = Member::channel(8);
        let a_id = a.id();
        assert_ok!(hub.register(a).await);
        assert_ok!(hub.register(b).await);

        assert_ok!(hub.broadcast(a_id, "hi".to_string()).await);
        assert_ok!(hub.stats().await);

        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(drain(&mut b_rx), vec!["hi".to_string()]);
    }

    #[tokio::test]
    async fn test_hub_double_unregister() {
        let hub = spawn_hub(HubConfig::default());
        let (member, mut rx) = Member::channel(8);
        let id = member.id();
        assert_ok!(hub.register(member).await);

        assert_ok!(hub.unregister(id).await);
        assert_ok!(hub.unregister(id).await);

        let stats = assert_ok!(hub.stats().await);
        assert_eq!(stats.connections, 0);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_removed_connection_misses_later_broadcasts() {
        let hub = spawn_hub(HubConfig::default());
        let (gone, mut gone_rx) = Member::channel(8);
        let (stays, mut stays_rx) = Member::channel(8);
        let gone_id = gone.id();
        let stays_id = stays.id();
        assert_ok!(hub.register(gone).await);
        assert_ok!(hub.register(stays).await);

        // Leaves are applied before broadcasts queued alongside them
        assert_ok!(hub.broadcast(stays_id, "before".to_string()).await);
        assert_ok!(hub.stats().await);
        assert_ok!(hub.unregister(gone_id).await);
        assert_ok!(hub.broadcast(stays_id, "after".to_string()).await);
        assert_ok!(hub.stats().await);

        assert_eq!(drain(&mut gone_rx), vec!["before".to_string()]);
        assert_eq!(gone_rx.try_recv(), Err(TryRecvError::Disconnected));
        assert_eq!(
            drain(&mut stays_rx),
            vec!["before".to_string(), "after".to_string()]
        );
    }

    #[tokio::test]
    async fn test_handle_reports_stopped_hub() {
        let (hub, handle) = Hub::<String>::new(HubConfig::default());
        drop(hub);

        let (member, _rx) = Member::channel(1);
        let id = member.id();
        assert_eq!(handle.register(member).await, Err(HubError::Stopped));
        assert_eq!(handle.unregister(id).await, Err(HubError::Stopped));
        assert_eq!(
            handle.broadcast(id, "x".to_string()).await,
            Err(HubError::Stopped)
        );
        assert_eq!(handle.stats().await, Err(HubError::Stopped));
    }

    #[tokio::test]
    async fn test_run_exits_when_handles_dropped() {
        let (hub, handle) = Hub::<String>::new(HubConfig::default());
        let task = tokio::spawn(hub.run());
        let clone = handle.clone();
        drop(handle);
        drop(clone);
        assert_ok!(task.await);
    }

    #[test]
    fn test_stats_serialize() {
        let stats = HubStats {
            connections: 1,
            members: vec![ConnectionId(7)],
            broadcasts: 2,
            deliveries: 3,
            evictions: 0,
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["members"][0], 7);
        assert_eq!(json["connections"], 1);
    }
}
