//! Slot routing.
//!
//! Keys map to one of [`SLOT_COUNT`] hash slots. A routing table assigns
//! sorted, non-overlapping slot ranges to a primary endpoint and its
//! replicas. Without a table every slot is served by any healthy connection.

use crate::connection::Connection;
use crate::error::{ClientError, UsageError};
use crate::operation::Message;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Number of hash slots.
pub const SLOT_COUNT: u16 = 16384;

/// Hash slot of `key`.
///
/// Only the first non-empty `{...}` section is hashed when present, so
/// related keys can be forced onto one slot.
pub fn hash_slot(key: &[u8]) -> u16 {
    let key = hash_tag(key).unwrap_or(key);
    crc16::State::<crc16::XMODEM>::calculate(key) % SLOT_COUNT
}

fn hash_tag(key: &[u8]) -> Option<&[u8]> {
    let open = key.iter().position(|&b| b == b'{')?;
    let rest = &key[open + 1..];
    let close = rest.iter().position(|&b| b == b'}')?;
    if close == 0 {
        return None;
    }
    Some(&rest[..close])
}

/// Inclusive slot range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, slot: u16) -> bool {
        self.start <= slot && slot <= self.end
    }
}

/// A slot range with the endpoints serving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRange {
    pub slots: SlotRange,
    pub primary: String,
    pub replicas: Vec<String>,
}

impl ShardRange {
    pub fn new(start: u16, end: u16, primary: impl Into<String>) -> Self {
        Self {
            slots: SlotRange::new(start, end),
            primary: primary.into(),
            replicas: Vec::new(),
        }
    }

    pub fn with_replica(mut self, endpoint: impl Into<String>) -> Self {
        self.replicas.push(endpoint.into());
        self
    }
}

/// Picks a healthy connection for each operation.
pub struct Router {
    table: RwLock<Arc<Vec<ShardRange>>>,
    connections: RwLock<Vec<Arc<Connection>>>,
    /// Rotates replica choice.
    cursor: AtomicUsize,
}

impl Router {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Arc::new(Vec::new())),
            connections: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn add_connection(&self, connection: Arc<Connection>) {
        self.connections.write().push(connection);
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().clone()
    }

    /// Healthy connection to `endpoint`, if any.
    pub fn connection(&self, endpoint: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .iter()
            .find(|conn| conn.endpoint() == endpoint && conn.is_healthy())
            .cloned()
    }

    pub fn routing_table(&self) -> Arc<Vec<ShardRange>> {
        self.table.read().clone()
    }

    /// Replaces the routing table.
    ///
    /// Returns `false` when `table` equals the current one. Ranges must be
    /// sorted by slot and must not overlap.
    pub fn set_routing_table(&self, table: Vec<ShardRange>) -> Result<bool, ClientError> {
        let sorted = table.iter().all(|shard| shard.slots.start <= shard.slots.end)
            && table
                .windows(2)
                .all(|pair| pair[0].slots.end < pair[1].slots.start);
        if !sorted {
            return Err(UsageError::UnsortedRoutingTable.into());
        }

        let mut current = self.table.write();
        if **current == table {
            return Ok(false);
        }
        tracing::debug!("Routing table updated ({} ranges)", table.len());
        *current = Arc::new(table);
        Ok(true)
    }

    /// Selects a healthy connection for `slot`.
    ///
    /// Replica requests fall back to the primary. Keyless operations, and
    /// every operation when no table is set, go to the first healthy
    /// connection.
    pub fn route(&self, slot: Option<u16>, want_replica: bool) -> Result<Arc<Connection>, ClientError> {
        let table = self.routing_table();
        let Some(slot) = slot.filter(|_| !table.is_empty()) else {
            return self.any_healthy();
        };

        let idx = table.partition_point(|shard| shard.slots.end < slot);
        let shard = table
            .get(idx)
            .filter(|shard| shard.slots.contains(slot))
            .ok_or(ClientError::NoConnectionAvailable)?;

        if want_replica && !shard.replicas.is_empty() {
            let start = self.cursor.fetch_add(1, Ordering::Relaxed);
            let count = shard.replicas.len();
            for i in 0..count {
                let replica = &shard.replicas[(start + i) % count];
                if let Some(conn) = self.connection(replica) {
                    return Ok(conn);
                }
            }
        }
        self.connection(&shard.primary)
            .ok_or(ClientError::NoConnectionAvailable)
    }

    /// Routes a queued message, honoring its pinned endpoint.
    pub(crate) fn route_message(&self, message: &Message) -> Result<Arc<Connection>, ClientError> {
        match &message.pinned {
            Some(endpoint) => self
                .connection(endpoint)
                .ok_or(ClientError::NoConnectionAvailable),
            None => self.route(message.slot, message.flags.is_replica_ok()),
        }
    }

    fn any_healthy(&self) -> Result<Arc<Connection>, ClientError> {
        self.connections
            .read()
            .iter()
            .find(|conn| conn.is_healthy())
            .cloned()
            .ok_or(ClientError::NoConnectionAvailable)
    }

    pub fn is_healthy(&self) -> bool {
        self.connections.read().iter().any(|conn| conn.is_healthy())
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{connection, dead_connection};
    use proptest::prelude::*;

    #[test]
    fn test_hash_slot() {
        assert_eq!(hash_slot(b"123456789"), 0x31C3);
        assert_eq!(hash_slot(b"foo"), 12182);
        assert_eq!(hash_slot(b"bar"), 5061);
    }

    #[test]
    fn test_hash_tags() {
        assert_eq!(
            hash_slot(b"{user1000}.following"),
            hash_slot(b"{user1000}.followers")
        );
        assert_eq!(hash_slot(b"{user1000}.following"), hash_slot(b"user1000"));
        // Empty tag: the whole key is hashed.
        let whole = crc16::State::<crc16::XMODEM>::calculate(b"foo{}{bar}") % SLOT_COUNT;
        assert_eq!(hash_slot(b"foo{}{bar}"), whole);
        assert_eq!(hash_slot(b"foo{{bar}}zap"), hash_slot(b"{bar"));
    }

    #[test]
    fn test_rejects_unsorted_table() {
        let router = Router::new();
        let unsorted = vec![ShardRange::new(100, 200, "b"), ShardRange::new(0, 99, "a")];
        assert!(matches!(
            router.set_routing_table(unsorted),
            Err(ClientError::Usage(UsageError::UnsortedRoutingTable))
        ));

        let overlapping = vec![ShardRange::new(0, 100, "a"), ShardRange::new(100, 200, "b")];
        assert!(router.set_routing_table(overlapping).is_err());

        let inverted = vec![ShardRange::new(10, 5, "a")];
        assert!(router.set_routing_table(inverted).is_err());
    }

    #[test]
    fn test_unchanged_table_is_not_replaced() {
        let router = Router::new();
        let table = vec![ShardRange::new(0, 8191, "a"), ShardRange::new(8192, 16383, "b")];
        assert!(router.set_routing_table(table.clone()).unwrap());
        assert!(!router.set_routing_table(table).unwrap());
        assert_eq!(router.routing_table().len(), 2);
    }

    #[tokio::test]
    async fn test_route_by_slot() {
        let router = Router::new();
        let (a, _sa) = connection("a").await;
        let (b, _sb) = connection("b").await;
        router.add_connection(a.clone());
        router.add_connection(b.clone());
        router
            .set_routing_table(vec![
                ShardRange::new(0, 8191, "a"),
                ShardRange::new(8192, 16383, "b"),
            ])
            .unwrap();

        assert!(Arc::ptr_eq(&router.route(Some(0), false).unwrap(), &a));
        assert!(Arc::ptr_eq(&router.route(Some(8191), false).unwrap(), &a));
        assert!(Arc::ptr_eq(&router.route(Some(8192), false).unwrap(), &b));
        assert!(Arc::ptr_eq(&router.route(Some(16383), false).unwrap(), &b));
        // Keyless commands go anywhere healthy.
        assert!(router.route(None, false).is_ok());
    }

    #[tokio::test]
    async fn test_uncovered_slot_fails() {
        let router = Router::new();
        let (a, _sa) = connection("a").await;
        router.add_connection(a);
        router
            .set_routing_table(vec![ShardRange::new(0, 99, "a")])
            .unwrap();
        assert!(matches!(
            router.route(Some(100), false),
            Err(ClientError::NoConnectionAvailable)
        ));
    }

    #[tokio::test]
    async fn test_replica_preference_and_fallback() {
        let router = Router::new();
        let (primary, _sp) = connection("p").await;
        let (replica, _sr) = connection("r").await;
        router.add_connection(primary.clone());
        router.add_connection(replica.clone());
        router
            .set_routing_table(vec![ShardRange::new(0, 16383, "p").with_replica("r")])
            .unwrap();

        assert!(Arc::ptr_eq(&router.route(Some(5), true).unwrap(), &replica));
        assert!(Arc::ptr_eq(&router.route(Some(5), false).unwrap(), &primary));

        replica.close().await;
        assert!(Arc::ptr_eq(&router.route(Some(5), true).unwrap(), &primary));
    }

    #[tokio::test]
    async fn test_standalone_skips_unhealthy() {
        let router = Router::new();
        assert!(matches!(
            router.route(Some(1), false),
            Err(ClientError::NoConnectionAvailable)
        ));

        router.add_connection(dead_connection("down"));
        assert!(!router.is_healthy());
        assert!(router.route(None, false).is_err());

        let (up, _s) = connection("up").await;
        router.add_connection(up.clone());
        assert!(router.is_healthy());
        assert!(Arc::ptr_eq(&router.route(Some(42), false).unwrap(), &up));
    }

    proptest! {
        #[test]
        fn prop_slot_in_range(key in proptest::collection::vec(any::<u8>(), 0..64)) {
            prop_assert!(hash_slot(&key) < SLOT_COUNT);
        }

        #[test]
        fn prop_tagged_keys_share_slot(
            tag in "[a-z0-9]{1,16}",
            a in "[a-z0-9:]{0,16}",
            b in "[a-z0-9:]{0,16}",
        ) {
            let first = format!("{{{}}}{}", tag, a);
            let second = format!("{}{{{}}}", b, tag);
            prop_assert_eq!(hash_slot(first.as_bytes()), hash_slot(tag.as_bytes()));
            prop_assert_eq!(hash_slot(second.as_bytes()), hash_slot(tag.as_bytes()));
        }
    }
}
