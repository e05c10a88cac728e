//! Owned registry of both server pools.
//!
//! Pool membership is mutated at runtime by the admin surface, so it lives
//! behind one reader/writer lock and callers only ever receive clones, never
//! references into the internal lists. The lock is a `std` lock held only
//! for the duration of a lookup or mutation, never across an await.

use std::sync::RwLock;

use upstreamd_common::model::{Pool, ServerDescriptor};

pub struct ServerRegistry {
    pools: RwLock<Pools>,
}

#[derive(Default)]
struct Pools {
    incoming: Vec<ServerDescriptor>,
    outgoing: Vec<ServerDescriptor>,
}

impl Pools {
    fn list(&self, pool: Pool) -> &Vec<ServerDescriptor> {
        match pool {
            Pool::Incoming => &self.incoming,
            Pool::Outgoing => &self.outgoing,
        }
    }

    fn list_mut(&mut self, pool: Pool) -> &mut Vec<ServerDescriptor> {
        match pool {
            Pool::Incoming => &mut self.incoming,
            Pool::Outgoing => &mut self.outgoing,
        }
    }
}

impl ServerRegistry {
    pub fn new(incoming: Vec<ServerDescriptor>, outgoing: Vec<ServerDescriptor>) -> Self {
        Self {
            pools: RwLock::new(Pools { incoming, outgoing }),
        }
    }

    /// Looks a server up across both pools.
    pub fn get(&self, server_id: &str) -> Option<(ServerDescriptor, Pool)> {
        let pools = self.pools.read().unwrap();
        for pool in [Pool::Incoming, Pool::Outgoing] {
            if let Some(server) = pools.list(pool).iter().find(|s| s.id == server_id) {
                return Some((server.clone(), pool));
            }
        }
        None
    }

    pub fn contains(&self, server_id: &str) -> bool {
        self.get(server_id).is_some()
    }

    pub fn servers(&self, pool: Pool) -> Vec<ServerDescriptor> {
        self.pools.read().unwrap().list(pool).clone()
    }

    pub fn server_ids(&self) -> Vec<String> {
        let pools = self.pools.read().unwrap();
        pools
            .incoming
            .iter()
            .chain(pools.outgoing.iter())
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        let pools = self.pools.read().unwrap();
        pools.incoming.len() + pools.outgoing.len()
    }

    /// Adds a server to a pool. Rejects duplicate ids across both pools and
    /// empty hosts.
    pub fn add(&self, pool: Pool, server: ServerDescriptor) -> bool {
        if server.host.is_empty() {
            return false;
        }
        let mut pools = self.pools.write().unwrap();
        let exists = pools
            .incoming
            .iter()
            .chain(pools.outgoing.iter())
            .any(|s| s.id == server.id);
        if exists {
            return false;
        }
        pools.list_mut(pool).push(server);
        true
    }

    pub fn remove(&self, pool: Pool, server_id: &str) -> bool {
        let mut pools = self.pools.write().unwrap();
        let list = pools.list_mut(pool);
        let before = list.len();
        list.retain(|s| s.id != server_id);
        list.len() < before
    }

    /// Flips the static enabled toggle; returns the new state.
    pub fn toggle(&self, pool: Pool, server_id: &str) -> Option<bool> {
        let mut pools = self.pools.write().unwrap();
        let server = pools.list_mut(pool).iter_mut().find(|s| s.id == server_id)?;
        server.enabled = !server.enabled;
        Some(server.enabled)
    }

    pub fn snapshot(&self) -> (Vec<ServerDescriptor>, Vec<ServerDescriptor>) {
        let pools = self.pools.read().unwrap();
        (pools.incoming.clone(), pools.outgoing.clone())
    }
}
