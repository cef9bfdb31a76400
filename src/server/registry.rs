// Connection registry module
// Accepted connections keyed by socket id

use std::collections::HashMap;

use super::connection::Connection;
use crate::engine::SocketId;

/// Live connections of one server. Only the server loop mutates it.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    connections: HashMap<SocketId, Connection>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, connection: Connection) {
        self.connections.insert(connection.id(), connection);
    }

    pub fn remove(&mut self, id: SocketId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    pub fn get_mut(&mut self, id: SocketId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn contains(&self, id: SocketId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = SocketId> + '_ {
        self.connections.keys().copied()
    }
}
