//! Live sessions of a server transport, keyed by [`SessionId`].

use dashmap::DashMap;
use rpc_wire::{FrameCodec, MessageCodec};
use std::sync::Arc;

use crate::session::{Session, SessionId};

/// Concurrent map of live sessions
pub struct SessionRegistry<C: MessageCodec = FrameCodec> {
    sessions: DashMap<SessionId, Arc<Session<C>>>,
}

impl<C: MessageCodec> SessionRegistry<C> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Register `session`; false if its id is already present
    pub fn insert(&self, session: Arc<Session<C>>) -> bool {
        match self.sessions.entry(session.id()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(session);
                true
            }
        }
    }

    /// Unregister a session, returning it if it was present
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session<C>>> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    /// Look up a session
    pub fn get(&self, id: SessionId) -> Option<Arc<Session<C>>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Whether `id` is registered
    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are registered
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Registered ids
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Snapshot of the registered sessions
    pub fn sessions(&self) -> Vec<Arc<Session<C>>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

impl<C: MessageCodec> Default for SessionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SocketOptions;
    use crate::transport::{connect_tcp, listen_tcp, IoStream};

    async fn sessions(count: usize) -> Vec<Arc<Session>> {
        let options = SocketOptions::default();
        let listener = listen_tcp("127.0.0.1:0".parse().unwrap(), &options)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let mut sessions = Vec::new();
        for _ in 0..count {
            let (client, accepted) = tokio::join!(connect_tcp(addr, &options), listener.accept());
            drop(client);
            let stream = IoStream::Plain(accepted.unwrap().0);
            sessions.push(Session::new(stream, FrameCodec::new(), 4096).unwrap());
        }
        sessions
    }

    #[tokio::test]
    async fn test_insert_lookup_remove() {
        let registry = SessionRegistry::new();
        let sessions = sessions(3).await;

        for session in &sessions {
            assert!(registry.insert(session.clone()));
        }
        assert!(!registry.insert(sessions[0].clone()));
        assert_eq!(registry.len(), 3);

        let id = sessions[1].id();
        assert!(registry.contains(id));
        assert_eq!(registry.get(id).unwrap().id(), id);

        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(!registry.contains(id));

        let mut ids = registry.ids();
        ids.sort();
        assert_eq!(ids, vec![sessions[0].id(), sessions[2].id()]);
    }

    #[tokio::test]
    async fn test_concurrent_mutation_during_iteration() {
        let registry = Arc::new(SessionRegistry::new());
        let sessions = sessions(16).await;
        for session in &sessions {
            registry.insert(session.clone());
        }

        let remover = {
            let registry = registry.clone();
            let ids: Vec<_> = sessions.iter().map(|s| s.id()).collect();
            tokio::spawn(async move {
                for id in ids {
                    registry.remove(id);
                    tokio::task::yield_now().await;
                }
            })
        };

        for _ in 0..16 {
            for session in registry.sessions() {
                assert!(!session.is_closed());
            }
            tokio::task::yield_now().await;
        }

        remover.await.unwrap();
        assert!(registry.is_empty());
    }
}
