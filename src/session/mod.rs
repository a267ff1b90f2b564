//! Connection/session manager.
//!
//! A [`SessionGroup`] indexes live sessions by connection id and by bound
//! user id. Removed sessions are reset and kept on a free-list for reuse.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::network::{Conn, ConnState, NetworkError};

/// Upper bound on pooled (idle) sessions.
const MAX_POOLED_SESSIONS: usize = 4096;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {key}={id}")]
    NotFound { key: SessionKey, id: i64 },
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}

/// Index a session is looked up by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKey {
    Conn,
    User,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKey::Conn => f.write_str("cid"),
            SessionKey::User => f.write_str("uid"),
        }
    }
}

/// A client session wrapping one transport connection.
#[derive(Default)]
pub struct Session {
    conn: Option<Arc<dyn Conn>>,
}

impl Session {
    fn init(&mut self, conn: Arc<dyn Conn>) {
        self.conn = Some(conn);
    }

    /// Clear the connection handle before the session goes back to the pool.
    fn reset(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.unbind();
        }
    }

    pub fn cid(&self) -> i64 {
        self.conn.as_ref().map_or(0, |c| c.id())
    }

    pub fn uid(&self) -> i64 {
        self.conn.as_ref().map_or(0, |c| c.uid())
    }

    pub fn state(&self) -> ConnState {
        self.conn.as_ref().map_or(ConnState::Closed, |c| c.state())
    }

    pub fn conn(&self) -> Option<&Arc<dyn Conn>> {
        self.conn.as_ref()
    }

    fn bind(&self, uid: i64) {
        if let Some(conn) = &self.conn {
            conn.bind(uid);
        }
    }

    fn unbind(&self) {
        if let Some(conn) = &self.conn {
            conn.unbind();
        }
    }

    pub async fn send(&self, msg: Bytes) -> Result<(), NetworkError> {
        match &self.conn {
            Some(conn) => conn.send(msg).await,
            None => Err(NetworkError::ConnectionClosed),
        }
    }

    pub fn push(&self, msg: Bytes) -> Result<(), NetworkError> {
        match &self.conn {
            Some(conn) => conn.push(msg),
            None => Err(NetworkError::ConnectionClosed),
        }
    }

    pub fn close(&self, force: bool) -> Result<(), NetworkError> {
        match &self.conn {
            Some(conn) => conn.close(force),
            None => Err(NetworkError::ConnectionClosed),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("cid", &self.cid())
            .field("uid", &self.uid())
            .finish()
    }
}

#[derive(Default)]
struct Inner {
    by_cid: HashMap<i64, Arc<Session>>,
    by_uid: HashMap<i64, Arc<Session>>,
    pool: Vec<Session>,
}

/// Group of live sessions.
#[derive(Default)]
pub struct SessionGroup {
    inner: RwLock<Inner>,
}

impl SessionGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection, reusing a pooled session.
    pub async fn add_session(&self, conn: Arc<dyn Conn>) -> Arc<Session> {
        let mut inner = self.inner.write().await;

        let mut session = inner.pool.pop().unwrap_or_default();
        session.init(conn);

        let session = Arc::new(session);
        let cid = session.cid();
        if inner.by_cid.insert(cid, Arc::clone(&session)).is_some() {
            warn!(cid, "Connection id reused while still indexed");
        }

        session
    }

    /// Remove a session from every index.
    ///
    /// Removing an absent key reports [`SessionError::NotFound`] and leaves
    /// the indexes untouched.
    pub async fn remove_session(&self, key: SessionKey, id: i64) -> Result<Arc<Session>, SessionError> {
        let mut inner = self.inner.write().await;

        let session = match key {
            SessionKey::Conn => inner.by_cid.remove(&id),
            SessionKey::User => inner.by_uid.remove(&id),
        }
        .ok_or(SessionError::NotFound { key, id })?;

        match key {
            SessionKey::Conn => {
                let uid = session.uid();
                if uid > 0 && inner.by_uid.get(&uid).is_some_and(|s| Arc::ptr_eq(s, &session)) {
                    inner.by_uid.remove(&uid);
                }
            }
            SessionKey::User => {
                inner.by_cid.remove(&session.cid());
            }
        }

        Ok(session)
    }

    pub async fn session(&self, key: SessionKey, id: i64) -> Result<Arc<Session>, SessionError> {
        let inner = self.inner.read().await;
        let index = match key {
            SessionKey::Conn => &inner.by_cid,
            SessionKey::User => &inner.by_uid,
        };
        index
            .get(&id)
            .cloned()
            .ok_or(SessionError::NotFound { key, id })
    }

    /// Bind a user to a connection.
    ///
    /// A connection previously bound to the same user is unbound first, and
    /// a user previously bound to this connection is released.
    pub async fn bind(&self, cid: i64, uid: i64) -> Result<(), SessionError> {
        let mut inner = self.inner.write().await;

        let session = inner
            .by_cid
            .get(&cid)
            .cloned()
            .ok_or(SessionError::NotFound {
                key: SessionKey::Conn,
                id: cid,
            })?;

        if let Some(prev) = inner.by_uid.remove(&uid) {
            if !Arc::ptr_eq(&prev, &session) {
                debug!(uid, old_cid = prev.cid(), new_cid = cid, "User rebound to a new connection");
                prev.unbind();
            }
        }

        let old_uid = session.uid();
        if old_uid > 0 && old_uid != uid {
            inner.by_uid.remove(&old_uid);
        }

        session.bind(uid);
        inner.by_uid.insert(uid, session);

        Ok(())
    }

    /// Release a user's binding. Unknown users are ignored.
    pub async fn unbind(&self, uid: i64) -> Option<Arc<Session>> {
        let mut inner = self.inner.write().await;
        let session = inner.by_uid.remove(&uid)?;
        session.unbind();
        Some(session)
    }

    /// Reset a removed session and return it to the pool.
    ///
    /// Sessions still referenced elsewhere are dropped instead.
    pub async fn recycle(&self, session: Arc<Session>) {
        let Ok(mut session) = Arc::try_unwrap(session) else {
            return;
        };
        session.reset();

        let mut inner = self.inner.write().await;
        if inner.pool.len() < MAX_POOLED_SESSIONS {
            inner.pool.push(session);
        }
    }

    pub async fn push(&self, key: SessionKey, id: i64, msg: Bytes) -> Result<(), SessionError> {
        let session = self.session(key, id).await?;
        session.push(msg)?;
        Ok(())
    }

    /// Push to every live session, returning how many accepted the message.
    pub async fn broadcast(&self, msg: Bytes) -> usize {
        let sessions: Vec<Arc<Session>> = self.inner.read().await.by_cid.values().cloned().collect();

        sessions
            .iter()
            .filter(|s| match s.push(msg.clone()) {
                Ok(()) => true,
                Err(e) => {
                    debug!(cid = s.cid(), error = %e, "Broadcast push failed");
                    false
                }
            })
            .count()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.by_cid.len()
    }

    pub async fn pooled(&self) -> usize {
        self.inner.read().await.pool.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::testutil::MockConn;

    #[tokio::test]
    async fn test_add_and_remove_by_conn() {
        let group = SessionGroup::new();
        group.add_session(MockConn::new(7)).await;

        assert_eq!(group.session(SessionKey::Conn, 7).await.unwrap().cid(), 7);

        let removed = group.remove_session(SessionKey::Conn, 7).await.unwrap();
        assert_eq!(removed.cid(), 7);
        assert!(matches!(
            group.session(SessionKey::Conn, 7).await,
            Err(SessionError::NotFound { .. })
        ));

        // Removing twice reports not-found.
        assert!(matches!(
            group.remove_session(SessionKey::Conn, 7).await,
            Err(SessionError::NotFound {
                key: SessionKey::Conn,
                id: 7
            })
        ));
        assert_eq!(group.count().await, 0);
    }

    #[tokio::test]
    async fn test_bind_indexes_by_user() {
        let group = SessionGroup::new();
        let conn = MockConn::new(1);
        group.add_session(conn.clone()).await;

        group.bind(1, 100).await.unwrap();
        assert_eq!(conn.uid(), 100);
        assert_eq!(group.session(SessionKey::User, 100).await.unwrap().cid(), 1);

        let removed = group.remove_session(SessionKey::Conn, 1).await.unwrap();
        assert_eq!(removed.uid(), 100);
        assert!(group.session(SessionKey::User, 100).await.is_err());
    }

    #[tokio::test]
    async fn test_rebind_moves_user_to_new_connection() {
        let group = SessionGroup::new();
        let first = MockConn::new(1);
        let second = MockConn::new(2);
        group.add_session(first.clone()).await;
        group.add_session(second.clone()).await;

        group.bind(1, 100).await.unwrap();
        group.bind(2, 100).await.unwrap();

        assert_eq!(first.uid(), 0);
        assert_eq!(second.uid(), 100);
        assert_eq!(group.session(SessionKey::User, 100).await.unwrap().cid(), 2);

        // Removing the stale connection keeps the new binding.
        group.remove_session(SessionKey::Conn, 1).await.unwrap();
        assert_eq!(group.session(SessionKey::User, 100).await.unwrap().cid(), 2);
    }

    #[tokio::test]
    async fn test_unbind_is_idempotent() {
        let group = SessionGroup::new();
        let conn = MockConn::new(1);
        group.add_session(conn.clone()).await;
        group.bind(1, 100).await.unwrap();

        assert!(group.unbind(100).await.is_some());
        assert_eq!(conn.uid(), 0);
        assert!(group.unbind(100).await.is_none());
        assert_eq!(group.count().await, 1);
    }

    #[tokio::test]
    async fn test_bind_unknown_connection() {
        let group = SessionGroup::new();
        assert!(matches!(
            group.bind(9, 100).await,
            Err(SessionError::NotFound {
                key: SessionKey::Conn,
                id: 9
            })
        ));
    }

    #[tokio::test]
    async fn test_recycle_resets_and_reuses() {
        let group = SessionGroup::new();
        let conn = MockConn::new(1);
        group.add_session(conn.clone()).await;
        group.bind(1, 100).await.unwrap();

        let session = group.remove_session(SessionKey::Conn, 1).await.unwrap();
        group.recycle(session).await;
        assert_eq!(group.pooled().await, 1);
        assert_eq!(conn.uid(), 0);

        let reused = group.add_session(MockConn::new(2)).await;
        assert_eq!(reused.cid(), 2);
        assert_eq!(reused.uid(), 0);
        assert_eq!(group.pooled().await, 0);
    }

    #[tokio::test]
    async fn test_push_and_broadcast() {
        let group = SessionGroup::new();
        let a = MockConn::new(1);
        let b = MockConn::new(2);
        group.add_session(a.clone()).await;
        group.add_session(b.clone()).await;
        group.bind(2, 200).await.unwrap();

        group
            .push(SessionKey::User, 200, Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert_eq!(b.sent().await, vec![Bytes::from_static(b"hi")]);
        assert!(a.sent().await.is_empty());

        assert!(matches!(
            group.push(SessionKey::Conn, 3, Bytes::new()).await,
            Err(SessionError::NotFound { .. })
        ));

        assert_eq!(group.broadcast(Bytes::from_static(b"all")).await, 2);
        assert_eq!(a.sent().await.len(), 1);
        assert_eq!(b.sent().await.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_add_and_lookup() {
        const N: i64 = 64;
        let group = Arc::new(SessionGroup::new());

        // Seed the pool so additions draw from it.
        for cid in 0..N / 2 {
            group.add_session(MockConn::new(-(cid + 1))).await;
            let s = group.remove_session(SessionKey::Conn, -(cid + 1)).await.unwrap();
            group.recycle(s).await;
        }

        let mut handles = Vec::new();
        for cid in 1..=N {
            let group = Arc::clone(&group);
            handles.push(tokio::spawn(async move {
                group.add_session(MockConn::new(cid)).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let mut handles = Vec::new();
        for cid in 1..=N {
            let group = Arc::clone(&group);
            handles.push(tokio::spawn(async move {
                group.session(SessionKey::Conn, cid).await.unwrap()
            }));
        }

        let mut seen = HashSet::new();
        let mut ptrs = HashSet::new();
        for h in handles {
            let session = h.await.unwrap();
            seen.insert(session.cid());
            ptrs.insert(Arc::as_ptr(&session) as usize);
        }

        assert_eq!(seen.len(), N as usize);
        assert_eq!(ptrs.len(), N as usize);
        assert_eq!(group.count().await, N as usize);
    }
}
