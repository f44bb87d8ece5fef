//! Cookie-keyed HTTP sessions with typed attributes and idle expiry.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::session::Session;

/// Attribute under which the comet [`Session`] is stored.
pub const COMET_SESSION_KEY: &str = "comet.session";

/// Cookie carrying the HTTP session id.
pub const SESSION_COOKIE: &str = "COMETSESSIONID";

type Attribute = Arc<dyn Any + Send + Sync>;

pub struct HttpSession {
    id: String,
    attributes: RwLock<HashMap<String, Attribute>>,
    last_accessed: Mutex<Instant>,
    max_inactive: Option<Duration>,
    valid: AtomicBool,
}

impl std::fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSession")
            .field("id", &self.id)
            .field("valid", &self.is_valid())
            .field("max_inactive", &self.max_inactive)
            .finish()
    }
}

impl HttpSession {
    fn new(id: String, max_inactive: Option<Duration>) -> Self {
        Self {
            id,
            attributes: RwLock::new(HashMap::new()),
            last_accessed: Mutex::new(Instant::now()),
            max_inactive,
            valid: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn max_inactive(&self) -> Option<Duration> {
        self.max_inactive
    }

    pub fn last_accessed(&self) -> Instant {
        *self.last_accessed.lock()
    }

    pub fn touch(&self) {
        *self.last_accessed.lock() = Instant::now();
    }

    pub fn is_expired(&self) -> bool {
        self.max_inactive
            .is_some_and(|max| self.last_accessed().elapsed() > max)
    }

    pub fn attribute<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.attributes.read().get(key)?.clone();
        value.downcast::<T>().ok()
    }

    pub fn set_attribute<T: Any + Send + Sync>(&self, key: impl Into<String>, value: Arc<T>) {
        self.attributes.write().insert(key.into(), value);
    }

    /// The attribute at `key`, inserting `init()` when it is missing or of
    /// another type.
    pub fn attribute_or_insert_with<T, F>(&self, key: &str, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut attributes = self.attributes.write();
        if let Some(existing) = attributes.get(key).cloned() {
            if let Ok(typed) = existing.downcast::<T>() {
                return typed;
            }
        }
        let value = Arc::new(init());
        attributes.insert(key.to_string(), value.clone());
        value
    }

    pub fn remove_attribute(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.attributes.write().remove(key)
    }

    /// Remove the attribute at `key` only if it is a `T` matching `pred`.
    pub fn remove_attribute_if<T, P>(&self, key: &str, pred: P) -> bool
    where
        T: Any + Send + Sync,
        P: FnOnce(&T) -> bool,
    {
        let mut attributes = self.attributes.write();
        let matches = attributes
            .get(key)
            .and_then(|value| value.downcast_ref::<T>())
            .is_some_and(pred);
        if matches {
            attributes.remove(key);
        }
        matches
    }

    /// Invalidate the session, taking its comet session down with it.
    pub fn invalidate(&self) {
        if !self.valid.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!(session = %self.id, "http session invalidated");
        let comet = self.remove_attribute(COMET_SESSION_KEY);
        if let Some(session) = comet.and_then(|value| value.downcast::<Session>().ok()) {
            session.invalidate();
        }
        self.attributes.write().clear();
    }
}

/// All live HTTP sessions, keyed by id.
#[derive(Debug, Clone)]
pub struct HttpSessionStore {
    sessions: Arc<DashMap<String, Arc<HttpSession>>>,
    max_inactive: Option<Duration>,
}

impl HttpSessionStore {
    pub fn new(max_inactive: Option<Duration>) -> Self {
        Self { sessions: Arc::new(DashMap::new()), max_inactive }
    }

    pub fn create(&self) -> Arc<HttpSession> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let session = Arc::new(HttpSession::new(id.clone(), self.max_inactive));
        self.sessions.insert(id, session.clone());
        debug!(session = %session.id(), "http session created");
        session
    }

    /// Look up and access a session. Expired sessions are invalidated and
    /// reported as missing.
    pub fn get(&self, id: &str) -> Option<Arc<HttpSession>> {
        let session = self.sessions.get(id).map(|entry| entry.value().clone())?;
        if !session.is_valid() || session.is_expired() {
            self.sessions.remove(id);
            session.invalidate();
            return None;
        }
        session.touch();
        Some(session)
    }

    pub fn invalidate(&self, id: &str) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                session.invalidate();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Comet sessions of every live HTTP session.
    pub fn comet_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter_map(|entry| Session::lookup(entry.value()))
            .collect()
    }

    /// Invalidate and drop every expired session. Returns how many went.
    pub fn reap_expired(&self) -> usize {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| !entry.value().is_valid() || entry.value().is_expired())
            .map(|entry| entry.key().clone())
            .collect();

        let mut reaped = 0;
        for id in expired {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.invalidate();
                reaped += 1;
            }
        }
        if reaped > 0 {
            info!("Reaped {reaped} expired http sessions");
        }
        reaped
    }

    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.reap_expired();
            }
        })
    }
}
