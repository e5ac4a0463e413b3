//! Session and subscription registries.
//!
//! Lock order is always `events` before a session's `subscriptions`, so a
//! subscribe racing a disconnect either lands before the reverse index is
//! drained or sees the closed flag and is refused.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use mego_protocol::{Response, encode_message, encode_value};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{ServerError, ServerResult};
use crate::session::{Outbox, Session};

#[derive(Default)]
struct Channel {
    sessions: HashMap<String, Arc<Session>>,
}

#[derive(Default)]
struct Event {
    channels: HashMap<String, Channel>,
}

struct HubInner {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    events: RwLock<HashMap<String, Event>>,
    max_sessions: usize,
}

/// Shared handle to the session and event registries.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Creates an empty hub accepting up to `max_sessions` sessions.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                sessions: RwLock::new(HashMap::new()),
                events: RwLock::new(HashMap::new()),
                max_sessions,
            }),
        }
    }

    /// Registers a new session holding at most `push_limit` undelivered pushes.
    ///
    /// The returned [`Outbox`] yields every frame queued for the session.
    pub fn create_session(&self, push_limit: usize) -> ServerResult<(Arc<Session>, Outbox)> {
        let mut sessions = self.inner.sessions.write();
        if sessions.len() >= self.inner.max_sessions {
            return Err(ServerError::TooManySessions {
                max: self.inner.max_sessions,
            });
        }

        let (session, outbox) = Session::new(uuid::Uuid::new_v4().to_string(), push_limit);
        let session = Arc::new(session);
        sessions.insert(session.id().to_string(), session.clone());
        info!(session = %session.id(), total = sessions.len(), "Session created");
        Ok((session, outbox))
    }

    /// Removes a session and every subscription it holds.
    ///
    /// Returns the removed session, if it was known.
    pub fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.inner.sessions.write().remove(id)?;
        session.mark_closed();

        {
            let mut events = self.inner.events.write();
            let memberships: Vec<_> = session.subscriptions.lock().drain().collect();
            for (event, channel) in memberships {
                if let Some(ch) = events
                    .get_mut(&event)
                    .and_then(|e| e.channels.get_mut(&channel))
                {
                    ch.sessions.remove(id);
                }
            }
        }

        session.discard_uploads();
        info!(session = %id, "Session removed");
        Some(session)
    }

    /// Looks up a session by id.
    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.read().get(id).cloned()
    }

    /// Snapshot of every connected session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.sessions.read().values().cloned().collect()
    }

    /// Number of connected sessions.
    pub fn len(&self) -> usize {
        self.inner.sessions.read().len()
    }

    /// Returns true when no session is connected.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribes `session` to `event`/`channel`, creating both if needed.
    ///
    /// Returns `Ok(false)` when the session was already subscribed.
    pub fn subscribe(&self, session: &Arc<Session>, event: &str, channel: &str) -> ServerResult<bool> {
        let mut events = self.inner.events.write();
        if session.is_closed() {
            return Err(ServerError::session_closed(session.id()));
        }

        let ch = events
            .entry(event.to_string())
            .or_default()
            .channels
            .entry(channel.to_string())
            .or_default();
        if ch.sessions.contains_key(session.id()) {
            return Ok(false);
        }
        ch.sessions.insert(session.id().to_string(), session.clone());
        session
            .subscriptions
            .lock()
            .insert((event.to_string(), channel.to_string()));

        debug!(session = %session.id(), event, channel, "Subscribed");
        Ok(true)
    }

    /// Removes `session` from `event`/`channel`. Empty channels are kept.
    ///
    /// Returns `false` when the session was not subscribed.
    pub fn unsubscribe(&self, session: &Session, event: &str, channel: &str) -> bool {
        let mut events = self.inner.events.write();
        let removed = events
            .get_mut(event)
            .and_then(|e| e.channels.get_mut(channel))
            .and_then(|ch| ch.sessions.remove(session.id()))
            .is_some();
        if removed {
            session
                .subscriptions
                .lock()
                .remove(&(event.to_string(), channel.to_string()));
            debug!(session = %session.id(), event, channel, "Unsubscribed");
        }
        removed
    }

    /// Declares an event so that emitting to it is valid before anyone subscribes.
    pub fn declare_event(&self, event: &str) {
        self.inner
            .events
            .write()
            .entry(event.to_string())
            .or_default();
    }

    /// Declares a channel, creating its event if needed.
    pub fn declare_channel(&self, event: &str, channel: &str) {
        self.inner
            .events
            .write()
            .entry(event.to_string())
            .or_default()
            .channels
            .entry(channel.to_string())
            .or_default();
    }

    /// Deletes an event and every channel in it.
    pub fn destroy_event(&self, event: &str) -> bool {
        let mut events = self.inner.events.write();
        let Some(removed) = events.remove(event) else {
            return false;
        };
        for (channel, ch) in removed.channels {
            forget_memberships(event, &channel, ch);
        }
        true
    }

    /// Deletes one channel of an event.
    pub fn destroy_channel(&self, event: &str, channel: &str) -> bool {
        let mut events = self.inner.events.write();
        let Some(ch) = events
            .get_mut(event)
            .and_then(|e| e.channels.remove(channel))
        else {
            return false;
        };
        forget_memberships(event, channel, ch);
        true
    }

    /// Removes one session from a channel.
    pub fn kick(&self, event: &str, channel: &str, session_id: &str) -> bool {
        let mut events = self.inner.events.write();
        let Some(session) = events
            .get_mut(event)
            .and_then(|e| e.channels.get_mut(channel))
            .and_then(|ch| ch.sessions.remove(session_id))
        else {
            return false;
        };
        session
            .subscriptions
            .lock()
            .remove(&(event.to_string(), channel.to_string()));
        debug!(session = %session_id, event, channel, "Kicked");
        true
    }

    /// Sessions subscribed to `event`/`channel`.
    pub fn subscribers(&self, event: &str, channel: &str) -> Vec<Arc<Session>> {
        self.inner
            .events
            .read()
            .get(event)
            .and_then(|e| e.channels.get(channel))
            .map(|ch| ch.sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns true when `event`/`channel` exists.
    pub fn has_channel(&self, event: &str, channel: &str) -> bool {
        self.inner
            .events
            .read()
            .get(event)
            .is_some_and(|e| e.channels.contains_key(channel))
    }

    /// Pushes `payload` as `event` to every subscriber of `channel`.
    ///
    /// Delivery is best effort. Returns the number of sessions the frame was
    /// queued for.
    pub fn emit<T: Serialize + ?Sized>(
        &self,
        event: &str,
        channel: &str,
        payload: &T,
    ) -> ServerResult<usize> {
        self.emit_filter(event, channel, payload, |_| true)
    }

    /// Like [`emit`](Self::emit) but only to subscribers accepted by `filter`.
    pub fn emit_filter<T, F>(
        &self,
        event: &str,
        channel: &str,
        payload: &T,
        filter: F,
    ) -> ServerResult<usize>
    where
        T: Serialize + ?Sized,
        F: Fn(&Session) -> bool,
    {
        let targets: Vec<Arc<Session>> = {
            let events = self.inner.events.read();
            let ev = events
                .get(event)
                .ok_or_else(|| ServerError::event_not_found(event))?;
            let ch = ev
                .channels
                .get(channel)
                .ok_or_else(|| ServerError::channel_not_found(event, channel))?;
            ch.sessions.values().cloned().collect()
        };

        let frame = push_frame(event, payload)?;
        let mut delivered = 0;
        for session in &targets {
            if filter(session) && session.push_frame(frame.clone()) {
                delivered += 1;
            }
        }
        debug!(event, channel, delivered, "Emitted");
        Ok(delivered)
    }

    /// Pushes `payload` as `event` to an explicit list of sessions.
    pub fn emit_to<T: Serialize + ?Sized>(
        &self,
        sessions: &[Arc<Session>],
        event: &str,
        payload: &T,
    ) -> ServerResult<usize> {
        let frame = push_frame(event, payload)?;
        Ok(sessions
            .iter()
            .filter(|s| s.push_frame(frame.clone()))
            .count())
    }
}

fn push_frame<T: Serialize + ?Sized>(event: &str, payload: &T) -> ServerResult<Bytes> {
    let result = encode_value(payload)?;
    Ok(encode_message(&Response::push(event, result))?)
}

fn forget_memberships(event: &str, channel: &str, ch: Channel) {
    let key = (event.to_string(), channel.to_string());
    for session in ch.sessions.values() {
        session.subscriptions.lock().remove(&key);
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("sessions", &self.len())
            .field("max_sessions", &self.inner.max_sessions)
            .finish()
    }
}
