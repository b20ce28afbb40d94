use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::call::Call;

/// Why a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectionType {
    /// The local user hung up a connected call.
    LocalLeft,
    LocalDecline,
    /// The local user gave up before the call connected.
    LocalCancel,
    RemoteLeft,
    RemoteDecline,
    RemoteCancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaChangeType {
    RemoteAudioMuted,
    RemoteAudioUnmuted,
    RemoteVideoMuted,
    RemoteVideoUnmuted,
}

/// Receives call notifications. Every method defaults to doing nothing so
/// observers implement only what they care about.
///
/// Called synchronously from whatever context drives the call machines,
/// usually the signaling transport task, with that router still locked.
/// Keep it short; `Call::phase` and `Call::actions` already reflect the
/// transition being reported.
pub trait CallObserver: Send + Sync {
    fn call_did_begin_ringing(&self, _call: &Call) {}
    fn call_did_connect(&self, _call: &Call) {}
    fn call_did_disconnect(&self, _call: &Call, _reason: DisconnectionType) {}
    fn remote_media_did_change(&self, _call: &Call, _change: MediaChangeType) {}
    fn dtmf_availability_did_change(&self, _call: &Call, _enabled: bool) {}
}

/// Handle to one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverToken(u64);

#[derive(Default)]
struct Entries {
    next_token: u64,
    /// Ordered by token, i.e. by registration. Each entry keeps the
    /// observer's address so its `by_addr` slot can be dropped directly.
    by_token: BTreeMap<u64, (usize, Weak<dyn CallObserver>)>,
    by_addr: HashMap<usize, u64>,
}

impl Entries {
    fn remove(&mut self, token: u64) -> bool {
        let Some((addr, _)) = self.by_token.remove(&token) else {
            return false;
        };
        if self.by_addr.get(&addr) == Some(&token) {
            self.by_addr.remove(&addr);
        }
        true
    }
}

/// Fan-out of call notifications to weakly held observers.
///
/// Clones share the same set of observers. The registry never keeps an
/// observer alive; entries whose observer was dropped are pruned on the
/// next broadcast.
#[derive(Clone, Default)]
pub struct ObserverRegistry {
    entries: Arc<RwLock<Entries>>,
}

fn addr_of<O: ?Sized>(observer: &Arc<O>) -> usize {
    Arc::as_ptr(observer) as *const () as usize
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `observer`. Adding one that is already registered returns
    /// its existing token.
    pub fn add_observer<O: CallObserver + 'static>(&self, observer: &Arc<O>) -> ObserverToken {
        let addr = addr_of(observer);
        let mut entries = self.entries.write();
        if let Some(&token) = entries.by_addr.get(&addr) {
            let live = entries
                .by_token
                .get(&token)
                .is_some_and(|(_, weak)| weak.strong_count() > 0);
            if live {
                return ObserverToken(token);
            }
            // The address was reused by a new allocation.
            entries.remove(token);
        }
        let token = entries.next_token;
        entries.next_token += 1;
        let weak = Arc::downgrade(observer);
        let weak: Weak<dyn CallObserver> = weak;
        entries.by_token.insert(token, (addr, weak));
        entries.by_addr.insert(addr, token);
        tracing::debug!(token, "call observer added");
        ObserverToken(token)
    }

    /// Returns false if `observer` was not registered.
    pub fn remove_observer<O: CallObserver + 'static>(&self, observer: &Arc<O>) -> bool {
        let mut entries = self.entries.write();
        match entries.by_addr.get(&addr_of(observer)).copied() {
            Some(token) => entries.remove(token),
            None => false,
        }
    }

    pub fn unsubscribe(&self, token: ObserverToken) -> bool {
        self.entries.write().remove(token.0)
    }

    /// Number of registered observers that are still alive.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .by_token
            .values()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify_ringing(&self, call: &Call) {
        self.broadcast(|observer| observer.call_did_begin_ringing(call));
    }

    pub fn notify_connected(&self, call: &Call) {
        self.broadcast(|observer| observer.call_did_connect(call));
    }

    pub fn notify_disconnected(&self, call: &Call, reason: DisconnectionType) {
        self.broadcast(|observer| observer.call_did_disconnect(call, reason));
    }

    pub fn notify_remote_media_changed(&self, call: &Call, change: MediaChangeType) {
        self.broadcast(|observer| observer.remote_media_did_change(call, change));
    }

    pub fn notify_dtmf_changed(&self, call: &Call) {
        let enabled = call.sending_dtmf_enabled();
        self.broadcast(|observer| observer.dtmf_availability_did_change(call, enabled));
    }

    /// Deliver to a snapshot of the current observers. No lock is held while
    /// an observer runs, so callbacks may add or remove observers; one
    /// removed mid-broadcast receives nothing further.
    fn broadcast(&self, deliver: impl Fn(&dyn CallObserver)) {
        let snapshot: Vec<(u64, Weak<dyn CallObserver>)> = self
            .entries
            .read()
            .by_token
            .iter()
            .map(|(token, (_, weak))| (*token, weak.clone()))
            .collect();

        let mut dead = Vec::new();
        for (token, weak) in snapshot {
            if !self.entries.read().by_token.contains_key(&token) {
                continue;
            }
            match weak.upgrade() {
                Some(observer) => deliver(observer.as_ref()),
                None => dead.push(token),
            }
        }

        if !dead.is_empty() {
            let mut entries = self.entries.write();
            for token in &dead {
                entries.remove(*token);
            }
            tracing::debug!(count = dead.len(), "pruned dropped call observers");
        }
    }
}
