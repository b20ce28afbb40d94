use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;

use crate::call::{Call, CallActions, CallPhase, CallStateMachine};
use crate::events::ObserverRegistry;
use crate::locus::{CallId, CallInfo};
use crate::services::CallRouter;

struct TrackedCall {
    call: Arc<Call>,
    machine: CallStateMachine,
}

/// How many ended call ids are remembered to reject late events.
const ENDED_CALL_MEMORY: usize = 256;

/// Routes call events to one state machine per call.
///
/// A call is tracked from its first event until its machine reaches
/// `Disconnected`. Its id is then remembered, so late or reordered events
/// cannot start it over. Events for unknown calls that are already over
/// are dropped too.
pub struct CallManager {
    calls: HashMap<CallId, TrackedCall>,
    ended: HashSet<CallId>,
    ended_order: VecDeque<CallId>,
    observers: ObserverRegistry,
}

impl CallManager {
    pub fn new(observers: ObserverRegistry) -> Self {
        Self {
            calls: HashMap::new(),
            ended: HashSet::new(),
            ended_order: VecDeque::new(),
            observers,
        }
    }

    pub fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    pub fn phase(&self, id: &CallId) -> Option<CallPhase> {
        self.calls.get(id).map(|tracked| tracked.machine.phase())
    }

    pub fn actions(&self, id: &CallId) -> Option<CallActions> {
        self.phase(id).map(CallPhase::permitted)
    }

    pub fn call(&self, id: &CallId) -> Option<Arc<Call>> {
        self.calls.get(id).map(|tracked| tracked.call.clone())
    }

    pub fn active_calls(&self) -> Vec<CallId> {
        let mut ids: Vec<CallId> = self.calls.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Apply one snapshot to its call.
    pub fn apply(&mut self, info: CallInfo) {
        let id = info.id.clone();
        if self.ended.contains(&id) {
            tracing::debug!(call = %id, "dropping late event for an ended call");
            return;
        }
        match self.calls.entry(id.clone()) {
            Entry::Occupied(entry) => entry.get().call.replace_info(info),
            Entry::Vacant(entry) => {
                if info.has_ended() {
                    tracing::debug!(call = %id, "ignoring event for a call that already ended");
                    return;
                }
                tracing::info!(call = %id, "tracking new call");
                let call = Arc::new(Call::new(info));
                let machine = CallStateMachine::new(&call);
                entry.insert(TrackedCall { call, machine });
            }
        }

        let Some(tracked) = self.calls.get_mut(&id) else {
            return;
        };
        tracked.machine.update(&self.observers);
        if tracked.machine.phase().is_terminal() {
            self.calls.remove(&id);
            self.remember_ended(id.clone());
            tracing::info!(call = %id, "call ended");
        }
    }

    fn remember_ended(&mut self, id: CallId) {
        if self.ended_order.len() == ENDED_CALL_MEMORY {
            if let Some(oldest) = self.ended_order.pop_front() {
                self.ended.remove(&oldest);
            }
        }
        self.ended.insert(id.clone());
        self.ended_order.push_back(id);
    }
}

impl CallRouter for CallManager {
    fn route_event(&mut self, event: Value) {
        match CallInfo::from_event(&event) {
            Ok(info) => self.apply(info),
            Err(e) => tracing::warn!("dropping call event: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CallObserver, DisconnectionType};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Weak;

    #[derive(Default)]
    struct Log(Mutex<Vec<String>>);

    impl CallObserver for Log {
        fn call_did_begin_ringing(&self, call: &Call) {
            self.0.lock().push(format!("{}:ringing", call.id()));
        }

        fn call_did_connect(&self, call: &Call) {
            self.0.lock().push(format!("{}:connected", call.id()));
        }

        fn call_did_disconnect(&self, call: &Call, reason: DisconnectionType) {
            self.0.lock().push(format!("{}:{reason:?}", call.id()));
        }
    }

    fn event(url: &str, self_state: &str, remote_state: &str) -> Value {
        json!({
            "eventType": "locus.participant_updated",
            "locus": {
                "url": url,
                "fullState": { "state": "ACTIVE" },
                "self": { "id": "me", "state": self_state },
                "participants": [
                    { "id": "me", "state": self_state },
                    { "id": "bob", "state": remote_state,
                      "status": { "audioStatus": "SENDRECV", "videoStatus": "SENDRECV" } }
                ]
            }
        })
    }

    fn manager() -> (CallManager, Arc<Log>) {
        let observers = ObserverRegistry::new();
        let log = Arc::new(Log::default());
        observers.add_observer(&log);
        (CallManager::new(observers), log)
    }

    #[test]
    fn ringing_connected_ringing_ends_connected() {
        let (mut manager, log) = manager();
        manager.route_event(event("l1", "JOINED", "NOTIFIED"));
        manager.route_event(event("l1", "JOINED", "JOINED"));
        manager.route_event(event("l1", "JOINED", "NOTIFIED"));

        let id = CallId::new("l1");
        assert_eq!(manager.phase(&id), Some(CallPhase::Connected));
        assert_eq!(*log.0.lock(), vec!["l1:ringing", "l1:connected"]);
        assert_eq!(manager.actions(&id).map(|a| a.operate_media), Some(true));
    }

    #[test]
    fn ended_calls_are_forgotten() {
        let (mut manager, log) = manager();
        manager.route_event(event("l1", "JOINED", "JOINED"));
        let call = manager.call(&CallId::new("l1")).unwrap();
        manager.route_event(event("l1", "JOINED", "LEFT"));

        assert!(manager.active_calls().is_empty());
        assert_eq!(manager.phase(&CallId::new("l1")), None);
        assert_eq!(*log.0.lock(), vec!["l1:connected", "l1:RemoteLeft"]);
        // Late duplicates of the final event do not resurrect the call.
        manager.route_event(event("l1", "JOINED", "LEFT"));
        assert!(manager.active_calls().is_empty());
        assert_eq!(log.0.lock().len(), 2);
        assert_eq!(Arc::strong_count(&call), 1);
    }

    #[test]
    fn stale_events_after_the_end_are_dropped() {
        let (mut manager, log) = manager();
        manager.route_event(event("l1", "JOINED", "NOTIFIED"));
        manager.route_event(event("l1", "JOINED", "JOINED"));
        manager.route_event(event("l1", "JOINED", "LEFT"));
        manager.route_event(event("l1", "JOINED", "JOINED"));
        manager.route_event(event("l1", "JOINED", "NOTIFIED"));

        assert_eq!(manager.phase(&CallId::new("l1")), None);
        assert!(manager.active_calls().is_empty());
        assert_eq!(
            *log.0.lock(),
            vec!["l1:ringing", "l1:connected", "l1:RemoteLeft"]
        );
    }

    #[test]
    fn ended_call_memory_is_bounded() {
        let (mut manager, _log) = manager();
        for n in 0..=ENDED_CALL_MEMORY {
            let url = format!("l{n}");
            manager.route_event(event(&url, "JOINED", "JOINED"));
            manager.route_event(event(&url, "JOINED", "LEFT"));
        }
        assert_eq!(manager.ended.len(), ENDED_CALL_MEMORY);
        assert_eq!(manager.ended_order.len(), ENDED_CALL_MEMORY);
        assert!(!manager.ended.contains(&CallId::new("l0")));
        assert!(manager.ended.contains(&CallId::new(format!("l{ENDED_CALL_MEMORY}"))));

        // The oldest id was forgotten and may be tracked again.
        manager.route_event(event("l0", "JOINED", "JOINED"));
        assert_eq!(manager.phase(&CallId::new("l0")), Some(CallPhase::Connected));
    }

    #[test]
    fn calls_are_tracked_independently() {
        let (mut manager, log) = manager();
        manager.route_event(event("l2", "JOINED", "NOTIFIED"));
        manager.route_event(event("l1", "NOTIFIED", "JOINED"));
        manager.route_event(event("l2", "JOINED", "JOINED"));

        assert_eq!(manager.active_calls(), vec![CallId::new("l1"), CallId::new("l2")]);
        assert_eq!(manager.phase(&CallId::new("l1")), Some(CallPhase::Ringing));
        assert_eq!(manager.phase(&CallId::new("l2")), Some(CallPhase::Connected));
        assert_eq!(
            *log.0.lock(),
            vec!["l2:ringing", "l1:ringing", "l2:connected"]
        );
    }

    #[test]
    fn snapshot_is_replaced_on_each_event() {
        let (mut manager, _log) = manager();
        manager.route_event(event("l1", "JOINED", "NOTIFIED"));
        let call = manager.call(&CallId::new("l1")).unwrap();
        manager.route_event(event("l1", "JOINED", "JOINED"));
        assert!(call.info().remote_joined());
    }

    #[test]
    fn malformed_events_are_dropped() {
        let (mut manager, log) = manager();
        manager.route_event(json!({ "eventType": "locus.participant_updated" }));
        manager.route_event(Value::Null);
        assert!(manager.active_calls().is_empty());
        assert!(log.0.lock().is_empty());
    }

    /// Answers when allowed, reading the phase from the call rather than
    /// the manager, which is locked while it notifies.
    struct AutoAnswer {
        manager: Weak<Mutex<CallManager>>,
        seen: Mutex<Vec<(CallPhase, bool, bool)>>,
    }

    impl CallObserver for AutoAnswer {
        fn call_did_begin_ringing(&self, call: &Call) {
            let manager_free = self
                .manager
                .upgrade()
                .is_some_and(|manager| manager.try_lock().is_some());
            self.seen
                .lock()
                .push((call.phase(), call.actions().answer, manager_free));
        }
    }

    #[test]
    fn observers_read_phase_from_the_call_during_delivery() {
        let observers = ObserverRegistry::new();
        let shared = Arc::new(Mutex::new(CallManager::new(observers.clone())));
        let answer = Arc::new(AutoAnswer {
            manager: Arc::downgrade(&shared),
            seen: Mutex::new(Vec::new()),
        });
        observers.add_observer(&answer);

        let mut router = shared.clone();
        router.route_event(event("l1", "NOTIFIED", "JOINED"));

        assert_eq!(
            *answer.seen.lock(),
            vec![(CallPhase::Ringing, true, false)]
        );
        assert_eq!(
            shared.lock().actions(&CallId::new("l1")).map(|a| a.answer),
            Some(true)
        );
    }

    #[test]
    fn shared_manager_routes_through_the_lock() {
        let (manager, log) = manager();
        let shared = Arc::new(Mutex::new(manager));
        let mut router = shared.clone();
        router.route_event(event("l1", "JOINED", "JOINED"));
        assert_eq!(
            shared.lock().phase(&CallId::new("l1")),
            Some(CallPhase::Connected)
        );
        assert_eq!(log.0.lock().len(), 1);
    }
}
