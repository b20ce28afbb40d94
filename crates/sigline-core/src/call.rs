use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::events::{DisconnectionType, MediaChangeType, ObserverRegistry};
use crate::locus::{CallId, CallInfo, LocusState, ParticipantState};

/// A call, its latest snapshot and the phase its state machine is in.
/// The snapshot is replaced wholesale by every routed event for the call.
///
/// Observers read the phase from here; it is updated before any
/// notification for the transition goes out.
#[derive(Debug)]
pub struct Call {
    id: CallId,
    info: RwLock<Arc<CallInfo>>,
    phase: RwLock<CallPhase>,
}

impl Call {
    pub fn new(info: CallInfo) -> Self {
        Self {
            id: info.id.clone(),
            info: RwLock::new(Arc::new(info)),
            phase: RwLock::new(CallPhase::Dialing),
        }
    }

    pub fn phase(&self) -> CallPhase {
        *self.phase.read()
    }

    pub fn actions(&self) -> CallActions {
        self.phase().permitted()
    }

    fn set_phase(&self, phase: CallPhase) {
        *self.phase.write() = phase;
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn info(&self) -> Arc<CallInfo> {
        self.info.read().clone()
    }

    pub fn replace_info(&self, info: CallInfo) {
        *self.info.write() = Arc::new(info);
    }

    pub fn sending_dtmf_enabled(&self) -> bool {
        self.info.read().dtmf_enabled
    }
}

/// Lifecycle phase of a call. Phases only move forward in declaration
/// order; `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CallPhase {
    Dialing,
    Ringing,
    Connected,
    Disconnecting,
    Disconnected,
}

/// What the local user may do in a phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallActions {
    pub dial: bool,
    pub answer: bool,
    pub hangup: bool,
    pub reject: bool,
    pub operate_media: bool,
}

impl CallPhase {
    pub fn permitted(self) -> CallActions {
        match self {
            CallPhase::Dialing => CallActions {
                dial: true,
                hangup: true,
                ..Default::default()
            },
            CallPhase::Ringing => CallActions {
                answer: true,
                hangup: true,
                reject: true,
                ..Default::default()
            },
            CallPhase::Connected => CallActions {
                hangup: true,
                operate_media: true,
                ..Default::default()
            },
            CallPhase::Disconnecting | CallPhase::Disconnected => CallActions::default(),
        }
    }

    pub fn is_terminal(self) -> bool {
        self == CallPhase::Disconnected
    }
}

/// Drives one call through its phases from successive snapshots and
/// reports each transition to the observers.
///
/// Holds the call weakly; once the call is gone or the machine reaches
/// `Disconnected`, `update` does nothing.
#[derive(Debug)]
pub struct CallStateMachine {
    call: Option<Weak<Call>>,
    phase: CallPhase,
    disconnection: Option<DisconnectionType>,
    remote_audio: bool,
    remote_video: bool,
    dtmf_enabled: bool,
}

impl CallStateMachine {
    pub fn new(call: &Arc<Call>) -> Self {
        let info = call.info();
        Self {
            call: Some(Arc::downgrade(call)),
            phase: CallPhase::Dialing,
            disconnection: None,
            remote_audio: info.remote_sending_audio(),
            remote_video: info.remote_sending_video(),
            dtmf_enabled: info.dtmf_enabled,
        }
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    /// Set once the machine reaches `Disconnected`.
    pub fn disconnection(&self) -> Option<DisconnectionType> {
        self.disconnection
    }

    pub fn can_dial(&self) -> bool {
        self.phase.permitted().dial
    }

    pub fn can_answer(&self) -> bool {
        self.phase.permitted().answer
    }

    pub fn can_hangup(&self) -> bool {
        self.phase.permitted().hangup
    }

    pub fn can_reject(&self) -> bool {
        self.phase.permitted().reject
    }

    pub fn can_operate_media(&self) -> bool {
        self.phase.permitted().operate_media
    }

    /// Re-read the call's snapshot and move to the phase it implies.
    pub fn update(&mut self, observers: &ObserverRegistry) {
        let Some(call) = self.call.as_ref().and_then(Weak::upgrade) else {
            return;
        };
        let info = call.info();
        let (target, reason) = self.target_phase(&info);

        if target < self.phase {
            tracing::warn!(
                call = %call.id(),
                from = ?self.phase,
                to = ?target,
                "ignoring backward call transition"
            );
        } else if target == self.phase {
            if self.phase == CallPhase::Connected {
                self.report_media_changes(&call, &info, observers);
            }
        } else {
            tracing::info!(call = %call.id(), from = ?self.phase, to = ?target, "call transition");
            self.phase = target;
            call.set_phase(target);
            match target {
                CallPhase::Ringing => observers.notify_ringing(&call),
                CallPhase::Connected => observers.notify_connected(&call),
                CallPhase::Disconnected => {
                    let reason = reason.unwrap_or(DisconnectionType::RemoteLeft);
                    self.disconnection = Some(reason);
                    self.call = None;
                    observers.notify_disconnected(&call, reason);
                }
                CallPhase::Dialing | CallPhase::Disconnecting => {}
            }
        }

        self.remote_audio = info.remote_sending_audio();
        self.remote_video = info.remote_sending_video();
        self.dtmf_enabled = info.dtmf_enabled;
    }

    fn target_phase(&self, info: &CallInfo) -> (CallPhase, Option<DisconnectionType>) {
        let was_connected = self.phase >= CallPhase::Connected;
        let ended = |local| {
            let reason = match (local, was_connected) {
                (true, true) => DisconnectionType::LocalLeft,
                (true, false) => DisconnectionType::LocalCancel,
                (false, true) => DisconnectionType::RemoteLeft,
                (false, false) => DisconnectionType::RemoteCancel,
            };
            (CallPhase::Disconnected, Some(reason))
        };

        match info.self_state {
            ParticipantState::Declined => {
                return (CallPhase::Disconnected, Some(DisconnectionType::LocalDecline));
            }
            ParticipantState::Left => return ended(true),
            _ => {}
        }
        if info.remote_declined() {
            return (CallPhase::Disconnected, Some(DisconnectionType::RemoteDecline));
        }
        if info.state == LocusState::Inactive || info.all_remotes_left() {
            return ended(false);
        }
        if info.self_state == ParticipantState::Leaving {
            return (CallPhase::Disconnecting, None);
        }
        if info.self_state == ParticipantState::Joined && info.remote_joined() {
            return (CallPhase::Connected, None);
        }
        if info.remote_notified() || info.self_state == ParticipantState::Notified {
            return (CallPhase::Ringing, None);
        }
        (CallPhase::Dialing, None)
    }

    fn report_media_changes(&self, call: &Call, info: &CallInfo, observers: &ObserverRegistry) {
        let audio = info.remote_sending_audio();
        if audio != self.remote_audio {
            let change = if audio {
                MediaChangeType::RemoteAudioUnmuted
            } else {
                MediaChangeType::RemoteAudioMuted
            };
            observers.notify_remote_media_changed(call, change);
        }
        let video = info.remote_sending_video();
        if video != self.remote_video {
            let change = if video {
                MediaChangeType::RemoteVideoUnmuted
            } else {
                MediaChangeType::RemoteVideoMuted
            };
            observers.notify_remote_media_changed(call, change);
        }
        if info.dtmf_enabled != self.dtmf_enabled {
            observers.notify_dtmf_changed(call);
        }
    }
}
