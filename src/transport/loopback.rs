//! In-memory media session
//!
//! Records every call, tracks which buses the local track is bound to, and
//! lets callers script failures, link drops and roster changes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::mpsc;

use super::media::{JoinRequest, JoinedRoom, MediaSession, SessionSignal};
use crate::error::MediaError;
use crate::protocol::{Bus, NetId, Participant};

/// A call made against the loopback session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaCall {
    Join(NetId),
    Leave,
    SetTrackEnabled(bool),
    OpenCapture(Option<String>),
    CloseCapture,
    BindPublish(Bus),
    UnbindPublish(Bus),
    Subscribe(NetId),
    Unsubscribe(NetId),
}

/// Operations that can be scripted to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailOp {
    Join,
    Track,
    OpenCapture,
    Bind,
    Subscribe,
}

#[derive(Default)]
struct LoopbackState {
    joined: bool,
    room: Option<NetId>,
    track_enabled: bool,
    capture: Option<Option<String>>,
    bound: BTreeSet<Bus>,
    max_bound: usize,
    subscriptions: BTreeSet<NetId>,
    participants: Vec<Participant>,
    calls: Vec<MediaCall>,
    failures: HashMap<FailOp, u32>,
    bad_devices: HashSet<String>,
    silent_devices: HashSet<String>,
    signals: Option<mpsc::UnboundedSender<SessionSignal>>,
    join_count: u32,
}

impl LoopbackState {
    fn should_fail(&mut self, op: FailOp) -> bool {
        match self.failures.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                true
            }
            _ => false,
        }
    }

    /// Everything attached to the room goes away with the link
    fn reset_room(&mut self) {
        self.joined = false;
        self.room = None;
        self.track_enabled = false;
        self.capture = None;
        self.bound.clear();
        self.subscriptions.clear();
    }
}

/// Loopback implementation of [`MediaSession`]
#[derive(Default)]
pub struct LoopbackSession {
    state: Mutex<LoopbackState>,
}

impl LoopbackSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `op`
    pub fn fail_next(&self, op: FailOp, times: u32) {
        self.state.lock().failures.insert(op, times);
    }

    /// Fail every call of `op` until [`LoopbackSession::heal`]
    pub fn fail_always(&self, op: FailOp) {
        self.fail_next(op, u32::MAX);
    }

    pub fn heal(&self, op: FailOp) {
        self.state.lock().failures.remove(&op);
    }

    /// Device IDs that cannot be opened
    pub fn mark_bad_device(&self, device_id: &str) {
        self.state.lock().bad_devices.insert(device_id.to_string());
    }

    /// Device IDs that open but refuse to publish
    pub fn mark_silent_device(&self, device_id: &str) {
        self.state.lock().silent_devices.insert(device_id.to_string());
    }

    /// Simulate a network blip
    pub fn drop_link(&self, reason: &str) {
        let mut state = self.state.lock();
        state.reset_room();
        if let Some(tx) = state.signals.take() {
            let _ = tx.send(SessionSignal::LinkLost {
                reason: reason.to_string(),
            });
        }
    }

    /// Simulate the far end closing the room
    pub fn close_remotely(&self) {
        let mut state = self.state.lock();
        state.reset_room();
        if let Some(tx) = state.signals.take() {
            let _ = tx.send(SessionSignal::Closed);
        }
    }

    pub fn fail_fatally(&self, message: &str) {
        let mut state = self.state.lock();
        state.reset_room();
        if let Some(tx) = state.signals.take() {
            let _ = tx.send(SessionSignal::Fatal {
                message: message.to_string(),
            });
        }
    }

    pub fn add_participant(&self, user_id: &str, callsign: &str) {
        let participant = Participant {
            user_id: user_id.to_string(),
            callsign: callsign.to_string(),
            client_id: uuid::Uuid::new_v4().to_string(),
            is_speaking: false,
        };
        let mut state = self.state.lock();
        state.participants.retain(|p| p.user_id != user_id);
        state.participants.push(participant.clone());
        if let Some(tx) = &state.signals {
            let _ = tx.send(SessionSignal::ParticipantJoined(participant));
        }
    }

    pub fn remove_participant(&self, user_id: &str) {
        let mut state = self.state.lock();
        state.participants.retain(|p| p.user_id != user_id);
        if let Some(tx) = &state.signals {
            let _ = tx.send(SessionSignal::ParticipantLeft {
                user_id: user_id.to_string(),
            });
        }
    }

    pub fn set_speaking(&self, user_id: &str, is_speaking: bool) {
        let mut state = self.state.lock();
        if let Some(p) = state.participants.iter_mut().find(|p| p.user_id == user_id) {
            p.is_speaking = is_speaking;
        }
        if let Some(tx) = &state.signals {
            let _ = tx.send(SessionSignal::SpeakingChanged {
                user_id: user_id.to_string(),
                is_speaking,
            });
        }
    }

    pub fn calls(&self) -> Vec<MediaCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn join_count(&self) -> u32 {
        self.state.lock().join_count
    }

    pub fn is_joined(&self) -> bool {
        self.state.lock().joined
    }

    pub fn is_track_enabled(&self) -> bool {
        self.state.lock().track_enabled
    }

    pub fn capture_device(&self) -> Option<Option<String>> {
        self.state.lock().capture.clone()
    }

    pub fn bound_buses(&self) -> Vec<Bus> {
        self.state.lock().bound.iter().cloned().collect()
    }

    /// Largest number of buses the track was ever bound to at once
    pub fn max_concurrent_publish(&self) -> usize {
        self.state.lock().max_bound
    }

    pub fn subscriptions(&self) -> Vec<NetId> {
        self.state.lock().subscriptions.iter().cloned().collect()
    }
}

#[async_trait]
impl MediaSession for LoopbackSession {
    async fn join(&self, request: &JoinRequest) -> Result<JoinedRoom, MediaError> {
        let mut state = self.state.lock();
        state.calls.push(MediaCall::Join(request.net_id.clone()));
        state.join_count += 1;

        if state.should_fail(FailOp::Join) {
            return Err(MediaError::Network(format!(
                "unable to reach {}",
                request.endpoint_url
            )));
        }

        state.reset_room();
        state.joined = true;
        state.room = Some(request.net_id.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        state.signals = Some(tx);

        Ok(JoinedRoom {
            room_name: format!("net-{}", request.net_id),
            participants: state.participants.clone(),
            signals: rx,
        })
    }

    async fn leave(&self) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        state.calls.push(MediaCall::Leave);
        if !state.joined {
            return Err(MediaError::NotJoined);
        }
        state.reset_room();
        state.signals = None;
        Ok(())
    }

    async fn set_track_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        state.calls.push(MediaCall::SetTrackEnabled(enabled));
        if !state.joined {
            return Err(MediaError::NotJoined);
        }
        if state.should_fail(FailOp::Track) {
            return Err(MediaError::Track("publish track rejected".to_string()));
        }
        if enabled {
            match &state.capture {
                None => return Err(MediaError::Track("no capture stream open".to_string())),
                Some(Some(id)) if state.silent_devices.contains(id) => {
                    return Err(MediaError::Track(format!("{} cannot publish", id)));
                }
                Some(_) => {}
            }
        }
        state.track_enabled = enabled;
        Ok(())
    }

    async fn open_capture(&self, device_id: Option<&str>) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        state
            .calls
            .push(MediaCall::OpenCapture(device_id.map(str::to_string)));
        if state.capture.is_some() {
            return Err(MediaError::Device("capture device already open".to_string()));
        }
        if state.should_fail(FailOp::OpenCapture)
            || device_id.is_some_and(|id| state.bad_devices.contains(id))
        {
            return Err(MediaError::Device(format!(
                "cannot open {}",
                device_id.unwrap_or("default device")
            )));
        }
        state.capture = Some(device_id.map(str::to_string));
        Ok(())
    }

    async fn close_capture(&self) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        state.calls.push(MediaCall::CloseCapture);
        state.track_enabled = false;
        state.capture = None;
        Ok(())
    }

    async fn bind_publish(&self, bus: &Bus) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        state.calls.push(MediaCall::BindPublish(bus.clone()));
        if !state.joined {
            return Err(MediaError::NotJoined);
        }
        if state.should_fail(FailOp::Bind) {
            return Err(MediaError::Track(format!("cannot publish to {:?}", bus)));
        }
        state.bound.insert(bus.clone());
        state.max_bound = state.max_bound.max(state.bound.len());
        Ok(())
    }

    async fn unbind_publish(&self, bus: &Bus) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        state.calls.push(MediaCall::UnbindPublish(bus.clone()));
        if !state.joined {
            return Err(MediaError::NotJoined);
        }
        state.bound.remove(bus);
        Ok(())
    }

    async fn subscribe(&self, net: &NetId) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        state.calls.push(MediaCall::Subscribe(net.clone()));
        if !state.joined {
            return Err(MediaError::NotJoined);
        }
        if state.should_fail(FailOp::Subscribe) {
            return Err(MediaError::Network(format!("cannot subscribe to {}", net)));
        }
        state.subscriptions.insert(net.clone());
        Ok(())
    }

    async fn unsubscribe(&self, net: &NetId) -> Result<(), MediaError> {
        let mut state = self.state.lock();
        state.calls.push(MediaCall::Unsubscribe(net.clone()));
        if !state.joined {
            return Err(MediaError::NotJoined);
        }
        state.subscriptions.remove(net);
        Ok(())
    }
}
