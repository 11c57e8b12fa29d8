//! Local state machine for the single active call of one user.
//!
//! ```text
//! idle -> calling -> connected -> ended -> idle
//!            |-> declined --------------^
//!            `-> missed ----------------^
//! ```
//!
//! Every transition is written to the [`ActiveCallStore`] before it becomes
//! visible, then broadcast to subscribers. Terminal records linger for
//! `clear_delay` so the UI can show the outcome, then the tracker returns to
//! idle.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use fusion_core::{
    now_millis,
    signal::{SIGNAL_ANSWER, SIGNAL_DECLINE, SIGNAL_HANGUP, SIGNAL_OFFER},
    CallData, CallStatus, CallType, SignalMessage,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{
    broadcast::{self, error::RecvError, error::TryRecvError},
    Mutex,
};

use crate::store::{ActiveCallStore, CallStoreError};

pub const DEFAULT_RING_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CLEAR_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_SIMULATED_CONNECT_DELAY: Duration = Duration::from_secs(2);
const EVENT_CAPACITY: usize = 64;
const TIMER_RETRY_INITIAL: Duration = Duration::from_secs(1);
const TIMER_RETRY_MAX: Duration = Duration::from_secs(30);

/// How an outgoing call reaches `connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectMode {
    /// Wait for the callee's `answer` signal.
    #[default]
    Signaled,
    /// Fallback and test double: connect after a fixed delay without hearing
    /// from the callee at all.
    SimulatedDelay(Duration),
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub connect_mode: ConnectMode,
    /// How long a call may stay in `calling` before it is marked `missed`.
    pub ring_timeout: Duration,
    /// How long a finished call stays visible before the tracker is idle again.
    pub clear_delay: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            connect_mode: ConnectMode::Signaled,
            ring_timeout: DEFAULT_RING_TIMEOUT,
            clear_delay: DEFAULT_CLEAR_DELAY,
        }
    }
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("recipient must be provided")]
    MissingRecipient,
    #[error("cannot place a call to yourself")]
    SelfCall,
    #[error("already in call {id}")]
    Busy { id: String },
    #[error("no active call")]
    NoActiveCall,
    #[error("only the recipient can answer or decline an incoming call")]
    NotIncoming,
    #[error("cannot {action} while the call is {status}")]
    InvalidTransition {
        action: &'static str,
        status: CallStatus,
    },
    #[error(transparent)]
    Store(#[from] CallStoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    /// The active call moved to a new state.
    Changed(CallData),
    /// The finished call was removed and the tracker is idle.
    Cleared { id: String },
}

/// Receives tracker events until dropped or cancelled. Events sent before the
/// subscription existed are not replayed; read [`CallTracker::active_call`]
/// for the current state.
pub struct CallSubscription {
    receiver: broadcast::Receiver<CallEvent>,
}

impl CallSubscription {
    pub async fn recv(&mut self) -> Option<CallEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "call event subscriber fell behind");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<CallEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "call event subscriber fell behind");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn cancel(self) {}
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    SimulatedConnect,
    RingTimeout,
    Clear,
}

struct Inner {
    local_user: String,
    store: Arc<dyn ActiveCallStore>,
    config: TrackerConfig,
    session: Mutex<Option<CallData>>,
    events: broadcast::Sender<CallEvent>,
}

#[derive(Clone)]
pub struct CallTracker {
    inner: Arc<Inner>,
}

impl CallTracker {
    pub fn new(
        local_user: impl Into<String>,
        store: Arc<dyn ActiveCallStore>,
        config: TrackerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                local_user: local_user.into(),
                store,
                config,
                session: Mutex::new(None),
                events,
            }),
        }
    }

    pub fn local_user(&self) -> &str {
        &self.inner.local_user
    }

    pub fn subscribe(&self) -> CallSubscription {
        CallSubscription {
            receiver: self.inner.events.subscribe(),
        }
    }

    pub async fn active_call(&self) -> Option<CallData> {
        self.inner.session.lock().await.clone()
    }

    /// True while a call is ringing or connected. A finished call that is
    /// still on display does not count and is replaced by the next call.
    pub async fn is_in_call(&self) -> bool {
        is_live(&*self.inner.session.lock().await)
    }

    /// Reloads the active call from the store and re-arms whatever timer the
    /// record still needs. Does not broadcast.
    pub async fn restore(&self) -> Result<Option<CallData>, CallError> {
        let inner = &self.inner;
        let mut session = inner.session.lock().await;

        let Some(call) = inner.store.load().await? else {
            *session = None;
            return Ok(None);
        };
        if !call.involves(&inner.local_user) {
            tracing::warn!(call_id = %call.id, "discarding stored call that belongs to another user");
            inner.store.clear().await?;
            *session = None;
            return Ok(None);
        }
        *session = Some(call.clone());
        drop(session);

        let elapsed = Duration::from_millis((now_millis() - call.start_time).max(0) as u64);
        match call.status {
            CallStatus::Calling => {
                if let (ConnectMode::SimulatedDelay(delay), true) = (
                    inner.config.connect_mode,
                    call.caller == inner.local_user,
                ) {
                    inner.schedule(Timer::SimulatedConnect, &call.id, delay.saturating_sub(elapsed));
                }
                inner.schedule(
                    Timer::RingTimeout,
                    &call.id,
                    inner.config.ring_timeout.saturating_sub(elapsed),
                );
            }
            CallStatus::Connected => {}
            CallStatus::Ended | CallStatus::Declined | CallStatus::Missed => {
                inner.schedule(Timer::Clear, &call.id, inner.config.clear_delay);
            }
        }

        tracing::info!(call_id = %call.id, status = %call.status, "restored active call");
        Ok(Some(call))
    }

    /// Starts an outgoing call from the local user to `recipient`.
    pub async fn initiate(&self, recipient: &str, kind: CallType) -> Result<CallData, CallError> {
        let inner = &self.inner;
        let recipient = recipient.trim();
        if recipient.is_empty() {
            return Err(CallError::MissingRecipient);
        }
        if recipient == inner.local_user {
            return Err(CallError::SelfCall);
        }

        let mut session = inner.session.lock().await;
        if let Some(active) = session.as_ref().filter(|call| !call.status.is_terminal()) {
            return Err(CallError::Busy {
                id: active.id.clone(),
            });
        }

        let call = CallData::new(&inner.local_user, recipient, kind, now_millis());
        inner.replace(&mut session, call.clone()).await?;
        drop(session);

        if let ConnectMode::SimulatedDelay(delay) = inner.config.connect_mode {
            inner.schedule(Timer::SimulatedConnect, &call.id, delay);
        }
        inner.schedule(Timer::RingTimeout, &call.id, inner.config.ring_timeout);

        tracing::info!(call_id = %call.id, recipient, kind = %kind, "placing call");
        Ok(call)
    }

    /// Feeds one mailbox message into the state machine. Returns the new call
    /// state when the message caused a transition.
    pub async fn apply_signal(
        &self,
        message: &SignalMessage,
    ) -> Result<Option<CallData>, CallError> {
        let inner = &self.inner;
        if message.to != inner.local_user {
            tracing::debug!(to = %message.to, "ignoring signal addressed to another user");
            return Ok(None);
        }

        let mut session = inner.session.lock().await;
        if !is_live(&session) && message.is_kind(SIGNAL_OFFER) && message.from != inner.local_user {
            let call = CallData::new(
                &message.from,
                &inner.local_user,
                offered_call_type(&message.signal),
                now_millis(),
            );
            inner.replace(&mut session, call.clone()).await?;
            drop(session);
            inner.schedule(Timer::RingTimeout, &call.id, inner.config.ring_timeout);
            tracing::info!(call_id = %call.id, caller = %call.caller, "incoming call");
            return Ok(Some(call));
        }
        let Some(current) = session.clone() else {
            return Ok(None);
        };

        if current.peer_of(&inner.local_user) != message.from {
            tracing::debug!(
                from = %message.from,
                kind = %message.kind,
                "ignoring signal from outside the active call"
            );
            return Ok(None);
        }

        let outgoing = current.caller == inner.local_user;
        let ringing = current.status == CallStatus::Calling;
        let now = now_millis();
        let mut next = current.clone();
        match message.kind.as_str() {
            SIGNAL_ANSWER if outgoing && ringing => {
                next.status = CallStatus::Connected;
                next.connect_time = Some(now);
            }
            SIGNAL_DECLINE if outgoing && ringing => {
                next.status = CallStatus::Declined;
                next.end_time = Some(now);
            }
            SIGNAL_HANGUP if !current.status.is_terminal() => {
                next.status = CallStatus::Ended;
                next.end_time = Some(now);
            }
            _ => return Ok(None),
        }

        inner.commit(&mut session, next.clone()).await?;
        drop(session);
        if next.status.is_terminal() {
            inner.schedule(Timer::Clear, &next.id, inner.config.clear_delay);
        }
        tracing::info!(call_id = %next.id, status = %next.status, "call updated by peer");
        Ok(Some(next))
    }

    /// Answers a ringing incoming call.
    pub async fn accept(&self) -> Result<CallData, CallError> {
        self.respond_to_incoming("accept", CallStatus::Connected).await
    }

    /// Rejects a ringing incoming call.
    pub async fn decline(&self) -> Result<CallData, CallError> {
        self.respond_to_incoming("decline", CallStatus::Declined).await
    }

    async fn respond_to_incoming(
        &self,
        action: &'static str,
        status: CallStatus,
    ) -> Result<CallData, CallError> {
        let inner = &self.inner;
        let mut session = inner.session.lock().await;
        let current = session.clone().ok_or(CallError::NoActiveCall)?;
        if current.caller == inner.local_user {
            return Err(CallError::NotIncoming);
        }
        if current.status != CallStatus::Calling {
            return Err(CallError::InvalidTransition {
                action,
                status: current.status,
            });
        }

        let now = now_millis();
        let mut next = current;
        next.status = status;
        match status {
            CallStatus::Connected => next.connect_time = Some(now),
            _ => next.end_time = Some(now),
        }

        inner.commit(&mut session, next.clone()).await?;
        drop(session);
        if next.status.is_terminal() {
            inner.schedule(Timer::Clear, &next.id, inner.config.clear_delay);
        }
        tracing::info!(call_id = %next.id, status = %next.status, "answered incoming call");
        Ok(next)
    }

    /// Hangs up. A call that already finished (`ended`, `declined` or
    /// `missed`) is returned unchanged so its outcome is kept for history.
    pub async fn end(&self) -> Result<CallData, CallError> {
        let inner = &self.inner;
        let mut session = inner.session.lock().await;
        let current = session.clone().ok_or(CallError::NoActiveCall)?;
        if current.status.is_terminal() {
            return Ok(current);
        }

        let mut next = current;
        next.status = CallStatus::Ended;
        next.end_time = Some(now_millis());

        inner.commit(&mut session, next.clone()).await?;
        drop(session);
        inner.schedule(Timer::Clear, &next.id, inner.config.clear_delay);
        tracing::info!(call_id = %next.id, "call ended locally");
        Ok(next)
    }
}

impl Inner {
    /// Persists `call` and only then publishes it.
    async fn commit(
        &self,
        session: &mut Option<CallData>,
        call: CallData,
    ) -> Result<(), CallError> {
        self.store.save(&call).await?;
        *session = Some(call.clone());
        let _ = self.events.send(CallEvent::Changed(call));
        Ok(())
    }

    /// Starts `call` in place of a finished call that is still on display.
    async fn replace(
        &self,
        session: &mut Option<CallData>,
        call: CallData,
    ) -> Result<(), CallError> {
        let previous = session.as_ref().map(|call| call.id.clone());
        self.store.save(&call).await?;
        *session = Some(call.clone());
        if let Some(id) = previous {
            let _ = self.events.send(CallEvent::Cleared { id });
        }
        let _ = self.events.send(CallEvent::Changed(call));
        Ok(())
    }

    async fn clear(&self, session: &mut Option<CallData>) -> Result<(), CallError> {
        let Some(id) = session.as_ref().map(|call| call.id.clone()) else {
            return Ok(());
        };
        self.store.clear().await?;
        *session = None;
        let _ = self.events.send(CallEvent::Cleared { id });
        Ok(())
    }

    /// Runs `timer` for `call_id` after `delay`. The timer does nothing if
    /// that call is gone or has moved past the state the timer expects. A
    /// transition the store refuses is retried with backoff.
    fn schedule(self: &Arc<Self>, timer: Timer, call_id: &str, delay: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let call_id = call_id.to_owned();
        tokio::spawn(async move {
            let mut pending = Some((timer, delay));
            let mut retry = TIMER_RETRY_INITIAL;
            while let Some((timer, delay)) = pending.take() {
                tokio::time::sleep(delay).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                pending = match inner.fire(timer, &call_id).await {
                    Ok(next) => {
                        retry = TIMER_RETRY_INITIAL;
                        next
                    }
                    Err(err) => {
                        tracing::warn!(
                            %call_id,
                            ?timer,
                            %err,
                            retry_in = ?retry,
                            "timed call transition failed; keeping previous state"
                        );
                        let delay = retry;
                        retry = (retry * 2).min(TIMER_RETRY_MAX);
                        Some((timer, delay))
                    }
                };
            }
        });
    }

    async fn fire(
        &self,
        timer: Timer,
        call_id: &str,
    ) -> Result<Option<(Timer, Duration)>, CallError> {
        let mut session = self.session.lock().await;
        let Some(current) = session.clone().filter(|call| call.id == call_id) else {
            return Ok(None);
        };

        let now = now_millis();
        let mut next = current.clone();
        let result = match timer {
            Timer::SimulatedConnect if current.status == CallStatus::Calling => {
                next.status = CallStatus::Connected;
                next.connect_time = Some(now);
                self.commit(&mut session, next).await
            }
            Timer::RingTimeout if current.status == CallStatus::Calling => {
                next.status = CallStatus::Missed;
                next.end_time = Some(now);
                self.commit(&mut session, next).await
            }
            Timer::Clear if current.status.is_terminal() => self.clear(&mut session).await,
            _ => return Ok(None),
        };
        result?;

        if let Timer::RingTimeout = timer {
            tracing::info!(call_id, "call was not answered");
            return Ok(Some((Timer::Clear, self.config.clear_delay)));
        }
        Ok(None)
    }
}

fn is_live(session: &Option<CallData>) -> bool {
    session
        .as_ref()
        .is_some_and(|call| !call.status.is_terminal())
}

/// Callers put `{"callType": "video"}` in the offer payload; anything else is
/// a voice call.
fn offered_call_type(signal: &Value) -> CallType {
    signal
        .get("callType")
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(CallType::Voice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::InMemoryActiveCallStore, test_support::FlakyStore};
    use serde_json::json;

    fn tracker_with(
        user: &str,
        config: TrackerConfig,
    ) -> (CallTracker, Arc<InMemoryActiveCallStore>) {
        let store = Arc::new(InMemoryActiveCallStore::new());
        (CallTracker::new(user, store.clone(), config), store)
    }

    fn tracker(user: &str) -> (CallTracker, Arc<InMemoryActiveCallStore>) {
        tracker_with(user, TrackerConfig::default())
    }

    fn signal(from: &str, to: &str, kind: &str, payload: Value) -> SignalMessage {
        SignalMessage::new(from, to, kind, payload, now_millis())
    }

    #[tokio::test(start_paused = true)]
    async fn initiate_moves_idle_to_calling_and_persists() {
        let (tracker, store) = tracker("alice");
        let mut events = tracker.subscribe();

        let call = tracker.initiate("bob", CallType::Voice).await.unwrap();

        assert_eq!(call.caller, "alice");
        assert_eq!(call.recipient, "bob");
        assert_eq!(call.kind, CallType::Voice);
        assert_eq!(call.status, CallStatus::Calling);
        assert!(call.end_time.is_none());
        assert_eq!(store.load().await.unwrap(), Some(call.clone()));
        assert_eq!(tracker.active_call().await, Some(call.clone()));
        assert!(tracker.is_in_call().await);
        assert_eq!(events.recv().await, Some(CallEvent::Changed(call)));
    }

    #[tokio::test(start_paused = true)]
    async fn initiate_is_rejected_without_state_change() {
        let (tracker, store) = tracker("alice");

        assert!(matches!(
            tracker.initiate("alice", CallType::Voice).await,
            Err(CallError::SelfCall)
        ));
        assert!(matches!(
            tracker.initiate("   ", CallType::Voice).await,
            Err(CallError::MissingRecipient)
        ));
        assert!(tracker.active_call().await.is_none());
        assert!(store.load().await.unwrap().is_none());

        let first = tracker.initiate("bob", CallType::Video).await.unwrap();
        let mut events = tracker.subscribe();
        match tracker.initiate("carol", CallType::Voice).await {
            Err(CallError::Busy { id }) => assert_eq!(id, first.id),
            other => panic!("expected busy, got {other:?}"),
        }
        assert_eq!(tracker.active_call().await, Some(first.clone()));
        assert_eq!(store.load().await.unwrap(), Some(first));
        assert!(events.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn answer_from_the_callee_connects() {
        let (tracker, _) = tracker("alice");
        let call = tracker.initiate("bob", CallType::Video).await.unwrap();

        let connected = tracker
            .apply_signal(&signal("bob", "alice", SIGNAL_ANSWER, json!({"sdp": "v=0"})))
            .await
            .unwrap()
            .expect("transition");

        assert_eq!(connected.status, CallStatus::Connected);
        assert!(connected.connect_time.is_some());
        assert_eq!(connected.id, call.id);
        assert_eq!(connected.caller, call.caller);
        assert_eq!(connected.recipient, call.recipient);
        assert_eq!(connected.kind, call.kind);
        assert_eq!(connected.start_time, call.start_time);
    }

    #[tokio::test(start_paused = true)]
    async fn unrelated_signals_do_not_touch_the_call() {
        let (tracker, _) = tracker("alice");
        let call = tracker.initiate("bob", CallType::Voice).await.unwrap();

        for message in [
            signal("mallory", "alice", SIGNAL_ANSWER, json!("x")),
            signal("bob", "carol", SIGNAL_ANSWER, json!("x")),
            signal("bob", "alice", "candidate", json!({"candidate": "a=1"})),
            signal("bob", "alice", SIGNAL_OFFER, json!("x")),
        ] {
            assert!(tracker.apply_signal(&message).await.unwrap().is_none());
        }
        assert_eq!(tracker.active_call().await, Some(call));
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_delay_connects_after_the_delay() {
        let config = TrackerConfig {
            connect_mode: ConnectMode::SimulatedDelay(DEFAULT_SIMULATED_CONNECT_DELAY),
            ..TrackerConfig::default()
        };
        let (tracker, _) = tracker_with("alice", config);
        let mut events = tracker.subscribe();
        let call = tracker.initiate("bob", CallType::Voice).await.unwrap();
        assert!(matches!(events.recv().await, Some(CallEvent::Changed(c)) if c.status == CallStatus::Calling));

        match events.recv().await {
            Some(CallEvent::Changed(connected)) => {
                assert_eq!(connected.status, CallStatus::Connected);
                assert_eq!(connected.id, call.id);
                assert_eq!(connected.recipient, "bob");
            }
            other => panic!("expected connect, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn end_sets_end_time_and_clears_after_grace() {
        let (tracker, store) = tracker("alice");
        let call = tracker.initiate("bob", CallType::Voice).await.unwrap();
        tracker
            .apply_signal(&signal("bob", "alice", SIGNAL_ANSWER, json!("sdp")))
            .await
            .unwrap();
        let mut events = tracker.subscribe();

        let ended = tracker.end().await.unwrap();
        assert_eq!(ended.status, CallStatus::Ended);
        assert!(ended.end_time.unwrap() >= ended.start_time);
        assert!(!tracker.is_in_call().await);
        assert_eq!(events.recv().await, Some(CallEvent::Changed(ended.clone())));

        assert_eq!(
            events.recv().await,
            Some(CallEvent::Cleared { id: call.id.clone() })
        );
        assert!(tracker.active_call().await.is_none());
        assert!(store.load().await.unwrap().is_none());

        let history = ended.to_history().expect("finished call");
        assert_eq!(history.status.as_deref(), Some("completed"));
    }

    #[tokio::test(start_paused = true)]
    async fn ending_while_calling_cancels_the_simulated_connect() {
        let config = TrackerConfig {
            connect_mode: ConnectMode::SimulatedDelay(Duration::from_secs(1)),
            clear_delay: Duration::from_secs(5),
            ..TrackerConfig::default()
        };
        let (tracker, _) = tracker_with("alice", config);
        tracker.initiate("bob", CallType::Voice).await.unwrap();
        tracker.end().await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        let call = tracker.active_call().await.expect("still lingering");
        assert_eq!(call.status, CallStatus::Ended);
        assert!(call.connect_time.is_none());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(tracker.active_call().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_becomes_missed() {
        let (tracker, _) = tracker("alice");
        let mut events = tracker.subscribe();
        let call = tracker.initiate("bob", CallType::Voice).await.unwrap();
        events.recv().await;

        match events.recv().await {
            Some(CallEvent::Changed(missed)) => {
                assert_eq!(missed.status, CallStatus::Missed);
                assert!(missed.end_time.is_some());
                assert_eq!(
                    missed.to_history().unwrap().status.as_deref(),
                    Some("missed")
                );
            }
            other => panic!("expected missed, got {other:?}"),
        }
        assert_eq!(events.recv().await, Some(CallEvent::Cleared { id: call.id }));
    }

    #[tokio::test(start_paused = true)]
    async fn ring_timeout_does_nothing_once_connected() {
        let (tracker, _) = tracker("alice");
        tracker.initiate("bob", CallType::Voice).await.unwrap();
        tracker
            .apply_signal(&signal("bob", "alice", SIGNAL_ANSWER, json!("sdp")))
            .await
            .unwrap();

        tokio::time::sleep(DEFAULT_RING_TIMEOUT * 2).await;
        assert_eq!(
            tracker.active_call().await.map(|call| call.status),
            Some(CallStatus::Connected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn incoming_offer_can_be_accepted_and_hung_up_by_the_peer() {
        let (tracker, _) = tracker("bob");
        let incoming = tracker
            .apply_signal(&signal(
                "alice",
                "bob",
                SIGNAL_OFFER,
                json!({"sdp": "v=0", "callType": "video"}),
            ))
            .await
            .unwrap()
            .expect("incoming call");
        assert_eq!(incoming.caller, "alice");
        assert_eq!(incoming.recipient, "bob");
        assert_eq!(incoming.kind, CallType::Video);
        assert_eq!(incoming.status, CallStatus::Calling);

        let connected = tracker.accept().await.unwrap();
        assert_eq!(connected.status, CallStatus::Connected);

        let ended = tracker
            .apply_signal(&signal("alice", "bob", SIGNAL_HANGUP, Value::Null))
            .await
            .unwrap()
            .expect("hangup");
        assert_eq!(ended.status, CallStatus::Ended);
        assert!(ended.end_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn declining_an_incoming_call() {
        let (tracker, _) = tracker("bob");
        tracker
            .apply_signal(&signal("alice", "bob", SIGNAL_OFFER, json!("sdp")))
            .await
            .unwrap();

        let declined = tracker.decline().await.unwrap();
        assert_eq!(declined.status, CallStatus::Declined);
        assert_eq!(declined.kind, CallType::Voice);
        assert!(matches!(
            tracker.accept().await,
            Err(CallError::InvalidTransition { action: "accept", .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn caller_cannot_accept_its_own_call_and_sees_remote_decline() {
        let (tracker, _) = tracker("alice");
        tracker.initiate("bob", CallType::Voice).await.unwrap();
        assert!(matches!(tracker.accept().await, Err(CallError::NotIncoming)));

        let declined = tracker
            .apply_signal(&signal("bob", "alice", SIGNAL_DECLINE, Value::Null))
            .await
            .unwrap()
            .expect("decline");
        assert_eq!(declined.status, CallStatus::Declined);
        assert_eq!(
            declined.to_history().unwrap().status.as_deref(),
            Some("declined")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn end_without_a_call_is_an_error() {
        let (tracker, _) = tracker("alice");
        assert!(matches!(tracker.end().await, Err(CallError::NoActiveCall)));
        assert!(matches!(tracker.accept().await, Err(CallError::NoActiveCall)));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_store_write_keeps_the_previous_state() {
        let store = Arc::new(FlakyStore::default());
        let tracker = CallTracker::new("alice", store.clone(), TrackerConfig::default());
        let call = tracker.initiate("bob", CallType::Voice).await.unwrap();
        let mut events = tracker.subscribe();

        store.set_failing(true);
        assert!(matches!(tracker.end().await, Err(CallError::Store(_))));
        assert!(tracker
            .apply_signal(&signal("bob", "alice", SIGNAL_ANSWER, json!("sdp")))
            .await
            .is_err());

        assert_eq!(tracker.active_call().await, Some(call.clone()));
        assert_eq!(store.load().await.unwrap(), Some(call));
        assert!(events.try_recv().is_none());

        store.set_failing(false);
        assert_eq!(tracker.end().await.unwrap().status, CallStatus::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_clear_is_retried_until_the_store_recovers() {
        let store = Arc::new(FlakyStore::default());
        let tracker = CallTracker::new("alice", store.clone(), TrackerConfig::default());
        let call = tracker.initiate("bob", CallType::Voice).await.unwrap();
        tracker.end().await.unwrap();
        let mut events = tracker.subscribe();

        store.set_failing(true);
        tokio::time::sleep(DEFAULT_CLEAR_DELAY + Duration::from_millis(500)).await;
        assert_eq!(
            tracker.active_call().await.map(|call| call.status),
            Some(CallStatus::Ended)
        );
        assert!(events.try_recv().is_none());

        store.set_failing(false);
        assert_eq!(events.recv().await, Some(CallEvent::Cleared { id: call.id }));
        assert!(tracker.active_call().await.is_none());
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_ring_timeout_is_retried() {
        let store = Arc::new(FlakyStore::default());
        let tracker = CallTracker::new("alice", store.clone(), TrackerConfig::default());
        tracker.initiate("bob", CallType::Voice).await.unwrap();
        let mut events = tracker.subscribe();

        store.set_failing(true);
        tokio::time::sleep(DEFAULT_RING_TIMEOUT + Duration::from_millis(500)).await;
        assert_eq!(
            tracker.active_call().await.map(|call| call.status),
            Some(CallStatus::Calling)
        );

        store.set_failing(false);
        match events.recv().await {
            Some(CallEvent::Changed(call)) => assert_eq!(call.status, CallStatus::Missed),
            other => panic!("expected missed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn new_call_replaces_a_finished_one_during_the_grace_delay() {
        let (tracker, store) = tracker("alice");
        let first = tracker.initiate("bob", CallType::Voice).await.unwrap();
        tracker
            .apply_signal(&signal("bob", "alice", SIGNAL_DECLINE, Value::Null))
            .await
            .unwrap();
        assert!(!tracker.is_in_call().await);
        let mut events = tracker.subscribe();

        let second = tracker.initiate("carol", CallType::Video).await.unwrap();
        assert_eq!(events.recv().await, Some(CallEvent::Cleared { id: first.id }));
        assert_eq!(events.recv().await, Some(CallEvent::Changed(second.clone())));
        assert!(tracker.is_in_call().await);
        assert_eq!(store.load().await.unwrap(), Some(second.clone()));

        tokio::time::sleep(DEFAULT_CLEAR_DELAY * 2).await;
        assert_eq!(tracker.active_call().await, Some(second));
    }

    #[tokio::test(start_paused = true)]
    async fn offer_during_the_grace_delay_rings() {
        let (tracker, _) = tracker("bob");
        let first = tracker
            .apply_signal(&signal("alice", "bob", SIGNAL_OFFER, json!("sdp")))
            .await
            .unwrap()
            .expect("incoming call");
        tracker.decline().await.unwrap();

        let again = tracker
            .apply_signal(&signal("alice", "bob", SIGNAL_OFFER, json!("sdp")))
            .await
            .unwrap()
            .expect("second incoming call");
        assert_ne!(again.id, first.id);
        assert_eq!(again.status, CallStatus::Calling);
        assert!(tracker.is_in_call().await);
    }

    #[tokio::test(start_paused = true)]
    async fn end_keeps_the_outcome_of_a_finished_call() {
        let (tracker, store) = tracker("alice");
        tracker.initiate("bob", CallType::Voice).await.unwrap();
        let declined = tracker
            .apply_signal(&signal("bob", "alice", SIGNAL_DECLINE, Value::Null))
            .await
            .unwrap()
            .expect("decline");

        assert_eq!(tracker.end().await.unwrap(), declined);
        assert_eq!(store.load().await.unwrap(), Some(declined));

        tracker.initiate("bob", CallType::Voice).await.unwrap();
        tokio::time::sleep(DEFAULT_RING_TIMEOUT + Duration::from_millis(500)).await;
        let missed = tracker.end().await.unwrap();
        assert_eq!(missed.status, CallStatus::Missed);
        assert_eq!(
            missed.to_history().unwrap().status.as_deref(),
            Some("missed")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn restore_recovers_the_call_without_broadcasting() {
        let store = Arc::new(InMemoryActiveCallStore::new());
        let mut stored = CallData::new("alice", "bob", CallType::Video, now_millis());
        stored.status = CallStatus::Connected;
        stored.connect_time = Some(stored.start_time);
        store.save(&stored).await.unwrap();

        let tracker = CallTracker::new("alice", store.clone(), TrackerConfig::default());
        let mut events = tracker.subscribe();
        assert!(tracker.active_call().await.is_none());

        assert_eq!(tracker.restore().await.unwrap(), Some(stored.clone()));
        assert_eq!(tracker.active_call().await, Some(stored));
        assert!(tracker.is_in_call().await);
        assert!(events.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn restored_stale_ringing_call_times_out() {
        let store = Arc::new(InMemoryActiveCallStore::new());
        let stale = CallData::new("alice", "bob", CallType::Voice, now_millis() - 60_000);
        store.save(&stale).await.unwrap();

        let tracker = CallTracker::new("alice", store.clone(), TrackerConfig::default());
        let mut events = tracker.subscribe();
        tracker.restore().await.unwrap();

        match events.recv().await {
            Some(CallEvent::Changed(call)) => assert_eq!(call.status, CallStatus::Missed),
            other => panic!("expected missed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn restore_discards_records_of_other_users() {
        let store = Arc::new(InMemoryActiveCallStore::new());
        store
            .save(&CallData::new("carol", "dave", CallType::Voice, now_millis()))
            .await
            .unwrap();

        let tracker = CallTracker::new("alice", store.clone(), TrackerConfig::default());
        assert!(tracker.restore().await.unwrap().is_none());
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dropping_a_subscription_unsubscribes() {
        let (tracker, _) = tracker("alice");
        let first = tracker.subscribe();
        let second = tracker.subscribe();
        assert_eq!(tracker.inner.events.receiver_count(), 2);

        drop(first);
        second.cancel();
        assert_eq!(tracker.inner.events.receiver_count(), 0);

        tracker.initiate("bob", CallType::Voice).await.unwrap();
    }

    #[tokio::test]
    async fn late_subscribers_get_no_replay() {
        let (tracker, _) = tracker("alice");
        let call = tracker.initiate("bob", CallType::Voice).await.unwrap();

        let mut late = tracker.subscribe();
        assert!(late.try_recv().is_none());
        assert_eq!(tracker.active_call().await, Some(call));
    }

    #[test]
    fn offer_payload_selects_call_type() {
        assert_eq!(offered_call_type(&json!({"callType": "video"})), CallType::Video);
        assert_eq!(offered_call_type(&json!({"callType": "hologram"})), CallType::Voice);
        assert_eq!(offered_call_type(&json!("sdp")), CallType::Voice);
    }
}
