use std::{collections::VecDeque, time::Duration};

use fusion_core::SignalMessage;
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};

use crate::{
    client::{ClientError, SignalingClient},
    tracker::{CallError, CallTracker},
};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
const MAX_BACKLOG: usize = 256;

/// Periodically drains the local user's mailbox and feeds every signal to the
/// call tracker. Optionally forwards the raw signals (ICE candidates and the
/// like) to whoever drives the media session.
pub struct MailboxPoller {
    client: SignalingClient,
    tracker: CallTracker,
    interval: Duration,
    forward: Option<mpsc::Sender<SignalMessage>>,
    /// Drained signals the tracker could not persist yet, oldest first.
    backlog: Mutex<VecDeque<SignalMessage>>,
}

impl MailboxPoller {
    pub fn new(client: SignalingClient, tracker: CallTracker, interval: Duration) -> Self {
        Self {
            client,
            tracker,
            interval: interval.max(MIN_POLL_INTERVAL),
            forward: None,
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_forwarding(mut self, forward: mpsc::Sender<SignalMessage>) -> Self {
        self.forward = Some(forward);
        self
    }

    /// One drain of the mailbox. The server forgets a signal once it is
    /// delivered, so a signal the tracker fails to persist stays queued here
    /// and is applied, in order, ahead of newer ones on the next poll.
    /// Returns the signals fetched by this poll.
    pub async fn poll_once(&self) -> Result<Vec<SignalMessage>, ClientError> {
        let mut backlog = self.backlog.lock().await;
        let signals = match self.client.fetch_signals(self.tracker.local_user()).await {
            Ok(signals) => signals,
            Err(err) => {
                self.apply_backlog(&mut backlog).await;
                return Err(err);
            }
        };

        backlog.extend(signals.iter().cloned());
        self.apply_backlog(&mut backlog).await;
        drop(backlog);

        if let Some(forward) = &self.forward {
            for message in &signals {
                if forward.send(message.clone()).await.is_err() {
                    tracing::debug!("signal consumer went away");
                    break;
                }
            }
        }
        Ok(signals)
    }

    /// Number of signals waiting for the tracker to accept them.
    pub async fn backlog_len(&self) -> usize {
        self.backlog.lock().await.len()
    }

    async fn apply_backlog(&self, backlog: &mut VecDeque<SignalMessage>) {
        while let Some(message) = backlog.front() {
            match self.tracker.apply_signal(message).await {
                Ok(_) => {}
                Err(CallError::Store(err)) => {
                    tracing::warn!(
                        from = %message.from,
                        kind = %message.kind,
                        %err,
                        pending = backlog.len(),
                        "could not persist signal; retrying on the next poll"
                    );
                    break;
                }
                Err(err) => {
                    tracing::warn!(
                        from = %message.from,
                        kind = %message.kind,
                        %err,
                        "failed to apply signal to the active call"
                    );
                }
            }
            backlog.pop_front();
        }

        while backlog.len() > MAX_BACKLOG {
            if let Some(dropped) = backlog.pop_front() {
                tracing::warn!(
                    from = %dropped.from,
                    kind = %dropped.kind,
                    "signal backlog is full; dropping the oldest signal"
                );
            }
        }
    }

    /// Polls on a fixed cadence until the returned handle is shut down or
    /// dropped. Fetch errors are logged and retried on the next tick.
    pub fn spawn(self) -> PollerHandle {
        let (shutdown, mut stop) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.poll_once().await {
                            tracing::warn!(%err, "mailbox poll failed");
                        }
                    }
                }
            }
            tracing::debug!(user = self.tracker.local_user(), "mailbox poller stopped");
        });

        PollerHandle {
            shutdown: Some(shutdown),
            task,
        }
    }
}

pub struct PollerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(err) = (&mut self.task).await {
            tracing::warn!(?err, "mailbox poller task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        store::InMemoryActiveCallStore,
        test_support::{FlakyStore, TestGateway},
        tracker::{CallEvent, TrackerConfig},
    };
    use fusion_core::{
        now_millis,
        signal::{SIGNAL_ANSWER, SIGNAL_OFFER},
        CallStatus, CallType,
    };
    use serde_json::json;
    use std::sync::Arc;

    fn tracker(user: &str) -> CallTracker {
        CallTracker::new(
            user,
            Arc::new(InMemoryActiveCallStore::new()),
            TrackerConfig::default(),
        )
    }

    #[tokio::test]
    async fn poll_applies_answers_and_drains_the_mailbox() {
        let gateway = TestGateway::start().await;
        let client = SignalingClient::new(gateway.base_url()).unwrap();
        let alice = tracker("alice");
        alice.initiate("bob", CallType::Voice).await.unwrap();

        gateway.enqueue(SignalMessage::new(
            "bob",
            "alice",
            SIGNAL_ANSWER,
            json!({"sdp": "v=0"}),
            now_millis(),
        ))
        .await;
        let poller = MailboxPoller::new(client, alice.clone(), Duration::from_secs(1));

        let signals = poller.poll_once().await.unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(gateway.pending("alice").await, 0);
        assert_eq!(
            alice.active_call().await.map(|call| call.status),
            Some(CallStatus::Connected)
        );
        assert!(poller.poll_once().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn spawned_poller_rings_the_callee_and_forwards_signals() {
        let gateway = TestGateway::start().await;
        let client = SignalingClient::new(gateway.base_url()).unwrap();
        let bob = tracker("bob");
        let mut events = bob.subscribe();
        let (tx, mut rx) = mpsc::channel(8);

        let handle = MailboxPoller::new(client.clone(), bob.clone(), Duration::from_millis(20))
            .with_forwarding(tx)
            .spawn();

        client
            .send_signal("alice", "bob", SIGNAL_OFFER, json!({"callType": "video"}))
            .await
            .unwrap();

        let forwarded = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("poller delivered the offer")
            .expect("channel open");
        assert_eq!(forwarded.kind, SIGNAL_OFFER);

        match events.recv().await {
            Some(CallEvent::Changed(call)) => {
                assert_eq!(call.caller, "alice");
                assert_eq!(call.kind, CallType::Video);
                assert_eq!(call.status, CallStatus::Calling);
            }
            other => panic!("expected incoming call, got {other:?}"),
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn signals_that_fail_to_persist_are_replayed_on_the_next_poll() {
        let gateway = TestGateway::start().await;
        let client = SignalingClient::new(gateway.base_url()).unwrap();
        let store = Arc::new(FlakyStore::default());
        let alice = CallTracker::new("alice", store.clone(), TrackerConfig::default());
        alice.initiate("bob", CallType::Voice).await.unwrap();

        gateway
            .enqueue(SignalMessage::new(
                "bob",
                "alice",
                SIGNAL_ANSWER,
                json!({"sdp": "v=0"}),
                now_millis(),
            ))
            .await;
        let poller = MailboxPoller::new(client, alice.clone(), Duration::from_secs(1));

        store.set_failing(true);
        assert_eq!(poller.poll_once().await.unwrap().len(), 1);
        assert_eq!(gateway.pending("alice").await, 0);
        assert_eq!(poller.backlog_len().await, 1);
        assert_eq!(
            alice.active_call().await.map(|call| call.status),
            Some(CallStatus::Calling)
        );

        store.set_failing(false);
        assert!(poller.poll_once().await.unwrap().is_empty());
        assert_eq!(poller.backlog_len().await, 0);
        assert_eq!(
            alice.active_call().await.map(|call| call.status),
            Some(CallStatus::Connected)
        );
    }

    #[tokio::test]
    async fn unreachable_gateway_is_reported_not_fatal() {
        let client = SignalingClient::new("http://127.0.0.1:9").unwrap();
        let poller = MailboxPoller::new(client, tracker("alice"), Duration::from_millis(10));

        assert!(matches!(
            poller.poll_once().await,
            Err(ClientError::Http(_))
        ));

        let handle = poller.spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await;
    }
}
