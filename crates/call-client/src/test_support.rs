//! Test fixtures: the real gateway router on a loopback port, and an active
//! call store whose writes can be switched off.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use fusion_core::{CallData, SignalMessage};
use fusion_server::{build_app, config::ServerConfig, AppState, StorageState};
use fusion_storage::InMemoryKeyValueStore;

use crate::store::{ActiveCallStore, CallStoreError, InMemoryActiveCallStore};

pub struct TestGateway {
    addr: SocketAddr,
    state: AppState,
}

impl TestGateway {
    pub async fn start() -> Self {
        let state = AppState::new(
            Arc::new(ServerConfig::default()),
            StorageState::InMemory,
            Arc::new(InMemoryKeyValueStore::new()),
        );
        let app = build_app(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Drops a signal straight into a mailbox, as if another client sent it.
    pub async fn enqueue(&self, message: SignalMessage) {
        self.state
            .mailbox()
            .save_signal(&message.to, &message)
            .await
            .unwrap();
    }

    pub async fn pending(&self, username: &str) -> usize {
        self.state
            .mailbox()
            .get_signals(username)
            .await
            .unwrap()
            .len()
    }
}

#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryActiveCallStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CallStoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CallStoreError::Unavailable("disk full".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ActiveCallStore for FlakyStore {
    async fn load(&self) -> Result<Option<CallData>, CallStoreError> {
        self.inner.load().await
    }

    async fn save(&self, call: &CallData) -> Result<(), CallStoreError> {
        self.check()?;
        self.inner.save(call).await
    }

    async fn clear(&self) -> Result<(), CallStoreError> {
        self.check()?;
        self.inner.clear().await
    }
}
