//! Talk-session orchestration
//!
//! Applications register up to two async handlers on a [`StackchanApp`]:
//! `setup` runs once per connection, `talk_session` runs once per wake-word.
//! The orchestrator drives the lifecycle: run setup, then loop awaiting the
//! wake-word latch, invoking the talk session and resetting the firmware to
//! Idle between turns, until the peer disconnects.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

use crate::server::ws_proxy::{SessionError, WsProxy, POLL_INTERVAL};

type SessionHandler =
    Arc<dyn Fn(Arc<WsProxy>) -> BoxFuture<'static, Result<(), SessionError>> + Send + Sync>;

/// Handler registration for one server instance: zero or one `setup`,
/// zero or one `talk_session`.
#[derive(Clone, Default)]
pub struct StackchanApp {
    setup: Option<SessionHandler>,
    talk_session: Option<SessionHandler>,
}

impl StackchanApp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the per-connection setup handler. A handler error aborts
    /// the session.
    pub fn on_setup<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Arc<WsProxy>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SessionError>> + Send + 'static,
    {
        self.setup = Some(Arc::new(move |proxy| Box::pin(handler(proxy))));
        self
    }

    /// Register the per-wake-word conversation handler.
    pub fn on_talk_session<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Arc<WsProxy>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), SessionError>> + Send + 'static,
    {
        self.talk_session = Some(Arc::new(move |proxy| Box::pin(handler(proxy))));
        self
    }
}

/// Drive one accepted session to completion.
pub async fn run_session(app: &StackchanApp, proxy: Arc<WsProxy>) {
    if let Some(setup) = &app.setup {
        if let Err(e) = setup(proxy.clone()).await {
            warn!("setup handler aborted the session: {}", e);
            proxy.close().await;
            return;
        }
    }

    while !proxy.closed() {
        let Some(talk_session) = &app.talk_session else {
            // setup-only applications: idle until the session ends
            tokio::time::sleep(POLL_INTERVAL).await;
            if proxy.receive_task_finished() {
                break;
            }
            continue;
        };

        if proxy.wait_for_talk_session().await.is_err() {
            break;
        }

        match talk_session(proxy.clone()).await {
            Ok(()) => {}
            Err(SessionError::Disconnect) => break,
            Err(e) => {
                info!("talk session ended: {}", e);
            }
        }
        if !proxy.closed() {
            let _ = proxy.reset_state().await;
        }
        if proxy.receive_task_finished() {
            break;
        }
    }

    proxy.close().await;
}
