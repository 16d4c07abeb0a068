//! Abstract collaborator interfaces.
//!
//! The agent runtime behind `inject` and whatever records `log` lines are
//! external; the engine only sees these traits. `on_log` is side-effect-only
//! and must not do unbounded work; `on_inject` may block on external I/O and
//! returns the agent's textual reply.

use async_trait::async_trait;

#[async_trait]
pub trait LogHandler: Send + Sync {
    async fn on_log(&self, session: &str, message: &str, sender_sign_pub: &str);
}

#[async_trait]
pub trait InjectHandler: Send + Sync {
    async fn on_inject(
        &self,
        session: &str,
        message: &str,
        sender_sign_pub: &str,
    ) -> anyhow::Result<String>;
}
