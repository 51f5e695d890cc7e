//! Serialized firewall mutations.

use tokio::sync::Mutex;

use crate::command::{CommandError, CommandRunner};

/// Node-wide lock around `iptables`/`ip6tables` invocations.
///
/// Held for exactly one command, never across a sequence.
#[derive(Debug, Default)]
pub struct FirewallLock {
    inner: Mutex<()>,
}

impl FirewallLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run(
        &self,
        runner: &dyn CommandRunner,
        program: &str,
        args: &[&str],
    ) -> Result<String, CommandError> {
        let _guard = self.inner.lock().await;
        runner.run(program, args).await
    }
}
