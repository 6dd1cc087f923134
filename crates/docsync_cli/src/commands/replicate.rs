//! Replication commands.

use docsync_replication::{
    Delivery, EmbeddedRemote, Endpoint, Remote, SyncEvent, SyncedStore, ThreadDelivery,
};
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

/// Which replication to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Remote to local.
    Pull,
    /// Local to remote.
    Push,
    /// Pull, then push.
    Sync,
}

/// The remote side of a replication command.
#[derive(Debug)]
pub struct Target {
    /// Remote locator.
    pub locator: String,
    /// Remote database name.
    pub database: String,
    /// Key and secret, if given.
    pub credentials: Option<(String, String)>,
}

impl Target {
    fn endpoint(&self) -> Endpoint {
        let endpoint = Endpoint::new(self.locator.as_str(), self.database.as_str());
        match &self.credentials {
            Some((key, secret)) => endpoint.with_credentials(key.as_str(), secret.as_str()),
            None => endpoint,
        }
    }
}

/// Opens the remote a locator points at.
///
/// Only in-process remotes can be served here: `file://` databases live in
/// subdirectories of the given path, `memory://` databases start empty.
fn open_remote(endpoint: &Endpoint) -> Result<Arc<dyn Remote>, Box<dyn std::error::Error>> {
    endpoint.validate()?;
    match endpoint.scheme() {
        Some("file") => {
            let root = endpoint
                .file_root()
                .ok_or("file locator has no path")?;
            Ok(Arc::new(EmbeddedRemote::open_dir(root)?))
        }
        Some("memory") => Ok(Arc::new(EmbeddedRemote::in_memory())),
        Some(scheme) => Err(format!("no transport for {scheme} locators in this build").into()),
        None => Err("locator has no scheme".into()),
    }
}

/// Runs a replication and waits for its outcome.
pub fn run(path: &Path, target: &Target, mode: Mode) -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = target.endpoint();
    let remote = open_remote(&endpoint)?;
    let runtime = Runtime::new()?;
    let delivery = Arc::new(ThreadDelivery::new()?);

    let store = SyncedStore::builder()
        .directory(path)
        .endpoint(endpoint.clone())
        .remote(remote)
        .runtime(runtime.handle().clone())
        .delivery(Arc::clone(&delivery) as Arc<dyn Delivery>)
        .build()?;

    let mut events = store.subscribe();
    match mode {
        Mode::Pull => store.pull(|_| {})?,
        Mode::Push => store.push(|_| {})?,
        Mode::Sync => store.sync(|_| {})?,
    };
    let outcome = runtime.block_on(wait_for_outcome(&mut events, mode, &endpoint));

    // Let the delivery thread finish with the store before it is closed.
    delivery.flush();
    drop(store);
    outcome
}

async fn wait_for_outcome(
    events: &mut broadcast::Receiver<SyncEvent>,
    mode: Mode,
    endpoint: &Endpoint,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "missed replication events");
                continue;
            }
            Err(RecvError::Closed) => return Err("replication stopped without an outcome".into()),
        };

        match (mode, event) {
            (Mode::Pull, SyncEvent::PullCompleted { summary, .. }) => {
                println!(
                    "Pulled {} of {} document(s) from {endpoint} (checkpoint {})",
                    summary.documents_written, summary.documents_read, summary.checkpoint
                );
                return Ok(());
            }
            (Mode::Push, SyncEvent::PushCompleted { summary, .. }) => {
                println!(
                    "Pushed {} of {} document(s) to {endpoint} (checkpoint {})",
                    summary.documents_written, summary.documents_read, summary.checkpoint
                );
                return Ok(());
            }
            (Mode::Sync, SyncEvent::SyncCompleted(summary)) => {
                println!(
                    "Synced with {endpoint}: pulled {}, pushed {}",
                    summary.pulled.documents_written, summary.pushed.documents_written
                );
                return Ok(());
            }
            (
                _,
                SyncEvent::ReplicationFailed {
                    direction,
                    cause,
                    message,
                    ..
                },
            ) => {
                return Err(format!("{direction} failed ({cause}): {message}").into());
            }
            _ => {}
        }
    }
}
