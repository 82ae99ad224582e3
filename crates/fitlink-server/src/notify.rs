//! Hand-off to the push/email collaborator for receivers who are offline.

use async_trait::async_trait;
use tracing::info;

use fitlink_store::Message;

#[async_trait]
pub trait OfflineNotifier: Send + Sync {
    /// Best-effort delivery. Errors are logged by the caller and never fail
    /// the send.
    async fn notify(&self, message: &Message, recipient_id: &str) -> anyhow::Result<()>;
}

/// Default notifier: records the hand-off in the log.
pub struct LogNotifier;

#[async_trait]
impl OfflineNotifier for LogNotifier {
    async fn notify(&self, message: &Message, recipient_id: &str) -> anyhow::Result<()> {
        info!(
            recipient = recipient_id,
            conversation = %message.conversation_id,
            message = %message.id,
            "Recipient offline, notification queued"
        );
        Ok(())
    }
}
