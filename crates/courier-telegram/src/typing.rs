//! Typing indicator — sends the "typing" chat action every 4 seconds.
//!
//! Telegram's typing status expires after ~5 seconds, so we refresh every
//! 4s. Failures are discarded; `TypingHandle::stop()` aborts the loop.

use std::sync::Arc;
use std::time::Duration;

use crate::api::MessagePort;

/// Handle to a detached typing-indicator task.
pub struct TypingHandle(tokio::task::JoinHandle<()>);

impl TypingHandle {
    /// Send the typing action immediately, then every 4 seconds.
    pub fn start(api: Arc<dyn MessagePort>, chat_id: i64) -> Self {
        let handle = tokio::spawn(async move {
            loop {
                let _ = api.send_chat_action(chat_id, "typing").await;
                tokio::time::sleep(Duration::from_secs(4)).await;
            }
        });
        TypingHandle(handle)
    }

    pub fn stop(self) {
        self.0.abort();
    }
}
