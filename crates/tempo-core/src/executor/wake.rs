//! WakeSignal - acquisition loop の起床シグナル

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// 1 スロットの合流する起床通知
///
/// 誰も待っていない間の `notify` は permit を 1 つだけ保持する。
/// 次の `wait` までの追加の `notify` は同じ permit に吸収される。
#[derive(Debug, Clone, Default)]
pub struct WakeSignal {
    notify: Arc<Notify>,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// Sleep for at most `timeout`. Returns `true` when cut short by a signal.
    pub async fn wait(&self, timeout: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.notify.notified() => true,
            _ = tokio::time::sleep(timeout) => false,
        }
    }
}
