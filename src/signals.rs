/// Signal handling for graceful shutdown.
///
/// SIGINT (Ctrl-C) and SIGTERM both request a clean exit: the loop stops
/// at its next suspension point without invoking the termination
/// executor. A manual shutdown is not a termination decision.
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Install SIGINT/SIGTERM handlers and return the listener half.
    pub fn install() -> std::io::Result<Self> {
        let (tx, rx) = watch::channel(false);
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => tracing::info!("received SIGINT"),
                _ = sigterm.recv() => tracing::info!("received SIGTERM"),
            }
            let _ = tx.send(true);
        });
        Ok(Self { rx })
    }

    /// A signal source driven by the returned sender instead of the OS.
    #[cfg(test)]
    pub fn manual() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// Resolves once a shutdown has been requested. Cancel-safe, so it can
    /// sit inside a `select!` against the poll timer.
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            // A dropped sender means the handler task is gone; treat it
            // as a shutdown rather than waiting forever.
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_manual_trigger_resolves_wait() {
        let (tx, mut shutdown) = ShutdownSignal::manual();
        assert!(!shutdown.is_shutdown());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait())
            .await
            .expect("wait should resolve after trigger");
        assert!(shutdown.is_shutdown());

        // Already-shut-down waits resolve immediately.
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait())
            .await
            .expect("wait should resolve again");
    }

    #[tokio::test]
    async fn test_dropped_sender_counts_as_shutdown() {
        let (tx, mut shutdown) = ShutdownSignal::manual();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait())
            .await
            .expect("wait should resolve after sender drop");
    }

    #[tokio::test]
    async fn test_wait_pends_until_triggered() {
        let (_tx, mut shutdown) = ShutdownSignal::manual();
        let result = tokio::time::timeout(Duration::from_millis(50), shutdown.wait()).await;
        assert!(result.is_err(), "wait should still be pending");
    }
}
