use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::broadcast;
use tracing::{error, info};

/// Installs ctrl-C / SIGTERM handlers and fans the signal out to every
/// component that needs to stop: a flag polled by blocking loops and a
/// broadcast channel for the pipeline stages.
pub struct ShutdownManager {
    flag: Arc<AtomicBool>,
    signal: broadcast::Sender<()>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let flag = Arc::new(AtomicBool::new(false));
        let (signal, _) = broadcast::channel(1);

        let trigger = {
            let flag = flag.clone();
            let signal = signal.clone();
            move || {
                info!("shutdown signal received");
                flag.store(true, Ordering::Relaxed);
                let _ = signal.send(());
            }
        };

        {
            let trigger = trigger.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => trigger(),
                    Err(err) => error!("error listening for ctrl-c: {err}"),
                }
            });
        }

        #[cfg(unix)]
        {
            tokio::spawn(async move {
                let mut term_signal =
                    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    {
                        Ok(term_signal) => term_signal,
                        Err(err) => {
                            error!("failed to install SIGTERM handler: {err}");
                            return;
                        }
                    };

                term_signal.recv().await;
                trigger();
            });
        }

        ShutdownManager { flag, signal }
    }

    /// Flag for blocking loops (the initial-sync committer).
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.signal.subscribe()
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
