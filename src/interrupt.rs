use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

async fn shutdown_signal() -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            res = &mut ctrl_c => res.context("Failed to listen for SIGINT")?,
            _ = term.recv() => {}
        }
        return Ok(());
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.context("Failed to listen for Ctrl-C")
    }
}

/// Cancels `token` on SIGINT or SIGTERM. Nothing else is intercepted.
pub fn install(token: CancellationToken) {
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => {
                log::info!("interrupt received");
                token.cancel();
            }
            Err(err) => log::warn!("{:#}", err),
        }
    });
}
