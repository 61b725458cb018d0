//! Graceful double-Ctrl+C shutdown: the first signal cancels the run
//! and lets in-flight tasks drain; a second signal force-exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub fn install_shutdown_handler(cancel: CancellationToken) {
    let got_first_signal = Arc::new(AtomicBool::new(false));

    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_signal.swap(true, Ordering::SeqCst) {
                eprintln!("\nforce exit.");
                std::process::exit(130);
            }
            eprintln!("\nshutting down gracefully (Ctrl+C again to force)...");
            cancel.cancel();
        }
    });
}
