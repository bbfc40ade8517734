//! Signal handling for graceful shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::info;

/// Installs SIGINT/SIGTERM handlers on a dedicated thread and returns the
/// shared run flag. The main thread polls the flag at 1 Hz and initiates
/// shutdown once it flips.
pub fn install_shutdown_flag() -> std::io::Result<Arc<AtomicBool>> {
    let should_run = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&should_run);

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::Builder::new().name("signals".into()).spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!("received signal {signal}, initiating shutdown");
            flag.store(false, Ordering::Relaxed);
        }
    })?;

    Ok(should_run)
}
