//! Per-channel recovery: when a single channel closes (e.g. a protocol
//! exception scoped to that channel) while the connection itself is still
//! open, reopen just that channel and re-run its setup, instead of forcing a
//! full connection-level reconnect. Bounded by the same full-jitter backoff
//! used for connection attempts, keyed per channel via `watchdog_attempt`.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use lapin::Channel;
use tracing::{error, warn};

use crate::backoff::full_jitter_delay;

use super::ConnectionCore;

/// Installs an error callback on `channel` that triggers a bounded,
/// best-effort recreation of just this channel. A reconnect of the whole
/// connection (driven separately by `ConnectionCore::reconnect_loop`) takes
/// over and calls `rerun_all_channel_setups` once it completes, so this
/// watchdog only needs to handle the narrower "channel closed, connection
/// still fine" case.
pub(super) fn install(core: &Arc<ConnectionCore>, id: u64, channel: Channel) {
    let core = core.clone();
    channel.on_error(move |err| {
        let core = core.clone();
        tokio::spawn(async move {
            if core.is_closing() {
                return;
            }
            warn!(channel = id, error = %err, "channel closed, attempting to reopen it");
            recover_channel(core, id).await;
        });
    });
}

async fn recover_channel(core: Arc<ConnectionCore>, id: u64) {
    let Some(registered) = core.channel_entry(id) else {
        return;
    };

    if !core.state_is_connected_and_open().await {
        // A full reconnect is already in flight (or about to be); it will
        // rebuild every registered channel once it lands.
        return;
    }

    let attempt = registered.watchdog_attempt.fetch_add(1, Ordering::SeqCst);
    let delay = full_jitter_delay(attempt, core.reconnect_policy());
    tokio::time::sleep(delay).await;

    if core.is_closing() || !core.state_is_connected_and_open().await {
        return;
    }

    let conn = core.connection_handle().read().await.clone();
    let Some(conn) = conn else { return };

    match conn.create_channel().await {
        Ok(new_channel) => {
            if let Some(setup) = &registered.setup {
                if let Err(e) = setup(new_channel.clone()).await {
                    error!(channel = id, error = %e, "channel watchdog: setup failed on reopened channel");
                }
            }
            install(&core, id, new_channel.clone());
            *registered.channel.write().await = Some(new_channel);
            registered.watchdog_attempt.store(0, Ordering::SeqCst);
        }
        Err(e) => {
            error!(channel = id, error = %e, "channel watchdog: failed to reopen channel");
        }
    }
}
