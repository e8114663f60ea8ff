//! Per-session watchdog (§4.4): a 1-second tick that retransmits the last
//! datagram every 5 idle seconds and tears the session down after 25.
//!
//! Modeled as a message-passing design (§9's second option): the watchdog
//! owns no session fields directly. It ticks, asks the session for its
//! cached `last_sent` bytes, and reports back to the dispatcher what to do;
//! the session's own lock (acquired inside [`crate::session::Session`]) is
//! the only synchronization point, so the watchdog and the dispatcher never
//! race over raw fields.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info};

use crate::session::Session;

/// Seconds of idleness between retransmits.
const RETRANSMIT_INTERVAL_SECS: u64 = 5;
/// Seconds of idleness after which a session is torn down.
const IDLE_TIMEOUT_SECS: u64 = 25;

/// Instructions the watchdog sends back to the dispatcher.
pub enum WatchdogEvent {
    /// Resend this datagram verbatim.
    Retransmit(SocketAddr, Vec<u8>),
    /// The session has been idle too long; remove it from the session map.
    TimedOut(SocketAddr),
}

/// Handle used by the dispatcher to reset a session's idle counter and to
/// stop its watchdog on session close.
pub struct WatchdogHandle {
    reset_tx: mpsc::UnboundedSender<()>,
    stop_tx: mpsc::UnboundedSender<()>,
}

impl WatchdogHandle {
    /// Called on every inbound packet for this session (§4.3: "every inbound
    /// packet resets the watchdog idle counter").
    pub fn reset(&self) {
        let _ = self.reset_tx.send(());
    }

    /// Idempotent: stopping an already-stopped watchdog is a no-op send into
    /// a channel whose receiver may already be gone.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

/// Spawn the watchdog task for `session` and return its handle plus the
/// event receiver the dispatcher should drain alongside its datagram loop.
pub fn spawn(session: Arc<Session>, events: mpsc::UnboundedSender<WatchdogEvent>) -> WatchdogHandle {
    let (reset_tx, mut reset_rx) = mpsc::unbounded_channel::<()>();
    let (stop_tx, mut stop_rx) = mpsc::unbounded_channel::<()>();

    tokio::spawn(async move {
        let peer = session.peer();
        let mut idle_seconds: u64 = 0;
        let mut ticker = interval(Duration::from_secs(1));
        // First tick fires immediately; consume it so idle_seconds starts at 0.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    debug!(%peer, "watchdog stopped");
                    return;
                }
                _ = reset_rx.recv() => {
                    idle_seconds = 0;
                }
                _ = ticker.tick() => {
                    idle_seconds += 1;

                    if idle_seconds >= IDLE_TIMEOUT_SECS {
                        info!(%peer, "session timed out after {} idle seconds", idle_seconds);
                        let _ = events.send(WatchdogEvent::TimedOut(peer));
                        return;
                    }

                    if idle_seconds % RETRANSMIT_INTERVAL_SECS == 0 {
                        let last_sent = session.last_sent().await;
                        debug!(%peer, idle_seconds, "retransmitting last datagram");
                        let _ = events.send(WatchdogEvent::Retransmit(peer, last_sent));
                    }
                }
            }
        }
    });

    WatchdogHandle { reset_tx, stop_tx }
}
