use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{error, warn};

use crate::connection::{Connection, ConnectionState};

/// Per-connection bookkeeping for ack-wait / severe-alert monitoring. A sender arms this
///  via [`Connection::set_in_use`] before a request/reply exchange; a periodic task then
///  watches the elapsed time while the connection sits in `Sending` or `ReadingAck`.
pub struct AckTracking {
    socket_in_use: AtomicBool,
    ack_timed_out: AtomicBool,
    /// advanced by peers' severe-alert handling so a whole send group does not alert on
    ///  the same slow receiver at once
    transmission_start: Mutex<Instant>,
    ack_wait: Mutex<Duration>,
    ack_severe: Mutex<Duration>,
    /// other connections participating in the same multicast-style send
    group: Mutex<Vec<Arc<Connection>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for AckTracking {
    fn default() -> Self {
        AckTracking {
            socket_in_use: AtomicBool::new(false),
            ack_timed_out: AtomicBool::new(false),
            transmission_start: Mutex::new(Instant::now()),
            ack_wait: Mutex::new(Duration::ZERO),
            ack_severe: Mutex::new(Duration::ZERO),
            group: Mutex::new(Vec::new()),
            task: Mutex::new(None),
        }
    }
}

impl AckTracking {
    pub fn arm(&self, start: Instant, ack_wait: Duration, ack_severe: Duration, group: Vec<Arc<Connection>>) {
        *self.transmission_start.lock().unwrap() = start;
        *self.ack_wait.lock().unwrap() = ack_wait;
        *self.ack_severe.lock().unwrap() = ack_severe;
        *self.group.lock().unwrap() = group;
        self.ack_timed_out.store(false, Ordering::Relaxed);
        self.socket_in_use.store(true, Ordering::Relaxed);
    }

    /// In-use without thresholds: the socket is reserved for an exchange, but nothing
    ///  monitors it.
    pub fn mark_in_use(&self) {
        self.socket_in_use.store(true, Ordering::Relaxed);
    }

    pub fn transmission_start(&self) -> Instant {
        *self.transmission_start.lock().unwrap()
    }

    pub fn disarm(&self) {
        *self.ack_wait.lock().unwrap() = Duration::ZERO;
        *self.ack_severe.lock().unwrap() = Duration::ZERO;
        self.group.lock().unwrap().clear();
        self.socket_in_use.store(false, Ordering::Relaxed);
    }

    pub fn is_socket_in_use(&self) -> bool {
        self.socket_in_use.load(Ordering::Relaxed)
    }

    pub fn has_ack_timed_out(&self) -> bool {
        self.ack_timed_out.load(Ordering::Relaxed)
    }

    /// Push the transmission start forward, giving this connection more slack before it
    ///  alerts. Called on group peers when a sibling already raised the severe alert.
    pub fn advance_transmission_start(&self) {
        let severe = *self.ack_severe.lock().unwrap();
        *self.transmission_start.lock().unwrap() += severe;
    }

    pub fn cancel_task(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

/// Ensure a monitor task is running for the connection. Idempotent; the task lives until
///  cancelled by the close cascade.
pub fn schedule_ack_timeouts(conn: &Arc<Connection>) {
    let ack = conn.ack_tracking();
    let ack_wait = *ack.ack_wait.lock().unwrap();
    let ack_severe = *ack.ack_severe.lock().unwrap();
    if ack_wait.is_zero() {
        return;
    }

    let mut task = ack.task.lock().unwrap();
    if task.is_some() {
        return;
    }

    let period = if ack_severe.is_zero() { ack_wait } else { ack_wait.min(ack_severe) };
    let conn = conn.clone();
    *task = Some(tokio::spawn(async move {
        let mut ticks = interval_at(Instant::now() + ack_wait, period);
        loop {
            ticks.tick().await;
            if conn.is_closing() {
                return;
            }
            check_ack_timeout(&conn).await;
        }
    }));
}

async fn check_ack_timeout(conn: &Arc<Connection>) {
    let ack = conn.ack_tracking();
    if !ack.is_socket_in_use() {
        return;
    }
    match conn.state() {
        ConnectionState::Sending | ConnectionState::ReadingAck => {}
        _ => return,
    }

    let sent_alert = do_severe_alert_processing(conn).await;

    if sent_alert {
        // transmission and ack-receipt are performed serially, so one slow receiver must
        //  not make the whole group alert; the siblings get extra slack instead
        let group = ack.group.lock().unwrap().clone();
        for peer in group {
            if !Arc::ptr_eq(&peer, conn) {
                peer.ack_tracking().advance_transmission_start();
            }
        }
    }
}

async fn do_severe_alert_processing(conn: &Arc<Connection>) -> bool {
    let ack = conn.ack_tracking();
    let now = Instant::now();
    let start = *ack.transmission_start.lock().unwrap();
    let ack_wait = *ack.ack_wait.lock().unwrap();
    let ack_severe = *ack.ack_severe.lock().unwrap();

    if !ack_severe.is_zero() && start + ack_wait + ack_severe <= now {
        error!("{:?} has not responded for {:?} while a reply was expected - severe alert",
               conn.remote_member(), ack_wait + ack_severe);
        // one severe alert per exchange: disable subsequent checks
        *ack.ack_severe.lock().unwrap() = Duration::ZERO;
        return true;
    }

    if !ack.has_ack_timed_out() && !ack_wait.is_zero() && start + ack_wait <= now {
        warn!("{:?} has not responded for {:?} while a reply was expected",
              conn.remote_member(), ack_wait);
        ack.ack_timed_out.store(true, Ordering::Relaxed);

        if !ack_severe.is_zero() {
            if let Some(remote) = conn.remote_member() {
                let reason = match conn.state() {
                    ConnectionState::Sending =>
                        "sender has been unable to transmit a message within ack-wait-threshold",
                    _ =>
                        "sender has been unable to receive a response to a message within ack-wait-threshold",
                };
                conn.membership().suspect_member(remote, reason.to_string()).await;
            }
        }
    }
    false
}
