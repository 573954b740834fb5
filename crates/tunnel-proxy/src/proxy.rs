//! The relay engine.
//!
//! A [`Proxy`] owns a set of source servers and one sink client. For every
//! source it runs one accept loop for streams and one for datagram
//! endpoints; every accepted connection gets its own relay task, so the
//! number of connections bounds concurrency rather than the number of
//! sources.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tunnel::{Address, BoxConn, BoxPacketConn, Client, Server, TunnelError};
use tunnel_config::Config;
use tunnel_core::io::relay_bidirectional;
use tunnel_core::{
    DEFAULT_RELAY_BUFFER_SIZE, DEFAULT_SHUTDOWN_TIMEOUT_SECS, DEFAULT_TCP_IDLE_TIMEOUT_SECS,
    ERROR_IO,
};

use crate::error::ProxyError;
use crate::relay::{ProxyRelayMetrics, forward_packets, is_disconnect};
use crate::util::{ConnectionGuard, ConnectionTracker};

const KIND_STREAM: &str = "stream";
const KIND_PACKET: &str = "packet";

/// Relay engine tuning.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub buffer_size: usize,
    /// `None` keeps an idle stream relay open until either side closes.
    pub tcp_idle_timeout: Option<Duration>,
    /// How long `run` waits for in-flight relays after shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_RELAY_BUFFER_SIZE,
            tcp_idle_timeout: idle_timeout(DEFAULT_TCP_IDLE_TIMEOUT_SECS),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        }
    }
}

impl RelayConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            buffer_size: config.relay.buffer_size,
            tcp_idle_timeout: idle_timeout(config.relay.tcp_idle_timeout),
            shutdown_timeout: Duration::from_secs(config.relay.shutdown_timeout),
        }
    }
}

fn idle_timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Splices connections accepted from the sources to connections dialed on
/// the sink.
///
/// The lifecycle is assembled, then running, then closed; a closed proxy
/// cannot be restarted.
pub struct Proxy {
    sources: Vec<Arc<dyn Server>>,
    sink: Arc<dyn Client>,
    config: RelayConfig,
    shutdown: CancellationToken,
    closed: AtomicBool,
    tracker: ConnectionTracker,
    fatal: Mutex<Option<TunnelError>>,
}

impl Proxy {
    /// Assemble a proxy whose cancellation scope is a child of `shutdown`.
    pub fn new(
        sources: Vec<Arc<dyn Server>>,
        sink: Arc<dyn Client>,
        config: RelayConfig,
        shutdown: &CancellationToken,
    ) -> Self {
        Self {
            sources,
            sink,
            config,
            shutdown: shutdown.child_token(),
            closed: AtomicBool::new(false),
            tracker: ConnectionTracker::new(),
            fatal: Mutex::new(None),
        }
    }

    /// Number of relays currently in flight.
    pub fn active_relays(&self) -> usize {
        self.tracker.count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run until the scope is cancelled, [`close`](Self::close) is called or
    /// every accept loop has exited.
    ///
    /// On the way out every source and the sink are closed and in-flight
    /// relays get up to `shutdown_timeout` to finish. Returns the error of a
    /// source whose listener failed, if any.
    pub async fn run(self: Arc<Self>) -> Result<(), ProxyError> {
        let mut loops = JoinSet::new();
        for source in &self.sources {
            loops.spawn(self.clone().accept_conns(source.clone()));
            loops.spawn(self.clone().accept_packets(source.clone()));
        }
        info!(sources = self.sources.len(), "proxy running");

        let drained = async { while loops.join_next().await.is_some() {} };
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {}
            _ = drained => warn!("every source stopped accepting"),
        }
        info!("proxy shutting down");
        let closed = self.close();
        while loops.join_next().await.is_some() {}

        let active = self.tracker.count();
        if active > 0 {
            info!(active, "waiting for relays to finish");
            if !self.tracker.wait_for_zero(self.config.shutdown_timeout).await {
                warn!(active = self.tracker.count(), "shutdown timeout, relays still active");
            }
        }
        info!("proxy stopped");

        if let Some(e) = self.fatal.lock().take() {
            return Err(e.into());
        }
        closed
    }

    /// Stop the proxy and close the sink and every source.
    ///
    /// Idempotent: only the first call closes anything. Every component is
    /// closed even if an earlier one fails; the first failure is returned.
    pub fn close(&self) -> Result<(), ProxyError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();

        let mut first = None;
        if let Err(e) = self.sink.close() {
            warn!(error = %e, "failed to close sink");
            first.get_or_insert(e);
        }
        for source in &self.sources {
            if let Err(e) = source.close() {
                warn!(error = %e, "failed to close source");
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn accept_conns(self: Arc<Self>, source: Arc<dyn Server>) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                res = source.accept_conn(None) => res,
            };
            match accepted {
                Ok(conn) => {
                    let guard = self.tracker.track();
                    tokio::spawn(self.clone().relay_conn(conn, guard));
                }
                Err(e) => {
                    if !self.keep_accepting(e, KIND_STREAM) {
                        break;
                    }
                }
            }
        }
        debug!(kind = KIND_STREAM, "accept loop exiting");
    }

    async fn accept_packets(self: Arc<Self>, source: Arc<dyn Server>) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                res = source.accept_packet(None) => res,
            };
            match accepted {
                Ok(conn) => {
                    let guard = self.tracker.track();
                    tokio::spawn(self.clone().relay_packet(conn, guard));
                }
                Err(e) => {
                    if !self.keep_accepting(e, KIND_PACKET) {
                        break;
                    }
                }
            }
        }
        debug!(kind = KIND_PACKET, "accept loop exiting");
    }

    /// Decide what an accept error means for its loop.
    fn keep_accepting(&self, e: TunnelError, kind: &'static str) -> bool {
        // Cancellation is checked first: errors raised while shutting down
        // are expected.
        if self.shutdown.is_cancelled() || e.is_closed() {
            debug!(kind, error = %e, "source closed");
            return false;
        }
        if e.is_fatal() {
            error!(kind, error = %e, "source failed, stopping proxy");
            tunnel_metrics::record_error(e.error_type());
            self.fatal.lock().get_or_insert(e);
            self.shutdown.cancel();
            return false;
        }
        if matches!(
            e,
            TunnelError::Unsupported { .. } | TunnelError::UnsupportedOverlay(_)
        ) {
            debug!(kind, error = %e, "source does not serve this kind");
            return false;
        }
        warn!(kind, error = %e, "accept failed, retrying");
        tunnel_metrics::record_accept_error(kind);
        tunnel_metrics::record_error(e.error_type());
        true
    }

    async fn relay_conn(self: Arc<Self>, inbound: BoxConn, _guard: ConnectionGuard) {
        let Some(target) = inbound
            .metadata()
            .map(|m| m.address.clone())
            .filter(Address::is_valid)
        else {
            warn!("dropping stream without a valid target");
            return;
        };

        let dialed = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return,
            res = self.sink.dial_conn(&target, None) => res,
        };
        let outbound = match dialed {
            Ok(outbound) => outbound,
            Err(e) => {
                warn!(target = %target, error = %e, "failed to dial sink, dropping stream");
                tunnel_metrics::record_dial_failure(KIND_STREAM);
                tunnel_metrics::record_error(e.error_type());
                return;
            }
        };

        debug!(target = %target, "stream relay started");
        tunnel_metrics::record_relay_started(KIND_STREAM);
        let start = Instant::now();
        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            res = relay_bidirectional(
                inbound,
                outbound,
                self.config.tcp_idle_timeout,
                self.config.buffer_size,
                &ProxyRelayMetrics,
            ) => Some(res),
        };
        let duration_secs = start.elapsed().as_secs_f64();
        tunnel_metrics::record_relay_finished(KIND_STREAM, duration_secs);

        match result {
            Some(Ok(end)) => debug!(target = %target, ?end, duration_secs, "stream relay finished"),
            Some(Err(e)) if is_disconnect(&e) => {
                debug!(target = %target, error = %e, duration_secs, "stream relay disconnected")
            }
            Some(Err(e)) => {
                warn!(target = %target, error = %e, duration_secs, "stream relay failed");
                tunnel_metrics::record_error(ERROR_IO);
            }
            None => debug!(target = %target, duration_secs, "stream relay cancelled"),
        }
    }

    async fn relay_packet(self: Arc<Self>, inbound: BoxPacketConn, _guard: ConnectionGuard) {
        let dialed = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                inbound.close();
                return;
            }
            res = self.sink.dial_packet(None) => res,
        };
        let outbound = match dialed {
            Ok(outbound) => outbound,
            Err(e) => {
                warn!(error = %e, "failed to dial sink, dropping packet session");
                tunnel_metrics::record_dial_failure(KIND_PACKET);
                tunnel_metrics::record_error(e.error_type());
                inbound.close();
                return;
            }
        };

        debug!("packet relay started");
        tunnel_metrics::record_relay_started(KIND_PACKET);
        let start = Instant::now();
        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            res = forward_packets(inbound.as_ref(), outbound.as_ref(), "outbound") => Some(res),
            res = forward_packets(outbound.as_ref(), inbound.as_ref(), "inbound") => Some(res),
        };
        inbound.close();
        outbound.close();
        let duration_secs = start.elapsed().as_secs_f64();
        tunnel_metrics::record_relay_finished(KIND_PACKET, duration_secs);

        match result {
            Some(Ok(())) => debug!(duration_secs, "packet relay finished"),
            Some(Err(e)) if e.is_closed() => debug!(duration_secs, "packet relay closed"),
            Some(Err(e)) => {
                warn!(error = %e, duration_secs, "packet relay failed");
                tunnel_metrics::record_error(e.error_type());
            }
            None => debug!(duration_secs, "packet relay cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_config_from_config() {
        let config = tunnel_config::load_config_str(
            r#"{"run_type": "nat", "relay": {"buffer_size": 4096, "tcp_idle_timeout": 30}}"#,
            tunnel_config::ConfigFormat::Json,
        )
        .unwrap();
        let relay = RelayConfig::from_config(&config);
        assert_eq!(relay.buffer_size, 4096);
        assert_eq!(relay.tcp_idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(
            relay.shutdown_timeout,
            Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_idle_timeout_disabled_by_default() {
        assert_eq!(RelayConfig::default().tcp_idle_timeout, None);
        assert_eq!(idle_timeout(0), None);
    }
}
