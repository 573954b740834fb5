//! Bounded worker pool relaying connections to a fallback address.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use tunnel::{Address, TunnelError};
use tunnel_core::io::{AsyncStream, NoOpMetrics, relay_bidirectional};
use tunnel_core::{DEFAULT_REDIRECTOR_QUEUE, DEFAULT_REDIRECTOR_WORKERS, DEFAULT_RELAY_BUFFER_SIZE};

use crate::error::RedirectError;

/// Future returned by a [`DialFn`].
pub type DialFuture =
    Pin<Box<dyn Future<Output = Result<Box<dyn AsyncStream>, TunnelError>> + Send>>;

/// Custom way of reaching the fallback address.
pub type DialFn = Arc<dyn Fn(Address) -> DialFuture + Send + Sync>;

/// A connection to hand over to the fallback address.
///
/// `inbound` and `redirect_to` are optional so a layer can submit whatever
/// it has; incomplete requests are logged and closed without dialing.
#[derive(Default)]
pub struct Redirection {
    /// Dial override; plain TCP when `None`.
    pub dial: Option<DialFn>,
    pub redirect_to: Option<Address>,
    pub inbound: Option<Box<dyn AsyncStream>>,
}

impl Redirection {
    pub fn new(inbound: Box<dyn AsyncStream>, redirect_to: Address) -> Self {
        Self {
            dial: None,
            redirect_to: Some(redirect_to),
            inbound: Some(inbound),
        }
    }

    pub fn with_dial(mut self, dial: DialFn) -> Self {
        self.dial = Some(dial);
        self
    }
}

impl fmt::Debug for Redirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Redirection")
            .field("dial", &self.dial.as_ref().map(|_| "custom"))
            .field("redirect_to", &self.redirect_to)
            .field("inbound", &self.inbound.is_some())
            .finish()
    }
}

/// Dial the fallback address over plain TCP.
pub fn default_dial(address: Address) -> DialFuture {
    Box::pin(async move {
        let target = address.to_socket_addr().await?;
        let stream = TcpStream::connect(target)
            .await
            .map_err(|source| TunnelError::Dial {
                target: address.to_string(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        Ok::<_, TunnelError>(Box::new(stream) as Box<dyn AsyncStream>)
    })
}

/// Redirector settings.
#[derive(Debug, Clone)]
pub struct RedirectorConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub buffer_size: usize,
}

impl Default for RedirectorConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_REDIRECTOR_WORKERS,
            queue_capacity: DEFAULT_REDIRECTOR_QUEUE,
            buffer_size: DEFAULT_RELAY_BUFFER_SIZE,
        }
    }
}

/// Queue of pending redirections served by a fixed pool of workers.
#[derive(Clone)]
pub struct Redirector {
    queue: mpsc::Sender<Redirection>,
    shutdown: CancellationToken,
}

impl Redirector {
    /// Start the worker pool. Workers stop when `shutdown` is cancelled.
    pub fn new(config: &RedirectorConfig, shutdown: &CancellationToken) -> Self {
        let shutdown = shutdown.child_token();
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..config.workers.max(1) {
            tokio::spawn(run_worker(
                worker,
                rx.clone(),
                config.buffer_size,
                shutdown.clone(),
            ));
        }
        Self {
            queue: tx,
            shutdown,
        }
    }

    /// Queue a redirection, waiting for room if the queue is full.
    ///
    /// Returns the request inside [`RedirectError::Closed`] if the
    /// redirector shuts down first; its connection is then the caller's to
    /// close.
    pub async fn redirect(&self, redirection: Redirection) -> Result<(), RedirectError> {
        let permit = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            permit = self.queue.reserve() => permit.ok(),
        };
        match permit {
            Some(permit) => {
                permit.send(redirection);
                tunnel_metrics::record_redirect("queued");
                Ok(())
            }
            None => {
                warn!("redirector closed, request returned to caller");
                tunnel_metrics::record_redirect("dropped");
                Err(RedirectError::Closed(redirection))
            }
        }
    }

    /// Stop all workers.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

async fn run_worker(
    worker: usize,
    queue: Arc<Mutex<mpsc::Receiver<Redirection>>>,
    buffer_size: usize,
    shutdown: CancellationToken,
) {
    loop {
        let redirection = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            r = async { queue.lock().await.recv().await } => match r {
                Some(r) => r,
                None => break,
            },
        };
        tokio::spawn(handle(redirection, buffer_size, shutdown.clone()));
    }
    debug!(worker, "redirector worker exiting");
}

async fn handle(redirection: Redirection, buffer_size: usize, shutdown: CancellationToken) {
    let Redirection {
        dial,
        redirect_to,
        inbound,
    } = redirection;
    let Some(inbound) = inbound else {
        error!("redirection without inbound connection");
        tunnel_metrics::record_redirect("failed");
        return;
    };
    let Some(target) = redirect_to.filter(Address::is_valid) else {
        error!("redirection without a valid target, closing inbound connection");
        tunnel_metrics::record_redirect("failed");
        return;
    };

    debug!(target = %target, "redirecting connection");
    let dial: DialFn = match dial {
        Some(dial) => dial,
        None => Arc::new(default_dial),
    };
    let outbound = tokio::select! {
        biased;
        _ = shutdown.cancelled() => return,
        res = dial(target.clone()) => res,
    };
    let outbound = match outbound {
        Ok(outbound) => outbound,
        Err(e) => {
            error!(target = %target, error = %e, "redirector failed to dial fallback");
            tunnel_metrics::record_redirect("failed");
            tunnel_metrics::record_error(e.error_type());
            return;
        }
    };

    // Both streams are dropped as soon as either direction ends.
    let result = tokio::select! {
        biased;
        _ = shutdown.cancelled() => return,
        res = relay_bidirectional(inbound, outbound, None, buffer_size, &NoOpMetrics) => res,
    };
    match result {
        Ok(end) => debug!(target = %target, end = ?end, "redirection finished"),
        Err(e) => debug!(target = %target, error = %e, "redirection ended with error"),
    }
    tunnel_metrics::record_redirect("completed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
    use tokio::net::TcpListener;
    use tunnel::Network;

    fn counting_dial(count: Arc<AtomicUsize>) -> DialFn {
        Arc::new(move |_address: Address| -> DialFuture {
            count.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                let (near, _far) = duplex(64);
                Ok::<_, TunnelError>(Box::new(near) as Box<dyn AsyncStream>)
            })
        })
    }

    async fn echo_server() -> Address {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        Address::from_socket_addr(Network::Tcp, addr)
    }

    #[tokio::test]
    async fn test_missing_inbound_does_not_dial() {
        let shutdown = CancellationToken::new();
        let redirector = Redirector::new(&RedirectorConfig::default(), &shutdown);
        let dials = Arc::new(AtomicUsize::new(0));

        let request = Redirection {
            dial: Some(counting_dial(dials.clone())),
            redirect_to: Some(Address::from_host(Network::Tcp, "127.0.0.1", 80)),
            inbound: None,
        };
        redirector.redirect(request).await.unwrap();
        redirector.redirect(Redirection::default()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_target_closes_inbound() {
        let shutdown = CancellationToken::new();
        let redirector = Redirector::new(&RedirectorConfig::default(), &shutdown);
        let dials = Arc::new(AtomicUsize::new(0));
        let (mut client, server) = duplex(64);

        let request = Redirection {
            dial: Some(counting_dial(dials.clone())),
            redirect_to: None,
            inbound: Some(Box::new(server)),
        };
        redirector.redirect(request).await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_redirect_relays_to_fallback() {
        let shutdown = CancellationToken::new();
        let redirector = Redirector::new(&RedirectorConfig::default(), &shutdown);
        let target = echo_server().await;
        let (mut client, server) = duplex(1024);

        redirector
            .redirect(Redirection::new(Box::new(server), target))
            .await
            .unwrap();

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut buf = [0u8; 18];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.1\r\n\r\n");
    }

    #[tokio::test]
    async fn test_custom_dial_is_used() {
        let shutdown = CancellationToken::new();
        let redirector = Redirector::new(&RedirectorConfig::default(), &shutdown);
        let (fallback_near, mut fallback_far) = duplex(1024);
        let slot = Arc::new(parking_slot(fallback_near));
        let dial: DialFn = Arc::new(move |_address: Address| -> DialFuture {
            let stream = slot.take();
            Box::pin(async move {
                stream
                    .map(|s| Box::new(s) as Box<dyn AsyncStream>)
                    .ok_or(TunnelError::Closed("test dial"))
            })
        });

        let (mut client, server) = duplex(1024);
        let target = Address::from_host(Network::Tcp, "decoy.example", 443);
        redirector
            .redirect(Redirection::new(Box::new(server), target).with_dial(dial))
            .await
            .unwrap();

        client.write_all(b"probe").await.unwrap();
        let mut buf = [0u8; 5];
        fallback_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"probe");

        fallback_far.write_all(b"reply").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");

        // Fallback hanging up ends the client side too.
        drop(fallback_far);
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dial_failure_closes_inbound() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = Address::from_socket_addr(Network::Tcp, listener.local_addr().unwrap());
        drop(listener);

        let shutdown = CancellationToken::new();
        let redirector = Redirector::new(&RedirectorConfig::default(), &shutdown);
        let (mut client, server) = duplex(64);
        redirector
            .redirect(Redirection::new(Box::new(server), closed))
            .await
            .unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closed_redirector_returns_request() {
        let shutdown = CancellationToken::new();
        let redirector = Redirector::new(&RedirectorConfig::default(), &shutdown);
        shutdown.cancel();

        let (_client, server) = duplex(64);
        let target = Address::from_host(Network::Tcp, "127.0.0.1", 80);
        let err = redirector
            .redirect(Redirection::new(Box::new(server), target))
            .await
            .unwrap_err();
        let returned = err.into_inner();
        assert!(returned.inbound.is_some());
        assert!(returned.redirect_to.is_some());
    }

    #[tokio::test]
    async fn test_full_queue_unblocks_on_close() {
        let shutdown = CancellationToken::new();
        let config = RedirectorConfig {
            workers: 1,
            queue_capacity: 1,
            ..RedirectorConfig::default()
        };
        let redirector = Redirector::new(&config, &shutdown);
        // Holding the only slot keeps the queue full.
        let held = redirector.queue.clone().reserve_owned().await.unwrap();

        let pending = {
            let redirector = redirector.clone();
            tokio::spawn(async move { redirector.redirect(Redirection::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        redirector.close();
        assert!(pending.await.unwrap().is_err());
        drop(held);
    }

    /// One-shot holder for a stream handed to a dial closure.
    struct Slot<T>(std::sync::Mutex<Option<T>>);

    impl<T> Slot<T> {
        fn take(&self) -> Option<T> {
            self.0.lock().unwrap().take()
        }
    }

    fn parking_slot<T>(value: T) -> Slot<T> {
        Slot(std::sync::Mutex::new(Some(value)))
    }
}
