//! Length-prefixed bincode RPC over TCP.
//!
//! Shared by the Raft transport and the replication transport. Every frame is
//! a big-endian `u32` length followed by a bincode body. A connection carries
//! any number of request/response pairs in sequence, so clients keep one
//! cached stream per peer.
//!
//! Clients go through an [`RpcChannel`]: a cached connection, per-attempt
//! timeouts, bounded retries with jittered exponential backoff, and a circuit
//! breaker that stops hammering a peer after repeated failures.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::constants::{
    CIRCUIT_BREAKER_RESET_SECS, CIRCUIT_BREAKER_THRESHOLD, MAX_RPC_FRAME_BYTES,
    RPC_CONNECT_TIMEOUT_MS, RPC_OPERATION_TIMEOUT_MS,
};

/// Write one frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = bincode::serialize(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if data.len() > MAX_RPC_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit of {}", data.len(), MAX_RPC_FRAME_BYTES),
        ));
    }
    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await
}

/// Read one frame. Returns `None` on a clean EOF before the length prefix.
pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_RPC_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit of {}", len, MAX_RPC_FRAME_BYTES),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    bincode::deserialize(&buf)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    consecutive_failures: u32,
    last_failure_time: Option<Instant>,
    threshold: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            last_failure_time: None,
            threshold,
            reset_timeout,
        }
    }

    /// Open circuits reject calls until `reset_timeout` has passed since the
    /// last failure, then let one trial request through.
    pub fn is_open(&self) -> bool {
        if self.consecutive_failures < self.threshold {
            return false;
        }
        self.last_failure_time
            .is_some_and(|last| last.elapsed() < self.reset_timeout)
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_failure_time = None;
    }

    /// Returns true if this failure opened the circuit.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        self.last_failure_time = Some(Instant::now());
        self.consecutive_failures == self.threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(
            CIRCUIT_BREAKER_THRESHOLD,
            Duration::from_secs(CIRCUIT_BREAKER_RESET_SECS),
        )
    }
}

/// Timeouts and retry bounds for an [`RpcChannel`].
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(RPC_CONNECT_TIMEOUT_MS),
            operation_timeout: Duration::from_millis(RPC_OPERATION_TIMEOUT_MS),
            max_retries: 2,
            retry_base_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_secs(1),
        }
    }
}

/// Client side of a connection to one peer.
pub struct RpcChannel {
    label: &'static str,
    target_addr: String,
    options: ChannelOptions,
    cached_conn: Mutex<Option<TcpStream>>,
    circuit_breaker: parking_lot::Mutex<CircuitBreaker>,
}

impl RpcChannel {
    /// `label` names the channel kind in logs and metrics.
    pub fn new(label: &'static str, target_addr: impl Into<String>, options: ChannelOptions) -> Self {
        Self {
            label,
            target_addr: target_addr.into(),
            options,
            cached_conn: Mutex::new(None),
            circuit_breaker: parking_lot::Mutex::new(CircuitBreaker::default()),
        }
    }

    pub fn target_addr(&self) -> &str {
        &self.target_addr
    }

    /// Send a request and wait for its response, retrying on I/O errors.
    pub async fn call<Req, Resp>(&self, request: &Req) -> io::Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        {
            let cb = self.circuit_breaker.lock();
            if cb.is_open() {
                debug!(
                    channel = self.label,
                    target = %self.target_addr,
                    consecutive_failures = cb.consecutive_failures(),
                    "Circuit breaker is open, rejecting RPC"
                );
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!(
                        "circuit breaker open for {} ({} consecutive failures)",
                        self.target_addr,
                        cb.consecutive_failures()
                    ),
                ));
            }
        }

        let mut last_error = None;
        for attempt in 0..=self.options.max_retries {
            if attempt > 0 {
                let delay = std::cmp::min(
                    self.options.retry_base_delay * (1 << (attempt - 1)),
                    self.options.retry_max_delay,
                );
                let jittered = delay.mul_f64(0.75 + fastrand::f64() * 0.5);
                debug!(
                    channel = self.label,
                    target = %self.target_addr,
                    attempt,
                    delay_ms = jittered.as_millis() as u64,
                    "Retrying RPC after backoff"
                );
                tokio::time::sleep(jittered).await;
            }

            match self.try_call(request).await {
                Ok(response) => {
                    self.circuit_breaker.lock().record_success();
                    return Ok(response);
                }
                Err(e) => last_error = Some(e),
            }
        }

        if self.circuit_breaker.lock().record_failure() {
            warn!(
                channel = self.label,
                target = %self.target_addr,
                "Circuit breaker opened due to consecutive failures"
            );
            super::metrics::CIRCUIT_BREAKER_TRIPS
                .with_label_values(&[self.label])
                .inc();
        }
        Err(last_error.unwrap_or_else(|| io::Error::other("RPC failed with no error")))
    }

    async fn try_call<Req, Resp>(&self, request: &Req) -> io::Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let mut guard = self.cached_conn.lock().await;
        if let Some(stream) = guard.as_mut() {
            match self.exchange(stream, request).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    debug!(channel = self.label, error = %e, "Cached connection failed, reconnecting");
                    *guard = None;
                }
            }
        }

        let mut stream = timeout(
            self.options.connect_timeout,
            TcpStream::connect(&self.target_addr),
        )
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connection timeout to {}", self.target_addr),
            )
        })??;
        stream.set_nodelay(true)?;

        let response = self.exchange(&mut stream, request).await?;
        *guard = Some(stream);
        Ok(response)
    }

    async fn exchange<Req, Resp>(&self, stream: &mut TcpStream, request: &Req) -> io::Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        timeout(self.options.operation_timeout, async {
            write_frame(stream, request).await?;
            read_frame(stream)
                .await?
                .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"))
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "RPC operation timeout"))?
    }
}

/// Server-side request handler.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    type Request: DeserializeOwned + Send;
    type Response: Serialize + Send + Sync;

    async fn handle(&self, request: Self::Request) -> Self::Response;
}

/// Accept connections until `shutdown` flips to true. Each connection is
/// served on its own task and handles requests one at a time.
pub async fn serve<S: RpcService>(
    name: &'static str,
    listener: TcpListener,
    service: Arc<S>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(server = name, %addr, "RPC server listening");
    }
    loop {
        let conn_shutdown = shutdown.clone();
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let service = Arc::clone(&service);
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(service, stream, conn_shutdown).await {
                            debug!(server = name, %peer, error = %e, "RPC connection closed with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(server = name, error = %e, "Failed to accept RPC connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            _ = stopped(&mut shutdown) => {
                info!(server = name, "RPC server shutting down");
                return;
            }
        }
    }
}

/// Resolves once the flag is set or its sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn serve_connection<S: RpcService>(
    service: Arc<S>,
    mut stream: TcpStream,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    loop {
        let request = tokio::select! {
            frame = read_frame::<_, S::Request>(&mut stream) => frame?,
            _ = stopped(&mut shutdown) => return Ok(()),
        };
        let Some(request) = request else {
            return Ok(());
        };
        let response = service.handle(request).await;
        write_frame(&mut stream, &response).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl RpcService for Echo {
        type Request = String;
        type Response = String;

        async fn handle(&self, request: String) -> String {
            request.to_uppercase()
        }
    }

    #[tokio::test]
    async fn test_frame_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &vec![1u32, 2, 3]).await.unwrap();
        let got: Option<Vec<u32>> = read_frame(&mut b).await.unwrap();
        assert_eq!(got, Some(vec![1, 2, 3]));

        drop(a);
        let eof: Option<Vec<u32>> = read_frame(&mut b).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_read() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();
        let result: io::Result<Option<Vec<u8>>> = read_frame(&mut b).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_channel_reuses_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn(serve("echo", listener, Arc::new(Echo), rx));

        let channel = RpcChannel::new("test", addr.to_string(), ChannelOptions::default());
        for word in ["a", "b", "c"] {
            let reply: String = channel.call(&word.to_string()).await.unwrap();
            assert_eq!(reply, word.to_uppercase());
        }
        assert!(channel.cached_conn.lock().await.is_some());

        tx.send(true).unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn(serve("echo", listener, Arc::new(Echo), rx));

        let channel = RpcChannel::new("test", addr.to_string(), ChannelOptions::default());
        let reply: String = channel.call(&"x".to_string()).await.unwrap();
        assert_eq!(reply, "X");

        tx.send(true).unwrap();
        server.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after: io::Result<String> = channel.call(&"y".to_string()).await;
        assert!(after.is_err());
    }

    #[tokio::test]
    async fn test_breaker_opens_after_threshold() {
        let channel = RpcChannel::new(
            "test",
            "127.0.0.1:1",
            ChannelOptions {
                connect_timeout: Duration::from_millis(100),
                max_retries: 0,
                ..ChannelOptions::default()
            },
        );
        for _ in 0..CIRCUIT_BREAKER_THRESHOLD {
            let result: io::Result<String> = channel.call(&"x".to_string()).await;
            assert!(result.is_err());
        }
        let result: io::Result<String> = channel.call(&"x".to_string()).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::ConnectionRefused);
        assert!(channel.circuit_breaker.lock().is_open());
    }

    #[test]
    fn test_circuit_breaker_resets_on_success() {
        let mut cb = CircuitBreaker::new(2, Duration::from_secs(60));
        assert!(!cb.record_failure());
        assert!(cb.record_failure());
        assert!(cb.is_open());
        cb.record_success();
        assert!(!cb.is_open());
        assert_eq!(cb.consecutive_failures(), 0);
    }
}
