use crate::config::ResolverConfig;
use crate::error::ResolveError;
use hickory_proto::op::Message;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const UDP_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        }
    }
}

#[derive(Clone)]
struct DohUpstream {
    endpoint: String,
    client: reqwest::Client,
}

/// Latency-optimizing upstream fan-out. Racers are launched against the
/// nameserver list one by one, `interval` apart, plus one DoH racer when
/// enabled; the first reply with RCODE NoError and a non-empty answer
/// section wins and the rest are cancelled.
pub struct Resolver {
    nameservers: Vec<SocketAddr>,
    timeout: Duration,
    interval: Duration,
    doh: Option<DohUpstream>,
}

impl Resolver {
    pub fn new(config: &ResolverConfig) -> Self {
        let doh = config.doh.enable.then(|| config.doh.endpoint.clone());
        Self::with_upstreams(
            config.upstream_addrs(),
            Duration::from_secs(config.timeout),
            Duration::from_millis(config.interval_ms),
            doh,
        )
    }

    pub fn with_upstreams(
        nameservers: Vec<SocketAddr>,
        timeout: Duration,
        interval: Duration,
        doh_endpoint: Option<String>,
    ) -> Self {
        let doh = doh_endpoint.map(|endpoint| DohUpstream {
            endpoint,
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        });
        Self {
            nameservers,
            timeout,
            interval,
            doh,
        }
    }

    pub async fn resolve(
        &self,
        transport: Transport,
        query: &Message,
    ) -> Result<Message, ResolveError> {
        let payload = query.to_vec()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        if let Some(doh) = &self.doh {
            launch_doh_racer(doh.clone(), payload.clone(), tx.clone(), cancel.clone());
        }
        launch_racers(
            self.nameservers.clone(),
            transport,
            payload,
            self.timeout,
            self.interval,
            tx,
            cancel.clone(),
        );

        // The aggregate deadline; individual racers time out on their own
        // long before this in the common case.
        let deadline = self.timeout * self.nameservers.len().max(1) as u32;

        let winner = tokio::time::timeout(deadline, async {
            // The channel closes once every racer has settled, so an
            // all-negative race ends without waiting out the deadline.
            while let Some(reply) = rx.recv().await {
                if is_positive(&reply) {
                    return Some(reply);
                }
                tracing::debug!("discarding negative upstream reply");
            }
            None
        })
        .await;
        cancel.cancel();

        match winner {
            Ok(Some(reply)) => Ok(reply),
            _ => Err(ResolveError::UpstreamUnreachable),
        }
    }
}

fn is_positive(reply: &Message) -> bool {
    reply.header().response_code() == hickory_proto::op::ResponseCode::NoError
        && !reply.answers().is_empty()
}

/// Launch one racer per nameserver, `interval` apart. Each racer sends any
/// successfully parsed reply back on the channel; the caller filters.
fn launch_racers(
    nameservers: Vec<SocketAddr>,
    transport: Transport,
    payload: Vec<u8>,
    timeout: Duration,
    interval: Duration,
    tx: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        for (i, upstream) in nameservers.into_iter().enumerate() {
            if i > 0 && !interval.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel.cancelled() => return,
                }
            }

            let payload = payload.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    outcome = tokio::time::timeout(timeout, exchange(transport, upstream, &payload)) => {
                        match outcome {
                            Ok(Ok(reply)) => {
                                let _ = tx.send(reply);
                            }
                            Ok(Err(e)) => tracing::debug!(
                                upstream = %upstream,
                                transport = transport.as_str(),
                                error = %e,
                                "upstream query failed"
                            ),
                            Err(_) => tracing::debug!(
                                upstream = %upstream,
                                transport = transport.as_str(),
                                "upstream query timed out"
                            ),
                        }
                    }
                }
            });
        }
    });
}

fn launch_doh_racer(
    doh: DohUpstream,
    payload: Vec<u8>,
    tx: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            outcome = exchange_doh(&doh, payload) => {
                match outcome {
                    Ok(reply) => {
                        let _ = tx.send(reply);
                    }
                    Err(e) => tracing::debug!(
                        endpoint = %doh.endpoint,
                        error = %e,
                        "doh query failed"
                    ),
                }
            }
        }
    });
}

async fn exchange(
    transport: Transport,
    upstream: SocketAddr,
    payload: &[u8],
) -> anyhow::Result<Message> {
    match transport {
        Transport::Udp => exchange_udp(upstream, payload).await,
        Transport::Tcp => exchange_tcp(upstream, payload).await,
    }
}

async fn exchange_udp(upstream: SocketAddr, payload: &[u8]) -> anyhow::Result<Message> {
    let bind: SocketAddr = if upstream.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        "[::]:0".parse()?
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(upstream).await?;
    socket.send(payload).await?;

    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    let len = socket.recv(&mut buf).await?;
    Ok(Message::from_vec(&buf[..len])?)
}

/// DNS over TCP: two-byte big-endian length prefix on both directions.
async fn exchange_tcp(upstream: SocketAddr, payload: &[u8]) -> anyhow::Result<Message> {
    let mut stream = TcpStream::connect(upstream).await?;
    stream
        .write_all(&(payload.len() as u16).to_be_bytes())
        .await?;
    stream.write_all(payload).await?;
    stream.flush().await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Message::from_vec(&buf)?)
}

/// RFC 8484 POST: the raw wire query out, the raw wire reply back.
async fn exchange_doh(doh: &DohUpstream, payload: Vec<u8>) -> anyhow::Result<Message> {
    let response = doh
        .client
        .post(&doh.endpoint)
        .header(reqwest::header::CONTENT_TYPE, "application/dns-message")
        .header(reqwest::header::ACCEPT, "application/dns-message")
        .body(payload)
        .send()
        .await?
        .error_for_status()?;
    let body = response.bytes().await?;
    Ok(Message::from_vec(&body)?)
}
