use crate::dns::handler::DnsHandler;
use hickory_server::ServerFuture;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};

const TCP_TIMEOUT: Duration = Duration::from_secs(5);

/// UDP and TCP listeners on one bind address, both feeding the same handler.
pub struct DnsServer {
    server: ServerFuture<DnsHandler>,
    udp_addr: SocketAddr,
}

impl DnsServer {
    pub async fn new(listen_addr: SocketAddr, handler: DnsHandler) -> anyhow::Result<Self> {
        let mut server = ServerFuture::new(handler);

        let socket = UdpSocket::bind(listen_addr).await?;
        let udp_addr = socket.local_addr()?;
        tracing::info!(addr = %udp_addr, "dns server listening on udp");
        server.register_socket(socket);

        let listener = TcpListener::bind(listen_addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "dns server listening on tcp");
        server.register_listener(listener, TCP_TIMEOUT);

        Ok(Self { server, udp_addr })
    }

    /// The bound UDP address; useful when listening on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        self.server.block_until_done().await?;
        Ok(())
    }
}
