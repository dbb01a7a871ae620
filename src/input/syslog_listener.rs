use super::parser::LineParser;
use crate::models::AuthEvent;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Syslog listener receiving sshd lines via UDP
pub struct AsyncSyslogListener {
    socket: UdpSocket,
    parser: LineParser,
}

impl AsyncSyslogListener {
    /// Create a new async syslog listener bound to the given address
    pub async fn new(address: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let socket = UdpSocket::bind(address).await?;
        Ok(AsyncSyslogListener {
            socket,
            parser: LineParser::new()?,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.socket.local_addr()
    }

    /// Run the syslog listener, sending events through the channel
    ///
    /// Runs until the channel is closed.
    pub async fn run(
        &mut self,
        tx: mpsc::Sender<AuthEvent>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut buf = [0u8; 2048];

        log::info!("Async syslog listener started");

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((size, _addr)) => {
                    let message = String::from_utf8_lossy(&buf[..size]);

                    match self.parser.parse(&message) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                log::info!("Channel closed, stopping syslog listener");
                                break;
                            }
                        }
                        Err(e) => log::trace!("Skipping syslog message: {}", e),
                    }
                }
                Err(e) => {
                    log::error!("Syslog recv error: {}", e);
                }
            }
        }

        Ok(())
    }
}
