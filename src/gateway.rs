use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout as tokio_timeout;

use crate::config::config as global_config;
use crate::error::{GcsError, Result};

/// Connection status changes reported by a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayEvent {
    Connected { connection_id: u32 },
    Disconnected { connection_id: u32 },
}

/// Byte transport underneath a [`crate::connection::Connection`].
///
/// Serial and USB links are provided by applications; [`TcpGateway`] is
/// built in.
#[async_trait]
pub trait Gateway: Send {
    async fn send(&mut self, text: &str) -> Result<()>;

    /// Text that arrived within a short poll window; empty if nothing did.
    async fn read(&mut self) -> Result<String>;

    /// Discard unread input.
    async fn flush(&mut self) -> Result<()>;

    fn timeout(&self) -> Duration;

    fn set_timeout(&mut self, timeout: Duration);

    fn connected(&self) -> bool;

    fn connection_id(&self) -> u32;

    async fn close(&mut self) -> Result<()>;

    /// Connection status notifications, if the gateway produces any.
    fn subscribe(&self) -> Option<broadcast::Receiver<GatewayEvent>> {
        None
    }
}

/// Latin-1 decode: every byte is one char.
#[must_use]
pub fn latin1_decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Latin-1 encode; chars above U+00FF become `?`.
#[must_use]
pub fn latin1_encode(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

const READ_POLL: Duration = Duration::from_millis(20);

pub struct TcpGateway {
    addr: String,
    stream: Option<TcpStream>,
    timeout: Duration,
    connection_id: u32,
    events: broadcast::Sender<GatewayEvent>,
}

impl std::fmt::Debug for TcpGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpGateway")
            .field("addr", &self.addr)
            .field("connected", &self.stream.is_some())
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

async fn open_stream(addr: &str) -> Result<TcpStream> {
    let addrs = lookup_host(addr)
        .await
        .map_err(|e| GcsError::Transport(format!("bad address {addr}: {e}")))?;
    let connect_timeout = Duration::from_millis(global_config().gcs_connect_timeout_ms);
    let mut last_err = None;
    for remote in addrs {
        match tokio_timeout(connect_timeout, TcpStream::connect(remote)).await {
            Ok(Ok(s)) => {
                s.set_nodelay(true)?;
                return Ok(s);
            }
            Ok(Err(e)) => last_err = Some(e.to_string()),
            Err(_) => last_err = Some(format!("connect timeout after {connect_timeout:?}")),
        }
    }
    Err(GcsError::Transport(format!(
        "failed to connect to {addr}: {}",
        last_err.unwrap_or_else(|| "no address resolved".into())
    )))
}

impl TcpGateway {
    /// Connect to `host:port` (PI controllers listen on 50000 by default).
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let addr = format!("{host}:{port}");
        let stream = open_stream(&addr).await?;
        let (events, _) = broadcast::channel(8);
        let gw = Self {
            addr,
            stream: Some(stream),
            timeout: Duration::from_millis(global_config().gcs_timeout_ms),
            connection_id: 0,
            events,
        };
        log::debug!("[GCS TCP] connected to {} (id {})", gw.addr, gw.connection_id);
        Ok(gw)
    }

    /// Drop the current socket and open a new one. Subscribers see a
    /// `Connected` event carrying the new id.
    pub async fn reconnect(&mut self) -> Result<()> {
        if self.stream.take().is_some() {
            let _ = self.events.send(GatewayEvent::Disconnected {
                connection_id: self.connection_id,
            });
        }
        let stream = open_stream(&self.addr).await?;
        self.stream = Some(stream);
        self.connection_id = self.connection_id.wrapping_add(1);
        log::debug!("[GCS TCP] reconnected to {} (id {})", self.addr, self.connection_id);
        let _ = self.events.send(GatewayEvent::Connected {
            connection_id: self.connection_id,
        });
        Ok(())
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| GcsError::Transport("not connected".into()))
    }
}

#[async_trait]
impl Gateway for TcpGateway {
    async fn send(&mut self, text: &str) -> Result<()> {
        let payload = latin1_encode(text);
        let dur = self.timeout;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| GcsError::Transport("not connected".into()))?;
        match tokio_timeout(dur, stream.write_all(&payload)).await {
            Ok(res) => res?,
            Err(_) => return Err(GcsError::Timeout(format!("write to {}", self.addr))),
        }
        if global_config().log_traffic {
            log::debug!("[GCS TCP send] {}", text.escape_debug());
        }
        Ok(())
    }

    async fn read(&mut self) -> Result<String> {
        let poll = READ_POLL.min(self.timeout);
        let mut tmp = [0u8; 4096];
        let stream = self.stream()?;
        let n = match tokio_timeout(poll, stream.read(&mut tmp)).await {
            Err(_) => return Ok(String::new()),
            Ok(res) => res?,
        };
        if n == 0 {
            self.stream = None;
            let _ = self.events.send(GatewayEvent::Disconnected {
                connection_id: self.connection_id,
            });
            return Err(GcsError::Transport(format!("{} closed the connection", self.addr)));
        }
        let text = latin1_decode(&tmp[..n]);
        if global_config().log_traffic {
            log::debug!("[GCS TCP recv] {}", text.escape_debug());
        }
        Ok(text)
    }

    async fn flush(&mut self) -> Result<()> {
        let mut tmp = [0u8; 4096];
        let stream = self.stream()?;
        // drain whatever is already buffered without waiting for more
        while let Ok(res) = tokio_timeout(Duration::from_millis(1), stream.read(&mut tmp)).await {
            if res? == 0 {
                break;
            }
        }
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn connected(&self) -> bool {
        self.stream.is_some()
    }

    fn connection_id(&self) -> u32 {
        self.connection_id
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut s) = self.stream.take() {
            s.shutdown().await?;
            let _ = self.events.send(GatewayEvent::Disconnected {
                connection_id: self.connection_id,
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<GatewayEvent>> {
        Some(self.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn latin1_roundtrip_of_control_and_high_bytes() {
        let bytes = [0x18u8, b'A', 0xB1, b'\n'];
        let text = latin1_decode(&bytes);
        assert_eq!(text.chars().count(), 4);
        assert_eq!(latin1_encode(&text), bytes);
        assert_eq!(latin1_encode("\u{20AC}"), b"?");
    }

    #[tokio::test]
    async fn tcp_send_read_and_reconnect_event() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            // echo server, one connection after another
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 256];
                    while let Ok(n) = sock.read(&mut buf).await {
                        if n == 0 || sock.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        let mut gw = TcpGateway::connect("127.0.0.1", port).await.expect("connect");
        let mut events = gw.subscribe().expect("events");
        assert!(gw.connected());
        gw.send("*IDN?\n").await.expect("send");
        let mut got = String::new();
        for _ in 0..50 {
            got.push_str(&gw.read().await.expect("read"));
            if got.ends_with('\n') {
                break;
            }
        }
        assert_eq!(got, "*IDN?\n");

        gw.reconnect().await.expect("reconnect");
        assert_eq!(gw.connection_id(), 1);
        assert_eq!(
            events.recv().await.expect("event"),
            GatewayEvent::Disconnected { connection_id: 0 }
        );
        assert_eq!(
            events.recv().await.expect("event"),
            GatewayEvent::Connected { connection_id: 1 }
        );
        gw.close().await.expect("close");
        assert!(!gw.connected());
    }
}
