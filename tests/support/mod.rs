//! Shared test helpers: a scriptable mock server speaking raw RESP3 bytes.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use redis_mux::{Address, Config};

/// Minimal RESP3 HELLO reply.
pub const HELLO_REPLY: &[u8] =
    b"%3\r\n$6\r\nserver\r\n$5\r\nredis\r\n$5\r\nproto\r\n:3\r\n$4\r\nrole\r\n$6\r\nmaster\r\n";

pub async fn listener() -> (TcpListener, Address) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let port = listener.local_addr().expect("local addr").port();
    (listener, Address::new("127.0.0.1", port))
}

/// Config pointed at a mock server: health checking and reconnection off
/// unless a test opts in.
pub fn test_config(addr: Address) -> Config {
    Config {
        addr,
        health_check_interval: Duration::ZERO,
        reconnect_wait_interval: Duration::ZERO,
        resolve_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(5),
        ..Config::default()
    }
}

/// One accepted client connection on the mock server side.
pub struct ServerConn {
    socket: TcpStream,
    received: String,
}

impl ServerConn {
    pub async fn accept(listener: &TcpListener) -> ServerConn {
        let (socket, _) = listener.accept().await.expect("accept");
        ServerConn {
            socket,
            received: String::new(),
        }
    }

    /// Reads until everything received so far contains `needle`.
    pub async fn expect(&mut self, needle: &str) {
        let mut chunk = [0u8; 4096];
        while !self.received.contains(needle) {
            let n = self.socket.read(&mut chunk).await.expect("server read");
            assert!(n > 0, "client closed while waiting for {needle:?}");
            self.received
                .push_str(&String::from_utf8_lossy(&chunk[..n]));
        }
    }

    /// Everything received so far, as lossy UTF-8.
    pub fn received(&self) -> &str {
        &self.received
    }

    pub async fn send(&mut self, bytes: &[u8]) {
        self.socket.write_all(bytes).await.expect("server write");
    }

    /// Waits for the HELLO and answers it.
    pub async fn handshake(&mut self) {
        self.expect("HELLO").await;
        self.send(HELLO_REPLY).await;
    }

    /// Keeps the socket open, swallowing whatever the client writes, until
    /// the client goes away.
    pub async fn swallow(mut self) {
        let mut chunk = [0u8; 4096];
        while let Ok(n) = self.socket.read(&mut chunk).await {
            if n == 0 {
                return;
            }
        }
    }
}
