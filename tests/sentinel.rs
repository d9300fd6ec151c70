//! Sentinel discovery against scripted mock servers.

mod support;

use std::time::Duration;

use redis_mux::{Address, Connection, Error, Operation, Request, Response, ServerRole};
use support::{listener, test_config, ServerConn, HELLO_REPLY};

const NO_ARGS: &[&str] = &[];

fn master_addr_reply(addr: &Address) -> Vec<u8> {
    let mut wire = b"*2\r\n".to_vec();
    wire.extend_from_slice(format!("${}\r\n{}\r\n", addr.host.len(), addr.host).as_bytes());
    let port = addr.port.to_string();
    wire.extend_from_slice(format!("${}\r\n{}\r\n", port.len(), port).as_bytes());
    wire
}

/// Serves one sentinel discovery exchange and returns what was received.
async fn serve_sentinel(listener: tokio::net::TcpListener, master: Address) -> String {
    let mut conn = ServerConn::accept(&listener).await;
    conn.expect("SENTINELS").await;
    let mut reply = HELLO_REPLY.to_vec();
    reply.extend_from_slice(&master_addr_reply(&master));
    reply.extend_from_slice(b"*0\r\n"); // no gossiped sentinels
    conn.send(&reply).await;
    conn.received().to_owned()
}

#[tokio::test]
async fn resolves_master_and_connects() {
    let (master_listener, master_addr) = listener().await;
    let (sentinel_listener, sentinel_addr) = listener().await;

    let master_for_sentinel = master_addr.clone();
    let sentinel = tokio::spawn(async move {
        serve_sentinel(sentinel_listener, master_for_sentinel).await
    });
    let master = tokio::spawn(async move {
        let mut server = ServerConn::accept(&master_listener).await;
        server.handshake().await;
        server.expect("PING").await;
        server.send(b"+PONG\r\n").await;
        server.swallow().await;
    });

    let mut cfg = test_config(Address::new("invalid.example", 1));
    cfg.sentinel.addresses = vec![sentinel_addr];
    cfg.sentinel.master_name = "mymaster".into();
    cfg.sentinel.server_role = ServerRole::Master;

    let conn = Connection::new(cfg);
    let run = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.run().await })
    };

    let mut req = Request::new();
    req.push("PING", NO_ARGS);
    let mut resp = Response::new();
    conn.exec(&req, &mut resp).await.expect("exec via resolved master");
    assert_eq!(resp.extract::<String>(0).unwrap(), "PONG");

    // The discovery request went through the sentinel in the documented
    // shape.
    let received = sentinel.await.unwrap();
    assert!(received.contains("HELLO"));
    assert!(received.contains("GET-MASTER-ADDR-BY-NAME"));
    assert!(received.contains("mymaster"));

    conn.cancel(Operation::Run);
    assert!(matches!(run.await.unwrap(), Err(Error::Cancelled)));
    master.abort();
}

#[tokio::test]
async fn dead_sentinel_falls_through_to_the_next() {
    let (master_listener, master_addr) = listener().await;
    let (sentinel_listener, sentinel_addr) = listener().await;

    // A sentinel address nobody listens on.
    let dead_addr = {
        let (dead_listener, dead_addr) = listener().await;
        drop(dead_listener);
        dead_addr
    };

    let master_for_sentinel = master_addr.clone();
    let sentinel = tokio::spawn(async move {
        serve_sentinel(sentinel_listener, master_for_sentinel).await
    });
    let master = tokio::spawn(async move {
        let mut server = ServerConn::accept(&master_listener).await;
        server.handshake().await;
        server.expect("PING").await;
        server.send(b"+PONG\r\n").await;
        server.swallow().await;
    });

    let mut cfg = test_config(Address::new("invalid.example", 1));
    cfg.sentinel.addresses = vec![dead_addr, sentinel_addr];
    cfg.sentinel.master_name = "mymaster".into();
    cfg.sentinel.rotation_seed = 0; // start at the dead one
    cfg.connect_timeout = Duration::from_millis(500);

    let conn = Connection::new(cfg);
    let run = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.run().await })
    };

    let mut req = Request::new();
    req.push("PING", NO_ARGS);
    let mut resp = Response::new();
    conn.exec(&req, &mut resp).await.expect("exec after fallback");
    assert_eq!(resp.extract::<String>(0).unwrap(), "PONG");

    sentinel.await.unwrap();
    conn.cancel(Operation::Run);
    let _ = run.await;
    master.abort();
}
