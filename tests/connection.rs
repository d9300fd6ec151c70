//! End-to-end connection tests against a scripted mock server.

mod support;

use std::time::Duration;

use redis_mux::{Connection, Error, Operation, PushKind, Request, Response, Value};
use support::{listener, test_config, ServerConn};

const NO_ARGS: &[&str] = &[];

fn spawn_run(conn: &Connection) -> tokio::task::JoinHandle<Result<(), Error>> {
    let conn = conn.clone();
    tokio::spawn(async move { conn.run().await })
}

#[tokio::test]
async fn handshake_then_exec() {
    let (listener, addr) = listener().await;
    let server = tokio::spawn(async move {
        let mut server = ServerConn::accept(&listener).await;
        server.handshake().await;
        server.expect("PING").await;
        server.send(b"+PONG\r\n").await;
        server.swallow().await;
    });

    let conn = Connection::new(test_config(addr));
    let run = spawn_run(&conn);

    let mut req = Request::new();
    req.push("PING", NO_ARGS);
    let mut resp = Response::new();
    let n = conn.exec(&req, &mut resp).await.expect("exec");
    assert_eq!(n, b"+PONG\r\n".len());
    assert_eq!(resp.extract::<String>(0).unwrap(), "PONG");

    let usage = conn.usage();
    assert!(usage.commands_sent >= 2); // HELLO + PING
    assert!(usage.bytes_read > 0);

    assert_eq!(conn.cancel(Operation::Run), 0);
    assert!(matches!(run.await.unwrap(), Err(Error::Cancelled)));
    server.abort();
}

#[tokio::test]
async fn hello_is_written_before_queued_requests() {
    let (listener, addr) = listener().await;
    let conn = Connection::new(test_config(addr));

    // Queue a request before the connection exists.
    let exec_conn = conn.clone();
    let exec = tokio::spawn(async move {
        let mut req = Request::new();
        req.push("PING", NO_ARGS);
        let mut resp = Response::new();
        exec_conn.exec(&req, &mut resp).await.map(|_| ())
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let run = spawn_run(&conn);
    let mut server = ServerConn::accept(&listener).await;
    server.expect("PING").await;
    let received = server.received();
    let hello_at = received.find("HELLO").expect("HELLO was sent");
    let ping_at = received.find("PING").expect("PING was sent");
    assert!(hello_at < ping_at, "HELLO must precede queued requests");

    server.send(support::HELLO_REPLY).await;
    server.send(b"+PONG\r\n").await;
    exec.await.unwrap().expect("queued exec");

    conn.cancel(Operation::Run);
    let _ = run.await;
    server.swallow().await;
}

#[tokio::test]
async fn pipeline_with_interleaved_push() {
    let (listener, addr) = listener().await;
    let server = tokio::spawn(async move {
        let mut server = ServerConn::accept(&listener).await;
        server.handshake().await;
        server.expect("PING").await;
        server
            .send(b">1\r\n+msg1\r\n+PONG\r\n+PONG\r\n+PONG\r\n")
            .await;
        server.swallow().await;
    });

    let conn = Connection::new(test_config(addr));
    let run = spawn_run(&conn);

    let mut req = Request::new();
    req.push("PING", NO_ARGS);
    req.push("PING", NO_ARGS);
    req.push("PING", NO_ARGS);
    let mut resp = Response::new();
    conn.exec(&req, &mut resp).await.expect("exec");
    let (a, b, c) = resp.into_tuple::<(String, String, String)>().unwrap();
    assert_eq!((a.as_str(), b.as_str(), c.as_str()), ("PONG", "PONG", "PONG"));

    let mut push = Response::new();
    let n = conn.receive(&mut push).await.expect("receive");
    assert_eq!(n, b">1\r\n+msg1\r\n".len());
    let value = push.extract::<Value>(0).unwrap();
    assert_eq!(
        value,
        Value::Push {
            kind: PushKind::Other("msg1".into()),
            data: vec![],
        }
    );

    conn.cancel(Operation::Run);
    let _ = run.await;
    server.abort();
}

#[tokio::test]
async fn subscribe_resolves_on_write_and_pushes_flow() {
    let (listener, addr) = listener().await;
    let server = tokio::spawn(async move {
        let mut server = ServerConn::accept(&listener).await;
        server.handshake().await;
        server.expect("SUBSCRIBE").await;
        server.send(b">3\r\n+subscribe\r\n+foo\r\n:1\r\n").await;
        server.expect("GET").await;
        server.send(b"$3\r\nval\r\n").await;
        server.swallow().await;
    });

    let conn = Connection::new(test_config(addr));
    let run = spawn_run(&conn);

    let mut subscribe = Request::new();
    subscribe.push("SUBSCRIBE", &["foo"]);
    assert_eq!(subscribe.expected_responses(), 0);
    let mut resp = Response::new();
    let n = conn.exec(&subscribe, &mut resp).await.expect("subscribe");
    // Resolved on write: no response bytes belong to it.
    assert_eq!(n, 0);
    assert!(resp.is_empty());

    let mut get = Request::new();
    get.push("GET", &["x"]);
    let mut resp = Response::new();
    conn.exec(&get, &mut resp).await.expect("get");
    assert_eq!(resp.extract::<String>(0).unwrap(), "val");

    let mut push = Response::new();
    conn.receive(&mut push).await.expect("receive");
    let Value::Push { kind, data } = push.extract::<Value>(0).unwrap() else {
        panic!("expected a push frame");
    };
    assert_eq!(kind, PushKind::Subscribe);
    assert_eq!(data[0], Value::SimpleString("foo".into()));

    conn.cancel(Operation::Run);
    let _ = run.await;
    server.abort();
}

#[tokio::test]
async fn server_error_reaches_only_its_exec() {
    let (listener, addr) = listener().await;
    let server = tokio::spawn(async move {
        let mut server = ServerConn::accept(&listener).await;
        server.handshake().await;
        server.expect("GET").await;
        server
            .send(b"-ERR wrong number of arguments\r\n$2\r\nok\r\n")
            .await;
        server.swallow().await;
    });

    let conn = Connection::new(test_config(addr));
    let run = spawn_run(&conn);

    let mut req = Request::new();
    req.push("GET", NO_ARGS);
    req.push("GET", &["k"]);
    let mut resp = Response::new();
    conn.exec(&req, &mut resp).await.expect("exec itself succeeds");
    assert!(matches!(
        resp.extract::<String>(0),
        Err(Error::Resp3SimpleError(msg)) if msg.contains("wrong number")
    ));
    assert_eq!(resp.extract::<String>(1).unwrap(), "ok");

    // The connection stayed healthy.
    assert!(conn.is_open());

    conn.cancel(Operation::Run);
    let _ = run.await;
    server.abort();
}

#[tokio::test]
async fn reconnects_after_server_drop() {
    let (listener, addr) = listener().await;
    let server = tokio::spawn(async move {
        // First connection: handshake, then drop.
        let mut first = ServerConn::accept(&listener).await;
        first.handshake().await;
        drop(first);

        // Second connection serves the request.
        let mut second = ServerConn::accept(&listener).await;
        second.handshake().await;
        second.expect("PING").await;
        second.send(b"+PONG\r\n").await;
        second.swallow().await;
    });

    let mut cfg = test_config(addr);
    cfg.reconnect_wait_interval = Duration::from_millis(10);
    let conn = Connection::new(cfg);
    let run = spawn_run(&conn);

    // Let the first connection die before sending anything.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut req = Request::new();
    req.push("PING", NO_ARGS);
    let mut resp = Response::new();
    conn.exec(&req, &mut resp).await.expect("exec after reconnect");
    assert_eq!(resp.extract::<String>(0).unwrap(), "PONG");

    conn.cancel(Operation::Run);
    assert!(matches!(run.await.unwrap(), Err(Error::Cancelled)));
    server.abort();
}

#[tokio::test]
async fn pong_timeout_ends_the_run() {
    let (listener, addr) = listener().await;
    let server = tokio::spawn(async move {
        let mut server = ServerConn::accept(&listener).await;
        server.handshake().await;
        // Swallow PINGs, never answer.
        server.swallow().await;
    });

    let mut cfg = test_config(addr);
    cfg.health_check_interval = Duration::from_millis(50);
    let conn = Connection::new(cfg);

    let result = tokio::time::timeout(Duration::from_secs(5), conn.run()).await;
    assert!(matches!(result, Ok(Err(Error::PongTimeout))));
    server.abort();
}

#[tokio::test]
async fn dropping_a_written_exec_tears_the_connection_down() {
    let (listener, addr) = listener().await;
    let server = tokio::spawn(async move {
        let mut server = ServerConn::accept(&listener).await;
        server.handshake().await;
        server.expect("BLPOP").await;
        // Block forever: the reply never comes.
        server.swallow().await;
    });

    let conn = Connection::new(test_config(addr));
    let run = spawn_run(&conn);

    let mut req = Request::new();
    req.push("BLPOP", &["key", "0"]);
    let mut resp = Response::new();
    let result = tokio::time::timeout(Duration::from_millis(200), conn.exec(&req, &mut resp)).await;
    assert!(result.is_err(), "BLPOP must still be blocked");

    // The dropped exec cannot un-send its bytes; the connection is closed
    // instead. With reconnection disabled the run ends cleanly.
    let run_result = tokio::time::timeout(Duration::from_secs(5), run).await;
    assert!(matches!(run_result, Ok(Ok(Ok(())))));
    server.abort();
}

#[tokio::test]
async fn exec_fails_fast_when_not_connected() {
    let (_listener, addr) = listener().await;
    let conn = Connection::new(test_config(addr));

    let mut req = Request::new();
    req.config_mut().cancel_if_not_connected = true;
    req.push("PING", NO_ARGS);
    let mut resp = Response::new();
    assert!(matches!(
        conn.exec(&req, &mut resp).await,
        Err(Error::NotConnected)
    ));
}

#[tokio::test]
async fn cancel_exec_cancels_waiting_requests() {
    let (_listener, addr) = listener().await;
    let conn = Connection::new(test_config(addr));

    let exec_conn = conn.clone();
    let exec = tokio::spawn(async move {
        let mut req = Request::new();
        req.push("PING", NO_ARGS);
        let mut resp = Response::new();
        exec_conn.exec(&req, &mut resp).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(conn.cancel(Operation::Exec), 1);
    assert!(matches!(exec.await.unwrap(), Err(Error::Cancelled)));
}

#[tokio::test]
async fn cancel_receive_interrupts_the_waiter() {
    let (_listener, addr) = listener().await;
    let conn = Connection::new(test_config(addr));

    let recv_conn = conn.clone();
    let receive = tokio::spawn(async move {
        let mut resp = Response::new();
        recv_conn.receive(&mut resp).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    conn.cancel(Operation::Receive);
    assert!(matches!(receive.await.unwrap(), Err(Error::Cancelled)));
}

#[tokio::test]
async fn read_buffer_cap_fails_the_run() {
    let (listener, addr) = listener().await;
    let server = tokio::spawn(async move {
        let server = ServerConn::accept(&listener).await;
        server.swallow().await;
    });

    let mut cfg = test_config(addr);
    cfg.max_read_buffer = 1024;
    let conn = Connection::new(cfg);

    let result = tokio::time::timeout(Duration::from_secs(5), conn.run()).await;
    assert!(matches!(
        result,
        Ok(Err(Error::ExceedsMaximumReadBufferSize))
    ));
    server.abort();
}
