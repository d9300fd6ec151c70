//! Sentinel-based discovery of the current master (or a replica).
//!
//! Before a run cycle connects anywhere, each configured sentinel is
//! queried in turn over a short-lived plain TCP connection:
//!
//! ```text
//! HELLO 3
//! <user-supplied sentinel setup>
//! SENTINEL GET-MASTER-ADDR-BY-NAME <master>
//! SENTINEL REPLICAS <master>            (only when resolving a replica)
//! SENTINEL SENTINELS <master>
//! ```
//!
//! The first sentinel that answers wins: the target address is extracted
//! and the sentinel list is refreshed from the gossiped `SENTINEL
//! SENTINELS` reply, keeping the responsive sentinel first and re-adding
//! bootstrap addresses the gossip no longer mentions.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::adapter::{Adapter, NodeCollector, OwnedNode};
use crate::config::{Address, Config, ServerRole};
use crate::error::{Error, Result};
use crate::request::Request;
use crate::resp3::{NodeKind, Parser};

/// Outcome of a successful discovery round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Resolution {
    /// Where the supervisor should connect.
    pub server_addr: Address,
    /// Refreshed sentinel list for the next round.
    pub sentinels: Vec<Address>,
}

/// Fields extracted from one sentinel's reply.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct SentinelReply {
    pub master_addr: Address,
    pub replicas: Vec<Address>,
    pub sentinels: Vec<Address>,
}

pub(crate) async fn resolve(cfg: &Config) -> Result<Resolution> {
    let sentinel_cfg = &cfg.sentinel;
    let bootstrap = sentinel_cfg.addresses.clone();
    let count = bootstrap.len();
    debug_assert!(count > 0, "resolve called without sentinel addresses");

    let start = (sentinel_cfg.rotation_seed as usize) % count.max(1);
    let mut last_err = Error::SentinelUnknownMaster;

    for offset in 0..count {
        let index = (start + offset) % count;
        let addr = &sentinel_cfg.addresses[index];
        debug!(prefix = %cfg.log_prefix, sentinel = %addr, "querying sentinel");

        match query_sentinel(cfg, addr).await {
            Ok(reply) => {
                let server_addr = match sentinel_cfg.server_role {
                    ServerRole::Master => reply.master_addr,
                    ServerRole::Replica => {
                        if reply.replicas.is_empty() {
                            warn!(prefix = %cfg.log_prefix, sentinel = %addr, "no replicas known");
                            last_err = Error::SentinelUnknownMaster;
                            continue;
                        }
                        pick_replica(&reply.replicas, sentinel_cfg.rotation_seed).clone()
                    }
                };
                let sentinels = update_sentinel_list(
                    sentinel_cfg.addresses.clone(),
                    index,
                    &reply.sentinels,
                    &bootstrap,
                );
                return Ok(Resolution {
                    server_addr,
                    sentinels,
                });
            }
            Err(err) => {
                warn!(prefix = %cfg.log_prefix, sentinel = %addr, %err, "sentinel query failed");
                last_err = err;
            }
        }
    }

    Err(last_err)
}

/// Deterministic replica selection, seeded so runs are reproducible.
fn pick_replica(replicas: &[Address], seed: u64) -> &Address {
    let mut rng = SmallRng::seed_from_u64(seed);
    &replicas[rng.gen_range(0..replicas.len())]
}

fn discovery_request(cfg: &Config) -> (Request, usize) {
    let sentinel_cfg = &cfg.sentinel;
    let master = sentinel_cfg.master_name.as_str();

    let mut req = Request::new();
    req.push("HELLO", &["3"]);
    req.append(&sentinel_cfg.setup);
    // Replies before this point are skipped; only checked for errors.
    let skip_roots = req.expected_responses();

    req.push("SENTINEL", &["GET-MASTER-ADDR-BY-NAME", master]);
    if sentinel_cfg.server_role == ServerRole::Replica {
        req.push("SENTINEL", &["REPLICAS", master]);
    }
    req.push("SENTINEL", &["SENTINELS", master]);
    (req, skip_roots)
}

/// One transient connection to one sentinel.
async fn query_sentinel(cfg: &Config, addr: &Address) -> Result<SentinelReply> {
    let (req, skip_roots) = discovery_request(cfg);

    let endpoints = crate::connection::resolve_endpoints(cfg, addr).await?;
    let mut socket = match tokio::time::timeout(cfg.connect_timeout, async {
        let mut last_err: Error = std::io::Error::from(std::io::ErrorKind::AddrNotAvailable).into();
        for endpoint in &endpoints {
            match tokio::net::TcpStream::connect(endpoint).await {
                Ok(socket) => return Ok(socket),
                Err(err) => last_err = err.into(),
            }
        }
        Err(last_err)
    })
    .await
    {
        Ok(result) => result?,
        Err(_) => return Err(Error::ConnectTimeout),
    };

    socket.write_all(req.payload()).await?;

    // Collect the node sequences of every expected reply.
    let mut parser = Parser::new();
    let mut collector = NodeCollector::default();
    let mut buffer: Vec<u8> = Vec::new();
    let mut remaining = req.expected_responses();
    let mut chunk = [0u8; 4096];
    'read: while remaining > 0 {
        let n = match tokio::time::timeout(cfg.resolve_timeout, socket.read(&mut chunk)).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::ResolveTimeout),
        };
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        buffer.extend_from_slice(&chunk[..n]);

        while let Some(node) = parser.consume(&buffer)? {
            collector.on_node(0, &node)?;
            if parser.done() {
                buffer.drain(..parser.consumed());
                parser.reset();
                remaining -= 1;
                if remaining == 0 {
                    break 'read;
                }
            }
        }
    }

    parse_sentinel_reply(&collector.nodes, cfg.sentinel.server_role, skip_roots)
}

fn node_error(node: &OwnedNode) -> Result<()> {
    if !node.kind.is_error() {
        return Ok(());
    }
    let text = String::from_utf8_lossy(&node.value).into_owned();
    Err(match node.kind {
        NodeKind::SimpleError => Error::Resp3SimpleError(text),
        _ => Error::Resp3BlobError(text),
    })
}

fn node_text(node: &OwnedNode) -> Result<&str> {
    if node.kind != NodeKind::BlobString {
        return Err(Error::InvalidDataType);
    }
    std::str::from_utf8(&node.value).map_err(|_| Error::InvalidDataType)
}

fn node_addr(nodes: &[OwnedNode], cursor: &mut usize, depth: usize) -> Result<Address> {
    let host = nodes.get(*cursor).ok_or(Error::IncompatibleSize)?;
    if host.depth != depth {
        return Err(Error::IncompatibleNodeDepth);
    }
    let host = node_text(host)?.to_owned();
    *cursor += 1;

    let port = nodes.get(*cursor).ok_or(Error::IncompatibleSize)?;
    if port.depth != depth {
        return Err(Error::IncompatibleNodeDepth);
    }
    let port = node_text(port)?.parse().map_err(|_| Error::NotANumber)?;
    *cursor += 1;

    Ok(Address { host, port })
}

/// Parses a `SENTINEL SENTINELS` / `SENTINEL REPLICAS` reply: an array of
/// servers, each a map (RESP3) or flat array (RESP2) of string fields, from
/// which `ip` and `port` are extracted. Both must be present.
fn parse_server_list(
    nodes: &[OwnedNode],
    cursor: &mut usize,
    out: &mut Vec<Address>,
) -> Result<()> {
    let root = nodes.get(*cursor).ok_or(Error::IncompatibleSize)?;
    if root.kind != NodeKind::Array {
        return Err(Error::InvalidDataType);
    }
    let servers = root.aggregate_size;
    *cursor += 1;

    for _ in 0..servers {
        let server = nodes.get(*cursor).ok_or(Error::IncompatibleSize)?;
        let fields = match server.kind {
            NodeKind::Map => server.aggregate_size,
            NodeKind::Array => {
                if server.aggregate_size % 2 != 0 {
                    return Err(Error::IncompatibleSize);
                }
                server.aggregate_size / 2
            }
            _ => return Err(Error::InvalidDataType),
        };
        *cursor += 1;

        let mut host = None;
        let mut port = None;
        for _ in 0..fields {
            let key = nodes.get(*cursor).ok_or(Error::IncompatibleSize)?;
            let key = node_text(key)?.to_owned();
            *cursor += 1;
            let value = nodes.get(*cursor).ok_or(Error::IncompatibleSize)?;
            match key.as_str() {
                "ip" => host = Some(node_text(value)?.to_owned()),
                "port" => {
                    port = Some(node_text(value)?.parse().map_err(|_| Error::NotANumber)?);
                }
                _ => {}
            }
            *cursor += 1;
        }

        match (host, port) {
            (Some(host), Some(port)) => out.push(Address { host, port }),
            _ => return Err(Error::InvalidDataType),
        }
    }
    Ok(())
}

/// Walks the collected reply trees.
///
/// The first `skip_roots` root trees answer the HELLO and the user setup;
/// they are only checked for errors. Then, in order: the master address, an
/// optional replica list and the sentinel list.
fn parse_sentinel_reply(
    nodes: &[OwnedNode],
    role: ServerRole,
    skip_roots: usize,
) -> Result<SentinelReply> {
    let mut cursor = 0;
    let mut roots = 0;
    while cursor < nodes.len() {
        let node = &nodes[cursor];
        if node.depth == 0 {
            roots += 1;
            if roots == skip_roots + 1 {
                break;
            }
        }
        node_error(node)?;
        cursor += 1;
    }

    // SENTINEL GET-MASTER-ADDR-BY-NAME
    let master_root = nodes.get(cursor).ok_or(Error::IncompatibleSize)?;
    node_error(master_root)?;
    if master_root.kind == NodeKind::Null {
        return Err(Error::SentinelUnknownMaster);
    }
    if master_root.kind != NodeKind::Array {
        return Err(Error::InvalidDataType);
    }
    if master_root.aggregate_size != 2 {
        return Err(Error::IncompatibleSize);
    }
    cursor += 1;
    let master_addr = node_addr(nodes, &mut cursor, 1)?;

    let mut reply = SentinelReply {
        master_addr,
        ..SentinelReply::default()
    };

    // SENTINEL REPLICAS, only requested when resolving a replica.
    if role == ServerRole::Replica {
        let root = nodes.get(cursor).ok_or(Error::IncompatibleSize)?;
        node_error(root)?;
        parse_server_list(nodes, &mut cursor, &mut reply.replicas)?;
    }

    // SENTINEL SENTINELS
    let root = nodes.get(cursor).ok_or(Error::IncompatibleSize)?;
    node_error(root)?;
    parse_server_list(nodes, &mut cursor, &mut reply.sentinels)?;

    Ok(reply)
}

/// Reorders the sentinel list after a successful resolution: the sentinel
/// that answered, then the gossiped sentinels, then any bootstrap sentinel
/// missing from that union.
fn update_sentinel_list(
    mut list: Vec<Address>,
    current_index: usize,
    gossip: &[Address],
    bootstrap: &[Address],
) -> Vec<Address> {
    if current_index != 0 {
        list.swap(0, current_index);
    }
    list.truncate(1);

    list.extend(gossip.iter().cloned());

    // Quadratic, but the list is small and unsorted by nature.
    for addr in bootstrap {
        if !list.contains(addr) {
            list.push(addr.clone());
        }
    }
    list
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Parses server reply bytes into the owned node list the resolver
    /// walks.
    fn collect(wire: &[u8], replies: usize) -> Vec<OwnedNode> {
        let mut parser = Parser::new();
        let mut collector = NodeCollector::default();
        let mut buffer = wire.to_vec();
        for _ in 0..replies {
            loop {
                let node = parser
                    .consume(&buffer)
                    .expect("parse error")
                    .expect("incomplete wire");
                collector.on_node(0, &node).unwrap();
                if parser.done() {
                    buffer.drain(..parser.consumed());
                    parser.reset();
                    break;
                }
            }
        }
        collector.nodes
    }

    const HELLO_REPLY: &[u8] = b"%1\r\n$6\r\nserver\r\n$5\r\nredis\r\n";

    fn master_addr_reply() -> Vec<u8> {
        b"*2\r\n$9\r\n127.0.0.1\r\n$4\r\n6379\r\n".to_vec()
    }

    fn sentinels_reply() -> Vec<u8> {
        let mut wire = b"*2\r\n".to_vec();
        wire.extend_from_slice(
            b"%3\r\n$2\r\nip\r\n$8\r\n10.0.0.1\r\n$4\r\nport\r\n$5\r\n26379\r\n$4\r\nname\r\n$2\r\ns1\r\n"
                .as_slice(),
        );
        wire.extend_from_slice(
            b"*4\r\n$2\r\nip\r\n$8\r\n10.0.0.2\r\n$4\r\nport\r\n$5\r\n26380\r\n".as_slice(),
        );
        wire
    }

    #[test]
    fn parses_master_resolution() {
        let mut wire = HELLO_REPLY.to_vec();
        wire.extend_from_slice(&master_addr_reply());
        wire.extend_from_slice(&sentinels_reply());
        let nodes = collect(&wire, 3);

        let reply = parse_sentinel_reply(&nodes, ServerRole::Master, 1).unwrap();
        assert_eq!(reply.master_addr, Address::new("127.0.0.1", 6379));
        assert_eq!(
            reply.sentinels,
            vec![Address::new("10.0.0.1", 26379), Address::new("10.0.0.2", 26380)]
        );
        assert!(reply.replicas.is_empty());
    }

    #[test]
    fn parses_replica_resolution() {
        let mut wire = HELLO_REPLY.to_vec();
        wire.extend_from_slice(&master_addr_reply());
        // One replica as a RESP3 map.
        wire.extend_from_slice(
            b"*1\r\n%2\r\n$2\r\nip\r\n$8\r\n10.1.1.1\r\n$4\r\nport\r\n$4\r\n6380\r\n",
        );
        wire.extend_from_slice(&sentinels_reply());
        let nodes = collect(&wire, 4);

        let reply = parse_sentinel_reply(&nodes, ServerRole::Replica, 1).unwrap();
        assert_eq!(reply.replicas, vec![Address::new("10.1.1.1", 6380)]);
        assert_eq!(reply.sentinels.len(), 2);
    }

    #[test]
    fn unknown_master_is_null() {
        let mut wire = HELLO_REPLY.to_vec();
        wire.extend_from_slice(b"_\r\n");
        let nodes = collect(&wire, 2);
        assert!(matches!(
            parse_sentinel_reply(&nodes, ServerRole::Master, 1),
            Err(Error::SentinelUnknownMaster)
        ));
    }

    #[test]
    fn error_reply_is_surfaced() {
        let mut wire = HELLO_REPLY.to_vec();
        wire.extend_from_slice(b"-ERR unknown command\r\n");
        let nodes = collect(&wire, 2);
        assert!(matches!(
            parse_sentinel_reply(&nodes, ServerRole::Master, 1),
            Err(Error::Resp3SimpleError(_))
        ));
    }

    #[test]
    fn missing_ip_or_port_is_invalid() {
        let mut wire = HELLO_REPLY.to_vec();
        wire.extend_from_slice(&master_addr_reply());
        wire.extend_from_slice(b"*1\r\n%1\r\n$2\r\nip\r\n$8\r\n10.0.0.9\r\n");
        let nodes = collect(&wire, 3);
        assert!(matches!(
            parse_sentinel_reply(&nodes, ServerRole::Master, 1),
            Err(Error::InvalidDataType)
        ));
    }

    #[test]
    fn sentinel_list_update() {
        let bootstrap = vec![
            Address::new("s1", 26379),
            Address::new("s2", 26379),
            Address::new("s3", 26379),
        ];
        let gossip = vec![Address::new("s4", 26379), Address::new("s1", 26379)];

        let updated = update_sentinel_list(bootstrap.clone(), 1, &gossip, &bootstrap);
        // The answering sentinel first, then gossip, then missing bootstrap
        // entries.
        assert_eq!(
            updated,
            vec![
                Address::new("s2", 26379),
                Address::new("s4", 26379),
                Address::new("s1", 26379),
                Address::new("s3", 26379),
            ]
        );
    }

    #[test]
    fn replica_pick_is_deterministic() {
        let replicas = vec![
            Address::new("r1", 1),
            Address::new("r2", 2),
            Address::new("r3", 3),
        ];
        let first = pick_replica(&replicas, 7).clone();
        let second = pick_replica(&replicas, 7).clone();
        assert_eq!(first, second);
    }

    #[test]
    fn discovery_request_shape() {
        let mut cfg = Config::default();
        cfg.sentinel.master_name = "mymaster".into();
        cfg.sentinel.server_role = ServerRole::Replica;
        let (req, skip_roots) = discovery_request(&cfg);
        assert_eq!(skip_roots, 1);
        let payload = String::from_utf8(req.payload().to_vec()).unwrap();
        assert!(payload.contains("GET-MASTER-ADDR-BY-NAME"));
        assert!(payload.contains("REPLICAS"));
        assert!(payload.contains("SENTINELS"));
        assert_eq!(req.expected_responses(), 4);
    }
}
