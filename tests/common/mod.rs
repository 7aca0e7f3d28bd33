//! In-process cluster harness shared by the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use repfs::{
    Client, Controller, ControllerConfig, ControllerHandle, NodeConfig, NodeServer, RunningNode,
};

pub const TIMEOUT_MS: u64 = 1_000;

pub struct TestCluster {
    pub controller: ControllerHandle,
    pub nodes: Vec<RunningNode>,
    pub dirs: Vec<TempDir>,
}

impl TestCluster {
    /// Controller plus `node_count` nodes on ephemeral ports. The periodic
    /// rebalance timer is set far out; tests rely on join/loss triggers or
    /// fire rounds explicitly.
    pub async fn start(node_count: usize, replication: usize, auto_rebalance: bool) -> Self {
        let controller = Controller::spawn(ControllerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            replication,
            timeout_ms: TIMEOUT_MS,
            rebalance_period_ms: 60_000,
            auto_rebalance,
        })
        .await
        .expect("controller should bind");

        let mut cluster = Self {
            controller,
            nodes: Vec::new(),
            dirs: Vec::new(),
        };
        for _ in 0..node_count {
            cluster.add_node().await;
        }
        cluster
    }

    pub async fn add_node(&mut self) -> u16 {
        let dir = tempfile::tempdir().expect("tempdir");
        let node = NodeServer::spawn(NodeConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            controller_addr: self.controller.addr(),
            timeout_ms: TIMEOUT_MS,
            data_dir: dir.path().to_path_buf(),
        })
        .await
        .expect("node should start");
        let port = node.port();
        self.nodes.push(node);
        self.dirs.push(dir);
        // give the controller a beat to process the JOIN
        tokio::time::sleep(Duration::from_millis(100)).await;
        port
    }

    pub async fn client(&self) -> Client {
        Client::connect(self.controller.addr(), Duration::from_millis(TIMEOUT_MS))
            .await
            .expect("client should connect")
    }

    /// Wait until the controller accepts LIST, i.e. enough nodes joined.
    pub async fn wait_ready(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let mut client = self.client().await;
            if client.list().await.is_ok() {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "cluster did not become ready"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Shut a node down and drop its data directory.
    pub fn kill_node(&mut self, port: u16) {
        let pos = self
            .nodes
            .iter()
            .position(|n| n.port() == port)
            .expect("no such node");
        let node = self.nodes.remove(pos);
        node.shutdown();
        self.dirs.remove(pos);
    }

    /// Live node ports whose data directory holds `name` right now.
    pub fn holders_on_disk(&self, name: &str) -> Vec<u16> {
        self.nodes
            .iter()
            .zip(&self.dirs)
            .filter(|(_, dir)| dir.path().join(name).exists())
            .map(|(node, _)| node.port())
            .collect()
    }

    /// Number of blobs currently on the node's disk.
    pub fn files_on_disk(&self, port: u16) -> usize {
        let pos = self
            .nodes
            .iter()
            .position(|n| n.port() == port)
            .expect("no such node");
        std::fs::read_dir(self.dirs[pos].path())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

/// Poll `cond` until it holds or the deadline passes.
pub async fn eventually(mut cond: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Line-level controller connection for tests that need to drive the
/// protocol mid-operation, where the `Client` would run it to completion.
pub struct RawConn {
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl RawConn {
    pub async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half).lines(),
            writer: write_half,
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .expect("send");
    }

    pub async fn recv(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.reader.next_line())
            .await
            .expect("reply within deadline")
            .expect("read")
            .expect("connection open")
    }
}

/// Fetch `size` bytes of `name` straight from a node's data plane.
pub async fn fetch_from_node(port: u16, name: &str, size: u64) -> std::io::Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    stream
        .write_all(format!("LOAD_DATA {}\n", name).as_bytes())
        .await?;
    let mut buf = vec![0u8; size as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}
