//! Client for the repfs control protocol.
//!
//! One [`Client`] wraps one controller connection. Control replies arrive on
//! that connection; file bytes move over short-lived data-plane connections
//! straight to the storage nodes, exactly as the storage nodes themselves
//! move rebalance traffic.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::common::net::{read_line_timeout, read_payload};
use crate::common::proto::{self, PeerRequest, Reply, Request};
use crate::common::{Error, Result};

pub struct Client {
    controller: SocketAddr,
    timeout: Duration,
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    pub async fn connect(controller: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect(controller).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            controller,
            timeout,
            reader: BufReader::new(read_half).lines(),
            writer: write_half,
        })
    }

    async fn send(&mut self, request: Request) -> Result<()> {
        self.writer
            .write_all(format!("{}\n", request).as_bytes())
            .await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Reply> {
        match read_line_timeout(&mut self.reader, self.timeout).await? {
            Some(line) => Reply::parse(&line),
            None => Err(Error::ConnectionClosed),
        }
    }

    fn node_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.controller.ip(), port)
    }

    /// Store a file: the controller names the target nodes, the bytes go to
    /// each of them directly, and the call completes once the controller has
    /// seen the full acknowledgement quorum. Returns the target ports.
    pub async fn store(&mut self, name: &str, data: &[u8]) -> Result<Vec<u16>> {
        if name.is_empty() || name.chars().any(|c| c.is_whitespace()) {
            return Err(Error::InvalidFileName(name.to_string()));
        }
        self.send(Request::Store {
            name: name.to_string(),
            size: data.len() as u64,
        })
        .await?;
        let targets = match self.recv().await? {
            Reply::StoreTo(ports) => ports,
            Reply::FileAlreadyExists => return Err(Error::FileAlreadyExists(name.to_string())),
            Reply::NotEnoughNodes => return Err(Error::NotEnoughNodes),
            other => return Err(Error::UnexpectedReply(other.to_string())),
        };
        for port in &targets {
            self.push_to_node(*port, name, data).await?;
        }
        match self.recv().await? {
            Reply::StoreComplete => Ok(targets),
            other => Err(Error::UnexpectedReply(other.to_string())),
        }
    }

    async fn push_to_node(&self, port: u16, name: &str, data: &[u8]) -> Result<()> {
        let stream = TcpStream::connect(self.node_addr(port)).await?;
        let (read_half, mut write_half) = stream.into_split();
        let header = PeerRequest::Store {
            name: name.to_string(),
            size: data.len() as u64,
        };
        write_half
            .write_all(format!("{}\n", header).as_bytes())
            .await?;

        let mut lines = BufReader::new(read_half).lines();
        match read_line_timeout(&mut lines, self.timeout).await? {
            Some(line) if line.trim() == proto::ACK => {}
            Some(line) => return Err(Error::UnexpectedReply(line)),
            None => return Err(Error::ConnectionClosed),
        }
        write_half.write_all(data).await?;
        write_half.flush().await?;
        Ok(())
    }

    /// Load a file, falling back through the remaining holders with RELOAD
    /// until one actually serves the bytes.
    pub async fn load(&mut self, name: &str) -> Result<Vec<u8>> {
        self.send(Request::Load {
            name: name.to_string(),
        })
        .await?;
        let mut attempts = 0;
        loop {
            match self.recv().await? {
                Reply::LoadFrom { port, size } => {
                    attempts += 1;
                    match self.fetch(port, name, size).await {
                        Ok(data) => return Ok(data),
                        Err(e) => {
                            tracing::warn!("fetching {} from node {}: {}", name, port, e);
                            self.send(Request::Reload {
                                name: name.to_string(),
                            })
                            .await?;
                        }
                    }
                }
                Reply::LoadFailed => return Err(Error::LoadFailed { attempts }),
                Reply::FileDoesNotExist => return Err(Error::FileNotFound(name.to_string())),
                Reply::NotEnoughNodes => return Err(Error::NotEnoughNodes),
                other => return Err(Error::UnexpectedReply(other.to_string())),
            }
        }
    }

    async fn fetch(&self, port: u16, name: &str, size: u64) -> Result<Vec<u8>> {
        let stream = TcpStream::connect(self.node_addr(port)).await?;
        let (read_half, mut write_half) = stream.into_split();
        let header = PeerRequest::LoadData {
            name: name.to_string(),
        };
        write_half
            .write_all(format!("{}\n", header).as_bytes())
            .await?;
        write_half.flush().await?;
        let mut reader = BufReader::new(read_half);
        read_payload(&mut reader, size, self.timeout).await
    }

    pub async fn remove(&mut self, name: &str) -> Result<()> {
        self.send(Request::Remove {
            name: name.to_string(),
        })
        .await?;
        match self.recv().await? {
            Reply::RemoveComplete => Ok(()),
            Reply::FileDoesNotExist => Err(Error::FileNotFound(name.to_string())),
            Reply::NotEnoughNodes => Err(Error::NotEnoughNodes),
            other => Err(Error::UnexpectedReply(other.to_string())),
        }
    }

    pub async fn list(&mut self) -> Result<Vec<String>> {
        self.send(Request::List).await?;
        match self.recv().await? {
            Reply::FileList(files) => Ok(files),
            Reply::NotEnoughNodes => Err(Error::NotEnoughNodes),
            other => Err(Error::UnexpectedReply(other.to_string())),
        }
    }
}
