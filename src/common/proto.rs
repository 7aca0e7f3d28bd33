//! Wire protocol for repfs
//!
//! Newline-terminated ASCII command lines with space-separated tokens.
//! Binary payloads (file bytes) follow specific data-plane commands and are
//! framed only by the size declared on the command line.
//!
//! Each direction of traffic gets its own closed enum, so unknown or
//! malformed input fails at decode time instead of leaking into handlers:
//! - [`Request`]: client → controller (plus the one-time `JOIN`)
//! - [`Reply`]: controller → client
//! - [`NodeEvent`]: storage node → controller (control link)
//! - [`NodeCommand`]: controller → storage node (control link)
//! - [`PeerRequest`]: client/node → storage node (data plane)

use std::fmt;

/// Acknowledgement token used on the data plane.
pub const ACK: &str = "ACK";

fn bad(line: &str, why: &str) -> crate::Error {
    crate::Error::Protocol(format!("{} ({:?})", why, line))
}

fn parse_port(line: &str, tok: &str) -> crate::Result<u16> {
    tok.parse()
        .map_err(|_| bad(line, "expected a port number"))
}

fn parse_size(line: &str, tok: &str) -> crate::Result<u64> {
    tok.parse()
        .map_err(|_| bad(line, "expected a byte size"))
}

/// Commands a client (or a joining node) sends to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Store { name: String, size: u64 },
    Load { name: String },
    Reload { name: String },
    Remove { name: String },
    List,
    Join { port: u16 },
}

impl Request {
    pub fn parse(line: &str) -> crate::Result<Self> {
        let toks: Vec<&str> = line.split_whitespace().collect();
        match toks.as_slice() {
            ["STORE", name, size] => Ok(Request::Store {
                name: name.to_string(),
                size: parse_size(line, size)?,
            }),
            ["LOAD", name] => Ok(Request::Load {
                name: name.to_string(),
            }),
            ["RELOAD", name] => Ok(Request::Reload {
                name: name.to_string(),
            }),
            ["REMOVE", name] => Ok(Request::Remove {
                name: name.to_string(),
            }),
            ["LIST"] => Ok(Request::List),
            ["JOIN", port] => Ok(Request::Join {
                port: parse_port(line, port)?,
            }),
            _ => Err(bad(line, "unrecognised client command")),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Store { name, size } => write!(f, "STORE {} {}", name, size),
            Request::Load { name } => write!(f, "LOAD {}", name),
            Request::Reload { name } => write!(f, "RELOAD {}", name),
            Request::Remove { name } => write!(f, "REMOVE {}", name),
            Request::List => write!(f, "LIST"),
            Request::Join { port } => write!(f, "JOIN {}", port),
        }
    }
}

/// Replies the controller sends back to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    StoreTo(Vec<u16>),
    StoreComplete,
    LoadFrom { port: u16, size: u64 },
    RemoveComplete,
    FileList(Vec<String>),
    FileAlreadyExists,
    FileDoesNotExist,
    NotEnoughNodes,
    LoadFailed,
}

impl Reply {
    pub fn parse(line: &str) -> crate::Result<Self> {
        let toks: Vec<&str> = line.split_whitespace().collect();
        match toks.as_slice() {
            ["STORE_TO", ports @ ..] if !ports.is_empty() => Ok(Reply::StoreTo(
                ports
                    .iter()
                    .map(|p| parse_port(line, p))
                    .collect::<crate::Result<_>>()?,
            )),
            ["STORE_COMPLETE"] => Ok(Reply::StoreComplete),
            ["LOAD_FROM", port, size] => Ok(Reply::LoadFrom {
                port: parse_port(line, port)?,
                size: parse_size(line, size)?,
            }),
            ["REMOVE_COMPLETE"] => Ok(Reply::RemoveComplete),
            ["LIST", files @ ..] => Ok(Reply::FileList(
                files.iter().map(|s| s.to_string()).collect(),
            )),
            ["ERROR_FILE_ALREADY_EXISTS"] => Ok(Reply::FileAlreadyExists),
            ["ERROR_FILE_DOES_NOT_EXIST"] => Ok(Reply::FileDoesNotExist),
            ["ERROR_NOT_ENOUGH_DSTORES"] => Ok(Reply::NotEnoughNodes),
            ["ERROR_LOAD"] => Ok(Reply::LoadFailed),
            _ => Err(bad(line, "unrecognised controller reply")),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::StoreTo(ports) => {
                write!(f, "STORE_TO")?;
                for p in ports {
                    write!(f, " {}", p)?;
                }
                Ok(())
            }
            Reply::StoreComplete => write!(f, "STORE_COMPLETE"),
            Reply::LoadFrom { port, size } => write!(f, "LOAD_FROM {} {}", port, size),
            Reply::RemoveComplete => write!(f, "REMOVE_COMPLETE"),
            Reply::FileList(files) => {
                write!(f, "LIST")?;
                for name in files {
                    write!(f, " {}", name)?;
                }
                Ok(())
            }
            Reply::FileAlreadyExists => write!(f, "ERROR_FILE_ALREADY_EXISTS"),
            Reply::FileDoesNotExist => write!(f, "ERROR_FILE_DOES_NOT_EXIST"),
            Reply::NotEnoughNodes => write!(f, "ERROR_NOT_ENOUGH_DSTORES"),
            Reply::LoadFailed => write!(f, "ERROR_LOAD"),
        }
    }
}

/// Messages a storage node sends to the controller over its control link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    StoreAck { name: String },
    RemoveAck { name: String },
    /// Counts as a remove acknowledgement: the node no longer has the file.
    FileMissing { name: String },
    FileList(Vec<String>),
    RebalanceComplete,
}

impl NodeEvent {
    pub fn parse(line: &str) -> crate::Result<Self> {
        let toks: Vec<&str> = line.split_whitespace().collect();
        match toks.as_slice() {
            ["STORE_ACK", name] => Ok(NodeEvent::StoreAck {
                name: name.to_string(),
            }),
            ["REMOVE_ACK", name] => Ok(NodeEvent::RemoveAck {
                name: name.to_string(),
            }),
            ["ERROR_FILE_DOES_NOT_EXIST", name] => Ok(NodeEvent::FileMissing {
                name: name.to_string(),
            }),
            ["LIST", files @ ..] => Ok(NodeEvent::FileList(
                files.iter().map(|s| s.to_string()).collect(),
            )),
            ["REBALANCE_COMPLETE"] => Ok(NodeEvent::RebalanceComplete),
            _ => Err(bad(line, "unrecognised node event")),
        }
    }
}

impl fmt::Display for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeEvent::StoreAck { name } => write!(f, "STORE_ACK {}", name),
            NodeEvent::RemoveAck { name } => write!(f, "REMOVE_ACK {}", name),
            NodeEvent::FileMissing { name } => write!(f, "ERROR_FILE_DOES_NOT_EXIST {}", name),
            NodeEvent::FileList(files) => {
                write!(f, "LIST")?;
                for name in files {
                    write!(f, " {}", name)?;
                }
                Ok(())
            }
            NodeEvent::RebalanceComplete => write!(f, "REBALANCE_COMPLETE"),
        }
    }
}

/// One file a node must push elsewhere during a rebalance round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSend {
    pub name: String,
    pub targets: Vec<u16>,
}

/// Per-node rebalance instruction: files to push (with their destinations)
/// and files to delete locally once the pushes land.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceInstruction {
    pub sends: Vec<FileSend>,
    pub deletes: Vec<String>,
}

impl RebalanceInstruction {
    pub fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.deletes.is_empty()
    }
}

/// Instructions the controller sends to a storage node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCommand {
    Remove { name: String },
    List,
    Rebalance(RebalanceInstruction),
}

impl NodeCommand {
    pub fn parse(line: &str) -> crate::Result<Self> {
        let toks: Vec<&str> = line.split_whitespace().collect();
        match toks.as_slice() {
            ["REMOVE", name] => Ok(NodeCommand::Remove {
                name: name.to_string(),
            }),
            ["LIST"] => Ok(NodeCommand::List),
            ["REBALANCE", rest @ ..] => Ok(NodeCommand::Rebalance(parse_rebalance(line, rest)?)),
            _ => Err(bad(line, "unrecognised controller command")),
        }
    }
}

/// `REBALANCE <k> (<name> <m> <port>{m}){k} <j> <name>{j}`
fn parse_rebalance(line: &str, toks: &[&str]) -> crate::Result<RebalanceInstruction> {
    let mut cur = toks.iter();
    let mut next = || {
        cur.next()
            .copied()
            .ok_or_else(|| bad(line, "truncated REBALANCE"))
    };

    // declared counts are only trusted up to the token count actually present
    let send_count: usize = next()?
        .parse()
        .map_err(|_| bad(line, "expected a file count"))?;
    let mut sends = Vec::with_capacity(send_count.min(toks.len()));
    for _ in 0..send_count {
        let name = next()?.to_string();
        let port_count: usize = next()?
            .parse()
            .map_err(|_| bad(line, "expected a port count"))?;
        let mut targets = Vec::with_capacity(port_count.min(toks.len()));
        for _ in 0..port_count {
            targets.push(parse_port(line, next()?)?);
        }
        sends.push(FileSend { name, targets });
    }

    let delete_count: usize = next()?
        .parse()
        .map_err(|_| bad(line, "expected a file count"))?;
    let mut deletes = Vec::with_capacity(delete_count.min(toks.len()));
    for _ in 0..delete_count {
        deletes.push(next()?.to_string());
    }

    Ok(RebalanceInstruction { sends, deletes })
}

impl fmt::Display for NodeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeCommand::Remove { name } => write!(f, "REMOVE {}", name),
            NodeCommand::List => write!(f, "LIST"),
            NodeCommand::Rebalance(instr) => {
                write!(f, "REBALANCE {}", instr.sends.len())?;
                for send in &instr.sends {
                    write!(f, " {} {}", send.name, send.targets.len())?;
                    for p in &send.targets {
                        write!(f, " {}", p)?;
                    }
                }
                write!(f, " {}", instr.deletes.len())?;
                for name in &instr.deletes {
                    write!(f, " {}", name)?;
                }
                Ok(())
            }
        }
    }
}

/// Data-plane requests a client or peer node sends to a storage node.
/// `Store` and `RebalanceStore` are followed by `size` raw payload bytes
/// once the node answers `ACK`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRequest {
    Store { name: String, size: u64 },
    LoadData { name: String },
    RebalanceStore { name: String, size: u64 },
}

impl PeerRequest {
    pub fn parse(line: &str) -> crate::Result<Self> {
        let toks: Vec<&str> = line.split_whitespace().collect();
        match toks.as_slice() {
            ["STORE", name, size] => Ok(PeerRequest::Store {
                name: name.to_string(),
                size: parse_size(line, size)?,
            }),
            ["LOAD_DATA", name] => Ok(PeerRequest::LoadData {
                name: name.to_string(),
            }),
            ["REBALANCE_STORE", name, size] => Ok(PeerRequest::RebalanceStore {
                name: name.to_string(),
                size: parse_size(line, size)?,
            }),
            _ => Err(bad(line, "unrecognised data-plane command")),
        }
    }
}

impl fmt::Display for PeerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRequest::Store { name, size } => write!(f, "STORE {} {}", name, size),
            PeerRequest::LoadData { name } => write!(f, "LOAD_DATA {}", name),
            PeerRequest::RebalanceStore { name, size } => {
                write!(f, "REBALANCE_STORE {} {}", name, size)
            }
        }
    }
}
