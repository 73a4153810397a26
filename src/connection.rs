//! Node addresses and the blocking connection used by the seed probe and
//! the synchronous frontend.

use std::fmt;
use std::io::{BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use crate::cmd::Cmd;
use crate::parser::Parser;
use crate::types::{ErrorKind, RouterError, RouterResult, Value};

/// The address of a single cluster node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeAddr {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl NodeAddr {
    /// Creates an address from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> NodeAddr {
        NodeAddr {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// The node string will always be in the format host:port as it is either
// supplied by the caller or returned by the server in an ASK/MOVED reply.
// IPv6 hosts may carry brackets and contain colons themselves.
impl FromStr for NodeAddr {
    type Err = RouterError;

    fn from_str(node: &str) -> RouterResult<NodeAddr> {
        let invalid_error = || (ErrorKind::InvalidArgument, "Invalid node string");

        let (host, port) = node
            .rsplit_once(':')
            .and_then(|(host, port)| {
                Some(host.trim_start_matches('[').trim_end_matches(']'))
                    .filter(|h| !h.is_empty())
                    .zip(u16::from_str(port).ok())
            })
            .ok_or_else(invalid_error)?;

        Ok(NodeAddr::new(host, port))
    }
}

/// A blocking connection to a single node.
///
/// The connection is open until a response read fails or writing a command
/// reports a broken pipe; the owning pool drops it at that point.
pub struct Connection {
    reader: BufReader<TcpStream>,
    open: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("open", &self.open).finish()
    }
}

impl Connection {
    /// Opens a connection, bounding the connect attempt by `timeout`.
    pub fn connect(addr: &NodeAddr, timeout: Option<Duration>) -> RouterResult<Connection> {
        let mut candidates = (addr.host.as_str(), addr.port).to_socket_addrs().map_err(|err| {
            RouterError::from((
                ErrorKind::ConnectionFailed,
                "No address found for host",
                err.to_string(),
            ))
        })?;
        let socket_addr = candidates
            .next()
            .ok_or((ErrorKind::ConnectionFailed, "No address found for host"))?;

        let stream = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&socket_addr, timeout),
            None => TcpStream::connect(socket_addr),
        }
        .map_err(|err| {
            RouterError::from((
                ErrorKind::ConnectionFailed,
                "Failed to connect to node",
                err.to_string(),
            ))
        })?;
        stream.set_nodelay(true)?;

        Ok(Connection {
            reader: BufReader::new(stream),
            open: true,
        })
    }

    /// Sets the read timeout for the connection. `None` blocks indefinitely.
    pub fn set_read_timeout(&self, dur: Option<Duration>) -> RouterResult<()> {
        self.reader.get_ref().set_read_timeout(dur)?;
        Ok(())
    }

    /// Sets the write timeout for the connection. `None` blocks indefinitely.
    pub fn set_write_timeout(&self, dur: Option<Duration>) -> RouterResult<()> {
        self.reader.get_ref().set_write_timeout(dur)?;
        Ok(())
    }

    /// Sends an already packed command without reading a response.
    pub fn send_packed_command(&mut self, cmd: &[u8]) -> RouterResult<()> {
        self.reader.get_mut().write_all(cmd).map_err(|err| {
            self.open = false;
            RouterError::from((
                ErrorKind::Disconnected,
                "Failed to write to the connection",
                err.to_string(),
            ))
        })
    }

    /// Fetches a single response from the connection.
    pub fn recv_response(&mut self) -> RouterResult<Value> {
        let result = Parser::new(&mut self.reader).parse_value();
        if let Err(ref err) = result {
            if err.is_connection_dropped() {
                self.open = false;
            }
        }
        result
    }

    /// Sends a command and reads its response.
    pub fn req_command(&mut self, cmd: &Cmd) -> RouterResult<Value> {
        self.req_packed_command(&cmd.get_packed_command())
    }

    /// Sends an already packed command and reads its response.
    pub fn req_packed_command(&mut self, cmd: &[u8]) -> RouterResult<Value> {
        self.send_packed_command(cmd)?;
        self.recv_response()
    }

    /// Returns the connection status.
    pub fn is_open(&self) -> bool {
        self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cluster_node_host_port() {
        let cases = vec![
            ("127.0.0.1:6379", NodeAddr::new("127.0.0.1", 6379)),
            (
                "localhost.localdomain:6379",
                NodeAddr::new("localhost.localdomain", 6379),
            ),
            ("dead::cafe:beef:30001", NodeAddr::new("dead::cafe:beef", 30001)),
            (
                "[fe80::cafe:beef%en1]:30001",
                NodeAddr::new("fe80::cafe:beef%en1", 30001),
            ),
        ];

        for (input, expected) in cases {
            assert_eq!(input.parse::<NodeAddr>().unwrap(), expected);
        }

        let cases = vec![":0", "[]:6379", "127.0.0.1", "127.0.0.1:not-a-port"];
        for input in cases {
            assert_eq!(
                input.parse::<NodeAddr>().err(),
                Some(RouterError::from((
                    ErrorKind::InvalidArgument,
                    "Invalid node string",
                ))),
            );
        }
    }

    #[test]
    fn display_round_trips() {
        let addr = NodeAddr::new("10.0.0.7", 7002);
        assert_eq!(addr.to_string().parse::<NodeAddr>().unwrap(), addr);
    }
}
