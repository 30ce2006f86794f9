//! Side channel to the gas-delivery controller.

use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::debug;

use crate::config::DEFAULT_GAS_TIMEOUT;

/// Receives the gas state of every tick.
pub trait GasStateSink: Send {
    fn send_state(&mut self, state: u8) -> io::Result<()>;
}

/// Sink used when no gas controller is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullGasStateSink;

impl GasStateSink for NullGasStateSink {
    fn send_state(&mut self, _state: u8) -> io::Result<()> {
        Ok(())
    }
}

/// Sends each new gas state as ASCII decimal over a short-lived TCP connection.
///
/// Repeated states are not retransmitted. A failed send is retried on the
/// next tick.
#[derive(Debug, Clone)]
pub struct TcpGasStateSink {
    address: SocketAddr,
    pub timeout: Duration,
    last_sent: Option<u8>,
}

impl TcpGasStateSink {
    pub fn new(address: &str) -> io::Result<Self> {
        Self::with_timeout(address, DEFAULT_GAS_TIMEOUT)
    }

    pub fn with_timeout(address: &str, timeout: Duration) -> io::Result<Self> {
        let address = address.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{address} does not resolve to any address"),
            )
        })?;
        Ok(Self {
            address,
            timeout,
            last_sent: None,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn last_sent(&self) -> Option<u8> {
        self.last_sent
    }
}

impl GasStateSink for TcpGasStateSink {
    fn send_state(&mut self, state: u8) -> io::Result<()> {
        if self.last_sent == Some(state) {
            return Ok(());
        }
        let mut stream = TcpStream::connect_timeout(&self.address, self.timeout)?;
        stream.set_write_timeout(Some(self.timeout.max(Duration::from_millis(100))))?;
        stream.write_all(state.to_string().as_bytes())?;
        stream.flush()?;
        let _ = stream.shutdown(Shutdown::Both);
        debug!("Gas state {state} sent to {}", self.address);
        self.last_sent = Some(state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn sends_only_changed_states() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = std::thread::spawn(move || {
            let mut received = Vec::new();
            for _ in 0..2 {
                let (mut conn, _) = listener.accept().unwrap();
                let mut text = String::new();
                conn.read_to_string(&mut text).unwrap();
                received.push(text);
            }
            received
        });

        let mut sink = TcpGasStateSink::with_timeout(&addr, Duration::from_secs(1)).unwrap();
        sink.send_state(3).unwrap();
        sink.send_state(3).unwrap();
        sink.send_state(12).unwrap();
        assert_eq!(server.join().unwrap(), vec!["3".to_string(), "12".to_string()]);
        assert_eq!(sink.last_sent(), Some(12));
    }

    #[test]
    fn unreachable_controller_is_an_error_and_not_remembered() {
        // Bind then drop to get a port nobody listens on.
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let mut sink = TcpGasStateSink::with_timeout(&addr.to_string(), Duration::from_millis(200)).unwrap();
        assert!(sink.send_state(1).is_err());
        assert_eq!(sink.last_sent(), None);
    }
}
