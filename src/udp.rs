//! UDP datagram [`Transport`] for devices reachable over Wi-Fi (directly or
//! through a relay forwarding the same framed messages).
//!
//! One datagram carries one chunk; the framing inside is identical to BLE,
//! just with a roomier MTU. There is no link to keep alive at this layer, so
//! "open" means the socket is bound and connected and the receive task runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::Transport;
use crate::error::TransportError;

/// Fixed datagram budget: comfortably under every common path MTU, far above
/// the BLE default.
pub const UDP_MTU: usize = 512;

/// One UDP "connection" to a device address.
pub struct UdpTransport {
    remote: String,
    socket: Option<Arc<UdpSocket>>,
    open: Arc<AtomicBool>,
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    recv_task: Option<JoinHandle<()>>,
}

impl UdpTransport {
    /// `remote` is the device's `host:port`.
    pub fn new(remote: impl Into<String>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            remote: remote.into(),
            socket: None,
            open: Arc::new(AtomicBool::new(false)),
            inbound_tx,
            inbound_rx: Some(inbound_rx),
            recv_task: None,
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(self.remote.as_str()).await?;
        info!("UDP transport bound to {}", self.remote);
        let socket = Arc::new(socket);

        let inbound = self.inbound_tx.clone();
        let open = self.open.clone();
        let recv_socket = socket.clone();
        self.recv_task = Some(tokio::spawn(async move {
            let mut buffer = vec![0u8; UDP_MTU];
            loop {
                match recv_socket.recv(&mut buffer).await {
                    Ok(len) => {
                        if inbound.send(buffer[..len].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("UDP receive failed: {e}");
                        break;
                    }
                }
            }
            open.store(false, Ordering::SeqCst);
        }));

        self.socket = Some(socket);
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
        self.socket = None;
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotOpen)?;
        socket.send(chunk).await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn mtu(&self) -> usize {
        UDP_MTU
    }

    fn supports_reconnect(&self) -> bool {
        true
    }

    fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.inbound_rx.take()
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_through_a_local_socket() {
        // A plain socket stands in for the device end.
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device_addr = device.local_addr().unwrap();

        let mut transport = UdpTransport::new(device_addr.to_string());
        let mut inbound = transport.take_inbound().unwrap();
        transport.open().await.unwrap();
        assert!(transport.is_open());

        transport.write(&[1, 2, 3]).await.unwrap();
        let mut buffer = [0u8; 16];
        let (len, from) = device.recv_from(&mut buffer).await.unwrap();
        assert_eq!(&buffer[..len], &[1, 2, 3]);

        device.send_to(&[9, 8], from).await.unwrap();
        assert_eq!(inbound.recv().await.unwrap(), vec![9, 8]);

        transport.close().await.unwrap();
        assert!(!transport.is_open());
    }
}
