//! Receive queues shared by the transport implementations.
//!
//! Both queues are bounded and never apply backpressure: a full queue
//! drops the packet.

use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::PublicKey;
use crate::error::{Error, Result};

type Delivered = (Bytes, PublicKey);
type Undeliverable = (Bytes, PublicKey, PublicKey);

pub(crate) struct Inbox {
    delivered_tx: Mutex<Option<mpsc::Sender<Delivered>>>,
    delivered_rx: tokio::sync::Mutex<mpsc::Receiver<Delivered>>,
    undeliverable_tx: Mutex<Option<mpsc::Sender<Undeliverable>>>,
    undeliverable_rx: tokio::sync::Mutex<mpsc::Receiver<Undeliverable>>,
}

impl Inbox {
    pub(crate) fn new(depth: usize) -> Self {
        let (delivered_tx, delivered_rx) = mpsc::channel(depth.max(1));
        let (undeliverable_tx, undeliverable_rx) = mpsc::channel(depth.max(1));
        Self {
            delivered_tx: Mutex::new(Some(delivered_tx)),
            delivered_rx: tokio::sync::Mutex::new(delivered_rx),
            undeliverable_tx: Mutex::new(Some(undeliverable_tx)),
            undeliverable_rx: tokio::sync::Mutex::new(undeliverable_rx),
        }
    }

    /// Queue a packet addressed to our exact key. Returns false if dropped.
    pub(crate) fn push_delivered(&self, packet: Bytes, remote: PublicKey) -> bool {
        let guard = self.delivered_tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.try_send((packet, remote)).is_ok(),
            None => false,
        }
    }

    /// Queue a misaddressed packet. Returns false if dropped.
    pub(crate) fn push_undeliverable(&self, packet: Bytes, local: PublicKey, remote: PublicKey) -> bool {
        let guard = self.undeliverable_tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.try_send((packet, local, remote)).is_ok(),
            None => false,
        }
    }

    pub(crate) async fn recv_delivered(&self, buf: &mut [u8]) -> Result<(usize, PublicKey)> {
        let mut rx = self.delivered_rx.lock().await;
        loop {
            let (packet, remote) = rx.recv().await.ok_or(Error::MeshClosed)?;
            if let Some(n) = copy_into(buf, &packet) {
                return Ok((n, remote));
            }
        }
    }

    pub(crate) async fn recv_undeliverable(&self, buf: &mut [u8]) -> Result<(usize, PublicKey, PublicKey)> {
        let mut rx = self.undeliverable_rx.lock().await;
        loop {
            let (packet, local, remote) = rx.recv().await.ok_or(Error::MeshClosed)?;
            if let Some(n) = copy_into(buf, &packet) {
                return Ok((n, local, remote));
            }
        }
    }

    /// Drop the senders so blocked receivers wake up with `MeshClosed`
    pub(crate) fn close(&self) {
        self.delivered_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.undeliverable_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

fn copy_into(buf: &mut [u8], packet: &[u8]) -> Option<usize> {
    if packet.len() > buf.len() {
        tracing::debug!(
            "Dropping {} byte packet, receive buffer holds {}",
            packet.len(),
            buf.len()
        );
        return None;
    }
    buf[..packet.len()].copy_from_slice(packet);
    Some(packet.len())
}
