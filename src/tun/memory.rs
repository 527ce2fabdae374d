//! In-memory tunnel device for tests and simulations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::TunDevice;
use crate::error::{Error, Result};

/// Tunnel device fed and drained through a [`MemoryTunHandle`]
pub struct MemoryTun {
    name: String,
    mtu: usize,
    incoming: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    written: mpsc::UnboundedSender<Vec<u8>>,
    short_writes: Arc<AtomicBool>,
}

/// The "host side" of a [`MemoryTun`]
pub struct MemoryTunHandle {
    inject: mpsc::UnboundedSender<Vec<u8>>,
    written: mpsc::UnboundedReceiver<Vec<u8>>,
    short_writes: Arc<AtomicBool>,
}

impl MemoryTun {
    pub fn new(name: &str, mtu: usize) -> (Self, MemoryTunHandle) {
        let (inject, incoming) = mpsc::unbounded_channel();
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        let short_writes = Arc::new(AtomicBool::new(false));
        let tun = Self {
            name: name.to_string(),
            mtu,
            incoming: Mutex::new(incoming),
            written: written_tx,
            short_writes: Arc::clone(&short_writes),
        };
        let handle = MemoryTunHandle {
            inject,
            written: written_rx,
            short_writes,
        };
        (tun, handle)
    }
}

impl MemoryTunHandle {
    /// Queue a packet for the device to return from `read`
    pub fn inject(&self, packet: Vec<u8>) {
        let _ = self.inject.send(packet);
    }

    /// Next packet written to the device
    pub async fn next_written(&mut self) -> Option<Vec<u8>> {
        self.written.recv().await
    }

    /// Make every following write report one byte less than it was given
    pub fn set_short_writes(&self, enabled: bool) {
        self.short_writes.store(enabled, Ordering::Relaxed);
    }
}

#[async_trait]
impl TunDevice for MemoryTun {
    async fn read(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        let packet = self
            .incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::Tun(format!("{} closed", self.name)))?;
        let target = buf
            .get_mut(offset..offset + packet.len())
            .ok_or_else(|| Error::Tun(format!("{} byte packet does not fit read buffer", packet.len())))?;
        target.copy_from_slice(&packet);
        Ok(packet.len())
    }

    async fn write(&self, buf: &[u8], offset: usize) -> Result<usize> {
        let packet = buf
            .get(offset..)
            .ok_or_else(|| Error::Tun(format!("write offset {} past buffer end", offset)))?;
        self.written
            .send(packet.to_vec())
            .map_err(|_| Error::Tun(format!("{} closed", self.name)))?;
        if self.short_writes.load(Ordering::Relaxed) {
            return Ok(packet.len().saturating_sub(1));
        }
        Ok(packet.len())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_honours_offset() {
        let (tun, handle) = MemoryTun::new("mem0", 1280);
        handle.inject(vec![1, 2, 3]);

        let mut buf = [0xAAu8; 8];
        let n = tun.read(&mut buf, 4).await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(buf, [0xAA, 0xAA, 0xAA, 0xAA, 1, 2, 3, 0xAA]);
    }

    #[tokio::test]
    async fn test_write_is_captured() {
        let (tun, mut handle) = MemoryTun::new("mem0", 1280);
        let n = tun.write(&[0, 0, 0, 0, 9, 8], 4).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(handle.next_written().await, Some(vec![9, 8]));
    }

    #[tokio::test]
    async fn test_read_fails_when_handle_dropped() {
        let (tun, handle) = MemoryTun::new("mem0", 1280);
        drop(handle);
        let mut buf = [0u8; 8];
        assert!(tun.read(&mut buf, 0).await.is_err());
    }
}
