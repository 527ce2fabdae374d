//! Linux TUN driver
//!
//! Opens `/dev/net/tun` in IFF_TUN | IFF_NO_PI mode, so reads and writes
//! carry bare IP packets. Readiness comes from the tokio reactor through
//! [`AsyncFd`]; addressing and link state go through the `ip` utility.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;
use tokio::process::Command;
use tracing::warn;

use super::{TunDevice, MAX_MTU, MIN_MTU};
use crate::address::Address;
use crate::error::{Error, Result};

// TUNSETIFF = _IOW('T', 202, c_int); PowerPC encodes the write bit differently
#[cfg(any(target_arch = "powerpc", target_arch = "powerpc64"))]
const TUNSETIFF: libc::c_ulong = 0x800454ca;
#[cfg(not(any(target_arch = "powerpc", target_arch = "powerpc64")))]
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// Prefix length routed into the interface: all of fd00::/8
const MESH_PREFIX_LEN: u8 = 8;

#[repr(C)]
struct Ifreq {
    ifr_name: [u8; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// A Linux TUN interface
pub struct LinuxTun {
    fd: AsyncFd<OwnedFd>,
    name: String,
    mtu: usize,
}

impl LinuxTun {
    /// Create the interface `name`. Needs CAP_NET_ADMIN.
    pub fn create(name: &str, mtu: usize) -> Result<Self> {
        if name.is_empty() || name.len() >= libc::IFNAMSIZ {
            return Err(Error::Tun(format!("invalid interface name '{}'", name)));
        }
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(Error::Tun(format!("mtu {} outside {}..={}", mtu, MIN_MTU, MAX_MTU)));
        }

        let raw = unsafe { libc::open(b"/dev/net/tun\0".as_ptr() as *const _, libc::O_RDWR | libc::O_CLOEXEC) };
        if raw < 0 {
            return Err(Error::Tun(format!(
                "failed to open /dev/net/tun: {}",
                std::io::Error::last_os_error()
            )));
        }
        // Closed on drop from here on, including on the error paths below
        let owned = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut req = Ifreq {
            ifr_name: [0u8; libc::IFNAMSIZ],
            ifr_flags: IFF_TUN | IFF_NO_PI,
            _pad: [0u8; 22],
        };
        req.ifr_name[..name.len()].copy_from_slice(name.as_bytes());

        if unsafe { libc::ioctl(owned.as_raw_fd(), TUNSETIFF as _, &mut req as *mut _) } < 0 {
            return Err(Error::Tun(format!(
                "ioctl TUNSETIFF failed for {}: {}",
                name,
                std::io::Error::last_os_error()
            )));
        }

        let flags = unsafe { libc::fcntl(owned.as_raw_fd(), libc::F_GETFL) };
        if flags < 0 || unsafe { libc::fcntl(owned.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(Error::Tun(format!(
                "failed to make {} non-blocking: {}",
                name,
                std::io::Error::last_os_error()
            )));
        }

        let actual_name = std::str::from_utf8(&req.ifr_name)
            .unwrap_or(name)
            .trim_end_matches('\0')
            .to_string();

        Ok(Self {
            fd: AsyncFd::new(owned)?,
            name: actual_name,
            mtu,
        })
    }

    /// Assign `address`/8, set the MTU and bring the link up
    pub async fn configure(&self, address: &Address) -> Result<()> {
        let cidr = format!("{}/{}", address, MESH_PREFIX_LEN);
        run_ip(&["-6", "addr", "add", &cidr, "dev", &self.name]).await?;

        if let Err(e) = run_ip(&["link", "set", "dev", &self.name, "mtu", &self.mtu.to_string()]).await {
            warn!("Failed to set MTU on {}: {}", self.name, e);
        }

        run_ip(&["link", "set", "dev", &self.name, "up"]).await?;
        tracing::info!("Interface {} up with {}", self.name, cidr);
        Ok(())
    }
}

async fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip").args(args).output().await?;
    if !output.status.success() {
        return Err(Error::Tun(format!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[async_trait]
impl TunDevice for LinuxTun {
    async fn read(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        let target = buf
            .get_mut(offset..)
            .ok_or_else(|| Error::Tun(format!("read offset {} past buffer end", offset)))?;
        loop {
            let mut guard = self.fd.readable().await?;
            let res = guard.try_io(|inner| {
                let n = unsafe { libc::read(inner.as_raw_fd(), target.as_mut_ptr() as *mut _, target.len()) };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match res {
                Ok(result) => return Ok(result?),
                Err(_would_block) => continue,
            }
        }
    }

    async fn write(&self, buf: &[u8], offset: usize) -> Result<usize> {
        let packet = buf
            .get(offset..)
            .ok_or_else(|| Error::Tun(format!("write offset {} past buffer end", offset)))?;
        loop {
            let mut guard = self.fd.writable().await?;
            let res = guard.try_io(|inner| {
                let n = unsafe { libc::write(inner.as_raw_fd(), packet.as_ptr() as *const _, packet.len()) };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match res {
                Ok(result) => return Ok(result?),
                Err(_would_block) => continue,
            }
        }
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

    #[test]
    fn test_rejects_bad_names() {
        assert!(matches!(LinuxTun::create("", 1280), Err(Error::Tun(_))));
        assert!(matches!(LinuxTun::create("a-name-that-is-too-long", 1280), Err(Error::Tun(_))));
    }

    #[test]
    fn test_rejects_mtu_larger_than_buffers() {
        assert!(matches!(LinuxTun::create("wm-test0", 9000), Err(Error::Tun(_))));
        assert!(matches!(LinuxTun::create("wm-test0", 576), Err(Error::Tun(_))));
    }
}
