//! Per-VM IP/tap/MAC allocation and the host-side bridge/tap plumbing. One
//! process-local atomic counter drives the whole scheme, the way the
//! orchestrator's request ids and the managed provider's usage counters are
//! process-local atomics (spec.md §9 "Global state").
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use tokio::process::Command;

/// `ip = 172.16.((k/254)%254+1).(k%254+2)`, gateway `172.16.X.1`, tap
/// `fctap-k`. Unique within a /16 as long as `k` only ever comes from this
/// counter — no collision checks are performed, matching spec.md §4.2.
pub struct IpAllocator {
    counter: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct VmNetwork {
    pub k: u64,
    pub ip: String,
    pub gateway: String,
    pub tap: String,
    pub mac: String,
}

impl Default for IpAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IpAllocator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    pub fn allocate(&self) -> VmNetwork {
        let k = self.counter.fetch_add(1, Ordering::SeqCst);
        let third = (k / 254) % 254 + 1;
        let fourth = k % 254 + 2;
        VmNetwork {
            k,
            ip: format!("172.16.{third}.{fourth}"),
            gateway: format!("172.16.{third}.1"),
            tap: format!("fctap-{k}"),
            mac: mac_from_counter(k),
        }
    }
}

fn mac_from_counter(k: u64) -> String {
    let bytes = k.to_be_bytes();
    format!(
        "02:FC:{:02X}:{:02X}:{:02X}:{:02X}",
        bytes[4], bytes[5], bytes[6], bytes[7]
    )
}

/// Brings up a tap device on `bridge` and assigns the host-side gateway
/// address. Best-effort NAT/forwarding rules are installed separately since
/// the spec marks them non-fatal if missing.
pub async fn create_tap(tap: &str, bridge: &str, gateway: &str) -> Result<()> {
    ensure_bridge(bridge, gateway).await?;

    let exists = Command::new("ip")
        .args(["link", "show", tap])
        .output()
        .await
        .context("checking for existing tap device")?;
    if exists.status.success() {
        let _ = Command::new("ip").args(["link", "del", tap]).status().await;
    }

    run("ip", &["tuntap", "add", "dev", tap, "mode", "tap"]).await?;
    run("ip", &["link", "set", tap, "master", bridge]).await?;
    run("ip", &["link", "set", tap, "up"]).await?;
    Ok(())
}

async fn ensure_bridge(bridge: &str, gateway: &str) -> Result<()> {
    let exists = Command::new("ip")
        .args(["link", "show", bridge])
        .output()
        .await
        .context("checking for existing bridge")?;
    if !exists.status.success() {
        run("ip", &["link", "add", bridge, "type", "bridge"]).await?;
        run("ip", &["addr", "add", &format!("{gateway}/24"), "dev", bridge]).await?;
    }
    run("ip", &["link", "set", bridge, "up"]).await?;
    Ok(())
}

/// NAT masquerade + forwarding so guest traffic reaches the host's uplink.
/// Best-effort per spec.md §4.2 — failures here never abort VM setup.
pub async fn install_nat_rules(bridge: &str) {
    let _ = Command::new("sysctl")
        .args(["-w", "net.ipv4.ip_forward=1"])
        .status()
        .await;
    let _ = Command::new("iptables")
        .args(["-t", "nat", "-A", "POSTROUTING", "-s", "172.16.0.0/16", "!", "-o", bridge, "-j", "MASQUERADE"])
        .status()
        .await;
}

pub async fn delete_tap(tap: &str) -> Result<()> {
    let output = Command::new("ip")
        .args(["link", "del", tap])
        .output()
        .await
        .context("deleting tap device")?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("Cannot find device") {
        return Ok(());
    }
    anyhow::bail!("failed to delete tap {tap}: {stderr}")
}

async fn run(program: &str, args: &[&str]) -> Result<()> {
    let status = Command::new(program)
        .args(args)
        .status()
        .await
        .with_context(|| format!("spawning {program} {args:?}"))?;
    if !status.success() {
        anyhow::bail!("{program} {args:?} exited with {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_unique_and_follow_the_formula() {
        let allocator = IpAllocator::new();
        let a = allocator.allocate();
        let b = allocator.allocate();
        assert_eq!(a.k, 0);
        assert_eq!(a.ip, "172.16.1.2");
        assert_eq!(a.gateway, "172.16.1.1");
        assert_eq!(a.tap, "fctap-0");
        assert_eq!(b.k, 1);
        assert_ne!(a.ip, b.ip);
        assert_ne!(a.mac, b.mac);
    }

    #[test]
    fn wraps_the_third_octet_every_254_allocations() {
        let allocator = IpAllocator::new();
        for _ in 0..254 {
            allocator.allocate();
        }
        let after_wrap = allocator.allocate();
        assert_eq!(after_wrap.k, 254);
        assert_eq!(after_wrap.ip, "172.16.2.2");
    }
}
