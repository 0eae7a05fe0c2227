//! Per-VM address blocks and CNI network configuration.
//!
//! Every micro-VM gets its own `/29` out of the configured range (the ignite
//! default `10.61.0.0/16`), its own bridge, and optional bandwidth shaping so
//! no single job can saturate the host link.

use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use crate::config::ResourceLimits;
use crate::error::{SandboxError, SandboxResult};

pub const BLOCK_PREFIX: u8 = 29;
const BLOCK_SIZE: u32 = 1 << (32 - BLOCK_PREFIX as u32);
const CNI_VERSION: &str = "0.4.0";

/// Parse `a.b.c.d/n` into the masked network address and prefix length.
pub fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8), String> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| format!("Invalid CIDR (missing prefix): {}", cidr))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|e| format!("Invalid CIDR address {}: {}", cidr, e))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|e| format!("Invalid CIDR prefix {}: {}", cidr, e))?;
    if prefix > BLOCK_PREFIX {
        return Err(format!(
            "CIDR {} is smaller than a /{} block",
            cidr, BLOCK_PREFIX
        ));
    }
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    };
    Ok((Ipv4Addr::from(u32::from(addr) & mask), prefix))
}

/// One allocated `/29`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetLease {
    pub index: u32,
    pub network: Ipv4Addr,
}

impl SubnetLease {
    fn offset(&self, n: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + n)
    }

    pub fn cidr(&self) -> String {
        format!("{}/{}", self.network, BLOCK_PREFIX)
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.offset(1)
    }

    pub fn range_start(&self) -> Ipv4Addr {
        self.offset(2)
    }

    /// Last usable host; the final address is broadcast.
    pub fn range_end(&self) -> Ipv4Addr {
        self.offset(BLOCK_SIZE - 2)
    }

    /// Linux interface names are limited to 15 bytes.
    pub fn bridge_name(&self) -> String {
        format!("aix{}", self.index)
    }
}

/// Hands out non-overlapping `/29` blocks from a larger range.
#[derive(Debug)]
pub struct SubnetAllocator {
    base: u32,
    blocks: u32,
    cidr: String,
    in_use: Mutex<BTreeSet<u32>>,
}

impl SubnetAllocator {
    pub fn new(cidr: &str) -> Result<Self, String> {
        let (network, prefix) = parse_cidr(cidr)?;
        Ok(Self {
            base: u32::from(network),
            blocks: 1 << (BLOCK_PREFIX - prefix) as u32,
            cidr: cidr.to_string(),
            in_use: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.blocks
    }

    /// Lowest free block.
    pub fn allocate(&self) -> SandboxResult<SubnetLease> {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        let index = (0..self.blocks)
            .find(|idx| !in_use.contains(idx))
            .ok_or_else(|| SandboxError::NetworkExhausted(self.cidr.clone()))?;
        in_use.insert(index);
        Ok(SubnetLease {
            index,
            network: Ipv4Addr::from(self.base + index * BLOCK_SIZE),
        })
    }

    /// Like [`allocate`](Self::allocate), but the block goes back when the
    /// guard is dropped unless [`LeaseGuard::keep`] was called.
    pub fn allocate_guarded(&self) -> SandboxResult<LeaseGuard<'_>> {
        let lease = self.allocate()?;
        Ok(LeaseGuard {
            allocator: self,
            lease,
            kept: false,
        })
    }

    pub fn release(&self, lease: &SubnetLease) {
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());
        in_use.remove(&lease.index);
    }

    pub fn in_use(&self) -> usize {
        self.in_use.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Lease held while a VM starts; a provision abandoned midway frees its block.
pub struct LeaseGuard<'a> {
    allocator: &'a SubnetAllocator,
    lease: SubnetLease,
    kept: bool,
}

impl LeaseGuard<'_> {
    pub fn lease(&self) -> &SubnetLease {
        &self.lease
    }

    pub fn keep(mut self) -> SubnetLease {
        self.kept = true;
        self.lease.clone()
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if !self.kept {
            self.allocator.release(&self.lease);
        }
    }
}

/// CNI plugin chain for one VM: bridge with host-local IPAM confined to the
/// lease, port mapping (needed by ignite), firewall, isolation from other
/// bridges, and bandwidth limits when configured.
pub fn cni_conflist(name: &str, lease: &SubnetLease, limits: &ResourceLimits) -> Value {
    let mut plugins = vec![
        json!({
            "type": "bridge",
            "bridge": lease.bridge_name(),
            "isGateway": true,
            "isDefaultGateway": true,
            "promiscMode": false,
            "ipMasq": true,
            "ipam": {
                "type": "host-local",
                "subnet": lease.cidr(),
                "rangeStart": lease.range_start().to_string(),
                "rangeEnd": lease.range_end().to_string(),
                "gateway": lease.gateway().to_string(),
            },
        }),
        json!({ "type": "portmap", "capabilities": { "portMappings": true } }),
        json!({ "type": "firewall" }),
        json!({ "type": "isolation" }),
    ];

    if limits.bandwidth_ingress_bps > 0 || limits.bandwidth_egress_bps > 0 {
        let mut bandwidth = json!({ "type": "bandwidth" });
        if limits.bandwidth_ingress_bps > 0 {
            bandwidth["ingressRate"] = json!(limits.bandwidth_ingress_bps);
            bandwidth["ingressBurst"] = json!(limits.bandwidth_ingress_bps);
        }
        if limits.bandwidth_egress_bps > 0 {
            bandwidth["egressRate"] = json!(limits.bandwidth_egress_bps);
            bandwidth["egressBurst"] = json!(limits.bandwidth_egress_bps);
        }
        plugins.push(bandwidth);
    }

    json!({
        "cniVersion": CNI_VERSION,
        "name": name,
        "plugins": plugins,
    })
}
