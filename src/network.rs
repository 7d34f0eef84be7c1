//! User-mode networking through the external pasta helper
//!
//! The Supervisor points pasta at the Payload's pid; pasta joins the child's
//! network namespace and wires up a tap device with a slirp-style subnet.
//! Only the DNS address is consumed inside the container (for resolv.conf);
//! the rest is carried for completeness.

use eyre::{bail, eyre, Context, Result};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::process::Command;

const SUBNET_BASE: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 0);
const NETMASK_BITS: u32 = 24;
const MTU: u32 = 65520;
const IFNAME: &str = "tap0";

/// Network parameters handed to the Payload, all string-encoded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetParams {
    pub dev: String,
    pub address: String,
    pub netmask: String,
    pub gateway: String,
    pub dns: String,
    pub mtu: String,
}

/// Configure networking for the child and return the parameters pasta set up.
pub fn configure(child_pid: Pid) -> Result<NetParams> {
    let address = offset_ip(SUBNET_BASE, 100)?;
    let gateway = offset_ip(SUBNET_BASE, 2)?;
    let dns = offset_ip(SUBNET_BASE, 3)?;

    let args = pasta_args(&address, &gateway, &dns, child_pid);
    log::debug!("Invoking pasta with {:?}", args);

    let output = Command::new("pasta")
        .args(&args)
        .output()
        .wrap_err("spawning pasta (is passt installed?)")?;

    if !output.status.success() {
        bail!(
            "pasta exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(NetParams {
        dev: IFNAME.to_string(),
        address: address.to_string(),
        netmask: NETMASK_BITS.to_string(),
        gateway: gateway.to_string(),
        dns: dns.to_string(),
        mtu: MTU.to_string(),
    })
}

fn pasta_args(address: &Ipv4Addr, gateway: &Ipv4Addr, dns: &Ipv4Addr, pid: Pid) -> Vec<String> {
    vec![
        "--stderr".to_string(),
        format!("--ns-ifname={}", IFNAME),
        format!("--mtu={}", MTU),
        "--config-net".to_string(),
        format!("--address={}", address),
        format!("--netmask={}", NETMASK_BITS),
        format!("--gateway={}", gateway),
        format!("--dns-forward={}", dns),
        "--tcp-ports=none".to_string(),
        "--udp-ports=none".to_string(),
        "--host-lo-to-ns-lo".to_string(),
        pid.to_string(),
    ]
}

/// Add an offset to an IPv4 address, rejecting overflow past 255.255.255.255.
fn offset_ip(ip: Ipv4Addr, offset: u32) -> Result<Ipv4Addr> {
    let base = u32::from(ip);
    let result = base
        .checked_add(offset)
        .ok_or_else(|| eyre!("{} + {} overflows the IPv4 space", ip, offset))?;
    Ok(Ipv4Addr::from(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_ip_within_subnet() -> Result<()> {
        assert_eq!(offset_ip(SUBNET_BASE, 100)?, Ipv4Addr::new(10, 0, 2, 100));
        assert_eq!(offset_ip(SUBNET_BASE, 2)?, Ipv4Addr::new(10, 0, 2, 2));
        assert_eq!(offset_ip(SUBNET_BASE, 3)?, Ipv4Addr::new(10, 0, 2, 3));
        Ok(())
    }

    #[test]
    fn test_offset_ip_carries_across_octets() -> Result<()> {
        assert_eq!(offset_ip(SUBNET_BASE, 300)?, Ipv4Addr::new(10, 0, 3, 44));
        Ok(())
    }

    #[test]
    fn test_offset_ip_rejects_overflow() {
        assert!(offset_ip(Ipv4Addr::new(255, 255, 255, 255), 1).is_err());
    }

    #[test]
    fn test_pasta_args_pid_is_last() {
        let args = pasta_args(
            &Ipv4Addr::new(10, 0, 2, 100),
            &Ipv4Addr::new(10, 0, 2, 2),
            &Ipv4Addr::new(10, 0, 2, 3),
            Pid::from_raw(4242),
        );

        assert_eq!(args.last().unwrap(), "4242");
        assert!(args.contains(&"--config-net".to_string()));
        assert!(args.contains(&"--address=10.0.2.100".to_string()));
        assert!(args.contains(&"--dns-forward=10.0.2.3".to_string()));
    }

    #[test]
    fn test_net_params_serialization() -> Result<()> {
        let params = NetParams {
            dev: "tap0".to_string(),
            address: "10.0.2.100".to_string(),
            netmask: "24".to_string(),
            gateway: "10.0.2.2".to_string(),
            dns: "10.0.2.3".to_string(),
            mtu: "65520".to_string(),
        };

        let encoded = serde_json::to_string(&params)?;
        let decoded: NetParams = serde_json::from_str(&encoded)?;
        assert_eq!(decoded.dns, "10.0.2.3");
        Ok(())
    }
}
