//! NAT rules, managed by shelling out to `iptables`.

use std::process::Output;

use tokio::process::Command;
use tracing::{debug, info};

use super::HostError;
use crate::subnet::Subnet;

const IPTABLES: &str = "iptables";

/// Arguments identifying the masquerade rule for `subnet`, without the operation flag.
pub fn masquerade_rule(subnet: Subnet) -> Vec<String> {
    let source = subnet.trunc().to_string();
    ["POSTROUTING", "-t", "nat", "-s", &source, "-j", "MASQUERADE"]
        .into_iter()
        .map(String::from)
        .collect()
}

async fn iptables(op: &str, rule: &[String]) -> Result<Output, HostError> {
    Ok(Command::new(IPTABLES).arg(op).args(rule).output().await?)
}

/// Insert the masquerade rule for `subnet`, unless it is already present.
///
/// Returns `true` if the rule was inserted.
pub async fn ensure_masquerade(subnet: Subnet) -> Result<bool, HostError> {
    let rule = masquerade_rule(subnet);

    if iptables("-C", &rule).await?.status.success() {
        debug!(%subnet, "Masquerade rule already present");
        return Ok(false);
    }

    let insert = iptables("-I", &rule).await?;
    if !insert.status.success() {
        return Err(HostError::Iptables {
            args: format!("-I {}", rule.join(" ")),
            output: String::from_utf8_lossy(&insert.stderr).trim().to_string(),
        });
    }

    info!(%subnet, "Inserted masquerade rule");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::masquerade_rule;

    #[test]
    fn rule_matches_truncated_subnet() {
        assert_eq!(
            masquerade_rule("192.168.1.7/24".parse().unwrap()).join(" "),
            "POSTROUTING -t nat -s 192.168.1.0/24 -j MASQUERADE"
        );
    }
}
