use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

/// A logical sender: a specific source IP together with the identity it
/// presents in HELO and its per-destination connection policy.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct VirtualMta {
    /// Friendly name for reporting
    pub name: String,

    /// Bind this local address prior to issuing the connect(2) syscall
    pub source_address: IpAddr,

    /// Hostname announced in HELO
    pub ehlo_hostname: String,

    /// Override the pool's default per-destination connection cap
    #[serde(default)]
    pub max_connections: Option<usize>,
}

/// A non-empty ordered set of virtual MTAs sharing a group id. Selection
/// is round-robin per destination host so that each destination sees the
/// group's sources in fair rotation.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct VirtualMtaGroup {
    pub id: String,
    pub entries: Vec<VirtualMta>,
}

pub struct VirtualMtaSelector {
    groups: HashMap<String, VirtualMtaGroup>,
    /// Round-robin cursor per "group->destination"
    cursors: DashMap<String, usize>,
}

impl VirtualMtaSelector {
    pub fn new(groups: Vec<VirtualMtaGroup>) -> anyhow::Result<Self> {
        let mut by_id = HashMap::new();
        for group in groups {
            anyhow::ensure!(
                !group.entries.is_empty(),
                "virtual MTA group {} has no entries",
                group.id
            );
            anyhow::ensure!(
                by_id.insert(group.id.clone(), group).is_none(),
                "duplicate virtual MTA group id"
            );
        }
        Ok(Self {
            groups: by_id,
            cursors: DashMap::new(),
        })
    }

    pub fn group(&self, id: &str) -> Option<&VirtualMtaGroup> {
        self.groups.get(id)
    }

    /// Pick the source to use for the given destination host, advancing
    /// that destination's rotation through the group.
    pub fn vmta_for_sending<'a>(
        &self,
        group: &'a VirtualMtaGroup,
        mx_host: &str,
    ) -> &'a VirtualMta {
        if group.entries.len() == 1 {
            return &group.entries[0];
        }
        let key = format!("{}->{mx_host}", group.id);
        let mut cursor = self.cursors.entry(key).or_insert(0);
        let index = *cursor % group.entries.len();
        *cursor += 1;
        &group.entries[index]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn group(id: &str, count: usize) -> VirtualMtaGroup {
        VirtualMtaGroup {
            id: id.to_string(),
            entries: (0..count)
                .map(|i| VirtualMta {
                    name: format!("source-{i}"),
                    source_address: format!("10.0.0.{}", i + 1).parse().unwrap(),
                    ehlo_hostname: format!("mta{i}.sender.example.com"),
                    max_connections: None,
                })
                .collect(),
        }
    }

    #[test]
    fn rejects_empty_groups() {
        assert!(VirtualMtaSelector::new(vec![group("empty", 0)]).is_err());
    }

    #[test]
    fn round_robin_is_fair_per_destination() {
        let selector = VirtualMtaSelector::new(vec![group("default", 3)]).unwrap();
        let group = selector.group("default").unwrap();

        let mut counts = HashMap::new();
        for _ in 0..99 {
            let vmta = selector.vmta_for_sending(group, "mx1.example.com");
            *counts.entry(vmta.name.clone()).or_insert(0) += 1;
        }
        // Each source carries an equal share of one destination's traffic
        k9::assert_equal!(counts["source-0"], 33);
        k9::assert_equal!(counts["source-1"], 33);
        k9::assert_equal!(counts["source-2"], 33);
    }

    #[test]
    fn destinations_rotate_independently() {
        let selector = VirtualMtaSelector::new(vec![group("default", 2)]).unwrap();
        let group = selector.group("default").unwrap();

        let first_a = selector.vmta_for_sending(group, "mx.a.example.com").name.clone();
        let first_b = selector.vmta_for_sending(group, "mx.b.example.com").name.clone();
        // A fresh destination starts at the head of the rotation
        // regardless of what other destinations have consumed
        k9::assert_equal!(first_a, first_b);

        let second_a = selector.vmta_for_sending(group, "mx.a.example.com").name.clone();
        assert_ne!(first_a, second_a);
    }
}
