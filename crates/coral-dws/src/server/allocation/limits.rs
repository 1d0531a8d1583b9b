use crate::k8s::objects::AllocationStrategy;
use crate::server::allocation::PlanError;

/// Storage labels that may appear in an allocation set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageLabel {
    Xfs,
    Gfs2,
    Raw,
    Ost,
    Mdt,
    Mgt,
    MgtMdt,
}

impl StorageLabel {
    pub fn parse(label: &str) -> Result<Self, PlanError> {
        Ok(match label {
            "xfs" => StorageLabel::Xfs,
            "gfs2" => StorageLabel::Gfs2,
            "raw" => StorageLabel::Raw,
            "ost" => StorageLabel::Ost,
            "mdt" => StorageLabel::Mdt,
            "mgt" => StorageLabel::Mgt,
            "mgtmdt" => StorageLabel::MgtMdt,
            label => return Err(PlanError::UnknownLabel(label.to_string())),
        })
    }

    /// File systems that live on storage local to each compute node.
    pub fn is_per_compute(&self) -> bool {
        matches!(
            self,
            StorageLabel::Xfs | StorageLabel::Gfs2 | StorageLabel::Raw
        )
    }

    pub fn expected_strategy(&self) -> AllocationStrategy {
        match self {
            StorageLabel::Xfs | StorageLabel::Gfs2 | StorageLabel::Raw => {
                AllocationStrategy::PerCompute
            }
            StorageLabel::Ost | StorageLabel::Mdt | StorageLabel::MgtMdt => {
                AllocationStrategy::AcrossServers
            }
            StorageLabel::Mgt => AllocationStrategy::SingleServer,
        }
    }
}

/// Configured capacity ceilings, in GiB per compute node. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceLimits {
    pub xfs: Option<u64>,
    pub gfs2: Option<u64>,
    pub lustre: Option<u64>,
    pub raw: Option<u64>,
}

impl ResourceLimits {
    pub const TYPES: [&'static str; 4] = ["xfs", "gfs2", "raw", "lustre"];

    /// Reads the `rabbit.policy.maximums` table.
    pub fn from_table(table: &toml::Table) -> crate::Result<Self> {
        let mut limits = ResourceLimits::default();
        for (key, value) in table {
            let slot = match key.as_str() {
                "xfs" => &mut limits.xfs,
                "gfs2" => &mut limits.gfs2,
                "lustre" => &mut limits.lustre,
                "raw" => &mut limits.raw,
                key => {
                    log::warn!(
                        "misconfiguration: unrecognized `rabbit.policy.maximums.{key}` key, accepted keys are {:?}",
                        Self::TYPES
                    );
                    continue;
                }
            };
            let maximum = value
                .as_integer()
                .and_then(|v| u64::try_from(v).ok())
                .ok_or_else(|| {
                    crate::Error::ConfigError(format!(
                        "`rabbit.policy.maximums.{key}` must be a non-negative integer"
                    ))
                })?;
            *slot = Some(maximum);
        }
        Ok(limits)
    }
}

/// Capacity requested by one job, in GiB, accumulated over its allocation sets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestedCapacity {
    xfs: u64,
    gfs2: u64,
    lustre: u64,
    raw: u64,
}

impl RequestedCapacity {
    pub fn increment(&mut self, label: StorageLabel, capacity_gib: u64) {
        match label {
            StorageLabel::Xfs => self.xfs += capacity_gib,
            StorageLabel::Gfs2 => self.gfs2 += capacity_gib,
            StorageLabel::Raw => self.raw += capacity_gib,
            // Metadata targets are small, only OSTs count against the lustre ceiling
            StorageLabel::Ost => self.lustre += capacity_gib,
            StorageLabel::Mdt | StorageLabel::Mgt | StorageLabel::MgtMdt => {}
        }
    }

    /// Fails if the per-node share of some bucket is above its ceiling. Node-local file
    /// systems are already requested per node, lustre is shared by all nodes of the job.
    pub fn validate(&self, limits: &ResourceLimits, node_count: u64) -> Result<(), PlanError> {
        let buckets = [
            ("xfs", self.xfs, limits.xfs),
            ("gfs2", self.gfs2, limits.gfs2),
            ("raw", self.raw, limits.raw),
            ("lustre", self.lustre / node_count.max(1), limits.lustre),
        ];
        for (bucket, requested, allowable) in buckets {
            if let Some(allowable) = allowable {
                if requested > allowable {
                    return Err(PlanError::LimitExceeded {
                        requested,
                        bucket,
                        allowable,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{RequestedCapacity, ResourceLimits, StorageLabel};
    use crate::server::allocation::PlanError;

    fn limits(xfs: Option<u64>, lustre: Option<u64>) -> ResourceLimits {
        ResourceLimits {
            xfs,
            lustre,
            ..Default::default()
        }
    }

    fn assert_exceeds(result: Result<(), PlanError>, max: u64) {
        match result {
            Err(PlanError::LimitExceeded { allowable, .. }) => assert_eq!(allowable, max),
            other => panic!("expected limit error, got {other:?}"),
        }
    }

    #[test]
    fn lustre_is_shared_by_nodes() {
        let limits = limits(None, Some(100));
        let mut requested = RequestedCapacity::default();
        requested.increment(StorageLabel::Mdt, 200);
        requested.increment(StorageLabel::Xfs, 200);
        requested.validate(&limits, 1).unwrap();
        requested.increment(StorageLabel::Ost, 200);
        assert_exceeds(requested.validate(&limits, 1), 100);
        requested.validate(&limits, 3).unwrap();
        requested.increment(StorageLabel::Ost, 200);
        assert_exceeds(requested.validate(&limits, 3), 100);
    }

    #[test]
    fn xfs_is_per_node() {
        let limits = limits(Some(50), None);
        let mut requested = RequestedCapacity::default();
        requested.increment(StorageLabel::Ost, 200);
        requested.increment(StorageLabel::Gfs2, 200);
        requested.validate(&limits, 1).unwrap();
        requested.increment(StorageLabel::Xfs, 51);
        assert_exceeds(requested.validate(&limits, 1), 50);
        assert_exceeds(requested.validate(&limits, 500), 50);
    }

    #[test]
    fn combined_limits() {
        let limits = limits(Some(400), Some(300));
        let mut requested = RequestedCapacity::default();
        requested.increment(StorageLabel::Mdt, 200);
        requested.increment(StorageLabel::Xfs, 200);
        requested.increment(StorageLabel::Ost, 200);
        requested.validate(&limits, 1).unwrap();
        requested.increment(StorageLabel::Ost, 200);
        assert_exceeds(requested.validate(&limits, 1), 300);
        requested.validate(&limits, 3).unwrap();
        requested.increment(StorageLabel::Ost, 600);
        assert_exceeds(requested.validate(&limits, 3), 300);
        requested.increment(StorageLabel::Xfs, 600);
        assert_exceeds(requested.validate(&limits, 500), 400);
    }

    #[test]
    fn equal_to_ceiling_is_allowed() {
        let limits = limits(Some(10), None);
        let mut requested = RequestedCapacity::default();
        requested.increment(StorageLabel::Xfs, 10);
        requested.validate(&limits, 1).unwrap();
    }

    #[test]
    fn unknown_label() {
        assert_eq!(
            StorageLabel::parse("foo"),
            Err(PlanError::UnknownLabel("foo".into()))
        );
    }

    #[test]
    fn limits_from_table() {
        let table: toml::Table = toml::from_str("xfs = 1\nlustre = 2\nzfs = 3").unwrap();
        let limits = ResourceLimits::from_table(&table).unwrap();
        assert_eq!(limits.xfs, Some(1));
        assert_eq!(limits.lustre, Some(2));
        assert_eq!(limits.raw, None);
    }
}
