use serde::{Deserialize, Serialize};

/// Settings of a [`Coordinator`](crate::Coordinator).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Upper bound on simultaneously open connections, over all processes.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Affinity mask of new processes. Defaults to all host CPUs (at most 64).
    #[serde(default)]
    pub affinity_mask: Option<u64>,
}

fn default_max_connections() -> u32 {
    1024
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            affinity_mask: None,
        }
    }
}

impl CoordinatorConfig {
    /// The affinity mask processes start with.
    pub fn process_affinity(&self) -> u64 {
        if let Some(mask) = self.affinity_mask {
            return mask;
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(64);
        if cpus == 64 {
            u64::MAX
        } else {
            (1u64 << cpus) - 1
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: CoordinatorConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.max_connections, 1024);
        assert_eq!(config.affinity_mask, None);
        let mask = config.process_affinity();
        assert_ne!(mask, 0);
        assert_eq!(mask & 1, 1);
    }

    #[test]
    fn test_explicit_mask() {
        let config: CoordinatorConfig =
            serde_yaml::from_str("max_connections: 8\naffinity_mask: 5").unwrap();
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.process_affinity(), 0b101);
    }

    #[test]
    fn test_unknown_field() {
        assert!(serde_yaml::from_str::<CoordinatorConfig>("max_threads: 8").is_err());
    }
}
