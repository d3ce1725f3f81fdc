//! The module containing the memory tier model.

use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// One of the two memory tiers of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Fast volatile memory.
    Dram,
    /// Slow persistent memory.
    Nvram,
}

impl Tier {
    /// The tier pages migrate to when they leave this one.
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Dram => Self::Nvram,
            Self::Nvram => Self::Dram,
        }
    }
}

/// Errors raised while loading a tier layout file.
#[derive(Debug, thiserror::Error)]
pub enum TierLayoutError {
    /// The file could not be read.
    #[error("cannot read tier layout: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not valid JSON for the layout shape.
    #[error("cannot parse tier layout: {0}")]
    Parse(#[from] serde_json::Error),
    /// A tier has no nodes.
    #[error("tier {0:?} has no nodes")]
    EmptyTier(Tier),
    /// The same node appears in both tiers.
    #[error("node {0} is listed in both tiers")]
    Overlap(u32),
}

/// The static ordered NUMA node lists backing each tier. The two lists are
/// disjoint; destination nodes are filled in list order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TierLayout {
    dram: Vec<u32>,
    nvram: Vec<u32>,
}

impl Default for TierLayout {
    fn default() -> Self {
        Self {
            dram: vec![0, 1],
            nvram: vec![2, 3],
        }
    }
}

impl TierLayout {
    /// Loads a layout override from a JSON file such as
    /// `{"dram": [0, 1], "nvram": [2, 3]}` and validates it.
    pub fn from_file(path: &Path) -> Result<Self, TierLayoutError> {
        let contents = fs::read(path)?;
        let layout: Self = serde_json::from_slice(&contents)?;
        layout.validate()?;
        Ok(layout)
    }

    /// Checks that both tiers are populated and disjoint.
    pub fn validate(&self) -> Result<(), TierLayoutError> {
        if self.dram.is_empty() {
            return Err(TierLayoutError::EmptyTier(Tier::Dram));
        }
        if self.nvram.is_empty() {
            return Err(TierLayoutError::EmptyTier(Tier::Nvram));
        }
        if let Some(node) = self.dram.iter().find(|node| self.nvram.contains(node)) {
            return Err(TierLayoutError::Overlap(*node));
        }
        Ok(())
    }

    /// The ordered node list backing `tier`.
    #[must_use]
    pub fn nodes(&self, tier: Tier) -> &[u32] {
        match tier {
            Tier::Dram => &self.dram,
            Tier::Nvram => &self.nvram,
        }
    }

    /// Whether `node` belongs to `tier`.
    #[must_use]
    pub fn contains(&self, node: u32, tier: Tier) -> bool {
        self.nodes(tier).contains(&node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_is_valid_and_disjoint() {
        let layout = TierLayout::default();
        layout.validate().unwrap();
        assert_eq!(layout.nodes(Tier::Dram), &[0, 1]);
        assert_eq!(layout.nodes(Tier::Nvram), &[2, 3]);
        assert!(layout.contains(0, Tier::Dram));
        assert!(!layout.contains(0, Tier::Nvram));
    }

    #[test]
    fn overlapping_layout_is_rejected() {
        let layout: TierLayout = serde_json::from_str(r#"{"dram":[0,1],"nvram":[1,2]}"#).unwrap();
        assert!(matches!(layout.validate(), Err(TierLayoutError::Overlap(1))));
    }

    #[test]
    fn empty_tier_is_rejected() {
        let layout: TierLayout = serde_json::from_str(r#"{"dram":[],"nvram":[2]}"#).unwrap();
        assert!(matches!(
            layout.validate(),
            Err(TierLayoutError::EmptyTier(Tier::Dram))
        ));
    }
}
