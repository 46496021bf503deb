//! Account tier detection and lazy downgrade.
//!
//! The tier is resolved once from the provider profile after
//! authentication. The only in-session signal that changes it afterwards is
//! a Forbidden from the remote playback surface, which downgrades to Free.
//! It is never auto-upgraded mid-session.

use std::sync::RwLock;
use tracing::info;

use crate::provider::Profile;

const PREMIUM_PRODUCT: &str = "premium";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tier {
    #[default]
    Unknown,
    Free,
    Premium,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Unknown => write!(f, "unknown"),
            Tier::Free => write!(f, "free"),
            Tier::Premium => write!(f, "premium"),
        }
    }
}

pub struct PremiumGate {
    tier: RwLock<Tier>,
}

impl PremiumGate {
    pub fn new() -> Self {
        Self {
            tier: RwLock::new(Tier::Unknown),
        }
    }

    pub fn tier(&self) -> Tier {
        *self.tier.read().unwrap()
    }

    /// Resolve the tier from the profile. Only effective while the tier is
    /// still Unknown; an established Free tier is never upgraded.
    pub fn detect(&self, profile: &Profile) -> Tier {
        let mut tier = self.tier.write().unwrap();
        if *tier == Tier::Unknown {
            *tier = if profile.product == PREMIUM_PRODUCT {
                Tier::Premium
            } else {
                Tier::Free
            };
            info!("Account tier resolved: {}", *tier);
        }
        *tier
    }

    /// Downgrade after a Forbidden from the remote playback surface.
    pub fn downgrade_to_free(&self) {
        let mut tier = self.tier.write().unwrap();
        if *tier != Tier::Free {
            info!("Downgrading account tier to free");
            *tier = Tier::Free;
        }
    }

    pub fn reset(&self) {
        *self.tier.write().unwrap() = Tier::Unknown;
    }
}

impl Default for PremiumGate {
    fn default() -> Self {
        Self::new()
    }
}
