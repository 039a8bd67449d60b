//! Role byte budgets for streamed bundles
//!
//! Each user role caps the serialized size of a viewport bundle.
//! [`BundleBudget`] tracks bytes committed against such a cap and provides
//! pressure metrics for selection decisions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::Error;

/// Consumer role, which determines the bundle budget
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    ConstructionWorker,
    Superintendent,
    Architect,
    #[default]
    FullFeatured,
}

impl UserRole {
    pub const ALL: [UserRole; 4] = [
        UserRole::ConstructionWorker,
        UserRole::Superintendent,
        UserRole::Architect,
        UserRole::FullFeatured,
    ];

    /// Bundle budget in bytes; `None` is unbounded
    pub fn budget(self) -> Option<usize> {
        match self {
            UserRole::ConstructionWorker => Some(8192),
            UserRole::Superintendent => Some(12288),
            UserRole::Architect => Some(14336),
            UserRole::FullFeatured => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UserRole::ConstructionWorker => "construction_worker",
            UserRole::Superintendent => "superintendent",
            UserRole::Architect => "architect",
            UserRole::FullFeatured => "full_featured",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UserRole::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| Error::Config(format!("unknown role '{}'", s)))
    }
}

/// Budget in bytes for `role`; `None` is unbounded
pub fn role_budget(role: UserRole) -> Option<usize> {
    role.budget()
}

/// Byte accounting against an optional cap
#[derive(Clone, Debug, Default)]
pub struct BundleBudget {
    /// Maximum bytes allowed; `None` is unbounded
    budget_bytes: Option<usize>,
    used_bytes: usize,
}

impl BundleBudget {
    pub fn new(budget_bytes: Option<usize>) -> Self {
        Self {
            budget_bytes,
            used_bytes: 0,
        }
    }

    pub fn for_role(role: UserRole) -> Self {
        Self::new(role.budget())
    }

    // --- Tracking methods ---

    pub fn add(&mut self, bytes: usize) {
        self.used_bytes = self.used_bytes.saturating_add(bytes);
    }

    // --- Query methods ---

    pub fn limit(&self) -> Option<usize> {
        self.budget_bytes
    }

    pub fn used(&self) -> usize {
        self.used_bytes
    }

    /// Remaining bytes; `usize::MAX` when unbounded
    pub fn available(&self) -> usize {
        match self.budget_bytes {
            Some(limit) => limit.saturating_sub(self.used_bytes),
            None => usize::MAX,
        }
    }

    /// Used fraction of the budget (0.0 to 1.0+).
    ///
    /// Unbounded and zero budgets report 0.0.
    pub fn pressure(&self) -> f64 {
        match self.budget_bytes {
            Some(limit) if limit > 0 => self.used_bytes as f64 / limit as f64,
            _ => 0.0,
        }
    }

    // --- Decision methods ---

    /// True if `bytes` more would still be within budget
    pub fn fits(&self, bytes: usize) -> bool {
        self.available() >= bytes
    }

    pub fn is_over(&self) -> bool {
        self.budget_bytes.is_some_and(|limit| self.used_bytes > limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_budgets() {
        assert_eq!(role_budget(UserRole::ConstructionWorker), Some(8192));
        assert_eq!(role_budget(UserRole::Superintendent), Some(12288));
        assert_eq!(role_budget(UserRole::Architect), Some(14336));
        assert_eq!(role_budget(UserRole::FullFeatured), None);
    }

    #[test]
    fn test_role_parse_and_display() {
        for role in UserRole::ALL {
            assert_eq!(role.to_string().parse::<UserRole>().unwrap(), role);
        }
        assert!(matches!("janitor".parse::<UserRole>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_role_serde_names() {
        let json = serde_json::to_string(&UserRole::ConstructionWorker).unwrap();
        assert_eq!(json, "\"construction_worker\"");
    }

    #[test]
    fn test_budget_tracking() {
        let mut budget = BundleBudget::for_role(UserRole::ConstructionWorker);
        budget.add(4096);
        assert_eq!(budget.used(), 4096);
        assert_eq!(budget.available(), 4096);
        assert!((budget.pressure() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_budget_saturating_ops() {
        let mut budget = BundleBudget::new(Some(100));
        budget.add(usize::MAX);
        budget.add(100);
        assert_eq!(budget.used(), usize::MAX);
        assert!(budget.is_over());
    }

    #[test]
    fn test_budget_fits() {
        let mut budget = BundleBudget::new(Some(2048));
        assert!(budget.fits(2048));
        budget.add(2000);
        assert!(!budget.fits(100));
        assert!(budget.fits(48));
        assert!(!budget.is_over());
    }

    #[test]
    fn test_unbounded_budget() {
        let mut budget = BundleBudget::for_role(UserRole::FullFeatured);
        budget.add(1 << 30);
        assert!(budget.fits(1 << 30));
        assert_eq!(budget.pressure(), 0.0);
        assert!(!budget.is_over());
    }
}
