//! Subscription plans and the capabilities each one unlocks.
//!
//! Plans are a fixed catalog; a tier identifier selects one. Anything the
//! catalog does not recognize (absent, misspelled, stale client build)
//! falls back to the free tier.

use serde::Serialize;

/// Subscription tier identifier as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, serde::Deserialize)]
#[serde(from = "String", rename_all = "lowercase")]
pub enum PlanTier {
    #[default]
    Free,
    Starter,
    Pro,
}

impl PlanTier {
    pub const ALL: [PlanTier; 3] = [PlanTier::Free, PlanTier::Starter, PlanTier::Pro];

    /// Parses a tier identifier, defaulting to `Free` for anything unknown.
    pub fn parse(id: Option<&str>) -> Self {
        match id.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("starter") => PlanTier::Starter,
            Some("pro") => PlanTier::Pro,
            _ => PlanTier::Free,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Starter => "starter",
            PlanTier::Pro => "pro",
        }
    }

    pub fn policy(&self) -> &'static PlanPolicy {
        PlanPolicy::for_tier(*self)
    }
}

impl From<String> for PlanTier {
    fn from(id: String) -> Self {
        PlanTier::parse(Some(&id))
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Daily allowance of the quota-limited resource (assistant requests).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DailyQuota {
    Limited(u32),
    Unlimited,
}

impl Serialize for DailyQuota {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DailyQuota::Limited(n) => serializer.serialize_u32(*n),
            DailyQuota::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

/// Immutable policy record for one tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanPolicy {
    pub id: PlanTier,
    pub label: &'static str,
    pub monthly_price_usd: u32,
    pub daily_quota: DailyQuota,
    /// `uv pip install` into the project environment.
    pub can_install_python: bool,
    /// `bun add` into the project.
    pub can_install_javascript: bool,
}

static FREE: PlanPolicy = PlanPolicy {
    id: PlanTier::Free,
    label: "Free",
    monthly_price_usd: 0,
    daily_quota: DailyQuota::Limited(10),
    can_install_python: false,
    can_install_javascript: false,
};

static STARTER: PlanPolicy = PlanPolicy {
    id: PlanTier::Starter,
    label: "Starter",
    monthly_price_usd: 10,
    daily_quota: DailyQuota::Limited(50),
    can_install_python: true,
    can_install_javascript: false,
};

static PRO: PlanPolicy = PlanPolicy {
    id: PlanTier::Pro,
    label: "Pro",
    monthly_price_usd: 25,
    daily_quota: DailyQuota::Unlimited,
    can_install_python: true,
    can_install_javascript: true,
};

impl PlanPolicy {
    pub fn for_tier(tier: PlanTier) -> &'static PlanPolicy {
        match tier {
            PlanTier::Free => &FREE,
            PlanTier::Starter => &STARTER,
            PlanTier::Pro => &PRO,
        }
    }

    /// The full catalog, cheapest first.
    pub fn catalog() -> Vec<&'static PlanPolicy> {
        PlanTier::ALL.iter().map(|t| PlanPolicy::for_tier(*t)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_tiers() {
        assert_eq!(PlanTier::parse(Some("free")), PlanTier::Free);
        assert_eq!(PlanTier::parse(Some("starter")), PlanTier::Starter);
        assert_eq!(PlanTier::parse(Some("PRO")), PlanTier::Pro);
    }

    #[test]
    fn test_parse_unknown_defaults_to_free() {
        assert_eq!(PlanTier::parse(None), PlanTier::Free);
        assert_eq!(PlanTier::parse(Some("")), PlanTier::Free);
        assert_eq!(PlanTier::parse(Some("enterprise")), PlanTier::Free);
    }

    #[test]
    fn test_deserialize_never_fails() {
        #[derive(serde::Deserialize)]
        struct Body {
            plan: Option<PlanTier>,
        }
        let body: Body = serde_json::from_str(r#"{"plan":"platinum"}"#).unwrap();
        assert_eq!(body.plan, Some(PlanTier::Free));
        let body: Body = serde_json::from_str(r#"{"plan":"starter"}"#).unwrap();
        assert_eq!(body.plan, Some(PlanTier::Starter));
        let body: Body = serde_json::from_str("{}").unwrap();
        assert_eq!(body.plan, None);
    }

    #[test]
    fn test_catalog_capabilities() {
        let free = PlanTier::Free.policy();
        assert_eq!(free.daily_quota, DailyQuota::Limited(10));
        assert!(!free.can_install_python && !free.can_install_javascript);

        let starter = PlanTier::Starter.policy();
        assert_eq!(starter.daily_quota, DailyQuota::Limited(50));
        assert!(starter.can_install_python && !starter.can_install_javascript);

        let pro = PlanTier::Pro.policy();
        assert_eq!(pro.daily_quota, DailyQuota::Unlimited);
        assert!(pro.can_install_python && pro.can_install_javascript);
    }

    #[test]
    fn test_catalog_serializes_unlimited_sentinel() {
        let json = serde_json::to_value(PlanPolicy::catalog()).unwrap();
        assert_eq!(json[0]["id"], "free");
        assert_eq!(json[0]["dailyQuota"], 10);
        assert_eq!(json[2]["dailyQuota"], "unlimited");
        assert_eq!(json[1]["canInstallPython"], true);
    }
}
