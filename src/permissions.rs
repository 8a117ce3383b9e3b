//! Role-tier checks for confirmation prompts.
//!
//! Tier membership is supplied by the caller at gesture time (fresh member
//! data from the interaction), never cached at prompt creation.

use serde::{Deserialize, Serialize};

use crate::config::Roles;

/// Ordered permission level gating who may confirm an enforcement prompt.
/// `Moderator` is the narrowest gate, `WelcomingParty` the widest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum RoleTier {
    Moderator,
    Minimo,
    WelcomingParty,
}

/// True when a member holding `member_roles` may confirm a prompt gated on
/// `tier`. An administrator always passes.
pub fn tier_allows(roles: &Roles, tier: RoleTier, member_roles: &[u64], is_admin: bool) -> bool {
    if is_admin {
        return true;
    }
    let has = |ids: &[u64]| member_roles.iter().any(|r| ids.contains(r));
    match tier {
        RoleTier::Moderator => has(&roles.moderator),
        RoleTier::Minimo => has(&roles.moderator) || has(&roles.minimo),
        RoleTier::WelcomingParty => {
            has(&roles.moderator) || has(&roles.minimo) || has(&roles.welcoming_party)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles() -> Roles {
        Roles {
            moderator: vec![1],
            minimo: vec![2],
            welcoming_party: vec![3],
            ..Default::default()
        }
    }

    #[test]
    fn tiers_nest_upwards() {
        let r = roles();
        // moderators pass every gate
        for tier in [RoleTier::Moderator, RoleTier::Minimo, RoleTier::WelcomingParty] {
            assert!(tier_allows(&r, tier, &[1], false));
        }
        // minimo passes minimo and wider, not moderator-only
        assert!(!tier_allows(&r, RoleTier::Moderator, &[2], false));
        assert!(tier_allows(&r, RoleTier::Minimo, &[2], false));
        assert!(tier_allows(&r, RoleTier::WelcomingParty, &[2], false));
        // welcoming party only passes the widest gate
        assert!(!tier_allows(&r, RoleTier::Minimo, &[3], false));
        assert!(tier_allows(&r, RoleTier::WelcomingParty, &[3], false));
    }

    #[test]
    fn admin_overrides_every_gate() {
        let r = roles();
        assert!(tier_allows(&r, RoleTier::Moderator, &[], true));
    }

    #[test]
    fn no_roles_no_access() {
        let r = roles();
        assert!(!tier_allows(&r, RoleTier::WelcomingParty, &[99], false));
    }
}
