//! Verification tests
//!
//! Default deny, wildcard coverage, conditions and group expansion, all
//! observed through `Engine::check`.

use std::net::IpAddr;

use capwarden::{
    Action, CheckRequest, Conditions, Config, DenyReason, Engine, NewCapability, Period, Principal, Resource,
    UsageKey, UsageLimit,
};
use chrono::{Duration, Utc};
use tempfile::TempDir;

fn setup() -> (TempDir, Engine, Principal) {
    let dir = TempDir::new().unwrap();
    let engine = Engine::open(Config::new(dir.path().join("db")).with_admin("user:root")).unwrap();
    (dir, engine, Principal::user("root").unwrap())
}

fn user(name: &str) -> Principal {
    Principal::user(name).unwrap()
}

fn res(s: &str) -> Resource {
    s.parse().unwrap()
}

fn check(engine: &Engine, who: &Principal, resource: &str, action: Action) -> bool {
    engine.check(&CheckRequest::new(who.clone(), res(resource), action)).unwrap().allowed
}

// ============================================================================
// Default deny
// ============================================================================

/// A principal with no capabilities is denied everything
#[test]
fn no_capabilities_denies_everything() {
    let (_dir, engine, _root) = setup();
    let nobody = user("nobody");

    for resource in ["api:billing", "api:billing:invoices", "data:project:123", "system:config", "group:editors", "admin:*"] {
        for action in Action::ALL {
            let decision = engine.check(&CheckRequest::new(nobody.clone(), res(resource), action)).unwrap();
            assert!(!decision.allowed, "{} {} should be denied", action, resource);
            assert_eq!(decision.reason, Some(DenyReason::NoMatchingCapability));
            assert!(decision.matched_capability_id.is_none());
        }
    }
}

/// The bootstrap administrator is an ordinary capability on admin:*
#[test]
fn bootstrap_admin_allowed_everywhere() {
    let (_dir, engine, root) = setup();

    assert!(check(&engine, &root, "data:project:123", Action::Delete));
    assert!(check(&engine, &root, "api:billing", Action::Admin));
    assert!(check(&engine, &root, "group:editors", Action::Admin));
    assert!(check(&engine, &root, "admin:*", Action::Delegate));
}

/// An action outside the capability's set is denied
#[test]
fn action_must_be_in_set() {
    let (_dir, engine, root) = setup();
    let alice = user("alice");
    engine.grant(&root, NewCapability::new(alice.clone(), res("data:project:123"), [Action::Read])).unwrap();

    assert!(check(&engine, &alice, "data:project:123", Action::Read));
    assert!(!check(&engine, &alice, "data:project:123", Action::Write));
}

// ============================================================================
// Wildcard coverage
// ============================================================================

/// A namespace-wide capability covers instances, never the reverse
#[test]
fn wildcard_is_one_way() {
    let (_dir, engine, root) = setup();
    let alice = user("alice");
    let bob = user("bob");
    engine.grant(&root, NewCapability::new(alice.clone(), res("data:project:*"), [Action::Read])).unwrap();
    engine.grant(&root, NewCapability::new(bob.clone(), res("data:project:123"), [Action::Read])).unwrap();

    assert!(check(&engine, &alice, "data:project:123", Action::Read));
    assert!(check(&engine, &alice, "data:project", Action::Read));
    assert!(!check(&engine, &bob, "data:project:*", Action::Read));
    assert!(!check(&engine, &bob, "data:project:456", Action::Read));
}

/// Kinds and namespaces never cross
#[test]
fn coverage_respects_kind_and_namespace() {
    let (_dir, engine, root) = setup();
    let alice = user("alice");
    engine.grant(&root, NewCapability::new(alice.clone(), res("data:project:*"), [Action::Read])).unwrap();

    assert!(!check(&engine, &alice, "api:project:123", Action::Read));
    assert!(!check(&engine, &alice, "data:projects:123", Action::Read));
}

/// With both an exact and a wildcard match, the exact one is reported
#[test]
fn exact_match_preferred() {
    let (_dir, engine, root) = setup();
    let alice = user("alice");
    let _wide = engine.grant(&root, NewCapability::new(alice.clone(), res("data:project:*"), [Action::Read])).unwrap();
    let exact = engine.grant(&root, NewCapability::new(alice.clone(), res("data:project:123"), [Action::Read])).unwrap();

    let decision = engine.check(&CheckRequest::parse("user:alice", "data:project:123", "read").unwrap()).unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.matched_capability_id.as_deref(), Some(exact.as_str()));
}

// ============================================================================
// Conditions
// ============================================================================

/// An expired capability never allows; a live one alongside it still does
#[test]
fn expired_capability_ignored() {
    let (_dir, engine, root) = setup();
    let alice = user("alice");
    let now = Utc::now();

    let _expiring = engine
        .grant(
            &root,
            NewCapability::new(alice.clone(), res("data:project:123"), [Action::Read])
                .with_conditions(Conditions::expiring_at(now + Duration::hours(1))),
        )
        .unwrap();
    let live = engine.grant(&root, NewCapability::new(alice.clone(), res("data:project:*"), [Action::Read])).unwrap();

    let req = CheckRequest::new(alice, res("data:project:123"), Action::Read);
    let later = engine.check_at(&req, now + Duration::hours(2)).unwrap();
    assert!(later.allowed);
    assert_eq!(later.matched_capability_id.as_deref(), Some(live.as_str()));
}

/// With only an expired capability the denial says so
#[test]
fn expired_only_reports_expired() {
    let (_dir, engine, root) = setup();
    let alice = user("alice");
    let now = Utc::now();
    engine
        .grant(
            &root,
            NewCapability::new(alice.clone(), res("api:billing"), [Action::Read])
                .with_conditions(Conditions::expiring_at(now + Duration::minutes(5))),
        )
        .unwrap();

    let req = CheckRequest::new(alice, res("api:billing:invoices"), Action::Read);
    assert!(engine.check_at(&req, now).unwrap().allowed);

    let decision = engine.check_at(&req, now + Duration::minutes(5)).unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason, Some(DenyReason::Expired));
}

/// A source address restriction must be met by the caller
#[test]
fn source_ip_restriction() {
    let (_dir, engine, root) = setup();
    let svc = Principal::service("ingest").unwrap();
    let office: IpAddr = "10.0.0.7".parse().unwrap();
    engine
        .grant(
            &root,
            NewCapability::new(svc.clone(), res("api:ingest"), [Action::Write])
                .with_conditions(Conditions { source_ips: vec![office], ..Default::default() }),
        )
        .unwrap();

    let req = CheckRequest::new(svc, res("api:ingest:events"), Action::Write);
    let missing = engine.check(&req).unwrap();
    assert!(!missing.allowed);
    assert_eq!(missing.reason, Some(DenyReason::SourceIpMismatch));

    assert!(!engine.is_allowed(&req.clone().from_ip("10.0.0.8".parse().unwrap())));
    assert!(engine.is_allowed(&req.from_ip(office)));
}

/// Usage-limited capabilities report remaining budget and deny past it
#[test]
fn usage_limit_in_check() {
    let (_dir, engine, root) = setup();
    let alice = user("alice");
    let cap = engine
        .grant(
            &root,
            NewCapability::new(alice.clone(), res("api:llm"), [Action::Create]).with_conditions(Conditions {
                usage_limits: vec![UsageLimit::new("tokens", Period::Daily, 30.0)],
                ..Default::default()
            }),
        )
        .unwrap();

    let req = CheckRequest::new(alice.clone(), res("api:llm:chat"), Action::Create).with_usage("tokens", 10.0);
    let decision = engine.check(&req).unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.remaining_quota, Some(30.0));

    engine.check_and_reserve(&UsageKey::new(&cap, alice.clone(), "tokens"), Period::Daily, 25.0).unwrap();

    let decision = engine.check(&req).unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason, Some(DenyReason::QuotaExhausted));

    // Checking never reserves
    let small = CheckRequest::new(alice, res("api:llm:chat"), Action::Create).with_usage("tokens", 5.0);
    assert!(engine.check(&small).unwrap().allowed);
    assert!(engine.check(&small).unwrap().allowed);
}

/// A malformed amount is rejected rather than denied
#[test]
fn negative_amount_is_validation_error() {
    let (_dir, engine, _root) = setup();
    let req = CheckRequest::new(user("alice"), res("api:llm"), Action::Create).with_amount(-1.0);
    assert!(matches!(engine.check(&req), Err(capwarden::CapError::Validation(_))));
    assert!(!engine.is_allowed(&req));
}

// ============================================================================
// Public capabilities
// ============================================================================

/// Capabilities issued to anon:* apply to every caller
#[test]
fn anonymous_capabilities_are_public() {
    let (_dir, engine, root) = setup();
    engine
        .grant(&root, NewCapability::new(Principal::anonymous(), res("api:status"), [Action::Read]))
        .unwrap();

    assert!(check(&engine, &user("bob"), "api:status:health", Action::Read));
    assert!(check(&engine, &Principal::anonymous(), "api:status:health", Action::Read));
    assert!(!check(&engine, &user("bob"), "api:status:health", Action::Write));
}

// ============================================================================
// Group expansion
// ============================================================================

/// Group membership confers the group's capabilities until it is revoked
#[test]
fn group_membership_grants_and_revokes() {
    let (_dir, engine, root) = setup();
    let alice = user("alice");
    let bundle = Principal::service("editors-bundle").unwrap();

    engine.create_group(&root, "editors", Some("Editors"), None).unwrap();
    let member_cap = engine
        .grant(&root, NewCapability::new(bundle, res("data:docs"), [Action::Read, Action::Write]))
        .unwrap();
    assert!(engine.add_group_member(&root, "editors", &member_cap).unwrap());

    assert!(!check(&engine, &alice, "data:docs:42", Action::Write));

    engine.grant_group(&root, &alice, "editors").unwrap();
    let decision = engine.check(&CheckRequest::new(alice.clone(), res("data:docs:42"), Action::Write)).unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.matched_capability_id.as_deref(), Some(member_cap.as_str()));
    assert!(check(&engine, &alice, "group:editors", Action::Read));

    engine.revoke_group(&root, &alice, "editors").unwrap();
    assert!(!check(&engine, &alice, "data:docs:42", Action::Write));
    assert!(engine.get_capability(&member_cap).unwrap().is_some());
    assert_eq!(engine.list_group_members("editors").unwrap().len(), 1);
}

/// Admin over a group manages it without conferring its capabilities
#[test]
fn group_admin_is_not_a_member() {
    let (_dir, engine, root) = setup();
    let alice = user("alice");

    engine.create_group(&root, "editors", None, None).unwrap();
    let bundle = engine
        .grant(&root, NewCapability::new(Principal::service("bundle").unwrap(), res("data:docs"), [Action::Delete]))
        .unwrap();
    engine.add_group_member(&root, "editors", &bundle).unwrap();
    let admin = engine.grant(&root, NewCapability::new(alice.clone(), res("group:editors"), [Action::Admin])).unwrap();

    assert!(check(&engine, &alice, "group:editors", Action::Admin));
    assert!(!check(&engine, &alice, "data:docs:1", Action::Delete));

    let membership = engine.grant_group(&alice, &alice, "editors").unwrap();
    assert_ne!(membership, admin);
    assert!(check(&engine, &alice, "data:docs:1", Action::Delete));

    // Leaving the group keeps the admin grant
    assert_eq!(engine.revoke_group(&alice, &alice, "editors").unwrap(), vec![membership]);
    assert!(engine.get_capability(&admin).unwrap().is_some());
    assert!(check(&engine, &alice, "group:editors", Action::Admin));
    assert!(!check(&engine, &alice, "data:docs:1", Action::Delete));
}

/// Removing a capability from a group removes it for every member
#[test]
fn group_member_removal() {
    let (_dir, engine, root) = setup();
    let alice = user("alice");
    let bundle = Principal::service("bundle").unwrap();

    engine.create_group(&root, "readers", None, None).unwrap();
    let cap = engine.grant(&root, NewCapability::new(bundle, res("data:docs"), [Action::Read])).unwrap();
    engine.add_group_member(&root, "readers", &cap).unwrap();
    engine.grant_group(&root, &alice, "readers").unwrap();
    assert!(check(&engine, &alice, "data:docs:1", Action::Read));

    assert!(engine.remove_group_member(&root, "readers", &cap).unwrap());
    assert!(!check(&engine, &alice, "data:docs:1", Action::Read));
}

/// Mutually nested groups expand once and terminate
#[test]
fn cyclic_groups_terminate() {
    let (_dir, engine, root) = setup();
    let alice = user("alice");
    let relay = Principal::service("relay").unwrap();

    engine.create_group(&root, "outer", None, None).unwrap();
    engine.create_group(&root, "inner", None, None).unwrap();

    // outer contains membership of inner, inner contains membership of outer
    let to_inner = engine.grant_group(&root, &relay, "inner").unwrap();
    let to_outer = engine.grant_group(&root, &relay, "outer").unwrap();
    engine.add_group_member(&root, "outer", &to_inner).unwrap();
    engine.add_group_member(&root, "inner", &to_outer).unwrap();

    let cap = engine
        .grant(&root, NewCapability::new(Principal::service("bundle").unwrap(), res("api:reports"), [Action::Read]))
        .unwrap();
    engine.add_group_member(&root, "inner", &cap).unwrap();

    engine.grant_group(&root, &alice, "outer").unwrap();
    assert!(check(&engine, &alice, "api:reports:weekly", Action::Read));
    assert!(!check(&engine, &alice, "api:reports:weekly", Action::Write));
}
