//! Action bits, table names and limits

// Action bit constants
pub const READ: u8 = 1;
pub const WRITE: u8 = 1 << 1;
pub const CREATE: u8 = 1 << 2;
pub const UPDATE: u8 = 1 << 3;
pub const DELETE: u8 = 1 << 4;
pub const ADMIN: u8 = 1 << 5;
pub const DELEGATE: u8 = 1 << 6;
pub const ALL_ACTIONS: u8 = READ | WRITE | CREATE | UPDATE | DELETE | ADMIN | DELEGATE;

// Table names (the durable schema other tooling may read)
pub const T_CAPABILITIES: &str = "capabilities";
pub const T_CAPS_BY_PRINCIPAL: &str = "caps_by_principal";
pub const T_CAPS_BY_RESOURCE: &str = "caps_by_resource";
pub const T_CAPS_BY_PARENT: &str = "caps_by_parent";
pub const T_CAPS_BY_REQUEST: &str = "caps_by_request";
pub const T_REQUESTS: &str = "capability_requests";
pub const T_REQUESTS_BY_OWNER: &str = "requests_by_owner";
pub const T_GROUPS: &str = "capability_groups";
pub const T_GROUP_MEMBERS: &str = "capability_group_members";
pub const T_GROUP_MEMBERS_REV: &str = "capability_group_members_rev";
pub const T_USAGE: &str = "capability_usage";
pub const T_RESERVATIONS: &str = "usage_reservations";
pub const T_RESERVATION_OUTCOMES: &str = "reservation_outcomes";
pub const T_META: &str = "meta";
pub const TABLE_COUNT: u32 = 14;

// Reservation outcomes: how a reservation left the live table
pub const OUTCOME_LAPSED: u64 = 1;
pub const OUTCOME_SETTLED: u64 = 2;

// Meta keys
pub const META_BOOTSTRAPPED: &str = "bootstrapped";
pub const META_ADMIN: &str = "admin_principal";

// Maximum byte length of one key part (length-prefixed with a u8)
pub const MAX_PART_LEN: usize = 255;

// Defaults
pub const DEFAULT_MAP_SIZE: usize = 1 << 30;
pub const DEFAULT_RESERVATION_LEASE_SECS: u64 = 2 * 60 * 60;
pub const MAX_RESERVATION_LEASE_SECS: u64 = 366 * 24 * 60 * 60;
pub const DEFAULT_MAX_DELEGATION_DEPTH: usize = 16;
pub const DEFAULT_MAX_GROUP_DEPTH: usize = 8;
