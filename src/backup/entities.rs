//! Registry of persisted entity types and their foreign-key dependencies
//!
//! This list is the only place the dependency graph is written down. The
//! export, the insert order (parents before children) and the delete order
//! (children before parents) are all derived from it.

use std::sync::LazyLock;

/// One persisted entity type
#[derive(Debug, PartialEq, Eq)]
pub struct Entity {
    /// Key of the entity in the structured export's `data` object
    pub key: &'static str,
    /// Database table holding the rows
    pub table: &'static str,
    /// Keys of entities this one references
    pub depends_on: &'static [&'static str],
    /// Whether the primary key `id` is backed by an auto-increment sequence
    pub serial_id: bool,
}

const fn entity(
    key: &'static str,
    table: &'static str,
    depends_on: &'static [&'static str],
    serial_id: bool,
) -> Entity {
    Entity { key, table, depends_on, serial_id }
}

/// Every entity type covered by a backup
pub static ENTITIES: &[Entity] = &[
    entity("admins", "Admin", &[], true),
    // User has no foreign key to Group, membership lives in UserGroup.
    // Declaring Group first only fixes the tie so users are emptied first.
    entity("groups", "Group", &[], true),
    entity("users", "User", &[], true),
    entity("inbounds", "Inbound", &[], true),
    entity("userInbounds", "UserInbound", &["users", "inbounds"], true),
    entity("trafficLogs", "TrafficLog", &["users"], true),
    entity("systemLogs", "SystemLog", &[], true),
    entity("userGroups", "UserGroup", &["users", "groups"], true),
    entity("groupInbounds", "GroupInbound", &["groups", "inbounds"], true),
    entity("groupPolicyTemplates", "GroupPolicyTemplate", &[], true),
    entity(
        "groupPolicySchedules",
        "GroupPolicySchedule",
        &["groupPolicyTemplates", "groups"],
        true,
    ),
    entity(
        "groupPolicyRollouts",
        "GroupPolicyRollout",
        &["groupPolicySchedules", "groupPolicyTemplates", "groups"],
        true,
    ),
    entity("apiKeys", "ApiKey", &["admins"], true),
    entity("sessions", "Session", &["admins"], false),
    entity("notificationSettings", "NotificationSetting", &[], true),
    entity("notificationAuditLogs", "NotificationAuditLog", &[], true),
    entity("connectionLogs", "ConnectionLog", &["users", "inbounds"], true),
    entity("protocolTemplates", "ProtocolTemplate", &[], true),
    entity("workerLocks", "WorkerLock", &[], false),
    entity("securityRules", "SecurityRule", &[], true),
    entity("subscriptionBrandings", "SubscriptionBranding", &["groups"], true),
    entity("usageSnapshots", "UsageSnapshot", &["users"], true),
    entity("subscriptionTemplates", "SubscriptionTemplate", &[], true),
];

static INSERT_ORDER: LazyLock<Vec<&'static Entity>> = LazyLock::new(|| topological_order(ENTITIES));

/// Look up an entity by its export key
pub fn find(key: &str) -> Option<&'static Entity> {
    ENTITIES.iter().find(|e| e.key == key)
}

/// Parents before children
pub fn insert_order() -> &'static [&'static Entity] {
    &INSERT_ORDER
}

/// Children before parents
pub fn delete_order() -> Vec<&'static Entity> {
    INSERT_ORDER.iter().rev().copied().collect()
}

/// Stable topological sort: among the entities whose parents are all
/// placed, the one declared first goes next.
fn topological_order(entities: &'static [Entity]) -> Vec<&'static Entity> {
    let mut placed: Vec<&'static Entity> = Vec::with_capacity(entities.len());

    while placed.len() < entities.len() {
        let next = entities.iter().find(|candidate| {
            !placed.contains(candidate)
                && candidate
                    .depends_on
                    .iter()
                    .all(|parent| placed.iter().any(|p| p.key == *parent))
        });

        match next {
            Some(entity) => placed.push(entity),
            None => panic!("entity registry has a dependency cycle or an unknown parent"),
        }
    }

    placed
}
