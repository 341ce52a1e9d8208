//! Postgres-backed store.
//!
//! Unique indexes carry the binding invariants; check-then-write sequences
//! run inside one transaction. Auto-schedule claims and explicit instance
//! binds also take a transaction-scoped advisory lock so two hosts syncing
//! at once cannot claim the same unbound work.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dynroute_events::AgentStateReport;
use dynroute_id::{AgentId, BindingId, NetworkId, PeerId, RoutingInstanceId};
use dynroute_networking::{AsNumber, Cidr};
use dynroute_reconcile::diff_ordered;
use sqlx::postgres::{PgConnection, PgPool, PgRow};
use sqlx::Row;
use tracing::debug;

use super::{
    Agent, NewRoutingInstance, NewRoutingPeer, RoutingInstance, RoutingInstanceUpdate,
    RoutingPeer, RoutingPeerUpdate, Store, StoreError,
};

/// Advisory lock key serializing scheduling claims.
const SCHEDULING_LOCK_KEY: i64 = 0x6472_5f73_6368_6564;

const PEER_COLUMNS: &str =
    "routingpeer_id, tenant_id, peer_address, remote_as, secret, extra_config, created_at, updated_at";

const INSTANCE_COLUMNS: &str =
    "routinginstance_id, tenant_id, nexthop, advertise, discover, created_at, updated_at";

const AGENT_COLUMNS: &str = "agent_id, agent_type, binary_name, host, topic, admin_state_up, \
     configurations, heartbeat_at, started_at, created_at";

// =============================================================================
// Rows
// =============================================================================

struct PeerRow {
    routingpeer_id: String,
    tenant_id: String,
    peer_address: String,
    remote_as: i64,
    secret: Option<String>,
    extra_config: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for PeerRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            routingpeer_id: row.try_get("routingpeer_id")?,
            tenant_id: row.try_get("tenant_id")?,
            peer_address: row.try_get("peer_address")?,
            remote_as: row.try_get("remote_as")?,
            secret: row.try_get("secret")?,
            extra_config: row.try_get("extra_config")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<PeerRow> for RoutingPeer {
    type Error = StoreError;

    fn try_from(row: PeerRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse(&row.routingpeer_id, "routingpeer_id")?,
            tenant_id: parse(&row.tenant_id, "tenant_id")?,
            peer_address: parse(&row.peer_address, "peer_address")?,
            remote_as: AsNumber::from_i64(row.remote_as)
                .map_err(|e| StoreError::Corrupt(format!("remote_as: {e}")))?,
            secret: row.secret,
            extra_config: row.extra_config,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

struct InstanceRow {
    routinginstance_id: String,
    tenant_id: String,
    nexthop: Option<String>,
    advertise: bool,
    discover: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for InstanceRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            routinginstance_id: row.try_get("routinginstance_id")?,
            tenant_id: row.try_get("tenant_id")?,
            nexthop: row.try_get("nexthop")?,
            advertise: row.try_get("advertise")?,
            discover: row.try_get("discover")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl InstanceRow {
    fn into_instance(self, advertise_routes: Vec<Cidr>) -> Result<RoutingInstance, StoreError> {
        Ok(RoutingInstance {
            id: parse(&self.routinginstance_id, "routinginstance_id")?,
            tenant_id: parse(&self.tenant_id, "tenant_id")?,
            nexthop: self
                .nexthop
                .as_deref()
                .map(|n| parse(n, "nexthop"))
                .transpose()?,
            advertise: self.advertise,
            discover: self.discover,
            advertise_routes,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct AgentRow {
    agent_id: String,
    agent_type: String,
    binary_name: String,
    host: String,
    topic: String,
    admin_state_up: bool,
    configurations: serde_json::Value,
    heartbeat_at: DateTime<Utc>,
    started_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for AgentRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            agent_id: row.try_get("agent_id")?,
            agent_type: row.try_get("agent_type")?,
            binary_name: row.try_get("binary_name")?,
            host: row.try_get("host")?,
            topic: row.try_get("topic")?,
            admin_state_up: row.try_get("admin_state_up")?,
            configurations: row.try_get("configurations")?,
            heartbeat_at: row.try_get("heartbeat_at")?,
            started_at: row.try_get("started_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<AgentRow> for Agent {
    type Error = StoreError;

    fn try_from(row: AgentRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse(&row.agent_id, "agent_id")?,
            agent_type: row.agent_type,
            binary: row.binary_name,
            host: row.host,
            topic: row.topic,
            admin_state_up: row.admin_state_up,
            configurations: row.configurations,
            heartbeat_at: row.heartbeat_at,
            started_at: row.started_at,
            created_at: row.created_at,
        })
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn parse<T>(value: &str, column: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse()
        .map_err(|e| StoreError::Corrupt(format!("{column} {value:?}: {e}")))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn peers_from_rows(rows: Vec<PeerRow>) -> Result<Vec<RoutingPeer>, StoreError> {
    rows.into_iter().map(RoutingPeer::try_from).collect()
}

fn agents_from_rows(rows: Vec<AgentRow>) -> Result<Vec<Agent>, StoreError> {
    rows.into_iter().map(Agent::try_from).collect()
}

async fn lock_scheduling(conn: &mut PgConnection) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(SCHEDULING_LOCK_KEY)
        .execute(conn)
        .await?;
    Ok(())
}

async fn fetch_peer(conn: &mut PgConnection, id: PeerId) -> Result<RoutingPeer, StoreError> {
    let row = sqlx::query_as::<_, PeerRow>(&format!(
        "SELECT {PEER_COLUMNS} FROM routing_peers WHERE routingpeer_id = $1"
    ))
    .bind(id.to_string())
    .fetch_optional(conn)
    .await?
    .ok_or(StoreError::PeerNotFound(id))?;
    row.try_into()
}

async fn fetch_agent(conn: &mut PgConnection, id: AgentId) -> Result<Agent, StoreError> {
    let row = sqlx::query_as::<_, AgentRow>(&format!(
        "SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id = $1"
    ))
    .bind(id.to_string())
    .fetch_optional(conn)
    .await?
    .ok_or(StoreError::AgentNotFound(id))?;
    row.try_into()
}

/// Attach advertise routes to instance rows, keeping submitted route order.
async fn hydrate_instances(
    conn: &mut PgConnection,
    rows: Vec<InstanceRow>,
) -> Result<Vec<RoutingInstance>, StoreError> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<String> = rows.iter().map(|r| r.routinginstance_id.clone()).collect();
    let route_rows = sqlx::query(
        "SELECT routinginstance_id, advertise_route FROM routing_instance_advertise_routes \
         WHERE routinginstance_id = ANY($1) ORDER BY routinginstance_id, position",
    )
    .bind(&ids)
    .fetch_all(conn)
    .await?;

    let mut routes: HashMap<String, Vec<Cidr>> = HashMap::new();
    for row in route_rows {
        let instance_id: String = row.try_get("routinginstance_id")?;
        let route: String = row.try_get("advertise_route")?;
        routes
            .entry(instance_id)
            .or_default()
            .push(parse(&route, "advertise_route")?);
    }

    rows.into_iter()
        .map(|row| {
            let instance_routes = routes.remove(&row.routinginstance_id).unwrap_or_default();
            row.into_instance(instance_routes)
        })
        .collect()
}

async fn fetch_instance(
    conn: &mut PgConnection,
    id: RoutingInstanceId,
) -> Result<RoutingInstance, StoreError> {
    let row = sqlx::query_as::<_, InstanceRow>(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM routing_instances WHERE routinginstance_id = $1"
    ))
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(StoreError::InstanceNotFound(id))?;

    hydrate_instances(conn, vec![row])
        .await?
        .pop()
        .ok_or(StoreError::InstanceNotFound(id))
}

async fn insert_routes(
    conn: &mut PgConnection,
    instance_id: RoutingInstanceId,
    routes: &[Cidr],
    first_position: i32,
) -> Result<(), StoreError> {
    for (offset, route) in routes.iter().enumerate() {
        let position = first_position + offset as i32;
        sqlx::query(
            "INSERT INTO routing_instance_advertise_routes \
             (routinginstance_id, advertise_route, position) VALUES ($1, $2, $3)",
        )
        .bind(instance_id.to_string())
        .bind(route.to_string())
        .bind(position)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

// =============================================================================
// Store
// =============================================================================

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn create_peer(&self, new: NewRoutingPeer) -> Result<RoutingPeer, StoreError> {
        let row = sqlx::query_as::<_, PeerRow>(&format!(
            "INSERT INTO routing_peers \
             (routingpeer_id, tenant_id, peer_address, remote_as, secret, extra_config) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {PEER_COLUMNS}"
        ))
        .bind(PeerId::new().to_string())
        .bind(new.tenant_id.to_string())
        .bind(new.peer_address.to_string())
        .bind(i64::from(new.remote_as.value()))
        .bind(&new.secret)
        .bind(&new.extra_config)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::PeerAddressInUse(new.peer_address)
            } else {
                StoreError::Database(e)
            }
        })?;
        row.try_into()
    }

    async fn get_peer(&self, id: PeerId) -> Result<RoutingPeer, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_peer(&mut conn, id).await
    }

    async fn list_peers(&self) -> Result<Vec<RoutingPeer>, StoreError> {
        let rows = sqlx::query_as::<_, PeerRow>(&format!(
            "SELECT {PEER_COLUMNS} FROM routing_peers ORDER BY routingpeer_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        peers_from_rows(rows)
    }

    async fn update_peer(
        &self,
        id: PeerId,
        update: RoutingPeerUpdate,
    ) -> Result<RoutingPeer, StoreError> {
        let row = sqlx::query_as::<_, PeerRow>(&format!(
            "UPDATE routing_peers SET \
                 remote_as = COALESCE($2, remote_as), \
                 secret = CASE WHEN $3 THEN $4 ELSE secret END, \
                 extra_config = COALESCE($5, extra_config), \
                 updated_at = NOW() \
             WHERE routingpeer_id = $1 RETURNING {PEER_COLUMNS}"
        ))
        .bind(id.to_string())
        .bind(update.remote_as.map(|a| i64::from(a.value())))
        .bind(update.secret.is_some())
        .bind(update.secret.flatten())
        .bind(&update.extra_config)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::PeerNotFound(id))?;
        row.try_into()
    }

    async fn delete_peer(&self, id: PeerId) -> Result<(RoutingPeer, Vec<Agent>), StoreError> {
        let mut tx = self.pool.begin().await?;

        let hosts = sqlx::query_as::<_, AgentRow>(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id IN \
             (SELECT agent_id FROM peer_agent_bindings WHERE routingpeer_id = $1) \
             ORDER BY agent_id"
        ))
        .bind(id.to_string())
        .fetch_all(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, PeerRow>(&format!(
            "DELETE FROM routing_peers WHERE routingpeer_id = $1 RETURNING {PEER_COLUMNS}"
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::PeerNotFound(id))?;

        tx.commit().await?;
        Ok((row.try_into()?, agents_from_rows(hosts)?))
    }

    async fn create_instance(
        &self,
        new: NewRoutingInstance,
    ) -> Result<RoutingInstance, StoreError> {
        let id = RoutingInstanceId::new();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO routing_instances \
             (routinginstance_id, tenant_id, nexthop, advertise, discover) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(id.to_string())
        .bind(new.tenant_id.to_string())
        .bind(new.nexthop.map(|n| n.to_string()))
        .bind(new.advertise)
        .bind(new.discover)
        .execute(&mut *tx)
        .await?;

        let routes = diff_ordered(&[], &new.advertise_routes).to_add;
        insert_routes(&mut tx, id, &routes, 0).await?;

        let instance = fetch_instance(&mut tx, id).await?;
        tx.commit().await?;
        Ok(instance)
    }

    async fn get_instance(&self, id: RoutingInstanceId) -> Result<RoutingInstance, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_instance(&mut conn, id).await
    }

    async fn list_instances(&self) -> Result<Vec<RoutingInstance>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM routing_instances ORDER BY routinginstance_id"
        ))
        .fetch_all(&mut *conn)
        .await?;
        hydrate_instances(&mut conn, rows).await
    }

    async fn update_instance(
        &self,
        id: RoutingInstanceId,
        update: RoutingInstanceUpdate,
    ) -> Result<RoutingInstance, StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE routing_instances SET \
                 nexthop = CASE WHEN $2 THEN $3 ELSE nexthop END, \
                 advertise = COALESCE($4, advertise), \
                 discover = COALESCE($5, discover), \
                 updated_at = NOW() \
             WHERE routinginstance_id = $1",
        )
        .bind(id.to_string())
        .bind(update.nexthop.is_some())
        .bind(update.nexthop.flatten().map(|n| n.to_string()))
        .bind(update.advertise)
        .bind(update.discover)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::InstanceNotFound(id));
        }

        if let Some(desired) = update.advertise_routes {
            let current = fetch_instance(&mut tx, id).await?.advertise_routes;
            let changes = diff_ordered(&current, &desired);

            for route in &changes.to_remove {
                sqlx::query(
                    "DELETE FROM routing_instance_advertise_routes \
                     WHERE routinginstance_id = $1 AND advertise_route = $2",
                )
                .bind(id.to_string())
                .bind(route.to_string())
                .execute(&mut *tx)
                .await?;
            }

            let next_position: i32 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(position) + 1, 0) FROM routing_instance_advertise_routes \
                 WHERE routinginstance_id = $1",
            )
            .bind(id.to_string())
            .fetch_one(&mut *tx)
            .await?;

            insert_routes(&mut tx, id, &changes.to_add, next_position).await?;

            debug!(
                instance_id = %id,
                added = changes.to_add.len(),
                removed = changes.to_remove.len(),
                unchanged = changes.unchanged.len(),
                "Replaced advertise routes"
            );
        }

        let instance = fetch_instance(&mut tx, id).await?;
        tx.commit().await?;
        Ok(instance)
    }

    async fn delete_instance(
        &self,
        id: RoutingInstanceId,
    ) -> Result<(RoutingInstance, Vec<Agent>), StoreError> {
        let mut tx = self.pool.begin().await?;
        let instance = fetch_instance(&mut tx, id).await?;

        let hosts = sqlx::query_as::<_, AgentRow>(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id IN \
             (SELECT agent_id FROM instance_agent_bindings WHERE routinginstance_id = $1) \
             ORDER BY agent_id"
        ))
        .bind(id.to_string())
        .fetch_all(&mut *tx)
        .await?;

        // Networks, routes and agent bindings go with the row.
        sqlx::query("DELETE FROM routing_instances WHERE routinginstance_id = $1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok((instance, agents_from_rows(hosts)?))
    }

    async fn add_network(
        &self,
        instance_id: RoutingInstanceId,
        network_id: NetworkId,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        fetch_instance(&mut tx, instance_id).await?;

        sqlx::query(
            "INSERT INTO routing_instance_networks (routinginstance_id, network_id) \
             VALUES ($1, $2)",
        )
        .bind(instance_id.to_string())
        .bind(network_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::NetworkAlreadyAssociated {
                    instance_id,
                    network_id,
                }
            } else {
                StoreError::Database(e)
            }
        })?;

        tx.commit().await?;
        Ok(())
    }

    async fn remove_network(
        &self,
        instance_id: RoutingInstanceId,
        network_id: NetworkId,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        fetch_instance(&mut tx, instance_id).await?;

        let deleted = sqlx::query(
            "DELETE FROM routing_instance_networks \
             WHERE routinginstance_id = $1 AND network_id = $2",
        )
        .bind(instance_id.to_string())
        .bind(network_id.to_string())
        .execute(&mut *tx)
        .await?;

        if deleted.rows_affected() == 0 {
            return Err(StoreError::NetworkNotAssociated {
                instance_id,
                network_id,
            });
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_networks(
        &self,
        instance_id: RoutingInstanceId,
    ) -> Result<Vec<NetworkId>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_instance(&mut conn, instance_id).await?;

        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT network_id FROM routing_instance_networks \
             WHERE routinginstance_id = $1 ORDER BY network_id",
        )
        .bind(instance_id.to_string())
        .fetch_all(&mut *conn)
        .await?;

        ids.iter().map(|id| parse(id, "network_id")).collect()
    }

    async fn record_agent_report(
        &self,
        report: &AgentStateReport,
        now: DateTime<Utc>,
    ) -> Result<Agent, StoreError> {
        let row = sqlx::query_as::<_, AgentRow>(&format!(
            "INSERT INTO agents \
             (agent_id, agent_type, binary_name, host, topic, admin_state_up, \
              configurations, heartbeat_at, started_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, TRUE, $6, $7, $7, $7) \
             ON CONFLICT (agent_type, host) DO UPDATE SET \
                 binary_name = EXCLUDED.binary_name, \
                 topic = EXCLUDED.topic, \
                 configurations = EXCLUDED.configurations, \
                 heartbeat_at = EXCLUDED.heartbeat_at, \
                 started_at = CASE WHEN $8 THEN EXCLUDED.started_at ELSE agents.started_at END \
             RETURNING {AGENT_COLUMNS}"
        ))
        .bind(AgentId::new().to_string())
        .bind(&report.agent_type)
        .bind(&report.binary)
        .bind(&report.host)
        .bind(&report.topic)
        .bind(&report.configurations)
        .bind(now)
        .bind(report.start_flag)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_agent(&self, id: AgentId) -> Result<Agent, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_agent(&mut conn, id).await
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        let rows = sqlx::query_as::<_, AgentRow>(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents ORDER BY agent_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        agents_from_rows(rows)
    }

    async fn find_agent(&self, agent_type: &str, host: &str) -> Result<Option<Agent>, StoreError> {
        let row = sqlx::query_as::<_, AgentRow>(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE agent_type = $1 AND host = $2"
        ))
        .bind(agent_type)
        .bind(host)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Agent::try_from).transpose()
    }

    async fn set_agent_admin_state(
        &self,
        id: AgentId,
        admin_state_up: bool,
    ) -> Result<Agent, StoreError> {
        let row = sqlx::query_as::<_, AgentRow>(&format!(
            "UPDATE agents SET admin_state_up = $2 WHERE agent_id = $1 RETURNING {AGENT_COLUMNS}"
        ))
        .bind(id.to_string())
        .bind(admin_state_up)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::AgentNotFound(id))?;
        row.try_into()
    }

    async fn bind_peer(
        &self,
        peer_id: PeerId,
        agent_id: AgentId,
    ) -> Result<RoutingPeer, StoreError> {
        let mut tx = self.pool.begin().await?;
        let peer = fetch_peer(&mut tx, peer_id).await?;
        fetch_agent(&mut tx, agent_id).await?;

        sqlx::query(
            "INSERT INTO peer_agent_bindings (binding_id, routingpeer_id, agent_id) \
             VALUES ($1, $2, $3)",
        )
        .bind(BindingId::new().to_string())
        .bind(peer_id.to_string())
        .bind(agent_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::PeerAlreadyHosted { peer_id, agent_id }
            } else {
                StoreError::Database(e)
            }
        })?;

        tx.commit().await?;
        Ok(peer)
    }

    async fn unbind_peer(
        &self,
        peer_id: PeerId,
        agent_id: AgentId,
    ) -> Result<RoutingPeer, StoreError> {
        let mut tx = self.pool.begin().await?;
        let peer = fetch_peer(&mut tx, peer_id).await?;

        let deleted = sqlx::query(
            "DELETE FROM peer_agent_bindings WHERE routingpeer_id = $1 AND agent_id = $2",
        )
        .bind(peer_id.to_string())
        .bind(agent_id.to_string())
        .execute(&mut *tx)
        .await?;

        if deleted.rows_affected() == 0 {
            return Err(StoreError::PeerNotHosted { peer_id, agent_id });
        }

        tx.commit().await?;
        Ok(peer)
    }

    async fn peers_on_agent(&self, agent_id: AgentId) -> Result<Vec<RoutingPeer>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_agent(&mut conn, agent_id).await?;

        let rows = sqlx::query_as::<_, PeerRow>(&format!(
            "SELECT {PEER_COLUMNS} FROM routing_peers WHERE routingpeer_id IN \
             (SELECT routingpeer_id FROM peer_agent_bindings WHERE agent_id = $1) \
             ORDER BY routingpeer_id"
        ))
        .bind(agent_id.to_string())
        .fetch_all(&mut *conn)
        .await?;
        peers_from_rows(rows)
    }

    async fn agents_hosting_peer(&self, peer_id: PeerId) -> Result<Vec<Agent>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_peer(&mut conn, peer_id).await?;

        let rows = sqlx::query_as::<_, AgentRow>(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id IN \
             (SELECT agent_id FROM peer_agent_bindings WHERE routingpeer_id = $1) \
             ORDER BY agent_id"
        ))
        .bind(peer_id.to_string())
        .fetch_all(&mut *conn)
        .await?;
        agents_from_rows(rows)
    }

    async fn claim_unbound_peers(
        &self,
        agent_id: AgentId,
        limit: Option<usize>,
    ) -> Result<Vec<RoutingPeer>, StoreError> {
        let mut tx = self.pool.begin().await?;
        lock_scheduling(&mut tx).await?;
        fetch_agent(&mut tx, agent_id).await?;

        // LIMIT NULL means no limit.
        let limit = limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));
        let rows = sqlx::query_as::<_, PeerRow>(&format!(
            "SELECT {PEER_COLUMNS} FROM routing_peers p WHERE NOT EXISTS \
             (SELECT 1 FROM peer_agent_bindings b WHERE b.routingpeer_id = p.routingpeer_id) \
             ORDER BY routingpeer_id LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;
        let claimed = peers_from_rows(rows)?;

        for peer in &claimed {
            sqlx::query(
                "INSERT INTO peer_agent_bindings (binding_id, routingpeer_id, agent_id) \
                 VALUES ($1, $2, $3)",
            )
            .bind(BindingId::new().to_string())
            .bind(peer.id.to_string())
            .bind(agent_id.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn bind_instance(
        &self,
        instance_id: RoutingInstanceId,
        agent_id: AgentId,
    ) -> Result<RoutingInstance, StoreError> {
        let mut tx = self.pool.begin().await?;
        lock_scheduling(&mut tx).await?;
        let instance = fetch_instance(&mut tx, instance_id).await?;
        fetch_agent(&mut tx, agent_id).await?;

        let hosted: Option<String> = sqlx::query_scalar(
            "SELECT routinginstance_id FROM instance_agent_bindings WHERE agent_id = $1",
        )
        .bind(agent_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(hosted) = hosted {
            let hosted: RoutingInstanceId = parse(&hosted, "routinginstance_id")?;
            return Err(if hosted == instance_id {
                StoreError::InstanceAlreadyHosted {
                    instance_id,
                    agent_id,
                }
            } else {
                StoreError::AgentHostsInstance {
                    agent_id,
                    instance_id: hosted,
                }
            });
        }

        sqlx::query(
            "INSERT INTO instance_agent_bindings (binding_id, routinginstance_id, agent_id) \
             VALUES ($1, $2, $3)",
        )
        .bind(BindingId::new().to_string())
        .bind(instance_id.to_string())
        .bind(agent_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::InstanceAlreadyHosted {
                    instance_id,
                    agent_id,
                }
            } else {
                StoreError::Database(e)
            }
        })?;

        tx.commit().await?;
        Ok(instance)
    }

    async fn unbind_instance(
        &self,
        instance_id: RoutingInstanceId,
        agent_id: AgentId,
    ) -> Result<RoutingInstance, StoreError> {
        let mut tx = self.pool.begin().await?;
        let instance = fetch_instance(&mut tx, instance_id).await?;

        let deleted = sqlx::query(
            "DELETE FROM instance_agent_bindings WHERE routinginstance_id = $1 AND agent_id = $2",
        )
        .bind(instance_id.to_string())
        .bind(agent_id.to_string())
        .execute(&mut *tx)
        .await?;

        if deleted.rows_affected() == 0 {
            return Err(StoreError::InstanceNotHosted {
                instance_id,
                agent_id,
            });
        }

        tx.commit().await?;
        Ok(instance)
    }

    async fn agents_on_instance(
        &self,
        instance_id: RoutingInstanceId,
    ) -> Result<Vec<Agent>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_instance(&mut conn, instance_id).await?;

        let rows = sqlx::query_as::<_, AgentRow>(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id IN \
             (SELECT agent_id FROM instance_agent_bindings WHERE routinginstance_id = $1) \
             ORDER BY agent_id"
        ))
        .bind(instance_id.to_string())
        .fetch_all(&mut *conn)
        .await?;
        agents_from_rows(rows)
    }

    async fn instances_on_agent(
        &self,
        agent_id: AgentId,
    ) -> Result<Vec<RoutingInstance>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_agent(&mut conn, agent_id).await?;

        let rows = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM routing_instances WHERE routinginstance_id IN \
             (SELECT routinginstance_id FROM instance_agent_bindings WHERE agent_id = $1) \
             ORDER BY routinginstance_id"
        ))
        .bind(agent_id.to_string())
        .fetch_all(&mut *conn)
        .await?;
        hydrate_instances(&mut conn, rows).await
    }

    async fn claim_unbound_instance(
        &self,
        agent_id: AgentId,
    ) -> Result<Option<RoutingInstance>, StoreError> {
        let mut tx = self.pool.begin().await?;
        lock_scheduling(&mut tx).await?;
        fetch_agent(&mut tx, agent_id).await?;

        let hosts_one: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM instance_agent_bindings WHERE agent_id = $1)",
        )
        .bind(agent_id.to_string())
        .fetch_one(&mut *tx)
        .await?;
        if hosts_one {
            return Ok(None);
        }

        let candidate: Option<String> = sqlx::query_scalar(
            "SELECT routinginstance_id FROM routing_instances i WHERE NOT EXISTS \
             (SELECT 1 FROM instance_agent_bindings b \
              WHERE b.routinginstance_id = i.routinginstance_id) \
             ORDER BY routinginstance_id LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;
        let Some(candidate) = candidate else {
            return Ok(None);
        };
        let instance_id: RoutingInstanceId = parse(&candidate, "routinginstance_id")?;

        sqlx::query(
            "INSERT INTO instance_agent_bindings (binding_id, routinginstance_id, agent_id) \
             VALUES ($1, $2, $3)",
        )
        .bind(BindingId::new().to_string())
        .bind(instance_id.to_string())
        .bind(agent_id.to_string())
        .execute(&mut *tx)
        .await?;

        let instance = fetch_instance(&mut tx, instance_id).await?;
        tx.commit().await?;
        Ok(Some(instance))
    }
}
