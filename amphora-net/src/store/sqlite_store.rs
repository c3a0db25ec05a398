//! SQLite-backed state repository.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};

use super::error::{Result, StoreError};
use super::traits::{AmphoraStore, LoadBalancerStore, MemberPortStore};
use crate::model::{Amphora, AmphoraMemberPort, LoadBalancer};

/// State repository on top of a SQLite pool.
///
/// Load balancers and amphorae are stored as JSON documents keyed by id; the
/// member-port bindings get their own table since they are the durable
/// ownership record reconciliation resumes from.
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    /// Connect to the database at `url` and create the schema if needed.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        let repo = Self { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    /// Create an in-memory repository (for testing and dry runs).
    ///
    /// Every pooled connection would see its own in-memory database, so the
    /// pool is pinned to a single connection that never expires.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let repo = Self { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS load_balancers (
                id TEXT PRIMARY KEY,
                document TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS amphorae (
                id TEXT PRIMARY KEY,
                load_balancer_id TEXT,
                document TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS amphorae_load_balancer ON amphorae (load_balancer_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS amphora_member_ports (
                port_id TEXT PRIMARY KEY,
                amphora_id TEXT NOT NULL,
                network_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Run `op` inside one short transaction: begin, run, commit.
    ///
    /// The transaction rolls back if `op` fails. Callers must not hold the
    /// transaction across network driver calls.
    pub async fn scoped<T, F>(&self, op: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> + Send,
    {
        let mut tx = self.pool.begin().await?;
        let value = op(&mut *tx).await?;
        tx.commit().await?;
        Ok(value)
    }
}

fn decode_amphora(row: &SqliteRow) -> Result<Amphora> {
    let document: String = row.try_get("document")?;
    Ok(serde_json::from_str(&document)?)
}

#[async_trait]
impl LoadBalancerStore for SqliteRepository {
    async fn get_load_balancer(&self, id: &str) -> Result<LoadBalancer> {
        let id = id.to_string();
        self.scoped(move |conn| {
            Box::pin(async move {
                let row = sqlx::query("SELECT document FROM load_balancers WHERE id = ?")
                    .bind(&id)
                    .fetch_optional(&mut *conn)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("load balancer {id}")))?;
                let document: String = row.try_get("document")?;
                let mut lb: LoadBalancer = serde_json::from_str(&document)?;

                let rows = sqlx::query(
                    "SELECT document FROM amphorae WHERE load_balancer_id = ? ORDER BY id",
                )
                .bind(&id)
                .fetch_all(&mut *conn)
                .await?;
                lb.amphorae = rows
                    .iter()
                    .map(decode_amphora)
                    .collect::<Result<Vec<_>>>()?;

                Ok(lb)
            })
        })
        .await
    }

    async fn put_load_balancer(&self, lb: &LoadBalancer) -> Result<()> {
        let mut doc = lb.clone();
        let amphorae = std::mem::take(&mut doc.amphorae);
        let document = serde_json::to_string(&doc)?;
        let amphora_docs = amphorae
            .into_iter()
            .map(|mut amp| {
                amp.load_balancer_id = Some(lb.id.clone());
                Ok((amp.id.clone(), serde_json::to_string(&amp)?))
            })
            .collect::<Result<Vec<_>>>()?;
        let lb_id = lb.id.clone();
        let now = Utc::now().to_rfc3339();

        self.scoped(move |conn| {
            Box::pin(async move {
                sqlx::query(
                    r#"
                    INSERT INTO load_balancers (id, document, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(id) DO UPDATE SET
                        document = excluded.document,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&lb_id)
                .bind(&document)
                .bind(&now)
                .execute(&mut *conn)
                .await?;

                // The amphora set of a load balancer is replaced wholesale.
                sqlx::query("DELETE FROM amphorae WHERE load_balancer_id = ?")
                    .bind(&lb_id)
                    .execute(&mut *conn)
                    .await?;

                for (amp_id, amp_doc) in &amphora_docs {
                    sqlx::query(
                        r#"
                        INSERT INTO amphorae (id, load_balancer_id, document, updated_at)
                        VALUES (?, ?, ?, ?)
                        ON CONFLICT(id) DO UPDATE SET
                            load_balancer_id = excluded.load_balancer_id,
                            document = excluded.document,
                            updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(amp_id)
                    .bind(&lb_id)
                    .bind(amp_doc)
                    .bind(&now)
                    .execute(&mut *conn)
                    .await?;
                }

                Ok(())
            })
        })
        .await
    }
}

#[async_trait]
impl AmphoraStore for SqliteRepository {
    async fn get_amphora(&self, id: &str) -> Result<Amphora> {
        let id = id.to_string();
        self.scoped(move |conn| {
            Box::pin(async move {
                let row = sqlx::query("SELECT document FROM amphorae WHERE id = ?")
                    .bind(&id)
                    .fetch_optional(&mut *conn)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("amphora {id}")))?;
                decode_amphora(&row)
            })
        })
        .await
    }

    async fn update_amphora_ports(
        &self,
        amphora_id: &str,
        vrrp_port_id: Option<&str>,
        ha_port_id: Option<&str>,
    ) -> Result<()> {
        let id = amphora_id.to_string();
        let vrrp_port_id = vrrp_port_id.map(str::to_string);
        let ha_port_id = ha_port_id.map(str::to_string);
        let now = Utc::now().to_rfc3339();

        self.scoped(move |conn| {
            Box::pin(async move {
                let row = sqlx::query("SELECT document FROM amphorae WHERE id = ?")
                    .bind(&id)
                    .fetch_optional(&mut *conn)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("amphora {id}")))?;
                let mut amp = decode_amphora(&row)?;
                amp.vrrp_port_id = vrrp_port_id;
                amp.ha_port_id = ha_port_id;
                let document = serde_json::to_string(&amp)?;

                sqlx::query("UPDATE amphorae SET document = ?, updated_at = ? WHERE id = ?")
                    .bind(&document)
                    .bind(&now)
                    .bind(&id)
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .await
    }
}

#[async_trait]
impl MemberPortStore for SqliteRepository {
    async fn create_member_port(&self, binding: &AmphoraMemberPort) -> Result<()> {
        let binding = binding.clone();
        let now = Utc::now().to_rfc3339();

        self.scoped(move |conn| {
            Box::pin(async move {
                sqlx::query(
                    r#"
                    INSERT INTO amphora_member_ports (port_id, amphora_id, network_id, created_at)
                    VALUES (?, ?, ?, ?)
                    "#,
                )
                .bind(&binding.port_id)
                .bind(&binding.amphora_id)
                .bind(&binding.network_id)
                .bind(&now)
                .execute(&mut *conn)
                .await?;
                Ok(())
            })
        })
        .await
    }

    async fn delete_member_port(&self, port_id: &str) -> Result<()> {
        let port_id = port_id.to_string();
        self.scoped(move |conn| {
            Box::pin(async move {
                let result = sqlx::query("DELETE FROM amphora_member_ports WHERE port_id = ?")
                    .bind(&port_id)
                    .execute(&mut *conn)
                    .await?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::NotFound(format!("member port {port_id}")));
                }
                Ok(())
            })
        })
        .await
    }

    async fn get_member_port_ids(&self, amphora_id: &str) -> Result<Vec<String>> {
        let amphora_id = amphora_id.to_string();
        self.scoped(move |conn| {
            Box::pin(async move {
                let rows = sqlx::query(
                    "SELECT port_id FROM amphora_member_ports WHERE amphora_id = ? ORDER BY rowid",
                )
                .bind(&amphora_id)
                .fetch_all(&mut *conn)
                .await?;
                rows.iter()
                    .map(|row| row.try_get::<String, _>("port_id").map_err(StoreError::from))
                    .collect()
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AmphoraStatus, Vip};

    fn make_lb() -> LoadBalancer {
        LoadBalancer {
            id: "lb-1".to_string(),
            vip: Vip {
                subnet_id: "vip-subnet".to_string(),
                network_id: "vip-net".to_string(),
                qos_policy_id: Some("qos-1".to_string()),
                ..Default::default()
            },
            amphorae: vec![
                Amphora {
                    id: "amp-2".to_string(),
                    compute_id: Some("compute-2".to_string()),
                    status: AmphoraStatus::Allocated,
                    ..Default::default()
                },
                Amphora {
                    id: "amp-1".to_string(),
                    compute_id: Some("compute-1".to_string()),
                    status: AmphoraStatus::Allocated,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_load_balancer_roundtrip_with_amphorae() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        repo.put_load_balancer(&make_lb()).await.unwrap();

        let lb = repo.get_load_balancer("lb-1").await.unwrap();
        assert_eq!(lb.vip.qos_policy_id.as_deref(), Some("qos-1"));
        let ids: Vec<&str> = lb.amphorae.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["amp-1", "amp-2"]);
        assert_eq!(lb.amphorae[0].load_balancer_id.as_deref(), Some("lb-1"));

        let amp = repo.get_amphora("amp-2").await.unwrap();
        assert_eq!(amp.compute_id.as_deref(), Some("compute-2"));
    }

    #[tokio::test]
    async fn test_put_replaces_amphora_set() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        let mut lb = make_lb();
        repo.put_load_balancer(&lb).await.unwrap();

        lb.amphorae.retain(|a| a.id == "amp-1");
        repo.put_load_balancer(&lb).await.unwrap();

        let stored = repo.get_load_balancer("lb-1").await.unwrap();
        assert_eq!(stored.amphorae.len(), 1);
        assert!(matches!(
            repo.get_amphora("amp-2").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_records_are_not_found() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        assert!(matches!(
            repo.get_load_balancer("nope").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            repo.get_amphora("nope").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            repo.delete_member_port("nope").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_amphora_ports() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        repo.put_load_balancer(&make_lb()).await.unwrap();

        repo.update_amphora_ports("amp-1", Some("vrrp-1"), Some("ha-1"))
            .await
            .unwrap();

        let amp = repo.get_amphora("amp-1").await.unwrap();
        assert_eq!(amp.vrrp_port_id.as_deref(), Some("vrrp-1"));
        assert_eq!(amp.ha_port_id.as_deref(), Some("ha-1"));
    }

    #[tokio::test]
    async fn test_member_port_bindings() {
        let repo = SqliteRepository::in_memory().await.unwrap();
        for (port, net) in [("port-b", "net-1"), ("port-a", "net-2")] {
            repo.create_member_port(&AmphoraMemberPort {
                amphora_id: "amp-1".to_string(),
                port_id: port.to_string(),
                network_id: net.to_string(),
            })
            .await
            .unwrap();
        }

        let ids = repo.get_member_port_ids("amp-1").await.unwrap();
        assert_eq!(ids, vec!["port-b".to_string(), "port-a".to_string()]);

        repo.delete_member_port("port-b").await.unwrap();
        let ids = repo.get_member_port_ids("amp-1").await.unwrap();
        assert_eq!(ids, vec!["port-a".to_string()]);
        assert!(repo.get_member_port_ids("amp-2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_scope_rolls_back() {
        let repo = SqliteRepository::in_memory().await.unwrap();

        let result: Result<()> = repo
            .scoped(|conn| {
                Box::pin(async move {
                    sqlx::query(
                        "INSERT INTO amphora_member_ports (port_id, amphora_id, network_id, created_at) VALUES ('p', 'a', 'n', 'now')",
                    )
                    .execute(&mut *conn)
                    .await?;
                    Err(StoreError::NotFound("forced".to_string()))
                })
            })
            .await;
        assert!(result.is_err());

        assert!(repo.get_member_port_ids("a").await.unwrap().is_empty());
    }
}
