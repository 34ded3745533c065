use crate::{ScheduleDb, backend};
use cronpilot_engine::models::{McpServer, McpServerKind};
use cronpilot_engine::store::StoreError;
use libsql::{Connection, Row, params};
use tracing::warn;
use uuid::Uuid;

const MCP_COLUMNS: &str = "id, name, type, url, command, args, env, headers";

fn validate_server(server: &McpServer) -> Result<(), StoreError> {
    server
        .validate()
        .map_err(|e| StoreError::Invalid(e.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Backend(e.to_string()))
}

/// Malformed JSON columns fall back to empty collections.
fn from_json<T: serde::de::DeserializeOwned + Default>(raw: &str, field: &str, id: &str) -> T {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(server = id, column = field, error = %e, "Ignoring malformed MCP server column");
        T::default()
    })
}

fn write_error(e: libsql::Error, name: &str) -> StoreError {
    let message = e.to_string();
    if message.contains("UNIQUE constraint failed") {
        StoreError::Invalid(format!("mcp server {name:?} already exists"))
    } else {
        StoreError::Backend(message)
    }
}

fn server_from_row(row: &Row) -> Result<McpServer, StoreError> {
    let id: String = row.get(0).map_err(backend)?;
    let kind: String = row.get(2).map_err(backend)?;
    let args: String = row.get(5).map_err(backend)?;
    let env: String = row.get(6).map_err(backend)?;
    let headers: String = row.get(7).map_err(backend)?;
    Ok(McpServer {
        name: row.get(1).map_err(backend)?,
        kind: kind
            .parse::<McpServerKind>()
            .map_err(|e| StoreError::Invalid(format!("mcp server {id}: {e}")))?,
        url: row.get(3).map_err(backend)?,
        command: row.get(4).map_err(backend)?,
        args: from_json(&args, "args", &id),
        env: from_json(&env, "env", &id),
        headers: from_json(&headers, "headers", &id),
        id,
    })
}

async fn collect_servers(
    conn: &Connection,
    sql: &str,
    job_id: Option<&str>,
) -> Result<Vec<McpServer>, StoreError> {
    let mut rows = match job_id {
        Some(job_id) => conn.query(sql, params![job_id]).await,
        None => conn.query(sql, ()).await,
    }
    .map_err(backend)?;

    let mut servers = Vec::new();
    while let Some(row) = rows.next().await.map_err(backend)? {
        servers.push(server_from_row(&row)?);
    }
    Ok(servers)
}

impl ScheduleDb {
    pub async fn list_mcp_servers(&self) -> Result<Vec<McpServer>, StoreError> {
        let conn = self.conn().await;
        collect_servers(
            &conn,
            &format!("SELECT {MCP_COLUMNS} FROM mcp_servers ORDER BY name"),
            None,
        )
        .await
    }

    pub async fn get_mcp_server(&self, id: &str) -> Result<McpServer, StoreError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {MCP_COLUMNS} FROM mcp_servers WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(backend)?;

        match rows.next().await.map_err(backend)? {
            Some(row) => server_from_row(&row),
            None => Err(StoreError::mcp_server_not_found(id)),
        }
    }

    pub async fn create_mcp_server(&self, server: McpServer) -> Result<McpServer, StoreError> {
        validate_server(&server)?;
        let server = McpServer {
            id: Uuid::new_v4().to_string(),
            ..server
        };

        let conn = self.conn().await;
        conn.execute(
            &format!("INSERT INTO mcp_servers ({MCP_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                server.id.as_str(),
                server.name.as_str(),
                server.kind.as_str(),
                server.url.as_str(),
                server.command.as_str(),
                to_json(&server.args)?,
                to_json(&server.env)?,
                to_json(&server.headers)?,
            ],
        )
        .await
        .map_err(|e| write_error(e, &server.name))?;
        Ok(server)
    }

    pub async fn update_mcp_server(&self, server: &McpServer) -> Result<(), StoreError> {
        validate_server(server)?;

        let conn = self.conn().await;
        let affected = conn
            .execute(
                "UPDATE mcp_servers SET name = ?2, type = ?3, url = ?4, command = ?5, \
                 args = ?6, env = ?7, headers = ?8 WHERE id = ?1",
                params![
                    server.id.as_str(),
                    server.name.as_str(),
                    server.kind.as_str(),
                    server.url.as_str(),
                    server.command.as_str(),
                    to_json(&server.args)?,
                    to_json(&server.env)?,
                    to_json(&server.headers)?,
                ],
            )
            .await
            .map_err(|e| write_error(e, &server.name))?;
        if affected == 0 {
            return Err(StoreError::mcp_server_not_found(&server.id));
        }
        Ok(())
    }

    /// Delete a server; it is detached from every job.
    pub async fn delete_mcp_server(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn().await;
        let affected = conn
            .execute("DELETE FROM mcp_servers WHERE id = ?1", params![id])
            .await
            .map_err(backend)?;
        if affected == 0 {
            return Err(StoreError::mcp_server_not_found(id));
        }
        Ok(())
    }

    /// Servers attached to a job, ordered by name.
    pub async fn get_mcp_servers_for_job(&self, job_id: &str) -> Result<Vec<McpServer>, StoreError> {
        let conn = self.conn().await;
        collect_servers(
            &conn,
            "SELECT s.id, s.name, s.type, s.url, s.command, s.args, s.env, s.headers \
             FROM mcp_servers s INNER JOIN job_mcp_servers j ON j.mcp_server_id = s.id \
             WHERE j.job_id = ?1 ORDER BY s.name",
            Some(job_id),
        )
        .await
    }

    /// Replace a job's attached servers atomically.
    pub async fn set_job_mcp_servers(
        &self,
        job_id: &str,
        server_ids: &[String],
    ) -> Result<(), StoreError> {
        let conn = self.conn().await;
        let tx = conn.transaction().await.map_err(backend)?;

        let result = async {
            tx.execute(
                "DELETE FROM job_mcp_servers WHERE job_id = ?1",
                params![job_id],
            )
            .await?;
            for server_id in server_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO job_mcp_servers (job_id, mcp_server_id) VALUES (?1, ?2)",
                    params![job_id, server_id.as_str()],
                )
                .await?;
            }
            Ok::<(), libsql::Error>(())
        }
        .await;

        match result {
            Ok(()) => tx.commit().await.map_err(backend),
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(job_id, error = %rollback, "Rollback failed");
                }
                Err(backend(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::{job, temp_db};
    use cronpilot_engine::models::{McpServer, McpServerKind};
    use cronpilot_engine::store::StoreError;
    use std::collections::BTreeMap;

    fn http(name: &str) -> McpServer {
        McpServer {
            name: name.to_string(),
            kind: McpServerKind::Http,
            url: format!("https://{name}.example.com/mcp"),
            headers: BTreeMap::from([("Authorization".to_string(), "Bearer t".to_string())]),
            ..Default::default()
        }
    }

    fn stdio(name: &str) -> McpServer {
        McpServer {
            name: name.to_string(),
            kind: McpServerKind::Stdio,
            command: "npx".to_string(),
            args: vec!["-y".to_string(), format!("@mcp/{name}")],
            env: BTreeMap::from([("TOKEN".to_string(), "abc".to_string())]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn servers_round_trip_with_collections() {
        let (_dir, db) = temp_db().await;
        let created = db.create_mcp_server(stdio("files")).await.unwrap();
        let web = db.create_mcp_server(http("web")).await.unwrap();

        assert_eq!(db.get_mcp_server(&created.id).await.unwrap(), created);
        assert_eq!(db.list_mcp_servers().await.unwrap(), vec![created, web]);
    }

    #[tokio::test]
    async fn invalid_and_duplicate_servers_are_rejected() {
        let (_dir, db) = temp_db().await;
        let missing_url = McpServer {
            url: String::new(),
            ..http("web")
        };
        assert!(matches!(
            db.create_mcp_server(missing_url).await,
            Err(StoreError::Invalid(_))
        ));

        db.create_mcp_server(http("web")).await.unwrap();
        assert!(matches!(
            db.create_mcp_server(http("web")).await,
            Err(StoreError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn update_and_delete_servers() {
        let (_dir, db) = temp_db().await;
        let mut server = db.create_mcp_server(http("web")).await.unwrap();
        server.url = "https://other.example.com".to_string();
        db.update_mcp_server(&server).await.unwrap();
        assert_eq!(db.get_mcp_server(&server.id).await.unwrap().url, server.url);

        db.delete_mcp_server(&server.id).await.unwrap();
        assert!(db.get_mcp_server(&server.id).await.unwrap_err().is_not_found());
        assert!(db.delete_mcp_server(&server.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn attachments_are_replaced_and_ordered() {
        let (_dir, db) = temp_db().await;
        let job = db.create_job(job("with-tools")).await.unwrap();
        let zed = db.create_mcp_server(http("zed")).await.unwrap();
        let alpha = db.create_mcp_server(stdio("alpha")).await.unwrap();
        let beta = db.create_mcp_server(http("beta")).await.unwrap();

        db.set_job_mcp_servers(&job.id, &[zed.id.clone(), alpha.id.clone()])
            .await
            .unwrap();
        let names: Vec<String> = db
            .get_mcp_servers_for_job(&job.id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, ["alpha", "zed"]);

        db.set_job_mcp_servers(&job.id, &[beta.id.clone()])
            .await
            .unwrap();
        assert_eq!(db.get_mcp_servers_for_job(&job.id).await.unwrap(), vec![beta]);
    }

    #[tokio::test]
    async fn failed_attachment_keeps_previous_set() {
        let (_dir, db) = temp_db().await;
        let job = db.create_job(job("atomic")).await.unwrap();
        let web = db.create_mcp_server(http("web")).await.unwrap();
        db.set_job_mcp_servers(&job.id, &[web.id.clone()])
            .await
            .unwrap();

        let result = db
            .set_job_mcp_servers(&job.id, &["no-such-server".to_string()])
            .await;

        assert!(result.is_err());
        assert_eq!(
            db.get_mcp_servers_for_job(&job.id).await.unwrap(),
            vec![web]
        );
    }

    #[tokio::test]
    async fn unknown_stored_type_is_invalid() {
        let (_dir, db) = temp_db().await;
        let job = db.create_job(job("legacy")).await.unwrap();
        let web = db.create_mcp_server(http("web")).await.unwrap();
        db.set_job_mcp_servers(&job.id, &[web.id.clone()])
            .await
            .unwrap();
        db.conn()
            .await
            .execute(
                "UPDATE mcp_servers SET type = 'carrier-pigeon' WHERE id = ?1",
                libsql::params![web.id.as_str()],
            )
            .await
            .unwrap();

        let err = db.get_mcp_servers_for_job(&job.id).await.unwrap_err();
        let StoreError::Invalid(message) = err else {
            panic!("expected invalid, got {err:?}");
        };
        assert!(message.contains("carrier-pigeon"), "{message}");
    }

    #[tokio::test]
    async fn deleting_a_server_detaches_it() {
        let (_dir, db) = temp_db().await;
        let job = db.create_job(job("detach")).await.unwrap();
        let web = db.create_mcp_server(http("web")).await.unwrap();
        db.set_job_mcp_servers(&job.id, &[web.id.clone()])
            .await
            .unwrap();

        db.delete_mcp_server(&web.id).await.unwrap();

        assert!(db.get_mcp_servers_for_job(&job.id).await.unwrap().is_empty());
    }
}
