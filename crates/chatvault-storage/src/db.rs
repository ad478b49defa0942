use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::watch;

use chatvault_core::error::VaultError;
use chatvault_core::types::{
    Attachment, Channel, Download, DownloadItem, Embed, Message, Reaction, Server, ServerKind,
    Statistics, User,
};

use crate::filter::{MessageFilter, RemovalMode};
use crate::multimap::MultiMap;
use crate::pool::ConnectionPool;

const SCHEMA_VERSION_CURRENT: i64 = 1;

/// The storage engine. Every call leases one pool connection for its
/// duration, so concurrent callers are safe without a global lock.
pub struct Database {
    pool: ConnectionPool,
    stats: watch::Sender<Statistics>,
}

/// Runs a synchronous database closure on the blocking thread pool, for
/// async collaborators that must not stall their executor.
pub async fn call_blocking<T, F>(db: Arc<Database>, f: F) -> Result<T, VaultError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> Result<T, VaultError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(db.as_ref()))
        .await
        .map_err(|e| VaultError::Task(format!("database task join error: {e}")))?
}

fn create_schema(conn: &Connection) -> Result<(), VaultError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS servers (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            type TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS channels (
            id INTEGER PRIMARY KEY,
            server INTEGER NOT NULL,
            name TEXT NOT NULL,
            parent_id INTEGER,
            position INTEGER,
            topic TEXT,
            nsfw INTEGER
        );

        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            avatar_url TEXT,
            discriminator TEXT
        );

        CREATE TABLE IF NOT EXISTS messages (
            message_id INTEGER PRIMARY KEY,
            sender_id INTEGER NOT NULL,
            channel_id INTEGER NOT NULL,
            text TEXT NOT NULL,
            timestamp INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_channel_timestamp
            ON messages(channel_id, timestamp);

        CREATE TABLE IF NOT EXISTS edit_timestamps (
            message_id INTEGER PRIMARY KEY,
            edit_timestamp INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS replied_to (
            message_id INTEGER PRIMARY KEY,
            replied_to_id INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS attachments (
            message_id INTEGER NOT NULL,
            attachment_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            type TEXT,
            url TEXT NOT NULL,
            size INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_attachments_message
            ON attachments(message_id);

        CREATE TABLE IF NOT EXISTS embeds (
            message_id INTEGER NOT NULL,
            json TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_embeds_message
            ON embeds(message_id);

        CREATE TABLE IF NOT EXISTS reactions (
            message_id INTEGER NOT NULL,
            emoji_id INTEGER,
            emoji_name TEXT,
            emoji_flags INTEGER NOT NULL,
            count INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_reactions_message
            ON reactions(message_id);

        CREATE TABLE IF NOT EXISTS downloads (
            url TEXT NOT NULL PRIMARY KEY,
            status INTEGER NOT NULL,
            blob BLOB
        );",
    )?;
    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<i64, VaultError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS db_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        [],
    )?;
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM db_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|s| s.parse::<i64>().ok()).unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i64) -> Result<(), VaultError> {
    conn.execute(
        "INSERT INTO db_meta(key, value) VALUES('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![version.to_string()],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL,
            note TEXT
        )",
        [],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO schema_migrations(version, applied_at, note)
         VALUES(?1, ?2, ?3)",
        params![version, chrono::Utc::now().to_rfc3339(), "applied"],
    )?;
    Ok(())
}

fn apply_schema_migrations(conn: &Connection) -> Result<(), VaultError> {
    let mut version = get_schema_version(conn)?;
    if version < 1 {
        set_schema_version(conn, 1)?;
        version = 1;
    }
    if version != SCHEMA_VERSION_CURRENT {
        set_schema_version(conn, SCHEMA_VERSION_CURRENT)?;
    }
    Ok(())
}

impl Database {
    pub fn open(path: &Path, pool_size: usize) -> Result<Self, VaultError> {
        let pool = ConnectionPool::open(path, pool_size)?;
        let (stats, _) = watch::channel(Statistics::default());
        let db = Self { pool, stats };

        let lease = db.pool.take()?;
        create_schema(&lease)?;
        apply_schema_migrations(&lease)?;
        db.update_server_statistics(&lease)?;
        db.update_channel_statistics(&lease)?;
        db.update_user_statistics(&lease)?;
        db.update_message_statistics(&lease)?;
        drop(lease);

        Ok(db)
    }

    /// Read-only subscription to the live row-count snapshot.
    pub fn statistics(&self) -> watch::Receiver<Statistics> {
        self.stats.subscribe()
    }

    pub fn dispose(&self) {
        self.pool.dispose();
    }

    pub fn add_server(&self, server: &Server) -> Result<(), VaultError> {
        let lease = self.pool.take()?;
        lease.execute(
            "INSERT INTO servers (id, name, type) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                type = excluded.type",
            params![server.id, server.name, server.kind.as_str()],
        )?;
        self.update_server_statistics(&lease)
    }

    pub fn get_all_servers(&self) -> Result<Vec<Server>, VaultError> {
        let lease = self.pool.take()?;
        let mut stmt = lease.prepare("SELECT id, name, type FROM servers")?;
        let servers = stmt
            .query_map([], |row| {
                Ok(Server {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    kind: ServerKind::parse(&row.get::<_, String>(2)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(servers)
    }

    pub fn add_channel(&self, channel: &Channel) -> Result<(), VaultError> {
        let lease = self.pool.take()?;
        lease.execute(
            "INSERT INTO channels (id, server, name, parent_id, position, topic, nsfw)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                server = excluded.server,
                name = excluded.name,
                parent_id = excluded.parent_id,
                position = excluded.position,
                topic = excluded.topic,
                nsfw = excluded.nsfw",
            params![
                channel.id,
                channel.server,
                channel.name,
                channel.parent_id,
                channel.position,
                channel.topic,
                channel.nsfw,
            ],
        )?;
        self.update_channel_statistics(&lease)
    }

    pub fn get_all_channels(&self) -> Result<Vec<Channel>, VaultError> {
        let lease = self.pool.take()?;
        let mut stmt = lease.prepare(
            "SELECT id, server, name, parent_id, position, topic, nsfw FROM channels",
        )?;
        let channels = stmt
            .query_map([], |row| {
                Ok(Channel {
                    id: row.get(0)?,
                    server: row.get(1)?,
                    name: row.get(2)?,
                    parent_id: row.get(3)?,
                    position: row.get(4)?,
                    topic: row.get(5)?,
                    nsfw: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(channels)
    }

    pub fn add_users(&self, users: &[User]) -> Result<(), VaultError> {
        let mut lease = self.pool.take()?;
        let tx = lease.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO users (id, name, avatar_url, discriminator)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    avatar_url = excluded.avatar_url,
                    discriminator = excluded.discriminator",
            )?;
            for user in users {
                stmt.execute(params![
                    user.id,
                    user.name,
                    user.avatar_url,
                    user.discriminator
                ])?;
            }
        }
        tx.commit()?;
        self.update_user_statistics(&lease)
    }

    pub fn get_all_users(&self) -> Result<Vec<User>, VaultError> {
        let lease = self.pool.take()?;
        let mut stmt =
            lease.prepare("SELECT id, name, avatar_url, discriminator FROM users")?;
        let users = stmt
            .query_map([], |row| {
                Ok(User {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    avatar_url: row.get(2)?,
                    discriminator: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    /// Batched, transactional message ingest. Each message row is upserted
    /// and its child rows are replaced wholesale with the ones supplied in
    /// this call, so a re-ingested id never keeps children from a prior
    /// version. All messages in the batch commit or roll back together.
    pub fn add_messages(&self, messages: &[Message]) -> Result<(), VaultError> {
        let mut lease = self.pool.take()?;
        let tx = lease.transaction()?;
        {
            let mut message_stmt = tx.prepare(
                "INSERT INTO messages (message_id, sender_id, channel_id, text, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(message_id) DO UPDATE SET
                    sender_id = excluded.sender_id,
                    channel_id = excluded.channel_id,
                    text = excluded.text,
                    timestamp = excluded.timestamp",
            )?;

            let mut delete_edit_timestamp =
                tx.prepare("DELETE FROM edit_timestamps WHERE message_id = ?1")?;
            let mut delete_replied_to =
                tx.prepare("DELETE FROM replied_to WHERE message_id = ?1")?;
            let mut delete_attachments =
                tx.prepare("DELETE FROM attachments WHERE message_id = ?1")?;
            let mut delete_embeds = tx.prepare("DELETE FROM embeds WHERE message_id = ?1")?;
            let mut delete_reactions =
                tx.prepare("DELETE FROM reactions WHERE message_id = ?1")?;

            let mut edit_timestamp_stmt = tx.prepare(
                "INSERT INTO edit_timestamps (message_id, edit_timestamp) VALUES (?1, ?2)",
            )?;
            let mut replied_to_stmt = tx
                .prepare("INSERT INTO replied_to (message_id, replied_to_id) VALUES (?1, ?2)")?;
            let mut attachment_stmt = tx.prepare(
                "INSERT INTO attachments (message_id, attachment_id, name, type, url, size)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            let mut embed_stmt =
                tx.prepare("INSERT INTO embeds (message_id, json) VALUES (?1, ?2)")?;
            let mut reaction_stmt = tx.prepare(
                "INSERT INTO reactions (message_id, emoji_id, emoji_name, emoji_flags, count)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;

            for message in messages {
                message_stmt.execute(params![
                    message.id,
                    message.sender,
                    message.channel,
                    message.text,
                    message.timestamp,
                ])?;

                delete_edit_timestamp.execute([message.id])?;
                delete_replied_to.execute([message.id])?;
                delete_attachments.execute([message.id])?;
                delete_embeds.execute([message.id])?;
                delete_reactions.execute([message.id])?;

                if let Some(edit_timestamp) = message.edit_timestamp {
                    edit_timestamp_stmt.execute(params![message.id, edit_timestamp])?;
                }

                if let Some(replied_to_id) = message.replied_to_id {
                    replied_to_stmt.execute(params![message.id, replied_to_id])?;
                }

                for attachment in &message.attachments {
                    attachment_stmt.execute(params![
                        message.id,
                        attachment.id,
                        attachment.name,
                        attachment.kind,
                        attachment.url,
                        attachment.size,
                    ])?;
                }

                for embed in &message.embeds {
                    embed_stmt.execute(params![message.id, embed.json])?;
                }

                for reaction in &message.reactions {
                    reaction_stmt.execute(params![
                        message.id,
                        reaction.emoji_id,
                        reaction.emoji_name,
                        reaction.emoji_flags,
                        reaction.count,
                    ])?;
                }
            }
        }
        tx.commit()?;
        self.update_message_statistics(&lease)
    }

    pub fn count_messages(&self, filter: Option<&MessageFilter>) -> Result<i64, VaultError> {
        let lease = self.pool.take()?;
        let sql = format!(
            "SELECT COUNT(*) FROM messages{}",
            filter_fragment(filter, None)
        );
        let count = lease.query_row(&sql, [], |row| row.get(0))?;
        Ok(count)
    }

    /// Hydrates matching messages with their side relations and children.
    /// Children come from one full scan per child table grouped into
    /// id-keyed multi-maps, instead of one query per child per message.
    pub fn get_messages(&self, filter: Option<&MessageFilter>) -> Result<Vec<Message>, VaultError> {
        let lease = self.pool.take()?;

        let mut attachments = get_all_attachments(&lease)?;
        let mut embeds = get_all_embeds(&lease)?;
        let mut reactions = get_all_reactions(&lease)?;

        let sql = format!(
            "SELECT m.message_id, m.sender_id, m.channel_id, m.text, m.timestamp, \
                    et.edit_timestamp, rt.replied_to_id
             FROM messages m
             LEFT JOIN edit_timestamps et ON m.message_id = et.message_id
             LEFT JOIN replied_to rt ON m.message_id = rt.message_id{}",
            filter_fragment(filter, Some("m"))
        );

        let mut stmt = lease.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<i64>>(5)?,
                row.get::<_, Option<i64>>(6)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (id, sender, channel, text, timestamp, edit_timestamp, replied_to_id) = row?;
            messages.push(Message {
                id,
                sender,
                channel,
                text,
                timestamp,
                edit_timestamp,
                replied_to_id,
                attachments: attachments.take(&id),
                embeds: embeds.take(&id),
                reactions: reactions.take(&id),
            });
        }
        Ok(messages)
    }

    /// Deletes messages matching the filter (or its inverse for
    /// `KeepMatching`). An empty compiled predicate makes this a no-op so a
    /// degenerate filter can never wipe the table.
    pub fn remove_messages(
        &self,
        filter: &MessageFilter,
        mode: RemovalMode,
    ) -> Result<(), VaultError> {
        let clause = filter.where_clause(None, mode == RemovalMode::KeepMatching);
        if clause.is_empty() {
            return Ok(());
        }

        let lease = self.pool.take()?;
        lease.execute(&format!("DELETE FROM messages{clause}"), [])?;
        self.update_message_statistics(&lease)
    }

    pub fn add_download(&self, download: &Download) -> Result<(), VaultError> {
        let lease = self.pool.take()?;
        lease.execute(
            "INSERT INTO downloads (url, status, blob) VALUES (?1, ?2, ?3)
             ON CONFLICT(url) DO UPDATE SET
                status = excluded.status,
                blob = excluded.blob",
            params![download.url, download.status, download.data],
        )?;
        Ok(())
    }

    pub fn get_download(&self, url: &str) -> Result<Option<Download>, VaultError> {
        let lease = self.pool.take()?;
        let download = lease
            .query_row(
                "SELECT url, status, blob FROM downloads WHERE url = ?1",
                params![url],
                |row| {
                    Ok(Download {
                        url: row.get(0)?,
                        status: row.get(1)?,
                        data: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(download)
    }

    /// Distinct attachment urls with no recorded successful download yet.
    pub fn generate_download_items(&self) -> Result<Vec<DownloadItem>, VaultError> {
        let lease = self.pool.take()?;
        let mut stmt = lease.prepare(
            "SELECT DISTINCT a.url FROM attachments a
             WHERE a.url NOT IN (SELECT d.url FROM downloads d WHERE d.status = 200)",
        )?;
        let items = stmt
            .query_map([], |row| Ok(DownloadItem { url: row.get(0)? }))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    fn update_server_statistics(&self, conn: &Connection) -> Result<(), VaultError> {
        let count = count_table(conn, "SELECT COUNT(*) FROM servers")?;
        self.stats.send_modify(|stats| stats.total_servers = count);
        Ok(())
    }

    fn update_channel_statistics(&self, conn: &Connection) -> Result<(), VaultError> {
        let count = count_table(conn, "SELECT COUNT(*) FROM channels")?;
        self.stats.send_modify(|stats| stats.total_channels = count);
        Ok(())
    }

    fn update_user_statistics(&self, conn: &Connection) -> Result<(), VaultError> {
        let count = count_table(conn, "SELECT COUNT(*) FROM users")?;
        self.stats.send_modify(|stats| stats.total_users = count);
        Ok(())
    }

    fn update_message_statistics(&self, conn: &Connection) -> Result<(), VaultError> {
        let count = count_table(conn, "SELECT COUNT(*) FROM messages")?;
        self.stats.send_modify(|stats| stats.total_messages = count);
        Ok(())
    }
}

fn filter_fragment(filter: Option<&MessageFilter>, alias: Option<&str>) -> String {
    filter.map_or_else(String::new, |filter| filter.where_clause(alias, false))
}

fn count_table(conn: &Connection, sql: &str) -> Result<i64, VaultError> {
    Ok(conn.query_row(sql, [], |row| row.get(0))?)
}

fn get_all_attachments(conn: &Connection) -> Result<MultiMap<i64, Attachment>, VaultError> {
    let mut stmt =
        conn.prepare("SELECT message_id, attachment_id, name, type, url, size FROM attachments")?;
    let mut map = MultiMap::new();
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            Attachment {
                id: row.get(1)?,
                name: row.get(2)?,
                kind: row.get(3)?,
                url: row.get(4)?,
                size: row.get(5)?,
            },
        ))
    })?;
    for row in rows {
        let (message_id, attachment) = row?;
        map.add(message_id, attachment);
    }
    Ok(map)
}

fn get_all_embeds(conn: &Connection) -> Result<MultiMap<i64, Embed>, VaultError> {
    let mut stmt = conn.prepare("SELECT message_id, json FROM embeds")?;
    let mut map = MultiMap::new();
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, i64>(0)?, Embed { json: row.get(1)? }))
    })?;
    for row in rows {
        let (message_id, embed) = row?;
        map.add(message_id, embed);
    }
    Ok(map)
}

fn get_all_reactions(conn: &Connection) -> Result<MultiMap<i64, Reaction>, VaultError> {
    let mut stmt =
        conn.prepare("SELECT message_id, emoji_id, emoji_name, emoji_flags, count FROM reactions")?;
    let mut map = MultiMap::new();
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            Reaction {
                emoji_id: row.get(1)?,
                emoji_name: row.get(2)?,
                emoji_flags: row.get(3)?,
                count: row.get(4)?,
            },
        ))
    })?;
    for row in rows {
        let (message_id, reaction) = row?;
        map.add(message_id, reaction);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn test_db() -> (Database, PathBuf) {
        let dir = std::env::temp_dir().join(format!("chatvault_test_{}", uuid::Uuid::new_v4()));
        let db = Database::open(&dir.join("history.db"), 2).unwrap();
        (db, dir)
    }

    fn cleanup(dir: &Path) {
        let _ = std::fs::remove_dir_all(dir);
    }

    fn message(id: i64, sender: i64, channel: i64, text: &str, timestamp: i64) -> Message {
        Message {
            id,
            sender,
            channel,
            text: text.into(),
            timestamp,
            edit_timestamp: None,
            replied_to_id: None,
            attachments: Vec::new(),
            embeds: Vec::new(),
            reactions: Vec::new(),
        }
    }

    fn attachment(id: i64, url: &str) -> Attachment {
        Attachment {
            id,
            name: format!("file_{id}.png"),
            kind: Some("image/png".into()),
            url: url.into(),
            size: 1024,
        }
    }

    fn channel_filter(ids: &[i64]) -> MessageFilter {
        MessageFilter {
            channel_ids: Some(ids.iter().copied().collect::<HashSet<i64>>()),
            ..MessageFilter::new()
        }
    }

    #[test]
    fn test_schema_version_is_tracked() {
        let (db, dir) = test_db();
        let lease = db.pool.take().unwrap();
        let version: String = lease
            .query_row(
                "SELECT value FROM db_meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION_CURRENT.to_string());
        drop(lease);
        cleanup(&dir);
    }

    #[test]
    fn test_readding_server_overwrites_single_row() {
        let (db, dir) = test_db();
        db.add_server(&Server {
            id: 1,
            name: "old".into(),
            kind: ServerKind::Server,
        })
        .unwrap();
        db.add_server(&Server {
            id: 1,
            name: "new".into(),
            kind: ServerKind::Group,
        })
        .unwrap();

        let servers = db.get_all_servers().unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "new");
        assert_eq!(servers[0].kind, ServerKind::Group);
        cleanup(&dir);
    }

    #[test]
    fn test_readding_channel_overwrites_optional_fields() {
        let (db, dir) = test_db();
        db.add_channel(&Channel {
            id: 100,
            server: 1,
            name: "general".into(),
            parent_id: Some(99),
            position: Some(0),
            topic: Some("hello".into()),
            nsfw: Some(false),
        })
        .unwrap();
        db.add_channel(&Channel {
            id: 100,
            server: 1,
            name: "general-renamed".into(),
            parent_id: None,
            position: Some(3),
            topic: None,
            nsfw: Some(true),
        })
        .unwrap();

        let channels = db.get_all_channels().unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name, "general-renamed");
        assert_eq!(channels[0].parent_id, None);
        assert_eq!(channels[0].position, Some(3));
        assert_eq!(channels[0].topic, None);
        assert_eq!(channels[0].nsfw, Some(true));
        cleanup(&dir);
    }

    #[test]
    fn test_add_users_batch_upserts() {
        let (db, dir) = test_db();
        db.add_users(&[
            User {
                id: 10,
                name: "alice".into(),
                avatar_url: Some("http://x/a.png".into()),
                discriminator: Some("0001".into()),
            },
            User {
                id: 11,
                name: "bob".into(),
                avatar_url: None,
                discriminator: None,
            },
        ])
        .unwrap();
        db.add_users(&[User {
            id: 10,
            name: "alice2".into(),
            avatar_url: None,
            discriminator: Some("0002".into()),
        }])
        .unwrap();

        let mut users = db.get_all_users().unwrap();
        users.sort_by_key(|user| user.id);
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].name, "alice2");
        assert_eq!(users[0].avatar_url, None);
        assert_eq!(users[1].name, "bob");
        cleanup(&dir);
    }

    #[test]
    fn test_reingesting_message_replaces_children_exactly() {
        let (db, dir) = test_db();
        let mut first = message(1, 10, 100, "hi", 1000);
        first.edit_timestamp = Some(1500);
        first.attachments = vec![attachment(5, "http://x/a.png"), attachment(6, "http://x/b.png")];
        first.reactions = vec![Reaction {
            emoji_id: None,
            emoji_name: Some("👍".into()),
            emoji_flags: 0,
            count: 2,
        }];
        db.add_messages(&[first]).unwrap();

        let mut second = message(1, 10, 100, "hi (edited)", 1000);
        second.attachments = vec![attachment(7, "http://x/c.png")];
        db.add_messages(&[second]).unwrap();

        let messages = db.get_messages(None).unwrap();
        assert_eq!(messages.len(), 1);
        let stored = &messages[0];
        assert_eq!(stored.text, "hi (edited)");
        assert_eq!(stored.edit_timestamp, None);
        assert_eq!(stored.attachments.len(), 1);
        assert_eq!(stored.attachments[0].url, "http://x/c.png");
        assert!(stored.reactions.is_empty());
        cleanup(&dir);
    }

    #[test]
    fn test_get_messages_hydrates_side_tables_and_children() {
        let (db, dir) = test_db();
        let mut msg = message(2, 11, 101, "reply", 2000);
        msg.edit_timestamp = Some(2500);
        msg.replied_to_id = Some(1);
        msg.embeds = vec![Embed {
            json: serde_json::json!({"title": "embed"}).to_string(),
        }];
        msg.reactions = vec![Reaction {
            emoji_id: Some(77),
            emoji_name: None,
            emoji_flags: 1,
            count: 3,
        }];
        db.add_messages(&[message(1, 10, 100, "root", 1000), msg]).unwrap();

        let mut messages = db.get_messages(None).unwrap();
        messages.sort_by_key(|message| message.id);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].edit_timestamp, None);
        assert_eq!(messages[0].replied_to_id, None);

        let reply = &messages[1];
        assert_eq!(reply.edit_timestamp, Some(2500));
        assert_eq!(reply.replied_to_id, Some(1));
        assert_eq!(reply.embeds.len(), 1);
        assert!(reply.embeds[0].json.contains("embed"));
        assert_eq!(reply.reactions[0].emoji_id, Some(77));
        assert_eq!(reply.reactions[0].count, 3);
        cleanup(&dir);
    }

    #[test]
    fn test_count_and_get_share_the_same_filter() {
        let (db, dir) = test_db();
        db.add_messages(&[
            message(1, 10, 100, "a", 1000),
            message(2, 10, 100, "b", 2000),
            message(3, 11, 200, "c", 3000),
        ])
        .unwrap();

        assert_eq!(db.count_messages(None).unwrap(), 3);

        let filter = channel_filter(&[100]);
        assert_eq!(db.count_messages(Some(&filter)).unwrap(), 2);
        let matching = db.get_messages(Some(&filter)).unwrap();
        assert_eq!(matching.len(), 2);
        assert!(matching.iter().all(|message| message.channel == 100));

        let ranged = MessageFilter {
            timestamp_start: Some(1500),
            timestamp_end: Some(2500),
            ..MessageFilter::new()
        };
        assert_eq!(db.count_messages(Some(&ranged)).unwrap(), 1);
        cleanup(&dir);
    }

    #[test]
    fn test_remove_matching_deletes_exactly_the_matches() {
        let (db, dir) = test_db();
        db.add_messages(&[
            message(1, 10, 100, "a", 1000),
            message(2, 10, 200, "b", 2000),
            message(3, 11, 200, "c", 3000),
        ])
        .unwrap();

        let filter = channel_filter(&[200]);
        db.remove_messages(&filter, RemovalMode::RemoveMatching).unwrap();

        assert_eq!(db.count_messages(Some(&filter)).unwrap(), 0);
        assert_eq!(db.count_messages(None).unwrap(), 1);
        cleanup(&dir);
    }

    #[test]
    fn test_keep_matching_deletes_the_complement() {
        let (db, dir) = test_db();
        db.add_messages(&[
            message(1, 10, 100, "a", 1000),
            message(2, 10, 200, "b", 2000),
            message(3, 11, 300, "c", 3000),
        ])
        .unwrap();

        let filter = channel_filter(&[100]);
        db.remove_messages(&filter, RemovalMode::KeepMatching).unwrap();

        assert_eq!(db.count_messages(None).unwrap(), 1);
        assert_eq!(db.count_messages(Some(&filter)).unwrap(), 1);
        cleanup(&dir);
    }

    #[test]
    fn test_empty_filter_never_deletes() {
        let (db, dir) = test_db();
        db.add_messages(&[message(1, 10, 100, "a", 1000)]).unwrap();

        db.remove_messages(&MessageFilter::new(), RemovalMode::RemoveMatching)
            .unwrap();
        db.remove_messages(
            &MessageFilter {
                channel_ids: Some(HashSet::new()),
                ..MessageFilter::new()
            },
            RemovalMode::RemoveMatching,
        )
        .unwrap();

        assert_eq!(db.count_messages(None).unwrap(), 1);
        cleanup(&dir);
    }

    #[test]
    fn test_download_items_skip_already_successful_urls() {
        let (db, dir) = test_db();
        let mut msg = message(1, 10, 100, "hi", 1000);
        msg.attachments = vec![attachment(5, "http://x/a.png")];
        db.add_messages(&[msg]).unwrap();

        let items = db.generate_download_items().unwrap();
        assert_eq!(items, vec![DownloadItem::new("http://x/a.png")]);

        db.add_download(&Download::failure("http://x/a.png".into(), 404))
            .unwrap();
        assert_eq!(db.generate_download_items().unwrap().len(), 1);

        db.add_download(&Download::success("http://x/a.png".into(), vec![1, 2]))
            .unwrap();
        assert!(db.generate_download_items().unwrap().is_empty());
        cleanup(&dir);
    }

    #[test]
    fn test_download_items_are_distinct_across_messages() {
        let (db, dir) = test_db();
        let mut first = message(1, 10, 100, "a", 1000);
        first.attachments = vec![attachment(5, "http://x/shared.png")];
        let mut second = message(2, 10, 100, "b", 2000);
        second.attachments = vec![
            attachment(6, "http://x/shared.png"),
            attachment(7, "http://x/other.png"),
        ];
        db.add_messages(&[first, second]).unwrap();

        let mut urls: Vec<String> = db
            .generate_download_items()
            .unwrap()
            .into_iter()
            .map(|item| item.url)
            .collect();
        urls.sort();
        assert_eq!(urls, vec!["http://x/other.png", "http://x/shared.png"]);
        cleanup(&dir);
    }

    #[test]
    fn test_readding_download_overwrites_by_url() {
        let (db, dir) = test_db();
        db.add_download(&Download::failure("http://x/a.png".into(), 500))
            .unwrap();
        db.add_download(&Download::success("http://x/a.png".into(), vec![9]))
            .unwrap();

        let stored = db.get_download("http://x/a.png").unwrap().unwrap();
        assert_eq!(stored.status, Download::STATUS_SUCCESS);
        assert_eq!(stored.data, Some(vec![9]));
        assert!(db.get_download("http://x/missing.png").unwrap().is_none());
        cleanup(&dir);
    }

    #[test]
    fn test_statistics_follow_each_mutation_kind() {
        let (db, dir) = test_db();
        let stats = db.statistics();
        assert_eq!(*stats.borrow(), Statistics::default());

        db.add_server(&Server {
            id: 1,
            name: "s".into(),
            kind: ServerKind::Server,
        })
        .unwrap();
        db.add_channel(&Channel {
            id: 100,
            server: 1,
            name: "c".into(),
            parent_id: None,
            position: None,
            topic: None,
            nsfw: None,
        })
        .unwrap();
        db.add_users(&[User {
            id: 10,
            name: "u".into(),
            avatar_url: None,
            discriminator: None,
        }])
        .unwrap();
        db.add_messages(&[message(1, 10, 100, "a", 1000), message(2, 10, 100, "b", 2000)])
            .unwrap();

        let snapshot = *stats.borrow();
        assert_eq!(snapshot.total_servers, 1);
        assert_eq!(snapshot.total_channels, 1);
        assert_eq!(snapshot.total_users, 1);
        assert_eq!(snapshot.total_messages, 2);

        db.remove_messages(&channel_filter(&[100]), RemovalMode::RemoveMatching)
            .unwrap();
        assert_eq!(stats.borrow().total_messages, 0);
        cleanup(&dir);
    }

    #[test]
    fn test_statistics_survive_reopen() {
        let dir = std::env::temp_dir().join(format!("chatvault_test_{}", uuid::Uuid::new_v4()));
        let path = dir.join("history.db");
        {
            let db = Database::open(&path, 1).unwrap();
            db.add_messages(&[message(1, 10, 100, "a", 1000)]).unwrap();
            db.dispose();
        }

        let db = Database::open(&path, 1).unwrap();
        assert_eq!(db.statistics().borrow().total_messages, 1);
        cleanup(&dir);
    }

    #[test]
    fn test_operations_fail_after_dispose() {
        let (db, dir) = test_db();
        db.dispose();
        let err = db.count_messages(None).unwrap_err();
        assert!(matches!(err, VaultError::Disposed(_)));
        cleanup(&dir);
    }

    #[tokio::test]
    async fn test_call_blocking_bridges_to_sync_calls() {
        let (db, dir) = test_db();
        let db = Arc::new(db);
        db.add_messages(&[message(1, 10, 100, "a", 1000)]).unwrap();

        let count = call_blocking(Arc::clone(&db), |db| db.count_messages(None))
            .await
            .unwrap();
        assert_eq!(count, 1);
        cleanup(&dir);
    }
}
