use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::StoreError;
use crate::parser::Story;

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn fmt_date(d: NaiveDateTime) -> String {
    d.format(DATE_FORMAT).to_string()
}

fn now_text() -> String {
    fmt_date(Utc::now().naive_utc())
}

#[derive(Default)]
struct Ledger {
    gets: u64,
    puts: u64,
    next_ticket: u64,
    /// Label of every connection currently checked out.
    outstanding: BTreeMap<u64, String>,
}

/// Pooled SQLite store shared by the harvest and media workers.
/// `get` waits at most `checkout_timeout` for a free connection.
pub struct Store {
    pool: r2d2::Pool<SqliteConnectionManager>,
    ledger: Mutex<Ledger>,
}

/// A checked-out connection. Goes back to the pool on drop, on every path.
pub struct PooledConnection<'a> {
    store: &'a Store,
    conn: r2d2::PooledConnection<SqliteConnectionManager>,
    ticket: u64,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        let mut ledger = self.store.lock();
        ledger.puts += 1;
        ledger.outstanding.remove(&self.ticket);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolReport {
    pub gets: u64,
    pub puts: u64,
    pub outstanding: Vec<String>,
}

impl fmt::Display for PoolReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "get/put: {}/{}", self.gets, self.puts)?;
        for label in &self.outstanding {
            write!(f, "\n  {label}")?;
        }
        Ok(())
    }
}

impl Store {
    pub fn open(path: &Path, size: usize, checkout_timeout: Duration) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
            conn.busy_timeout(Duration::from_secs(10))
        });
        let pool = r2d2::Pool::builder()
            .max_size(size.clamp(1, u32::MAX as usize) as u32)
            .min_idle(Some(0))
            .connection_timeout(checkout_timeout)
            .build(manager)?;
        let store = Self {
            pool,
            ledger: Mutex::new(Ledger::default()),
        };
        // fail fast on a bad path
        store.get("Store::open")?;
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Errors with `StoreError::Pool` when no connection frees up in time.
    pub fn get(&self, label: &str) -> Result<PooledConnection<'_>> {
        let conn = self.pool.get()?;
        let mut ledger = self.lock();
        ledger.gets += 1;
        ledger.next_ticket += 1;
        let ticket = ledger.next_ticket;
        ledger.outstanding.insert(ticket, format!("[{ticket}] {label}"));
        Ok(PooledConnection {
            store: self,
            conn,
            ticket,
        })
    }

    pub fn report(&self) -> PoolReport {
        let ledger = self.lock();
        PoolReport {
            gets: ledger.gets,
            puts: ledger.puts,
            outstanding: ledger.outstanding.values().cloned().collect(),
        }
    }

    pub fn init_schema(&self) -> Result<()> {
        let conn = self.get("Store::init_schema")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS targets (
                id           INTEGER PRIMARY KEY,
                name         TEXT UNIQUE NOT NULL,
                last_visited TEXT,
                created_at   TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS stories (
                id         TEXT PRIMARY KEY,
                target_id  INTEGER REFERENCES targets(id),
                run_id     TEXT NOT NULL,
                story_date TEXT,
                kind       TEXT NOT NULL,
                json       TEXT NOT NULL,
                likes      INTEGER NOT NULL DEFAULT 0,
                comments   INTEGER NOT NULL DEFAULT 0,
                shares     INTEGER NOT NULL DEFAULT 0,
                snapshot   BLOB,
                html       TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_stories_run ON stories(run_id);
            CREATE INDEX IF NOT EXISTS idx_stories_target ON stories(target_id);

            -- Pages, posts and comments from the remote API
            CREATE TABLE IF NOT EXISTS objects (
                id          TEXT PRIMARY KEY,
                parent_id   TEXT,
                page_id     TEXT,
                post_id     TEXT,
                kind        TEXT NOT NULL CHECK(kind IN ('Page','Post','Comm')),
                created     TEXT,
                modified    TEXT,
                permalink   TEXT,
                api_type    TEXT,
                status_type TEXT,
                name        TEXT,
                caption     TEXT,
                description TEXT,
                story       TEXT,
                message     TEXT,
                user_id     TEXT,
                likes       INTEGER NOT NULL DEFAULT 0,
                shares      INTEGER NOT NULL DEFAULT 0,
                place       TEXT,
                tags        TEXT,
                with_tags   TEXT,
                properties  TEXT,
                raw         TEXT,
                created_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_objects_parent ON objects(parent_id);
            CREATE INDEX IF NOT EXISTS idx_objects_kind ON objects(kind);

            CREATE TABLE IF NOT EXISTS users (
                id           TEXT PRIMARY KEY,
                name         TEXT,
                last_message TEXT,
                created_at   TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS media (
                id          INTEGER PRIMARY KEY,
                owner_id    TEXT NOT NULL,
                kind        TEXT,
                title       TEXT,
                description TEXT,
                tags        TEXT,
                target      TEXT,
                media_json  TEXT,
                src         TEXT,
                width       INTEGER,
                height      INTEGER,
                status      TEXT NOT NULL DEFAULT 'pending'
                            CHECK(status IN ('pending','fetched','error')),
                content     TEXT,
                error       TEXT,
                processed   BOOLEAN NOT NULL DEFAULT 0,
                fetched_at  TEXT,
                created_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_media_status ON media(status);
            CREATE INDEX IF NOT EXISTS idx_media_owner ON media(owner_id);

            CREATE TABLE IF NOT EXISTS logins (
                id      INTEGER PRIMARY KEY,
                persona TEXT NOT NULL,
                action  TEXT NOT NULL CHECK(action IN ('login','logout')),
                success BOOLEAN NOT NULL,
                at      TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ── Targets ──

    /// Returns how many names were new.
    pub fn upsert_targets(&self, names: &[String]) -> Result<usize> {
        let conn = self.get("Store::upsert_targets")?;
        let tx = conn.unchecked_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare("INSERT OR IGNORE INTO targets (name) VALUES (?1)")?;
            for name in names {
                count += stmt.execute([name])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    /// Least recently visited target, never-visited first.
    pub fn next_target(&self) -> Result<Option<Target>> {
        let conn = self.get("Store::next_target")?;
        let target = conn
            .query_row(
                "SELECT id, name FROM targets
                 ORDER BY last_visited IS NOT NULL, last_visited, id
                 LIMIT 1",
                [],
                |row| {
                    Ok(Target {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(target)
    }

    pub fn mark_visited(&self, target_id: i64, at: NaiveDateTime) -> Result<()> {
        let conn = self.get("Store::mark_visited")?;
        conn.execute(
            "UPDATE targets SET last_visited = ?1 WHERE id = ?2",
            params![fmt_date(at), target_id],
        )?;
        Ok(())
    }

    // ── Stories ──

    /// `Ok(false)` when the id is already stored. Captured images go to the
    /// media table as already-fetched rows, in the same transaction.
    pub fn insert_story(
        &self,
        target_id: Option<i64>,
        run_id: &str,
        story: &Story,
    ) -> Result<bool> {
        let json = serde_json::to_string(story)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

        let conn = self.get("Store::insert_story")?;
        let tx = conn.unchecked_transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO stories
             (id, target_id, run_id, story_date, kind, json, likes, comments, shares, snapshot, html)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                story.id,
                target_id,
                run_id,
                story.date.map(fmt_date),
                story.kind.to_string(),
                json,
                story.likes_total(),
                story.comments_count,
                story.shares,
                story.snapshot,
                story.html,
            ],
        )? == 1;

        if inserted && !story.images.is_empty() {
            let fetched_at = now_text();
            let mut stmt = tx.prepare(
                "INSERT INTO media (owner_id, kind, src, status, content, fetched_at)
                 VALUES (?1, 'capture', ?2, 'fetched', ?3, ?4)",
            )?;
            for image in &story.images {
                stmt.execute(params![
                    story.id,
                    image.src,
                    crate::media::encode(&image.png),
                    fetched_at
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    // ── API objects ──

    /// `Ok(false)` when the object id is already stored.
    pub fn insert_object(&self, o: &ObjectRow) -> Result<bool> {
        let conn = self.get("Store::insert_object")?;
        let n = conn.execute(
            "INSERT OR IGNORE INTO objects
             (id, parent_id, page_id, post_id, kind, created, modified, permalink,
              api_type, status_type, name, caption, description, story, message,
              user_id, likes, shares, place, tags, with_tags, properties, raw)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23)",
            params![
                o.id, o.parent_id, o.page_id, o.post_id, o.kind.as_str(),
                o.created.map(fmt_date), o.modified.map(fmt_date), o.permalink,
                o.api_type, o.status_type, o.name, o.caption, o.description,
                o.story, o.message, o.user_id, o.likes, o.shares, o.place,
                o.tags, o.with_tags, o.properties, o.raw,
            ],
        )?;
        if n == 0 {
            debug!(id = %o.id, kind = o.kind.as_str(), "object already stored");
        }
        Ok(n == 1)
    }

    /// Page objects in insertion order: `(id, name)`.
    pub fn pages(&self) -> Result<Vec<(String, String)>> {
        let conn = self.get("Store::pages")?;
        let mut stmt = conn.prepare(
            "SELECT id, COALESCE(name, '') FROM objects WHERE kind = 'Page' ORDER BY created_at, rowid",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// `Ok(false)` when the user is already known.
    pub fn insert_user(
        &self,
        id: &str,
        name: Option<&str>,
        last_message: Option<NaiveDateTime>,
    ) -> Result<bool> {
        let conn = self.get("Store::insert_user")?;
        let n = conn.execute(
            "INSERT OR IGNORE INTO users (id, name, last_message) VALUES (?1, ?2, ?3)",
            params![id, name, last_message.map(fmt_date)],
        )?;
        Ok(n == 1)
    }

    // ── Media ──

    pub fn insert_media(&self, m: &MediaRow) -> Result<i64> {
        let conn = self.get("Store::insert_media")?;
        conn.execute(
            "INSERT INTO media
             (owner_id, kind, title, description, tags, target, media_json, src, width, height)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                m.owner_id, m.kind, m.title, m.description, m.tags, m.target,
                m.media_json, m.src, m.width, m.height,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Pending rows with a source, oldest first. Safe to re-claim after a
    /// restart: fetched and errored rows never match.
    pub fn claim_pending_media(&self, limit: usize) -> Result<Vec<MediaJob>> {
        let conn = self.get("Store::claim_pending_media")?;
        let mut stmt = conn.prepare(
            "SELECT id, src FROM media
             WHERE status = 'pending' AND src IS NOT NULL
             ORDER BY id LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(MediaJob {
                    id: row.get(0)?,
                    src: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn complete_media(&self, id: i64, content: &str) -> Result<()> {
        let conn = self.get("Store::complete_media")?;
        conn.execute(
            "UPDATE media SET status = 'fetched', content = ?1, error = NULL, fetched_at = ?2
             WHERE id = ?3",
            params![content, now_text(), id],
        )?;
        Ok(())
    }

    pub fn fail_media(&self, id: i64, error: &str) -> Result<()> {
        let conn = self.get("Store::fail_media")?;
        conn.execute(
            "UPDATE media SET status = 'error', error = ?1, fetched_at = ?2 WHERE id = ?3",
            params![error, now_text(), id],
        )?;
        Ok(())
    }

    // ── Audit ──

    pub fn record_login(
        &self,
        persona: &str,
        action: LoginAction,
        success: bool,
        at: NaiveDateTime,
    ) -> Result<()> {
        let conn = self.get("Store::record_login")?;
        conn.execute(
            "INSERT INTO logins (persona, action, success, at) VALUES (?1, ?2, ?3, ?4)",
            params![persona, action.as_str(), success, fmt_date(at)],
        )?;
        Ok(())
    }

    pub fn logins(&self, persona: &str) -> Result<Vec<(String, bool)>> {
        let conn = self.get("Store::logins")?;
        let mut stmt =
            conn.prepare("SELECT action, success FROM logins WHERE persona = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map([persona], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Stats ──

    pub fn stats(&self) -> Result<Stats> {
        let conn = self.get("Store::stats")?;
        let count = |sql: &str| conn.query_row(sql, [], |r| r.get::<_, usize>(0));
        Ok(Stats {
            targets: count("SELECT COUNT(*) FROM targets")?,
            visited: count("SELECT COUNT(*) FROM targets WHERE last_visited IS NOT NULL")?,
            stories: count("SELECT COUNT(*) FROM stories")?,
            runs: count("SELECT COUNT(DISTINCT run_id) FROM stories")?,
            pages: count("SELECT COUNT(*) FROM objects WHERE kind = 'Page'")?,
            posts: count("SELECT COUNT(*) FROM objects WHERE kind = 'Post'")?,
            comments: count("SELECT COUNT(*) FROM objects WHERE kind = 'Comm'")?,
            users: count("SELECT COUNT(*) FROM users")?,
            media_pending: count("SELECT COUNT(*) FROM media WHERE status = 'pending'")?,
            media_fetched: count("SELECT COUNT(*) FROM media WHERE status = 'fetched'")?,
            media_errors: count("SELECT COUNT(*) FROM media WHERE status = 'error'")?,
            failed_logins: count("SELECT COUNT(*) FROM logins WHERE NOT success")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Page,
    Post,
    Comment,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Page => "Page",
            ObjectKind::Post => "Post",
            ObjectKind::Comment => "Comm",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObjectRow {
    pub id: String,
    pub parent_id: Option<String>,
    pub page_id: Option<String>,
    pub post_id: Option<String>,
    pub kind: ObjectKind,
    pub created: Option<NaiveDateTime>,
    pub modified: Option<NaiveDateTime>,
    pub permalink: Option<String>,
    pub api_type: Option<String>,
    pub status_type: Option<String>,
    pub name: Option<String>,
    pub caption: Option<String>,
    pub description: Option<String>,
    pub story: Option<String>,
    pub message: Option<String>,
    pub user_id: Option<String>,
    pub likes: i64,
    pub shares: i64,
    pub place: Option<String>,
    pub tags: Option<String>,
    pub with_tags: Option<String>,
    pub properties: Option<String>,
    pub raw: Option<String>,
}

impl ObjectRow {
    pub fn new(id: &str, kind: ObjectKind) -> Self {
        Self {
            id: id.to_string(),
            parent_id: None,
            page_id: None,
            post_id: None,
            kind,
            created: None,
            modified: None,
            permalink: None,
            api_type: None,
            status_type: None,
            name: None,
            caption: None,
            description: None,
            story: None,
            message: None,
            user_id: None,
            likes: 0,
            shares: 0,
            place: None,
            tags: None,
            with_tags: None,
            properties: None,
            raw: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MediaRow {
    pub owner_id: String,
    pub kind: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<String>,
    pub target: Option<String>,
    pub media_json: Option<String>,
    pub src: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaJob {
    pub id: i64,
    pub src: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginAction {
    Login,
    Logout,
}

impl LoginAction {
    pub fn as_str(self) -> &'static str {
        match self {
            LoginAction::Login => "login",
            LoginAction::Logout => "logout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub targets: usize,
    pub visited: usize,
    pub stories: usize,
    pub runs: usize,
    pub pages: usize,
    pub posts: usize,
    pub comments: usize,
    pub users: usize,
    pub media_pending: usize,
    pub media_fetched: usize,
    pub media_errors: usize,
    pub failed_logins: usize,
}

// ── Tests ──

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::parser::{parse_story, CapturedImage};
    use chrono::NaiveDate;

    pub fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Store::open(&dir.path().join("harvest.sqlite"), 4, Duration::from_secs(5)).unwrap();
        store.init_schema().unwrap();
        (dir, store)
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2017, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn story(id: &str) -> Story {
        let html = std::fs::read_to_string("tests/fixtures/unit_post.html").unwrap();
        parse_story(id, &html, now())
    }

    #[test]
    fn second_story_insert_reports_existing() {
        let (_dir, store) = temp_store();
        let s = story("1001");
        assert!(store.insert_story(None, "run-1", &s).unwrap());
        assert!(!store.insert_story(None, "run-2", &s).unwrap());
        assert_eq!(store.stats().unwrap().stories, 1);
    }

    #[test]
    fn story_columns_and_captured_images() {
        let (_dir, store) = temp_store();
        let mut s = story("1001");
        s.images.push(CapturedImage {
            src: Some("https://cdn.example/lake.jpg".into()),
            png: b"png".to_vec(),
        });
        store.insert_story(None, "run-1", &s).unwrap();

        let conn = store.get("test").unwrap();
        let (kind, likes, comments, shares): (String, i64, i64, i64) = conn
            .query_row(
                "SELECT kind, likes, comments, shares FROM stories WHERE id = '1001'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .unwrap();
        assert_eq!(kind, "post");
        assert_eq!(likes, 1200);
        assert_eq!(comments, 7);
        assert_eq!(shares, 4);

        let status: String = conn
            .query_row("SELECT status FROM media WHERE owner_id = '1001'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(status, "fetched");
        drop(conn);
        // captured images are never claimed for download
        assert!(store.claim_pending_media(10).unwrap().is_empty());
    }

    #[test]
    fn targets_rotate_least_recently_visited() {
        let (_dir, store) = temp_store();
        let names = vec!["a.page".to_string(), "b.page".to_string()];
        assert_eq!(store.upsert_targets(&names).unwrap(), 2);
        assert_eq!(store.upsert_targets(&names).unwrap(), 0);

        let first = store.next_target().unwrap().unwrap();
        assert_eq!(first.name, "a.page");
        store.mark_visited(first.id, now()).unwrap();
        let second = store.next_target().unwrap().unwrap();
        assert_eq!(second.name, "b.page");
        store
            .mark_visited(second.id, now() + chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(store.next_target().unwrap().unwrap().name, "a.page");
    }

    #[test]
    fn media_claims_skip_finished_rows() {
        let (_dir, store) = temp_store();
        let row = |src: &str| MediaRow {
            owner_id: "p1".into(),
            src: Some(src.into()),
            ..MediaRow::default()
        };
        let a = store.insert_media(&row("http://x/a.jpg")).unwrap();
        let b = store.insert_media(&row("http://x/b.jpg")).unwrap();
        store
            .insert_media(&MediaRow {
                owner_id: "p1".into(),
                ..MediaRow::default()
            })
            .unwrap();

        let jobs = store.claim_pending_media(10).unwrap();
        assert_eq!(jobs.iter().map(|j| j.id).collect::<Vec<_>>(), vec![a, b]);

        store.complete_media(a, "aGVsbG8=").unwrap();
        store.fail_media(b, "HTTP 404").unwrap();
        assert!(store.claim_pending_media(10).unwrap().is_empty());

        let stats = store.stats().unwrap();
        assert_eq!(stats.media_fetched, 1);
        assert_eq!(stats.media_errors, 1);
        assert_eq!(stats.media_pending, 1);
    }

    #[test]
    fn objects_and_users_are_idempotent() {
        let (_dir, store) = temp_store();
        let mut page = ObjectRow::new("p1", ObjectKind::Page);
        page.name = Some("Some Page".into());
        assert!(store.insert_object(&page).unwrap());
        assert!(!store.insert_object(&page).unwrap());
        assert_eq!(store.pages().unwrap(), vec![("p1".to_string(), "Some Page".to_string())]);

        assert!(store.insert_user("u1", Some("Ann"), Some(now())).unwrap());
        assert!(!store.insert_user("u1", Some("Ann"), None).unwrap());
    }

    #[test]
    fn login_audit() {
        let (_dir, store) = temp_store();
        store.record_login("alice", LoginAction::Login, true, now()).unwrap();
        store.record_login("alice", LoginAction::Logout, false, now()).unwrap();
        assert_eq!(
            store.logins("alice").unwrap(),
            vec![("login".to_string(), true), ("logout".to_string(), false)]
        );
        assert_eq!(store.stats().unwrap().failed_logins, 1);
    }

    #[test]
    fn pool_reports_outstanding_connections() {
        let (_dir, store) = temp_store();
        let before = store.report();
        assert_eq!(before.gets, before.puts);
        {
            let _held = store.get("holder").unwrap();
            let report = store.report();
            assert_eq!(report.gets, report.puts + 1);
            assert_eq!(report.outstanding.len(), 1);
            assert!(report.outstanding[0].ends_with("holder"));
        }
        let after = store.report();
        assert_eq!(after.gets, after.puts);
        assert!(after.outstanding.is_empty());
        assert!(after.to_string().starts_with("get/put:"));
    }

    #[test]
    fn pool_hands_back_connections_across_threads() {
        let (_dir, store) = temp_store();
        let store = std::sync::Arc::new(store);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store.upsert_targets(&[format!("t{i}")]).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.stats().unwrap().targets, 8);
        assert!(store.report().outstanding.is_empty());
    }

    #[test]
    fn exhausted_pool_errors_after_checkout_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Store::open(&dir.path().join("harvest.sqlite"), 1, Duration::from_millis(100)).unwrap();
        let held = store.get("holder").unwrap();

        let err = store.get("waiter").err().unwrap();
        assert!(matches!(err, StoreError::Pool(_)));
        let report = store.report();
        assert_eq!(report.outstanding.len(), 1);
        assert!(report.outstanding[0].ends_with("holder"));

        drop(held);
        assert!(store.get("waiter").is_ok());
        assert!(store.report().outstanding.is_empty());
    }
}
