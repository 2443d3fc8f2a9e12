//! SQLite persistence for runs, SERPs and links.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::debug;

use crate::serp::{Link, ScraperRun, Serp};
use crate::{Result, ScrapeError};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS scraper_search (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        keyword_file TEXT,
        number_search_engines_used INTEGER NOT NULL,
        used_search_engines TEXT NOT NULL,
        number_proxies_used INTEGER NOT NULL,
        number_search_queries INTEGER NOT NULL,
        started_searching TEXT NOT NULL,
        stopped_searching TEXT
    )",
    "CREATE TABLE IF NOT EXISTS serp (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id INTEGER NOT NULL REFERENCES scraper_search(id),
        search_engine_name TEXT NOT NULL,
        scrape_method TEXT NOT NULL,
        page_number INTEGER NOT NULL,
        requested_at TEXT NOT NULL,
        requested_by TEXT NOT NULL,
        num_results INTEGER NOT NULL,
        query TEXT NOT NULL,
        num_results_for_query TEXT NOT NULL,
        effective_query TEXT NOT NULL,
        no_results INTEGER NOT NULL,
        status TEXT NOT NULL,
        UNIQUE (run_id, search_engine_name, query, page_number)
    )",
    "CREATE TABLE IF NOT EXISTS link (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        serp_id INTEGER NOT NULL REFERENCES serp(id),
        rank INTEGER NOT NULL,
        title TEXT NOT NULL,
        snippet TEXT NOT NULL,
        link TEXT NOT NULL,
        domain TEXT NOT NULL,
        visible_link TEXT NOT NULL,
        link_type TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS scraper_searches_serps (
        scraper_search_id INTEGER NOT NULL REFERENCES scraper_search(id),
        serp_id INTEGER NOT NULL REFERENCES serp(id),
        PRIMARY KEY (scraper_search_id, serp_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_link_serp ON link (serp_id)",
];

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ScrapeError::Sink(format!("Bad timestamp '{}' in store: {}", text, e)))
}

/// Durable store; owned by the sink consumer.
pub struct SerpStore {
    pool: SqlitePool,
}

impl SerpStore {
    /// Opens (creating if needed) the database at `url` and applies the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        if !url.starts_with("sqlite:") {
            return Err(ScrapeError::Config(format!(
                "database_url must be a sqlite URL (got '{}')",
                url
            )));
        }
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // One connection: a single writer, and `sqlite::memory:` stays one database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        debug!("SERP store ready at {}", url);
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Records the start of a run and assigns its id.
    pub async fn begin_run(&self, run: &mut ScraperRun) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO scraper_search (keyword_file, number_search_engines_used, used_search_engines,
                number_proxies_used, number_search_queries, started_searching)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(run.keyword_file.as_deref())
        .bind(run.engines.len() as i64)
        .bind(run.engine_names())
        .bind(run.proxy_count as i64)
        .bind(run.query_count as i64)
        .bind(timestamp(&run.started_at))
        .execute(&self.pool)
        .await?;
        run.id = result.last_insert_rowid();
        Ok(run.id)
    }

    pub async fn finish_run(&self, run: &ScraperRun) -> Result<()> {
        sqlx::query("UPDATE scraper_search SET stopped_searching = ? WHERE id = ?")
            .bind(run.stopped_at.as_ref().map(timestamp))
            .bind(run.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Writes SERPs with their links in one transaction.
    pub async fn insert_batch(&self, serps: &[Serp]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for serp in serps {
            let serp_id = sqlx::query(
                "INSERT INTO serp (run_id, search_engine_name, scrape_method, page_number, requested_at,
                    requested_by, num_results, query, num_results_for_query, effective_query,
                    no_results, status)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(serp.run_id)
            .bind(serp.engine.name())
            .bind(serp.method.tag())
            .bind(serp.page as i64)
            .bind(timestamp(&serp.requested_at))
            .bind(&serp.requested_by)
            .bind(serp.num_results as i64)
            .bind(&serp.query)
            .bind(&serp.num_results_for_query)
            .bind(&serp.effective_query)
            .bind(serp.no_results)
            .bind(serp.status.as_str())
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            for link in &serp.links {
                sqlx::query(
                    "INSERT INTO link (serp_id, rank, title, snippet, link, domain, visible_link, link_type)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(serp_id)
                .bind(link.rank as i64)
                .bind(&link.title)
                .bind(&link.snippet)
                .bind(&link.link)
                .bind(&link.domain)
                .bind(&link.visible_link)
                .bind(link.link_type.as_str())
                .execute(&mut *tx)
                .await?;
            }

            sqlx::query("INSERT INTO scraper_searches_serps (scraper_search_id, serp_id) VALUES (?, ?)")
                .bind(serp.run_id)
                .bind(serp_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// SERPs of a run in insertion order, links in rank order.
    pub async fn load_serps(&self, run_id: i64) -> Result<Vec<Serp>> {
        let rows = sqlx::query(
            "SELECT s.* FROM serp s
             JOIN scraper_searches_serps j ON j.serp_id = s.id
             WHERE j.scraper_search_id = ?
             ORDER BY s.id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        let mut serps = Vec::with_capacity(rows.len());
        for row in rows {
            let serp_id: i64 = row.try_get("id")?;
            let engine: String = row.try_get("search_engine_name")?;
            let method: String = row.try_get("scrape_method")?;
            let requested_at: String = row.try_get("requested_at")?;
            let status: String = row.try_get("status")?;

            let links = sqlx::query("SELECT * FROM link WHERE serp_id = ? ORDER BY rank")
                .bind(serp_id)
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|l| {
                    let link_type: String = l.try_get("link_type")?;
                    Ok(Link {
                        rank: l.try_get::<i64, _>("rank")? as u32,
                        title: l.try_get("title")?,
                        snippet: l.try_get("snippet")?,
                        link: l.try_get("link")?,
                        domain: l.try_get("domain")?,
                        visible_link: l.try_get("visible_link")?,
                        link_type: link_type.parse()?,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            serps.push(Serp {
                run_id: row.try_get("run_id")?,
                engine: engine.parse()?,
                method: method.parse()?,
                page: row.try_get::<i64, _>("page_number")? as u32,
                query: row.try_get("query")?,
                requested_at: parse_timestamp(&requested_at)?,
                requested_by: row.try_get("requested_by")?,
                num_results: row.try_get::<i64, _>("num_results")? as u32,
                num_results_for_query: row.try_get("num_results_for_query")?,
                effective_query: row.try_get("effective_query")?,
                no_results: row.try_get("no_results")?,
                status: status.parse()?,
                links,
            });
        }
        Ok(serps)
    }

    /// Start and stop times of a run.
    pub async fn run_times(&self, run_id: i64) -> Result<(DateTime<Utc>, Option<DateTime<Utc>>)> {
        let row = sqlx::query(
            "SELECT started_searching, stopped_searching FROM scraper_search WHERE id = ?",
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;
        let started: String = row.try_get("started_searching")?;
        let stopped: Option<String> = row.try_get("stopped_searching")?;
        Ok((
            parse_timestamp(&started)?,
            stopped.as_deref().map(parse_timestamp).transpose()?,
        ))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SearchEngine;
    use crate::fetcher::ScrapeMethod;
    use crate::job::Job;
    use crate::serp::{LinkType, ParsedSerp};

    fn sample_serp(run_id: i64, query: &str, page: u32) -> Serp {
        let job = Job::new(query, SearchEngine::Google, page, ScrapeMethod::Http);
        let mut first = Link::new(LinkType::Organic, "https://www.extremnews.com/x.html")
            .with_title("Sonic Youth")
            .with_snippet("Noise-Rock-Band Sonic Youth")
            .with_visible_link("www.extremnews.com");
        first.rank = 1;
        let mut ad = Link::new(LinkType::AdMain, "https://ad.example/");
        ad.rank = 2;
        let parsed = ParsedSerp {
            num_results: 1,
            num_results_for_query: "Ungefähr 232.000.000 Ergebnisse".into(),
            links: vec![first, ad],
            ..Default::default()
        };
        Serp::from_parsed(&job, parsed, run_id, Utc::now(), "http-worker-0")
    }

    #[tokio::test]
    async fn test_round_trip() {
        let store = SerpStore::connect("sqlite::memory:").await.unwrap();
        let mut run = ScraperRun::new(vec![SearchEngine::Google], 0, 1);
        let run_id = store.begin_run(&mut run).await.unwrap();
        assert!(run_id > 0);

        let serps = vec![sample_serp(run_id, "sonic youth", 1), sample_serp(run_id, "sonic youth", 2)];
        store.insert_batch(&serps).await.unwrap();

        let loaded = store.load_serps(run_id).await.unwrap();
        assert_eq!(loaded, serps);
    }

    #[tokio::test]
    async fn test_runs_keep_their_own_serps() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("serps.db").display());
        let store = SerpStore::connect(&url).await.unwrap();

        let mut first = ScraperRun::new(vec![SearchEngine::Google], 0, 1);
        let mut second = ScraperRun::new(vec![SearchEngine::Google], 0, 1);
        let a = store.begin_run(&mut first).await.unwrap();
        let b = store.begin_run(&mut second).await.unwrap();
        store.insert_batch(&[sample_serp(a, "q", 1)]).await.unwrap();
        store.insert_batch(&[sample_serp(b, "q", 1)]).await.unwrap();

        assert_eq!(store.load_serps(a).await.unwrap().len(), 1);
        assert_eq!(store.load_serps(b).await.unwrap()[0].run_id, b);
    }

    #[tokio::test]
    async fn test_duplicate_serp_rejected() {
        let store = SerpStore::connect("sqlite::memory:").await.unwrap();
        let mut run = ScraperRun::new(vec![SearchEngine::Google], 0, 1);
        let id = store.begin_run(&mut run).await.unwrap();
        let err = store
            .insert_batch(&[sample_serp(id, "q", 1), sample_serp(id, "q", 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Database(_)));
        // the failed batch left nothing behind
        assert!(store.load_serps(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finish_run() {
        let store = SerpStore::connect("sqlite::memory:").await.unwrap();
        let mut run = ScraperRun::new(vec![SearchEngine::Bing], 2, 5);
        store.begin_run(&mut run).await.unwrap();
        run.finish();
        store.finish_run(&run).await.unwrap();
        let (started, stopped) = store.run_times(run.id).await.unwrap();
        assert_eq!(started, run.started_at);
        assert!(stopped.unwrap() >= started);
    }

    #[tokio::test]
    async fn test_rejects_non_sqlite_url() {
        let err = SerpStore::connect("postgres://localhost/serps").await.err().unwrap();
        assert!(err.is_config());
    }
}
