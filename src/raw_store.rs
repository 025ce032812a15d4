use crate::error::Error;
use crate::records::{AttributionRecord, NetworkRecord, NetworkTable};
use crate::window::Window;
use futures::{Stream, TryStreamExt};
use log::{debug, info, warn};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};

pub const ATTRIBUTION_TABLE: &str = "raw_af_table";

/// Rows per multi-row INSERT statement; stays well below the bind limit.
const INSERT_BATCH_ROWS: usize = 1000;

const NETWORK_COLUMNS: &str = "day, campaign_network, site_network, site_name_network, \
impressions, clicks, conversions, spend, client, network, key_network";

const ATTRIBUTION_COLUMNS: &str = "appsflyer_id, client, app_id, event_name, event_time, \
install_time, media_source, adset, ad_type_af, campaign_af, site_af, reg_af, deposit_af";

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait RawStore: Send + Sync + 'static {
    /// Replaces the rows of `table` whose day falls in `window` by `records`.
    /// Records outside the window are not written.
    ///
    /// # Returns
    /// A Result containing either the number of inserted rows or an Error.
    async fn replace_network_window(
        &self,
        table: NetworkTable,
        window: &Window,
        records: &[NetworkRecord],
    ) -> Result<u64, Error>;

    /// Replaces the attribution rows whose install day falls in `window`.
    async fn replace_attribution_window(
        &self,
        window: &Window,
        records: &[AttributionRecord],
    ) -> Result<u64, Error>;

    async fn load_network_chunks(
        &self,
        table: NetworkTable,
        window: &Window,
        chunk_size: usize,
    ) -> Result<Vec<Vec<NetworkRecord>>, Error>;

    async fn load_attribution_chunks(
        &self,
        window: &Window,
        chunk_size: usize,
    ) -> Result<Vec<Vec<AttributionRecord>>, Error>;
}

fn network_ddl(table: NetworkTable) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            day DATE,
            campaign_network TEXT,
            site_network TEXT,
            site_name_network TEXT,
            impressions DOUBLE PRECISION,
            clicks DOUBLE PRECISION,
            conversions DOUBLE PRECISION,
            spend DOUBLE PRECISION,
            client TEXT,
            network TEXT,
            key_network TEXT PRIMARY KEY
        )",
        table.name()
    )
}

/// Columns added after the first tables were created.
fn network_migrations(table: NetworkTable) -> [String; 2] {
    [
        format!("ALTER TABLE {} ADD COLUMN IF NOT EXISTS client TEXT", table.name()),
        format!("ALTER TABLE {} ADD COLUMN IF NOT EXISTS network TEXT", table.name()),
    ]
}

fn attribution_ddl() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {ATTRIBUTION_TABLE} (
            appsflyer_id TEXT,
            client TEXT,
            app_id TEXT,
            event_name TEXT,
            event_time DATE,
            install_time DATE,
            media_source TEXT,
            adset TEXT,
            ad_type_af TEXT,
            campaign_af TEXT,
            site_af TEXT,
            reg_af INTEGER,
            deposit_af INTEGER
        )"
    )
}

#[derive(Clone)]
pub struct PgRawStore {
    pool: PgPool,
}

impl PgRawStore {
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;

        Ok(PgRawStore { pool })
    }
}

#[async_trait::async_trait]
impl RawStore for PgRawStore {
    async fn replace_network_window(
        &self,
        table: NetworkTable,
        window: &Window,
        records: &[NetworkRecord],
    ) -> Result<u64, Error> {
        let in_window: Vec<&NetworkRecord> = records
            .iter()
            .filter(|record| window.contains(record.day))
            .collect();
        if in_window.len() < records.len() {
            warn!(
                "Skipping {} {} rows outside {}",
                records.len() - in_window.len(),
                table.name(),
                window
            );
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(&network_ddl(table)).execute(&mut *tx).await?;
        for migration in network_migrations(table) {
            sqlx::query(&migration).execute(&mut *tx).await?;
        }

        let deleted = sqlx::query(&format!(
            "DELETE FROM {} WHERE day BETWEEN $1 AND $2",
            table.name()
        ))
        .bind(window.start)
        .bind(window.end)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        debug!("Deleted {} rows from {} for {}", deleted, table.name(), window);

        let mut inserted = 0;
        for chunk in in_window.chunks(INSERT_BATCH_ROWS) {
            let mut qb: QueryBuilder<'_, Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} ({}) ", table.name(), NETWORK_COLUMNS));
            qb.push_values(chunk.iter(), |mut b, record| {
                b.push_bind(record.day)
                    .push_bind(&record.campaign_network)
                    .push_bind(&record.site_network)
                    .push_bind(&record.site_name_network)
                    .push_bind(record.impressions)
                    .push_bind(record.clicks)
                    .push_bind(record.conversions)
                    .push_bind(record.spend)
                    .push_bind(&record.client)
                    .push_bind(&record.network)
                    .push_bind(&record.key_network);
            });

            inserted += qb.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;

        info!(
            "Replaced {} with {} rows for {} ({} removed)",
            table.name(),
            inserted,
            window,
            deleted
        );
        Ok(inserted)
    }

    async fn replace_attribution_window(
        &self,
        window: &Window,
        records: &[AttributionRecord],
    ) -> Result<u64, Error> {
        let in_window: Vec<&AttributionRecord> = records
            .iter()
            .filter(|record| record.install_time.is_some_and(|day| window.contains(day)))
            .collect();
        if in_window.len() < records.len() {
            warn!(
                "Skipping {} {} rows without an install day in {}",
                records.len() - in_window.len(),
                ATTRIBUTION_TABLE,
                window
            );
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(&attribution_ddl()).execute(&mut *tx).await?;

        let deleted = sqlx::query(&format!(
            "DELETE FROM {ATTRIBUTION_TABLE} WHERE install_time BETWEEN $1 AND $2"
        ))
        .bind(window.start)
        .bind(window.end)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        debug!("Deleted {} rows from {} for {}", deleted, ATTRIBUTION_TABLE, window);

        let mut inserted = 0;
        for chunk in in_window.chunks(INSERT_BATCH_ROWS) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {ATTRIBUTION_TABLE} ({ATTRIBUTION_COLUMNS}) "
            ));
            qb.push_values(chunk.iter(), |mut b, record| {
                b.push_bind(&record.appsflyer_id)
                    .push_bind(&record.client)
                    .push_bind(&record.app_id)
                    .push_bind(&record.event_name)
                    .push_bind(record.event_time)
                    .push_bind(record.install_time)
                    .push_bind(&record.media_source)
                    .push_bind(&record.adset)
                    .push_bind(&record.ad_type_af)
                    .push_bind(&record.campaign_af)
                    .push_bind(&record.site_af)
                    .push_bind(record.reg_af)
                    .push_bind(record.deposit_af);
            });

            inserted += qb.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;

        info!(
            "Replaced {} with {} rows for {} ({} removed)",
            ATTRIBUTION_TABLE, inserted, window, deleted
        );
        Ok(inserted)
    }

    async fn load_network_chunks(
        &self,
        table: NetworkTable,
        window: &Window,
        chunk_size: usize,
    ) -> Result<Vec<Vec<NetworkRecord>>, Error> {
        let sql = format!(
            "SELECT day,
                COALESCE(campaign_network, '') AS campaign_network,
                COALESCE(site_network, '') AS site_network,
                COALESCE(site_name_network, '') AS site_name_network,
                impressions::float8 AS impressions,
                clicks::float8 AS clicks,
                conversions::float8 AS conversions,
                spend::float8 AS spend,
                client,
                COALESCE(network, $3) AS network,
                COALESCE(key_network, '') AS key_network
            FROM {}
            WHERE day BETWEEN $1 AND $2
            ORDER BY day",
            table.name()
        );

        let rows = sqlx::query_as::<_, NetworkRecord>(&sql)
            .bind(window.start)
            .bind(window.end)
            .bind(table.network())
            .fetch(&self.pool);

        let chunks = collect_chunks(rows, chunk_size).await?;
        info!(
            "Loaded {} rows from {} in {} chunks",
            chunks.iter().map(Vec::len).sum::<usize>(),
            table.name(),
            chunks.len()
        );

        Ok(chunks)
    }

    async fn load_attribution_chunks(
        &self,
        window: &Window,
        chunk_size: usize,
    ) -> Result<Vec<Vec<AttributionRecord>>, Error> {
        let sql = format!(
            "SELECT appsflyer_id, client, app_id,
                COALESCE(event_name, '') AS event_name,
                event_time, install_time, media_source, adset,
                ad_type_af, campaign_af, site_af,
                COALESCE(reg_af, 0) AS reg_af,
                COALESCE(deposit_af, 0) AS deposit_af
            FROM {ATTRIBUTION_TABLE}
            WHERE install_time BETWEEN $1 AND $2
            ORDER BY install_time"
        );

        let rows = sqlx::query_as::<_, AttributionRecord>(&sql)
            .bind(window.start)
            .bind(window.end)
            .fetch(&self.pool);

        let chunks = collect_chunks(rows, chunk_size).await?;
        info!(
            "Loaded {} rows from {} in {} chunks",
            chunks.iter().map(Vec::len).sum::<usize>(),
            ATTRIBUTION_TABLE,
            chunks.len()
        );

        Ok(chunks)
    }
}

/// Drains a row stream into vectors of at most `chunk_size` rows.
async fn collect_chunks<T, S>(mut rows: S, chunk_size: usize) -> Result<Vec<Vec<T>>, Error>
where
    S: Stream<Item = Result<T, sqlx::Error>> + Unpin,
{
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut current = Vec::with_capacity(chunk_size);

    while let Some(row) = rows.try_next().await? {
        current.push(row);
        if current.len() == chunk_size {
            debug!("Read chunk {} ({} rows)", chunks.len() + 1, current.len());
            chunks.push(std::mem::replace(
                &mut current,
                Vec::with_capacity(chunk_size),
            ));
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    Ok(chunks)
}
