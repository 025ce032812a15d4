use crate::appsflyer::{self, AppsFlyerApi, AppsFlyerClient, ReportKind};
use crate::config::{AppsFlyerConfig, MergeConfig, MintegralConfig, UnityConfig};
use crate::data::{attach_cpa, attribution_batch, merge_performance, network_batch, to_merged_records};
use crate::error::Error;
use crate::google_auth::GoogleCredentials;
use crate::mintegral::{self, MintegralAccount, MintegralApi, MintegralClient};
use crate::payout_loader::{payout_lookup, PayoutLoader, SheetsPayoutLoader};
use crate::raw_store::{PgRawStore, RawStore};
use crate::reconcile::AttributionAggregator;
use crate::records::{dedup_exact, NetworkRecord, NetworkTable};
use crate::rules::{AppClients, ClientRules};
use crate::unity::{self, UnityApi, UnityClient};
use crate::warehouse::{BigQueryWarehouse, Warehouse};
use crate::window::Window;
use chrono::{NaiveDate, Utc};
use datafusion::prelude::SessionContext;
use log::{error, info, warn};

/// Network ingests refresh the two days before today.
const NETWORK_WINDOW_FROM_DAYS_AGO: u32 = 2;
const NETWORK_WINDOW_TO_DAYS_AGO: u32 = 1;

pub async fn ingest_mintegral(
    api: &impl MintegralApi,
    store: &impl RawStore,
    accounts: &[MintegralAccount],
    rules: &ClientRules,
    window: &Window,
) -> Result<u64, Error> {
    let mut rows = Vec::new();

    for (index, account) in accounts.iter().enumerate() {
        match api.fetch_report(account, window).await {
            Ok(report) => {
                info!("Mintegral account {} returned {} rows", index + 1, report.len());
                rows.extend(report);
            }
            Err(err) => error!("Skipping Mintegral account {}: {}", index + 1, err),
        }
    }

    let records = mintegral::process_report(rows, rules);
    persist_network(store, NetworkTable::Mintegral, window, records).await
}

pub async fn ingest_unity(
    api: &impl UnityApi,
    store: &impl RawStore,
    app_ids: &[String],
    rules: &ClientRules,
    window: &Window,
) -> Result<u64, Error> {
    let mut rows = Vec::new();

    for app_id in app_ids {
        match api.fetch_report(app_id, window).await {
            Ok(report) => {
                info!("Unity app {} returned {} rows", app_id, report.len());
                rows.extend(report);
            }
            Err(err) => error!("Skipping Unity app {}: {}", app_id, err),
        }
    }

    let records = unity::process_report(rows, rules);
    persist_network(store, NetworkTable::Unity, window, records).await
}

async fn persist_network(
    store: &impl RawStore,
    table: NetworkTable,
    window: &Window,
    records: Vec<NetworkRecord>,
) -> Result<u64, Error> {
    if records.is_empty() {
        warn!("No {} rows for {}, leaving {} untouched", table.network(), window, table.name());
        return Ok(0);
    }

    store.replace_network_window(table, window, &records).await
}

/// Downloads both exports of every app. A failing export is skipped on its
/// own; the other export of the same app is still kept.
pub async fn ingest_appsflyer(
    api: &impl AppsFlyerApi,
    store: &impl RawStore,
    app_ids: &[String],
    app_clients: &AppClients,
    window: &Window,
) -> Result<u64, Error> {
    let mut rows = Vec::new();

    for app_id in app_ids {
        for report in ReportKind::ALL {
            match api.fetch_report(report, app_id, window).await {
                Ok(report_rows) => {
                    info!(
                        "AppsFlyer {:?} for {} returned {} rows",
                        report,
                        app_id,
                        report_rows.len()
                    );
                    rows.extend(report_rows);
                }
                Err(err) => error!("Skipping AppsFlyer {:?} for {}: {}", report, app_id, err),
            }
        }
    }

    let records = appsflyer::process_rows(rows, app_clients);
    if records.is_empty() {
        warn!("No AppsFlyer rows for {}, leaving the table untouched", window);
        return Ok(0);
    }

    store.replace_attribution_window(window, &records).await
}

///
/// Rebuilds the warehouse window from the raw tables.
///
/// # Arguments
/// * `network_store` - Store holding both network tables
/// * `attribution_store` - Store holding the attribution table
/// * `payouts` - Source of the payout rates
/// * `warehouse` - Destination table
/// * `window` - Days to rebuild
/// * `chunk_size` - Rows per record batch read from the stores
///
/// # Returns
/// A Result containing either the number of rows written or an [`Error`].
/// Nothing is deleted when the merge produced no rows.
pub async fn merge_and_publish(
    network_store: &impl RawStore,
    attribution_store: &impl RawStore,
    payouts: &impl PayoutLoader,
    warehouse: &impl Warehouse,
    window: &Window,
    chunk_size: usize,
) -> Result<u64, Error> {
    let mut network_batches = Vec::new();
    for table in [NetworkTable::Mintegral, NetworkTable::Unity] {
        for chunk in network_store
            .load_network_chunks(table, window, chunk_size)
            .await?
        {
            network_batches.push(network_batch(&chunk)?);
        }
    }

    let attribution = attribution_store
        .load_attribution_chunks(window, chunk_size)
        .await?
        .into_iter()
        .flatten()
        .collect();

    let mut aggregator = AttributionAggregator::default();
    aggregator.extend(dedup_exact(attribution));
    info!(
        "Dropped {} attribution events outside their attribution window",
        aggregator.discarded()
    );
    let summaries = aggregator.finish();

    let ctx = SessionContext::new();
    let merged_df = merge_performance(
        &ctx,
        network_batches,
        vec![attribution_batch(&summaries)?],
    )
    .await?;

    let merged_rows = merged_df.clone().count().await?;
    if merged_rows == 0 {
        warn!("Merge for {} produced no rows, warehouse left untouched", window);
        return Ok(0);
    }
    info!("Merged {} rows for {}", merged_rows, window);

    let lookup = payout_lookup(payouts.load().await?);
    info!("Loaded {} payout rates", lookup.len());

    let priced_df = attach_cpa(&ctx, merged_df, &lookup).await?;
    let records = to_merged_records(&priced_df.collect().await?)?;

    warehouse.delete_window(window).await?;
    warehouse.append(&records).await
}

pub async fn run_mintegral(config: MintegralConfig) -> Result<(), Error> {
    let window = Window::trailing(
        Utc::now().date_naive(),
        NETWORK_WINDOW_FROM_DAYS_AGO,
        NETWORK_WINDOW_TO_DAYS_AGO,
    );
    info!("Mintegral ingest for {}", window);

    let api = MintegralClient::new(&config);
    let store = PgRawStore::connect(&config.database_url).await?;
    let accounts = MintegralAccount::from_config(&config);
    let rules = ClientRules::from_config(&config.client_rules);
    info!("Classifying Mintegral campaigns with {}", rules);

    let written = ingest_mintegral(&api, &store, &accounts, &rules, &window).await?;
    info!("Mintegral ingest wrote {} rows", written);

    Ok(())
}

pub async fn run_unity(config: UnityConfig) -> Result<(), Error> {
    let window = Window::trailing(
        Utc::now().date_naive(),
        NETWORK_WINDOW_FROM_DAYS_AGO,
        NETWORK_WINDOW_TO_DAYS_AGO,
    );
    info!("Unity ingest for {}", window);

    let api = UnityClient::new(&config);
    let store = PgRawStore::connect(&config.database_url).await?;
    let rules = ClientRules::from_config(&config.client_rules);
    info!("Classifying Unity campaigns with {}", rules);

    let written = ingest_unity(&api, &store, &config.app_ids, &rules, &window).await?;
    info!("Unity ingest wrote {} rows", written);

    Ok(())
}

pub async fn run_appsflyer(
    config: AppsFlyerConfig,
    start: &NaiveDate,
    end: &NaiveDate,
) -> Result<(), Error> {
    let window = Window::new(*start, *end)?;
    info!("AppsFlyer ingest for {}", window);

    let api = AppsFlyerClient::new(&config);
    let store = PgRawStore::connect(&config.database_url).await?;
    let app_clients = AppClients::from_config(&config.app_clients);

    let written = ingest_appsflyer(&api, &store, &config.app_ids, &app_clients, &window).await?;
    info!("AppsFlyer ingest wrote {} rows", written);

    Ok(())
}

/// Runs the merge job. Failures are logged here and not returned.
pub async fn run_merge(config: MergeConfig) -> Result<(), Error> {
    match merge(config).await {
        Ok(written) => info!("Merge wrote {} rows", written),
        Err(err) => error!("Merge failed: {:?}", err),
    }

    Ok(())
}

async fn merge(config: MergeConfig) -> Result<u64, Error> {
    let window = Window::trailing(Utc::now().date_naive(), config.window_days, 0);
    info!("Merge for {}", window);

    let credentials = GoogleCredentials::from_config(
        config.google_credentials.as_deref(),
        config.google_access_token.as_deref(),
    )?;
    let payouts = SheetsPayoutLoader::new(&config, credentials.clone());
    let warehouse = BigQueryWarehouse::new(&config, credentials);

    let network_store = PgRawStore::connect(&config.database_url).await?;
    let attribution_store = match &config.attribution_database_url {
        Some(url) if url != &config.database_url => PgRawStore::connect(url).await?,
        _ => network_store.clone(),
    };

    merge_and_publish(
        &network_store,
        &attribution_store,
        &payouts,
        &warehouse,
        &window,
        config.chunk_size,
    )
    .await
}
