use crate::error::Error;
use crate::payout_loader::PayoutKey;
use crate::reconcile::AttributionSummary;
use crate::records::{network_key, MergedRecord, NetworkRecord};
use crate::window::month_abbrev;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use datafusion::arrow::array::{
    Array, ArrayRef, Date64Array, Date64Builder, Float64Array, Float64Builder, Int64Array,
    Int64Builder, RecordBatch, StringArray, StringBuilder,
};
use datafusion::arrow::compute::{cast_with_options, CastOptions};
use datafusion::arrow::datatypes::{DataType, Field, Schema};
use datafusion::common::{JoinType, ScalarValue};
use datafusion::datasource::MemTable;
use datafusion::prelude::{coalesce, col, DataFrame, SessionContext};
use std::collections::HashMap;
use std::sync::Arc;

const MERGED_FRAME: &str = "merged frame";

/// Schema of the unioned network tables, one row per (day, campaign, site).
pub fn network_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("day", DataType::Date64, false),
        Field::new("month", DataType::Utf8, false),
        Field::new("network", DataType::Utf8, false),
        Field::new("client", DataType::Utf8, true),
        Field::new("campaign_network", DataType::Utf8, false),
        Field::new("site_network", DataType::Utf8, false),
        Field::new("site_name_network", DataType::Utf8, false),
        Field::new("impressions", DataType::Float64, true),
        Field::new("clicks", DataType::Float64, true),
        Field::new("conversions", DataType::Float64, true),
        Field::new("spend", DataType::Float64, true),
        Field::new("key_network", DataType::Utf8, false),
    ]))
}

/// Schema of the attribution aggregate. Columns that also exist on the
/// network side carry an `_af` suffix.
pub fn attribution_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("key_af", DataType::Utf8, false),
        Field::new("install_time", DataType::Date64, true),
        Field::new("month_af", DataType::Utf8, true),
        Field::new("client_af", DataType::Utf8, true),
        Field::new("app_id", DataType::Utf8, true),
        Field::new("media_source", DataType::Utf8, true),
        Field::new("ad_type_af", DataType::Utf8, true),
        Field::new("adset", DataType::Utf8, true),
        Field::new("campaign_af", DataType::Utf8, true),
        Field::new("site_af", DataType::Utf8, true),
        Field::new("install_af", DataType::Int64, false),
        Field::new("reg_af", DataType::Int64, false),
        Field::new("deposit_af", DataType::Int64, false),
    ]))
}

pub fn payout_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("payout_app_id", DataType::Utf8, false),
        Field::new("payout_media_source", DataType::Utf8, false),
        Field::new("payout_month", DataType::Utf8, false),
        Field::new("payout", DataType::Float64, false),
    ]))
}

/// Converts one chunk of network rows into a record batch. The key is
/// rebuilt from its components so rows written under an older key format
/// still join.
///
/// # Arguments
/// * `records` - A slice of [`NetworkRecord`] read from one raw table
///
/// # Returns
/// A Result containing either a [`RecordBatch`] matching [`network_schema`] or an [`Error`]
pub fn network_batch(records: &[NetworkRecord]) -> Result<RecordBatch, Error> {
    let n = records.len();

    let mut day_builder = Date64Builder::with_capacity(n);
    let mut month_builder = StringBuilder::new();
    let mut network_builder = StringBuilder::new();
    let mut client_builder = StringBuilder::new();
    let mut campaign_builder = StringBuilder::new();
    let mut site_builder = StringBuilder::new();
    let mut site_name_builder = StringBuilder::new();
    let mut impressions_builder = Float64Builder::with_capacity(n);
    let mut clicks_builder = Float64Builder::with_capacity(n);
    let mut conversions_builder = Float64Builder::with_capacity(n);
    let mut spend_builder = Float64Builder::with_capacity(n);
    let mut key_builder = StringBuilder::new();

    for record in records {
        day_builder.append_value(date_to_unix_ms(record.day));
        month_builder.append_value(month_abbrev(record.day));
        network_builder.append_value(&record.network);
        client_builder.append_option(record.client.as_deref());
        campaign_builder.append_value(&record.campaign_network);
        site_builder.append_value(&record.site_network);
        site_name_builder.append_value(&record.site_name_network);
        impressions_builder.append_option(record.impressions);
        clicks_builder.append_option(record.clicks);
        conversions_builder.append_option(record.conversions);
        spend_builder.append_option(record.spend);
        key_builder.append_value(network_key(
            record.day,
            &record.campaign_network,
            &record.site_network,
        ));
    }

    let batch = RecordBatch::try_new(
        network_schema(),
        vec![
            Arc::new(day_builder.finish()),
            Arc::new(month_builder.finish()),
            Arc::new(network_builder.finish()),
            Arc::new(client_builder.finish()),
            Arc::new(campaign_builder.finish()),
            Arc::new(site_builder.finish()),
            Arc::new(site_name_builder.finish()),
            Arc::new(impressions_builder.finish()),
            Arc::new(clicks_builder.finish()),
            Arc::new(conversions_builder.finish()),
            Arc::new(spend_builder.finish()),
            Arc::new(key_builder.finish()),
        ],
    )?;

    Ok(batch)
}

pub fn attribution_batch(summaries: &[AttributionSummary]) -> Result<RecordBatch, Error> {
    let n = summaries.len();

    let mut key_builder = StringBuilder::new();
    let mut install_time_builder = Date64Builder::with_capacity(n);
    let mut month_builder = StringBuilder::new();
    let mut client_builder = StringBuilder::new();
    let mut app_id_builder = StringBuilder::new();
    let mut media_source_builder = StringBuilder::new();
    let mut ad_type_builder = StringBuilder::new();
    let mut adset_builder = StringBuilder::new();
    let mut campaign_builder = StringBuilder::new();
    let mut site_builder = StringBuilder::new();
    let mut install_builder = Int64Builder::with_capacity(n);
    let mut reg_builder = Int64Builder::with_capacity(n);
    let mut deposit_builder = Int64Builder::with_capacity(n);

    for summary in summaries {
        key_builder.append_value(&summary.key_af);
        install_time_builder.append_option(summary.install_time.map(date_to_unix_ms));
        month_builder.append_option(summary.month_af());
        client_builder.append_option(summary.client.as_deref());
        app_id_builder.append_option(summary.app_id.as_deref());
        media_source_builder.append_option(summary.media_source.as_deref());
        ad_type_builder.append_option(summary.ad_type_af.as_deref());
        adset_builder.append_option(summary.adset.as_deref());
        campaign_builder.append_option(summary.campaign_af.as_deref());
        site_builder.append_option(summary.site_af.as_deref());
        install_builder.append_value(summary.install_af);
        reg_builder.append_value(summary.reg_af);
        deposit_builder.append_value(summary.deposit_af);
    }

    let batch = RecordBatch::try_new(
        attribution_schema(),
        vec![
            Arc::new(key_builder.finish()),
            Arc::new(install_time_builder.finish()),
            Arc::new(month_builder.finish()),
            Arc::new(client_builder.finish()),
            Arc::new(app_id_builder.finish()),
            Arc::new(media_source_builder.finish()),
            Arc::new(ad_type_builder.finish()),
            Arc::new(adset_builder.finish()),
            Arc::new(campaign_builder.finish()),
            Arc::new(site_builder.finish()),
            Arc::new(install_builder.finish()),
            Arc::new(reg_builder.finish()),
            Arc::new(deposit_builder.finish()),
        ],
    )?;

    Ok(batch)
}

pub fn payout_batch(lookup: &HashMap<PayoutKey, f64>) -> Result<RecordBatch, Error> {
    let mut app_id_builder = StringBuilder::new();
    let mut media_source_builder = StringBuilder::new();
    let mut month_builder = StringBuilder::new();
    let mut payout_builder = Float64Builder::with_capacity(lookup.len());

    for ((app_id, media_source, month), payout) in lookup {
        app_id_builder.append_value(app_id);
        media_source_builder.append_value(media_source);
        month_builder.append_value(month);
        payout_builder.append_value(*payout);
    }

    let batch = RecordBatch::try_new(
        payout_schema(),
        vec![
            Arc::new(app_id_builder.finish()),
            Arc::new(media_source_builder.finish()),
            Arc::new(month_builder.finish()),
            Arc::new(payout_builder.finish()),
        ],
    )?;

    Ok(batch)
}

/// Registers `batches` as an in-memory table and returns it as a [`DataFrame`].
pub async fn register_frame(
    ctx: &SessionContext,
    name: &str,
    schema: Arc<Schema>,
    batches: Vec<RecordBatch>,
) -> Result<DataFrame, Error> {
    let table = MemTable::try_new(schema, vec![batches])?;
    ctx.register_table(name, Arc::new(table))?;

    Ok(ctx.table(name).await?)
}

///
/// Full outer join of the network rows with the attribution aggregate.
///
/// # Arguments
/// * `ctx` - The [`SessionContext`] the frames are registered in
/// * `network_batches` - Batches of both network tables, see [`network_batch`]
/// * `attribution_batches` - Batches of the attribution aggregate, see [`attribution_batch`]
///
/// # Returns
/// A Result containing either the merged [`DataFrame`] or an [`Error`].
/// Rows present on one side only keep nulls for the other side; `day`,
/// `month` and `client` fall back to the attribution values.
pub async fn merge_performance(
    ctx: &SessionContext,
    network_batches: Vec<RecordBatch>,
    attribution_batches: Vec<RecordBatch>,
) -> Result<DataFrame, Error> {
    let network_df = register_frame(ctx, "network", network_schema(), network_batches)
        .await?
        .distinct()?;
    let attribution_df =
        register_frame(ctx, "attribution", attribution_schema(), attribution_batches).await?;

    let df = network_df.join(
        attribution_df,
        JoinType::Full,
        &["key_network"],
        &["key_af"],
        None,
    )?;

    let merged_df = df.select(vec![
        coalesce(vec![col("day"), col("install_time")]).alias("day"),
        coalesce(vec![col("month"), col("month_af")]).alias("month"),
        col("network"),
        coalesce(vec![col("client"), col("client_af")]).alias("client"),
        col("campaign_network"),
        col("site_network"),
        col("site_name_network"),
        col("impressions"),
        col("clicks"),
        col("conversions"),
        col("spend"),
        col("key_network"),
        col("key_af"),
        col("install_time"),
        col("app_id"),
        col("media_source"),
        col("ad_type_af"),
        col("adset"),
        col("campaign_af"),
        col("site_af"),
        col("install_af"),
        col("reg_af"),
        col("deposit_af"),
    ])?;

    Ok(merged_df)
}

/// Adds the `cpa` column: the payout at (app_id, media_source, month), 0 when
/// the lookup has no entry.
pub async fn attach_cpa(
    ctx: &SessionContext,
    merged_df: DataFrame,
    payouts: &HashMap<PayoutKey, f64>,
) -> Result<DataFrame, Error> {
    let payout_df =
        register_frame(ctx, "payouts", payout_schema(), vec![payout_batch(payouts)?]).await?;

    let tmp_app_id = "payout_app_id";
    let tmp_media_source = "payout_media_source";
    let tmp_month = "payout_month";

    let df = merged_df.join(
        payout_df,
        JoinType::Left,
        &["app_id", "media_source", "month"],
        &[tmp_app_id, tmp_media_source, tmp_month],
        None,
    )?;

    let df = df
        .drop_columns(&[tmp_app_id, tmp_media_source, tmp_month])?
        .with_column_renamed("payout", "cpa")?;

    // Rows without a payout entry come out of the left join as null
    let df = df.fill_null(ScalarValue::Float64(Some(0.0)), vec!["cpa".to_owned()])?;

    Ok(df)
}

/// Reads the collected merge result back into [`MergedRecord`]s.
pub fn to_merged_records(batches: &[RecordBatch]) -> Result<Vec<MergedRecord>, Error> {
    let mut records = Vec::new();

    for batch in batches {
        let day = date_column(batch, "day")?;
        let month = string_column(batch, "month")?;
        let network = string_column(batch, "network")?;
        let client = string_column(batch, "client")?;
        let campaign_network = string_column(batch, "campaign_network")?;
        let site_network = string_column(batch, "site_network")?;
        let site_name_network = string_column(batch, "site_name_network")?;
        let impressions = float_column(batch, "impressions")?;
        let clicks = float_column(batch, "clicks")?;
        let conversions = float_column(batch, "conversions")?;
        let spend = float_column(batch, "spend")?;
        let key_network = string_column(batch, "key_network")?;
        let key_af = string_column(batch, "key_af")?;
        let install_time = date_column(batch, "install_time")?;
        let app_id = string_column(batch, "app_id")?;
        let media_source = string_column(batch, "media_source")?;
        let ad_type_af = string_column(batch, "ad_type_af")?;
        let adset = string_column(batch, "adset")?;
        let campaign_af = string_column(batch, "campaign_af")?;
        let site_af = string_column(batch, "site_af")?;
        let install_af = int_column(batch, "install_af")?;
        let reg_af = int_column(batch, "reg_af")?;
        let deposit_af = int_column(batch, "deposit_af")?;
        let cpa = float_column(batch, "cpa")?;

        for i in 0..batch.num_rows() {
            records.push(MergedRecord {
                day: day[i],
                month: month[i].clone(),
                network: network[i].clone(),
                client: client[i].clone(),
                campaign_network: campaign_network[i].clone(),
                site_network: site_network[i].clone(),
                site_name_network: site_name_network[i].clone(),
                impressions: impressions[i],
                clicks: clicks[i],
                conversions: conversions[i],
                spend: spend[i],
                key_network: key_network[i].clone(),
                key_af: key_af[i].clone(),
                install_time: install_time[i],
                app_id: app_id[i].clone(),
                media_source: media_source[i].clone(),
                ad_type_af: ad_type_af[i].clone(),
                adset: adset[i].clone(),
                campaign_af: campaign_af[i].clone(),
                site_af: site_af[i].clone(),
                install_af: install_af[i],
                reg_af: reg_af[i],
                deposit_af: deposit_af[i],
                cpa: cpa[i].unwrap_or(0.0),
            });
        }
    }

    Ok(records)
}

fn column_as(batch: &RecordBatch, name: &str, data_type: &DataType) -> Result<ArrayRef, Error> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| Error::MissingColumn {
            source_name: MERGED_FRAME.to_string(),
            column: name.to_string(),
        })?;

    if column.data_type() == data_type {
        Ok(column.clone())
    } else {
        Ok(cast_with_options(
            column.as_ref(),
            data_type,
            &CastOptions::default(),
        )?)
    }
}

fn unexpected_type(name: &str) -> Error {
    Error::UnexpectedPayload {
        source_name: MERGED_FRAME.to_string(),
        payload: format!("column {} has an unexpected type", name),
    }
}

fn string_column(batch: &RecordBatch, name: &str) -> Result<Vec<Option<String>>, Error> {
    let array = column_as(batch, name, &DataType::Utf8)?;
    let values = array
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| unexpected_type(name))?;

    Ok(values.iter().map(|v| v.map(str::to_string)).collect())
}

fn float_column(batch: &RecordBatch, name: &str) -> Result<Vec<Option<f64>>, Error> {
    let array = column_as(batch, name, &DataType::Float64)?;
    let values = array
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| unexpected_type(name))?;

    Ok(values.iter().collect())
}

fn int_column(batch: &RecordBatch, name: &str) -> Result<Vec<Option<i64>>, Error> {
    let array = column_as(batch, name, &DataType::Int64)?;
    let values = array
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| unexpected_type(name))?;

    Ok(values.iter().collect())
}

fn date_column(batch: &RecordBatch, name: &str) -> Result<Vec<Option<NaiveDate>>, Error> {
    let array = column_as(batch, name, &DataType::Date64)?;
    let values = array
        .as_any()
        .downcast_ref::<Date64Array>()
        .ok_or_else(|| unexpected_type(name))?;

    values
        .iter()
        .map(|v| {
            v.map(|ms| {
                unix_ms_to_date(ms).ok_or_else(|| Error::InvalidDate {
                    date: ms.to_string(),
                })
            })
            .transpose()
        })
        .collect()
}

pub fn date_to_unix_ms(day: NaiveDate) -> i64 {
    (day - NaiveDateTime::UNIX_EPOCH.date()).num_milliseconds()
}

pub fn unix_ms_to_date(ms: i64) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| dt.date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payout_loader::{payout_lookup, payouts_from_grid};
    use crate::reconcile::AttributionAggregator;
    use crate::records::{AttributionRecord, PayoutRecord};

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn network_record(day_str: &str, campaign: &str, site: &str, spend: f64) -> NetworkRecord {
        NetworkRecord {
            day: day(day_str),
            campaign_network: campaign.to_string(),
            site_network: site.to_string(),
            site_name_network: "com.site".to_string(),
            impressions: Some(100.0),
            clicks: Some(10.0),
            conversions: Some(1.0),
            spend: Some(spend),
            client: Some("liga_stavok".to_string()),
            network: "mintegral".to_string(),
            key_network: network_key(day(day_str), campaign, site),
        }
    }

    fn deposit(install: &str, campaign: &str, site: &str) -> AttributionRecord {
        AttributionRecord {
            appsflyer_id: Some("af-1".to_string()),
            client: Some("client1".to_string()),
            app_id: Some("X".to_string()),
            event_name: "deposit".to_string(),
            event_time: Some(day(install)),
            install_time: Some(day(install)),
            media_source: Some("Y".to_string()),
            adset: None,
            ad_type_af: None,
            campaign_af: Some(campaign.to_string()),
            site_af: Some(site.to_string()),
            reg_af: 0,
            deposit_af: 1,
        }
    }

    fn payout(app_id: &str, media_source: &str, month: &str, payout: f64) -> PayoutRecord {
        PayoutRecord {
            app_id: app_id.to_string(),
            media_source: media_source.to_string(),
            month: month.to_string(),
            payout,
        }
    }

    async fn merge(
        network: Vec<NetworkRecord>,
        attribution: Vec<AttributionRecord>,
        payouts: Vec<PayoutRecord>,
    ) -> Vec<MergedRecord> {
        let ctx = SessionContext::new();

        let mut aggregator = AttributionAggregator::default();
        aggregator.extend(attribution);
        let summaries = aggregator.finish();

        let df = merge_performance(
            &ctx,
            vec![network_batch(&network).unwrap()],
            vec![attribution_batch(&summaries).unwrap()],
        )
        .await
        .unwrap();
        let df = attach_cpa(&ctx, df, &payout_lookup(payouts)).await.unwrap();

        let mut records = to_merged_records(&df.collect().await.unwrap()).unwrap();
        records.sort_by(|a, b| {
            (a.key_network.clone(), a.key_af.clone()).cmp(&(b.key_network.clone(), b.key_af.clone()))
        });
        records
    }

    #[test]
    fn test_schemas() {
        let schema = network_schema();
        assert_eq!(schema.fields().len(), 12);
        assert_eq!(schema.field(0).name(), "day");
        assert_eq!(schema.field(11).name(), "key_network");

        let schema = attribution_schema();
        assert_eq!(schema.fields().len(), 13);
        assert_eq!(schema.field(0).name(), "key_af");

        assert_eq!(payout_schema().fields().len(), 4);
    }

    #[test]
    fn test_date_to_unix_ms() {
        assert_eq!(date_to_unix_ms(day("2023-10-01")), 1696118400000);
        assert_eq!(unix_ms_to_date(1696118400000), Some(day("2023-10-01")));
    }

    #[test]
    fn test_network_batch_rebuilds_key() {
        let mut record = network_record("2024-01-10", "client1_promo", "site", 5.0);
        record.key_network = "20240110client1_promosite".to_string();

        let batch = network_batch(&[record]).unwrap();
        let keys = string_column(&batch, "key_network").unwrap();
        assert_eq!(keys, vec![Some("2024-01-10|client1_promo|site".to_string())]);
        assert_eq!(
            string_column(&batch, "month").unwrap(),
            vec![Some("jan".to_string())]
        );
    }

    #[tokio::test]
    async fn test_merge_prices_matching_rows() {
        let records = merge(
            vec![network_record("2024-01-10", "client1_promo", "site", 5.0)],
            vec![deposit("2024-01-10", "client1_promo", "site")],
            vec![payout("X", "Y", "jan", 12.5)],
        )
        .await;

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.day, Some(day("2024-01-10")));
        assert_eq!(record.month.as_deref(), Some("jan"));
        assert_eq!(record.spend, Some(5.0));
        assert_eq!(record.key_af, record.key_network);
        assert_eq!(record.deposit_af, Some(1));
        assert_eq!(record.install_af, Some(0));
        assert_eq!(record.client.as_deref(), Some("liga_stavok"));
        assert_eq!(record.cpa, 12.5);
    }

    #[tokio::test]
    async fn test_merge_without_payout_is_zero() {
        let records = merge(
            vec![network_record("2024-01-10", "client1_promo", "site", 5.0)],
            vec![deposit("2024-01-10", "client1_promo", "site")],
            vec![payout("X", "Y", "feb", 12.5), payout("X", "Z", "jan", 3.0)],
        )
        .await;

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].cpa, 0.0);
    }

    #[tokio::test]
    async fn test_merge_blank_payout_is_zero() {
        let grid: Vec<Vec<String>> = vec![
            vec!["app_id", "media_source", "month", "payout"],
            vec!["X", "Y", "jan", ""],
        ]
        .into_iter()
        .map(|row| row.into_iter().map(str::to_string).collect())
        .collect();

        let records = merge(
            vec![network_record("2024-01-10", "client1_promo", "site", 5.0)],
            vec![deposit("2024-01-10", "client1_promo", "site")],
            payouts_from_grid(&grid).unwrap(),
        )
        .await;

        assert_eq!(records[0].cpa, 0.0);
    }

    #[tokio::test]
    async fn test_merge_keeps_unmatched_rows() {
        let records = merge(
            vec![
                network_record("2024-01-10", "client1_promo", "site", 5.0),
                network_record("2024-01-10", "client1_promo", "site", 5.0),
            ],
            vec![deposit("2024-01-12", "client2_promo", "other_site")],
            vec![payout("X", "Y", "jan", 7.0)],
        )
        .await;

        assert_eq!(records.len(), 2);

        // Attribution only: day, month and client come from the install
        let attribution_only = &records[0];
        assert_eq!(attribution_only.key_network, None);
        assert_eq!(attribution_only.day, Some(day("2024-01-12")));
        assert_eq!(attribution_only.month.as_deref(), Some("jan"));
        assert_eq!(attribution_only.client.as_deref(), Some("client1"));
        assert_eq!(attribution_only.spend, None);
        assert_eq!(attribution_only.cpa, 7.0);

        let network_only = &records[1];
        assert_eq!(network_only.key_af, None);
        assert_eq!(network_only.app_id, None);
        assert_eq!(network_only.deposit_af, None);
        assert_eq!(network_only.cpa, 0.0);
    }

    #[tokio::test]
    async fn test_merge_empty_inputs() {
        let ctx = SessionContext::new();
        let df = merge_performance(&ctx, vec![], vec![]).await.unwrap();
        assert_eq!(df.count().await.unwrap(), 0);
    }

    #[test]
    fn test_to_merged_records_missing_column() {
        let batch = payout_batch(&HashMap::new()).unwrap();
        assert!(matches!(
            to_merged_records(&[batch]).unwrap_err(),
            Error::MissingColumn { column, .. } if column == "day"
        ));
    }
}
