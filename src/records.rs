use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashSet;

/// Separates the components of a dedup key. Occurrences inside a component
/// are escaped with `KEY_ESCAPE`, so distinct (campaign, site) pairs never
/// collapse into the same string.
const KEY_SEPARATOR: char = '|';
const KEY_ESCAPE: char = '\\';

/// Raw network tables in the relational store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkTable {
    Mintegral,
    Unity,
}

impl NetworkTable {
    pub fn name(&self) -> &'static str {
        match self {
            NetworkTable::Mintegral => "raw_mint",
            NetworkTable::Unity => "raw_ru_unity_sites_liga_betboom_pari",
        }
    }

    /// Value of the `network` column for rows of this table.
    pub fn network(&self) -> &'static str {
        match self {
            NetworkTable::Mintegral => "mintegral",
            NetworkTable::Unity => "unity",
        }
    }
}

/// One (day, campaign, site) row from an ad network.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct NetworkRecord {
    pub day: NaiveDate,
    pub campaign_network: String,
    pub site_network: String,
    pub site_name_network: String,
    pub impressions: Option<f64>,
    pub clicks: Option<f64>,
    pub conversions: Option<f64>,
    pub spend: Option<f64>,
    pub client: Option<String>,
    pub network: String,
    pub key_network: String,
}

/// One attribution event (or install) as stored in `raw_af_table`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, sqlx::FromRow)]
pub struct AttributionRecord {
    pub appsflyer_id: Option<String>,
    pub client: Option<String>,
    pub app_id: Option<String>,
    pub event_name: String,
    pub event_time: Option<NaiveDate>,
    pub install_time: Option<NaiveDate>,
    pub media_source: Option<String>,
    pub adset: Option<String>,
    pub ad_type_af: Option<String>,
    pub campaign_af: Option<String>,
    pub site_af: Option<String>,
    pub reg_af: i32,
    pub deposit_af: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayoutRecord {
    pub app_id: String,
    pub media_source: String,
    pub month: String,
    pub payout: f64,
}

/// A row of the warehouse table: network spend joined with attributed
/// installs and events, priced with the payout of its month.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedRecord {
    pub day: Option<NaiveDate>,
    pub month: Option<String>,
    pub network: Option<String>,
    pub client: Option<String>,
    pub campaign_network: Option<String>,
    pub site_network: Option<String>,
    pub site_name_network: Option<String>,
    pub impressions: Option<f64>,
    pub clicks: Option<f64>,
    pub conversions: Option<f64>,
    pub spend: Option<f64>,
    pub key_network: Option<String>,
    pub key_af: Option<String>,
    pub install_time: Option<NaiveDate>,
    pub app_id: Option<String>,
    pub media_source: Option<String>,
    pub ad_type_af: Option<String>,
    pub adset: Option<String>,
    pub campaign_af: Option<String>,
    pub site_af: Option<String>,
    pub install_af: Option<i64>,
    pub reg_af: Option<i64>,
    pub deposit_af: Option<i64>,
    pub cpa: f64,
}

/// Dedup key shared by network rows (`key_network`) and aggregated
/// attribution rows (`key_af`).
pub fn network_key(day: NaiveDate, campaign: &str, site: &str) -> String {
    format!(
        "{}{KEY_SEPARATOR}{}{KEY_SEPARATOR}{}",
        day.format("%Y-%m-%d"),
        escape_key_part(campaign),
        escape_key_part(site)
    )
}

fn escape_key_part(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for c in part.chars() {
        if c == KEY_SEPARATOR || c == KEY_ESCAPE {
            escaped.push(KEY_ESCAPE);
        }
        escaped.push(c);
    }
    escaped
}

/// Drops records whose `key_network` was already seen, keeping the first.
pub fn dedup_by_key(records: Vec<NetworkRecord>) -> Vec<NetworkRecord> {
    let mut seen = HashSet::with_capacity(records.len());
    records
        .into_iter()
        .filter(|record| seen.insert(record.key_network.clone()))
        .collect()
}

/// Drops exact duplicate rows, keeping the first occurrence.
pub fn dedup_exact(records: Vec<AttributionRecord>) -> Vec<AttributionRecord> {
    let mut seen = HashSet::with_capacity(records.len());
    records
        .into_iter()
        .filter(|record| seen.insert(record.clone()))
        .collect()
}
