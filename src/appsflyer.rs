use crate::config::AppsFlyerConfig;
use crate::error::Error;
use crate::records::{dedup_exact, AttributionRecord};
use crate::rules::{AppClients, EventKind};
use crate::window::{parse_day, Window};
use log::info;
use reqwest::{header::ACCEPT, Client, StatusCode, Url};
use serde::Deserialize;

const SOURCE: &str = "AppsFlyer";
const MAXIMUM_ROWS: &str = "1000000";
const ADDITIONAL_FIELDS: &str = "blocked_reason_rule,store_reinstall,impressions,\
contributor3_match_type,custom_dimension,conversion_type,gp_click_time,match_type,\
mediation_network,oaid,deeplink_url,blocked_reason,blocked_sub_reason,gp_broadcast_referrer,\
gp_install_begin,campaign_type,custom_data,rejected_reason,device_download_time,\
keyword_match_type,contributor1_match_type,contributor2_match_type,device_model,\
monetization_network,segment,is_lat,gp_referrer,blocked_reason_value,store_product_page,\
device_category,app_type,rejected_reason_value,ad_unit,keyword_id,placement,\
network_account_id,install_app_store,amazon_aid,att,engagement_type,gdpr_applies,\
ad_user_data_enabled,ad_personalization_enabled";

/// Raw data exports pulled for every application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    InAppEvents,
    Installs,
}

impl ReportKind {
    pub const ALL: [ReportKind; 2] = [ReportKind::InAppEvents, ReportKind::Installs];

    fn path(&self) -> &'static str {
        match self {
            ReportKind::InAppEvents => "in_app_events_report",
            ReportKind::Installs => "installs_report",
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait AppsFlyerApi: Send + Sync + 'static {
    /// Downloads one raw data export of one application.
    /// # Arguments
    /// * `report` - Which export to download.
    /// * `app_id` - The application.
    /// * `window` - Days to include.
    /// # Returns
    /// The export rows or an Error when the request failed.
    async fn fetch_report(
        &self,
        report: ReportKind,
        app_id: &str,
        window: &Window,
    ) -> Result<Vec<AppsFlyerRow>, Error>;
}

/// A row of a raw data export. Both the export's display headers and
/// snake_case headers are accepted.
#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
pub struct AppsFlyerRow {
    #[serde(rename = "AppsFlyer ID", alias = "appsflyer_id", default)]
    pub appsflyer_id: Option<String>,
    #[serde(rename = "App ID", alias = "app_id", default)]
    pub app_id: Option<String>,
    #[serde(rename = "Event Name", alias = "event_name", default)]
    pub event_name: Option<String>,
    #[serde(rename = "Event Time", alias = "event_time", default)]
    pub event_time: Option<String>,
    #[serde(rename = "Install Time", alias = "install_time", default)]
    pub install_time: Option<String>,
    #[serde(rename = "Media Source", alias = "media_source", default)]
    pub media_source: Option<String>,
    #[serde(rename = "Adset", alias = "adset", default)]
    pub adset: Option<String>,
    #[serde(rename = "Ad Type", alias = "ad_type", default)]
    pub ad_type: Option<String>,
    #[serde(rename = "Campaign", alias = "campaign", default)]
    pub campaign: Option<String>,
    #[serde(rename = "Site ID", alias = "site_id", default)]
    pub site_id: Option<String>,
}

#[derive(Clone)]
pub struct AppsFlyerClient {
    client: Client,
    base_url: String,
    token: String,
}

impl AppsFlyerClient {
    pub fn new(config: &AppsFlyerConfig) -> Self {
        AppsFlyerClient {
            client: Client::new(),
            base_url: config.api_url.to_string(),
            token: config.api_token.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl AppsFlyerApi for AppsFlyerClient {
    async fn fetch_report(
        &self,
        report: ReportKind,
        app_id: &str,
        window: &Window,
    ) -> Result<Vec<AppsFlyerRow>, Error> {
        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| Error::UrlParsingFailed(url::ParseError::SetHostOnCannotBeABaseUrl))?
            .pop_if_empty()
            .extend(&[
                "api",
                "raw-data",
                "export",
                "app",
                app_id,
                report.path(),
                "v5",
            ]);
        url.query_pairs_mut()
            .append_pair("from", &window.start.format("%Y-%m-%d").to_string())
            .append_pair("to", &window.end.format("%Y-%m-%d").to_string())
            .append_pair("maximum_rows", MAXIMUM_ROWS)
            .append_pair("additional_fields", ADDITIONAL_FIELDS);

        let resp = self
            .client
            .get(url)
            .header(ACCEPT, "text/csv")
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;

        if status != StatusCode::OK {
            return Err(Error::UnexpectedStatus {
                source_name: SOURCE.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        parse_report(&body)
    }
}

pub fn parse_report(body: &str) -> Result<Vec<AppsFlyerRow>, Error> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());

    let rows = reader
        .deserialize::<AppsFlyerRow>()
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Keeps the tracked events, labels them with their client and flags, and
/// drops exact duplicates.
pub fn process_rows(rows: Vec<AppsFlyerRow>, app_clients: &AppClients) -> Vec<AttributionRecord> {
    let total = rows.len();

    let records = rows
        .into_iter()
        .filter_map(|row| {
            let event = EventKind::normalize(row.event_name.as_deref()?)?;
            let client = row
                .app_id
                .as_deref()
                .and_then(|app_id| app_clients.client_for(app_id))
                .map(str::to_string);

            Some(AttributionRecord {
                appsflyer_id: row.appsflyer_id,
                client,
                app_id: row.app_id,
                event_name: event.as_str().to_string(),
                event_time: row.event_time.as_deref().and_then(parse_day),
                install_time: row.install_time.as_deref().and_then(parse_day),
                media_source: row.media_source,
                adset: row.adset,
                ad_type_af: row.ad_type,
                campaign_af: row.campaign,
                site_af: row.site_id,
                reg_af: i32::from(event == EventKind::Register),
                deposit_af: i32::from(event == EventKind::Deposit),
            })
        })
        .collect();

    let records = dedup_exact(records);
    info!("Kept {} of {} AppsFlyer rows", records.len(), total);

    records
}
