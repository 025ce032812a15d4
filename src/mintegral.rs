use crate::config::MintegralConfig;
use crate::error::Error;
use crate::polling::{poll_until_ready, PollPolicy, PollStatus};
use crate::records::{dedup_by_key, network_key, NetworkRecord, NetworkTable};
use crate::rules::ClientRules;
use crate::window::{parse_day, Window};
use chrono::Utc;
use log::{debug, info};
use md5::{Digest, Md5};
use reqwest::{header::CONTENT_TYPE, Client, Response, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;

const SOURCE: &str = "Mintegral";

/// `code` of a JSON poll response meaning the report is still being built.
const NOT_READY_CODE: i64 = 204;

const START_REPORT: &str = "1";
const FETCH_REPORT: &str = "2";

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait MintegralApi: Send + Sync + 'static {
    /// Requests a report for the window and waits until it is generated.
    /// # Arguments
    /// * `account` - Credentials of the advertiser account to report on.
    /// * `window` - Days to include.
    /// # Returns
    /// The parsed report rows, or an Error when the report could not be
    /// produced within the configured number of polls.
    async fn fetch_report(
        &self,
        account: &MintegralAccount,
        window: &Window,
    ) -> Result<Vec<MintegralRow>, Error>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MintegralAccount {
    pub api_key: String,
    pub access_key: String,
}

impl MintegralAccount {
    /// Accounts configured for the job, the second one being optional.
    pub fn from_config(config: &MintegralConfig) -> Vec<MintegralAccount> {
        let mut accounts = vec![MintegralAccount {
            api_key: config.api_key_1.clone(),
            access_key: config.access_key_1.clone(),
        }];

        if let (Some(api_key), Some(access_key)) = (&config.api_key_2, &config.access_key_2) {
            accounts.push(MintegralAccount {
                api_key: api_key.clone(),
                access_key: access_key.clone(),
            });
        }

        accounts
    }
}

/// A row of the tab separated report.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct MintegralRow {
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Offer Name", default)]
    pub offer_name: String,
    #[serde(rename = "Sub Id", default)]
    pub sub_id: String,
    #[serde(rename = "Package Name", default)]
    pub package_name: String,
    #[serde(rename = "Impression", default, deserialize_with = "csv::invalid_option")]
    pub impression: Option<f64>,
    #[serde(rename = "Click", default, deserialize_with = "csv::invalid_option")]
    pub click: Option<f64>,
    #[serde(rename = "Conversion", default, deserialize_with = "csv::invalid_option")]
    pub conversion: Option<f64>,
    #[serde(rename = "Spend", default, deserialize_with = "csv::invalid_option")]
    pub spend: Option<f64>,
}

#[derive(Clone)]
pub struct MintegralClient {
    client: Client,
    base_url: String,
    poll: PollPolicy,
}

impl MintegralClient {
    pub fn new(config: &MintegralConfig) -> Self {
        MintegralClient {
            client: Client::new(),
            base_url: config.api_url.to_string(),
            poll: PollPolicy {
                interval: Duration::from_secs(config.poll_interval_secs),
                max_attempts: config.max_poll_attempts,
            },
        }
    }

    async fn request(
        &self,
        account: &MintegralAccount,
        window: &Window,
        report_type: &str,
    ) -> Result<Response, Error> {
        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| Error::UrlParsingFailed(url::ParseError::SetHostOnCannotBeABaseUrl))?
            .pop_if_empty()
            .extend(&["api", "v2", "reports", "data"]);
        url.query_pairs_mut()
            .append_pair("start_time", &window.start.format("%Y-%m-%d").to_string())
            .append_pair("end_time", &window.end.format("%Y-%m-%d").to_string())
            .append_pair("timezone", "+0")
            .append_pair("type", report_type)
            .append_pair("dimension_option", "Day,Offer,Package,Sub");

        let timestamp = Utc::now().timestamp();

        let resp = self
            .client
            .get(url)
            .header("access-key", &account.access_key)
            .header("api-key", &account.api_key)
            .header("token", request_token(&account.api_key, timestamp))
            .header("timestamp", timestamp.to_string())
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await?;

        Ok(resp)
    }

    async fn poll_report(
        &self,
        account: &MintegralAccount,
        window: &Window,
    ) -> Result<PollStatus<String>, Error> {
        let resp = self.request(account, window, FETCH_REPORT).await?;
        let status = resp.status();
        let body = resp.text().await?;

        if status != StatusCode::OK {
            return Err(Error::UnexpectedStatus {
                source_name: SOURCE.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        interpret_poll_body(&body)
    }
}

#[async_trait::async_trait]
impl MintegralApi for MintegralClient {
    async fn fetch_report(
        &self,
        account: &MintegralAccount,
        window: &Window,
    ) -> Result<Vec<MintegralRow>, Error> {
        let resp = self.request(account, window, START_REPORT).await?;

        match resp.status() {
            StatusCode::OK => info!("Mintegral report generation started for {}", window),
            status => {
                return Err(Error::UnexpectedStatus {
                    source_name: SOURCE.to_string(),
                    status: status.as_u16(),
                    body: resp.text().await.unwrap_or_default(),
                });
            }
        }

        let body = poll_until_ready(&self.poll, "Mintegral report", move |attempt| {
            debug!("Polling Mintegral report, attempt {}", attempt);
            self.poll_report(account, window)
        })
        .await?;

        parse_report(&body)
    }
}

/// `md5(api_key + md5(timestamp))`, hex encoded.
pub fn request_token(api_key: &str, timestamp: i64) -> String {
    let encoded_timestamp = md5_hex(&timestamp.to_string());
    md5_hex(&format!("{}{}", api_key, encoded_timestamp))
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", Md5::digest(input.as_bytes()))
}

/// A JSON body is a status message, anything else is the finished report.
fn interpret_poll_body(body: &str) -> Result<PollStatus<String>, Error> {
    if let Ok(payload) = serde_json::from_str::<serde_json::Value>(body) {
        if payload.get("code").and_then(serde_json::Value::as_i64) == Some(NOT_READY_CODE) {
            return Ok(PollStatus::Pending);
        }

        return Err(Error::UnexpectedPayload {
            source_name: SOURCE.to_string(),
            payload: payload.to_string(),
        });
    }

    let report = body.trim();
    if report.is_empty() {
        return Err(Error::EmptyReport {
            source_name: SOURCE.to_string(),
        });
    }

    Ok(PollStatus::Ready(report.to_string()))
}

pub fn parse_report(body: &str) -> Result<Vec<MintegralRow>, Error> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());

    let rows = reader
        .deserialize::<MintegralRow>()
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Turns report rows into network records: rows of unknown clients and rows
/// with an unreadable date are dropped, then duplicates by key.
pub fn process_report(rows: Vec<MintegralRow>, rules: &ClientRules) -> Vec<NetworkRecord> {
    let total = rows.len();

    let records = rows
        .into_iter()
        .filter_map(|row| {
            let client = rules.classify(&row.offer_name)?.to_string();
            let Some(day) = parse_day(&row.date) else {
                debug!("Dropping Mintegral row with invalid date '{}'", row.date);
                return None;
            };

            Some(NetworkRecord {
                key_network: network_key(day, &row.offer_name, &row.sub_id),
                day,
                campaign_network: row.offer_name,
                site_network: row.sub_id,
                site_name_network: row.package_name,
                impressions: row.impression,
                clicks: row.click,
                conversions: row.conversion,
                spend: row.spend,
                client: Some(client),
                network: NetworkTable::Mintegral.network().to_string(),
            })
        })
        .collect();

    let records = dedup_by_key(records);
    info!("Kept {} of {} Mintegral rows", records.len(), total);

    records
}
