use crate::config::UnityConfig;
use crate::error::Error;
use crate::records::{dedup_by_key, network_key, NetworkRecord, NetworkTable};
use crate::rules::ClientRules;
use crate::window::{parse_day, Window};
use chrono::Duration;
use log::{debug, info};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;

const SOURCE: &str = "Unity";

/// Unity does not expose the publisher package name.
const NO_SITE_NAME: &str = "no_data_from_unity";

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait UnityApi: Send + Sync + 'static {
    /// Fetches the daily acquisitions report of one application.
    /// # Arguments
    /// * `app_id` - The advertised application.
    /// * `window` - Days to include.
    /// # Returns
    /// The report rows or an Error when the request failed.
    async fn fetch_report(&self, app_id: &str, window: &Window) -> Result<Vec<UnityRow>, Error>;
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct UnityRow {
    pub timestamp: String,
    #[serde(rename = "campaign name", default)]
    pub campaign_name: String,
    #[serde(rename = "source app id", default)]
    pub source_app_id: String,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub starts: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub clicks: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub installs: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pub spend: Option<f64>,
}

#[derive(Clone)]
pub struct UnityClient {
    client: Client,
    base_url: String,
    key_id: String,
    secret_key: String,
    organization_id: String,
}

impl UnityClient {
    pub fn new(config: &UnityConfig) -> Self {
        UnityClient {
            client: Client::new(),
            base_url: config.api_url.to_string(),
            key_id: config.key_id.to_string(),
            secret_key: config.secret_key.to_string(),
            organization_id: config.organization_id.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl UnityApi for UnityClient {
    async fn fetch_report(&self, app_id: &str, window: &Window) -> Result<Vec<UnityRow>, Error> {
        // The report end is exclusive.
        let end = window.end + Duration::days(1);

        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| Error::UrlParsingFailed(url::ParseError::SetHostOnCannotBeABaseUrl))?
            .pop_if_empty()
            .extend(&[
                "advertise",
                "stats",
                "v2",
                "organizations",
                self.organization_id.as_str(),
                "reports",
                "acquisitions",
            ]);
        url.query_pairs_mut()
            .append_pair("start", &window.start.format("%Y-%m-%d").to_string())
            .append_pair("end", &end.format("%Y-%m-%d").to_string())
            .append_pair("scale", "day")
            .append_pair("appIds", app_id)
            .append_pair("metrics", "starts,clicks,installs,spend")
            .append_pair("breakdowns", "app,campaign,sourceAppId");

        info!("Requesting Unity data for {} {} → {}", app_id, window.start, end);

        let resp = self
            .client
            .get(url)
            .basic_auth(&self.key_id, Some(&self.secret_key))
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

pub fn parse_report(body: &str) -> Result<Vec<UnityRow>, Error> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());

    let rows = reader
        .deserialize::<UnityRow>()
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Keeps rows with positive spend and maps them onto network records.
pub fn process_report(rows: Vec<UnityRow>, rules: &ClientRules) -> Vec<NetworkRecord> {
    let total = rows.len();

    let records = rows
        .into_iter()
        .filter(|row| row.spend.is_some_and(|spend| spend > 0.0))
        .filter_map(|row| {
            let Some(day) = parse_day(&row.timestamp) else {
                debug!("Dropping Unity row with invalid timestamp '{}'", row.timestamp);
                return None;
            };

            let site = if row.source_app_id.eq_ignore_ascii_case("nan") {
                String::new()
            } else {
                row.source_app_id
            };

            Some(NetworkRecord {
                key_network: network_key(day, &row.campaign_name, &site),
                day,
                client: Some(rules.classify_or_default(&row.campaign_name).to_string()),
                campaign_network: row.campaign_name,
                site_network: site,
                site_name_network: NO_SITE_NAME.to_string(),
                impressions: row.starts,
                clicks: row.clicks,
                conversions: row.installs,
                spend: row.spend,
                network: NetworkTable::Unity.network().to_string(),
            })
        })
        .collect();

    let records = dedup_by_key(records);
    info!("Kept {} of {} Unity rows", records.len(), total);

    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use wiremock::matchers::{basic_auth, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const REPORT: &str = "timestamp,app,campaign name,source app id,starts,clicks,installs,spend\n\
        2024-01-10T00:00:00.000Z,app1,client1_promo,src_1,100,10,2,4.5\n\
        2024-01-10T00:00:00.000Z,app1,client2_promo,nan,50,5,1,0\n\
        2024-01-10T00:00:00.000Z,app1,other_campaign,,70,7,1,1.25\n\
        2024-01-10T00:00:00.000Z,app1,client3_promo,src_3,70,n/a,1,abc\n";

    fn config(api_url: &str) -> UnityConfig {
        UnityConfig {
            api_url: api_url.to_string(),
            key_id: "key".to_string(),
            secret_key: "secret".to_string(),
            organization_id: "org-1".to_string(),
            app_ids: vec!["app1".to_string()],
            database_url: "postgres://localhost/test".to_string(),
            client_rules: vec![],
        }
    }

    fn window() -> Window {
        Window::new(
            NaiveDate::from_ymd_opt(2024, 1, 9).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_process_report_filters_spend() {
        let rows = parse_report(REPORT).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[3].clicks, None);

        let records = process_report(rows, &ClientRules::default());
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.day, NaiveDate::from_ymd_opt(2024, 1, 10).unwrap());
        assert_eq!(first.key_network, "2024-01-10|client1_promo|src_1");
        assert_eq!(first.impressions, Some(100.0));
        assert_eq!(first.conversions, Some(2.0));
        assert_eq!(first.client.as_deref(), Some("liga_stavok"));
        assert_eq!(first.site_name_network, NO_SITE_NAME);
        assert_eq!(first.network, "unity");

        let second = &records[1];
        assert_eq!(second.site_network, "");
        assert_eq!(second.client.as_deref(), Some("Other"));
    }

    #[test]
    fn test_nan_site_is_blank() {
        let rows = vec![UnityRow {
            timestamp: "2024-01-10".to_string(),
            campaign_name: "c".to_string(),
            source_app_id: "nan".to_string(),
            starts: None,
            clicks: None,
            installs: None,
            spend: Some(1.0),
        }];

        let records = process_report(rows, &ClientRules::default());
        assert_eq!(records[0].site_network, "");
        assert_eq!(records[0].key_network, "2024-01-10|c|");
    }

    #[tokio::test]
    async fn test_fetch_report() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path(
                "/advertise/stats/v2/organizations/org-1/reports/acquisitions",
            ))
            .and(basic_auth("key", "secret"))
            .and(query_param("start", "2024-01-09"))
            .and(query_param("end", "2024-01-11"))
            .and(query_param("appIds", "app1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(REPORT))
            .mount(&server)
            .await;

        let client = UnityClient::new(&config(&server.uri()));
        let rows = client.fetch_report("app1", &window()).await.unwrap();
        assert_eq!(rows.len(), 4);
    }

    #[tokio::test]
    async fn test_fetch_report_failure() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .mount(&server)
            .await;

        let client = UnityClient::new(&config(&server.uri()));
        let result = client.fetch_report("app1", &window()).await;
        assert!(matches!(
            result.unwrap_err(),
            Error::UnexpectedStatus { status: 401, .. }
        ));
    }
}
