use crate::config::MergeConfig;
use crate::error::Error;
use crate::google_auth::{GoogleCredentials, SHEETS_READONLY_SCOPE};
use crate::records::PayoutRecord;
use log::info;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::collections::HashMap;

const SOURCE: &str = "payout sheet";

/// (app_id, media_source, month)
pub type PayoutKey = (String, String, String);

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait PayoutLoader: Send + Sync + 'static {
    /// Loads the payout rates.
    ///
    /// # Returns
    /// A Result containing either the payout rows in sheet order or an Error.
    async fn load(&self) -> Result<Vec<PayoutRecord>, Error>;
}

#[derive(Clone)]
pub struct SheetsPayoutLoader {
    client: Client,
    base_url: String,
    spreadsheet_id: String,
    worksheet: String,
    credentials: GoogleCredentials,
}

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

impl SheetsPayoutLoader {
    pub fn new(config: &MergeConfig, credentials: GoogleCredentials) -> Self {
        SheetsPayoutLoader {
            client: Client::new(),
            base_url: config.sheets_api_url.clone(),
            spreadsheet_id: config.spreadsheet_id.clone(),
            worksheet: config.worksheet.clone(),
            credentials,
        }
    }
}

#[async_trait::async_trait]
impl PayoutLoader for SheetsPayoutLoader {
    async fn load(&self) -> Result<Vec<PayoutRecord>, Error> {
        info!("Fetching payouts from worksheet '{}'", self.worksheet);

        let token = self
            .credentials
            .access_token(&self.client, &[SHEETS_READONLY_SCOPE])
            .await?;

        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| Error::UrlParsingFailed(url::ParseError::SetHostOnCannotBeABaseUrl))?
            .pop_if_empty()
            .extend(&[
                "v4",
                "spreadsheets",
                self.spreadsheet_id.as_str(),
                "values",
                self.worksheet.as_str(),
            ]);

        let resp = self.client.get(url).bearer_auth(token).send().await?;

        if resp.status() != StatusCode::OK {
            return Err(Error::UnexpectedStatus {
                source_name: SOURCE.to_string(),
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        let range = resp.json::<ValueRange>().await?;
        payouts_from_grid(&range.values)
    }
}

/// Reads payout rows from a grid whose first row is the header. Short rows
/// are padded with blanks, blank or non-numeric payouts become 0 and months
/// are cut to their lowercase three letter abbreviation.
pub fn payouts_from_grid(grid: &[Vec<String>]) -> Result<Vec<PayoutRecord>, Error> {
    let Some((header, rows)) = grid.split_first() else {
        return Ok(vec![]);
    };

    let position = |column: &str| {
        header
            .iter()
            .position(|name| name.trim() == column)
            .ok_or_else(|| Error::MissingColumn {
                source_name: SOURCE.to_string(),
                column: column.to_string(),
            })
    };

    let app_id = position("app_id")?;
    let media_source = position("media_source")?;
    let month = position("month")?;
    let payout = position("payout")?;

    Ok(rows
        .iter()
        .map(|row| PayoutRecord {
            app_id: cell(row, app_id).to_string(),
            media_source: cell(row, media_source).to_string(),
            month: cell(row, month).chars().take(3).collect::<String>().to_lowercase(),
            payout: parse_payout(cell(row, payout)),
        })
        .collect())
}

fn cell(row: &[String], index: usize) -> &str {
    row.get(index).map(|value| value.trim()).unwrap_or("")
}

fn parse_payout(raw: &str) -> f64 {
    raw.parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .unwrap_or(0.0)
}

/// Builds the CPA lookup. When the sheet repeats a key the last row wins.
pub fn payout_lookup(records: Vec<PayoutRecord>) -> HashMap<PayoutKey, f64> {
    records
        .into_iter()
        .map(|record| {
            (
                (record.app_id, record.media_source, record.month),
                record.payout,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{bearer_token, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn grid(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter()
            .map(|row| row.iter().map(|v| v.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_payouts_from_grid() {
        let grid = grid(&[
            &["app_id", "media_source", "month", "payout"],
            &["X", "Y", "January", "12.5"],
            &["X", "Z", "FEB", ""],
            &["X", "W", "mar", "n/a"],
            &["X", "V", "apr"],
        ]);

        let payouts = payouts_from_grid(&grid).unwrap();
        assert_eq!(payouts.len(), 4);
        assert_eq!(payouts[0].month, "jan");
        assert_eq!(payouts[0].payout, 12.5);
        assert_eq!(payouts[1].month, "feb");
        assert_eq!(payouts[1].payout, 0.0);
        assert_eq!(payouts[2].payout, 0.0);
        assert_eq!(payouts[3].payout, 0.0);
    }

    #[test]
    fn test_payouts_from_grid_with_reordered_header() {
        let grid = grid(&[
            &["payout", "month", "media_source", "app_id", "comment"],
            &["3", "jan", "Y", "X", "promo"],
        ]);

        let payouts = payouts_from_grid(&grid).unwrap();
        assert_eq!(
            payouts,
            vec![PayoutRecord {
                app_id: "X".to_string(),
                media_source: "Y".to_string(),
                month: "jan".to_string(),
                payout: 3.0,
            }]
        );
    }

    #[test]
    fn test_payouts_from_grid_missing_column() {
        let grid = grid(&[&["app_id", "month", "payout"]]);
        assert!(matches!(
            payouts_from_grid(&grid).unwrap_err(),
            Error::MissingColumn { column, .. } if column == "media_source"
        ));
        assert!(payouts_from_grid(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_payout_lookup_last_row_wins() {
        let record = |payout: f64| PayoutRecord {
            app_id: "X".to_string(),
            media_source: "Y".to_string(),
            month: "jan".to_string(),
            payout,
        };

        let lookup = payout_lookup(vec![record(1.0), record(2.0)]);
        assert_eq!(lookup.len(), 1);
        assert_eq!(
            lookup.get(&("X".to_string(), "Y".to_string(), "jan".to_string())),
            Some(&2.0)
        );
    }

    #[tokio::test]
    async fn test_sheets_loader() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v4/spreadsheets/sheet-1/values/payouts"))
            .and(bearer_token("token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "range": "payouts!A1:D3",
                "majorDimension": "ROWS",
                "values": [
                    ["app_id", "media_source", "month", "payout"],
                    ["X", "Y", "jan", "7"],
                    ["X", "Y", "feb"]
                ]
            })))
            .mount(&server)
            .await;

        let loader = SheetsPayoutLoader {
            client: Client::new(),
            base_url: server.uri(),
            spreadsheet_id: "sheet-1".to_string(),
            worksheet: "payouts".to_string(),
            credentials: GoogleCredentials::AccessToken("token".to_string()),
        };

        let payouts = loader.load().await.unwrap();
        assert_eq!(payouts.len(), 2);
        assert_eq!(payouts[0].payout, 7.0);
        assert_eq!(payouts[1].payout, 0.0);
    }

    #[tokio::test]
    async fn test_sheets_loader_failure() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let loader = SheetsPayoutLoader {
            client: Client::new(),
            base_url: server.uri(),
            spreadsheet_id: "sheet-1".to_string(),
            worksheet: "payouts".to_string(),
            credentials: GoogleCredentials::AccessToken("token".to_string()),
        };

        assert!(matches!(
            loader.load().await.unwrap_err(),
            Error::UnexpectedStatus { status: 403, .. }
        ));
    }
}
