use crate::config::MergeConfig;
use crate::error::Error;
use crate::google_auth::{GoogleCredentials, BIGQUERY_SCOPE};
use crate::polling::{poll_until_ready, PollPolicy, PollStatus};
use crate::records::MergedRecord;
use crate::window::Window;
use log::{debug, info};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const SOURCE: &str = "BigQuery";

const UPLOAD_BOUNDARY: &str = "adperf_etl_load_boundary";

const QUERY_TIMEOUT_MS: u64 = 60_000;

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Warehouse: Send + Sync + 'static {
    /// Deletes every row whose `day` falls inside the window.
    async fn delete_window(&self, window: &Window) -> Result<(), Error>;

    /// Appends rows to the table.
    ///
    /// # Returns
    /// A Result containing either the number of rows appended or an Error.
    async fn append(&self, rows: &[MergedRecord]) -> Result<u64, Error>;
}

/// A fully qualified `project.dataset.table` identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableId {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl FromStr for TableId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();

        match parts.as_slice() {
            &[project, dataset, table]
                if !project.is_empty() && !dataset.is_empty() && !table.is_empty() =>
            {
                Ok(TableId {
                    project: project.to_string(),
                    dataset: dataset.to_string(),
                    table: table.to_string(),
                })
            }
            _ => Err(Error::InvalidTableId {
                table_id: s.to_string(),
            }
            .to_string()),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
    num_dml_affected_rows: Option<String>,
    #[serde(default)]
    errors: Vec<Value>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    #[serde(default)]
    state: String,
    error_result: Option<Value>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Job {
    job_reference: Option<JobReference>,
    status: Option<JobStatus>,
}

impl Job {
    fn is_done(&self) -> bool {
        self.status.as_ref().is_some_and(|status| status.state == "DONE")
    }
}

#[derive(Clone)]
pub struct BigQueryWarehouse {
    client: Client,
    base_url: String,
    table: TableId,
    credentials: GoogleCredentials,
    poll: PollPolicy,
}

impl BigQueryWarehouse {
    pub fn new(config: &MergeConfig, credentials: GoogleCredentials) -> Self {
        BigQueryWarehouse {
            client: Client::new(),
            base_url: config.bigquery_api_url.clone(),
            table: config.table_id.clone(),
            credentials,
            poll: PollPolicy {
                interval: Duration::from_secs(config.poll_interval_secs),
                max_attempts: config.max_poll_attempts,
            },
        }
    }

    fn url(&self, segments: &[&str]) -> Result<Url, Error> {
        self.url_under(&[], segments)
    }

    /// Media uploads live under `/upload` in front of the regular API path.
    fn url_under(&self, prefix: &[&str], segments: &[&str]) -> Result<Url, Error> {
        let mut url = Url::parse(&self.base_url)?;
        url.path_segments_mut()
            .map_err(|_| Error::UrlParsingFailed(url::ParseError::SetHostOnCannotBeABaseUrl))?
            .pop_if_empty()
            .extend(prefix)
            .extend(&["bigquery", "v2", "projects", self.table.project.as_str()])
            .extend(segments);
        Ok(url)
    }

    async fn token(&self) -> Result<String, Error> {
        self.credentials
            .access_token(&self.client, &[BIGQUERY_SCOPE])
            .await
    }

    async fn read_query_response(resp: reqwest::Response) -> Result<QueryResponse, Error> {
        if resp.status() != StatusCode::OK {
            return Err(Error::UnexpectedStatus {
                source_name: SOURCE.to_string(),
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        let response = resp.json::<QueryResponse>().await?;
        if !response.errors.is_empty() {
            return Err(Error::Warehouse {
                message: Value::Array(response.errors).to_string(),
            });
        }

        Ok(response)
    }

    async fn query_results(
        &self,
        token: &str,
        job: &JobReference,
    ) -> Result<PollStatus<QueryResponse>, Error> {
        let mut url = self.url(&["queries", job.job_id.as_str()])?;
        if let Some(location) = &job.location {
            url.query_pairs_mut().append_pair("location", location);
        }

        let resp = self.client.get(url).bearer_auth(token).send().await?;
        let response = Self::read_query_response(resp).await?;

        if response.job_complete {
            Ok(PollStatus::Ready(response))
        } else {
            Ok(PollStatus::Pending)
        }
    }

    async fn read_job(resp: reqwest::Response) -> Result<Job, Error> {
        if resp.status() != StatusCode::OK {
            return Err(Error::UnexpectedStatus {
                source_name: SOURCE.to_string(),
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        Ok(resp.json::<Job>().await?)
    }

    async fn job_status(
        &self,
        token: &str,
        reference: &JobReference,
    ) -> Result<PollStatus<Job>, Error> {
        let mut url = self.url(&["jobs", reference.job_id.as_str()])?;
        if let Some(location) = &reference.location {
            url.query_pairs_mut().append_pair("location", location);
        }

        let resp = self.client.get(url).bearer_auth(token).send().await?;
        let job = Self::read_job(resp).await?;

        if job.is_done() {
            Ok(PollStatus::Ready(job))
        } else {
            Ok(PollStatus::Pending)
        }
    }
}

#[async_trait::async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn delete_window(&self, window: &Window) -> Result<(), Error> {
        let token = self.token().await?;

        let body = json!({
            "query": format!("DELETE FROM `{}` WHERE day BETWEEN @start AND @end", self.table),
            "useLegacySql": false,
            "parameterMode": "NAMED",
            "timeoutMs": QUERY_TIMEOUT_MS,
            "queryParameters": [
                date_parameter("start", window.start.format("%Y-%m-%d").to_string()),
                date_parameter("end", window.end.format("%Y-%m-%d").to_string()),
            ],
        });

        let resp = self
            .client
            .post(self.url(&["queries"])?)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;
        let mut response = Self::read_query_response(resp).await?;

        if !response.job_complete {
            let job = response.job_reference.ok_or_else(|| Error::UnexpectedPayload {
                source_name: SOURCE.to_string(),
                payload: "incomplete query without a job reference".to_string(),
            })?;

            let token = token.as_str();
            let job = &job;
            response = poll_until_ready(&self.poll, "BigQuery delete", move |attempt| {
                debug!("Polling BigQuery job {}, attempt {}", job.job_id, attempt);
                self.query_results(token, job)
            })
            .await?;
        }

        info!(
            "Deleted {} rows from {} for {}",
            response.num_dml_affected_rows.as_deref().unwrap_or("0"),
            self.table,
            window
        );

        Ok(())
    }

    async fn append(&self, rows: &[MergedRecord]) -> Result<u64, Error> {
        if rows.is_empty() {
            return Ok(0);
        }

        let token = self.token().await?;
        let body = load_job_body(&self.table, rows)?;

        let mut url = self.url_under(&["upload"], &["jobs"])?;
        url.query_pairs_mut().append_pair("uploadType", "multipart");

        let resp = self
            .client
            .post(url)
            .bearer_auth(&token)
            .header(
                CONTENT_TYPE,
                format!("multipart/related; boundary={UPLOAD_BOUNDARY}"),
            )
            .body(body)
            .send()
            .await?;
        let mut job = Self::read_job(resp).await?;

        if !job.is_done() {
            let reference = job.job_reference.take().ok_or_else(|| Error::UnexpectedPayload {
                source_name: SOURCE.to_string(),
                payload: "running load job without a job reference".to_string(),
            })?;

            let token = token.as_str();
            let reference = &reference;
            job = poll_until_ready(&self.poll, "BigQuery load", move |attempt| {
                debug!("Polling BigQuery load job {}, attempt {}", reference.job_id, attempt);
                self.job_status(token, reference)
            })
            .await?;
        }

        if let Some(error) = job.status.and_then(|status| status.error_result) {
            return Err(Error::Warehouse {
                message: error.to_string(),
            });
        }

        info!("Appended {} rows to {}", rows.len(), self.table);
        Ok(rows.len() as u64)
    }
}

/// Builds a `multipart/related` upload: the load configuration followed by
/// the rows as newline-delimited JSON.
fn load_job_body(table: &TableId, rows: &[MergedRecord]) -> Result<String, Error> {
    let configuration = json!({
        "configuration": {
            "load": {
                "destinationTable": {
                    "projectId": table.project,
                    "datasetId": table.dataset,
                    "tableId": table.table,
                },
                "sourceFormat": "NEWLINE_DELIMITED_JSON",
                "writeDisposition": "WRITE_APPEND",
                "createDisposition": "CREATE_IF_NEEDED",
                "autodetect": true,
            }
        }
    });

    let lines = rows
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(format!(
        "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{configuration}\r\n\
         --{b}\r\nContent-Type: application/octet-stream\r\n\r\n{data}\r\n\
         --{b}--\r\n",
        b = UPLOAD_BOUNDARY,
        data = lines.join("\n"),
    ))
}

fn date_parameter(name: &str, value: String) -> Value {
    json!({
        "name": name,
        "parameterType": { "type": "DATE" },
        "parameterValue": { "value": value },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use wiremock::matchers::{
        bearer_token, body_partial_json, body_string_contains, header, method, path, query_param,
    };
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn warehouse(base_url: &str) -> BigQueryWarehouse {
        BigQueryWarehouse {
            client: Client::new(),
            base_url: base_url.to_string(),
            table: "project.dataset.performance".parse().unwrap(),
            credentials: GoogleCredentials::AccessToken("token".to_string()),
            poll: PollPolicy {
                interval: Duration::from_millis(1),
                max_attempts: 3,
            },
        }
    }

    fn window() -> Window {
        Window::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 10).unwrap(),
        )
        .unwrap()
    }

    fn merged_record(day: &str) -> MergedRecord {
        MergedRecord {
            day: NaiveDate::parse_from_str(day, "%Y-%m-%d").ok(),
            month: Some("jan".to_string()),
            network: Some("mintegral".to_string()),
            client: Some("liga_stavok".to_string()),
            campaign_network: Some("client1_promo".to_string()),
            site_network: Some("site".to_string()),
            site_name_network: Some("com.site".to_string()),
            impressions: Some(100.0),
            clicks: Some(10.0),
            conversions: Some(1.0),
            spend: Some(5.0),
            key_network: Some("2024-01-10|client1_promo|site".to_string()),
            key_af: None,
            install_time: None,
            app_id: None,
            media_source: None,
            ad_type_af: None,
            adset: None,
            campaign_af: None,
            site_af: None,
            install_af: None,
            reg_af: None,
            deposit_af: None,
            cpa: 0.0,
        }
    }

    #[test]
    fn test_table_id_from_str() {
        let table: TableId = "project.dataset.table".parse().unwrap();
        assert_eq!(table.project, "project");
        assert_eq!(table.dataset, "dataset");
        assert_eq!(table.table, "table");
        assert_eq!(table.to_string(), "project.dataset.table");

        assert!("dataset.table".parse::<TableId>().is_err());
        assert!("a..c".parse::<TableId>().is_err());
        assert!("a.b.c.d".parse::<TableId>().is_err());
    }

    #[tokio::test]
    async fn test_delete_window() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/bigquery/v2/projects/project/queries"))
            .and(bearer_token("token"))
            .and(body_partial_json(json!({
                "query": "DELETE FROM `project.dataset.performance` WHERE day BETWEEN @start AND @end",
                "useLegacySql": false,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobComplete": true,
                "numDmlAffectedRows": "12",
            })))
            .expect(1)
            .mount(&server)
            .await;

        warehouse(&server.uri())
            .delete_window(&window())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_window_waits_for_job() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/bigquery/v2/projects/project/queries"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobComplete": false,
                "jobReference": { "jobId": "job-1", "location": "EU" },
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/bigquery/v2/projects/project/queries/job-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobComplete": true,
                "numDmlAffectedRows": "3",
            })))
            .expect(1)
            .mount(&server)
            .await;

        warehouse(&server.uri())
            .delete_window(&window())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_window_reports_errors() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobComplete": true,
                "errors": [{ "reason": "invalidQuery" }],
            })))
            .mount(&server)
            .await;

        let result = warehouse(&server.uri()).delete_window(&window()).await;
        assert!(matches!(result.unwrap_err(), Error::Warehouse { .. }));
    }

    #[tokio::test]
    async fn test_append_runs_load_job() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/upload/bigquery/v2/projects/project/jobs"))
            .and(query_param("uploadType", "multipart"))
            .and(bearer_token("token"))
            .and(header(
                "content-type",
                "multipart/related; boundary=adperf_etl_load_boundary",
            ))
            .and(body_string_contains("\"writeDisposition\":\"WRITE_APPEND\""))
            .and(body_string_contains("\"tableId\":\"performance\""))
            .and(body_string_contains("\"day\":\"2024-01-10\""))
            .and(body_string_contains("\"day\":\"2024-01-11\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": { "jobId": "job-1", "location": "EU" },
                "status": { "state": "RUNNING" },
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/bigquery/v2/projects/project/jobs/job-1"))
            .and(query_param("location", "EU"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": { "jobId": "job-1", "location": "EU" },
                "status": { "state": "DONE" },
            })))
            .expect(1)
            .mount(&server)
            .await;

        let rows = vec![merged_record("2024-01-10"), merged_record("2024-01-11")];
        let appended = warehouse(&server.uri()).append(&rows).await.unwrap();
        assert_eq!(appended, 2);
    }

    #[test]
    fn test_load_job_body_is_newline_delimited() {
        let table: TableId = "project.dataset.performance".parse().unwrap();
        let rows = vec![merged_record("2024-01-10"), merged_record("2024-01-11")];
        let body = load_job_body(&table, &rows).unwrap();

        let data = body
            .split("\r\n\r\n")
            .nth(2)
            .and_then(|part| part.split("\r\n--").next())
            .unwrap();
        let lines: Vec<Value> = data
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["day"], "2024-01-10");
        assert_eq!(lines[1]["cpa"], 0.0);
        assert!(body.ends_with("--adperf_etl_load_boundary--\r\n"));
    }

    #[tokio::test]
    async fn test_append_without_rows_skips_job() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let appended = warehouse(&server.uri()).append(&[]).await.unwrap();
        assert_eq!(appended, 0);
    }

    #[tokio::test]
    async fn test_append_reports_load_errors() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/upload/bigquery/v2/projects/project/jobs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jobReference": { "jobId": "job-2" },
                "status": {
                    "state": "DONE",
                    "errorResult": { "reason": "invalid", "message": "bad row" },
                },
            })))
            .mount(&server)
            .await;

        let rows = vec![merged_record("2024-01-10")];
        let result = warehouse(&server.uri()).append(&rows).await;
        assert!(matches!(result.unwrap_err(), Error::Warehouse { .. }));
    }
}
