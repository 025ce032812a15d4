use crate::rules::{AppClient, ClientRule};
use crate::warehouse::TableId;
use clap::Args as ClapArgs;

const DEFAULT_MINTEGRAL_API_URL: &str = "https://ss-api.mintegral.com";
const DEFAULT_UNITY_API_URL: &str = "https://services.api.unity.com";
const DEFAULT_APPSFLYER_API_URL: &str = "https://hq1.appsflyer.com";
const DEFAULT_SHEETS_API_URL: &str = "https://sheets.googleapis.com";
const DEFAULT_BIGQUERY_API_URL: &str = "https://bigquery.googleapis.com";
const DEFAULT_APPSFLYER_APP_IDS: [&str; 4] = ["app1", "app2", "app3", "app4"];

#[derive(ClapArgs, Clone, Debug)]
pub struct MintegralConfig {
    #[arg(long, default_value = DEFAULT_MINTEGRAL_API_URL, env = "MINTEGRAL_API_URL")]
    pub(crate) api_url: String,

    #[arg(long, env = "MINTEGRAL_API_KEY_1")]
    pub(crate) api_key_1: String,

    #[arg(long, env = "MINTEGRAL_ACCESS_KEY_SECRET_1")]
    pub(crate) access_key_1: String,

    #[arg(long, env = "MINTEGRAL_API_KEY_2", requires = "access_key_2")]
    pub(crate) api_key_2: Option<String>,

    #[arg(long, env = "MINTEGRAL_ACCESS_KEY_SECRET_2", requires = "api_key_2")]
    pub(crate) access_key_2: Option<String>,

    #[arg(long, env = "POSTGRESQL_SECRET")]
    pub(crate) database_url: String,

    #[arg(long, default_value_t = 20, env = "MINTEGRAL_POLL_INTERVAL_SECS")]
    pub(crate) poll_interval_secs: u64,

    #[arg(long, default_value_t = 30, env = "MINTEGRAL_MAX_POLL_ATTEMPTS")]
    pub(crate) max_poll_attempts: u32,

    #[arg(
        long = "client-rule",
        env = "CLIENT_RULES",
        value_delimiter = ',',
        help = "Campaign classification rule PATTERN=LABEL, first match wins"
    )]
    pub(crate) client_rules: Vec<ClientRule>,
}

#[derive(ClapArgs, Clone, Debug)]
pub struct UnityConfig {
    #[arg(long, default_value = DEFAULT_UNITY_API_URL, env = "UNITY_API_URL")]
    pub(crate) api_url: String,

    #[arg(long, env = "UNITY_API_KEY")]
    pub(crate) key_id: String,

    #[arg(long, env = "UNITY_SECRET_KEY")]
    pub(crate) secret_key: String,

    #[arg(long, env = "UNITY_ORGANIZATION_ID")]
    pub(crate) organization_id: String,

    #[arg(long = "app-id", env = "UNITY_APP_IDS", value_delimiter = ',', required = true)]
    pub(crate) app_ids: Vec<String>,

    #[arg(long, env = "POSTGRESQL_SECRET")]
    pub(crate) database_url: String,

    #[arg(
        long = "client-rule",
        env = "CLIENT_RULES",
        value_delimiter = ',',
        help = "Campaign classification rule PATTERN=LABEL, first match wins"
    )]
    pub(crate) client_rules: Vec<ClientRule>,
}

#[derive(ClapArgs, Clone, Debug)]
pub struct AppsFlyerConfig {
    #[arg(long, default_value = DEFAULT_APPSFLYER_API_URL, env = "APPSFLYER_API_URL")]
    pub(crate) api_url: String,

    #[arg(long, env = "AF_TOKEN_V2_1")]
    pub(crate) api_token: String,

    #[arg(
        long = "app-id",
        env = "AF_APP_IDS",
        value_delimiter = ',',
        default_values = DEFAULT_APPSFLYER_APP_IDS
    )]
    pub(crate) app_ids: Vec<String>,

    #[arg(
        long = "app-client",
        env = "AF_APP_CLIENTS",
        value_delimiter = ',',
        help = "Client label for an application APP_ID=CLIENT"
    )]
    pub(crate) app_clients: Vec<AppClient>,

    #[arg(long, env = "POSTGRESQL_SBA_SECRET")]
    pub(crate) database_url: String,
}

#[derive(ClapArgs, Clone, Debug)]
pub struct MergeConfig {
    #[arg(long, env = "POSTGRESQL_SECRET")]
    pub(crate) database_url: String,

    #[arg(
        long,
        env = "POSTGRESQL_SBA_SECRET",
        help = "Database holding raw_af_table, when it differs from --database-url"
    )]
    pub(crate) attribution_database_url: Option<String>,

    #[arg(long, env = "GOOGLE_BQ_SECRET", help = "Service account JSON")]
    pub(crate) google_credentials: Option<String>,

    #[arg(
        long,
        env = "GOOGLE_ACCESS_TOKEN",
        conflicts_with = "google_credentials",
        help = "Pre-issued OAuth2 access token used instead of a service account"
    )]
    pub(crate) google_access_token: Option<String>,

    #[arg(long, env = "PAYOUT_SPREADSHEET_ID")]
    pub(crate) spreadsheet_id: String,

    #[arg(long, default_value = "payouts", env = "PAYOUT_WORKSHEET")]
    pub(crate) worksheet: String,

    #[arg(long, env = "BIGQUERY_TABLE_ID", help = "Destination project.dataset.table")]
    pub(crate) table_id: TableId,

    #[arg(long, default_value = DEFAULT_SHEETS_API_URL, env = "SHEETS_API_URL")]
    pub(crate) sheets_api_url: String,

    #[arg(long, default_value = DEFAULT_BIGQUERY_API_URL, env = "BIGQUERY_API_URL")]
    pub(crate) bigquery_api_url: String,

    #[arg(long, default_value_t = 40, env = "MERGE_WINDOW_DAYS")]
    pub(crate) window_days: u32,

    #[arg(long, default_value_t = 10_000, env = "MERGE_CHUNK_SIZE")]
    pub(crate) chunk_size: usize,

    #[arg(long, default_value_t = 5, env = "BIGQUERY_POLL_INTERVAL_SECS")]
    pub(crate) poll_interval_secs: u64,

    #[arg(long, default_value_t = 60, env = "BIGQUERY_MAX_POLL_ATTEMPTS")]
    pub(crate) max_poll_attempts: u32,
}
