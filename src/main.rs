mod appsflyer;
mod config;
mod data;
mod error;
mod google_auth;
mod mintegral;
mod payout_loader;
mod polling;
mod raw_store;
mod reconcile;
mod records;
mod rules;
mod runner;
mod unity;
mod warehouse;
mod window;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use config::{AppsFlyerConfig, MergeConfig, MintegralConfig, UnityConfig};
use error::Error;
use log::error;

#[derive(Parser)]
#[command(about = "Marketing performance ETL jobs")]
struct Args {
    #[command(subcommand)]
    job: Job,
}

#[derive(Subcommand)]
enum Job {
    /// Ingest the Mintegral report of the last two days
    Mintegral(MintegralConfig),

    /// Ingest the Unity acquisitions report of the last two days
    Unity(UnityConfig),

    /// Ingest AppsFlyer raw data for installs between START and END
    Appsflyer {
        #[command(flatten)]
        config: AppsFlyerConfig,

        #[arg(help = "Date should be in the form YYYY-MM-DD", value_parser = validate_date)]
        start: NaiveDate,

        #[arg(help = "Date should be in the form YYYY-MM-DD", value_parser = validate_date)]
        end: NaiveDate,
    },

    /// Merge the raw tables and publish them to the warehouse
    Merge(MergeConfig),
}

fn validate_date(s: &str) -> Result<NaiveDate, String> {
    let error_message = "Invalid date, expected YYYY-MM-DD";

    let parts = s
        .split("-")
        .map(|part| part.parse::<u16>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| error_message)?;

    match parts.as_slice() {
        &[year, month, day] if month <= 12 && day <= 31 => {
            Ok(
                NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
                    .ok_or(error_message)?,
            )
        }
        _ => Err(error_message.to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    env_logger::init();

    let (name, result) = match args.job {
        Job::Mintegral(config) => ("mintegral", runner::run_mintegral(config).await),
        Job::Unity(config) => ("unity", runner::run_unity(config).await),
        Job::Appsflyer { config, start, end } => (
            "appsflyer",
            runner::run_appsflyer(config, &start, &end).await,
        ),
        Job::Merge(config) => ("merge", runner::run_merge(config).await),
    };

    if let Err(err) = result {
        error!("{} job failed: {}", name, err);
        std::process::exit(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_date() {
        assert_eq!(
            validate_date("2024-01-31"),
            Ok(NaiveDate::from_ymd_opt(2024, 1, 31).unwrap())
        );
        assert!(validate_date("2024-02-30").is_err());
        assert!(validate_date("2024-13-01").is_err());
        assert!(validate_date("20240101").is_err());
        assert!(validate_date("yesterday").is_err());
    }

    #[test]
    fn test_parse_appsflyer_job() {
        let args = Args::try_parse_from([
            "adperf-etl",
            "appsflyer",
            "--api-token",
            "token",
            "--database-url",
            "postgres://localhost/af",
            "2024-01-01",
            "2024-01-31",
        ])
        .unwrap();

        match args.job {
            Job::Appsflyer { config, start, end } => {
                assert_eq!(start, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
                assert_eq!(end, NaiveDate::from_ymd_opt(2024, 1, 31).unwrap());
                assert_eq!(config.app_ids.len(), 4);
            }
            _ => panic!("expected the appsflyer job"),
        }
    }

    #[test]
    fn test_parse_merge_job_rejects_bad_table_id() {
        let result = Args::try_parse_from([
            "adperf-etl",
            "merge",
            "--database-url",
            "postgres://localhost/perf",
            "--spreadsheet-id",
            "sheet",
            "--table-id",
            "dataset.table",
        ]);
        assert!(result.is_err());
    }
}
