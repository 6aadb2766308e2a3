use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use super::scenario::Scenario;
use shardagg::{
    AggregateOptions, Namespace, Pipeline, Router, parse_date_string, parse_date_with_format,
};

#[derive(Parser, Debug)]
#[command(name = "shardagg", version, about = "Sharded aggregation router playground")]
pub struct App {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a pipeline against an in-memory cluster described by a scenario file
    Run {
        #[arg(long)]
        scenario: PathBuf,
        #[arg(long)]
        namespace: Namespace,
        /// Pipeline as a JSON array of stages
        #[arg(long)]
        pipeline: String,
        /// Request timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Print the dispatch plan instead of running it
        #[arg(long)]
        explain: bool,
    },
    /// Parse a date string the way $dateFromString does
    ParseDate {
        input: String,
        #[arg(long)]
        timezone: Option<String>,
        #[arg(long)]
        format: Option<String>,
    },
}

impl App {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Run {
                scenario,
                namespace,
                pipeline,
                timeout_ms,
                explain,
            } => {
                let scenario = Scenario::load(&scenario)?;
                let config = scenario.router.clone();
                let cluster = scenario.build().await?;
                let pipeline = Pipeline::from_json_str(&pipeline).context("parsing pipeline")?;
                let router = Router::new(
                    config,
                    cluster.authority().clone(),
                    Arc::new(cluster.clone()),
                )?;

                if explain {
                    let plan = router.explain(&namespace, &pipeline).await?;
                    println!("{:#?}", plan);
                    return Ok(());
                }

                let mut options = AggregateOptions::new();
                if let Some(ms) = timeout_ms {
                    options = options.timeout(Duration::from_millis(ms));
                }
                let docs = router
                    .run_aggregation(&namespace, &pipeline, options)
                    .await?
                    .try_collect()
                    .await?;
                for doc in &docs {
                    println!("{}", serde_json::to_string(doc)?);
                }
                info!(count = docs.len(), stats = ?router.cache().stats(), "aggregation finished");
                Ok(())
            }
            Command::ParseDate {
                input,
                timezone,
                format,
            } => {
                let parsed = match format {
                    Some(format) => parse_date_with_format(&input, &format, timezone.as_deref())?,
                    None => parse_date_string(&input, timezone.as_deref())?,
                };
                println!("{}", parsed.to_rfc3339_opts(chrono::SecondsFormat::Millis, true));
                Ok(())
            }
        }
    }
}
