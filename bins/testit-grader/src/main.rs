mod comparator;
mod config;
mod engine;
mod evaluator;
mod executor;
mod pipeline;
mod report;
mod runner;

#[cfg(test)]
mod engine_tests;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{GraderConfig, GraderPaths, SubmissionMetadata};
use pipeline::{GradeContext, Pipeline, PipelineStatus};
use std::path::PathBuf;
use testit_common::bank::TestBankClient;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "testit-grader")]
#[command(about = "Run shared test banks against a reference server and a student submission", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Root of the grading container layout
    #[arg(long, global = true, default_value = "/autograder")]
    root: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade the current submission (default)
    Grade,

    /// Validate the default tests against the sample server and upload them
    Setup,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_line_number(true)
        .init();

    let cli = Cli::parse();
    let paths = GraderPaths::from_root(cli.root.clone());

    let config = GraderConfig::load(&paths.config).map_err(|e| {
        error!("Failed to load grader configuration: {:#}", e);
        e
    })?;
    info!(root = %paths.root.display(), "Grader configuration loaded");

    // Test bank location
    let server_ip = std::env::var("SERVER_IP").context("SERVER_IP is not set")?;
    let server_port = std::env::var("SERVER_PORT").unwrap_or_else(|_| "3000".to_string());
    let auth_token = std::env::var("AUTH_TOKEN").ok();
    if auth_token.is_none() {
        warn!("AUTH_TOKEN is not set, bank requests will be unauthenticated");
    }
    let bank = TestBankClient::new(format!("http://{}:{}", server_ip, server_port), auth_token);
    info!(bank = %bank.base_url(), "Using test bank");

    let pipeline = Pipeline::new(&config, &paths, &bank);

    let outcome = match cli.command.unwrap_or(Commands::Grade) {
        Commands::Grade => {
            let metadata = SubmissionMetadata::load(&paths.metadata)?;
            let ctx = GradeContext {
                assignment: metadata.assignment_title(&config),
                student_id: metadata.student_id()?.to_string(),
                due_date: metadata.due_date(),
            };
            info!(assignment = %ctx.assignment, "Grading submission");
            pipeline.grade(&ctx).await?
        }
        Commands::Setup => {
            let assignment = match &config.assignment_title {
                Some(title) => config::sanitize_title(title),
                None => SubmissionMetadata::load(&paths.metadata)
                    .context("No assignmentTitle configured and no submission metadata to read it from")?
                    .assignment_title(&config),
            };
            info!(assignment = %assignment, "Running setup");
            pipeline.setup(&assignment).await?
        }
    };

    match outcome.status {
        PipelineStatus::Completed => info!(
            score = outcome.report.score,
            tests = outcome.report.tests.len(),
            "Finished"
        ),
        PipelineStatus::Aborted { phase, message } => {
            warn!(%phase, %message, "Finished early")
        }
    }

    Ok(())
}
