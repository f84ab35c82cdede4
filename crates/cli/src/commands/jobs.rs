//! `planctx jobs`: Job lifecycle commands.

use planctx_core::job::{JobPayload, JobRecord, JobState};
use planctx_jobs::JobEvent;

use super::{CliResult, load_config, open_lifecycle};

pub struct SubmitArgs {
    pub plan: String,
    pub user: String,
    pub job_type: String,
    pub params: String,
    pub id: Option<String>,
    pub pending: bool,
}

/// Parse `--params` into a JSON object.
pub fn parse_params(raw: &str) -> Result<serde_json::Map<String, serde_json::Value>, String> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("params must be a JSON object, got: {other}")),
        Err(e) => Err(format!("params is not valid JSON: {e}")),
    }
}

fn state_icon(state: JobState) -> &'static str {
    match state {
        JobState::Pending => "⏸️",
        JobState::Queued => "📥",
        JobState::Processing => "⚙️",
        JobState::Retrying => "🔁",
        JobState::Completed => "✅",
        JobState::Failed => "❌",
        JobState::Cancelled => "🚫",
    }
}

fn print_job(job: &JobRecord) {
    println!("  ID:        {}", job.id);
    println!("  Plan:      {}", job.plan_id);
    println!("  User:      {}", job.user_id);
    println!("  Type:      {}", job.job_type);
    println!("  State:     {} {}", state_icon(job.state), job.state);
    println!("  Retries:   {}", job.retry_count);
    println!("  Created:   {}", job.created_at.to_rfc3339());
    println!("  Updated:   {}", job.updated_at.to_rfc3339());
    if !job.params.is_empty() {
        println!("  Params:    {}", serde_json::Value::Object(job.params.clone()));
    }
    if let Some(error) = &job.error {
        println!("  Error:     {error}");
    }
    if let Some(result) = &job.result {
        println!("  Result:    {} ({} tokens)", result.summary, result.metadata.tokens_used);
    }
}

pub async fn submit(args: SubmitArgs) -> CliResult {
    let config = load_config()?;
    let lifecycle = open_lifecycle(&config).await?;

    let payload = JobPayload {
        job_id: args.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        plan_id: args.plan,
        user_id: args.user,
        job_type: args.job_type,
        params: parse_params(&args.params)?,
    };
    let initial = if args.pending { JobState::Pending } else { JobState::Queued };

    let job = lifecycle.submit(payload, initial).await?;
    println!("📨 Job submitted");
    print_job(&job);
    Ok(())
}

pub async fn show(id: &str) -> CliResult {
    let config = load_config()?;
    let lifecycle = open_lifecycle(&config).await?;

    let job = lifecycle.get(id).await?;
    println!("📋 Job {id}");
    print_job(&job);
    Ok(())
}

pub async fn list(plan: &str) -> CliResult {
    let config = load_config()?;
    let lifecycle = open_lifecycle(&config).await?;

    let jobs = lifecycle.list(plan).await?;
    println!("📋 Jobs for plan {plan}");
    println!();

    if jobs.is_empty() {
        println!("   No jobs.");
    }
    for job in &jobs {
        println!(
            "  {} {:<10} {:<36} {:<16} retries={}",
            state_icon(job.state),
            job.state,
            job.id,
            job.job_type,
            job.retry_count
        );
    }
    Ok(())
}

pub async fn cancel(id: &str) -> CliResult {
    let config = load_config()?;
    let lifecycle = open_lifecycle(&config).await?;

    let job = lifecycle.apply(id, JobEvent::Cancel).await?;
    println!("🚫 Job cancelled");
    print_job(&job);
    Ok(())
}
