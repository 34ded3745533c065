//! Console rendering shared by the commands.

use chrono::{DateTime, Utc};
use cronpilot_engine::models::{Job, JobRun, McpServer};
use cronpilot_engine::schedule::parse_schedule_time;

pub fn print_banner() {
    println!();
    println!("\x1b[1;36m+-------------------------------------+\x1b[0m");
    println!("\x1b[1;36m|\x1b[0m   \x1b[1mcronpilot\x1b[0m                         \x1b[1;36m|\x1b[0m");
    println!("\x1b[1;36m|\x1b[0m   Scheduled Agent Runner            \x1b[1;36m|\x1b[0m");
    println!("\x1b[1;36m+-------------------------------------+\x1b[0m");
    println!();
}

pub fn print_jobs_table(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("\x1b[33mNo jobs configured.\x1b[0m");
        return;
    }

    println!(
        "  {:<24} {:<10} {:<8} {:<12} {:<16} {}",
        "NAME", "STATUS", "ACTIVE", "EVERY", "NEXT RUN", "ID"
    );
    println!("  {}", "-".repeat(110));
    for job in jobs {
        let next_run = job
            .next_run
            .as_deref()
            .and_then(|at| parse_schedule_time(at).ok())
            .map(|at| format_relative_time(&at, Utc::now()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<24} {:<10} {:<8} {:<12} {:<16} {}",
            truncate(&job.name, 24),
            job.status,
            if job.active { "yes" } else { "no" },
            format!("{} {}", job.interval_value, job.interval_unit),
            next_run,
            job.id
        );
    }
}

pub fn print_job(job: &Job, mcp_servers: &[McpServer]) {
    println!("\x1b[1m{}\x1b[0m ({})", job.name, job.id);
    println!("  Status:     {}", job.status);
    println!("  Active:     {}", job.active);
    println!("  Every:      {} {}", job.interval_value, job.interval_unit);
    println!("  Start:      {}", job.start_date);
    println!("  Last run:   {}", job.last_run.as_deref().unwrap_or("-"));
    println!("  Next run:   {}", job.next_run.as_deref().unwrap_or("-"));
    if !mcp_servers.is_empty() {
        let names: Vec<&str> = mcp_servers.iter().map(|s| s.name.as_str()).collect();
        println!("  MCP:        {}", names.join(", "));
    }
    println!();
    println!("\x1b[1mPrompt:\x1b[0m");
    println!("{}", job.prompt);
    if let Some(question) = &job.pending_question {
        println!();
        println!("\x1b[33mPending question:\x1b[0m");
        println!("{question}");
    }
    if !job.output.is_empty() {
        println!();
        println!("\x1b[1mOutput:\x1b[0m");
        println!("{}", job.output);
    }
}

pub fn print_runs_table(runs: &[JobRun]) {
    if runs.is_empty() {
        println!("\x1b[33mNo runs recorded.\x1b[0m");
        return;
    }

    println!("  {:<22} {:<22} {:<10} {}", "STARTED", "ENDED", "STATUS", "ID");
    println!("  {}", "-".repeat(96));
    for run in runs {
        println!(
            "  {:<22} {:<22} {:<10} {}",
            run.started_at,
            run.ended_at.as_deref().unwrap_or("-"),
            run.status,
            run.id
        );
    }
}

pub fn print_mcp_servers_table(servers: &[McpServer]) {
    if servers.is_empty() {
        println!("\x1b[33mNo MCP servers configured.\x1b[0m");
        return;
    }

    println!("  {:<20} {:<6} {:<48} {}", "NAME", "TYPE", "TARGET", "ID");
    println!("  {}", "-".repeat(110));
    for server in servers {
        let target = if server.command.is_empty() {
            server.url.clone()
        } else {
            std::iter::once(server.command.as_str())
                .chain(server.args.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" ")
        };
        println!(
            "  {:<20} {:<6} {:<48} {}",
            truncate(&server.name, 20),
            server.kind,
            truncate(&target, 48),
            server.id
        );
    }
}

/// Relative time such as "in 5m 30s"; past instants render as "now".
pub fn format_relative_time(at: &DateTime<Utc>, now: DateTime<Utc>) -> String {
    let total_secs = at.signed_duration_since(now).num_seconds();
    if total_secs < 0 {
        return "now".to_string();
    }

    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("in {hours}h {mins}m")
    } else if mins > 0 {
        format!("in {mins}m {secs}s")
    } else {
        format!("in {secs}s")
    }
}

/// Truncate to `max_len` characters, marking the cut with an ellipsis.
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn relative_time_buckets() {
        let now = Utc::now();
        assert_eq!(format_relative_time(&(now - Duration::seconds(5)), now), "now");
        assert_eq!(format_relative_time(&(now + Duration::seconds(42)), now), "in 42s");
        assert_eq!(
            format_relative_time(&(now + Duration::seconds(330)), now),
            "in 5m 30s"
        );
        assert_eq!(
            format_relative_time(&(now + Duration::minutes(125)), now),
            "in 2h 5m"
        );
    }

    #[test]
    fn truncate_respects_characters() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijkl", 8), "abcde...");
        assert_eq!(truncate("ééééééé", 5), "éé...");
    }
}
