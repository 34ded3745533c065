//! Console output for status transitions.

use chrono::Local;
use cronpilot_engine::models::JobStatus;
use cronpilot_engine::scheduler::Notifier;

/// Title and body shown for one status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: &'static str,
    pub message: String,
}

/// `None` for statuses that are never announced.
pub fn notification_for(job_name: &str, status: JobStatus) -> Option<Notification> {
    let (title, message) = match status {
        JobStatus::Running => ("Job Started", format!("{job_name} is now running")),
        JobStatus::Success => ("Job Completed", format!("{job_name} finished successfully")),
        JobStatus::Failed => ("Job Failed", format!("{job_name} failed")),
        JobStatus::Waiting => (
            "Job Needs Input",
            format!("{job_name} is waiting for your answer"),
        ),
        JobStatus::Pending => return None,
    };
    Some(Notification { title, message })
}

/// Prints every transition to the event log.
#[derive(Debug, Default)]
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, job_name: &str, status: JobStatus) {
        if let Some(notification) = notification_for(job_name, status) {
            print_event(
                status,
                job_name,
                &format!("{}: {}", notification.title, notification.message),
            );
        }
    }
}

/// Print a timestamped event to the console.
pub fn print_event(status: JobStatus, job_name: &str, message: &str) {
    let timestamp = Local::now().format("%H:%M:%S");
    let (color, symbol) = match status {
        JobStatus::Running => ("\x1b[35m", "=>"),
        JobStatus::Waiting => ("\x1b[33m", "||"),
        JobStatus::Success => ("\x1b[32m", "OK"),
        JobStatus::Failed => ("\x1b[31m", "XX"),
        JobStatus::Pending => ("\x1b[0m", ".."),
    };
    println!("{color}{symbol} [{timestamp}] {job_name}: {message}\x1b[0m");
}
