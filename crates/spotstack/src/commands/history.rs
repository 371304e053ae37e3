use super::{format_time, load_stack};
use colored::Colorize;
use spotstack_cloud::StateStore;

pub async fn handle(store: &StateStore, stack_id: &str, limit: usize) -> anyhow::Result<()> {
    let state = load_stack(store, stack_id).await?;

    if state.rollback_history.is_empty() {
        println!("{}", format!("No rollbacks recorded for {}", stack_id).dimmed());
        return Ok(());
    }

    println!(
        "{}",
        format!(
            "{:<24} {:<20} {:<8} {:<8} {:<8} {:<10}",
            "TIME", "TRIGGER", "MODE", "RESULT", "DELETED", "PRESERVED"
        )
        .bold()
    );
    println!("{}", "─".repeat(84).dimmed());

    // newest first
    for record in state.rollback_history.iter().rev().take(limit) {
        let result = if record.success {
            "ok".green()
        } else {
            "failed".red()
        };
        println!(
            "{:<24} {:<20} {:<8} {:<8} {:<8} {:<10}",
            format_time(&record.timestamp),
            record.trigger.to_string(),
            record.mode.to_string(),
            result,
            record.deleted.len(),
            record.preserved.len(),
        );
        if !record.deleted.is_empty() {
            println!("  deleted:   {}", record.deleted.join(", ").dimmed());
        }
        if !record.preserved.is_empty() {
            println!("  preserved: {}", record.preserved.join(", ").dimmed());
        }
        if let Some(error) = &record.error {
            println!("  error:     {}", error.red());
        }
    }

    let total = state.rollback_history.len();
    if total > limit {
        println!();
        println!("{}", format!("{} older entries not shown", total - limit).dimmed());
    }
    Ok(())
}
