use super::{format_time, status_colored};
use colored::Colorize;
use spotstack_cloud::StateStore;

pub async fn handle(store: &StateStore) -> anyhow::Result<()> {
    let stacks = store.list().await?;

    if stacks.is_empty() {
        println!("{}", "No stacks recorded".dimmed());
        println!("  state dir: {}", store.root().display().to_string().cyan());
        return Ok(());
    }

    println!(
        "{}",
        format!(
            "{:<24} {:<12} {:<20} {:<14} {:<28} {:<22}",
            "STACK", "TIER", "STATUS", "REGION", "ENDPOINT", "UPDATED"
        )
        .bold()
    );
    println!("{}", "─".repeat(124).dimmed());

    for state in &stacks {
        println!(
            "{:<24} {:<12} {:<20} {:<14} {:<28} {:<22}",
            state.stack_id.cyan(),
            state.config.tier.to_string(),
            status_colored(state.status),
            state.config.region,
            state.endpoint.as_deref().unwrap_or("-"),
            format_time(&state.updated_at),
        );
    }

    println!();
    println!("{} stack(s)", stacks.len());
    Ok(())
}
