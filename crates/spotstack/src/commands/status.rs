use super::{format_time, load_stack, service_colored, status_colored};
use colored::Colorize;
use spotstack_cloud::{DeploymentState, Provenance, StateStore};

pub async fn handle(store: &StateStore, stack_id: &str, json: bool) -> anyhow::Result<()> {
    let state = load_stack(store, stack_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    print_summary(&state);
    print_resources(&state);
    print_services(&state);
    print_cost(&state);
    Ok(())
}

fn print_summary(state: &DeploymentState) {
    let config = &state.config;
    println!(
        "{} {}",
        "Stack".bold(),
        format!(
            "{} ({}, {}, {})",
            state.stack_id, config.tier, config.region, config.instance_type
        )
        .cyan()
    );
    println!("  Status:     {}", status_colored(state.status));
    if let Some(stage) = state.failed_stage {
        println!("  Failed at:  {}", stage.to_string().red());
    }
    if let Some(error) = &state.last_error {
        println!("  Last error: {}", error.red());
    }
    println!("  Endpoint:   {}", state.endpoint.as_deref().unwrap_or("-"));
    if let Some(ip) = &state.public_ip {
        println!("  Public IP:  {}", ip);
    }
    if let Some(ip) = &state.private_ip {
        println!("  Private IP: {}", ip);
    }
    println!("  Created:    {}", format_time(&state.created_at));
    println!("  Updated:    {}", format_time(&state.updated_at));
    if let Some(snapshot) = &state.last_known_healthy {
        println!("  Healthy at: {}", format_time(&snapshot.captured_at));
    }
    println!(
        "  Rollbacks:  {}",
        if state.rollback_history.is_empty() {
            "none".dimmed().to_string()
        } else {
            state.rollback_history.len().to_string()
        }
    );
}

fn print_resources(state: &DeploymentState) {
    println!();
    println!("{}", "Resources".bold());
    if state.resources.is_empty() {
        println!("  {}", "none".dimmed());
        return;
    }

    let mut resources: Vec<_> = state.resources.iter().collect();
    resources.sort_by_key(|h| h.kind.dependency_rank());
    for handle in resources {
        let provenance = match handle.provenance {
            Provenance::Created => handle.provenance.to_string().normal(),
            Provenance::Reused => handle.provenance.to_string().yellow(),
        };
        println!("  {:<14} {:<24} {}", handle.kind.to_string(), handle.id, provenance);
    }
}

fn print_services(state: &DeploymentState) {
    if state.services.is_empty() {
        return;
    }
    println!();
    println!("{}", "Services".bold());
    for service in &state.services {
        let latency = service
            .latency_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        print!(
            "  {:<12} {:<6} {:<10} {:>7}",
            service.name,
            service.port,
            service_colored(service.status),
            latency
        );
        if service.consecutive_failures > 0 {
            print!("  {} consecutive failures", service.consecutive_failures.to_string().red());
        }
        println!();
        if let Some(error) = &service.last_error {
            println!("  {:<12} {}", "", error.dimmed());
        }
    }
}

fn print_cost(state: &DeploymentState) {
    let Some(cost) = &state.cost else {
        return;
    };
    println!();
    println!("{}", "Cost".bold());

    let purchase = if cost.use_spot {
        format!("spot ${:.4}/h", cost.spot_price)
    } else {
        format!("on-demand ${:.4}/h", cost.on_demand_price)
    };
    let source = if cost.price_source.is_degraded() {
        cost.price_source.to_string().yellow()
    } else {
        cost.price_source.to_string().normal()
    };
    println!("  Compute:    {} ({})", purchase, source);
    println!(
        "  Storage:    {} GiB at ${:.3}/GiB-month",
        cost.volume_size_gb, cost.storage_price_gb_month
    );
    println!("  Hourly:     ${:.4}", cost.hourly);
    println!("  Monthly:    ${:.2}", cost.monthly);
    println!(
        "  Accrued:    ${:.2} over {:.1}h",
        cost.accrued, cost.runtime_hours
    );
}
