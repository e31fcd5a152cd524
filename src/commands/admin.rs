//! Operator commands working directly on the local database

use anyhow::{Context, Result};

use gatefleet::bans::SYSTEM_ACTOR;
use gatefleet::config::Config;
use gatefleet::models::{NewNode, NewTariff, NodeId, Role, UserId};
use gatefleet::storage::{AccountRepository, NewAction, NodeRepository};

use super::{build_orchestrator, open_store, print_json};

pub async fn node_add(config: Config, node: NewNode) -> Result<()> {
    let store = open_store(&config)?;
    let node = store.insert_node(&node).context("Failed to add node")?;
    store.log_action(
        &NewAction::new(SYSTEM_ACTOR, "add_node")
            .target(node.id.0)
            .details(format!("name={} capacity={}", node.name, node.max_capacity)),
    )?;

    println!("Added node {} ({}) with capacity {}", node.id, node.name, node.max_capacity);
    Ok(())
}

pub async fn node_list(config: Config, json: bool) -> Result<()> {
    let store = open_store(&config)?;
    let orchestrator = build_orchestrator(&config, store).await?;
    let nodes = orchestrator.list_nodes().await;

    if json {
        return print_json(&nodes);
    }

    println!(
        "{:<5} {:<16} {:<8} {:<8} {:>11}  {}",
        "ID", "NAME", "PROTO", "ACTIVE", "LOAD", "PUBLIC"
    );
    for node in nodes {
        println!(
            "{:<5} {:<16} {:<8} {:<8} {:>5}/{:<5}  {}:{}",
            node.id,
            node.name,
            node.protocol.as_str(),
            if node.active { "yes" } else { "no" },
            node.current_load,
            node.max_capacity,
            node.public_host,
            node.public_port
        );
    }
    Ok(())
}

pub async fn node_retire(config: Config, node_id: i64, actor_id: UserId) -> Result<()> {
    let store = open_store(&config)?;
    let orchestrator = build_orchestrator(&config, store).await?;

    let outcome = orchestrator
        .retire_node(actor_id, NodeId(node_id))
        .await
        .with_context(|| format!("Failed to retire node {node_id}"))?;

    println!(
        "Retired node {}: {} credentials deactivated, {} revoked remotely",
        outcome.node_id, outcome.deactivated, outcome.revoked
    );
    if outcome.revoked < outcome.deactivated {
        println!("Remaining remote credentials will be removed by the reverse sweep.");
    }
    Ok(())
}

pub async fn tariff_add(config: Config, tariff: NewTariff) -> Result<()> {
    let store = open_store(&config)?;
    let tariff = store.insert_tariff(&tariff).context("Failed to add tariff")?;
    store.log_action(
        &NewAction::new(SYSTEM_ACTOR, "add_tariff")
            .target(tariff.id)
            .details(tariff.name.clone()),
    )?;

    println!(
        "Added tariff {} '{}': {} days, {} GB",
        tariff.id, tariff.name, tariff.duration_days, tariff.traffic_gb
    );
    Ok(())
}

pub async fn tariff_list(config: Config, include_inactive: bool) -> Result<()> {
    let store = open_store(&config)?;
    let tariffs = store.list_tariffs(include_inactive)?;

    println!("{:<5} {:<24} {:>6} {:>8} {:>10}", "ID", "NAME", "DAYS", "GB", "PRICE");
    for t in tariffs {
        println!(
            "{:<5} {:<24} {:>6} {:>8} {:>10.2}{}",
            t.id,
            t.name,
            t.duration_days,
            t.traffic_gb,
            t.price,
            if t.active { "" } else { "  (retired)" }
        );
    }
    Ok(())
}

pub async fn user_add(
    config: Config,
    user_id: UserId,
    username: Option<String>,
    role: Role,
) -> Result<()> {
    let store = open_store(&config)?;
    let mut account = store.ensure_user(user_id, username.as_deref(), role)?;

    if account.role != role {
        store.set_role(user_id, role)?;
        store.log_action(
            &NewAction::new(SYSTEM_ACTOR, "set_role")
                .target(user_id)
                .details(format!("role={role}")),
        )?;
        account.role = role;
    }

    println!("User {} has role {}", account.user_id, account.role);
    Ok(())
}

pub async fn user_role(config: Config, user_id: UserId, role: Role) -> Result<()> {
    let store = open_store(&config)?;
    store
        .set_role(user_id, role)
        .with_context(|| format!("Failed to set role for user {user_id}"))?;
    store.log_action(
        &NewAction::new(SYSTEM_ACTOR, "set_role")
            .target(user_id)
            .details(format!("role={role}")),
    )?;

    println!("User {user_id} now has role {role}");
    Ok(())
}

pub async fn stats(config: Config) -> Result<()> {
    let store = open_store(&config)?;
    let orchestrator = build_orchestrator(&config, store).await?;
    print_json(&orchestrator.stats().await?)
}
