//! Session snapshot inspection command.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use console::style;
use proctor_core::{ControlSessionState, Timestamp};
use std::fs;
use std::path::Path;

/// Print the lifecycle state stored in a session snapshot.
pub fn run(snapshot_path: &Path) -> Result<()> {
    let encoded = fs::read_to_string(snapshot_path)
        .with_context(|| format!("failed to read {}", snapshot_path.display()))?;
    let snapshot = proctor_core::deserialize_test_session(&encoded)?;
    let state = &snapshot.state;

    println!("{} {}", style("session").green().bold(), state.session_id);
    println!("test         {}", describe(&state.control));
    if let Some(key) = &state.current_test_part_key {
        println!("current part {key}");
    }
    if let Some(key) = &state.current_item_key {
        println!("current item {key}");
    }
    for (identifier, value) in &state.outcome_values {
        println!("outcome      {identifier} = {value:?}");
    }

    for (key, part_state) in &state.test_part_states {
        println!("part    {key}: {}", describe(part_state));
    }
    for (key, section_state) in &state.section_states {
        println!("section {key}: {}", describe(section_state));
    }
    for (key, item_state) in &state.item_states {
        println!(
            "item    {key}: {} attempts={} status={:?}",
            describe(&item_state.control),
            item_state.num_attempts,
            item_state.completion_status
        );
        if let Some(suspended) = item_state.suspend_time {
            println!("        suspended since {}", render(suspended));
        }
    }
    Ok(())
}

fn describe(control: &ControlSessionState) -> String {
    let mut parts = Vec::new();
    match control.entry_time {
        Some(at) => parts.push(format!("entered {}", render(at))),
        None => parts.push("not entered".to_string()),
    }
    if let Some(at) = control.end_time {
        parts.push(format!("ended {}", render(at)));
    }
    if let Some(at) = control.exit_time {
        parts.push(format!("exited {}", render(at)));
    }
    if control.pre_condition_failed {
        parts.push("precondition failed".to_string());
    }
    if control.jumped_by_branch_rule {
        parts.push("jumped by branch rule".to_string());
    }
    parts.push(format!("{}ms", control.duration_accumulated));
    parts.join(", ")
}

fn render(timestamp: Timestamp) -> String {
    match DateTime::<Utc>::from_timestamp_millis(timestamp.as_millis()) {
        Some(datetime) => datetime.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => timestamp.to_string(),
    }
}
