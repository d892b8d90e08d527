//! Scripted session simulation command.

use anyhow::{Context, Result};
use console::style;
use proctor_core::{
    Evaluator, Identifier, ResponseData, TestDocument, TestSessionController,
    TestSessionControllerSettings, Timestamp,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// A scripted candidate session.
#[derive(Debug, Deserialize)]
struct Script {
    steps: Vec<Step>,
}

/// One timestamped controller operation.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum Step {
    EnterTest {
        at: i64,
    },
    EnterNextTestPart {
        at: i64,
    },
    Respond {
        at: i64,
        responses: BTreeMap<String, Vec<String>>,
    },
    Advance {
        at: i64,
    },
    Select {
        at: i64,
        target: String,
    },
    Deselect {
        at: i64,
    },
    EndTestPart {
        at: i64,
    },
    ExitTest {
        at: i64,
    },
    ExitTestIncomplete {
        at: i64,
    },
}

/// Run a session script against a test document.
pub fn run(test_path: &Path, script_path: &Path, snapshot_path: Option<&Path>) -> Result<()> {
    let document: TestDocument = serde_json::from_str(
        &fs::read_to_string(test_path)
            .with_context(|| format!("failed to read {}", test_path.display()))?,
    )
    .with_context(|| format!("failed to parse {}", test_path.display()))?;
    let script: Script = serde_json::from_str(
        &fs::read_to_string(script_path)
            .with_context(|| format!("failed to read {}", script_path.display()))?,
    )
    .with_context(|| format!("failed to parse {}", script_path.display()))?;

    let mut controller = TestSessionController::new(
        &document,
        &Evaluator,
        TestSessionControllerSettings::default(),
    );

    for step in &script.steps {
        apply(&mut controller, step)?;
    }

    println!("{}", style("session summary").green().bold());
    let state = controller.test_session_state();
    println!("  session id:  {}", state.session_id);
    println!(
        "  test:        entered={} ended={} exited={} duration={}ms",
        state.control.is_entered(),
        state.control.is_ended(),
        state.control.is_exited(),
        state.control.duration_accumulated
    );
    for (identifier, value) in &state.outcome_values {
        println!("  outcome      {identifier} = {value:?}");
    }
    for (key, item_state) in &state.item_states {
        println!(
            "  item {key}: attempts={} status={:?} duration={}ms",
            item_state.num_attempts, item_state.completion_status, item_state.control.duration_accumulated
        );
    }

    if let Some(path) = snapshot_path {
        let encoded = proctor_core::serialize_test_session(
            controller.test_plan(),
            controller.test_session_state(),
        )?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("{} {}", style("snapshot written to").green(), path.display());
    }
    Ok(())
}

fn apply(controller: &mut TestSessionController<'_>, step: &Step) -> Result<()> {
    match step {
        Step::EnterTest { at } => {
            controller.enter_test(ts(*at))?;
            println!("{} entered test", prefix(*at));
        }
        Step::EnterNextTestPart { at } => match controller.enter_next_available_test_part(ts(*at))? {
            Some(node) => println!("{} entered test part {}", prefix(*at), node.key),
            None => println!("{} no test part remains, test has ended", prefix(*at)),
        },
        Step::Respond { at, responses } => {
            let mut map = BTreeMap::new();
            for (identifier, strings) in responses {
                let identifier: Identifier = identifier.parse()?;
                let strings: Vec<&str> = strings.iter().map(String::as_str).collect();
                map.insert(identifier, ResponseData::strings(&strings));
            }
            let bound = controller.handle_responses_to_current_item(ts(*at), &map)?;
            println!("{} responses handled, bind ok: {bound}", prefix(*at));
        }
        Step::Advance { at } => match controller.advance_item_linear(ts(*at))? {
            Some(node) => println!("{} advanced to item {}", prefix(*at), node.key),
            None => println!("{} part exhausted and ended", prefix(*at)),
        },
        Step::Select { at, target } => {
            let key = target.parse()?;
            controller.select_item_nonlinear(ts(*at), Some(&key))?;
            println!("{} selected item {target}", prefix(*at));
        }
        Step::Deselect { at } => {
            controller.select_item_nonlinear(ts(*at), None)?;
            println!("{} deselected current item", prefix(*at));
        }
        Step::EndTestPart { at } => {
            controller.end_current_test_part(ts(*at))?;
            println!("{} ended current test part", prefix(*at));
        }
        Step::ExitTest { at } => {
            controller.exit_test(ts(*at))?;
            println!("{} exited test", prefix(*at));
        }
        Step::ExitTestIncomplete { at } => {
            controller.exit_test_incomplete(ts(*at))?;
            println!("{} abandoned test", prefix(*at));
        }
    }
    Ok(())
}

fn ts(millis: i64) -> Timestamp {
    Timestamp::from_millis(millis)
}

fn prefix(at: i64) -> String {
    format!("[{}]", style(format!("{at:>8}ms")).dim())
}
