//! Test document validation command.

use anyhow::{Context, Result};
use console::style;
use proctor_core::{TestDocument, TestPlanNodeKind, TestPlanner};
use std::fs;
use std::path::Path;

/// Load a test document, flatten it and print the resulting plan.
pub fn run(test_path: &Path) -> Result<()> {
    let content = fs::read_to_string(test_path)
        .with_context(|| format!("failed to read {}", test_path.display()))?;
    let document: TestDocument = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", test_path.display()))?;

    for part in &document.test_parts {
        for item_ref in collect_item_refs(part) {
            if !document.items.contains_key(&item_ref) {
                anyhow::bail!("item reference {item_ref} has no item document");
            }
        }
    }

    let plan = TestPlanner::new(&document).plan();
    println!(
        "{} {} ({} nodes)",
        style("test").green().bold(),
        document.identifier,
        plan.len()
    );
    for node in plan.nodes() {
        let depth = depth_of(&plan, node);
        let label = match node.kind {
            TestPlanNodeKind::TestPart => "part",
            TestPlanNodeKind::AssessmentSection => "section",
            TestPlanNodeKind::AssessmentItemRef => "item",
        };
        println!(
            "{}{} {}",
            "  ".repeat(depth + 1),
            style(label).cyan(),
            node.key
        );
    }
    for part in &document.test_parts {
        println!(
            "{} {}: {:?} navigation, {:?} submission",
            style("modes").yellow(),
            part.identifier,
            part.navigation_mode,
            part.submission_mode
        );
    }
    Ok(())
}

fn depth_of(plan: &proctor_core::TestPlan, node: &proctor_core::TestPlanNode) -> usize {
    plan.index_of(&node.key)
        .map(|index| plan.ancestors_of(index).len())
        .unwrap_or(0)
}

fn collect_item_refs(part: &proctor_core::TestPart) -> Vec<proctor_core::Identifier> {
    fn walk(section: &proctor_core::AssessmentSection, into: &mut Vec<proctor_core::Identifier>) {
        for child in &section.parts {
            match child {
                proctor_core::SectionPart::Section(nested) => walk(nested, into),
                proctor_core::SectionPart::ItemRef(item_ref) => {
                    into.push(item_ref.item_identifier.clone());
                }
            }
        }
    }
    let mut refs = Vec::new();
    for section in &part.sections {
        walk(section, &mut refs);
    }
    refs
}
