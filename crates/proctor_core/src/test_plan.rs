//! The flattened, immutable traversal order of a test.
//!
//! A [`TestPlan`] is built exactly once, at session initialization, by
//! flattening the document's part/section/itemRef tree. Shuffle and
//! selection have already been applied by the front end that produced the
//! document. Nodes live in a pre-order arena and are addressed by index
//! internally and by [`TestPlanNodeKey`] at the API surface, so repeated
//! identifiers stay distinguishable.

use crate::document::{AssessmentSection, SectionPart, TestDocument};
use crate::error::{DeliveryError, Result};
use crate::types::Identifier;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Unique key of a plan node: identifier, position in the plan, and
/// occurrence number of that identifier.
///
/// Serialized in the string form `identifier:globalIndex:instance`, which is
/// also what keyed state maps use.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TestPlanNodeKey {
    identifier: Identifier,
    global_index: u32,
    instance: u32,
}

impl TestPlanNodeKey {
    /// Creates a key. Normally only the planner does this.
    pub fn new(identifier: Identifier, global_index: u32, instance: u32) -> Self {
        Self {
            identifier,
            global_index,
            instance,
        }
    }

    /// The node identifier (not unique on its own).
    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    /// Position of the node in plan order.
    pub fn global_index(&self) -> u32 {
        self.global_index
    }

    /// 1-based occurrence number of this identifier within the plan.
    pub fn instance(&self) -> u32 {
        self.instance
    }
}

impl fmt::Display for TestPlanNodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.identifier, self.global_index, self.instance
        )
    }
}

impl FromStr for TestPlanNodeKey {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || DeliveryError::Deserialization(format!("malformed test plan key: {s:?}"));
        let mut parts = s.split(':');
        let identifier = Identifier::new(parts.next().ok_or_else(bad)?)?;
        let global_index = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(bad)?;
        let instance = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(bad)?;
        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(Self {
            identifier,
            global_index,
            instance,
        })
    }
}

impl Serialize for TestPlanNodeKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TestPlanNodeKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// What a plan node stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestPlanNodeKind {
    /// A test part.
    TestPart,
    /// An assessment section.
    AssessmentSection,
    /// An item reference.
    AssessmentItemRef,
}

/// One node of the flattened plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPlanNode {
    /// Unique key of this node.
    pub key: TestPlanNodeKey,
    /// Node kind.
    pub kind: TestPlanNodeKind,
    /// Arena index of the parent; `None` for test parts.
    pub parent: Option<usize>,
    /// Arena indexes of the children, in plan order.
    pub children: Vec<usize>,
}

/// The flattened traversal order over a test's nodes.
#[derive(Debug, Clone)]
pub struct TestPlan {
    nodes: Vec<TestPlanNode>,
    index_by_key: HashMap<TestPlanNodeKey, usize>,
}

impl TestPlan {
    fn from_nodes(nodes: Vec<TestPlanNode>) -> Self {
        let index_by_key = nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (node.key.clone(), index))
            .collect();
        Self {
            nodes,
            index_by_key,
        }
    }

    /// All nodes in plan (pre-)order.
    pub fn nodes(&self) -> impl Iterator<Item = &TestPlanNode> {
        self.nodes.iter()
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the plan has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node by arena index.
    pub fn node(&self, index: usize) -> &TestPlanNode {
        &self.nodes[index]
    }

    /// Arena index of a key.
    pub fn index_of(&self, key: &TestPlanNodeKey) -> Option<usize> {
        self.index_by_key.get(key).copied()
    }

    /// Node by key.
    pub fn get(&self, key: &TestPlanNodeKey) -> Option<&TestPlanNode> {
        self.index_of(key).map(|index| self.node(index))
    }

    /// Arena indexes of a node's children.
    pub fn children_of(&self, index: usize) -> &[usize] {
        &self.nodes[index].children
    }

    /// Arena index of the next sibling in plan order.
    pub fn next_sibling(&self, index: usize) -> Option<usize> {
        let siblings: &[usize] = match self.nodes[index].parent {
            Some(parent) => &self.nodes[parent].children,
            None => return self.next_top_level(index),
        };
        let position = siblings.iter().position(|&i| i == index)?;
        siblings.get(position + 1).copied()
    }

    fn next_top_level(&self, index: usize) -> Option<usize> {
        let tops = self.test_part_indexes();
        let position = tops.iter().position(|&i| i == index)?;
        tops.get(position + 1).copied()
    }

    /// Ancestor indexes of a node, nearest first.
    pub fn ancestors_of(&self, index: usize) -> Vec<usize> {
        let mut ancestors = Vec::new();
        let mut current = self.nodes[index].parent;
        while let Some(parent) = current {
            ancestors.push(parent);
            current = self.nodes[parent].parent;
        }
        ancestors
    }

    /// True when `ancestor` lies on `index`'s parent chain.
    pub fn is_descendant_of(&self, index: usize, ancestor: usize) -> bool {
        let mut current = self.nodes[index].parent;
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.nodes[parent].parent;
        }
        false
    }

    /// Indexes of the whole subtree under `index` (excluding it), pre-order.
    pub fn descendants_of(&self, index: usize) -> Vec<usize> {
        let mut result = Vec::new();
        self.collect_descendants(index, &mut result);
        result
    }

    fn collect_descendants(&self, index: usize, into: &mut Vec<usize>) {
        for &child in &self.nodes[index].children {
            into.push(child);
            self.collect_descendants(child, into);
        }
    }

    /// Indexes of the top-level test part nodes, in plan order.
    pub fn test_part_indexes(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.kind == TestPlanNodeKind::TestPart)
            .map(|(index, _)| index)
            .collect()
    }

    /// Item-ref indexes under `index`, in plan order.
    pub fn item_refs_under(&self, index: usize) -> Vec<usize> {
        self.descendants_of(index)
            .into_iter()
            .filter(|&i| self.nodes[i].kind == TestPlanNodeKind::AssessmentItemRef)
            .collect()
    }

    /// First node after `from` (in arena order) carrying `identifier`.
    ///
    /// Branch rules only ever jump forward; this is their target lookup.
    pub fn find_forward(&self, from: usize, identifier: &Identifier) -> Option<usize> {
        self.nodes
            .iter()
            .enumerate()
            .skip(from + 1)
            .find(|(_, node)| node.key.identifier() == identifier)
            .map(|(index, _)| index)
    }
}

impl PartialEq for TestPlan {
    fn eq(&self, other: &Self) -> bool {
        self.nodes == other.nodes
    }
}

impl Serialize for TestPlan {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.nodes.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TestPlan {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let nodes = Vec::<TestPlanNode>::deserialize(deserializer)?;
        Ok(Self::from_nodes(nodes))
    }
}

/// Builds a [`TestPlan`] from a test document.
pub struct TestPlanner<'a> {
    document: &'a TestDocument,
}

impl<'a> TestPlanner<'a> {
    /// Creates a planner over a document.
    pub fn new(document: &'a TestDocument) -> Self {
        Self { document }
    }

    /// Flattens the document into a plan, assigning each node a stable key
    /// via per-identifier occurrence counters.
    pub fn plan(&self) -> TestPlan {
        let mut builder = PlanBuilder::default();
        for part in &self.document.test_parts {
            let part_index =
                builder.push(&part.identifier, TestPlanNodeKind::TestPart, None);
            for section in &part.sections {
                self.plan_section(&mut builder, section, part_index);
            }
        }
        TestPlan::from_nodes(builder.nodes)
    }

    fn plan_section(
        &self,
        builder: &mut PlanBuilder,
        section: &AssessmentSection,
        parent: usize,
    ) {
        let section_index = builder.push(
            &section.identifier,
            TestPlanNodeKind::AssessmentSection,
            Some(parent),
        );
        for part in &section.parts {
            match part {
                SectionPart::Section(nested) => {
                    self.plan_section(builder, nested, section_index);
                }
                SectionPart::ItemRef(item_ref) => {
                    builder.push(
                        &item_ref.identifier,
                        TestPlanNodeKind::AssessmentItemRef,
                        Some(section_index),
                    );
                }
            }
        }
    }
}

#[derive(Default)]
struct PlanBuilder {
    nodes: Vec<TestPlanNode>,
    occurrences: HashMap<Identifier, u32>,
}

impl PlanBuilder {
    fn push(
        &mut self,
        identifier: &Identifier,
        kind: TestPlanNodeKind,
        parent: Option<usize>,
    ) -> usize {
        let instance = self
            .occurrences
            .entry(identifier.clone())
            .and_modify(|n| *n += 1)
            .or_insert(1);
        let index = self.nodes.len();
        let key = TestPlanNodeKey::new(identifier.clone(), index as u32, *instance);
        self.nodes.push(TestPlanNode {
            key,
            kind,
            parent,
            children: Vec::new(),
        });
        if let Some(parent) = parent {
            self.nodes[parent].children.push(index);
        }
        index
    }
}
