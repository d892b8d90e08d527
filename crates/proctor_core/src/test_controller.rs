//! Session controller for a whole test.
//!
//! Drives the test plan: entering parts in plan order, item selection under
//! linear/nonlinear navigation, branch-rule jumps, precondition skips,
//! per-item delegation, deferred response processing under simultaneous
//! submission, and test-level outcome processing.
//!
//! Traversal bookkeeping for skipped nodes is deliberately asymmetric and
//! matches the delivery semantics exactly: a node skipped by a failed
//! precondition or a branch jump keeps its flag and is never *ended*; an
//! unreached, unflagged node gains an end time when its part ends; every
//! node of a part gains an exit time when the part is exited.

use crate::document::{
    AssessmentSection, BranchRule, BranchTarget, ItemRef, SectionPart, TestDocument, TestPart,
};
use crate::error::{DeliveryError, Result};
use crate::expression::{
    run_rules, Expression, ProcessingEngine, RuleContext, VariableLookup, VariableRef,
};
use crate::item_controller::ItemSessionController;
use crate::session_state::{ControlSessionState, TestSessionState};
use crate::settings::TestSessionControllerSettings;
use crate::test_plan::{TestPlan, TestPlanNode, TestPlanNodeKey, TestPlanNodeKind, TestPlanner};
use crate::types::{Identifier, NavigationMode, ResponseData, SubmissionMode, Timestamp, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Controller driving one candidate's test session.
///
/// Owns the session state exclusively; borrows the document, plan inputs and
/// the processing engine read-only. Not thread safe; the hosting application
/// serializes calls per candidate session.
pub struct TestSessionController<'a> {
    document: &'a TestDocument,
    engine: &'a dyn ProcessingEngine,
    settings: TestSessionControllerSettings,
    plan: TestPlan,
    state: TestSessionState,
    part_lookup: HashMap<Identifier, &'a TestPart>,
    section_lookup: HashMap<Identifier, &'a AssessmentSection>,
    item_ref_lookup: HashMap<Identifier, &'a ItemRef>,
}

impl<'a> TestSessionController<'a> {
    /// Creates a controller with a freshly planned test and fresh state.
    pub fn new(
        document: &'a TestDocument,
        engine: &'a dyn ProcessingEngine,
        settings: TestSessionControllerSettings,
    ) -> Self {
        let plan = TestPlanner::new(document).plan();
        let state = TestSessionState::new(&plan);
        Self::with_state(document, engine, settings, plan, state)
    }

    /// Creates a controller over a restored plan and session state.
    pub fn with_state(
        document: &'a TestDocument,
        engine: &'a dyn ProcessingEngine,
        settings: TestSessionControllerSettings,
        plan: TestPlan,
        state: TestSessionState,
    ) -> Self {
        let mut part_lookup = HashMap::new();
        let mut section_lookup = HashMap::new();
        let mut item_ref_lookup = HashMap::new();
        for part in &document.test_parts {
            part_lookup.insert(part.identifier.clone(), part);
            for section in &part.sections {
                index_section(section, &mut section_lookup, &mut item_ref_lookup);
            }
        }
        Self {
            document,
            engine,
            settings,
            plan,
            state,
            part_lookup,
            section_lookup,
            item_ref_lookup,
        }
    }

    /// The document this session runs.
    pub fn document(&self) -> &TestDocument {
        self.document
    }

    /// The flattened test plan.
    pub fn test_plan(&self) -> &TestPlan {
        &self.plan
    }

    /// Read access to the session state.
    pub fn test_session_state(&self) -> &TestSessionState {
        &self.state
    }

    /// Consumes the controller, releasing the session state (for snapshots).
    pub fn into_state(self) -> TestSessionState {
        self.state
    }

    //-------------------------------------------------------------------
    // Test entry and part traversal

    /// Enters the test: opens the test-level session, initializes test
    /// outcome variables and runs template processing plus variable defaults
    /// for every item in the plan. No part is entered yet.
    pub fn enter_test(&mut self, timestamp: Timestamp) -> Result<()> {
        if self.state.control.is_entered() {
            return Err(DeliveryError::state("enter test", "test already entered"));
        }
        debug!(test = %self.document.identifier, "entering test");
        self.state.control.mark_entered(timestamp);
        for declaration in &self.document.outcome_declarations {
            self.state
                .outcome_values
                .insert(declaration.identifier.clone(), declaration.initial_value());
        }
        self.initialize_all_items(timestamp)?;
        Ok(())
    }

    /// Read-only lookahead: the next part that could be entered now.
    ///
    /// Does not mark precondition failures; [`Self::enter_next_available_test_part`]
    /// does that when traversal actually happens.
    pub fn find_next_enterable_test_part(&self) -> Result<Option<&TestPlanNode>> {
        for part_index in self.part_scan_range()? {
            let part_state = self.control_state(part_index)?;
            if part_state.is_entered()
                || part_state.is_ended()
                || part_state.pre_condition_failed
                || part_state.jumped_by_branch_rule
            {
                continue;
            }
            let part = self.part_doc(part_index)?;
            if self.preconditions_pass(&part.preconditions)? {
                return Ok(Some(self.plan.node(part_index)));
            }
        }
        Ok(None)
    }

    /// Moves to the first enterable part in plan order.
    ///
    /// Exits the previous (ended) part first. Parts whose preconditions fail
    /// are flagged and skipped. Entering a linear part auto-enters the first
    /// eligible section path and item; a nonlinear part selects nothing.
    /// When no part remains the test itself ends; `None` is returned.
    pub fn enter_next_available_test_part(
        &mut self,
        timestamp: Timestamp,
    ) -> Result<Option<&TestPlanNode>> {
        self.ensure_test_open("enter next test part")?;
        self.touch_open_durations(timestamp);

        let scan = self.part_scan_range()?;
        if let Some(previous_key) = self.state.current_test_part_key.take() {
            let previous_index = self
                .plan
                .index_of(&previous_key)
                .ok_or_else(|| DeliveryError::UnknownNode(previous_key.clone()))?;
            if !self.control_state(previous_index)?.is_ended() {
                self.state.current_test_part_key = Some(previous_key);
                return Err(DeliveryError::state(
                    "enter next test part",
                    "current test part has not been ended",
                ));
            }
            self.exit_part_subtree(previous_index, timestamp);
        }

        for part_index in scan {
            let part_state = self.control_state(part_index)?;
            if part_state.is_entered()
                || part_state.is_ended()
                || part_state.pre_condition_failed
                || part_state.jumped_by_branch_rule
            {
                continue;
            }
            let part = self.part_doc(part_index)?;
            if !self.preconditions_pass(&part.preconditions)? {
                debug!(part = %self.plan.node(part_index).key, "test part precondition failed");
                self.control_state_mut(part_index).pre_condition_failed = true;
                continue;
            }

            debug!(part = %self.plan.node(part_index).key, "entering test part");
            self.control_state_mut(part_index).mark_entered(timestamp);
            self.state.current_test_part_key = Some(self.plan.node(part_index).key.clone());
            if part.navigation_mode == NavigationMode::Linear {
                self.continue_traversal(part_index, Cursor::ChildrenOf(part_index), timestamp)?;
            }
            return Ok(Some(self.plan.node(part_index)));
        }

        self.end_test(timestamp);
        Ok(None)
    }

    //-------------------------------------------------------------------
    // Nonlinear navigation

    /// Whether the item behind `key` may be selected right now.
    ///
    /// An unknown key is an invalid-argument error; everything else is a
    /// plain yes/no.
    pub fn may_select_item_nonlinear(&self, key: &TestPlanNodeKey) -> Result<bool> {
        let index = self
            .plan
            .index_of(key)
            .ok_or_else(|| DeliveryError::UnknownNode(key.clone()))?;
        if self.plan.node(index).kind != TestPlanNodeKind::AssessmentItemRef {
            return Ok(false);
        }
        if !self.state.control.is_open() {
            return Ok(false);
        }
        let Some(part_index) = self.current_part_index()? else {
            return Ok(false);
        };
        let part = self.part_doc(part_index)?;
        if part.navigation_mode != NavigationMode::Nonlinear
            || !self.control_state(part_index)?.is_open()
        {
            return Ok(false);
        }
        if !self.plan.is_descendant_of(index, part_index) {
            return Ok(false);
        }
        Ok(!self.control_state(index)?.is_ended())
    }

    /// Selects an item inside a nonlinear part, or deselects with `None`.
    ///
    /// Deselecting suspends the current item. Selecting suspends any
    /// previous item and enters or resumes the target, entering its
    /// not-yet-entered ancestor sections on the way.
    pub fn select_item_nonlinear(
        &mut self,
        timestamp: Timestamp,
        target: Option<&TestPlanNodeKey>,
    ) -> Result<()> {
        self.ensure_test_open("select item")?;
        let part_index = self
            .current_part_index()?
            .ok_or_else(|| DeliveryError::state("select item", "no current test part"))?;
        let part = self.part_doc(part_index)?;
        if part.navigation_mode != NavigationMode::Nonlinear {
            return Err(DeliveryError::state(
                "select item",
                "current test part does not use nonlinear navigation",
            ));
        }
        if !self.control_state(part_index)?.is_open() {
            return Err(DeliveryError::state(
                "select item",
                "current test part is not open",
            ));
        }

        let target_index = match target {
            None => None,
            Some(key) => {
                let index = self
                    .plan
                    .index_of(key)
                    .ok_or_else(|| DeliveryError::UnknownNode(key.clone()))?;
                if self.plan.node(index).kind != TestPlanNodeKind::AssessmentItemRef {
                    return Err(DeliveryError::state(
                        "select item",
                        format!("{key} is not an item"),
                    ));
                }
                if !self.plan.is_descendant_of(index, part_index) {
                    return Err(DeliveryError::state(
                        "select item",
                        format!("{key} is not inside the current test part"),
                    ));
                }
                if self.control_state(index)?.is_ended() {
                    return Err(DeliveryError::state(
                        "select item",
                        format!("item session {key} has already ended"),
                    ));
                }
                Some(index)
            }
        };

        self.touch_open_durations(timestamp);

        let current_index = self.current_item_index()?;
        if target_index.is_some() && target_index == current_index {
            return Ok(());
        }

        if let Some(current) = current_index {
            self.with_item_controller(current, |controller| {
                if controller.state().is_interacting() {
                    controller.suspend_item_session(timestamp)?;
                }
                Ok(())
            })?;
            self.state.current_item_key = None;
        }

        if let Some(index) = target_index {
            self.enter_or_resume_item(index, timestamp)?;
            self.state.current_item_key = Some(self.plan.node(index).key.clone());
        }
        Ok(())
    }

    //-------------------------------------------------------------------
    // Linear navigation

    /// Closes the current item and advances to the next eligible one.
    ///
    /// Branch rules on the closed item (and on every container being left)
    /// are evaluated in order; a taken rule jumps, flagging the nodes it
    /// passes over. Otherwise traversal proceeds in plan order with the
    /// precondition-skip rule applied recursively. Returns the newly
    /// entered item, or `None` when the part is exhausted — which also ends
    /// the part.
    pub fn advance_item_linear(&mut self, timestamp: Timestamp) -> Result<Option<&TestPlanNode>> {
        self.ensure_test_open("advance item")?;
        let part_index = self
            .current_part_index()?
            .ok_or_else(|| DeliveryError::state("advance item", "no current test part"))?;
        let part = self.part_doc(part_index)?;
        if part.navigation_mode != NavigationMode::Linear {
            return Err(DeliveryError::state(
                "advance item",
                "current test part does not use linear navigation",
            ));
        }
        if !self.control_state(part_index)?.is_open() {
            return Err(DeliveryError::state(
                "advance item",
                "current test part is not open",
            ));
        }
        let item_index = self.current_item_index()?.ok_or_else(|| {
            DeliveryError::state("advance item", "no item is currently selected")
        })?;

        self.touch_open_durations(timestamp);

        // Under individual submission the item is done for good; under
        // simultaneous submission its session stays reopenable until the
        // part ends, so it is only suspended.
        let submission_mode = part.submission_mode;
        self.with_item_controller(item_index, |controller| {
            match submission_mode {
                SubmissionMode::Individual => controller.end_item(timestamp)?,
                SubmissionMode::Simultaneous => {
                    if controller.state().is_interacting() {
                        controller.suspend_item_session(timestamp)?;
                    }
                }
            }
            Ok(())
        })?;
        self.state.current_item_key = None;

        let item_ref = self.item_ref_doc(item_index)?;
        if let Some(taken) = self.first_taken_branch(&item_ref.branch_rules)? {
            let entered = self.apply_branch(item_index, part_index, taken, timestamp)?;
            return Ok(entered.map(|index| self.plan.node(index)));
        }

        let entered =
            self.continue_traversal(part_index, Cursor::After(item_index), timestamp)?;
        Ok(entered.map(|index| self.plan.node(index)))
    }

    //-------------------------------------------------------------------
    // Responses

    /// Binds (and, depending on submission mode, commits and processes)
    /// responses to the currently selected item.
    ///
    /// Under individual submission a fully successful bind triggers commit,
    /// response processing and one outcome-processing pass. Under
    /// simultaneous submission only bind and commit happen now; processing
    /// is deferred to the end of the part. Returns the bind outcome.
    pub fn handle_responses_to_current_item(
        &mut self,
        timestamp: Timestamp,
        responses: &BTreeMap<Identifier, ResponseData>,
    ) -> Result<bool> {
        self.ensure_test_open("handle responses")?;
        let part_index = self
            .current_part_index()?
            .ok_or_else(|| DeliveryError::state("handle responses", "no current test part"))?;
        if !self.control_state(part_index)?.is_open() {
            return Err(DeliveryError::state(
                "handle responses",
                "current test part is not open",
            ));
        }
        let item_index = self.current_item_index()?.ok_or_else(|| {
            DeliveryError::state("handle responses", "no item is currently selected")
        })?;
        let submission_mode = self.part_doc(part_index)?.submission_mode;

        self.touch_open_durations(timestamp);

        let bound = self.with_item_controller(item_index, |controller| {
            controller.bind_responses(timestamp, responses)
        })?;

        match submission_mode {
            SubmissionMode::Individual => {
                if bound {
                    self.with_item_controller(item_index, |controller| {
                        controller.commit_responses(timestamp)?;
                        controller.perform_response_processing(timestamp)
                    })?;
                    self.perform_outcome_processing()?;
                }
            }
            SubmissionMode::Simultaneous => {
                self.with_item_controller(item_index, |controller| {
                    if !controller.state().uncommitted_response_values.is_empty() {
                        controller.commit_responses(timestamp)?;
                    }
                    Ok(())
                })?;
            }
        }
        Ok(bound)
    }

    //-------------------------------------------------------------------
    // Part and test end

    /// Whether the current part could be ended right now.
    pub fn may_end_current_test_part(&self) -> Result<bool> {
        if !self.state.control.is_open() {
            return Ok(false);
        }
        match self.current_part_index()? {
            Some(index) => Ok(self.control_state(index)?.is_open()),
            None => Ok(false),
        }
    }

    /// Explicitly ends the current test part.
    ///
    /// Every open node in the part is ended; unreached, unflagged nodes
    /// become *ended but not entered*. Under simultaneous submission,
    /// response processing then runs for every entered item in plan order.
    /// Outcome processing runs exactly once.
    pub fn end_current_test_part(&mut self, timestamp: Timestamp) -> Result<()> {
        self.ensure_test_open("end test part")?;
        let part_index = self
            .current_part_index()?
            .ok_or_else(|| DeliveryError::state("end test part", "no current test part"))?;
        if !self.control_state(part_index)?.is_open() {
            return Err(DeliveryError::state(
                "end test part",
                "current test part is not open",
            ));
        }
        self.touch_open_durations(timestamp);
        self.end_part(part_index, timestamp)
    }

    /// Whether the test could be exited right now.
    pub fn may_exit_test(&self) -> Result<bool> {
        Ok(self.state.control.is_ended() && !self.state.control.is_exited())
    }

    /// Exits the test. Requires it to have ended.
    pub fn exit_test(&mut self, timestamp: Timestamp) -> Result<()> {
        if !self.state.control.is_ended() {
            return Err(DeliveryError::state("exit test", "test has not been ended"));
        }
        if self.state.control.is_exited() {
            return Err(DeliveryError::state("exit test", "test already exited"));
        }
        self.state.control.mark_exited(timestamp);
        Ok(())
    }

    /// Abandons the attempt from any open state.
    ///
    /// Ends and exits every entered-but-not-exited node immediately, then
    /// ends and exits the test. Never-entered nodes are left untouched. No
    /// response or outcome processing runs.
    pub fn exit_test_incomplete(&mut self, timestamp: Timestamp) -> Result<()> {
        self.ensure_test_open("exit test incomplete")?;
        if self.state.control.is_exited() {
            return Err(DeliveryError::state(
                "exit test incomplete",
                "test already exited",
            ));
        }
        debug!("abandoning test session");
        self.touch_open_durations(timestamp);

        for index in 0..self.plan.len() {
            match self.plan.node(index).kind {
                TestPlanNodeKind::AssessmentItemRef => {
                    let key = self.plan.node(index).key.clone();
                    let item_state = self.state.item_states.entry(key).or_default();
                    if item_state.control.is_entered() {
                        item_state.suspend_time = None;
                        if !item_state.control.is_ended() {
                            item_state.control.mark_ended(timestamp);
                        }
                        if !item_state.control.is_exited() {
                            item_state.control.mark_exited(timestamp);
                        }
                    }
                }
                _ => {
                    let control = self.control_state_mut(index);
                    if control.is_entered() {
                        if !control.is_ended() {
                            control.mark_ended(timestamp);
                        }
                        if !control.is_exited() {
                            control.mark_exited(timestamp);
                        }
                    }
                }
            }
        }

        self.state.control.mark_ended(timestamp);
        self.state.control.mark_exited(timestamp);
        self.state.current_test_part_key = None;
        self.state.current_item_key = None;
        Ok(())
    }

    //-------------------------------------------------------------------
    // Internals: traversal

    fn continue_traversal(
        &mut self,
        part_index: usize,
        start: Cursor,
        timestamp: Timestamp,
    ) -> Result<Option<usize>> {
        let (mut parent, mut position) = match start {
            Cursor::ChildrenOf(container) => (container, 0),
            Cursor::After(node) => {
                let parent = self
                    .plan
                    .node(node)
                    .parent
                    .expect("traversal nodes always have a parent");
                (parent, self.child_position(parent, node) + 1)
            }
        };

        loop {
            let children = self.plan.children_of(parent).to_vec();
            if position < children.len() {
                let candidate = children[position];
                match self.plan.node(candidate).kind {
                    TestPlanNodeKind::AssessmentSection => {
                        let section = self.section_doc(candidate)?;
                        if self.preconditions_pass(&section.preconditions)? {
                            self.control_state_mut(candidate).mark_entered(timestamp);
                            parent = candidate;
                            position = 0;
                        } else {
                            debug!(section = %self.plan.node(candidate).key, "section precondition failed");
                            self.control_state_mut(candidate).pre_condition_failed = true;
                            position += 1;
                        }
                    }
                    TestPlanNodeKind::AssessmentItemRef => {
                        let item_ref = self.item_ref_doc(candidate)?;
                        if self.preconditions_pass(&item_ref.preconditions)? {
                            self.enter_or_resume_item(candidate, timestamp)?;
                            self.state.current_item_key =
                                Some(self.plan.node(candidate).key.clone());
                            return Ok(Some(candidate));
                        }
                        debug!(item = %self.plan.node(candidate).key, "item precondition failed");
                        self.control_state_mut(candidate).pre_condition_failed = true;
                        position += 1;
                    }
                    TestPlanNodeKind::TestPart => {
                        return Err(DeliveryError::state(
                            "traversal",
                            "test part nested inside a test part",
                        ));
                    }
                }
            } else {
                if parent == part_index {
                    // Part exhausted: part-level branch rules may still
                    // redirect; otherwise the part ends here.
                    let part = self.part_doc(part_index)?;
                    if let Some(taken) = self.first_taken_branch(&part.branch_rules)? {
                        return self.apply_branch(part_index, part_index, taken, timestamp);
                    }
                    self.end_part(part_index, timestamp)?;
                    return Ok(None);
                }
                // Leaving a section: end it, then give its branch rules a
                // chance to redirect traversal.
                self.control_state_mut(parent).mark_ended(timestamp);
                let section = self.section_doc(parent)?;
                if let Some(taken) = self.first_taken_branch(&section.branch_rules)? {
                    return self.apply_branch(parent, part_index, taken, timestamp);
                }
                let grandparent = self
                    .plan
                    .node(parent)
                    .parent
                    .expect("sections always have a parent");
                position = self.child_position(grandparent, parent) + 1;
                parent = grandparent;
            }
        }
    }

    /// Executes a taken branch rule originating at `source_index`.
    ///
    /// Returns the index of the newly entered item, or `None` when the
    /// branch ended the part (or the test).
    fn apply_branch(
        &mut self,
        source_index: usize,
        part_index: usize,
        target: BranchTarget,
        timestamp: Timestamp,
    ) -> Result<Option<usize>> {
        debug!(source = %self.plan.node(source_index).key, ?target, "branch rule taken");
        match target {
            BranchTarget::ExitTestPart => {
                self.end_part(part_index, timestamp)?;
                Ok(None)
            }
            BranchTarget::ExitTest => {
                self.end_part(part_index, timestamp)?;
                self.exit_part_subtree(part_index, timestamp);
                self.end_test(timestamp);
                Ok(None)
            }
            BranchTarget::ExitSection => {
                let section_index = self
                    .plan
                    .ancestors_of(source_index)
                    .into_iter()
                    .find(|&a| {
                        self.plan.node(a).kind == TestPlanNodeKind::AssessmentSection
                            && self
                                .control_state(a)
                                .map(|s| s.is_open())
                                .unwrap_or(false)
                    });
                match section_index {
                    Some(section_index) => {
                        self.mark_jumped_span(source_index, self.subtree_end(section_index));
                        self.control_state_mut(section_index).mark_ended(timestamp);
                        self.continue_traversal(
                            part_index,
                            Cursor::After(section_index),
                            timestamp,
                        )
                    }
                    // No enclosing section left to exit: the part ends.
                    None => {
                        self.end_part(part_index, timestamp)?;
                        Ok(None)
                    }
                }
            }
            BranchTarget::Node(identifier) => {
                let target_index = self
                    .plan
                    .find_forward(source_index, &identifier)
                    .ok_or(DeliveryError::BranchTargetNotFound(identifier))?;
                match self.plan.node(target_index).kind {
                    TestPlanNodeKind::TestPart => {
                        // Jump to a later part: flag the parts in between,
                        // then end this one. The part-entry scan lands on
                        // the target next.
                        for index in self.plan.test_part_indexes() {
                            if index > part_index && index < target_index {
                                self.control_state_mut(index).jumped_by_branch_rule = true;
                            }
                        }
                        self.end_part(part_index, timestamp)?;
                        Ok(None)
                    }
                    TestPlanNodeKind::AssessmentSection => {
                        if !self.plan.is_descendant_of(target_index, part_index) {
                            return Err(DeliveryError::state(
                                "branch rule",
                                "branch target section lies outside the current test part",
                            ));
                        }
                        self.jump_within_part(source_index, target_index, timestamp)?;
                        self.control_state_mut(target_index).mark_entered(timestamp);
                        self.continue_traversal(
                            part_index,
                            Cursor::ChildrenOf(target_index),
                            timestamp,
                        )
                    }
                    TestPlanNodeKind::AssessmentItemRef => {
                        if !self.plan.is_descendant_of(target_index, part_index) {
                            return Err(DeliveryError::state(
                                "branch rule",
                                "branch target item lies outside the current test part",
                            ));
                        }
                        self.jump_within_part(source_index, target_index, timestamp)?;
                        self.enter_or_resume_item(target_index, timestamp)?;
                        self.state.current_item_key =
                            Some(self.plan.node(target_index).key.clone());
                        Ok(Some(target_index))
                    }
                }
            }
        }
    }

    /// Flags the nodes a jump passes over and closes the sections it leaves.
    fn jump_within_part(
        &mut self,
        source_index: usize,
        target_index: usize,
        timestamp: Timestamp,
    ) -> Result<()> {
        // Sections the jump leaves behind: open ancestors of the source
        // that do not contain the target.
        for ancestor in self.plan.ancestors_of(source_index) {
            if self.plan.node(ancestor).kind != TestPlanNodeKind::AssessmentSection {
                continue;
            }
            if self.plan.is_descendant_of(target_index, ancestor) || ancestor == target_index {
                continue;
            }
            if self.control_state(ancestor)?.is_open() {
                self.control_state_mut(ancestor).mark_ended(timestamp);
            }
        }
        // Nodes strictly between source and target that do not lie on the
        // target's ancestor path were jumped over, never entered.
        for index in (source_index + 1)..target_index {
            if self.plan.is_descendant_of(target_index, index) {
                continue;
            }
            let control = self.control_state_mut(index);
            if !control.is_entered() && !control.is_ended() && !control.pre_condition_failed {
                control.jumped_by_branch_rule = true;
            }
        }
        // Sections on the path into the target open now.
        let mut path: Vec<usize> = self
            .plan
            .ancestors_of(target_index)
            .into_iter()
            .filter(|&a| self.plan.node(a).kind == TestPlanNodeKind::AssessmentSection)
            .collect();
        path.reverse();
        for section_index in path {
            if !self.control_state(section_index)?.is_entered() {
                self.control_state_mut(section_index).mark_entered(timestamp);
            }
        }
        Ok(())
    }

    fn mark_jumped_span(&mut self, after: usize, end_exclusive: usize) {
        for index in (after + 1)..end_exclusive {
            let control = self.control_state_mut(index);
            if !control.is_entered() && !control.is_ended() && !control.pre_condition_failed {
                control.jumped_by_branch_rule = true;
            }
        }
    }

    /// Arena index just past the subtree rooted at `index` (pre-order).
    fn subtree_end(&self, index: usize) -> usize {
        self.plan
            .descendants_of(index)
            .into_iter()
            .max()
            .map_or(index + 1, |last| last + 1)
    }

    //-------------------------------------------------------------------
    // Internals: part end & exit

    /// Ends a part: closes every node in it, runs deferred response
    /// processing under simultaneous submission, and runs outcome
    /// processing exactly once.
    fn end_part(&mut self, part_index: usize, timestamp: Timestamp) -> Result<()> {
        debug!(part = %self.plan.node(part_index).key, "ending test part");
        let submission_mode = self.part_doc(part_index)?.submission_mode;

        for index in self.plan.descendants_of(part_index) {
            match self.plan.node(index).kind {
                TestPlanNodeKind::AssessmentItemRef => {
                    let key = self.plan.node(index).key.clone();
                    let item_state = self.state.item_states.entry(key).or_default();
                    if item_state.control.is_entered() {
                        if !item_state.control.is_ended() {
                            item_state.suspend_time = None;
                            item_state.control.mark_ended(timestamp);
                        }
                    } else if !item_state.control.is_ended()
                        && !item_state.control.pre_condition_failed
                        && !item_state.control.jumped_by_branch_rule
                    {
                        item_state.control.mark_ended(timestamp);
                    }
                }
                _ => {
                    let control = self.control_state_mut(index);
                    if control.is_entered() {
                        if !control.is_ended() {
                            control.mark_ended(timestamp);
                        }
                    } else if !control.is_ended()
                        && !control.pre_condition_failed
                        && !control.jumped_by_branch_rule
                    {
                        control.mark_ended(timestamp);
                    }
                }
            }
        }

        if submission_mode == SubmissionMode::Simultaneous {
            for index in self.plan.item_refs_under(part_index) {
                let entered = self.control_state(index)?.is_entered();
                if entered {
                    self.with_item_controller(index, |controller| {
                        controller.perform_response_processing(timestamp)
                    })?;
                }
            }
        }

        self.perform_outcome_processing()?;
        self.control_state_mut(part_index).mark_ended(timestamp);
        self.state.current_item_key = None;
        Ok(())
    }

    /// Exits a part and everything inside it, whatever each node's
    /// entered/ended combination.
    fn exit_part_subtree(&mut self, part_index: usize, timestamp: Timestamp) {
        let mut indexes = vec![part_index];
        indexes.extend(self.plan.descendants_of(part_index));
        for index in indexes {
            let control = self.control_state_mut(index);
            if !control.is_exited() {
                control.mark_exited(timestamp);
            }
        }
    }

    fn end_test(&mut self, timestamp: Timestamp) {
        debug!("test has ended");
        self.state.control.mark_ended(timestamp);
        self.state.current_test_part_key = None;
        self.state.current_item_key = None;
    }

    //-------------------------------------------------------------------
    // Internals: items

    /// Template processing and variable defaults for every item in the
    /// plan, without entering any of them. Restored sessions keep whatever
    /// their items already hold.
    fn initialize_all_items(&mut self, timestamp: Timestamp) -> Result<()> {
        let item_indexes: Vec<usize> = self
            .plan
            .nodes()
            .enumerate()
            .filter(|(_, node)| node.kind == TestPlanNodeKind::AssessmentItemRef)
            .map(|(index, _)| index)
            .collect();
        for index in item_indexes {
            self.with_item_controller(index, |controller| {
                if !controller.state().template_processed {
                    controller.perform_template_processing(timestamp)?;
                }
                controller.initialize_variables();
                Ok(())
            })?;
        }
        Ok(())
    }

    fn enter_or_resume_item(&mut self, item_index: usize, timestamp: Timestamp) -> Result<()> {
        // Ancestor sections open on the way in (outermost first).
        let mut sections: Vec<usize> = self
            .plan
            .ancestors_of(item_index)
            .into_iter()
            .filter(|&a| self.plan.node(a).kind == TestPlanNodeKind::AssessmentSection)
            .collect();
        sections.reverse();
        for section_index in sections {
            if !self.control_state(section_index)?.is_entered() {
                self.control_state_mut(section_index).mark_entered(timestamp);
            }
        }
        self.with_item_controller(item_index, |controller| {
            if !controller.state().control.is_entered() {
                controller.enter_item(timestamp)
            } else if controller.state().is_suspended() {
                controller.unsuspend_item_session(timestamp)
            } else {
                Ok(())
            }
        })
    }

    fn with_item_controller<R>(
        &mut self,
        item_index: usize,
        f: impl FnOnce(&mut ItemSessionController<'_>) -> Result<R>,
    ) -> Result<R> {
        let document = self.document;
        let engine = self.engine;
        let settings = self.settings.item_settings();
        let node = self.plan.node(item_index);
        let key = node.key.clone();
        let item_ref = *self
            .item_ref_lookup
            .get(key.identifier())
            .ok_or_else(|| DeliveryError::UnknownNode(key.clone()))?;
        let item = document
            .items
            .get(&item_ref.item_identifier)
            .ok_or_else(|| DeliveryError::UnknownItem(item_ref.item_identifier.clone()))?;
        let state = self.state.item_states.entry(key).or_default();
        let mut controller = ItemSessionController::new(item, engine, settings, state);
        f(&mut controller)
    }

    //-------------------------------------------------------------------
    // Internals: processing & evaluation

    /// Runs the test-level outcome rules.
    fn perform_outcome_processing(&mut self) -> Result<()> {
        debug!("outcome processing");
        let mut ctx = TestRuleContext {
            document: self.document,
            plan: &self.plan,
            state: &mut self.state,
        };
        run_rules(self.engine, &self.document.outcome_rules, &mut ctx)?;
        Ok(())
    }

    fn preconditions_pass(&self, preconditions: &[Expression]) -> Result<bool> {
        for precondition in preconditions {
            if !self.evaluate_condition(precondition)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn first_taken_branch(&self, rules: &[BranchRule]) -> Result<Option<BranchTarget>> {
        for rule in rules {
            if self.evaluate_condition(&rule.expression)? {
                return Ok(Some(rule.target.clone()));
            }
        }
        Ok(None)
    }

    fn evaluate_condition(&self, expression: &Expression) -> Result<bool> {
        let env = TestVariableLookup {
            plan: &self.plan,
            state: &self.state,
        };
        Ok(self.engine.evaluate(expression, &env)?.as_bool())
    }

    //-------------------------------------------------------------------
    // Internals: bookkeeping helpers

    fn ensure_test_open(&self, operation: &'static str) -> Result<()> {
        if !self.state.control.is_entered() {
            return Err(DeliveryError::state(operation, "test has not been entered"));
        }
        if self.state.control.is_ended() {
            return Err(DeliveryError::state(operation, "test has already ended"));
        }
        Ok(())
    }

    /// Touches the duration accumulators of every open node on the current
    /// path: the test, the current part, the current item and its sections.
    fn touch_open_durations(&mut self, timestamp: Timestamp) {
        self.state.control.touch_duration(timestamp);
        if let Some(key) = self.state.current_test_part_key.clone() {
            if let Some(part_state) = self.state.test_part_states.get_mut(&key) {
                part_state.touch_duration(timestamp);
            }
        }
        if let Some(key) = self.state.current_item_key.clone() {
            if let Some(item_index) = self.plan.index_of(&key) {
                for ancestor in self.plan.ancestors_of(item_index) {
                    if self.plan.node(ancestor).kind == TestPlanNodeKind::AssessmentSection {
                        let ancestor_key = self.plan.node(ancestor).key.clone();
                        if let Some(section_state) =
                            self.state.section_states.get_mut(&ancestor_key)
                        {
                            section_state.touch_duration(timestamp);
                        }
                    }
                }
            }
            if let Some(item_state) = self.state.item_states.get_mut(&key) {
                item_state.control.touch_duration(timestamp);
            }
        }
    }

    /// Arena range of test-part nodes still ahead of the current one.
    fn part_scan_range(&self) -> Result<Vec<usize>> {
        let tops = self.plan.test_part_indexes();
        match &self.state.current_test_part_key {
            None => Ok(tops),
            Some(key) => {
                let current = self
                    .plan
                    .index_of(key)
                    .ok_or_else(|| DeliveryError::UnknownNode(key.clone()))?;
                Ok(tops.into_iter().filter(|&i| i > current).collect())
            }
        }
    }

    fn current_part_index(&self) -> Result<Option<usize>> {
        match &self.state.current_test_part_key {
            None => Ok(None),
            Some(key) => self
                .plan
                .index_of(key)
                .map(Some)
                .ok_or_else(|| DeliveryError::UnknownNode(key.clone())),
        }
    }

    fn current_item_index(&self) -> Result<Option<usize>> {
        match &self.state.current_item_key {
            None => Ok(None),
            Some(key) => self
                .plan
                .index_of(key)
                .map(Some)
                .ok_or_else(|| DeliveryError::UnknownNode(key.clone())),
        }
    }

    fn child_position(&self, parent: usize, child: usize) -> usize {
        self.plan
            .children_of(parent)
            .iter()
            .position(|&i| i == child)
            .expect("child listed under its parent")
    }

    fn part_doc(&self, part_index: usize) -> Result<&'a TestPart> {
        let key = &self.plan.node(part_index).key;
        self.part_lookup
            .get(key.identifier())
            .copied()
            .ok_or_else(|| DeliveryError::UnknownNode(key.clone()))
    }

    fn section_doc(&self, section_index: usize) -> Result<&'a AssessmentSection> {
        let key = &self.plan.node(section_index).key;
        self.section_lookup
            .get(key.identifier())
            .copied()
            .ok_or_else(|| DeliveryError::UnknownNode(key.clone()))
    }

    fn item_ref_doc(&self, item_index: usize) -> Result<&'a ItemRef> {
        let key = &self.plan.node(item_index).key;
        self.item_ref_lookup
            .get(key.identifier())
            .copied()
            .ok_or_else(|| DeliveryError::UnknownNode(key.clone()))
    }

    /// Lifecycle record of a non-item plan node; items report their embedded
    /// control record.
    fn control_state(&self, index: usize) -> Result<&ControlSessionState> {
        let node = self.plan.node(index);
        let missing = || DeliveryError::UnknownNode(node.key.clone());
        match node.kind {
            TestPlanNodeKind::TestPart => self
                .state
                .test_part_states
                .get(&node.key)
                .ok_or_else(missing),
            TestPlanNodeKind::AssessmentSection => self
                .state
                .section_states
                .get(&node.key)
                .ok_or_else(missing),
            TestPlanNodeKind::AssessmentItemRef => self
                .state
                .item_states
                .get(&node.key)
                .map(|s| &s.control)
                .ok_or_else(missing),
        }
    }

    fn control_state_mut(&mut self, index: usize) -> &mut ControlSessionState {
        let node = self.plan.node(index);
        let key = node.key.clone();
        match node.kind {
            TestPlanNodeKind::TestPart => self.state.test_part_states.entry(key).or_default(),
            TestPlanNodeKind::AssessmentSection => {
                self.state.section_states.entry(key).or_default()
            }
            TestPlanNodeKind::AssessmentItemRef => {
                &mut self.state.item_states.entry(key).or_default().control
            }
        }
    }
}

/// Traversal cursor: where to pick up the plan walk.
enum Cursor {
    /// Start with the first child of this container.
    ChildrenOf(usize),
    /// Start just after this node, in plan order.
    After(usize),
}

fn index_section<'a>(
    section: &'a AssessmentSection,
    sections: &mut HashMap<Identifier, &'a AssessmentSection>,
    item_refs: &mut HashMap<Identifier, &'a ItemRef>,
) {
    sections.insert(section.identifier.clone(), section);
    for part in &section.parts {
        match part {
            SectionPart::Section(nested) => index_section(nested, sections, item_refs),
            SectionPart::ItemRef(item_ref) => {
                item_refs.insert(item_ref.identifier.clone(), item_ref);
            }
        }
    }
}

/// Read-only variable environment at test level.
///
/// Unqualified references resolve against test outcomes; item-qualified
/// references resolve against the first plan instance of the named item.
struct TestVariableLookup<'x> {
    plan: &'x TestPlan,
    state: &'x TestSessionState,
}

impl TestVariableLookup<'_> {
    fn item_variable(&self, item: &Identifier, identifier: &Identifier) -> Option<Value> {
        self.plan
            .nodes()
            .find(|node| {
                node.kind == TestPlanNodeKind::AssessmentItemRef && node.key.identifier() == item
            })
            .and_then(|node| self.state.item_states.get(&node.key))
            .and_then(|item_state| item_state.variable_value(identifier))
    }
}

impl VariableLookup for TestVariableLookup<'_> {
    fn lookup(&self, reference: &VariableRef) -> Option<Value> {
        match &reference.item {
            Some(item) => self.item_variable(item, &reference.identifier),
            None => self.state.outcome_values.get(&reference.identifier).cloned(),
        }
    }

    fn correct_value(&self, _identifier: &Identifier) -> Option<Value> {
        None
    }
}

/// Writable rule environment for test-level outcome processing.
struct TestRuleContext<'x> {
    document: &'x TestDocument,
    plan: &'x TestPlan,
    state: &'x mut TestSessionState,
}

impl VariableLookup for TestRuleContext<'_> {
    fn lookup(&self, reference: &VariableRef) -> Option<Value> {
        let lookup = TestVariableLookup {
            plan: self.plan,
            state: &*self.state,
        };
        lookup.lookup(reference)
    }

    fn correct_value(&self, _identifier: &Identifier) -> Option<Value> {
        None
    }
}

impl RuleContext for TestRuleContext<'_> {
    fn set_variable(&mut self, identifier: &Identifier, value: Value) -> Result<()> {
        if self.document.outcome_declaration(identifier).is_none() {
            return Err(DeliveryError::UnknownVariable(identifier.clone()));
        }
        self.state.outcome_values.insert(identifier.clone(), value);
        Ok(())
    }
}
