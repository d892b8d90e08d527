//! Session controller for a single item.
//!
//! Drives one item attempt through its lifecycle: template processing,
//! entry, response binding and commit, response processing, suspend/resume,
//! end, exit and reset. Every operation validates the current phase before
//! mutating anything; a rejected call leaves the state exactly as it was.

use crate::document::ItemDocument;
use crate::error::{DeliveryError, Result};
use crate::expression::{run_rules, ProcessingEngine, RuleContext, RuleOutcome, VariableLookup, VariableRef};
use crate::session_state::ItemSessionState;
use crate::settings::ItemSessionControllerSettings;
use crate::types::{CompletionStatus, Identifier, ResponseData, Timestamp, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Controller driving one item session.
///
/// Borrows the item document read-only and holds the session state
/// exclusively for the duration of the borrow. Not thread safe; the hosting
/// application serializes calls per candidate session.
pub struct ItemSessionController<'a> {
    item: &'a ItemDocument,
    engine: &'a dyn ProcessingEngine,
    settings: ItemSessionControllerSettings,
    state: &'a mut ItemSessionState,
}

impl<'a> ItemSessionController<'a> {
    /// Creates a controller over an item document and its session state.
    pub fn new(
        item: &'a ItemDocument,
        engine: &'a dyn ProcessingEngine,
        settings: ItemSessionControllerSettings,
        state: &'a mut ItemSessionState,
    ) -> Self {
        Self {
            item,
            engine,
            settings,
            state,
        }
    }

    /// The item document this controller runs.
    pub fn item(&self) -> &ItemDocument {
        self.item
    }

    /// Read access to the session state.
    pub fn state(&self) -> &ItemSessionState {
        self.state
    }

    //-------------------------------------------------------------------
    // Template processing & entry

    /// Runs template processing. Must happen before entry.
    pub fn perform_template_processing(&mut self, timestamp: Timestamp) -> Result<()> {
        if self.state.control.is_entered() {
            return Err(DeliveryError::state(
                "template processing",
                "item has already been entered",
            ));
        }
        self.state.control.touch_duration(timestamp);
        self.run_template_processing()
    }

    /// Enters the item: opens the session and initializes variables.
    pub fn enter_item(&mut self, timestamp: Timestamp) -> Result<()> {
        if self.state.control.is_entered() {
            return Err(DeliveryError::state("enter item", "item already entered"));
        }
        if self.state.control.is_ended() {
            return Err(DeliveryError::state("enter item", "item already ended"));
        }
        debug!(item = %self.item.identifier, "entering item");
        self.state.control.mark_entered(timestamp);
        if !self.state.template_processed {
            self.initialize_template_defaults();
        }
        self.initialize_response_and_outcome_values();
        self.state.completion_status = CompletionStatus::NotAttempted;
        Ok(())
    }

    /// Folds elapsed time into the duration accumulator.
    ///
    /// No-op once the session has ended or while no interval is open
    /// (i.e. while suspended).
    pub fn touch_duration(&mut self, timestamp: Timestamp) {
        self.state.control.touch_duration(timestamp);
    }

    //-------------------------------------------------------------------
    // Responses

    /// Binds raw response data against the item's interactions.
    ///
    /// Identifiers that fail to bind land in the unbound set; bound values
    /// that fail interaction validation land in the invalid set. Returns
    /// true iff both sets ended up empty. Unknown identifiers are an
    /// invalid-argument error and leave the state untouched.
    pub fn bind_responses(
        &mut self,
        timestamp: Timestamp,
        responses: &BTreeMap<Identifier, ResponseData>,
    ) -> Result<bool> {
        self.ensure_interacting("bind responses")?;
        for identifier in responses.keys() {
            if self.item.response_declaration(identifier).is_none()
                || self.item.interaction_for(identifier).is_none()
            {
                return Err(DeliveryError::UnknownResponseIdentifier(identifier.clone()));
            }
        }
        self.state.control.touch_duration(timestamp);

        self.state.unbound_response_identifiers.clear();
        self.state.invalid_response_identifiers.clear();
        for (identifier, raw) in responses {
            self.state
                .raw_response_data
                .insert(identifier.clone(), raw.clone());
            let declaration = self.item.response_declaration(identifier).unwrap();
            let interaction = self.item.interaction_for(identifier).unwrap();
            match interaction.bind(declaration, raw) {
                Ok(value) => {
                    if !interaction.validate(&value) {
                        self.state
                            .invalid_response_identifiers
                            .insert(identifier.clone());
                    }
                    self.state
                        .uncommitted_response_values
                        .insert(identifier.clone(), value);
                }
                Err(failure) => {
                    debug!(response = %identifier, ?failure, "response could not be bound");
                    self.state.uncommitted_response_values.remove(identifier);
                    self.state
                        .unbound_response_identifiers
                        .insert(identifier.clone());
                }
            }
        }
        self.state.responded = true;
        Ok(self.state.unbound_response_identifiers.is_empty()
            && self.state.invalid_response_identifiers.is_empty())
    }

    /// Commits bound responses, making them the authoritative values.
    pub fn commit_responses(&mut self, timestamp: Timestamp) -> Result<()> {
        self.ensure_interacting("commit responses")?;
        if self.state.uncommitted_response_values.is_empty() {
            return Err(DeliveryError::state(
                "commit responses",
                "no responses have been bound this attempt",
            ));
        }
        self.state.control.touch_duration(timestamp);
        let committed = std::mem::take(&mut self.state.uncommitted_response_values);
        self.state.response_values.extend(committed);
        self.state.completion_status = CompletionStatus::PendingProcessing;
        self.state.num_attempts += 1;
        Ok(())
    }

    /// Runs response processing over the committed variable state.
    ///
    /// Legal on an ended session (deferred processing at test-part end) and
    /// legal without a prior bind in the same attempt.
    pub fn perform_response_processing(&mut self, timestamp: Timestamp) -> Result<()> {
        if !self.state.control.is_entered() {
            return Err(DeliveryError::state(
                "response processing",
                "item has not been entered",
            ));
        }
        if self.state.is_suspended() {
            return Err(DeliveryError::state(
                "response processing",
                "item session is suspended",
            ));
        }
        debug!(item = %self.item.identifier, "response processing starting");
        self.state.control.touch_duration(timestamp);
        if !self.item.adaptive {
            for declaration in &self.item.outcome_declarations {
                self.state
                    .outcome_values
                    .insert(declaration.identifier.clone(), declaration.initial_value());
            }
        }
        let mut ctx = ItemRuleContext {
            item: self.item,
            state: self.state,
        };
        run_rules(self.engine, &self.item.response_rules, &mut ctx)?;
        self.state.completion_status = CompletionStatus::Completed;
        Ok(())
    }

    //-------------------------------------------------------------------
    // Suspend / resume

    /// Suspends the session, closing the duration interval.
    pub fn suspend_item_session(&mut self, timestamp: Timestamp) -> Result<()> {
        self.ensure_open("suspend item session")?;
        if self.state.is_suspended() {
            return Err(DeliveryError::state(
                "suspend item session",
                "item session is already suspended",
            ));
        }
        self.state.control.close_duration_interval(timestamp);
        self.state.suspend_time = Some(timestamp);
        Ok(())
    }

    /// Resumes a suspended session, reopening the duration interval.
    pub fn unsuspend_item_session(&mut self, timestamp: Timestamp) -> Result<()> {
        self.ensure_open("unsuspend item session")?;
        if !self.state.is_suspended() {
            return Err(DeliveryError::state(
                "unsuspend item session",
                "item session is not suspended",
            ));
        }
        self.state.suspend_time = None;
        self.state.control.duration_interval_start = Some(timestamp);
        Ok(())
    }

    //-------------------------------------------------------------------
    // End / exit

    /// Ends the session, closing the duration interval.
    pub fn end_item(&mut self, timestamp: Timestamp) -> Result<()> {
        if self.state.control.is_ended() {
            return Err(DeliveryError::state("end item", "item already ended"));
        }
        self.state.suspend_time = None;
        self.state.control.mark_ended(timestamp);
        Ok(())
    }

    /// Exits the session. Requires it to have ended.
    pub fn exit_item(&mut self, timestamp: Timestamp) -> Result<()> {
        if !self.state.control.is_ended() {
            return Err(DeliveryError::state("exit item", "item has not ended"));
        }
        if self.state.control.is_exited() {
            return Err(DeliveryError::state("exit item", "item already exited"));
        }
        self.state.control.mark_exited(timestamp);
        Ok(())
    }

    //-------------------------------------------------------------------
    // Reset

    /// Resets the session to post-entry defaults, rerunning template
    /// processing and zeroing the attempt counter.
    pub fn reset_item_session_hard(
        &mut self,
        timestamp: Timestamp,
        keep_duration: bool,
    ) -> Result<()> {
        self.ensure_interacting("hard reset")?;
        self.reset_attempt_state(timestamp, keep_duration);
        self.state.num_attempts = 0;
        self.state.template_processed = false;
        self.run_template_processing()?;
        self.initialize_response_and_outcome_values();
        Ok(())
    }

    /// Resets response/outcome state to post-entry defaults, keeping the
    /// template values and attempt counter.
    pub fn reset_item_session_soft(
        &mut self,
        timestamp: Timestamp,
        keep_duration: bool,
    ) -> Result<()> {
        self.ensure_interacting("soft reset")?;
        self.reset_attempt_state(timestamp, keep_duration);
        self.initialize_response_and_outcome_values();
        Ok(())
    }

    //-------------------------------------------------------------------
    // Extras

    /// Records a candidate comment. Legal while the session is open.
    pub fn set_candidate_comment(
        &mut self,
        timestamp: Timestamp,
        comment: Option<String>,
    ) -> Result<()> {
        self.ensure_open("set candidate comment")?;
        self.state.control.touch_duration(timestamp);
        self.state.candidate_comment = comment;
        Ok(())
    }

    /// Whether a further attempt is allowed.
    ///
    /// Adaptive items stop when completed; non-adaptive items respect the
    /// configured attempt limit, 0 meaning unlimited.
    pub fn is_attempt_allowed(&self) -> bool {
        if self.item.adaptive {
            self.state.completion_status != CompletionStatus::Completed
        } else {
            let max = self.settings.max_attempts;
            max == 0 || self.state.num_attempts < max
        }
    }

    //-------------------------------------------------------------------

    /// Sets response and outcome variables to their declared defaults
    /// without entering the session. Used by the test controller, which
    /// initializes every item of a part up front.
    pub(crate) fn initialize_variables(&mut self) {
        self.initialize_response_and_outcome_values();
    }

    fn ensure_open(&self, operation: &'static str) -> Result<()> {
        if !self.state.control.is_entered() {
            return Err(DeliveryError::state(operation, "item has not been entered"));
        }
        if self.state.control.is_ended() {
            return Err(DeliveryError::state(operation, "item has already ended"));
        }
        Ok(())
    }

    fn ensure_interacting(&self, operation: &'static str) -> Result<()> {
        self.ensure_open(operation)?;
        if self.state.is_suspended() {
            return Err(DeliveryError::state(operation, "item session is suspended"));
        }
        Ok(())
    }

    fn reset_attempt_state(&mut self, timestamp: Timestamp, keep_duration: bool) {
        self.state.control.touch_duration(timestamp);
        self.state.uncommitted_response_values.clear();
        self.state.raw_response_data.clear();
        self.state.unbound_response_identifiers.clear();
        self.state.invalid_response_identifiers.clear();
        self.state.responded = false;
        self.state.candidate_comment = None;
        self.state.completion_status = CompletionStatus::NotAttempted;
        if !keep_duration {
            self.state.control.duration_accumulated = 0;
        }
        self.state.control.duration_interval_start = Some(timestamp);
    }

    fn initialize_template_defaults(&mut self) {
        for declaration in &self.item.template_declarations {
            self.state
                .template_values
                .insert(declaration.identifier.clone(), declaration.initial_value());
        }
    }

    fn initialize_response_and_outcome_values(&mut self) {
        for declaration in &self.item.response_declarations {
            self.state
                .response_values
                .insert(declaration.identifier.clone(), declaration.initial_value());
        }
        for declaration in &self.item.outcome_declarations {
            self.state
                .outcome_values
                .insert(declaration.identifier.clone(), declaration.initial_value());
        }
        self.state.uncommitted_response_values.clear();
        self.state.raw_response_data.clear();
        self.state.unbound_response_identifiers.clear();
        self.state.invalid_response_identifiers.clear();
        self.state.responded = false;
    }

    /// Runs template rules until they complete, bounded by the configured
    /// retry limit. A run interrupted by a failed template constraint starts
    /// over with fresh defaults.
    fn run_template_processing(&mut self) -> Result<()> {
        let limit = self.settings.template_processing_limit.max(1);
        for attempt in 1..=limit {
            self.initialize_template_defaults();
            let mut ctx = ItemRuleContext {
                item: self.item,
                state: self.state,
            };
            match run_rules(self.engine, &self.item.template_rules, &mut ctx)? {
                RuleOutcome::Completed => {
                    if attempt > 1 {
                        debug!(item = %self.item.identifier, attempt, "template processing settled");
                    }
                    self.state.template_processed = true;
                    return Ok(());
                }
                RuleOutcome::ConstraintFailed => continue,
            }
        }
        warn!(
            item = %self.item.identifier,
            limit, "template processing retry limit reached, keeping default values"
        );
        self.initialize_template_defaults();
        self.state.template_processed = true;
        Ok(())
    }
}

/// Rule environment over a single item's variable state.
pub(crate) struct ItemRuleContext<'a> {
    pub(crate) item: &'a ItemDocument,
    pub(crate) state: &'a mut ItemSessionState,
}

impl VariableLookup for ItemRuleContext<'_> {
    fn lookup(&self, reference: &VariableRef) -> Option<Value> {
        if reference.item.is_some() {
            // Item-qualified references only make sense at test level.
            return None;
        }
        self.state.variable_value(&reference.identifier)
    }

    fn correct_value(&self, identifier: &Identifier) -> Option<Value> {
        self.item
            .response_declaration(identifier)
            .and_then(|d| d.correct_value.clone())
    }
}

impl RuleContext for ItemRuleContext<'_> {
    fn set_variable(&mut self, identifier: &Identifier, value: Value) -> Result<()> {
        if self
            .item
            .template_declarations
            .iter()
            .any(|d| &d.identifier == identifier)
        {
            self.state.template_values.insert(identifier.clone(), value);
        } else if self
            .item
            .outcome_declarations
            .iter()
            .any(|d| &d.identifier == identifier)
        {
            self.state.outcome_values.insert(identifier.clone(), value);
        } else if self
            .item
            .response_declarations
            .iter()
            .any(|d| &d.identifier == identifier)
        {
            self.state.response_values.insert(identifier.clone(), value);
        } else {
            return Err(DeliveryError::UnknownVariable(identifier.clone()));
        }
        Ok(())
    }
}
