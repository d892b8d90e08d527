//! Linear navigation with simultaneous submission: all response processing
//! is deferred to the end of the part.

use crate::harness::assertions as check;
use crate::harness::fixtures as fx;
use crate::harness::{respond, ts};
use proctor_core::{
    Evaluator, NavigationMode, SubmissionMode, TestSessionController,
    TestSessionControllerSettings,
};

fn session(document: &proctor_core::TestDocument) -> TestSessionController<'_> {
    TestSessionController::new(document, &Evaluator, TestSessionControllerSettings::default())
}

#[test]
fn test_responding_does_not_process() {
    let document = fx::two_item_test(NavigationMode::Linear, SubmissionMode::Simultaneous);
    let mut session = session(&document);
    session.enter_test(ts(0)).unwrap();
    session.enter_next_available_test_part(ts(2_000)).unwrap();

    let bound = session
        .handle_responses_to_current_item(ts(6_000), &respond("ChoiceA"))
        .unwrap();
    assert!(bound);

    // Bind and commit happened, but no processing anywhere.
    let item1 = check::item_state(&session, "i1");
    assert_eq!(item1.num_attempts, 1);
    check::assert_rp_done(item1, false);
    check::assert_item_score(item1, 0.0);
    check::assert_rp_done(check::item_state(&session, "i2"), false);
    check::assert_test_score(session.test_session_state(), 0.0);
    check::assert_snapshot_roundtrip(&session);
}

#[test]
fn test_respond_then_end_part_processes_entered_items_only() {
    let document = fx::two_item_test(NavigationMode::Linear, SubmissionMode::Simultaneous);
    let mut session = session(&document);
    session.enter_test(ts(0)).unwrap();
    session.enter_next_available_test_part(ts(2_000)).unwrap();
    session
        .handle_responses_to_current_item(ts(6_000), &respond("ChoiceA"))
        .unwrap();

    session.end_current_test_part(ts(14_000)).unwrap();

    let item1 = check::item_state(&session, "i1");
    check::assert_rp_done(item1, true);
    check::assert_item_score(item1, 1.0);
    // Item 2 was never entered, so it is closed out without processing.
    let item2 = check::item_state(&session, "i2");
    check::assert_ended_but_not_entered(&item2.control, ts(14_000));
    check::assert_rp_done(item2, false);
    check::assert_item_score(item2, 0.0);

    check::assert_test_score(session.test_session_state(), 1.0);
    check::assert_now_ended(check::part_state(&session, "p"), ts(14_000));
    check::assert_snapshot_roundtrip(&session);
}

#[test]
fn test_skip_item1_then_answer_item2() {
    let document = fx::two_item_test(NavigationMode::Linear, SubmissionMode::Simultaneous);
    let mut session = session(&document);
    session.enter_test(ts(0)).unwrap();
    session.enter_next_available_test_part(ts(2_000)).unwrap();

    // Advancing under simultaneous submission suspends, not ends: the
    // session must stay reopenable until the part ends.
    let next = session
        .advance_item_linear(ts(6_000))
        .unwrap()
        .map(|node| node.key.clone());
    assert_eq!(next, Some(fx::node_key(&session, "i2")));
    check::assert_suspended(check::item_state(&session, "i1"), ts(6_000));
    check::assert_open(&check::item_state(&session, "i2").control, ts(6_000));

    session
        .handle_responses_to_current_item(ts(14_000), &respond("ChoiceA"))
        .unwrap();

    // Advancing past the last item ends the part and triggers processing
    // for both entered items.
    assert!(session.advance_item_linear(ts(30_000)).unwrap().is_none());
    check::assert_now_ended(&check::item_state(&session, "i1").control, ts(30_000));
    check::assert_now_ended(&check::item_state(&session, "i2").control, ts(30_000));
    check::assert_now_ended(check::part_state(&session, "p"), ts(30_000));

    let item1 = check::item_state(&session, "i1");
    let item2 = check::item_state(&session, "i2");
    check::assert_rp_done(item1, true);
    check::assert_rp_done(item2, true);
    check::assert_item_score(item1, 0.0);
    check::assert_item_score(item2, 1.0);
    check::assert_test_score(session.test_session_state(), 1.0);
    check::assert_snapshot_roundtrip(&session);
}

#[test]
fn test_skip_item1_then_end_part() {
    let document = fx::two_item_test(NavigationMode::Linear, SubmissionMode::Simultaneous);
    let mut session = session(&document);
    session.enter_test(ts(0)).unwrap();
    session.enter_next_available_test_part(ts(2_000)).unwrap();

    session.advance_item_linear(ts(6_000)).unwrap();
    check::assert_suspended(check::item_state(&session, "i1"), ts(6_000));

    session.end_current_test_part(ts(14_000)).unwrap();
    check::assert_now_ended(&check::item_state(&session, "i1").control, ts(14_000));
    check::assert_now_ended(&check::item_state(&session, "i2").control, ts(14_000));
    check::assert_now_ended(check::part_state(&session, "p"), ts(14_000));

    // Both items were entered, so both get processed, unanswered or not.
    check::assert_rp_done(check::item_state(&session, "i1"), true);
    check::assert_rp_done(check::item_state(&session, "i2"), true);
    check::assert_item_score(check::item_state(&session, "i1"), 0.0);
    check::assert_item_score(check::item_state(&session, "i2"), 0.0);
    check::assert_test_score(session.test_session_state(), 0.0);
    check::assert_snapshot_roundtrip(&session);
}

#[test]
fn test_suspended_item_duration_is_frozen() {
    let document = fx::two_item_test(NavigationMode::Linear, SubmissionMode::Simultaneous);
    let mut session = session(&document);
    session.enter_test(ts(0)).unwrap();
    session.enter_next_available_test_part(ts(2_000)).unwrap();
    session.advance_item_linear(ts(6_000)).unwrap();

    // Item 1 was open from 2000 to its suspension at 6000.
    assert_eq!(
        check::item_state(&session, "i1").control.duration_accumulated,
        4_000
    );
    session.end_current_test_part(ts(30_000)).unwrap();
    // Ending adds nothing to a suspended item's duration.
    assert_eq!(
        check::item_state(&session, "i1").control.duration_accumulated,
        4_000
    );
    // Item 2 ran from 6000 until the part end.
    assert_eq!(
        check::item_state(&session, "i2").control.duration_accumulated,
        24_000
    );
}
