//! Branch-rule navigation: jumps, special exit targets, and the flagging of
//! the nodes a jump passes over.

use crate::harness::assertions as check;
use crate::harness::fixtures as fx;
use crate::harness::{respond, ts};
use proctor_core::{
    BranchTarget, Evaluator, Expression, Identifier, NavigationMode, SubmissionMode,
    TestDocument, TestSessionController, TestSessionControllerSettings, Value, VariableRef,
};

fn session(document: &TestDocument) -> TestSessionController<'_> {
    TestSessionController::new(document, &Evaluator, TestSessionControllerSettings::default())
}

/// i1 carries one branch rule; i2 and i3 follow it in the same section.
fn item_jump_document(target: BranchTarget, condition: Expression) -> TestDocument {
    fx::test_document(
        "branching",
        vec![fx::test_part(
            "p",
            NavigationMode::Linear,
            SubmissionMode::Individual,
            vec![fx::section(
                "s",
                vec![
                    fx::item_ref_with(
                        "i1",
                        vec![],
                        vec![proctor_core::BranchRule {
                            expression: condition,
                            target,
                        }],
                    ),
                    fx::item_ref("i2"),
                    fx::item_ref("i3"),
                ],
            )],
        )],
    )
}

#[test]
fn test_branch_jumps_over_intervening_item() {
    let document = item_jump_document(
        BranchTarget::Node(fx::id("i3")),
        Expression::boolean(true),
    );
    let mut session = session(&document);
    session.enter_test(ts(0)).unwrap();
    session.enter_next_available_test_part(ts(2_000)).unwrap();

    let next = session
        .advance_item_linear(ts(6_000))
        .unwrap()
        .map(|node| node.key.clone());
    assert_eq!(next, Some(fx::node_key(&session, "i3")));

    check::assert_now_ended(&check::item_state(&session, "i1").control, ts(6_000));
    check::assert_jumped_not_exited(&check::item_state(&session, "i2").control);
    check::assert_open(&check::item_state(&session, "i3").control, ts(6_000));
    check::assert_snapshot_roundtrip(&session);
}

#[test]
fn test_jumped_items_are_exited_with_the_part_never_entered() {
    let document = item_jump_document(
        BranchTarget::Node(fx::id("i3")),
        Expression::boolean(true),
    );
    let mut session = session(&document);
    session.enter_test(ts(0)).unwrap();
    session.enter_next_available_test_part(ts(2_000)).unwrap();
    session.advance_item_linear(ts(6_000)).unwrap();

    // Exhaust the part: the jumped node keeps its flag, un-ended.
    assert!(session.advance_item_linear(ts(14_000)).unwrap().is_none());
    check::assert_jumped_not_exited(&check::item_state(&session, "i2").control);

    // Ending the test exits the part subtree; the jumped node gains only an
    // exit time.
    assert!(session
        .enter_next_available_test_part(ts(30_000))
        .unwrap()
        .is_none());
    check::assert_jumped_exited(&check::item_state(&session, "i2").control, ts(30_000));
    check::assert_now_exited(&check::item_state(&session, "i1").control, ts(30_000));
    check::assert_now_exited(&check::item_state(&session, "i3").control, ts(30_000));
    check::assert_snapshot_roundtrip(&session);
}

#[test]
fn test_branch_condition_consults_item_variables() {
    // Jump over i2 only when i1 was answered with ChoiceB.
    let condition = Expression::Match(
        Box::new(Expression::Variable(VariableRef::in_item(
            fx::id("i1"),
            fx::id("RESPONSE"),
        ))),
        Box::new(Expression::Constant(Value::Identifier(
            Identifier::new("ChoiceB").unwrap(),
        ))),
    );

    // Taken: ChoiceB skips i2.
    let document = item_jump_document(BranchTarget::Node(fx::id("i3")), condition.clone());
    let mut taken = session(&document);
    taken.enter_test(ts(0)).unwrap();
    taken.enter_next_available_test_part(ts(2_000)).unwrap();
    taken
        .handle_responses_to_current_item(ts(6_000), &respond("ChoiceB"))
        .unwrap();
    let next = taken
        .advance_item_linear(ts(14_000))
        .unwrap()
        .map(|node| node.key.clone());
    assert_eq!(next, Some(fx::node_key(&taken, "i3")));
    check::assert_jumped_not_exited(&check::item_state(&taken, "i2").control);

    // Not taken: ChoiceA advances normally.
    let document = item_jump_document(BranchTarget::Node(fx::id("i3")), condition);
    let mut skipped = session(&document);
    skipped.enter_test(ts(0)).unwrap();
    skipped.enter_next_available_test_part(ts(2_000)).unwrap();
    skipped
        .handle_responses_to_current_item(ts(6_000), &respond("ChoiceA"))
        .unwrap();
    let next = skipped
        .advance_item_linear(ts(14_000))
        .unwrap()
        .map(|node| node.key.clone());
    assert_eq!(next, Some(fx::node_key(&skipped, "i2")));
    check::assert_open(&check::item_state(&skipped, "i2").control, ts(14_000));
}

#[test]
fn test_branch_to_later_section() {
    let document = fx::test_document(
        "section-branch",
        vec![fx::test_part(
            "p",
            NavigationMode::Linear,
            SubmissionMode::Individual,
            vec![
                fx::section(
                    "s1",
                    vec![fx::item_ref_with(
                        "i1",
                        vec![],
                        vec![fx::branch_always(BranchTarget::Node(fx::id("s3")))],
                    )],
                ),
                fx::section("s2", vec![fx::item_ref("i2")]),
                fx::section("s3", vec![fx::item_ref("i3")]),
            ],
        )],
    );
    let mut session = session(&document);
    session.enter_test(ts(0)).unwrap();
    session.enter_next_available_test_part(ts(2_000)).unwrap();

    let next = session
        .advance_item_linear(ts(6_000))
        .unwrap()
        .map(|node| node.key.clone());
    assert_eq!(next, Some(fx::node_key(&session, "i3")));

    check::assert_now_ended(check::section_state(&session, "s1"), ts(6_000));
    check::assert_jumped_not_exited(check::section_state(&session, "s2"));
    check::assert_jumped_not_exited(&check::item_state(&session, "i2").control);
    check::assert_open(check::section_state(&session, "s3"), ts(6_000));
    check::assert_open(&check::item_state(&session, "i3").control, ts(6_000));
    check::assert_snapshot_roundtrip(&session);
}

#[test]
fn test_branch_exit_testpart() {
    let document = item_jump_document(BranchTarget::ExitTestPart, Expression::boolean(true));
    let mut session = session(&document);
    session.enter_test(ts(0)).unwrap();
    session.enter_next_available_test_part(ts(2_000)).unwrap();

    assert!(session.advance_item_linear(ts(6_000)).unwrap().is_none());
    check::assert_now_ended(check::part_state(&session, "p"), ts(6_000));
    check::assert_now_ended(&check::item_state(&session, "i1").control, ts(6_000));
    // Items behind an exit branch are closed out, not flagged as jumped.
    check::assert_ended_but_not_entered(&check::item_state(&session, "i2").control, ts(6_000));
    check::assert_ended_but_not_entered(&check::item_state(&session, "i3").control, ts(6_000));
    check::assert_snapshot_roundtrip(&session);
}

#[test]
fn test_branch_exit_test_from_deep_inside() {
    let document = fx::test_document(
        "deep-exit",
        vec![
            fx::test_part(
                "p1",
                NavigationMode::Linear,
                SubmissionMode::Individual,
                vec![fx::section(
                    "s1",
                    vec![fx::item_ref_with(
                        "i1",
                        vec![],
                        vec![fx::branch_always(BranchTarget::ExitTest)],
                    )],
                )],
            ),
            fx::test_part(
                "p2",
                NavigationMode::Linear,
                SubmissionMode::Individual,
                vec![fx::section("s2", vec![fx::item_ref("i2")])],
            ),
        ],
    );
    let mut session = session(&document);
    session.enter_test(ts(0)).unwrap();
    session.enter_next_available_test_part(ts(2_000)).unwrap();

    assert!(session.advance_item_linear(ts(6_000)).unwrap().is_none());

    // The whole current part is closed and exited; the test has ended.
    check::assert_now_exited(check::part_state(&session, "p1"), ts(6_000));
    check::assert_now_exited(&check::item_state(&session, "i1").control, ts(6_000));
    check::assert_now_ended(&session.test_session_state().control, ts(6_000));

    // The unreached part is left untouched.
    check::assert_not_yet_entered(check::part_state(&session, "p2"));
    check::assert_not_yet_entered(&check::item_state(&session, "i2").control);

    session.exit_test(ts(14_000)).unwrap();
    check::assert_now_exited(&session.test_session_state().control, ts(14_000));
    check::assert_snapshot_roundtrip(&session);
}

#[test]
fn test_branch_to_later_test_part() {
    let document = fx::test_document(
        "part-branch",
        vec![
            fx::test_part(
                "p1",
                NavigationMode::Linear,
                SubmissionMode::Individual,
                vec![fx::section(
                    "s1",
                    vec![fx::item_ref_with(
                        "i1",
                        vec![],
                        vec![fx::branch_always(BranchTarget::Node(fx::id("p3")))],
                    )],
                )],
            ),
            fx::test_part(
                "p2",
                NavigationMode::Linear,
                SubmissionMode::Individual,
                vec![fx::section("s2", vec![fx::item_ref("i2")])],
            ),
            fx::test_part(
                "p3",
                NavigationMode::Linear,
                SubmissionMode::Individual,
                vec![fx::section("s3", vec![fx::item_ref("i3")])],
            ),
        ],
    );
    let mut session = session(&document);
    session.enter_test(ts(0)).unwrap();
    session.enter_next_available_test_part(ts(2_000)).unwrap();

    // The branch ends part 1 and flags part 2 as jumped.
    assert!(session.advance_item_linear(ts(6_000)).unwrap().is_none());
    check::assert_now_ended(check::part_state(&session, "p1"), ts(6_000));
    check::assert_jumped_not_exited(check::part_state(&session, "p2"));

    // The next part entered is the branch target.
    let entered = session
        .enter_next_available_test_part(ts(14_000))
        .unwrap()
        .map(|node| node.key.clone());
    assert_eq!(entered, Some(fx::node_key(&session, "p3")));
    check::assert_now_exited(check::part_state(&session, "p1"), ts(14_000));
    check::assert_jumped_not_exited(check::part_state(&session, "p2"));
    check::assert_open(&check::item_state(&session, "i3").control, ts(14_000));
    check::assert_snapshot_roundtrip(&session);
}
