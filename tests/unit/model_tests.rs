use serde_json::json;

use blockdefer::models::block::{
    Block, BlockCode, BlockFailure, BlockParams, BlockStatus, BlockType,
};

fn block() -> Block {
    Block::new(
        "tok".into(),
        "ses".into(),
        BlockCode::closure("noop"),
        BlockParams::default(),
    )
}

#[test]
fn new_block_is_prep_with_default_policy() {
    let b = block();
    assert_eq!(b.status, BlockStatus::Prep);
    assert_eq!(b.block_type(), BlockType::Closure);
    assert!(!b.blocker);
    assert!(!b.replayable);
    assert_eq!(b.replay_count, 0);
    assert_eq!(b.next_run, 0);
}

#[test]
fn only_due_standby_blocks_may_run() {
    let mut b = block();
    b.next_run = 100;
    assert!(!b.is_due(200), "prep blocks are never due");

    b.status = BlockStatus::Standby;
    assert!(!b.is_due(99));
    assert!(b.is_due(100));
}

#[test]
fn replay_bumps_counter_and_pushes_next_run() {
    let mut b = block();
    b.status = BlockStatus::Running;
    b.replay(1_000, 30);
    assert_eq!(b.replay_count, 1);
    assert_eq!(b.status, BlockStatus::Standby);
    assert_eq!(b.next_run, 1_030);
}

#[test]
fn terminal_statuses() {
    assert!(BlockStatus::Success.is_terminal());
    assert!(BlockStatus::Blocker.is_terminal());
    assert!(!BlockStatus::Standby.is_terminal());
    assert!(!BlockStatus::Running.is_terminal());
}

#[test]
fn code_variants_serialize_with_a_type_tag() {
    let code = BlockCode::Invokable {
        type_name: "Mailer".into(),
        state: json!({ "to": "ops" }),
    };
    let encoded = serde_json::to_value(&code).unwrap();
    assert_eq!(
        encoded,
        json!({ "type": "invokable", "type_name": "Mailer", "state": { "to": "ops" } })
    );
    assert_eq!(code.handler_name(), "Mailer");
    assert_eq!(BlockCode::class("Report").block_type(), BlockType::ClassName);
}

#[test]
fn failure_display_joins_class_and_message() {
    let failure = BlockFailure::new("io", "disk full")
        .with_code(28)
        .with_trace("write_all");
    assert_eq!(failure.to_string(), "io: disk full");
    assert_eq!(failure.code, 28);
    assert_eq!(failure.trace.as_deref(), Some("write_all"));
}
