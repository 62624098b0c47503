// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests of the request pipeline over a scriptable adapter.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};

use common::{TestContext, skill_message, to_bytes};
use parley_core::message::{
    Envelope, FailureMode, Headers, ProtocolMessage, ValidationError, Validator, ValidatorChain,
};
use parley_core::metrics::Counter;
use parley_core::outgoing::{ANSWER_TO_USER, Command, ERROR};
use parley_core::pipeline::{Outcome, PipelineSettings, Rejection, ScenarioErrorReply};
use parley_core::scenario::{EchoScenario, Postprocessor, Scenario, ScenarioError};
use parley_core::user::User;
use parley_core::variables::VariableStore;

/// Answers every message with a fixed text.
struct FixedAnswer(&'static str);

#[async_trait]
impl Scenario for FixedAnswer {
    async fn run(&self, _message: &Envelope, _user: &mut User) -> Result<Vec<Command>, ScenarioError> {
        Ok(vec![Command::new(
            ANSWER_TO_USER,
            json!({"pronounceText": self.0}),
        )])
    }
}

/// Records what it saw and answers nothing.
#[derive(Default)]
struct Observer {
    runs: AtomicUsize,
    load_error: AtomicBool,
}

#[async_trait]
impl Scenario for Observer {
    async fn run(&self, _message: &Envelope, user: &mut User) -> Result<Vec<Command>, ScenarioError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.load_error.store(user.load_error(), Ordering::SeqCst);
        Ok(Vec::new())
    }
}

struct Failing;

#[async_trait]
impl Scenario for Failing {
    async fn run(&self, _message: &Envelope, _user: &mut User) -> Result<Vec<Command>, ScenarioError> {
        Err(ScenarioError::Failed("boom".into()))
    }
}

struct DoNotSave;

#[async_trait]
impl Scenario for DoNotSave {
    async fn run(&self, _message: &Envelope, user: &mut User) -> Result<Vec<Command>, ScenarioError> {
        user.do_not_save = true;
        Ok(vec![Command::new(ANSWER_TO_USER, json!({}))])
    }
}

/// Stores a per-message variable on message 10 and reports what it reads.
struct MidScenario;

#[async_trait]
impl Scenario for MidScenario {
    async fn run(&self, message: &Envelope, user: &mut User) -> Result<Vec<Command>, ScenarioError> {
        if message.message_id() == Some(10) {
            user.mid_variables
                .update("inner_stats", json!([1, 2]), None)?;
        }
        let seen = user.mid_variables.get_or("inner_stats", Value::Null);
        Ok(vec![Command::new(ANSWER_TO_USER, json!({"seen": seen}))])
    }
}

struct RejectAnswers;

impl Validator for RejectAnswers {
    fn name(&self) -> &'static str {
        "reject_answers"
    }

    fn validate(&self, message: &dyn ProtocolMessage) -> Result<(), ValidationError> {
        match message.message_name() {
            Some(ANSWER_TO_USER) => Err(ValidationError::MissingField {
                message_name: ANSWER_TO_USER.to_string(),
                field: "items".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

struct FailingPostprocessor;

#[async_trait]
impl Postprocessor for FailingPostprocessor {
    async fn postprocess(&self, _message: &Envelope, _user: &User) -> Result<(), ScenarioError> {
        Err(ScenarioError::Failed("postprocess".into()))
    }
}

fn replies(outcome: Outcome) -> Vec<parley_core::outgoing::OutgoingMessage> {
    match outcome {
        Outcome::Replies(replies) => replies,
        other => panic!("expected replies, got {other:?}"),
    }
}

fn settings(tries: u32) -> PipelineSettings {
    PipelineSettings {
        user_save_collisions_tries: tries,
        ..PipelineSettings::default()
    }
}

#[tokio::test]
async fn test_happy_path() {
    let ctx = TestContext::new(Arc::new(FixedAnswer("hello")));
    let inbound = skill_message(2, "hi");

    let processed = ctx
        .pipeline
        .process_raw(&to_bytes(&inbound), Headers::new(), false)
        .await;
    let replies = replies(processed.outcome);
    assert_eq!(replies.len(), 1);
    assert_eq!(
        Value::Object(replies[0].body.clone()),
        json!({
            "messageId": 2,
            "sessionId": "s",
            "messageName": "ANSWER_TO_USER",
            "uuid": {"userId": "u", "userChannel": "B2C"},
            "payload": {"pronounceText": "hello"}
        })
    );
    assert!(ctx.adapter.stored("u_B2C").await.is_some());

    // The second identical request saves against the blob it loaded.
    ctx.pipeline
        .process_raw(&to_bytes(&inbound), Headers::new(), false)
        .await;
    assert_eq!(ctx.adapter.replaces.load(Ordering::SeqCst), 2);
    assert_eq!(ctx.pipeline.metrics().get(Counter::SaveCollision), 0);
    assert_eq!(ctx.pipeline.metrics().get(Counter::IncomingMessage), 2);
}

#[tokio::test]
async fn test_missing_session_id_is_rejected() {
    let ctx = TestContext::new(Arc::new(EchoScenario));
    let mut inbound = skill_message(2, "hi");
    inbound.as_object_mut().unwrap().remove("sessionId");

    let processed = ctx
        .pipeline
        .process_raw(&to_bytes(&inbound), Headers::new(), true)
        .await;
    match processed.outcome {
        Outcome::Rejected(Rejection::Invalid(ValidationError::MissingField { field, .. })) => {
            assert_eq!(field, "sessionId");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(processed.user.is_none());
    assert_eq!(ctx.adapter.gets.load(Ordering::SeqCst), 0);
    assert_eq!(ctx.adapter.replaces.load(Ordering::SeqCst), 0);
    assert_eq!(ctx.pipeline.metrics().get(Counter::InvalidMessage), 1);
}

#[tokio::test]
async fn test_load_error_continues_with_empty_user() {
    let observer = Arc::new(Observer::default());
    let ctx = TestContext::new(observer.clone());
    ctx.adapter.fail_gets(1);

    let processed = ctx
        .pipeline
        .process_raw(&to_bytes(&skill_message(3, "hi")), Headers::new(), false)
        .await;

    assert!(matches!(processed.outcome, Outcome::NothingFound));
    assert!(observer.load_error.load(Ordering::SeqCst));
    assert!(processed.user.unwrap().load_error());
    assert_eq!(ctx.pipeline.metrics().get(Counter::LoadError), 1);
    assert_eq!(ctx.pipeline.metrics().get(Counter::NothingFound), 1);
}

#[tokio::test]
async fn test_transient_load_errors_are_retried() {
    let observer = Arc::new(Observer::default());
    let ctx = TestContext::with_settings(
        observer.clone(),
        PipelineSettings {
            adapter_get_tries: 3,
            ..PipelineSettings::default()
        },
    );
    ctx.adapter.transient_gets(2);

    ctx.pipeline
        .process_raw(&to_bytes(&skill_message(3, "hi")), Headers::new(), false)
        .await;

    assert_eq!(ctx.adapter.gets.load(Ordering::SeqCst), 3);
    assert!(!observer.load_error.load(Ordering::SeqCst));
    assert_eq!(ctx.pipeline.metrics().get(Counter::LoadError), 0);
}

#[tokio::test]
async fn test_save_collision_reloads_and_retries() {
    let ctx = TestContext::with_settings(Arc::new(EchoScenario), settings(2));
    // A concurrent request for the same user saves first.
    ctx.adapter
        .interleave_save(to_bytes(&json!({"data": {"winner": true}})));

    let processed = ctx
        .pipeline
        .process_raw(&to_bytes(&skill_message(4, "hi")), Headers::new(), false)
        .await;

    assert_eq!(replies(processed.outcome).len(), 1);
    assert_eq!(ctx.pipeline.metrics().get(Counter::SaveCollision), 1);
    assert_eq!(
        ctx.pipeline
            .metrics()
            .get(Counter::SaveCollisionTriesLeftExhausted),
        0
    );
    assert_eq!(ctx.adapter.gets.load(Ordering::SeqCst), 2);
    assert_eq!(ctx.adapter.replaces.load(Ordering::SeqCst), 2);

    // The retry ran on the reloaded state, so both writers' changes survive.
    let stored = ctx.adapter.stored("u_B2C").await.unwrap();
    assert_eq!(stored["data"]["winner"], json!(true));
    assert!(stored["variables"]["echo_turns"].is_array());
}

#[tokio::test]
async fn test_save_collision_without_tries_left_still_replies() {
    let ctx = TestContext::with_settings(Arc::new(EchoScenario), settings(1));
    ctx.adapter
        .interleave_save(to_bytes(&json!({"data": {"winner": true}})));

    let processed = ctx
        .pipeline
        .process_raw(&to_bytes(&skill_message(4, "hi")), Headers::new(), false)
        .await;

    assert_eq!(replies(processed.outcome).len(), 1);
    assert_eq!(ctx.pipeline.metrics().get(Counter::SaveCollision), 1);
    assert_eq!(
        ctx.pipeline
            .metrics()
            .get(Counter::SaveCollisionTriesLeftExhausted),
        1
    );
    let stored = ctx.adapter.stored("u_B2C").await.unwrap();
    assert_eq!(stored, json!({"data": {"winner": true}}));
}

#[tokio::test]
async fn test_zero_tries_saves_without_comparison() {
    let ctx = TestContext::with_settings(Arc::new(EchoScenario), settings(0));
    ctx.adapter
        .interleave_save(to_bytes(&json!({"data": {"winner": true}})));

    ctx.pipeline
        .process_raw(&to_bytes(&skill_message(4, "hi")), Headers::new(), false)
        .await;

    assert_eq!(ctx.adapter.saves.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.adapter.replaces.load(Ordering::SeqCst), 0);
    assert_eq!(ctx.pipeline.metrics().get(Counter::SaveCollision), 0);
}

#[tokio::test]
async fn test_save_error_still_replies() {
    let ctx = TestContext::new(Arc::new(EchoScenario));
    ctx.adapter.fail_saves(1);

    let processed = ctx
        .pipeline
        .process_raw(&to_bytes(&skill_message(5, "hi")), Headers::new(), false)
        .await;

    assert_eq!(replies(processed.outcome).len(), 1);
    assert_eq!(ctx.pipeline.metrics().get(Counter::SaveError), 1);
    assert!(ctx.adapter.stored("u_B2C").await.is_none());
}

#[tokio::test]
async fn test_scenario_error_replies_nothing_found_and_skips_save() {
    let ctx = TestContext::new(Arc::new(Failing));

    let processed = ctx
        .pipeline
        .process_raw(&to_bytes(&skill_message(6, "hi")), Headers::new(), false)
        .await;

    assert!(matches!(processed.outcome, Outcome::NothingFound));
    assert_eq!(ctx.pipeline.metrics().get(Counter::ScenarioError), 1);
    assert_eq!(ctx.adapter.replaces.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_scenario_error_reply_can_be_an_error_command() {
    let ctx = TestContext::with_settings(
        Arc::new(Failing),
        PipelineSettings {
            scenario_error_reply: ScenarioErrorReply::Error,
            ..PipelineSettings::default()
        },
    );

    let processed = ctx
        .pipeline
        .process_raw(&to_bytes(&skill_message(6, "hi")), Headers::new(), false)
        .await;

    let replies = replies(processed.outcome);
    assert_eq!(replies[0].body["messageName"], json!(ERROR));
    assert_eq!(
        replies[0].body["payload"],
        json!({"code": -1, "description": "Scenario Error"})
    );
}

#[tokio::test]
async fn test_do_not_save_skips_save() {
    let ctx = TestContext::new(Arc::new(DoNotSave));

    ctx.pipeline
        .process_raw(&to_bytes(&skill_message(7, "hi")), Headers::new(), false)
        .await;

    assert_eq!(ctx.adapter.saves.load(Ordering::SeqCst), 0);
    assert_eq!(ctx.adapter.replaces.load(Ordering::SeqCst), 0);
    assert!(ctx.adapter.stored("u_B2C").await.is_none());
}

#[tokio::test]
async fn test_message_without_user_id_skips_load_and_save() {
    let observer = Arc::new(Observer::default());
    let ctx = TestContext::new(observer.clone());
    let mut inbound = skill_message(8, "hi");
    inbound["uuid"] = json!({"sub": "anonymous"});

    ctx.pipeline
        .process_raw(&to_bytes(&inbound), Headers::new(), false)
        .await;

    assert_eq!(observer.runs.load(Ordering::SeqCst), 1);
    assert!(observer.load_error.load(Ordering::SeqCst));
    assert_eq!(ctx.adapter.gets.load(Ordering::SeqCst), 0);
    assert_eq!(ctx.adapter.replaces.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_outgoing_validation_failure_is_bad_answer() {
    let ctx = TestContext::with(Arc::new(EchoScenario), |builder| {
        builder.outgoing_validators(ValidatorChain::new(FailureMode::Raise).push(RejectAnswers))
    });

    let processed = ctx
        .pipeline
        .process_raw(&to_bytes(&skill_message(9, "hi")), Headers::new(), false)
        .await;

    assert!(matches!(processed.outcome, Outcome::BadAnswer(_)));
    assert_eq!(ctx.pipeline.metrics().get(Counter::BadAnswer), 1);
}

#[tokio::test]
async fn test_card_numbers_masked_in_logs_only() {
    let ctx = TestContext::new(Arc::new(EchoScenario));
    let text = "card 1234567890123456 end";
    let inbound = skill_message(12, text);

    let message = Envelope::parse(&to_bytes(&inbound), Headers::new()).unwrap();
    let logged = message.masked_value(ctx.pipeline.masker());
    assert!(logged.contains("card ************3456 end"));
    assert!(!logged.contains("1234567890123456"));

    let processed = ctx.pipeline.process(message).await;
    let replies = replies(processed.outcome);
    assert_eq!(replies[0].body["payload"]["pronounceText"], json!(text));
}

#[tokio::test]
async fn test_per_message_variables_are_scoped_by_message_id() {
    let ctx = TestContext::new(Arc::new(MidScenario));

    let first = ctx
        .pipeline
        .process_raw(&to_bytes(&skill_message(10, "a")), Headers::new(), false)
        .await;
    assert_eq!(replies(first.outcome)[0].body["payload"]["seen"], json!([1, 2]));

    let second = ctx
        .pipeline
        .process_raw(&to_bytes(&skill_message(11, "b")), Headers::new(), false)
        .await;
    assert_eq!(replies(second.outcome)[0].body["payload"]["seen"], Value::Null);

    // A redelivery of message 10 still sees its variables until they expire.
    let again = ctx
        .pipeline
        .process_raw(&to_bytes(&skill_message(10, "a")), Headers::new(), false)
        .await;
    assert_eq!(replies(again.outcome)[0].body["payload"]["seen"], json!([1, 2]));
}

#[tokio::test]
async fn test_per_message_variables_expire() {
    let ctx = TestContext::new(Arc::new(MidScenario));
    ctx.pipeline
        .process_raw(&to_bytes(&skill_message(10, "a")), Headers::new(), false)
        .await;

    ctx.clock.advance(3.0);

    let user = ctx.adapter.stored("u_B2C").await.unwrap();
    assert!(user["mid_variables"]["10"].is_array());
    let processed = ctx
        .pipeline
        .process_raw(&to_bytes(&skill_message(13, "b")), Headers::new(), false)
        .await;
    let stored = ctx.adapter.stored("u_B2C").await.unwrap();
    assert!(stored["mid_variables"].get("10").is_none());
    assert_eq!(replies(processed.outcome)[0].body["payload"]["seen"], Value::Null);
}

#[tokio::test]
async fn test_postprocess_failure_is_counted() {
    let ctx = TestContext::with(Arc::new(EchoScenario), |builder| {
        builder.postprocessor(Arc::new(FailingPostprocessor))
    });

    let processed = ctx
        .pipeline
        .process_raw(&to_bytes(&skill_message(14, "hi")), Headers::new(), false)
        .await;
    let user = processed.user.unwrap();
    ctx.pipeline.postprocess(&processed.message, &user).await;

    assert_eq!(ctx.pipeline.metrics().get(Counter::PostprocessError), 1);
    assert!(!user.inner_stats().is_empty());
}
