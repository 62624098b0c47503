// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scenario engine and postprocess call contracts.

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;

use crate::message::{Envelope, ProtocolMessage};
use crate::outgoing::{ANSWER_TO_USER, Command};
use crate::user::User;
use crate::variables::{VariableStore, VariablesError};

pub const MESSAGE_TO_SKILL: &str = "MESSAGE_TO_SKILL";

/// Failure raised by a scenario or postprocessor.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("scenario failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Variables(#[from] VariablesError),
}

/// Produces replies for one message.
///
/// The scenario may mutate `user`; the pipeline persists it afterwards unless
/// `do_not_save` is set.
#[async_trait]
pub trait Scenario: Send + Sync {
    async fn run(&self, message: &Envelope, user: &mut User) -> Result<Vec<Command>, ScenarioError>;
}

/// Work done after the reply has been sent.
#[async_trait]
pub trait Postprocessor: Send + Sync {
    async fn postprocess(&self, message: &Envelope, user: &User) -> Result<(), ScenarioError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPostprocessor;

#[async_trait]
impl Postprocessor for NoopPostprocessor {
    async fn postprocess(&self, _message: &Envelope, _user: &User) -> Result<(), ScenarioError> {
        Ok(())
    }
}

/// Answers `MESSAGE_TO_SKILL` with the user's own text and counts turns.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoScenario;

/// Variable holding the number of answered turns.
pub const TURNS_VARIABLE: &str = "echo_turns";

#[async_trait]
impl Scenario for EchoScenario {
    async fn run(&self, message: &Envelope, user: &mut User) -> Result<Vec<Command>, ScenarioError> {
        if message.message_name() != Some(MESSAGE_TO_SKILL) {
            return Ok(Vec::new());
        }
        let text = message
            .payload()
            .and_then(|p| p.get("message"))
            .and_then(|m| m.get("original_text"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let turns = user
            .variables
            .get(TURNS_VARIABLE)
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
            + 1;
        user.variables.set(TURNS_VARIABLE, json!(turns), None)?;

        Ok(vec![Command::new(
            ANSWER_TO_USER,
            json!({"pronounceText": text, "turn": turns}),
        )])
    }
}
