// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-request processing pipeline.
//!
//! ```text
//! PARSE -> VALIDATE -> LOAD -> SCENARIO -> SAVE (CAS) -> COMPOSE -> reply
//!                                  ^            |
//!                                  +-collision--+   (reload, re-run)
//! ```
//!
//! The pipeline is transport agnostic. It returns a [`Processed`] value and the
//! transport decides how to reply (HTTP status codes, Kafka records). Postprocess
//! runs only after the transport has sent the reply, through
//! [`Pipeline::postprocess`].
//!
//! # Save protocol
//!
//! `user_save_collisions_tries` is the number of save attempts per request.
//! Each attempt writes with `replace_if_equals(id, loaded_blob, new_blob)`. A
//! refused write counts `save_collision`, reloads the user and runs the scenario
//! again. When no attempts are left the replies of the last run are sent
//! anyway. A value of `0` disables the check and saves unconditionally.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Map;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, instrument, warn};

use crate::adapters::{Adapter, AdapterError};
use crate::clock::{self, SharedClock};
use crate::masking::Masker;
use crate::message::{
    Envelope, FailureMode, Headers, HeadersRequiredValidator, MalformedMessage, ProtocolMessage,
    RequiredFieldsValidator, ValidationError, ValidatorChain,
};
use crate::metrics::{Counter, Metrics};
use crate::outgoing::{Command, Composer, OutgoingMessage};
use crate::scenario::{NoopPostprocessor, Postprocessor, Scenario};
use crate::stats::{self, timed};
use crate::user::{User, UserFactory};
use crate::variables::DEFAULT_MID_VARIABLES_TTL;

/// Reply sent when the scenario fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioErrorReply {
    #[default]
    NothingFound,
    Error,
}

/// Tunables of the save and load loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Save attempts per request; `0` saves without the equality check.
    pub user_save_collisions_tries: u32,
    /// Attempts for a load that fails with a transient error.
    pub adapter_get_tries: u32,
    pub scenario_error_reply: ScenarioErrorReply,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            user_save_collisions_tries: 1,
            adapter_get_tries: 1,
            scenario_error_reply: ScenarioErrorReply::NothingFound,
        }
    }
}

/// Why an inbound message was not processed.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error(transparent)]
    Malformed(#[from] MalformedMessage),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Result of processing one message.
#[derive(Debug)]
pub enum Outcome {
    /// The message failed parsing or validation.
    Rejected(Rejection),
    /// One or more validated replies.
    Replies(Vec<OutgoingMessage>),
    /// Nothing to send back.
    NothingFound,
    /// A produced reply failed outgoing validation.
    BadAnswer(String),
}

/// A processed message, its outcome, and the user for postprocess.
#[derive(Debug)]
pub struct Processed {
    pub message: Envelope,
    pub outcome: Outcome,
    pub user: Option<User>,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("an adapter is required")]
    MissingAdapter,

    #[error("a scenario is required")]
    MissingScenario,

    #[error("adapter '{0}' is not asynchronous")]
    SyncAdapter(&'static str),
}

enum SaveStatus {
    Saved,
    Skipped,
    Collision,
    Failed,
}

struct Loaded {
    user: User,
    sample: Option<Vec<u8>>,
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    adapter: Option<Arc<dyn Adapter>>,
    scenario: Option<Arc<dyn Scenario>>,
    postprocessor: Arc<dyn Postprocessor>,
    incoming: ValidatorChain,
    outgoing: ValidatorChain,
    composer: Composer,
    masker: Masker,
    metrics: Arc<Metrics>,
    mid_variables_ttl: Duration,
    clock: SharedClock,
    settings: PipelineSettings,
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("adapter", &self.adapter.as_ref().map(|a| a.name()))
            .field("scenario", &self.scenario.as_ref().map(|_| "..."))
            .field("incoming", &self.incoming)
            .field("outgoing", &self.outgoing)
            .field("settings", &self.settings)
            .finish()
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self {
            adapter: None,
            scenario: None,
            postprocessor: Arc::new(NoopPostprocessor),
            incoming: default_incoming_validators(false),
            outgoing: ValidatorChain::new(FailureMode::Raise),
            composer: Composer::default(),
            masker: Masker::default(),
            metrics: Arc::new(Metrics::default()),
            mid_variables_ttl: DEFAULT_MID_VARIABLES_TTL,
            clock: clock::system(),
            settings: PipelineSettings::default(),
        }
    }
}

/// Header check followed by the required-fields table.
pub fn default_incoming_validators(require_headers: bool) -> ValidatorChain {
    ValidatorChain::new(FailureMode::Raise)
        .push(HeadersRequiredValidator::new(require_headers))
        .push(RequiredFieldsValidator::default())
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the user state adapter (required).
    pub fn adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Set the scenario engine (required).
    pub fn scenario(mut self, scenario: Arc<dyn Scenario>) -> Self {
        self.scenario = Some(scenario);
        self
    }

    pub fn postprocessor(mut self, postprocessor: Arc<dyn Postprocessor>) -> Self {
        self.postprocessor = postprocessor;
        self
    }

    pub fn incoming_validators(mut self, chain: ValidatorChain) -> Self {
        self.incoming = chain;
        self
    }

    pub fn outgoing_validators(mut self, chain: ValidatorChain) -> Self {
        self.outgoing = chain;
        self
    }

    pub fn composer(mut self, composer: Composer) -> Self {
        self.composer = composer;
        self
    }

    pub fn masker(mut self, masker: Masker) -> Self {
        self.masker = masker;
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Default TTL of per-message variables.
    pub fn mid_variables_ttl(mut self, ttl: Duration) -> Self {
        self.mid_variables_ttl = ttl;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Build the pipeline. Fails when a required part is missing or the
    /// adapter is not asynchronous.
    pub fn build(self) -> Result<Pipeline, PipelineError> {
        let adapter = self.adapter.ok_or(PipelineError::MissingAdapter)?;
        if !adapter.is_async() {
            return Err(PipelineError::SyncAdapter(adapter.name()));
        }
        let scenario = self.scenario.ok_or(PipelineError::MissingScenario)?;
        Ok(Pipeline {
            adapter,
            scenario,
            postprocessor: self.postprocessor,
            incoming: self.incoming,
            outgoing: self.outgoing,
            composer: self.composer,
            masker: self.masker,
            metrics: self.metrics,
            users: UserFactory::new(self.mid_variables_ttl, self.clock),
            settings: self.settings,
            background: TaskTracker::new(),
        })
    }
}

/// Message processing pipeline shared by every transport.
pub struct Pipeline {
    adapter: Arc<dyn Adapter>,
    scenario: Arc<dyn Scenario>,
    postprocessor: Arc<dyn Postprocessor>,
    incoming: ValidatorChain,
    outgoing: ValidatorChain,
    composer: Composer,
    masker: Masker,
    metrics: Arc<Metrics>,
    users: UserFactory,
    settings: PipelineSettings,
    // Postprocess tasks detached from the request that started them.
    background: TaskTracker,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("adapter", &self.adapter.name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn masker(&self) -> &Masker {
        &self.masker
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Compose a reply to `message` outside of the scenario, e.g. an error.
    pub fn compose(&self, message: &Envelope, command: Command) -> OutgoingMessage {
        self.composer.compose(message, command)
    }

    /// Parse and process a raw frame.
    ///
    /// `http` enables callback-id derivation from `messageId`.
    pub async fn process_raw(&self, bytes: &[u8], headers: Headers, http: bool) -> Processed {
        match Envelope::parse(bytes, headers.clone()) {
            Ok(message) => {
                let message = if http {
                    message.with_http_callback()
                } else {
                    message
                };
                self.process(message).await
            }
            Err(err) => {
                self.metrics.inc(Counter::IncomingMessage);
                self.metrics.inc(Counter::InvalidMessage);
                warn!(error = %err, size = bytes.len(), "Malformed message");
                Processed {
                    message: Envelope::from_map(Map::new(), headers),
                    outcome: Outcome::Rejected(err.into()),
                    user: None,
                }
            }
        }
    }

    /// Validate, run the scenario with CAS-protected saves, and compose replies.
    #[instrument(
        skip_all,
        fields(
            message_id = message.message_id(),
            key_name = message.message_name(),
            user_id = message.db_uid().as_deref(),
        )
    )]
    pub async fn process(&self, message: Envelope) -> Processed {
        let started = Instant::now();
        self.metrics.inc(Counter::IncomingMessage);
        debug!(message = %message.masked_value(&self.masker), "Incoming message");

        if let Err(err) = self.incoming.validate(&message) {
            self.metrics.inc(Counter::InvalidMessage);
            warn!(
                error = %err,
                message = %message.masked_value(&self.masker),
                "Invalid message"
            );
            return Processed {
                message,
                outcome: Outcome::Rejected(err.into()),
                user: None,
            };
        }

        let db_uid = message.db_uid();
        let mut attempt = 0;
        let (user, commands) = loop {
            attempt += 1;
            let Loaded { mut user, sample } = self.load(db_uid.as_deref()).await;
            user.for_message(&message);

            let stats = user.inner_stats().clone();
            let run = timed("scenario", &stats, self.scenario.run(&message, &mut user)).await;
            let commands = match run {
                Ok(commands) => commands,
                Err(err) => {
                    self.metrics.inc(Counter::ScenarioError);
                    error!(error = %err, "Scenario failed");
                    let commands = match self.settings.scenario_error_reply {
                        ScenarioErrorReply::NothingFound => Vec::new(),
                        ScenarioErrorReply::Error => vec![Command::error(-1, "Scenario Error")],
                    };
                    break (user, commands);
                }
            };

            match self.save(&user, sample.as_deref()).await {
                SaveStatus::Saved | SaveStatus::Skipped | SaveStatus::Failed => {
                    break (user, commands);
                }
                SaveStatus::Collision => {
                    self.metrics.inc(Counter::SaveCollision);
                    if attempt >= self.settings.user_save_collisions_tries {
                        self.metrics.inc(Counter::SaveCollisionTriesLeftExhausted);
                        warn!(attempt, "Save collision, no tries left; replying without saving");
                        break (user, commands);
                    }
                    debug!(attempt, "Save collision, reloading user");
                }
            }
        };

        let outcome = self.compose_replies(&message, commands);
        self.metrics.observe_request(started.elapsed());
        Processed {
            message,
            outcome,
            user: Some(user),
        }
    }

    fn compose_replies(&self, message: &Envelope, commands: Vec<Command>) -> Outcome {
        if commands.is_empty() {
            self.metrics.inc(Counter::NothingFound);
            return Outcome::NothingFound;
        }
        let mut replies = Vec::with_capacity(commands.len());
        for command in commands {
            let reply = self.composer.compose(message, command);
            if let Err(err) = self.outgoing.validate(&reply) {
                self.metrics.inc(Counter::BadAnswer);
                error!(
                    error = %err,
                    reply = %self.masker.mask_to_string(&serde_json::Value::Object(reply.body.clone())),
                    "Outgoing message failed validation"
                );
                return Outcome::BadAnswer(err.to_string());
            }
            debug!(
                reply = %self.masker.mask_to_string(&serde_json::Value::Object(reply.body.clone())),
                "Outgoing message"
            );
            replies.push(reply);
        }
        Outcome::Replies(replies)
    }

    async fn get_with_retry(&self, id: &str) -> Result<Option<Vec<u8>>, AdapterError> {
        let tries = self.settings.adapter_get_tries.max(1);
        let mut attempt = 1;
        loop {
            match self.adapter.get(id).await {
                Err(err) if err.is_transient() && attempt < tries => {
                    debug!(attempt, error = %err, "Transient load error, retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn load(&self, db_uid: Option<&str>) -> Loaded {
        let Some(id) = db_uid else {
            warn!("Message has no user id, continuing with an empty user");
            return Loaded {
                user: self.users.after_load_error(None),
                sample: None,
            };
        };
        match self.get_with_retry(id).await {
            Ok(None) => Loaded {
                user: self.users.empty(Some(id.to_string())),
                sample: None,
            },
            Ok(Some(blob)) => match self.users.from_blob(id.to_string(), &blob) {
                Ok(user) => Loaded {
                    user,
                    sample: Some(blob),
                },
                Err(err) => {
                    self.metrics.inc(Counter::LoadError);
                    error!(error = %err, size = blob.len(), "Stored user blob is unreadable");
                    Loaded {
                        user: self.users.after_load_error(Some(id.to_string())),
                        sample: Some(blob),
                    }
                }
            },
            Err(err) => {
                self.metrics.inc(Counter::LoadError);
                error!(error = %err, "User load failed");
                Loaded {
                    user: self.users.after_load_error(Some(id.to_string())),
                    sample: None,
                }
            }
        }
    }

    async fn save(&self, user: &User, sample: Option<&[u8]>) -> SaveStatus {
        let Some(id) = user.id() else {
            debug!("No user id, skipping save");
            return SaveStatus::Skipped;
        };
        if user.do_not_save {
            debug!("User marked do_not_save, skipping save");
            return SaveStatus::Skipped;
        }
        let blob = match user.to_blob() {
            Ok(blob) => blob,
            Err(err) => {
                self.metrics.inc(Counter::SaveError);
                error!(error = %err, "User state could not be serialized");
                return SaveStatus::Failed;
            }
        };

        let stats = user.inner_stats().clone();
        let result = if self.settings.user_save_collisions_tries == 0 {
            timed("save", &stats, self.adapter.save(id, &blob))
                .await
                .map(|()| true)
        } else {
            timed(
                "save",
                &stats,
                self.adapter.replace_if_equals(id, sample, &blob),
            )
            .await
        };

        match result {
            Ok(true) => SaveStatus::Saved,
            Ok(false) => SaveStatus::Collision,
            Err(err) => {
                if matches!(err, AdapterError::Unsupported(_)) {
                    self.metrics.inc(Counter::UnsupportedOperation);
                }
                self.metrics.inc(Counter::SaveError);
                error!(error = %err, "User save failed");
                SaveStatus::Failed
            }
        }
    }

    /// Run the postprocessor. Failures are logged and counted only.
    pub async fn postprocess(&self, message: &Envelope, user: &User) {
        let stats = user.inner_stats().clone();
        let result = timed(
            "postprocess",
            &stats,
            self.postprocessor.postprocess(message, user),
        )
        .await;
        if let Err(err) = result {
            self.metrics.inc(Counter::PostprocessError);
            warn!(
                message_id = message.message_id(),
                error = %err,
                "Postprocess failed"
            );
        }
        debug!(
            message_id = message.message_id(),
            stats = %stats.to_json(),
            "Request timings"
        );
    }

    /// Run [`postprocess`](Self::postprocess) in the background, after the
    /// reply has been sent. [`drain`](Self::drain) waits for these tasks.
    pub fn spawn_postprocess(self: &Arc<Self>, message: Envelope, user: User) {
        let pipeline = self.clone();
        self.background.spawn(stats::in_new_scope(async move {
            pipeline.postprocess(&message, &user).await;
        }));
    }

    /// Wait for background postprocess tasks to finish.
    ///
    /// Tasks spawned after this call are still awaited.
    pub async fn drain(&self) {
        self.background.close();
        let pending = self.background.len();
        if pending > 0 {
            debug!(pending, "Waiting for background postprocess tasks");
        }
        self.background.wait().await;
    }
}
