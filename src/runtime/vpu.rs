/// Channel runtime: drives one instance's continuation store to quiescence
///
/// Execution is single-threaded and cooperative per instance. Ready reactions
/// run FIFO in the order they became ready, so replaying the same sequence of
/// external posts against the same store reproduces the same interleaving.

use crate::config::EngineConfig;
use crate::process::types::ProcessDefinition;
use crate::runtime::channel::{ChannelId, ChannelKind, Message, PostOutcome};
use crate::runtime::context::ExecutionContext;
use crate::runtime::error::EngineError;
use crate::runtime::fault::FaultPropagator;
use crate::runtime::interpreter::{self, Continuation};
use crate::runtime::soup::{ReadyReaction, Reaction, Soup};

pub struct ChannelRuntime<'a> {
    soup: &'a mut Soup,
    definition: &'a ProcessDefinition,
    context: &'a mut dyn ExecutionContext,
    config: &'a EngineConfig,
    propagator: FaultPropagator,
}

impl<'a> ChannelRuntime<'a> {
    pub fn new(
        soup: &'a mut Soup,
        definition: &'a ProcessDefinition,
        context: &'a mut dyn ExecutionContext,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            soup,
            definition,
            context,
            config,
            propagator: FaultPropagator,
        }
    }

    /// Seed a fresh instance with its first reaction
    pub fn inject(&mut self, continuation: Continuation) -> Result<(), EngineError> {
        tracing::debug!("💉 Injecting initial reaction for instance {}", self.context.instance_id());
        self.spawn(continuation)
    }

    /// Deliver a message to a channel
    ///
    /// A matching pending reaction becomes ready. Posting to a channel that
    /// already fired is a no-op, which keeps redelivery idempotent.
    pub fn post(&mut self, channel: ChannelId, message: Message) -> Result<PostOutcome, EngineError> {
        let kind = match self.soup.channel_kind(channel) {
            Some(kind) => kind,
            None if self.soup.was_issued(channel) => {
                tracing::debug!("🪦 Dropping '{}' posted to retired {}", message.label(), channel);
                return Ok(PostOutcome::Dropped);
            }
            None => return Err(EngineError::UnknownChannel(channel)),
        };

        if !message.allowed_on(kind) {
            return Err(EngineError::ChannelCapability {
                channel,
                kind,
                message: message.label(),
            });
        }

        if let Some(waiter) = self.soup.waiter(channel) {
            if let Some(reaction) = self.soup.remove_reaction(waiter) {
                tracing::debug!("📨 '{}' on {} matched reaction {}", message.label(), channel, waiter.0);
                self.soup.release_channels(&reaction);
                self.soup.retire_channel(channel)?;
                self.soup.push_ready(ReadyReaction {
                    reaction,
                    fired: Some((channel, message)),
                })?;
                return Ok(PostOutcome::Matched);
            }
        }

        if self.soup.enqueue(channel, message)? {
            tracing::debug!("📥 Queued message on {}", channel);
            Ok(PostOutcome::Queued)
        } else {
            tracing::debug!("🪦 {} already holds a message, dropping duplicate", channel);
            Ok(PostOutcome::Dropped)
        }
    }

    /// Run exactly one ready reaction to its next suspension point
    ///
    /// Returns `false` without touching anything when nothing is ready.
    pub fn execute_step(&mut self) -> Result<bool, EngineError> {
        let Some(ready) = self.soup.pop_ready() else {
            return Ok(false);
        };

        self.soup.release_channels(&ready.reaction);
        let fired_channel = ready.fired.as_ref().map(|(ch, _)| *ch);
        let Reaction { id, waits, continuation } = ready.reaction;
        tracing::debug!("⚙️ Running reaction {} ({})", id.0, continuation.label());

        interpreter::react(self, continuation, ready.fired)?;

        // A fired wait set is consumed: channels the continuation did not re-await are retired
        for ch in waits {
            if Some(ch) != fired_channel && self.soup.is_live(ch) && self.soup.waiter(ch).is_none() {
                self.soup.retire_channel(ch)?;
            }
        }
        Ok(true)
    }

    /// Execute steps until no reaction is ready
    ///
    /// Exceeding the configured step budget is treated as a livelock.
    pub fn run_to_quiescence(&mut self) -> Result<usize, EngineError> {
        let budget = self.config.max_steps_per_pass;
        let mut steps = 0;
        while self.soup.has_ready() {
            if steps >= budget {
                tracing::error!("❌ Step budget of {} exhausted, suspected livelock", budget);
                return Err(EngineError::StepBudgetExceeded { budget });
            }
            self.execute_step()?;
            steps += 1;
        }
        tracing::debug!(
            "💤 Quiescent after {} steps ({} waiting, {} live channels)",
            steps,
            self.soup.waiting_count(),
            self.soup.live_channel_count()
        );
        Ok(steps)
    }

    pub fn soup(&self) -> &Soup {
        &*self.soup
    }

    // ----- primitives used by the interpreter ------------------------------

    pub(crate) fn soup_mut(&mut self) -> &mut Soup {
        &mut *self.soup
    }

    pub(crate) fn definition(&self) -> &'a ProcessDefinition {
        self.definition
    }

    pub(crate) fn context(&mut self) -> &mut dyn ExecutionContext {
        &mut *self.context
    }

    pub(crate) fn propagator(&self) -> FaultPropagator {
        self.propagator
    }

    pub(crate) fn new_channel(&mut self, kind: ChannelKind) -> ChannelId {
        self.soup.create_channel(kind)
    }

    /// Make a continuation ready without waiting on any channel
    pub(crate) fn spawn(&mut self, continuation: Continuation) -> Result<(), EngineError> {
        let id = self.soup.next_reaction_id();
        self.soup.push_ready(ReadyReaction {
            reaction: Reaction { id, waits: Vec::new(), continuation },
            fired: None,
        })
    }

    /// Suspend a continuation until the first message on any of `waits`
    pub(crate) fn await_on(&mut self, waits: Vec<ChannelId>, continuation: Continuation) -> Result<(), EngineError> {
        let id = self.soup.next_reaction_id();
        let queued = waits.iter().copied().find(|ch| self.soup.has_queued(*ch));
        let reaction = Reaction { id, waits, continuation };

        match queued {
            Some(ch) => {
                let message = self
                    .soup
                    .take_queued(ch)
                    .ok_or_else(|| EngineError::Corruption(format!("queued message on {} vanished", ch)))?;
                self.soup.retire_channel(ch)?;
                self.soup.push_ready(ReadyReaction {
                    reaction,
                    fired: Some((ch, message)),
                })
            }
            None => self.soup.add_reaction(reaction),
        }
    }

    pub(crate) fn fire(&mut self, channel: ChannelId, message: Message) -> Result<PostOutcome, EngineError> {
        self.post(channel, message)
    }

    pub(crate) fn retire(&mut self, channel: ChannelId) -> Result<(), EngineError> {
        self.soup.retire_channel(channel).map(|_| ())
    }
}
