/// Continuation store ("the soup")
///
/// Holds everything that is pending for one process instance: live channels
/// (with at most one queued message each), reactions waiting on them,
/// reactions that are ready to run, runtime scope instances, open partner
/// requests, and the instance-local id counter. It is the unit of
/// persistence: `serialize`/`deserialize` round-trip it exactly.
///
/// The store performs no scheduling. Only the channel runtime mutates it.

use crate::process::types::NodeId;
use crate::runtime::channel::{ChannelId, ChannelKind, Message, ReactionId, ScopeInstanceId};
use crate::runtime::error::EngineError;
use crate::runtime::fault::FaultSignal;
use crate::runtime::interpreter::Continuation;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Blob header magic
pub const SOUP_MAGIC: &[u8; 4] = b"SOUP";
/// Current blob format version; anything else is rejected
pub const SOUP_FORMAT_VERSION: u32 = 1;
/// Scope instance owning process-level variables and correlation sets
pub const PROCESS_SCOPE: ScopeInstanceId = ScopeInstanceId(0);

const HEADER_LEN: usize = 8;

/// Terminal outcome of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InstanceOutcome {
    Completed,
    Faulted { fault: FaultSignal },
    Terminated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChannelEntry {
    kind: ChannelKind,
    /// Single-fire: the first message posted wins
    #[serde(default)]
    queued: Option<Message>,
    /// Reaction (waiting or ready) that holds this channel in its wait set
    #[serde(default)]
    waiter: Option<ReactionId>,
}

/// A pending continuation waiting on one or more channels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub id: ReactionId,
    /// The first message on any of these channels fires the reaction
    pub waits: Vec<ChannelId>,
    pub continuation: Continuation,
}

/// A reaction whose channel fired (or a freshly spawned one) awaiting execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyReaction {
    pub reaction: Reaction,
    pub fired: Option<(ChannelId, Message)>,
}

/// A runtime instance of a Scope activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeInstance {
    /// Scope activity, `None` for the process scope
    pub node: Option<NodeId>,
    pub parent: Option<ScopeInstanceId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Soup {
    next_id: u64,
    channels: BTreeMap<ChannelId, ChannelEntry>,
    waiting: BTreeMap<ReactionId, Reaction>,
    ready: VecDeque<ReadyReaction>,
    scopes: BTreeMap<ScopeInstanceId, ScopeInstance>,
    /// Open inbound requests, keyed by "partner/operation"
    open_requests: BTreeMap<String, String>,
    root_termination: Option<ChannelId>,
    outcome: Option<InstanceOutcome>,
}

impl Default for Soup {
    fn default() -> Self {
        Self::new()
    }
}

impl Soup {
    pub fn new() -> Self {
        Self {
            // id 0 is reserved for the process scope
            next_id: PROCESS_SCOPE.0 + 1,
            channels: BTreeMap::new(),
            waiting: BTreeMap::new(),
            ready: VecDeque::new(),
            scopes: BTreeMap::new(),
            open_requests: BTreeMap::new(),
            root_termination: None,
            outcome: None,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Current value of the instance-local sequence counter
    pub fn sequence(&self) -> u64 {
        self.next_id
    }

    pub fn next_reaction_id(&mut self) -> ReactionId {
        ReactionId(self.next_id())
    }

    // ----- channels -------------------------------------------------------

    pub fn create_channel(&mut self, kind: ChannelKind) -> ChannelId {
        let id = ChannelId(self.next_id());
        self.channels.insert(id, ChannelEntry { kind, queued: None, waiter: None });
        id
    }

    /// Retire a channel; returns false when it was already dead
    ///
    /// Retiring a channel still held by a pending reaction corrupts the store.
    pub fn retire_channel(&mut self, id: ChannelId) -> Result<bool, EngineError> {
        match self.channels.get(&id) {
            None => Ok(false),
            Some(entry) => {
                if let Some(waiter) = entry.waiter {
                    return Err(EngineError::Corruption(format!(
                        "retiring {} still awaited by reaction {}",
                        id, waiter.0
                    )));
                }
                self.channels.remove(&id);
                Ok(true)
            }
        }
    }

    pub fn is_live(&self, id: ChannelId) -> bool {
        self.channels.contains_key(&id)
    }

    /// A channel id this instance handed out at some point
    pub fn was_issued(&self, id: ChannelId) -> bool {
        id.0 < self.next_id
    }

    pub fn channel_kind(&self, id: ChannelId) -> Option<ChannelKind> {
        self.channels.get(&id).map(|c| c.kind)
    }

    pub fn waiter(&self, id: ChannelId) -> Option<ReactionId> {
        self.channels.get(&id).and_then(|c| c.waiter)
    }

    /// Queue a message; returns false when the channel already holds one
    pub fn enqueue(&mut self, id: ChannelId, message: Message) -> Result<bool, EngineError> {
        let entry = self.channels.get_mut(&id).ok_or(EngineError::UnknownChannel(id))?;
        if entry.queued.is_some() {
            return Ok(false);
        }
        entry.queued = Some(message);
        Ok(true)
    }

    pub fn has_queued(&self, id: ChannelId) -> bool {
        self.channels.get(&id).map_or(false, |c| c.queued.is_some())
    }

    pub fn take_queued(&mut self, id: ChannelId) -> Option<Message> {
        self.channels.get_mut(&id).and_then(|c| c.queued.take())
    }

    /// Live channels of external kinds that a reaction is waiting on
    pub fn awaited_external_channels(&self) -> Vec<(ChannelId, ChannelKind)> {
        self.channels
            .iter()
            .filter(|(_, c)| c.kind.is_external() && c.waiter.is_some())
            .map(|(id, c)| (*id, c.kind))
            .collect()
    }

    // ----- reactions ------------------------------------------------------

    /// Register a reaction as waiting on all of its channels
    pub fn add_reaction(&mut self, reaction: Reaction) -> Result<(), EngineError> {
        self.claim_channels(reaction.id, &reaction.waits, None)?;
        self.waiting.insert(reaction.id, reaction);
        Ok(())
    }

    /// Remove a waiting reaction, leaving its channels claimed by it
    pub fn remove_reaction(&mut self, id: ReactionId) -> Option<Reaction> {
        self.waiting.remove(&id)
    }

    pub fn is_waiting(&self, id: ReactionId) -> bool {
        self.waiting.contains_key(&id)
    }

    fn claim_channels(
        &mut self,
        reaction: ReactionId,
        waits: &[ChannelId],
        skip: Option<ChannelId>,
    ) -> Result<(), EngineError> {
        for ch in waits.iter().filter(|c| Some(**c) != skip) {
            let entry = self
                .channels
                .get_mut(ch)
                .ok_or_else(|| EngineError::Corruption(format!("reaction {} awaits dead {}", reaction.0, ch)))?;
            if let Some(other) = entry.waiter {
                if other != reaction {
                    return Err(EngineError::Corruption(format!(
                        "{} already awaited by reaction {}",
                        ch, other.0
                    )));
                }
            }
            entry.waiter = Some(reaction);
        }
        Ok(())
    }

    /// Release the claims a reaction holds, ahead of running it
    pub fn release_channels(&mut self, reaction: &Reaction) {
        for ch in &reaction.waits {
            if let Some(entry) = self.channels.get_mut(ch) {
                if entry.waiter == Some(reaction.id) {
                    entry.waiter = None;
                }
            }
        }
    }

    pub fn push_ready(&mut self, ready: ReadyReaction) -> Result<(), EngineError> {
        let skip = ready.fired.as_ref().map(|(ch, _)| *ch);
        self.claim_channels(ready.reaction.id, &ready.reaction.waits, skip)?;
        self.ready.push_back(ready);
        Ok(())
    }

    pub fn pop_ready(&mut self) -> Option<ReadyReaction> {
        self.ready.pop_front()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn live_channel_count(&self) -> usize {
        self.channels.len()
    }

    // ----- scopes, requests, outcome -------------------------------------

    pub fn open_scope(&mut self, node: Option<NodeId>, parent: Option<ScopeInstanceId>) -> ScopeInstanceId {
        let id = if node.is_none() && parent.is_none() {
            PROCESS_SCOPE
        } else {
            ScopeInstanceId(self.next_id())
        };
        self.scopes.insert(id, ScopeInstance { node, parent });
        id
    }

    pub fn close_scope(&mut self, id: ScopeInstanceId) {
        self.scopes.remove(&id);
    }

    pub fn scope(&self, id: ScopeInstanceId) -> Option<&ScopeInstance> {
        self.scopes.get(&id)
    }

    /// Record an unanswered request; an already open one for the same operation is kept
    pub fn open_request(&mut self, partner: &str, operation: &str, exchange_id: String) -> bool {
        match self.open_requests.entry(request_key(partner, operation)) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(exchange_id);
                true
            }
        }
    }

    pub fn has_open_request(&self, partner: &str, operation: &str) -> bool {
        self.open_requests.contains_key(&request_key(partner, operation))
    }

    pub fn take_request(&mut self, partner: &str, operation: &str) -> Option<String> {
        self.open_requests.remove(&request_key(partner, operation))
    }

    pub fn set_root_termination(&mut self, channel: ChannelId) {
        self.root_termination = Some(channel);
    }

    pub fn root_termination(&self) -> Option<ChannelId> {
        self.root_termination
    }

    pub fn outcome(&self) -> Option<&InstanceOutcome> {
        self.outcome.as_ref()
    }

    /// Record the terminal outcome; the first outcome sticks
    pub fn record_outcome(&mut self, outcome: InstanceOutcome) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        self.outcome = Some(outcome);
        true
    }

    /// Record an instance-level fault; at most one is ever recorded
    pub fn record_fault(&mut self, fault: FaultSignal) -> bool {
        self.record_outcome(InstanceOutcome::Faulted { fault })
    }

    /// No pending reactions and no live channels remain
    pub fn is_complete(&self) -> bool {
        self.waiting.is_empty() && self.ready.is_empty() && self.channels.is_empty()
    }

    /// Verify that reactions and channels reference each other consistently
    pub fn check_integrity(&self) -> Result<(), EngineError> {
        for reaction in self.waiting.values() {
            for ch in &reaction.waits {
                match self.channels.get(ch) {
                    Some(entry) if entry.waiter == Some(reaction.id) => {}
                    Some(_) => {
                        return Err(EngineError::Corruption(format!(
                            "{} not claimed by waiting reaction {}",
                            ch, reaction.id.0
                        )))
                    }
                    None => {
                        return Err(EngineError::Corruption(format!(
                            "waiting reaction {} references orphaned {}",
                            reaction.id.0, ch
                        )))
                    }
                }
            }
        }
        for ready in &self.ready {
            let fired = ready.fired.as_ref().map(|(ch, _)| *ch);
            for ch in ready.reaction.waits.iter().filter(|c| Some(**c) != fired) {
                if !self.channels.contains_key(ch) {
                    return Err(EngineError::Corruption(format!(
                        "ready reaction {} references orphaned {}",
                        ready.reaction.id.0, ch
                    )));
                }
            }
        }
        for (id, entry) in &self.channels {
            if let Some(waiter) = entry.waiter {
                let held = self.waiting.contains_key(&waiter)
                    || self.ready.iter().any(|r| r.reaction.id == waiter);
                if !held {
                    return Err(EngineError::Corruption(format!(
                        "{} claimed by vanished reaction {}",
                        id, waiter.0
                    )));
                }
            }
            if id.0 >= self.next_id {
                return Err(EngineError::Corruption(format!("{} beyond sequence counter", id)));
            }
        }
        Ok(())
    }

    // ----- persistence ----------------------------------------------------

    /// Encode as a versioned blob: magic, big-endian format version, JSON body
    pub fn serialize(&self) -> Result<Vec<u8>, EngineError> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(SOUP_MAGIC);
        out.extend_from_slice(&SOUP_FORMAT_VERSION.to_be_bytes());
        serde_json::to_writer(&mut out, self)?;
        Ok(out)
    }

    /// Decode a blob produced by [`Soup::serialize`], failing closed on unknown formats
    pub fn deserialize(bytes: &[u8]) -> Result<Self, EngineError> {
        if bytes.len() < HEADER_LEN || &bytes[..4] != SOUP_MAGIC {
            return Err(EngineError::IncompatibleFormat("missing SOUP header".to_string()));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[4..HEADER_LEN]);
        let version = u32::from_be_bytes(version);
        if version != SOUP_FORMAT_VERSION {
            return Err(EngineError::IncompatibleFormat(format!(
                "format version {} (supported: {})",
                version, SOUP_FORMAT_VERSION
            )));
        }
        let soup: Soup = serde_json::from_slice(&bytes[HEADER_LEN..])?;
        soup.check_integrity()?;
        Ok(soup)
    }
}

fn request_key(partner: &str, operation: &str) -> String {
    format!("{}/{}", partner, operation)
}
