/// Activity interpreter
///
/// Every activity follows the same contract: it is started with an
/// [`ActivityFrame`] holding a completion channel (child → parent) and a
/// termination channel (parent → child), runs until it can no longer make
/// progress, and suspends by registering a [`Continuation`] that waits on
/// channels. Exactly one of Completed, Faulted or Terminated is eventually
/// posted on the completion channel.
///
/// Continuations are plain data so the whole instance state serializes with
/// the continuation store.

use crate::process::types::{ActivityKind, ActivityNode, CopySource, NodeId};
use crate::runtime::channel::{ChannelId, ChannelKind, Message, ScopeInstanceId};
use crate::runtime::context::{
    ContextFault, CorrelationKey, CorrelationRef, InstanceEvent, InvokeOutcome, ReplyBody, Selector, VariableRef,
};
use crate::runtime::error::EngineError;
use crate::runtime::fault::{
    conflicting_request, correlation_violation, invalid_expression_value, missing_request, selection_failure,
    FaultData, FaultSignal, FlowDisposition,
};
use crate::runtime::soup::{InstanceOutcome, PROCESS_SCOPE};
use crate::runtime::vpu::ChannelRuntime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Channels and position of one running activity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActivityFrame {
    pub node: NodeId,
    /// Scope instance variables resolve against
    pub scope: ScopeInstanceId,
    pub completion: ChannelId,
    pub termination: ChannelId,
}

/// A parent's handle on a spawned child
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChildLink {
    pub node: NodeId,
    pub completion: ChannelId,
    pub termination: ChannelId,
}

/// Where a suspended activity resumes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "resume", rename_all = "snake_case")]
pub enum Continuation {
    /// Instance entry point
    Process,
    /// Process scope waiting for the root activity
    ProcessAwait { child: ChildLink },
    /// An activity that has not started yet
    Start { frame: ActivityFrame },
    Sequence {
        frame: ActivityFrame,
        /// Index of the next child to start
        next: usize,
        child: ChildLink,
        terminating: bool,
    },
    Flow {
        frame: ActivityFrame,
        active: Vec<ChildLink>,
        #[serde(default)]
        fault: Option<FaultSignal>,
        terminating: bool,
        child_terminated: bool,
    },
    Scope {
        frame: ActivityFrame,
        own: ScopeInstanceId,
        child: ChildLink,
        in_handler: bool,
        terminating: bool,
    },
    /// An activity forwarding its outcome from a single chosen branch (pick)
    Delegate {
        frame: ActivityFrame,
        child: ChildLink,
        terminating: bool,
    },
    Wait { frame: ActivityFrame, timer: ChannelId },
    Invoke { frame: ActivityFrame, response: ChannelId },
    Pick {
        frame: ActivityFrame,
        response: ChannelId,
        #[serde(default)]
        alarm: Option<ChannelId>,
    },
}

impl Continuation {
    pub fn label(&self) -> &'static str {
        match self {
            Continuation::Process => "process",
            Continuation::ProcessAwait { .. } => "process_await",
            Continuation::Start { .. } => "start",
            Continuation::Sequence { .. } => "sequence",
            Continuation::Flow { .. } => "flow",
            Continuation::Scope { .. } => "scope",
            Continuation::Delegate { .. } => "delegate",
            Continuation::Wait { .. } => "wait",
            Continuation::Invoke { .. } => "invoke",
            Continuation::Pick { .. } => "pick",
        }
    }
}

type Fired = Option<(ChannelId, Message)>;

/// Run one continuation until it suspends or finishes
pub(crate) fn react(rt: &mut ChannelRuntime<'_>, continuation: Continuation, fired: Fired) -> Result<(), EngineError> {
    match continuation {
        Continuation::Process => start_process(rt),
        Continuation::ProcessAwait { child } => {
            let (_, message) = expect_fired(fired, child.node)?;
            finish_process(rt, message)
        }
        Continuation::Start { frame } => start_activity(rt, frame),
        Continuation::Sequence { frame, next, child, terminating } => {
            resume_sequence(rt, frame, next, child, terminating, expect_fired(fired, frame.node)?)
        }
        Continuation::Flow { frame, active, fault, terminating, child_terminated } => resume_flow(
            rt,
            frame,
            FlowState { active, fault, terminating, child_terminated },
            expect_fired(fired, frame.node)?,
        ),
        Continuation::Scope { frame, own, child, in_handler, terminating } => {
            resume_scope(rt, frame, own, child, in_handler, terminating, expect_fired(fired, frame.node)?)
        }
        Continuation::Delegate { frame, child, terminating } => {
            resume_delegate(rt, frame, child, terminating, expect_fired(fired, frame.node)?)
        }
        Continuation::Wait { frame, timer } => resume_wait(rt, frame, timer, expect_fired(fired, frame.node)?),
        Continuation::Invoke { frame, response } => {
            resume_invoke(rt, frame, response, expect_fired(fired, frame.node)?)
        }
        Continuation::Pick { frame, response, alarm } => {
            resume_pick(rt, frame, response, alarm, expect_fired(fired, frame.node)?)
        }
    }
}

fn expect_fired(fired: Fired, node: NodeId) -> Result<(ChannelId, Message), EngineError> {
    fired.ok_or_else(|| EngineError::Corruption(format!("activity {} resumed without a message", node)))
}

fn unexpected(node: NodeId, message: &Message) -> EngineError {
    EngineError::InvalidMessage {
        node,
        reason: format!("unexpected '{}'", message.label()),
    }
}

fn lookup<'d>(rt: &ChannelRuntime<'d>, id: NodeId) -> Result<&'d ActivityNode, EngineError> {
    rt.definition().node(id).ok_or(EngineError::UnknownNode(id))
}

// ----- shared helpers ------------------------------------------------------

fn spawn_activity(rt: &mut ChannelRuntime<'_>, node: NodeId, scope: ScopeInstanceId) -> Result<ChildLink, EngineError> {
    let completion = rt.new_channel(ChannelKind::Completion);
    let termination = rt.new_channel(ChannelKind::Termination);
    rt.spawn(Continuation::Start {
        frame: ActivityFrame { node, scope, completion, termination },
    })?;
    Ok(ChildLink { node, completion, termination })
}

/// Report the activity's outcome to its parent and drop its termination channel
fn finish(rt: &mut ChannelRuntime<'_>, frame: &ActivityFrame, outcome: Message) -> Result<(), EngineError> {
    rt.retire(frame.termination)?;
    match &outcome {
        Message::Terminated => {
            rt.context().send_event(InstanceEvent::ActivityTerminated { node: frame.node.0 });
        }
        Message::Faulted { fault } => {
            let handler = rt.propagator().nearest_handler(rt.definition(), fault);
            tracing::debug!(
                "⚡ Activity {} reports fault {} (nearest handler: {:?})",
                frame.node,
                fault.name,
                handler
            );
            rt.context().send_event(InstanceEvent::ActivityFaulted {
                node: frame.node.0,
                fault: fault.name.clone(),
            });
        }
        _ => {}
    }
    rt.fire(frame.completion, outcome)?;
    Ok(())
}

fn fault_message(fault: FaultSignal) -> Message {
    Message::Faulted { fault }
}

fn context_fault(fault: ContextFault, origin: NodeId) -> FaultSignal {
    let signal = FaultSignal::new(fault.name, origin);
    match fault.data {
        Some(payload) => signal.with_data(FaultData { message_type: None, payload }),
        None => signal,
    }
}

/// Walk scope instances outward to the one declaring a name; unresolved names bind to the process scope
fn owning_scope(
    rt: &ChannelRuntime<'_>,
    from: ScopeInstanceId,
    declares: impl Fn(Option<&ActivityKind>) -> bool,
) -> ScopeInstanceId {
    let definition = rt.definition();
    let mut current = Some(from);
    while let Some(id) = current {
        let Some(instance) = rt.soup().scope(id) else {
            break;
        };
        let kind = instance.node.and_then(|n| definition.node(n)).map(|n| &n.kind);
        if declares(kind) {
            return id;
        }
        current = instance.parent;
    }
    PROCESS_SCOPE
}

fn variable_ref(rt: &ChannelRuntime<'_>, scope: ScopeInstanceId, name: &str) -> VariableRef {
    let definition = rt.definition();
    let owner = owning_scope(rt, scope, |kind| match kind {
        None => definition.variables.iter().any(|v| v == name),
        Some(ActivityKind::Scope { variables, fault_handler, .. }) => {
            variables.iter().any(|v| v == name)
                || fault_handler
                    .as_ref()
                    .map_or(false, |h| h.catches.iter().any(|c| c.fault_variable.as_deref() == Some(name)))
        }
        Some(_) => false,
    });
    VariableRef { scope: owner, name: name.to_string() }
}

fn correlation_ref(rt: &ChannelRuntime<'_>, scope: ScopeInstanceId, set: &str) -> CorrelationRef {
    let definition = rt.definition();
    let owner = owning_scope(rt, scope, |kind| match kind {
        None => definition.correlation_sets.iter().any(|s| s == set),
        Some(ActivityKind::Scope { correlation_sets, .. }) => correlation_sets.iter().any(|s| s == set),
        Some(_) => false,
    });
    CorrelationRef { scope: owner, set: set.to_string() }
}

fn read_variable(rt: &mut ChannelRuntime<'_>, frame: &ActivityFrame, name: &str) -> Result<Value, FaultSignal> {
    let var = variable_ref(rt, frame.scope, name);
    rt.context().read_variable(&var).map_err(|f| context_fault(f, frame.node))
}

fn write_variable(rt: &mut ChannelRuntime<'_>, scope: ScopeInstanceId, name: &str, value: Value) {
    let var = variable_ref(rt, scope, name);
    let ctx = rt.context();
    if ctx.is_variable_initialized(&var) {
        ctx.commit_variable(&var, value);
    } else {
        ctx.initialize_variable(&var, value);
    }
}

fn select_path(value: &Value, path: &str) -> Option<Value> {
    jsonpath_lib::select(value, path)
        .ok()
        .and_then(|found| found.first().map(|v| (*v).clone()))
}

// ----- process -------------------------------------------------------------

fn start_process(rt: &mut ChannelRuntime<'_>) -> Result<(), EngineError> {
    let root = rt.definition().root;
    let scope = rt.soup_mut().open_scope(None, None);
    let child = spawn_activity(rt, root, scope)?;
    rt.soup_mut().set_root_termination(child.termination);
    tracing::info!("🚀 Process instance {} started", rt.context().instance_id());
    rt.await_on(vec![child.completion], Continuation::ProcessAwait { child })
}

fn finish_process(rt: &mut ChannelRuntime<'_>, message: Message) -> Result<(), EngineError> {
    rt.soup_mut().close_scope(PROCESS_SCOPE);
    let instance = rt.context().instance_id();
    match message {
        Message::Completed => {
            if rt.soup_mut().record_outcome(InstanceOutcome::Completed) {
                tracing::info!("✅ Process instance {} completed", instance);
                rt.context().completed_ok();
            }
        }
        Message::Faulted { fault } => {
            if rt.soup_mut().record_fault(fault.clone()) {
                tracing::warn!("💥 Process instance {} faulted with {}", instance, fault.name);
                rt.context().completed_fault(&fault);
            }
        }
        Message::Terminated => {
            if rt.soup_mut().record_outcome(InstanceOutcome::Terminated) {
                tracing::info!("🛑 Process instance {} terminated", instance);
                rt.context().terminated();
            }
        }
        other => return Err(unexpected(rt.definition().root, &other)),
    }
    Ok(())
}

// ----- start ---------------------------------------------------------------

fn start_activity(rt: &mut ChannelRuntime<'_>, frame: ActivityFrame) -> Result<(), EngineError> {
    // Terminated before it ever ran: no effects at all
    if rt.soup_mut().take_queued(frame.termination).is_some() {
        return finish(rt, &frame, Message::Terminated);
    }

    let node = lookup(rt, frame.node)?;
    tracing::debug!("▶️ Starting {} activity {}", node.kind.label(), frame.node);
    rt.context().send_event(InstanceEvent::ActivityStarted {
        node: frame.node.0,
        kind: node.kind.label().to_string(),
    });

    match &node.kind {
        ActivityKind::Empty => finish(rt, &frame, Message::Completed),
        ActivityKind::Sequence { children } => match children.first() {
            None => finish(rt, &frame, Message::Completed),
            Some(&first) => {
                let child = spawn_activity(rt, first, frame.scope)?;
                rt.await_on(
                    vec![child.completion, frame.termination],
                    Continuation::Sequence { frame, next: 1, child, terminating: false },
                )
            }
        },
        ActivityKind::Flow { children } => {
            if children.is_empty() {
                return finish(rt, &frame, Message::Completed);
            }
            let mut active = Vec::with_capacity(children.len());
            for &child in children {
                active.push(spawn_activity(rt, child, frame.scope)?);
            }
            let mut waits: Vec<ChannelId> = active.iter().map(|c| c.completion).collect();
            waits.push(frame.termination);
            rt.await_on(
                waits,
                Continuation::Flow { frame, active, fault: None, terminating: false, child_terminated: false },
            )
        }
        ActivityKind::Throw { fault_name, fault_variable, fault_type } => {
            let signal = FaultSignal::new(fault_name.clone(), frame.node);
            let signal = match fault_variable {
                Some(var) => match read_variable(rt, &frame, var) {
                    Ok(payload) => signal.with_data(FaultData { message_type: fault_type.clone(), payload }),
                    Err(read_fault) => read_fault,
                },
                None => match fault_type {
                    Some(ty) => signal.with_data(FaultData { message_type: Some(ty.clone()), payload: Value::Null }),
                    None => signal,
                },
            };
            finish(rt, &frame, fault_message(signal))
        }
        ActivityKind::Scope { body, .. } => {
            let own = rt.soup_mut().open_scope(Some(frame.node), Some(frame.scope));
            let child = spawn_activity(rt, *body, own)?;
            rt.await_on(
                vec![child.completion, frame.termination],
                Continuation::Scope { frame, own, child, in_handler: false, terminating: false },
            )
        }
        ActivityKind::Wait { deadline } => {
            let Some(fire_at) = deadline.resolve(rt.context().now()) else {
                let fault = FaultSignal::new(invalid_expression_value(), frame.node);
                return finish(rt, &frame, fault_message(fault));
            };
            let timer = rt.new_channel(ChannelKind::Timer);
            rt.context().register_timer(timer, fire_at);
            tracing::debug!("⏳ Wait {} armed {} for {}", frame.node, timer, fire_at);
            rt.await_on(vec![timer, frame.termination], Continuation::Wait { frame, timer })
        }
        ActivityKind::Invoke { partner, operation, input_variable, output_variable } => {
            let payload = match read_variable(rt, &frame, input_variable) {
                Ok(payload) => payload,
                Err(fault) => return finish(rt, &frame, fault_message(fault)),
            };
            let response = rt.new_channel(ChannelKind::InvokeResponse);
            match rt.context().invoke(partner, operation, payload, response) {
                Ok(InvokeOutcome::Completed { response: value }) => {
                    rt.retire(response)?;
                    if let Some(out) = output_variable {
                        write_variable(rt, frame.scope, out, value);
                    }
                    finish(rt, &frame, Message::Completed)
                }
                Ok(InvokeOutcome::Pending { exchange_id }) => {
                    tracing::debug!("📤 Invoke {}.{} pending as {}", partner, operation, exchange_id);
                    rt.await_on(vec![response, frame.termination], Continuation::Invoke { frame, response })
                }
                Err(fault) => {
                    rt.retire(response)?;
                    finish(rt, &frame, fault_message(context_fault(fault, frame.node)))
                }
            }
        }
        ActivityKind::Pick { on_message, on_alarm } => {
            let mut selectors = Vec::with_capacity(on_message.len());
            for branch in on_message {
                let correlation = match &branch.correlation {
                    None => None,
                    Some(spec) => {
                        let cset = correlation_ref(rt, frame.scope, &spec.set);
                        let ctx = rt.context();
                        if ctx.is_correlation_initialized(&cset) {
                            ctx.read_correlation(&cset)
                        } else if spec.initiate {
                            None
                        } else {
                            let fault = FaultSignal::new(correlation_violation(), frame.node);
                            return finish(rt, &frame, fault_message(fault));
                        }
                    }
                };
                selectors.push(Selector {
                    partner: branch.partner.clone(),
                    operation: branch.operation.clone(),
                    correlation,
                });
            }

            let alarm_at = match on_alarm {
                Some(branch) => match branch.deadline.resolve(rt.context().now()) {
                    Some(at) => Some(at),
                    None => {
                        let fault = FaultSignal::new(invalid_expression_value(), frame.node);
                        return finish(rt, &frame, fault_message(fault));
                    }
                },
                None => None,
            };

            let response = rt.new_channel(ChannelKind::PickResponse);
            let (alarm, timeout) = match alarm_at {
                Some(fire_at) => {
                    let timer = rt.new_channel(ChannelKind::Timer);
                    rt.context().register_timer(timer, fire_at);
                    (Some(timer), Some(fire_at))
                }
                None => (None, None),
            };

            if let Err(fault) = rt.context().select(response, timeout, &selectors) {
                rt.retire(response)?;
                if let Some(timer) = alarm {
                    rt.context().cancel_timer(timer);
                    rt.retire(timer)?;
                }
                return finish(rt, &frame, fault_message(context_fault(fault, frame.node)));
            }

            let mut waits = vec![response];
            waits.extend(alarm);
            waits.push(frame.termination);
            rt.await_on(waits, Continuation::Pick { frame, response, alarm })
        }
        ActivityKind::Reply { partner, operation, variable, fault_name } => {
            let payload = match variable {
                Some(var) => match read_variable(rt, &frame, var) {
                    Ok(payload) => payload,
                    Err(fault) => return finish(rt, &frame, fault_message(fault)),
                },
                None => Value::Null,
            };
            let Some(exchange_id) = rt.soup_mut().take_request(partner, operation) else {
                let fault = FaultSignal::new(missing_request(), frame.node);
                return finish(rt, &frame, fault_message(fault));
            };
            let body = match fault_name {
                Some(name) => ReplyBody::Fault { fault_name: name.clone(), payload },
                None => ReplyBody::Message { payload },
            };
            match rt.context().reply(partner, operation, &exchange_id, body) {
                Ok(()) => finish(rt, &frame, Message::Completed),
                Err(fault) => finish(rt, &frame, fault_message(context_fault(fault, frame.node))),
            }
        }
        ActivityKind::Assign { copies } => {
            for copy in copies {
                let value = match &copy.from {
                    CopySource::Literal { value } => value.clone(),
                    CopySource::Variable { name, path } => {
                        let source = match read_variable(rt, &frame, name) {
                            Ok(v) => v,
                            Err(fault) => return finish(rt, &frame, fault_message(fault)),
                        };
                        match path {
                            None => source,
                            Some(path) => match select_path(&source, path) {
                                Some(v) => v,
                                None => {
                                    let fault = FaultSignal::new(selection_failure(), frame.node).with_data(
                                        FaultData { message_type: None, payload: Value::String(path.clone()) },
                                    );
                                    return finish(rt, &frame, fault_message(fault));
                                }
                            },
                        }
                    }
                };
                write_variable(rt, frame.scope, &copy.to, value);
            }
            finish(rt, &frame, Message::Completed)
        }
        ActivityKind::Exit => {
            tracing::info!("🚪 Exit at {} terminates the instance", frame.node);
            if let Some(root) = rt.soup().root_termination() {
                if root != frame.termination {
                    rt.fire(root, Message::Terminate)?;
                }
            }
            finish(rt, &frame, Message::Terminated)
        }
    }
}

// ----- composites ----------------------------------------------------------

fn resume_sequence(
    rt: &mut ChannelRuntime<'_>,
    frame: ActivityFrame,
    next: usize,
    child: ChildLink,
    terminating: bool,
    (channel, message): (ChannelId, Message),
) -> Result<(), EngineError> {
    if channel == frame.termination {
        rt.fire(child.termination, Message::Terminate)?;
        return rt.await_on(
            vec![child.completion],
            Continuation::Sequence { frame, next, child, terminating: true },
        );
    }

    match message {
        Message::Completed if terminating => finish(rt, &frame, Message::Terminated),
        Message::Completed => {
            let node = lookup(rt, frame.node)?;
            let ActivityKind::Sequence { children } = &node.kind else {
                return Err(EngineError::Corruption(format!("{} is not a sequence", frame.node)));
            };
            match children.get(next) {
                None => finish(rt, &frame, Message::Completed),
                Some(&following) => {
                    let child = spawn_activity(rt, following, frame.scope)?;
                    rt.await_on(
                        vec![child.completion, frame.termination],
                        Continuation::Sequence { frame, next: next + 1, child, terminating: false },
                    )
                }
            }
        }
        Message::Faulted { .. } if terminating => finish(rt, &frame, Message::Terminated),
        Message::Faulted { fault } => finish(rt, &frame, fault_message(fault)),
        Message::Terminated => finish(rt, &frame, Message::Terminated),
        other => Err(unexpected(frame.node, &other)),
    }
}

struct FlowState {
    active: Vec<ChildLink>,
    fault: Option<FaultSignal>,
    terminating: bool,
    child_terminated: bool,
}

fn terminate_children(rt: &mut ChannelRuntime<'_>, children: &[ChildLink]) -> Result<(), EngineError> {
    for child in children {
        rt.fire(child.termination, Message::Terminate)?;
    }
    Ok(())
}

fn resume_flow(
    rt: &mut ChannelRuntime<'_>,
    frame: ActivityFrame,
    mut state: FlowState,
    (channel, message): (ChannelId, Message),
) -> Result<(), EngineError> {
    if channel == frame.termination {
        if !state.terminating && state.fault.is_none() {
            terminate_children(rt, &state.active)?;
        }
        state.terminating = true;
    } else {
        let position = state
            .active
            .iter()
            .position(|c| c.completion == channel)
            .ok_or_else(|| EngineError::Corruption(format!("flow {} woke on foreign {}", frame.node, channel)))?;
        let finished = state.active.remove(position);
        match message {
            Message::Completed => {}
            Message::Terminated => state.child_terminated = true,
            Message::Faulted { fault } => {
                match rt.propagator().on_flow_fault(state.fault.is_some(), state.terminating) {
                    FlowDisposition::TerminateSiblings => {
                        tracing::debug!(
                            "🌊 Flow {} faulted in {}, terminating {} siblings",
                            frame.node,
                            finished.node,
                            state.active.len()
                        );
                        terminate_children(rt, &state.active)?;
                        state.fault = Some(fault);
                    }
                    FlowDisposition::Suppress => {
                        tracing::debug!("🌊 Flow {} suppresses secondary fault {}", frame.node, fault.name);
                    }
                }
            }
            other => return Err(unexpected(frame.node, &other)),
        }
    }

    if state.active.is_empty() {
        let outcome = if state.terminating {
            Message::Terminated
        } else if let Some(fault) = state.fault {
            fault_message(fault)
        } else if state.child_terminated {
            Message::Terminated
        } else {
            Message::Completed
        };
        return finish(rt, &frame, outcome);
    }

    let mut waits: Vec<ChannelId> = state.active.iter().map(|c| c.completion).collect();
    if rt.soup().is_live(frame.termination) {
        waits.push(frame.termination);
    }
    rt.await_on(
        waits,
        Continuation::Flow {
            frame,
            active: state.active,
            fault: state.fault,
            terminating: state.terminating,
            child_terminated: state.child_terminated,
        },
    )
}

fn resume_scope(
    rt: &mut ChannelRuntime<'_>,
    frame: ActivityFrame,
    own: ScopeInstanceId,
    child: ChildLink,
    in_handler: bool,
    terminating: bool,
    (channel, message): (ChannelId, Message),
) -> Result<(), EngineError> {
    if channel == frame.termination {
        rt.fire(child.termination, Message::Terminate)?;
        return rt.await_on(
            vec![child.completion],
            Continuation::Scope { frame, own, child, in_handler, terminating: true },
        );
    }

    let outcome = match message {
        Message::Completed if terminating => Message::Terminated,
        Message::Completed => Message::Completed,
        Message::Terminated => Message::Terminated,
        Message::Faulted { .. } if terminating => Message::Terminated,
        // A fault raised by the handler itself goes to the enclosing scope
        Message::Faulted { fault } if in_handler => fault_message(fault),
        Message::Faulted { fault } => {
            let node = lookup(rt, frame.node)?;
            let ActivityKind::Scope { fault_handler, .. } = &node.kind else {
                return Err(EngineError::Corruption(format!("{} is not a scope", frame.node)));
            };
            let propagator = rt.propagator();
            match fault_handler.as_ref().and_then(|h| propagator.select_catch(h, &fault)) {
                Some((catch_index, catch)) => {
                    tracing::info!("🛡️ Scope {} caught {} with catch #{}", frame.node, fault.name, catch_index);
                    rt.context().send_event(InstanceEvent::FaultCaught {
                        scope: frame.node.0,
                        fault: fault.name.clone(),
                        catch_index,
                    });
                    if let Some(var) = &catch.fault_variable {
                        let value = fault.data.as_ref().map_or(Value::Null, |d| d.payload.clone());
                        let var = VariableRef { scope: own, name: var.clone() };
                        rt.context().initialize_variable(&var, value);
                    }
                    let handler = spawn_activity(rt, catch.activity, own)?;
                    return rt.await_on(
                        vec![handler.completion, frame.termination],
                        Continuation::Scope { frame, own, child: handler, in_handler: true, terminating: false },
                    );
                }
                None => {
                    tracing::debug!("↗️ Scope {} has no catch for {}, rethrowing", frame.node, fault.name);
                    fault_message(fault)
                }
            }
        }
        other => return Err(unexpected(frame.node, &other)),
    };

    rt.soup_mut().close_scope(own);
    finish(rt, &frame, outcome)
}

fn resume_delegate(
    rt: &mut ChannelRuntime<'_>,
    frame: ActivityFrame,
    child: ChildLink,
    terminating: bool,
    (channel, message): (ChannelId, Message),
) -> Result<(), EngineError> {
    if channel == frame.termination {
        rt.fire(child.termination, Message::Terminate)?;
        return rt.await_on(vec![child.completion], Continuation::Delegate { frame, child, terminating: true });
    }
    let outcome = match message {
        Message::Completed | Message::Faulted { .. } if terminating => Message::Terminated,
        Message::Completed => Message::Completed,
        Message::Faulted { fault } => fault_message(fault),
        Message::Terminated => Message::Terminated,
        other => return Err(unexpected(frame.node, &other)),
    };
    finish(rt, &frame, outcome)
}

// ----- basic activities waiting on the outside world ------------------------

fn resume_wait(
    rt: &mut ChannelRuntime<'_>,
    frame: ActivityFrame,
    timer: ChannelId,
    (channel, message): (ChannelId, Message),
) -> Result<(), EngineError> {
    if channel == frame.termination {
        rt.context().cancel_timer(timer);
        rt.retire(timer)?;
        return finish(rt, &frame, Message::Terminated);
    }
    match message {
        Message::TimerFired => finish(rt, &frame, Message::Completed),
        other => Err(unexpected(frame.node, &other)),
    }
}

fn resume_invoke(
    rt: &mut ChannelRuntime<'_>,
    frame: ActivityFrame,
    response: ChannelId,
    (channel, message): (ChannelId, Message),
) -> Result<(), EngineError> {
    if channel == frame.termination {
        // late partner replies are dropped on the retired channel
        rt.retire(response)?;
        return finish(rt, &frame, Message::Terminated);
    }
    match message {
        Message::InvokeResponse { payload } => {
            let node = lookup(rt, frame.node)?;
            if let ActivityKind::Invoke { output_variable: Some(out), .. } = &node.kind {
                write_variable(rt, frame.scope, out, payload);
            }
            finish(rt, &frame, Message::Completed)
        }
        Message::InvokeFault { fault_name, data } => {
            let fault = context_fault(ContextFault { name: fault_name, data }, frame.node);
            finish(rt, &frame, fault_message(fault))
        }
        other => Err(unexpected(frame.node, &other)),
    }
}

fn resume_pick(
    rt: &mut ChannelRuntime<'_>,
    frame: ActivityFrame,
    response: ChannelId,
    alarm: Option<ChannelId>,
    (channel, message): (ChannelId, Message),
) -> Result<(), EngineError> {
    if channel == frame.termination {
        if let Some(timer) = alarm {
            rt.context().cancel_timer(timer);
            rt.retire(timer)?;
        }
        rt.retire(response)?;
        return finish(rt, &frame, Message::Terminated);
    }

    let node = lookup(rt, frame.node)?;
    let ActivityKind::Pick { on_message, on_alarm } = &node.kind else {
        return Err(EngineError::Corruption(format!("{} is not a pick", frame.node)));
    };

    let branch_activity = if Some(channel) == alarm {
        rt.retire(response)?;
        let branch = on_alarm
            .as_ref()
            .ok_or_else(|| EngineError::Corruption(format!("pick {} fired an undeclared alarm", frame.node)))?;
        tracing::debug!("⏰ Pick {} alarm fired", frame.node);
        branch.activity
    } else {
        let (selector, exchange_id, payload) = match message {
            Message::PickResponse { selector, exchange_id, payload } => (selector, exchange_id, payload),
            other => return Err(unexpected(frame.node, &other)),
        };
        let branch = on_message.get(selector).ok_or_else(|| EngineError::InvalidMessage {
            node: frame.node,
            reason: format!("selector {} out of range ({} branches)", selector, on_message.len()),
        })?;
        if let Some(timer) = alarm {
            rt.context().cancel_timer(timer);
            rt.retire(timer)?;
        }

        if rt.soup().has_open_request(&branch.partner, &branch.operation) {
            tracing::debug!("⚠️ Pick {} got {} while {}.{} is unanswered", frame.node, exchange_id, branch.partner, branch.operation);
            let fault = FaultSignal::new(conflicting_request(), frame.node);
            return finish(rt, &frame, fault_message(fault));
        }
        if let Some(spec) = &branch.correlation {
            let cset = correlation_ref(rt, frame.scope, &spec.set);
            if !rt.context().is_correlation_initialized(&cset) {
                match select_path(&payload, &spec.property) {
                    Some(key) => rt.context().write_correlation(&cset, CorrelationKey(key)),
                    None => {
                        let fault = FaultSignal::new(correlation_violation(), frame.node);
                        return finish(rt, &frame, fault_message(fault));
                    }
                }
            }
        }
        if let Some(var) = &branch.variable {
            write_variable(rt, frame.scope, var, payload);
        }
        tracing::debug!("📬 Pick {} received {}.{} ({})", frame.node, branch.partner, branch.operation, exchange_id);
        if !rt.soup_mut().open_request(&branch.partner, &branch.operation, exchange_id) {
            return Err(EngineError::Corruption(format!("pick {} found {}.{} already open", frame.node, branch.partner, branch.operation)));
        }
        branch.activity
    };

    let child = spawn_activity(rt, branch_activity, frame.scope)?;
    rt.await_on(
        vec![child.completion, frame.termination],
        Continuation::Delegate { frame, child, terminating: false },
    )
}
