//! Activity semantics driven through the channel runtime
//!
//! Each test builds a small definition, runs it to quiescence and checks the
//! outcome, the journaled effects and that the continuation store drains
//! completely and survives a serialize/deserialize round trip.

use bpelway::config::EngineConfig;
use bpelway::process::types::{
    ActivityKind, Catch, CopySource, CopySpec, CorrelationSpec, Deadline, FaultHandler, NodeId, OnAlarm, OnMessage,
    ProcessBuilder, ProcessDefinition, QName,
};
use bpelway::runtime::channel::{ChannelId, ChannelKind, Message, PostOutcome};
use bpelway::runtime::context::{
    ContextResult, CorrelationKey, CorrelationRef, Effect, ExecutionContext, InstanceContext, InstanceEvent,
    InvokeOutcome, ReplyBody, Selector, VariableRef,
};
use bpelway::runtime::error::EngineError;
use bpelway::runtime::fault::{
    conflicting_request, correlation_violation, invalid_expression_value, invoke_failure, missing_request,
    selection_failure, uninitialized_variable, FaultSignal,
};
use bpelway::runtime::interpreter::{ActivityFrame, Continuation};
use bpelway::runtime::soup::{InstanceOutcome, Soup, PROCESS_SCOPE};
use bpelway::runtime::vpu::ChannelRuntime;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

const NS: &str = "urn:test";

struct Harness {
    definition: ProcessDefinition,
    soup: Soup,
    context: InstanceContext,
    config: EngineConfig,
}

impl Harness {
    fn new(definition: ProcessDefinition) -> Self {
        Self {
            definition,
            soup: Soup::new(),
            context: InstanceContext::new(Uuid::new_v4()),
            config: EngineConfig { max_steps_per_pass: 10_000 },
        }
    }

    fn runtime(&mut self) -> ChannelRuntime<'_> {
        ChannelRuntime::new(&mut self.soup, &self.definition, &mut self.context, &self.config)
    }

    fn start(&mut self) -> usize {
        let mut rt = self.runtime();
        rt.inject(Continuation::Process).unwrap();
        rt.run_to_quiescence().unwrap()
    }

    fn deliver(&mut self, channel: ChannelId, message: Message) -> PostOutcome {
        let mut rt = self.runtime();
        let outcome = rt.post(channel, message).unwrap();
        rt.run_to_quiescence().unwrap();
        outcome
    }

    fn outcome(&self) -> Option<&InstanceOutcome> {
        self.soup.outcome()
    }

    fn fault(&self) -> &FaultSignal {
        match self.outcome() {
            Some(InstanceOutcome::Faulted { fault }) => fault,
            other => panic!("expected a faulted instance, got {:?}", other),
        }
    }

    fn events(&self) -> Vec<&InstanceEvent> {
        self.context
            .effects()
            .iter()
            .filter_map(|e| match e {
                Effect::Event { event } => Some(event),
                _ => None,
            })
            .collect()
    }

    fn registered_timers(&self) -> Vec<ChannelId> {
        self.context
            .effects()
            .iter()
            .filter_map(|e| match e {
                Effect::RegisterTimer { timer, .. } => Some(*timer),
                _ => None,
            })
            .collect()
    }

    fn cancelled_timers(&self) -> Vec<ChannelId> {
        self.context
            .effects()
            .iter()
            .filter_map(|e| match e {
                Effect::CancelTimer { timer } => Some(*timer),
                _ => None,
            })
            .collect()
    }

    fn variable(&self, name: &str) -> Option<&Value> {
        self.context.variable(&VariableRef { scope: PROCESS_SCOPE, name: name.to_string() })
    }

    /// Store is drained and still decodes to an equally drained store
    fn assert_drained(&self) {
        assert!(self.soup.is_complete(), "store still holds pending work");
        let restored = Soup::deserialize(&self.soup.serialize().unwrap()).unwrap();
        assert!(restored.is_complete());
        assert_eq!(restored.outcome(), self.soup.outcome());
    }
}

fn boom() -> QName {
    QName::new(NS, "boom")
}

fn throw(b: &mut ProcessBuilder, local: &str) -> NodeId {
    b.add(ActivityKind::Throw {
        fault_name: QName::new(NS, local),
        fault_variable: None,
        fault_type: None,
    })
}

fn wait_secs(b: &mut ProcessBuilder, secs: u64) -> NodeId {
    b.add(ActivityKind::Wait {
        deadline: Deadline { for_seconds: Some(secs), until: None },
    })
}

fn scope(b: &mut ProcessBuilder, body: NodeId, catches: Vec<Catch>) -> NodeId {
    b.add(ActivityKind::Scope {
        body,
        fault_handler: if catches.is_empty() { None } else { Some(FaultHandler { catches }) },
        variables: vec![],
        correlation_sets: vec![],
    })
}

fn catch_all(activity: NodeId) -> Catch {
    Catch { fault_name: None, fault_type: None, fault_variable: None, activity }
}

fn assign_literal(b: &mut ProcessBuilder, to: &str, value: Value) -> NodeId {
    b.add(ActivityKind::Assign {
        copies: vec![CopySpec { from: CopySource::Literal { value }, to: to.to_string() }],
    })
}

fn assign_path(b: &mut ProcessBuilder, from: &str, path: &str, to: &str) -> NodeId {
    b.add(ActivityKind::Assign {
        copies: vec![CopySpec {
            from: CopySource::Variable { name: from.to_string(), path: Some(path.to_string()) },
            to: to.to_string(),
        }],
    })
}

// ----- basic and structured activities ---------------------------------------

#[test]
fn empty_process_completes() {
    let mut b = ProcessBuilder::new("empty");
    let root = b.add(ActivityKind::Empty);
    let mut h = Harness::new(b.build(root).unwrap());

    h.start();

    assert_eq!(h.outcome(), Some(&InstanceOutcome::Completed));
    assert!(h.events().contains(&&InstanceEvent::ProcessCompleted));
    h.assert_drained();
}

#[test]
fn throw_faults_the_instance() {
    let mut b = ProcessBuilder::new("throw");
    let root = throw(&mut b, "boom");
    let mut h = Harness::new(b.build(root).unwrap());

    h.start();

    assert_eq!(h.fault().name, boom());
    assert_eq!(h.fault().origin, root);
    assert!(h.events().contains(&&InstanceEvent::ProcessFaulted { fault: boom() }));
    h.assert_drained();
}

#[test]
fn sequences_of_one_and_two_complete() {
    for len in 1..=2 {
        let mut b = ProcessBuilder::new("seq");
        let children: Vec<NodeId> = (0..len).map(|_| b.add(ActivityKind::Empty)).collect();
        let root = b.add(ActivityKind::Sequence { children });
        let mut h = Harness::new(b.build(root).unwrap());

        h.start();

        assert_eq!(h.outcome(), Some(&InstanceOutcome::Completed), "sequence of {}", len);
        h.assert_drained();
    }
}

#[test]
fn sequence_stops_at_the_first_fault() {
    let mut b = ProcessBuilder::new("seq-fault").variable("x");
    let t = throw(&mut b, "boom");
    let after = assign_literal(&mut b, "x", json!(1));
    let root = b.add(ActivityKind::Sequence { children: vec![t, after] });
    let mut h = Harness::new(b.build(root).unwrap());

    h.start();

    assert_eq!(h.fault().name, boom());
    assert!(h.variable("x").is_none());
    h.assert_drained();
}

#[test]
fn flows_of_zero_one_and_two_complete() {
    for width in 0..=2 {
        let mut b = ProcessBuilder::new("flow");
        let children: Vec<NodeId> = (0..width).map(|_| b.add(ActivityKind::Empty)).collect();
        let root = b.add(ActivityKind::Flow { children });
        let mut h = Harness::new(b.build(root).unwrap());

        h.start();

        assert_eq!(h.outcome(), Some(&InstanceOutcome::Completed), "flow of {}", width);
        h.assert_drained();
    }
}

#[test]
fn flow_fault_terminates_siblings_and_reports_once() {
    let mut b = ProcessBuilder::new("flow-termination");
    let mut children = vec![throw(&mut b, "boom")];
    for _ in 0..3 {
        children.push(b.add(ActivityKind::Empty));
    }
    for _ in 0..3 {
        children.push(wait_secs(&mut b, 3600));
    }
    let root = b.add(ActivityKind::Flow { children });
    let mut h = Harness::new(b.build(root).unwrap());

    h.start();

    assert_eq!(h.fault().name, boom());
    let faulted = h
        .events()
        .into_iter()
        .filter(|e| matches!(e, InstanceEvent::ProcessFaulted { .. }))
        .count();
    assert_eq!(faulted, 1);

    // every timer a waiting sibling armed was cancelled again
    let mut armed = h.registered_timers();
    let mut cancelled = h.cancelled_timers();
    armed.sort();
    cancelled.sort();
    assert_eq!(armed, cancelled);
    h.assert_drained();
}

#[test]
fn only_the_first_of_two_flow_faults_is_kept() {
    let mut b = ProcessBuilder::new("two-faults");
    let first = throw(&mut b, "first");
    let second = throw(&mut b, "second");
    let root = b.add(ActivityKind::Flow { children: vec![first, second] });
    let mut h = Harness::new(b.build(root).unwrap());

    h.start();

    assert_eq!(h.fault().name, QName::new(NS, "first"));
    h.assert_drained();
}

#[test]
fn sibling_terminated_before_reaching_a_wait_never_arms_it() {
    let mut b = ProcessBuilder::new("early-termination");
    let t = throw(&mut b, "boom");
    let e = b.add(ActivityKind::Empty);
    let w = wait_secs(&mut b, 60);
    let seq = b.add(ActivityKind::Sequence { children: vec![e, w] });
    let root = b.add(ActivityKind::Flow { children: vec![t, seq] });
    let mut h = Harness::new(b.build(root).unwrap());

    h.start();

    assert_eq!(h.fault().name, boom());
    assert!(h.registered_timers().is_empty());
    assert!(h.events().contains(&&InstanceEvent::ActivityTerminated { node: seq.0 }));
    h.assert_drained();
}

#[test]
fn terminate_queued_before_start_finishes_without_effects() {
    let mut b = ProcessBuilder::new("pre-terminated");
    let root = wait_secs(&mut b, 60);
    let mut h = Harness::new(b.build(root).unwrap());

    let completion = h.soup.create_channel(ChannelKind::Completion);
    let termination = h.soup.create_channel(ChannelKind::Termination);
    {
        let mut rt = h.runtime();
        assert_eq!(rt.post(termination, Message::Terminate).unwrap(), PostOutcome::Queued);
        rt.inject(Continuation::Start {
            frame: ActivityFrame { node: root, scope: PROCESS_SCOPE, completion, termination },
        })
        .unwrap();
        rt.run_to_quiescence().unwrap();
    }

    assert!(h.registered_timers().is_empty());
    assert_eq!(h.events(), vec![&InstanceEvent::ActivityTerminated { node: root.0 }]);
    assert_eq!(h.soup.take_queued(completion), Some(Message::Terminated));
    assert!(!h.soup.is_live(termination));
}

// ----- fault handling --------------------------------------------------------

#[test]
fn scope_handler_catches_fault_and_receives_its_data() {
    let mut b = ProcessBuilder::new("catch").variable("detail").variable("result");
    let init = assign_literal(&mut b, "detail", json!({"code": 7}));
    let t = b.add(ActivityKind::Throw {
        fault_name: boom(),
        fault_variable: Some("detail".into()),
        fault_type: Some("OrderError".into()),
    });
    let handler = assign_path(&mut b, "caught", "$.code", "result");
    let s = scope(
        &mut b,
        t,
        vec![Catch {
            fault_name: None,
            fault_type: Some("OrderError".into()),
            fault_variable: Some("caught".into()),
            activity: handler,
        }],
    );
    let root = b.add(ActivityKind::Sequence { children: vec![init, s] });
    let mut h = Harness::new(b.build(root).unwrap());

    h.start();

    assert_eq!(h.outcome(), Some(&InstanceOutcome::Completed));
    assert_eq!(h.variable("result"), Some(&json!(7)));
    assert!(h.events().contains(&&InstanceEvent::FaultCaught { scope: s.0, fault: boom(), catch_index: 0 }));
    h.assert_drained();
}

#[test]
fn unmatched_fault_is_rethrown_to_the_enclosing_scope() {
    let mut b = ProcessBuilder::new("rethrow");
    let t = throw(&mut b, "boom");
    let inner_handler = b.add(ActivityKind::Empty);
    let inner = scope(
        &mut b,
        t,
        vec![Catch {
            fault_name: Some(QName::new(NS, "other")),
            fault_type: None,
            fault_variable: None,
            activity: inner_handler,
        }],
    );
    let outer_handler = b.add(ActivityKind::Empty);
    let outer = scope(&mut b, inner, vec![catch_all(outer_handler)]);
    let mut h = Harness::new(b.build(outer).unwrap());

    h.start();

    assert_eq!(h.outcome(), Some(&InstanceOutcome::Completed));
    let caught: Vec<&InstanceEvent> = h
        .events()
        .into_iter()
        .filter(|e| matches!(e, InstanceEvent::FaultCaught { .. }))
        .collect();
    assert_eq!(caught, vec![&InstanceEvent::FaultCaught { scope: outer.0, fault: boom(), catch_index: 0 }]);
    h.assert_drained();
}

#[test]
fn fault_raised_by_a_handler_escapes_its_scope() {
    let mut b = ProcessBuilder::new("handler-fault");
    let t = throw(&mut b, "boom");
    let rethrow = throw(&mut b, "escalated");
    let root = scope(&mut b, t, vec![catch_all(rethrow)]);
    let mut h = Harness::new(b.build(root).unwrap());

    h.start();

    assert_eq!(h.fault().name, QName::new(NS, "escalated"));
    h.assert_drained();
}

#[test]
fn reading_an_uninitialized_variable_faults() {
    let mut b = ProcessBuilder::new("uninit").variable("missing");
    let root = b.add(ActivityKind::Throw {
        fault_name: boom(),
        fault_variable: Some("missing".into()),
        fault_type: None,
    });
    let mut h = Harness::new(b.build(root).unwrap());

    h.start();

    assert_eq!(h.fault().name, uninitialized_variable());
    h.assert_drained();
}

#[test]
fn assign_with_unmatched_path_faults() {
    let mut b = ProcessBuilder::new("selection").variable("doc").variable("out");
    let init = assign_literal(&mut b, "doc", json!({"a": 1}));
    let copy = assign_path(&mut b, "doc", "$.b", "out");
    let root = b.add(ActivityKind::Sequence { children: vec![init, copy] });
    let mut h = Harness::new(b.build(root).unwrap());

    h.start();

    assert_eq!(h.fault().name, selection_failure());
    assert!(h.variable("out").is_none());
}

// ----- waiting on the outside world ------------------------------------------

#[test]
fn wait_completes_when_its_timer_fires() {
    let mut b = ProcessBuilder::new("wait");
    let w = wait_secs(&mut b, 30);
    let after = b.add(ActivityKind::Empty);
    let root = b.add(ActivityKind::Sequence { children: vec![w, after] });
    let mut h = Harness::new(b.build(root).unwrap());

    h.start();
    assert!(h.outcome().is_none());
    let timers = h.registered_timers();
    assert_eq!(timers.len(), 1);
    assert_eq!(h.soup.awaited_external_channels(), vec![(timers[0], ChannelKind::Timer)]);

    assert_eq!(h.deliver(timers[0], Message::TimerFired), PostOutcome::Matched);

    assert_eq!(h.outcome(), Some(&InstanceOutcome::Completed));
    h.assert_drained();

    // redelivery after the channel fired is harmless
    assert_eq!(h.deliver(timers[0], Message::TimerFired), PostOutcome::Dropped);
}

#[test]
fn resuming_from_a_persisted_store_matches_uninterrupted_execution() {
    let mut b = ProcessBuilder::new("recovery").variable("x");
    let w = wait_secs(&mut b, 30);
    let set = assign_literal(&mut b, "x", json!("done"));
    let root = b.add(ActivityKind::Sequence { children: vec![w, set] });
    let mut original = Harness::new(b.build(root).unwrap());
    original.start();
    let timer = original.registered_timers()[0];

    let mut recovered = Harness::new(original.definition.clone());
    recovered.soup = Soup::deserialize(&original.soup.serialize().unwrap()).unwrap();
    recovered.context = serde_json::from_value(serde_json::to_value(&original.context).unwrap()).unwrap();

    original.deliver(timer, Message::TimerFired);
    recovered.deliver(timer, Message::TimerFired);

    assert_eq!(recovered.outcome(), original.outcome());
    assert_eq!(recovered.variable("x"), Some(&json!("done")));
    assert_eq!(recovered.soup.serialize().unwrap(), original.soup.serialize().unwrap());
    assert_eq!(recovered.soup.sequence(), original.soup.sequence());
}

#[test]
fn invoke_waits_for_the_partner_response() {
    let mut b = ProcessBuilder::new("invoke").variable("request").variable("reply");
    let init = assign_literal(&mut b, "request", json!({"amount": 10}));
    let call = b.add(ActivityKind::Invoke {
        partner: "billing".into(),
        operation: "charge".into(),
        input_variable: "request".into(),
        output_variable: Some("reply".into()),
    });
    let root = b.add(ActivityKind::Sequence { children: vec![init, call] });
    let mut h = Harness::new(b.build(root).unwrap());

    h.start();

    let response = h
        .context
        .effects()
        .iter()
        .find_map(|e| match e {
            Effect::Invoke { partner, payload, response, .. } => {
                assert_eq!(partner, "billing");
                assert_eq!(payload, &json!({"amount": 10}));
                Some(*response)
            }
            _ => None,
        })
        .unwrap();
    assert!(h.outcome().is_none());

    h.deliver(response, Message::InvokeResponse { payload: json!({"charged": true}) });

    assert_eq!(h.outcome(), Some(&InstanceOutcome::Completed));
    assert_eq!(h.variable("reply"), Some(&json!({"charged": true})));
    h.assert_drained();
}

#[test]
fn invoke_fault_response_faults_the_activity() {
    let mut b = ProcessBuilder::new("invoke-fault").variable("request");
    let init = assign_literal(&mut b, "request", json!(1));
    let call = b.add(ActivityKind::Invoke {
        partner: "billing".into(),
        operation: "charge".into(),
        input_variable: "request".into(),
        output_variable: None,
    });
    let root = b.add(ActivityKind::Sequence { children: vec![init, call] });
    let mut h = Harness::new(b.build(root).unwrap());
    h.start();
    let (response, _) = h.soup.awaited_external_channels()[0];

    h.deliver(
        response,
        Message::InvokeFault { fault_name: QName::new(NS, "declined"), data: Some(json!("no funds")) },
    );

    let fault = h.fault();
    assert_eq!(fault.name, QName::new(NS, "declined"));
    assert_eq!(fault.origin, call);
    assert_eq!(fault.data.as_ref().map(|d| &d.payload), Some(&json!("no funds")));
    h.assert_drained();
}

#[test]
fn invoke_with_uninitialized_input_faults_without_calling_out() {
    let mut b = ProcessBuilder::new("invoke-uninit").variable("request");
    let root = b.add(ActivityKind::Invoke {
        partner: "billing".into(),
        operation: "charge".into(),
        input_variable: "request".into(),
        output_variable: None,
    });
    let mut h = Harness::new(b.build(root).unwrap());

    h.start();

    assert_eq!(h.fault().name, uninitialized_variable());
    assert!(!h.context.effects().iter().any(|e| matches!(e, Effect::Invoke { .. })));
    h.assert_drained();
}

fn order_pick(b: &mut ProcessBuilder, initiate: bool, body: NodeId) -> NodeId {
    b.add(ActivityKind::Pick {
        on_message: vec![OnMessage {
            partner: "shop".into(),
            operation: "order".into(),
            variable: Some("order".into()),
            correlation: Some(CorrelationSpec { set: "conversation".into(), initiate, property: "$.id".into() }),
            activity: body,
        }],
        on_alarm: None,
    })
}

#[test]
fn pick_receives_message_initiates_correlation_and_replies() {
    let mut b = ProcessBuilder::new("pick-reply")
        .variable("order")
        .variable("orderId")
        .correlation_set("conversation");
    let extract = assign_path(&mut b, "order", "$.id", "orderId");
    let reply = b.add(ActivityKind::Reply {
        partner: "shop".into(),
        operation: "order".into(),
        variable: Some("orderId".into()),
        fault_name: None,
    });
    let body = b.add(ActivityKind::Sequence { children: vec![extract, reply] });
    let root = order_pick(&mut b, true, body);
    let mut h = Harness::new(b.build(root).unwrap());

    h.start();
    let response = h
        .context
        .effects()
        .iter()
        .find_map(|e| match e {
            Effect::Select { response, selectors, timeout } => {
                assert!(timeout.is_none());
                assert_eq!(selectors[0].correlation, None);
                Some(*response)
            }
            _ => None,
        })
        .unwrap();

    h.deliver(
        response,
        Message::PickResponse { selector: 0, exchange_id: "mex-1".into(), payload: json!({"id": 42}) },
    );

    assert_eq!(h.outcome(), Some(&InstanceOutcome::Completed));
    let cset = CorrelationRef { scope: PROCESS_SCOPE, set: "conversation".into() };
    assert_eq!(h.context.read_correlation(&cset), Some(CorrelationKey(json!(42))));
    assert!(h.context.effects().contains(&Effect::Reply {
        partner: "shop".into(),
        operation: "order".into(),
        exchange_id: "mex-1".into(),
        body: ReplyBody::Message { payload: json!(42) },
    }));
    h.assert_drained();
}

#[test]
fn pick_on_uninitialized_correlation_without_initiate_faults() {
    let mut b = ProcessBuilder::new("pick-violation").variable("order").correlation_set("conversation");
    let body = b.add(ActivityKind::Empty);
    let root = order_pick(&mut b, false, body);
    let mut h = Harness::new(b.build(root).unwrap());

    h.start();

    assert_eq!(h.fault().name, correlation_violation());
    h.assert_drained();
}

#[test]
fn pick_alarm_runs_the_alarm_branch() {
    let mut b = ProcessBuilder::new("pick-alarm").variable("order").variable("timedOut");
    let on_message = b.add(ActivityKind::Empty);
    let on_alarm = assign_literal(&mut b, "timedOut", json!(true));
    let root = b.add(ActivityKind::Pick {
        on_message: vec![OnMessage {
            partner: "shop".into(),
            operation: "order".into(),
            variable: Some("order".into()),
            correlation: None,
            activity: on_message,
        }],
        on_alarm: Some(OnAlarm {
            deadline: Deadline { for_seconds: Some(60), until: None },
            activity: on_alarm,
        }),
    });
    let mut h = Harness::new(b.build(root).unwrap());

    h.start();
    let alarm = h.registered_timers()[0];
    let (response, _) = h
        .soup
        .awaited_external_channels()
        .into_iter()
        .find(|(_, kind)| *kind == ChannelKind::PickResponse)
        .unwrap();

    h.deliver(alarm, Message::TimerFired);

    assert_eq!(h.outcome(), Some(&InstanceOutcome::Completed));
    assert_eq!(h.variable("timedOut"), Some(&json!(true)));
    assert!(h.variable("order").is_none());
    h.assert_drained();

    let late = Message::PickResponse { selector: 0, exchange_id: "late".into(), payload: json!({}) };
    assert_eq!(h.deliver(response, late), PostOutcome::Dropped);
}

fn select_responses(h: &Harness) -> Vec<ChannelId> {
    h.context
        .effects()
        .iter()
        .filter_map(|e| match e {
            Effect::Select { response, .. } => Some(*response),
            _ => None,
        })
        .collect()
}

#[test]
fn second_receive_on_an_unanswered_operation_faults() {
    let mut b = ProcessBuilder::new("double-receive");
    let receive = |b: &mut ProcessBuilder| {
        let body = b.add(ActivityKind::Empty);
        b.add(ActivityKind::Pick {
            on_message: vec![OnMessage {
                partner: "shop".into(),
                operation: "order".into(),
                variable: None,
                correlation: None,
                activity: body,
            }],
            on_alarm: None,
        })
    };
    let first = receive(&mut b);
    let second = receive(&mut b);
    let root = b.add(ActivityKind::Sequence { children: vec![first, second] });
    let mut h = Harness::new(b.build(root).unwrap());

    h.start();
    let first_response = select_responses(&h)[0];
    let message = |id: &str| Message::PickResponse { selector: 0, exchange_id: id.into(), payload: json!({}) };
    assert_eq!(h.deliver(first_response, message("mex-1")), PostOutcome::Matched);
    assert!(h.outcome().is_none());

    let second_response = select_responses(&h)[1];
    assert_eq!(h.deliver(second_response, message("mex-2")), PostOutcome::Matched);

    assert_eq!(h.fault().name, conflicting_request());
    h.assert_drained();
    // the first exchange is still the one awaiting a reply
    let mut soup = h.soup.clone();
    assert_eq!(soup.take_request("shop", "order").as_deref(), Some("mex-1"));
}

#[test]
fn reply_without_an_open_request_faults() {
    let mut b = ProcessBuilder::new("stray-reply");
    let root = b.add(ActivityKind::Reply {
        partner: "shop".into(),
        operation: "order".into(),
        variable: None,
        fault_name: None,
    });
    let mut h = Harness::new(b.build(root).unwrap());

    h.start();

    assert_eq!(h.fault().name, missing_request());
    h.assert_drained();
}

#[test]
fn exit_terminates_the_whole_instance() {
    let mut b = ProcessBuilder::new("exit");
    let exit = b.add(ActivityKind::Exit);
    let w = wait_secs(&mut b, 3600);
    let root = b.add(ActivityKind::Flow { children: vec![exit, w] });
    let mut h = Harness::new(b.build(root).unwrap());

    h.start();

    assert_eq!(h.outcome(), Some(&InstanceOutcome::Terminated));
    assert!(h.events().contains(&&InstanceEvent::ProcessTerminated));
    assert_eq!(h.registered_timers(), h.cancelled_timers());
    h.assert_drained();
}

#[test]
fn exit_as_the_root_activity_terminates() {
    let mut b = ProcessBuilder::new("exit-root");
    let root = b.add(ActivityKind::Exit);
    let mut h = Harness::new(b.build(root).unwrap());

    h.start();

    assert_eq!(h.outcome(), Some(&InstanceOutcome::Terminated));
    h.assert_drained();
}

// ----- channel runtime guarantees --------------------------------------------

#[test]
fn idle_step_changes_nothing() {
    let mut b = ProcessBuilder::new("idle");
    let root = wait_secs(&mut b, 30);
    let mut h = Harness::new(b.build(root).unwrap());
    h.start();
    let before = h.soup.serialize().unwrap();
    let effects = h.context.effects().len();

    assert!(!h.runtime().execute_step().unwrap());

    assert_eq!(h.soup.serialize().unwrap(), before);
    assert_eq!(h.context.effects().len(), effects);
}

#[test]
fn step_budget_is_enforced() {
    let mut b = ProcessBuilder::new("budget");
    let children: Vec<NodeId> = (0..5).map(|_| b.add(ActivityKind::Empty)).collect();
    let root = b.add(ActivityKind::Sequence { children });
    let mut h = Harness::new(b.build(root).unwrap());
    h.config.max_steps_per_pass = 3;

    let mut rt = h.runtime();
    rt.inject(Continuation::Process).unwrap();
    let err = rt.run_to_quiescence().unwrap_err();

    assert!(matches!(err, EngineError::StepBudgetExceeded { budget: 3 }));
}

#[test]
fn channel_capabilities_are_enforced() {
    let mut b = ProcessBuilder::new("capability");
    let root = wait_secs(&mut b, 30);
    let mut h = Harness::new(b.build(root).unwrap());
    h.start();
    let timer = h.registered_timers()[0];
    let root_termination = h.soup.root_termination().unwrap();

    let mut rt = h.runtime();
    let err = rt.post(timer, Message::Terminate).unwrap_err();
    assert!(matches!(err, EngineError::ChannelCapability { kind: ChannelKind::Timer, .. }));
    let err = rt.post(root_termination, Message::TimerFired).unwrap_err();
    assert!(matches!(err, EngineError::ChannelCapability { kind: ChannelKind::Termination, .. }));
}

#[test]
fn posting_to_a_never_issued_channel_is_an_error() {
    let mut b = ProcessBuilder::new("unknown-channel");
    let root = b.add(ActivityKind::Empty);
    let mut h = Harness::new(b.build(root).unwrap());
    h.start();

    let err = h.runtime().post(ChannelId(10_000), Message::TimerFired).unwrap_err();

    assert!(matches!(err, EngineError::UnknownChannel(ChannelId(10_000))));
}

#[test]
fn terminating_the_root_stops_a_waiting_instance() {
    let mut b = ProcessBuilder::new("terminate");
    let w = wait_secs(&mut b, 3600);
    let root = b.add(ActivityKind::Sequence { children: vec![w] });
    let mut h = Harness::new(b.build(root).unwrap());
    h.start();
    let root_termination = h.soup.root_termination().unwrap();

    assert_eq!(h.deliver(root_termination, Message::Terminate), PostOutcome::Matched);

    assert_eq!(h.outcome(), Some(&InstanceOutcome::Terminated));
    assert_eq!(h.registered_timers(), h.cancelled_timers());
    h.assert_drained();
}

// ----- custom execution context ----------------------------------------------

/// Answers invocations synchronously and records everything else in an `InstanceContext`
struct ScriptedPartner {
    inner: InstanceContext,
    answer: ContextResult<Value>,
    /// Fixed clock; the wall clock when unset
    clock: Option<DateTime<Utc>>,
}

impl ExecutionContext for ScriptedPartner {
    fn instance_id(&self) -> Uuid {
        self.inner.instance_id()
    }
    fn now(&self) -> DateTime<Utc> {
        self.clock.unwrap_or_else(|| self.inner.now())
    }
    fn is_variable_initialized(&self, var: &VariableRef) -> bool {
        self.inner.is_variable_initialized(var)
    }
    fn read_variable(&self, var: &VariableRef) -> ContextResult<Value> {
        self.inner.read_variable(var)
    }
    fn initialize_variable(&mut self, var: &VariableRef, value: Value) {
        self.inner.initialize_variable(var, value)
    }
    fn commit_variable(&mut self, var: &VariableRef, value: Value) {
        self.inner.commit_variable(var, value)
    }
    fn is_correlation_initialized(&self, cset: &CorrelationRef) -> bool {
        self.inner.is_correlation_initialized(cset)
    }
    fn read_correlation(&self, cset: &CorrelationRef) -> Option<CorrelationKey> {
        self.inner.read_correlation(cset)
    }
    fn write_correlation(&mut self, cset: &CorrelationRef, key: CorrelationKey) {
        self.inner.write_correlation(cset, key)
    }
    fn invoke(&mut self, _partner: &str, _operation: &str, _payload: Value, _response: ChannelId)
        -> ContextResult<InvokeOutcome> {
        self.answer.clone().map(|response| InvokeOutcome::Completed { response })
    }
    fn reply(&mut self, partner: &str, operation: &str, exchange_id: &str, body: ReplyBody) -> ContextResult<()> {
        self.inner.reply(partner, operation, exchange_id, body)
    }
    fn register_timer(&mut self, timer: ChannelId, fire_at: DateTime<Utc>) {
        self.inner.register_timer(timer, fire_at)
    }
    fn cancel_timer(&mut self, timer: ChannelId) {
        self.inner.cancel_timer(timer)
    }
    fn select(&mut self, response: ChannelId, timeout: Option<DateTime<Utc>>, selectors: &[Selector])
        -> ContextResult<()> {
        self.inner.select(response, timeout, selectors)
    }
    fn send_event(&mut self, event: InstanceEvent) {
        self.inner.send_event(event)
    }
    fn completed_ok(&mut self) {
        self.inner.completed_ok()
    }
    fn completed_fault(&mut self, fault: &FaultSignal) {
        self.inner.completed_fault(fault)
    }
    fn terminated(&mut self) {
        self.inner.terminated()
    }
}

fn run_invoke_with(answer: ContextResult<Value>) -> (Soup, ScriptedPartner) {
    let mut b = ProcessBuilder::new("sync-invoke").variable("request").variable("reply");
    let init = assign_literal(&mut b, "request", json!("ping"));
    let call = b.add(ActivityKind::Invoke {
        partner: "echo".into(),
        operation: "call".into(),
        input_variable: "request".into(),
        output_variable: Some("reply".into()),
    });
    let root = b.add(ActivityKind::Sequence { children: vec![init, call] });
    let definition = b.build(root).unwrap();

    let mut soup = Soup::new();
    let mut context = ScriptedPartner { inner: InstanceContext::new(Uuid::new_v4()), answer, clock: None };
    let config = EngineConfig { max_steps_per_pass: 1_000 };
    {
        let mut rt = ChannelRuntime::new(&mut soup, &definition, &mut context, &config);
        rt.inject(Continuation::Process).unwrap();
        rt.run_to_quiescence().unwrap();
    }
    (soup, context)
}

#[test]
fn synchronous_invoke_completes_in_the_same_pass() {
    let (soup, context) = run_invoke_with(Ok(json!("pong")));

    assert_eq!(soup.outcome(), Some(&InstanceOutcome::Completed));
    let reply = VariableRef { scope: PROCESS_SCOPE, name: "reply".into() };
    assert_eq!(context.inner.variable(&reply), Some(&json!("pong")));
    assert!(soup.is_complete());
}

#[test]
fn invoke_rejected_by_the_context_faults() {
    let rejection = bpelway::runtime::context::ContextFault::new(invoke_failure());
    let (soup, _) = run_invoke_with(Err(rejection));

    match soup.outcome() {
        Some(InstanceOutcome::Faulted { fault }) => assert_eq!(fault.name, invoke_failure()),
        other => panic!("expected invokeFailure, got {:?}", other),
    }
    assert!(soup.is_complete());
}

#[test]
fn wait_past_the_end_of_the_calendar_faults_instead_of_arming() {
    let mut b = ProcessBuilder::new("end-of-time");
    let root = wait_secs(&mut b, 60);
    let definition = b.build(root).unwrap();

    let mut soup = Soup::new();
    let mut context = ScriptedPartner {
        inner: InstanceContext::new(Uuid::new_v4()),
        answer: Ok(Value::Null),
        clock: Some(DateTime::<Utc>::MAX_UTC),
    };
    let config = EngineConfig { max_steps_per_pass: 1_000 };
    {
        let mut rt = ChannelRuntime::new(&mut soup, &definition, &mut context, &config);
        rt.inject(Continuation::Process).unwrap();
        rt.run_to_quiescence().unwrap();
    }

    match soup.outcome() {
        Some(InstanceOutcome::Faulted { fault }) => assert_eq!(fault.name, invalid_expression_value()),
        other => panic!("expected invalidExpressionValue, got {:?}", other),
    }
    assert!(!context.inner.effects().iter().any(|e| matches!(e, Effect::RegisterTimer { .. })));
    assert!(soup.is_complete());
}
