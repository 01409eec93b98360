/// Fault signals and the fault propagation rules
///
/// Business faults never surface as Rust errors: they travel as
/// `Message::Faulted` on completion channels, from the activity that raised
/// them up through its ancestors. Each composite consults the propagator to
/// decide what to do with a fault reported by a child:
/// - a Scope with an unconsumed handler picks the first matching catch
/// - a Flow records the first fault and terminates its still-running siblings
/// - the process root records it as the instance outcome, at most once

use crate::process::types::{ActivityKind, Catch, FaultHandler, NodeId, ProcessDefinition, QName};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Namespace of engine-raised standard faults
pub const STANDARD_FAULT_NS: &str = "urn:bpelway:faults";

/// Read of a variable that was never written
pub fn uninitialized_variable() -> QName {
    QName::new(STANDARD_FAULT_NS, "uninitializedVariable")
}

/// Reply without an open request for the partner operation
pub fn missing_request() -> QName {
    QName::new(STANDARD_FAULT_NS, "missingRequest")
}

/// Received message does not match an initialized correlation set
pub fn correlation_violation() -> QName {
    QName::new(STANDARD_FAULT_NS, "correlationViolation")
}

/// Partner interaction rejected by the execution context
pub fn invoke_failure() -> QName {
    QName::new(STANDARD_FAULT_NS, "invokeFailure")
}

/// JSONPath selection in an assign matched nothing
pub fn selection_failure() -> QName {
    QName::new(STANDARD_FAULT_NS, "selectionFailure")
}

/// Message received while a request for the same partner operation is still unanswered
pub fn conflicting_request() -> QName {
    QName::new(STANDARD_FAULT_NS, "conflictingRequest")
}

/// Deadline that does not resolve to a representable instant
pub fn invalid_expression_value() -> QName {
    QName::new(STANDARD_FAULT_NS, "invalidExpressionValue")
}

/// Data carried alongside a fault
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultData {
    /// Structural type of the payload, matched by typed catches
    #[serde(default)]
    pub message_type: Option<String>,
    pub payload: Value,
}

/// A named exceptional outcome of an activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultSignal {
    pub name: QName,
    /// Activity that raised the fault
    pub origin: NodeId,
    #[serde(default)]
    pub data: Option<FaultData>,
}

impl FaultSignal {
    pub fn new(name: QName, origin: NodeId) -> Self {
        Self { name, origin, data: None }
    }

    pub fn with_data(mut self, data: FaultData) -> Self {
        self.data = Some(data);
        self
    }
}

/// What a Flow must do after a child reported a fault
#[derive(Debug, PartialEq, Eq)]
pub enum FlowDisposition {
    /// First fault in this flow: record it and terminate the listed siblings
    TerminateSiblings,
    /// A fault is already recorded or the flow is terminating: drop this one
    Suppress,
}

/// Stateless fault propagation rules shared by the interpreter
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultPropagator;

impl FaultPropagator {
    /// Pick the catch block handling `fault`, in declaration order
    ///
    /// A catch matches when its name filter equals the fault name, or its type
    /// filter equals the fault data type, or it has no filter at all.
    pub fn select_catch<'h>(&self, handler: &'h FaultHandler, fault: &FaultSignal) -> Option<(usize, &'h Catch)> {
        handler
            .catches
            .iter()
            .enumerate()
            .find(|(_, catch)| Self::matches(catch, fault))
    }

    fn matches(catch: &Catch, fault: &FaultSignal) -> bool {
        match (&catch.fault_name, &catch.fault_type) {
            (None, None) => true,
            (Some(name), _) if *name == fault.name => true,
            (_, Some(ty)) => fault
                .data
                .as_ref()
                .and_then(|d| d.message_type.as_deref())
                .map_or(false, |t| t == ty),
            _ => false,
        }
    }

    /// Decide how a Flow reacts to a child fault
    pub fn on_flow_fault(&self, already_faulted: bool, terminating: bool) -> FlowDisposition {
        if already_faulted || terminating {
            FlowDisposition::Suppress
        } else {
            FlowDisposition::TerminateSiblings
        }
    }

    /// Statically find the nearest enclosing scope whose handler would catch `fault`
    ///
    /// Walks parent back-references from the origin. The runtime reaches the
    /// same scope by message passing; this lookup is used for diagnostics.
    pub fn nearest_handler(&self, definition: &ProcessDefinition, fault: &FaultSignal) -> Option<NodeId> {
        definition.enclosing_scopes(fault.origin).find_map(|scope| match &scope.kind {
            ActivityKind::Scope { fault_handler: Some(handler), .. }
                if scope.id != fault.origin && self.select_catch(handler, fault).is_some() =>
            {
                Some(scope.id)
            }
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::types::{ActivityKind, ProcessBuilder};
    use serde_json::json;

    fn catch(name: Option<QName>, ty: Option<&str>, activity: u32) -> Catch {
        Catch {
            fault_name: name,
            fault_type: ty.map(String::from),
            fault_variable: None,
            activity: NodeId(activity),
        }
    }

    #[test]
    fn first_matching_catch_wins() {
        let handler = FaultHandler {
            catches: vec![
                catch(Some(QName::new("foo", "other")), None, 1),
                catch(None, None, 2),
                catch(Some(QName::new("foo", "bar")), None, 3),
            ],
        };
        let fault = FaultSignal::new(QName::new("foo", "bar"), NodeId(0));
        let (index, chosen) = FaultPropagator.select_catch(&handler, &fault).unwrap();
        assert_eq!(index, 1);
        assert_eq!(chosen.activity, NodeId(2));
    }

    #[test]
    fn typed_catch_matches_fault_data_type() {
        let handler = FaultHandler { catches: vec![catch(None, Some("OrderError"), 7)] };
        let untyped = FaultSignal::new(QName::new("a", "b"), NodeId(0));
        assert!(FaultPropagator.select_catch(&handler, &untyped).is_none());

        let typed = untyped.with_data(FaultData {
            message_type: Some("OrderError".into()),
            payload: json!({"code": 4}),
        });
        assert!(FaultPropagator.select_catch(&handler, &typed).is_some());
    }

    #[test]
    fn flow_records_only_the_first_fault() {
        assert_eq!(FaultPropagator.on_flow_fault(false, false), FlowDisposition::TerminateSiblings);
        assert_eq!(FaultPropagator.on_flow_fault(true, false), FlowDisposition::Suppress);
        assert_eq!(FaultPropagator.on_flow_fault(false, true), FlowDisposition::Suppress);
    }

    #[test]
    fn nearest_handler_skips_non_matching_scopes() {
        let mut b = ProcessBuilder::new("nested");
        let throw = b.add(ActivityKind::Throw {
            fault_name: QName::new("foo", "bar"),
            fault_variable: None,
            fault_type: None,
        });
        let inner_handler_body = b.add(ActivityKind::Empty);
        let inner = b.add(ActivityKind::Scope {
            body: throw,
            fault_handler: Some(FaultHandler {
                catches: vec![catch(Some(QName::new("foo", "other")), None, inner_handler_body.0)],
            }),
            variables: vec![],
            correlation_sets: vec![],
        });
        let outer_handler_body = b.add(ActivityKind::Empty);
        let outer = b.add(ActivityKind::Scope {
            body: inner,
            fault_handler: Some(FaultHandler { catches: vec![catch(None, None, outer_handler_body.0)] }),
            variables: vec![],
            correlation_sets: vec![],
        });
        let def = b.build(outer).unwrap();

        let fault = FaultSignal::new(QName::new("foo", "bar"), throw);
        assert_eq!(FaultPropagator.nearest_handler(&def, &fault), Some(outer));
    }
}
