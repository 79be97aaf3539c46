use gbs_trace::{parse_event_line, CallId, Trace, TraceError, TraceEvent};
use serde_json::json;

fn call(parent: Option<CallId>, id: CallId, name: &str) -> TraceEvent {
    TraceEvent::Call {
        parent,
        id,
        name: name.to_string(),
        asm_name: name.to_string(),
        args: json!({}),
    }
}

fn ret(id: CallId, v: i64) -> TraceEvent {
    TraceEvent::Return { id, ret: json!(v) }
}

// main -> fib(2) -> { fib(1), fib(0) }
fn fib_events() -> Vec<TraceEvent> {
    vec![
        call(None, 1, "main"),
        call(Some(1), 2, "fib"),
        call(Some(2), 3, "fib"),
        ret(3, 1),
        call(Some(2), 4, "fib"),
        ret(4, 0),
        ret(2, 1),
        ret(1, 0),
    ]
}

/// Canonical shape: (name, return, children...) rooted at each root.
fn shape(trace: &Trace, id: CallId) -> String {
    let rec = trace.get(id).expect("record");
    let kids: Vec<String> = trace.children(id).map(|c| shape(trace, c.id)).collect();
    format!("{}={:?}[{}]", rec.name, rec.ret, kids.join(","))
}

#[test]
fn builds_call_tree() {
    let trace = Trace::from_events(fib_events()).expect("trace");
    assert_eq!(trace.len(), 4);

    let roots: Vec<CallId> = trace.roots().map(|r| r.id).collect();
    assert_eq!(roots, vec![1]);

    let fib = trace.get(2).expect("fib");
    assert_eq!(fib.parent, Some(1));
    assert_eq!(fib.children, vec![3, 4]);
    assert_eq!(fib.ret, Some(json!(1)));
    assert_eq!(trace.parent(3).map(|p| p.id), Some(2));
}

#[test]
fn return_value_unset_until_return_event() {
    let mut trace = Trace::default();
    trace.apply(call(None, 7, "f")).expect("call");
    assert_eq!(trace.get(7).and_then(|r| r.ret.clone()), None);
    trace.apply(ret(7, 42)).expect("return");
    assert_eq!(trace.get(7).and_then(|r| r.ret.clone()), Some(json!(42)));
}

#[test]
fn function_called_yields_call_order() {
    let trace = Trace::from_events(fib_events()).expect("trace");
    let ids: Vec<CallId> = trace.function_called("fib").iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![2, 3, 4]);

    let ids: Vec<CallId> = trace
        .function_called(["main", "fib"])
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);

    assert!(trace.function_called("printf").is_empty());
}

#[test]
fn reconstruction_is_order_independent() {
    let reference = Trace::from_events(fib_events()).expect("trace");

    // Sibling fib(0) is reported before fib(1) and returns are deferred.
    let shuffled = vec![
        call(None, 1, "main"),
        call(Some(1), 2, "fib"),
        call(Some(2), 4, "fib"),
        call(Some(2), 3, "fib"),
        ret(4, 0),
        ret(2, 1),
        ret(3, 1),
        ret(1, 0),
    ];
    let other = Trace::from_events(shuffled).expect("trace");

    assert_eq!(shape(&reference, 1), shape(&other, 1));
    assert_eq!(reference, other);
}

#[test]
fn rejects_inconsistent_streams() {
    let err = Trace::from_events(vec![ret(9, 0)]).unwrap_err();
    assert!(matches!(err, TraceError::UnknownCall(9)), "{err}");

    let err = Trace::from_events(vec![call(None, 1, "a"), call(None, 1, "b")]).unwrap_err();
    assert!(matches!(err, TraceError::DuplicateCall(1)), "{err}");

    let err = Trace::from_events(vec![call(Some(5), 1, "a")]).unwrap_err();
    assert!(
        matches!(err, TraceError::UnknownParent { id: 1, parent: 5 }),
        "{err}"
    );
}

#[test]
fn parses_driver_log_lines() {
    let lines = [
        "('call', None, 1, 'main', 'main', {})",
        "('call', 1, 2, 'add', 'add@plt', {'a': 1, 'b': 2})",
        "('return', 2, 'add', 3)",
        "('return', 1, 'main', 0)",
    ];
    let events: Vec<TraceEvent> = lines
        .iter()
        .map(|l| parse_event_line(l).expect("event"))
        .collect();
    let trace = Trace::from_events(events).expect("trace");

    let add = trace.function_called("add");
    assert_eq!(add.len(), 1);
    assert_eq!(add[0].asm_name, "add@plt");
    assert_eq!(add[0].args, json!({"a": 1, "b": 2}));
    assert_eq!(add[0].ret, Some(json!(3)));
    assert_eq!(add[0].parent, Some(1));
}

#[test]
fn parse_event_line_rejects_unknown_records() {
    assert!(parse_event_line("('enter', 1)").is_err());
    assert!(parse_event_line("('call', None, 'x', 'f', 'f', {})").is_err());
    assert!(parse_event_line("42").is_err());
}

#[test]
fn records_serialize_with_return_key() {
    let trace = Trace::from_events(fib_events()).expect("trace");
    let v = serde_json::to_value(trace.get(3).expect("record")).expect("json");
    assert_eq!(v["return"], json!(1));
    assert_eq!(v["parent"], json!(2));
    assert_eq!(v["children"], json!([]));
}
