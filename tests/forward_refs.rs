//! Forward references: sizes and conditions that depend on fields parsed later, and
//! references that can never be satisfied.

use binscope::scope::ScopeError;
use binscope::{parse, AbtRoot, Offset, ParseError, Parser, Value};

fn run(source: &str, data: &[u8]) -> Result<AbtRoot, ParseError> {
    let grammar = parse(source).expect("grammar");
    Parser::new(&grammar).expect("parser").parse(data)
}

#[test]
fn test_container_content_waits_for_later_sibling() {
    let root = run(
        "container hdr : 4 bytes { fixed payload : (../total - 1) bytes as int; }
         fixed total : 1 byte as u8;",
        &[1, 2, 0, 0, 3],
    )
    .expect("parse");
    assert!(root.errors.is_empty(), "{:?}", root.errors);
    let hdr = root.find("hdr").expect("hdr");
    assert_eq!((hdr.start, hdr.end), (Offset::ZERO, Offset::from_bytes(4)));
    let payload = &hdr.children[0];
    assert_eq!((payload.start, payload.end), (Offset::ZERO, Offset::from_bytes(2)));
    assert_eq!(payload.value, Some(Value::Int(5)));
    assert_eq!(root.find("total").map(|n| n.start), Some(Offset::from_bytes(4)));
    assert_eq!(root.end, Offset::from_bytes(5));
}

#[test]
fn test_two_forward_refs_published_out_of_order() {
    let root = run(
        "container c : 3 bytes { fixed x : (../a + ../b) bytes; }
         fixed b : 1 byte as u8;
         fixed a : 1 byte as u8;",
        &[9, 9, 9, 2, 1],
    )
    .expect("parse");
    assert!(root.errors.is_empty(), "{:?}", root.errors);
    let x = root.find("x").expect("x");
    assert_eq!((x.start, x.end), (Offset::ZERO, Offset::from_bytes(3)));
    assert_eq!(root.end, Offset::from_bytes(5));
}

#[test]
fn test_second_forward_ref_never_arrives() {
    let root = run(
        "container c : 3 bytes { fixed x : (../a + ../zz) bytes; }
         fixed a : 1 byte as u8;",
        &[9, 9, 9, 1],
    )
    .expect("parse");
    let x = root.find("x").expect("x");
    assert_eq!(x.error.as_deref(), Some("cannot resolve size: ../zz is unresolved"));
    assert_eq!(root.find("c").map(|c| c.children.len()), Some(1));
    assert_eq!(
        root.errors,
        vec!["x: cannot resolve size: ../zz is unresolved".to_string()]
    );
}

#[test]
fn test_condition_waits_for_later_field() {
    let root = run(
        "container head : 1 byte { if (../mode) { fixed wide : 1 byte as u8; } }
         fixed mode : 1 byte as u8;",
        &[0x42, 1],
    )
    .expect("parse");
    assert!(root.errors.is_empty(), "{:?}", root.errors);
    assert_eq!(root.find("wide").and_then(|n| n.value.clone()), Some(Value::Int(0x42)));
}

#[test]
fn test_self_dependent_size_becomes_error_node() {
    let root = run("fixed body : len bytes; fixed len : 1 byte as u8;", &[1, 2, 3]).expect("parse");
    assert_eq!(root.children.len(), 1);
    let body = &root.children[0];
    assert_eq!(body.name, "body (cannot resolve size: len is unresolved)");
    assert_eq!(body.start, body.end);
    assert_eq!(
        root.errors,
        vec!["body: cannot resolve size: len is unresolved".to_string()]
    );
    assert_eq!(root.end, Offset::ZERO);
}

#[test]
fn test_unresolved_size_inside_container_still_closes_it() {
    let root = run("container c { fixed x : missing bytes; } fixed tail : 1 byte;", &[9]).expect("parse");
    let c = root.find("c").expect("c");
    assert_eq!((c.start, c.end), (Offset::ZERO, Offset::ZERO));
    assert_eq!(c.children[0].label(), "x");
    assert!(c.children[0].error.is_some());
    assert_eq!(root.find("tail").map(|n| n.end), Some(Offset::from_bytes(1)));
    assert_eq!(
        root.errors,
        vec!["x: cannot resolve size: missing is unresolved".to_string()]
    );
}

#[test]
fn test_unresolved_condition_stops_branch() {
    let root = run("if (later) { fixed a : 1 byte; } fixed later : 1 byte as u8;", &[1, 2]).expect("parse");
    assert_eq!(root.children.len(), 1);
    assert_eq!(root.children[0].error.as_deref(), Some("cannot resolve condition: later is unresolved"));
}

#[test]
fn test_parent_path_leaves_iteration_context() {
    let root = run(
        "fixed unit : 1 byte as u8;
         repeat rows until { fixed : 1 byte [zero]; } do { fixed cell : ../unit bytes; }",
        &[2, 1, 1, 3, 3, 0],
    )
    .expect("parse");
    assert!(root.errors.is_empty(), "{:?}", root.errors);
    let cells: Vec<(Offset, Offset)> = root
        .nodes()
        .into_iter()
        .filter(|n| n.label() == "cell")
        .map(|n| (n.start, n.end))
        .collect();
    assert_eq!(
        cells,
        vec![
            (Offset::from_bytes(1), Offset::from_bytes(3)),
            (Offset::from_bytes(3), Offset::from_bytes(5)),
        ]
    );
}

#[test]
fn test_child_path_reads_into_named_scope() {
    let root = run(
        "container hdr { fixed len : 1 byte as u8; }
         fixed body : hdr/len bytes;",
        &[2, 0xAA, 0xBB],
    )
    .expect("parse");
    let body = root.find("body").expect("body");
    assert_eq!((body.start, body.end), (Offset::from_bytes(1), Offset::from_bytes(3)));
}

#[test]
fn test_division_by_zero_is_reported_like_unresolved() {
    let root = run("fixed d : 1 byte as u8; fixed x : (4 / d) bytes;", &[0, 1]).expect("parse");
    let x = root.find("x").expect("x");
    assert_eq!(x.error.as_deref(), Some("cannot resolve size: Division by zero"));
}

#[test]
fn test_unknown_scope_path_is_fatal() {
    let err = run("fixed x : nothere/len bytes;", &[1]).unwrap_err();
    assert!(matches!(err, ParseError::Scope(ScopeError::UnknownPath(_))));
}

#[test]
fn test_redefinition_is_fatal() {
    let err = run("fixed a : 1 byte as u8; fixed a : 1 byte as u8;", &[1, 2]).unwrap_err();
    assert!(matches!(err, ParseError::Scope(ScopeError::Redefined(ref k)) if k == "root.a"));
}
