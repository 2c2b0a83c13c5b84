//! DSL tests: syntax (parse success/failure) and the shape of the resulting grammar.

use binscope::ast::SizeValue;
use binscope::{load, parse, Constraint, InstructionKind, Unit};
use std::io::Write;

// ==================== Syntax: valid grammars ====================

#[test]
fn parse_empty_grammar() {
    let g = parse("").expect("empty grammar can parse");
    assert!(g.instructions().is_empty());
    assert!(g.codecs().is_empty());
    assert_eq!(g.node_count(), 0);
}

#[test]
fn parse_with_comments() {
    let src = r#"
// header
fixed magic : 2 bytes; /* block */
fixed version : 1 byte as u8;
"#;
    let g = parse(src).expect("parse");
    assert_eq!(g.instructions().len(), 2);
}

#[test]
fn parse_all_instruction_kinds() {
    let src = r#"
codec twice = value + value;
container hdr : 4 bytes {
    fixed id : 2 bytes as int;
    fixed flags : 4 bits;
}
repeat items until { fixed : 1 byte [zero]; } do { fixed item : 1 byte as twice; }
if extra (hdr/flags > 0) { fixed tail : 1 byte; }
"#;
    let g = parse(src).expect("parse");
    let kinds: Vec<&str> = g.instructions().iter().map(|i| i.kind_name()).collect();
    assert_eq!(kinds, vec!["container", "repeat", "if"]);
    assert_eq!(g.codecs()[0].name, "twice");
    assert_eq!(g.codecs()[0].source, "value + value");
    // hdr, id, flags, items, until-fixed, item, extra, tail
    assert_eq!(g.node_count(), 8);
    assert_eq!(g.find(6).and_then(|i| i.reference.clone()), Some("extra".to_string()));
}

#[test]
fn parse_constraints() {
    let g = parse("fixed magic : 2 bytes [equals(0x1F, 139), zero];").expect("parse");
    let InstructionKind::Fixed { constraints, codec, .. } = &g.instructions()[0].kind else {
        panic!("expected fixed");
    };
    assert!(codec.is_none());
    assert_eq!(
        constraints,
        &vec![Constraint::Equals(vec![0x1F, 0x8B]), Constraint::IsNull]
    );
}

#[test]
fn parse_size_forms() {
    let g = parse(
        "fixed a : 8 bits; fixed b : 0x10 bytes; fixed c : $a byte; fixed d : ../x/y bytes; fixed e : (a % 4) bits;",
    )
    .expect("parse");
    let sizes: Vec<(String, Unit)> = g
        .instructions()
        .iter()
        .map(|i| match &i.kind {
            InstructionKind::Fixed { size, .. } => (
                match &size.value {
                    SizeValue::Literal(n) => n.to_string(),
                    SizeValue::Expr(e) => e.source().to_string(),
                },
                size.unit,
            ),
            _ => panic!("expected fixed"),
        })
        .collect();
    assert_eq!(
        sizes,
        vec![
            ("8".to_string(), Unit::Bit),
            ("16".to_string(), Unit::Byte),
            ("$a".to_string(), Unit::Byte),
            ("../x/y".to_string(), Unit::Byte),
            ("a % 4".to_string(), Unit::Bit),
        ]
    );
}

#[test]
fn parse_three_operand_condition() {
    let g = parse("if (a - b - 1) { }").expect("parse");
    let InstructionKind::If { condition, then } = &g.instructions()[0].kind else {
        panic!("expected if");
    };
    assert!(then.is_empty());
    let names: Vec<&str> = condition.variables().iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);
}

// ==================== Syntax: invalid grammars ====================

#[test]
fn parse_missing_semicolon_fails() {
    assert!(parse("fixed a : 1 byte").is_err());
}

#[test]
fn parse_missing_unit_fails() {
    assert!(parse("fixed a : 1;").is_err());
}

#[test]
fn parse_unbalanced_block_fails() {
    assert!(parse("container c { fixed a : 1 byte;").is_err());
}

#[test]
fn parse_repeat_without_do_fails() {
    assert!(parse("repeat until { fixed : 1 byte; }").is_err());
}

#[test]
fn parse_four_operands_fails() {
    assert!(parse("if (a + b + c + d) { }").is_err());
}

#[test]
fn parse_negative_size_fails() {
    let err = parse("fixed a : (0 - 2) bytes;").unwrap_err();
    assert!(err.contains("negative"), "{}", err);
}

#[test]
fn parse_duplicate_codec_fails() {
    let err = parse("codec c = value; codec c = len;").unwrap_err();
    assert!(err.contains("defined twice"), "{}", err);
}

// ==================== Loading from disk ====================

#[test]
fn load_grammar_file() {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    writeln!(file, "container hdr {{ fixed id : 2 bytes as int; }}").expect("write");
    let g = load(file.path()).expect("load");
    assert_eq!(g.instructions().len(), 1);
    assert_eq!(g.instructions()[0].label(), "hdr");
}

#[test]
fn load_missing_file_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = load(dir.path().join("absent.grammar")).unwrap_err();
    assert!(err.starts_with("Cannot read"), "{}", err);
}
