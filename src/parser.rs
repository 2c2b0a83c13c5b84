//! Parse grammar source text into a [`Grammar`] using PEST.
//!
//! ```text
//! codec be16 = value;
//!
//! container hdr {
//!     fixed id : 2 bytes as int;
//!     fixed len : 1 byte;
//! }
//! repeat items until { fixed : 1 byte [zero]; } do { fixed : 1 byte as u8; }
//! if flag (hdr/len > 0) { fixed body : (hdr/len) bytes; }
//! ```

use crate::ast::*;
use crate::expr::Expression;
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser as PestParser;
use std::path::Path;

#[derive(PestParser)]
#[grammar = "expr.pest"]
#[grammar = "grammar.pest"]
struct GrammarParser;

/// Parse grammar source into a [`Grammar`] (instruction ids assigned in pre-order).
pub fn parse(source: &str) -> Result<Grammar, String> {
    let pairs = GrammarParser::parse(Rule::grammar_file, source)
        .map_err(|e| format!("Parse error: {}", e))?;
    let pair = pairs.into_iter().next().ok_or("Empty parse")?;
    build_grammar(pair)
}

/// Read and parse a grammar file.
pub fn load(path: impl AsRef<Path>) -> Result<Grammar, String> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path)
        .map_err(|e| format!("Cannot read {}: {}", path.display(), e))?;
    parse(&source)
}

fn build_grammar(pair: Pair<Rule>) -> Result<Grammar, String> {
    let mut instructions = Vec::new();
    let mut codecs: Vec<CodecDef> = Vec::new();
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::codec_def => {
                let def = build_codec_def(inner)?;
                if codecs.iter().any(|c| c.name == def.name) {
                    return Err(format!("codec {} defined twice", def.name));
                }
                codecs.push(def);
            }
            Rule::EOI => {}
            _ => instructions.push(build_instruction(inner)?),
        }
    }
    Ok(Grammar::new(instructions, codecs))
}

fn build_codec_def(pair: Pair<Rule>) -> Result<CodecDef, String> {
    let mut it = pair.into_inner();
    let name = it.next().ok_or("codec: missing name")?.as_str().to_string();
    let body = it.next().ok_or("codec: missing expression")?;
    // Checked here so a bad body is reported with its codec name.
    Expression::parse(body.as_str()).map_err(|e| format!("codec {}: {}", name, e))?;
    Ok(CodecDef {
        name,
        source: body.as_str().trim().to_string(),
    })
}

fn build_instruction(pair: Pair<Rule>) -> Result<Instruction, String> {
    match pair.as_rule() {
        Rule::fixed => build_fixed(pair),
        Rule::container => build_container(pair),
        Rule::repeat => build_repeat(pair),
        Rule::conditional => build_conditional(pair),
        other => Err(format!("unexpected rule {:?}", other)),
    }
}

fn build_block(pair: Pair<Rule>) -> Result<Vec<Instruction>, String> {
    pair.into_inner().map(build_instruction).collect()
}

fn build_fixed(pair: Pair<Rule>) -> Result<Instruction, String> {
    let mut reference = None;
    let mut size = None;
    let mut codec = None;
    let mut constraints = Vec::new();
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::name => reference = Some(inner.as_str().to_string()),
            Rule::size => size = Some(build_size(inner)?),
            Rule::codec_clause => {
                let name = inner.into_inner().next().ok_or("as: missing codec name")?;
                codec = Some(name.as_str().to_string());
            }
            Rule::constraint_list => {
                for c in inner.into_inner() {
                    constraints.push(build_constraint(c)?);
                }
            }
            _ => {}
        }
    }
    let mut ins = Instruction::fixed(size.ok_or("fixed: missing size")?);
    if let Some(r) = reference {
        ins = ins.with_ref(&r);
    }
    if let Some(c) = codec {
        ins = ins.with_codec(&c);
    }
    for c in constraints {
        ins = ins.with_constraint(c);
    }
    Ok(ins)
}

fn build_container(pair: Pair<Rule>) -> Result<Instruction, String> {
    let mut reference = None;
    let mut size = None;
    let mut content = Vec::new();
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::name => reference = Some(inner.as_str().to_string()),
            Rule::size => size = Some(build_size(inner)?),
            Rule::block => content = build_block(inner)?,
            _ => {}
        }
    }
    Ok(with_reference(Instruction::container(size, content), reference))
}

fn build_repeat(pair: Pair<Rule>) -> Result<Instruction, String> {
    let mut reference = None;
    let mut blocks = Vec::new();
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::name => reference = Some(inner.as_str().to_string()),
            Rule::block => blocks.push(build_block(inner)?),
            _ => {}
        }
    }
    let mut blocks = blocks.into_iter();
    let until = blocks.next().ok_or("repeat: missing until block")?;
    let body = blocks.next().ok_or("repeat: missing do block")?;
    Ok(with_reference(Instruction::repeat(until, body), reference))
}

fn build_conditional(pair: Pair<Rule>) -> Result<Instruction, String> {
    let mut reference = None;
    let mut condition = None;
    let mut then = Vec::new();
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::name => reference = Some(inner.as_str().to_string()),
            Rule::expression => condition = Some(build_expression(inner)?),
            Rule::block => then = build_block(inner)?,
            _ => {}
        }
    }
    let condition = condition.ok_or("if: missing condition")?;
    Ok(with_reference(Instruction::when(condition, then), reference))
}

fn with_reference(ins: Instruction, reference: Option<String>) -> Instruction {
    match reference {
        Some(r) => ins.with_ref(&r),
        None => ins,
    }
}

fn build_size(pair: Pair<Rule>) -> Result<Size, String> {
    let mut it = pair.into_inner();
    let value = it.next().ok_or("size: missing value")?;
    let unit = match it.next().ok_or("size: missing unit")?.as_str() {
        "bit" | "bits" => Unit::Bit,
        _ => Unit::Byte,
    };
    let expression = build_expression(value)?;
    if let Some(n) = expression.constant() {
        if n < 0 {
            return Err(format!("size must not be negative: {}", n));
        }
    }
    Ok(Size::expr(expression, unit))
}

fn build_expression(pair: Pair<Rule>) -> Result<Expression, String> {
    Expression::parse(pair.as_str()).map_err(|e| format!("{:?}: {}", pair.as_str(), e))
}

fn build_constraint(pair: Pair<Rule>) -> Result<Constraint, String> {
    let inner = pair.into_inner().next().ok_or("empty constraint")?;
    match inner.as_rule() {
        Rule::zero => Ok(Constraint::IsNull),
        Rule::equals => {
            let bytes = inner
                .into_inner()
                .map(|n| parse_byte(n.as_str()))
                .collect::<Result<Vec<u8>, String>>()?;
            Ok(Constraint::Equals(bytes))
        }
        other => Err(format!("unexpected constraint {:?}", other)),
    }
}

fn parse_byte(s: &str) -> Result<u8, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16)
    } else {
        s.parse::<u8>()
    };
    parsed.map_err(|_| format!("equals: {} is not a byte", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_blocks() {
        let g = parse(
            r#"
            container hdr {
                fixed id : 2 bytes as int;
                fixed flags : 3 bits;
            }
            "#,
        )
        .expect("parse");
        assert_eq!(g.instructions().len(), 1);
        let hdr = &g.instructions()[0];
        assert_eq!(hdr.reference.as_deref(), Some("hdr"));
        let InstructionKind::Container { size, content } = &hdr.kind else {
            panic!("expected container");
        };
        assert!(size.is_none());
        assert_eq!(content.len(), 2);
        assert_eq!(content[1].id, 2);
        let InstructionKind::Fixed { size, .. } = &content[1].kind else {
            panic!("expected fixed");
        };
        assert_eq!(size, &Size::bits(3));
    }

    #[test]
    fn size_expressions_stay_symbolic() {
        let g = parse("fixed n : 1 byte; fixed body : (n - 1) bytes; fixed tail : n bytes;")
            .expect("parse");
        let sizes: Vec<String> = g
            .instructions()
            .iter()
            .filter_map(|i| match &i.kind {
                InstructionKind::Fixed { size, .. } => Some(match &size.value {
                    SizeValue::Literal(n) => n.to_string(),
                    SizeValue::Expr(e) => e.source().to_string(),
                }),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec!["1", "n - 1", "n"]);
    }

    #[test]
    fn keywords_are_not_names() {
        assert!(parse("repeat until { } do { }").is_ok());
        assert!(parse("fixed as : 1 byte;").is_err());
    }

    #[test]
    fn equals_rejects_wide_values() {
        let err = parse("fixed : 1 byte [equals(0x100)];").unwrap_err();
        assert!(err.contains("not a byte"), "{}", err);
    }
}
