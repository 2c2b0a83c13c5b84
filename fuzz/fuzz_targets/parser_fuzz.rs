//! Parser fuzz target: the first input byte splits the rest into grammar text and data.
//! Loading must never panic; a loaded grammar is then run over the data with a step cap,
//! which must return a tree or a ParseError, never panic or hang.
//! Build with: cargo fuzz run parser_fuzz (requires nightly and cargo fuzz).

#![cfg_attr(fuzzing, no_main)]

#[cfg(fuzzing)]
use libfuzzer_sys::fuzz_target;

#[cfg(fuzzing)]
fuzz_target!(|data: &[u8]| {
    let Some((split, rest)) = data.split_first() else {
        return;
    };
    let (text, input) = rest.split_at((*split as usize).min(rest.len()));
    let Ok(source) = std::str::from_utf8(text) else {
        return;
    };
    let Ok(grammar) = binscope::parse(source) else {
        return;
    };
    let Ok(parser) = binscope::Parser::new(&grammar) else {
        return;
    };
    let config = binscope::ParserConfig::default().with_max_steps(10_000);
    let _ = parser.with_config(config).parse(input);
});

#[cfg(not(fuzzing))]
fn main() {
    eprintln!("Build with: cargo fuzz run parser_fuzz");
}
