// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! The canonical text encoding of derivations.
//!
//! ```text
//! Derive([(out,path,hashType,hashHex),…],[(drvPath,[out,…]),…],[src,…],
//!        "system","builder",[arg,…],[(envKey,envVal),…])
//! ```
//!
//! Every list is sorted ascending and strings use a fixed escape set, so
//! the encoding of a derivation is a single canonical byte sequence. The
//! parser is strict: it rejects out-of-order lists, unknown hash types and
//! invalid names, because a `.drv` that re-encodes differently would move
//! to a different store path.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::content_address::{ContentAddress, ContentAddressMethodAlgorithm};
use crate::derivation::{Derivation, DerivationOutput, OutputName};
use crate::store_path::{StoreDir, StorePath, StorePathName};
use crucible_utils_hash::fmt as hash_fmt;

#[derive(Error, Debug, PartialEq, Clone)]
pub enum ATermParseError {
    #[error("unexpected end of derivation text at byte {0}")]
    UnexpectedEof(usize),
    #[error("at byte {pos}: expected {expected}, got '{got}'")]
    Expected {
        pos: usize,
        expected: String,
        got: String,
    },
    #[error("invalid store path in derivation: {0}")]
    InvalidStorePath(String),
    #[error("invalid derivation output: {0}")]
    InvalidOutput(String),
    #[error("derivation lists must be sorted: '{unsorted}' follows '{previous}'")]
    NotCanonical { previous: String, unsorted: String },
    #[error("fixed output '{output}' declares path '{declared}' but its content address derives '{derived}'")]
    FixedOutputPathMismatch {
        output: String,
        declared: String,
        derived: String,
    },
}

// ── Serialization ───────────────────────────────────────────────────────────

/// Serialize a derivation to its canonical text.
pub fn unparse(store_dir: &StoreDir, drv: &Derivation) -> String {
    // Rendered input keys sort the same way as the paths themselves (the
    // store dir prefix is shared), so the list stays canonical.
    let inputs: BTreeMap<String, &BTreeSet<OutputName>> = drv
        .input_derivations
        .iter()
        .map(|(drv_path, outputs)| (store_dir.display(drv_path).to_string(), outputs))
        .collect();
    unparse_with(store_dir, drv, &inputs, &mut |s, output_name, output| {
        let (path, method, hash) = encode_output(store_dir, drv, output_name, output);
        write_string(s, &path);
        s.push(',');
        write_string(s, &method);
        s.push(',');
        write_string(s, &hash);
    })
}

/// Shared skeleton for [`unparse`] and the masked form used for
/// fingerprinting. The caller chooses how output fields are encoded and
/// what stands in for input derivation paths.
pub(super) fn unparse_with(
    store_dir: &StoreDir,
    drv: &Derivation,
    input_derivations: &BTreeMap<String, &BTreeSet<OutputName>>,
    encode_output_fields: &mut dyn FnMut(&mut String, &OutputName, &DerivationOutput),
) -> String {
    let mut s = String::with_capacity(4096);
    s.push_str("Derive(");

    write_list(&mut s, drv.outputs.iter(), |s, (output_name, output)| {
        s.push('(');
        write_string(s, output_name.as_str());
        s.push(',');
        encode_output_fields(s, output_name, output);
        s.push(')');
    });

    s.push(',');
    write_list(&mut s, input_derivations.iter(), |s, (key, outputs)| {
        s.push('(');
        write_string(s, key);
        s.push(',');
        write_list(s, outputs.iter(), |s, out| write_string(s, out.as_str()));
        s.push(')');
    });

    s.push(',');
    write_list(&mut s, drv.input_sources.iter(), |s, path| {
        write_string(s, &store_dir.display(path).to_string())
    });

    s.push(',');
    write_string(&mut s, &drv.system);
    s.push(',');
    write_string(&mut s, &drv.builder);

    s.push(',');
    write_list(&mut s, drv.args.iter(), |s, arg| write_string(s, arg));

    s.push(',');
    write_list(&mut s, drv.env.iter(), |s, (key, value)| {
        s.push('(');
        write_string(s, key);
        s.push(',');
        write_string(s, value);
        s.push(')');
    });

    s.push(')');
    s
}

fn encode_output(
    store_dir: &StoreDir,
    drv: &Derivation,
    output_name: &OutputName,
    output: &DerivationOutput,
) -> (String, String, String) {
    match output {
        DerivationOutput::InputAddressed(path) => (
            store_dir.display(path).to_string(),
            String::new(),
            String::new(),
        ),
        DerivationOutput::CAFixed(ca) => {
            let path = output
                .path(store_dir, drv, output_name)
                .expect("output path name is valid when the derivation name is")
                .expect("fixed outputs always derive a path");
            (
                store_dir.display(&path).to_string(),
                ca.method_algorithm().to_string(),
                ca.hash().as_base16().bare().to_string(),
            )
        }
        DerivationOutput::CAFloating(method_algo) => {
            (String::new(), method_algo.to_string(), String::new())
        }
        DerivationOutput::Deferred => (String::new(), String::new(), String::new()),
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
}

fn write_list<I, F>(out: &mut String, iter: I, mut write_item: F)
where
    I: Iterator,
    F: FnMut(&mut String, I::Item),
{
    out.push('[');
    let mut first = true;
    for item in iter {
        if !first {
            out.push(',');
        }
        first = false;
        write_item(out, item);
    }
    out.push(']');
}

// ── Parsing ─────────────────────────────────────────────────────────────────

/// Parse canonical derivation text. `name` is the derivation's base name,
/// taken from the `.drv` file name.
pub fn parse_aterm(
    store_dir: &StoreDir,
    input: &str,
    name: &StorePathName,
) -> Result<Derivation, ATermParseError> {
    let mut p = Parser::new(input);

    p.expect_str("Derive(")?;
    let raw_outputs = p.parse_outputs()?;
    p.expect_char(',')?;
    let input_derivations = p.parse_input_drvs(store_dir)?;
    p.expect_char(',')?;
    let input_sources = p.parse_input_srcs(store_dir)?;
    p.expect_char(',')?;
    let system = p.parse_string()?;
    p.expect_char(',')?;
    let builder = p.parse_string()?;
    p.expect_char(',')?;
    let args = p.parse_string_list()?;
    p.expect_char(',')?;
    let env = p.parse_env()?;
    p.expect_char(')')?;
    p.expect_end()?;

    let mut drv = Derivation {
        name: name.clone(),
        system,
        builder,
        args,
        env,
        input_sources,
        input_derivations,
        outputs: BTreeMap::new(),
    };

    // Outputs are decoded last: fixed outputs re-derive their path from the
    // content address, which needs the completed derivation name.
    let mut outputs = BTreeMap::new();
    for (output_name, path_str, method_str, hash_str) in raw_outputs {
        let output = decode_output(store_dir, &drv, &output_name, &path_str, &method_str, &hash_str)?;
        outputs.insert(output_name, output);
    }
    drv.outputs = outputs;

    Ok(drv)
}

fn decode_output(
    store_dir: &StoreDir,
    drv: &Derivation,
    output_name: &OutputName,
    path_str: &str,
    method_str: &str,
    hash_str: &str,
) -> Result<DerivationOutput, ATermParseError> {
    if !method_str.is_empty() && !hash_str.is_empty() {
        let method_algo: ContentAddressMethodAlgorithm = method_str
            .parse()
            .map_err(|e| ATermParseError::InvalidOutput(format!("{method_str}: {e}")))?;
        let hash = hash_fmt::parse(method_algo.algorithm(), hash_str)
            .map_err(|e| ATermParseError::InvalidOutput(format!("{hash_str}: {e}")))?;
        let ca = ContentAddress::from_hash(method_algo.method(), hash)
            .map_err(|e| ATermParseError::InvalidOutput(e.to_string()))?;
        let output = DerivationOutput::CAFixed(ca);

        let derived = output
            .path(store_dir, drv, output_name)
            .map_err(|e| ATermParseError::InvalidOutput(e.to_string()))?
            .expect("fixed outputs always derive a path");
        let derived_str = store_dir.display(&derived).to_string();
        if path_str != derived_str {
            return Err(ATermParseError::FixedOutputPathMismatch {
                output: output_name.to_string(),
                declared: path_str.to_owned(),
                derived: derived_str,
            });
        }
        return Ok(output);
    }
    if !method_str.is_empty() {
        let method_algo = method_str
            .parse()
            .map_err(|e| ATermParseError::InvalidOutput(format!("{method_str}: {e}")))?;
        return Ok(DerivationOutput::CAFloating(method_algo));
    }
    if path_str.is_empty() {
        return Ok(DerivationOutput::Deferred);
    }
    let store_path = store_dir
        .parse_path(path_str)
        .map_err(|e| ATermParseError::InvalidStorePath(format!("{path_str}: {e}")))?;
    Ok(DerivationOutput::InputAddressed(store_path))
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Result<char, ATermParseError> {
        self.remaining()
            .chars()
            .next()
            .ok_or(ATermParseError::UnexpectedEof(self.pos))
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
    }

    fn expect_char(&mut self, expected: char) -> Result<(), ATermParseError> {
        let got = self.peek()?;
        if got == expected {
            self.advance(expected.len_utf8());
            Ok(())
        } else {
            Err(ATermParseError::Expected {
                pos: self.pos,
                expected: format!("'{expected}'"),
                got: got.to_string(),
            })
        }
    }

    fn expect_str(&mut self, expected: &str) -> Result<(), ATermParseError> {
        if self.remaining().starts_with(expected) {
            self.advance(expected.len());
            Ok(())
        } else {
            let got_len = expected.len().min(self.remaining().len());
            Err(ATermParseError::Expected {
                pos: self.pos,
                expected: format!("{expected:?}"),
                got: self.remaining()[..got_len].to_string(),
            })
        }
    }

    fn expect_end(&mut self) -> Result<(), ATermParseError> {
        if self.remaining().is_empty() {
            Ok(())
        } else {
            Err(ATermParseError::Expected {
                pos: self.pos,
                expected: "end of input".into(),
                got: self.peek()?.to_string(),
            })
        }
    }

    fn parse_string(&mut self) -> Result<String, ATermParseError> {
        self.expect_char('"')?;
        let mut result = String::new();
        loop {
            let c = self.peek()?;
            self.advance(c.len_utf8());
            match c {
                '"' => return Ok(result),
                '\\' => {
                    let escaped = self.peek()?;
                    self.advance(escaped.len_utf8());
                    match escaped {
                        'n' => result.push('\n'),
                        'r' => result.push('\r'),
                        't' => result.push('\t'),
                        other => result.push(other),
                    }
                }
                other => result.push(other),
            }
        }
    }

    fn parse_list<T>(
        &mut self,
        mut parse_item: impl FnMut(&mut Self) -> Result<T, ATermParseError>,
    ) -> Result<Vec<T>, ATermParseError> {
        self.expect_char('[')?;
        let mut result = Vec::new();
        if self.peek()? == ']' {
            self.advance(1);
            return Ok(result);
        }
        loop {
            result.push(parse_item(self)?);
            match self.peek()? {
                ',' => self.advance(1),
                ']' => {
                    self.advance(1);
                    return Ok(result);
                }
                c => {
                    return Err(ATermParseError::Expected {
                        pos: self.pos,
                        expected: "',' or ']'".to_string(),
                        got: c.to_string(),
                    });
                }
            }
        }
    }

    fn parse_string_list(&mut self) -> Result<Vec<String>, ATermParseError> {
        self.parse_list(|p| p.parse_string())
    }

    fn parse_store_path(&mut self, store_dir: &StoreDir) -> Result<StorePath, ATermParseError> {
        let path_str = self.parse_string()?;
        store_dir
            .parse_path(&path_str)
            .map_err(|e| ATermParseError::InvalidStorePath(format!("{path_str}: {e}")))
    }

    /// Outputs as raw string 4-tuples; decoding happens after the whole
    /// derivation is parsed.
    #[allow(clippy::type_complexity)]
    fn parse_outputs(
        &mut self,
    ) -> Result<Vec<(OutputName, String, String, String)>, ATermParseError> {
        let items = self.parse_list(|p| {
            p.expect_char('(')?;
            let id = p.parse_string()?;
            p.expect_char(',')?;
            let path_str = p.parse_string()?;
            p.expect_char(',')?;
            let method_str = p.parse_string()?;
            p.expect_char(',')?;
            let hash_str = p.parse_string()?;
            p.expect_char(')')?;
            let output_name: OutputName = id
                .parse()
                .map_err(|e| ATermParseError::InvalidOutput(format!("output name '{id}': {e}")))?;
            Ok((output_name, path_str, method_str, hash_str))
        })?;
        require_sorted(items.iter().map(|(name, ..)| name))?;
        Ok(items)
    }

    fn parse_input_drvs(
        &mut self,
        store_dir: &StoreDir,
    ) -> Result<BTreeMap<StorePath, BTreeSet<OutputName>>, ATermParseError> {
        let items = self.parse_list(|p| {
            p.expect_char('(')?;
            let drv_path = p.parse_store_path(store_dir)?;
            p.expect_char(',')?;
            let outputs = p.parse_list(|p| {
                let name = p.parse_string()?;
                name.parse::<OutputName>().map_err(|e| {
                    ATermParseError::InvalidOutput(format!("output name '{name}': {e}"))
                })
            })?;
            if outputs.is_empty() {
                return Err(ATermParseError::InvalidOutput(format!(
                    "input derivation '{drv_path}' requests no outputs"
                )));
            }
            require_sorted(outputs.iter())?;
            p.expect_char(')')?;
            Ok((drv_path, outputs.into_iter().collect()))
        })?;
        require_sorted(items.iter().map(|(path, _)| path))?;
        Ok(items.into_iter().collect())
    }

    fn parse_input_srcs(
        &mut self,
        store_dir: &StoreDir,
    ) -> Result<BTreeSet<StorePath>, ATermParseError> {
        let items = self.parse_list(|p| p.parse_store_path(store_dir))?;
        require_sorted(items.iter())?;
        Ok(items.into_iter().collect())
    }

    fn parse_env(&mut self) -> Result<BTreeMap<String, String>, ATermParseError> {
        let pairs = self.parse_list(|p| {
            p.expect_char('(')?;
            let key = p.parse_string()?;
            p.expect_char(',')?;
            let value = p.parse_string()?;
            p.expect_char(')')?;
            Ok((key, value))
        })?;
        require_sorted(pairs.iter().map(|(key, _)| key))?;
        Ok(pairs.into_iter().collect())
    }
}

/// Canonical text carries sorted lists; anything else re-encodes to
/// different bytes and is rejected.
fn require_sorted<T: Ord + std::fmt::Display>(
    items: impl Iterator<Item = T>,
) -> Result<(), ATermParseError> {
    let mut previous: Option<T> = None;
    for item in items {
        if let Some(prev) = &previous
            && item <= *prev
        {
            return Err(ATermParseError::NotCanonical {
                previous: prev.to_string(),
                unsorted: item.to_string(),
            });
        }
        previous = Some(item);
    }
    Ok(())
}

#[cfg(test)]
mod unittests {
    use super::*;
    use crate::derivation::test_data::hello_drv;

    fn store_dir() -> StoreDir {
        StoreDir::default()
    }

    #[test]
    fn string_escaping() {
        let mut s = String::new();
        write_string(&mut s, "hello \"world\" \\\n\r\t");
        assert_eq!(s, r#""hello \"world\" \\\n\r\t""#);

        let mut p = Parser::new(&s);
        assert_eq!(p.parse_string().unwrap(), "hello \"world\" \\\n\r\t");
    }

    /// The canonical bytes of the floating hello derivation.
    #[test]
    fn hello_aterm_fixture() {
        let text = unparse(&store_dir(), &hello_drv());
        assert_eq!(
            text,
            concat!(
                r#"Derive([("out","","r:sha256","")],[],[],"x86_64-linux","/bin/sh","#,
                r#"["-c","echo 'Hello' > $out"],"#,
                r#"[("out","/1rz4g4znpzjwh1xymhjpm42vipw92pr73vdgl6xs1hycac8kf2n9")])"#,
            )
        );
    }

    #[test]
    fn roundtrip_hello() {
        let drv = hello_drv();
        let text = unparse(&store_dir(), &drv);
        let parsed = parse_aterm(&store_dir(), &text, &drv.name).unwrap();
        assert_eq!(parsed, drv);
        assert_eq!(unparse(&store_dir(), &parsed), text);
    }

    #[test]
    fn roundtrip_with_inputs() {
        let original = concat!(
            r#"Derive([("out","/nix/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-foo","","")]"#,
            r#",[("/nix/store/bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-bar.drv",["dev","out"])]"#,
            r#",["/nix/store/cccccccccccccccccccccccccccccccc-src"]"#,
            r#","x86_64-linux","/bin/sh",[],[("name","foo")])"#,
        );
        let name: StorePathName = "foo".parse().unwrap();
        let drv = parse_aterm(&store_dir(), original, &name).unwrap();
        assert_eq!(drv.input_sources.len(), 1);
        assert_eq!(drv.input_derivations.len(), 1);
        assert_eq!(unparse(&store_dir(), &drv), original);
    }

    #[test]
    fn unsorted_env_rejected() {
        let text = concat!(
            r#"Derive([("out","","r:sha256","")],[],[],"s","b",[],"#,
            r#"[("zeta","1"),("alpha","2")])"#,
        );
        let name: StorePathName = "x".parse().unwrap();
        let err = parse_aterm(&store_dir(), text, &name).unwrap_err();
        assert!(matches!(err, ATermParseError::NotCanonical { .. }));
    }

    #[test]
    fn unsorted_outputs_rejected() {
        let text = concat!(
            r#"Derive([("out","","r:sha256",""),("dev","","r:sha256","")],"#,
            r#"[],[],"s","b",[],[])"#,
        );
        let name: StorePathName = "x".parse().unwrap();
        let err = parse_aterm(&store_dir(), text, &name).unwrap_err();
        assert!(matches!(err, ATermParseError::NotCanonical { .. }));
    }

    #[test]
    fn unknown_hash_type_rejected() {
        let text = r#"Derive([("out","","r:sha384","")],[],[],"s","b",[],[])"#;
        let name: StorePathName = "x".parse().unwrap();
        let err = parse_aterm(&store_dir(), text, &name).unwrap_err();
        assert!(matches!(err, ATermParseError::InvalidOutput(_)));
    }

    #[test]
    fn empty_input_drv_outputs_rejected() {
        let text = concat!(
            r#"Derive([("out","","r:sha256","")],"#,
            r#"[("/nix/store/bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-bar.drv",[])],"#,
            r#"[],"s","b",[],[])"#,
        );
        let name: StorePathName = "x".parse().unwrap();
        let err = parse_aterm(&store_dir(), text, &name).unwrap_err();
        assert!(matches!(err, ATermParseError::InvalidOutput(_)));
    }

    #[test]
    fn fixed_output_path_is_verified() {
        // Declared path disagrees with the content address.
        let text = concat!(
            r#"Derive([("out","/nix/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-x","sha256","#,
            r#""ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")],"#,
            r#"[],[],"s","b",[],[])"#,
        );
        let name: StorePathName = "x".parse().unwrap();
        let err = parse_aterm(&store_dir(), text, &name).unwrap_err();
        assert!(matches!(err, ATermParseError::FixedOutputPathMismatch { .. }));
    }

    #[test]
    fn fixed_output_roundtrip() {
        let ca: ContentAddress =
            "fixed:sha256:1b8m03r63zqhnjf7l5wnldhh7c134ap5vpj0850ymkq1iyzicy5s"
                .parse()
                .unwrap();
        let mut drv = hello_drv();
        drv.outputs = BTreeMap::from([(OutputName::default(), DerivationOutput::CAFixed(ca))]);
        let text = unparse(&store_dir(), &drv);
        let parsed = parse_aterm(&store_dir(), &text, &drv.name).unwrap();
        assert_eq!(parsed.outputs, drv.outputs);
    }

    #[test]
    fn no_outputs_has_two_empty_lists() {
        let mut drv = hello_drv();
        drv.outputs = BTreeMap::new();
        drv.env = BTreeMap::new();
        let text = unparse(&store_dir(), &drv);
        assert!(text.starts_with("Derive([],[],"));
    }

    #[test]
    fn trailing_garbage_rejected() {
        let drv = hello_drv();
        let mut text = unparse(&store_dir(), &drv);
        text.push_str("garbage");
        assert!(parse_aterm(&store_dir(), &text, &drv.name).is_err());
    }
}

#[cfg(test)]
mod proptests {
    use std::collections::{BTreeMap, BTreeSet};

    use proptest::prelude::*;

    use super::*;
    use crate::derivation::Derivation;

    fn arb_text() -> impl Strategy<Value = String> {
        proptest::collection::vec(
            prop_oneof![
                8 => proptest::char::range('a', 'z'),
                2 => proptest::char::range('0', '9'),
                1 => Just(' '),
                1 => Just('"'),
                1 => Just('\\'),
                1 => Just('\n'),
                1 => Just('\t'),
                1 => Just('$'),
            ],
            0..40,
        )
        .prop_map(|chars| chars.into_iter().collect())
    }

    fn arb_store_path() -> impl Strategy<Value = StorePath> {
        (
            proptest::collection::vec(
                proptest::sample::select(
                    crucible_utils_base_encoding::base32::ALPHABET
                        .chars()
                        .collect::<Vec<_>>(),
                ),
                32,
            ),
            "[a-z][a-z0-9.-]{0,20}",
        )
            .prop_map(|(digest, name)| {
                let digest: String = digest.into_iter().collect();
                format!("{digest}-{name}").parse().unwrap()
            })
    }

    fn arb_derivation() -> impl Strategy<Value = Derivation> {
        (
            proptest::collection::btree_map(
                "[a-z][a-z0-9]{0,8}",
                Just(()),
                1..4,
            ),
            proptest::collection::btree_map(
                arb_store_path(),
                proptest::collection::btree_set("[a-z][a-z0-9]{0,8}", 1..3),
                0..3,
            ),
            proptest::collection::btree_set(arb_store_path(), 0..3),
            arb_text(),
            arb_text(),
            proptest::collection::vec(arb_text(), 0..4),
            proptest::collection::btree_map("[a-zA-Z_][a-zA-Z0-9_]{0,12}", arb_text(), 0..6),
        )
            .prop_map(
                |(outputs, input_drvs, input_sources, system, builder, args, env)| Derivation {
                    name: "prop-test".parse().unwrap(),
                    system,
                    builder,
                    args,
                    env,
                    input_sources,
                    input_derivations: input_drvs
                        .into_iter()
                        .map(|(path, outs)| {
                            (
                                path,
                                outs.into_iter()
                                    .map(|o| o.parse::<OutputName>().unwrap())
                                    .collect::<BTreeSet<_>>(),
                            )
                        })
                        .collect(),
                    outputs: outputs
                        .into_keys()
                        .map(|name| {
                            (name.parse::<OutputName>().unwrap(), DerivationOutput::Deferred)
                        })
                        .collect::<BTreeMap<_, _>>(),
                },
            )
    }

    proptest! {
        /// parse(unparse(d)) == d, and re-encoding is byte-identical.
        #[test]
        fn roundtrip(drv in arb_derivation()) {
            let store_dir = StoreDir::default();
            let text = unparse(&store_dir, &drv);
            let parsed = parse_aterm(&store_dir, &text, &drv.name)
                .unwrap_or_else(|e| panic!("failed to parse: {e}\ntext: {text}"));
            prop_assert_eq!(&parsed, &drv);
            prop_assert_eq!(unparse(&store_dir, &parsed), text);
        }

        #[test]
        fn escaping_roundtrip(s in arb_text()) {
            let mut buf = String::new();
            write_string(&mut buf, &s);
            let mut p = Parser::new(&buf);
            prop_assert_eq!(p.parse_string().unwrap(), s);
        }
    }
}
