//! Tokenising and indentation-driven parsing shared by the three config-file
//! readers in `database::loader` and by the command grammar in `dispatch`.
//!
//! Grounded in the hand-rolled `nom` combinator style of the teacher
//! workspace's key-value parser: small, named combinators composed with
//! `nom::sequence`/`nom::combinator`, a dedicated error enum per parser
//! rather than bare `String`s.

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::bytes::complete::take_while;
use nom::bytes::complete::take_while1;
use nom::character::complete::char;
use nom::character::complete::digit1;
use nom::character::complete::hex_digit1;
use nom::combinator::map_res;
use nom::combinator::opt;
use nom::combinator::recognize;
use nom::sequence::pair;
use nom::sequence::preceded;
use nom::IResult;

pub const MAX_IDENT_LEN: usize = 20;

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_cont(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// `[A-Za-z_][A-Za-z0-9_]*`, at most `MAX_IDENT_LEN` characters (spec.md §6).
pub fn identifier(input: &str) -> IResult<&str, &str> {
    let (rest, id) = recognize(pair(
        nom::character::complete::satisfy(is_ident_start),
        take_while(is_ident_cont),
    ))(input)?;
    if id.len() > MAX_IDENT_LEN {
        return Err(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::TooLarge,
        )));
    }
    Ok((rest, id))
}

/// Unsigned decimal or `0x`-prefixed hexadecimal integer, per spec.md §6
/// ("Numbers are decimal unless prefixed `0x`").
pub fn uint_literal(input: &str) -> IResult<&str, u64> {
    alt((
        preceded(tag("0x"), map_res(hex_digit1, |s| u64::from_str_radix(s, 16))),
        map_res(digit1, |s: &str| s.parse::<u64>()),
    ))(input)
}

/// A signed decimal integer (no hex form — the protocol-level `int`/`scalar`
/// types parse signed values straight off the wire, not out of config
/// files, so this is the "value on the wire" rule of spec.md §4.3).
pub fn signed_decimal(input: &str) -> IResult<&str, i64> {
    map_res(
        recognize(pair(opt(char('-')), digit1)),
        |s: &str| s.parse::<i64>(),
    )(input)
}

pub fn ws0(input: &str) -> IResult<&str, &str> {
    take_while(|c: char| c == ' ' || c == '\t')(input)
}

pub fn ws1(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c == ' ' || c == '\t')(input)
}

/// Strips a `#`-introduced trailing comment (spec.md §6) and any trailing
/// whitespace, leaving the raw line content with its leading indentation
/// intact (indentation is measured on the *original* line, before this
/// strips anything, by `split_indented_lines` below).
fn strip_comment(line: &str) -> &str {
    let content = match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    };
    content.trim_end()
}

/// One physical line of an indented config file, after comment-stripping,
/// with its indentation depth resolved to a small integer and its blank/
/// comment-only lines dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndentedLine {
    /// 0 = no leading whitespace, 1 = one level of indentation, ...
    pub indent: usize,
    pub text: String,
    pub line_no: usize,
}

/// Splits file content into non-blank, comment-stripped lines with a
/// resolved indent level. Indent levels are assigned by the *set* of
/// distinct leading-whitespace widths seen so far in the file: the
/// smallest is level 0, the next smallest level 1, and so on. This matches
/// indented formats where indentation is significant but its exact column
/// width is not fixed in advance (spec.md §6: "leading whitespace is
/// significant", depth capped at 2 for `config` and 1 for the other two
/// files — enforced by the caller, not here).
pub fn split_indented_lines(text: &str) -> Vec<IndentedLine> {
    let mut raw = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let stripped = strip_comment(line);
        if stripped.trim().is_empty() {
            continue;
        }
        let width = stripped.len() - stripped.trim_start().len();
        raw.push((width, stripped.trim_start().to_string(), i + 1));
    }

    let mut widths: Vec<usize> = raw.iter().map(|(w, _, _)| *w).collect();
    widths.sort_unstable();
    widths.dedup();

    raw.into_iter()
        .map(|(w, text, line_no)| IndentedLine {
            indent: widths.binary_search(&w).unwrap(),
            text,
            line_no,
        })
        .collect()
}

/// Splits a line's content on whitespace, honoring no quoting (none of the
/// three config file grammars need it — unlike the command grammar's `=`
/// value, which is taken verbatim and is handled separately in `dispatch`).
pub fn split_fields(text: &str) -> Vec<&str> {
    text.split_whitespace().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_identifiers() {
        assert_eq!(identifier("VAL=7"), Ok(("=7", "VAL")));
        assert_eq!(identifier("_x9 "), Ok((" ", "_x9")));
        assert!(identifier("9x").is_err());
    }

    #[test]
    fn rejects_overlong_identifier() {
        let long = "a".repeat(21);
        assert!(identifier(&long).is_err());
    }

    #[test]
    fn parses_uint_literal_decimal_and_hex() {
        assert_eq!(uint_literal("123"), Ok(("", 123)));
        assert_eq!(uint_literal("0x1A"), Ok(("", 26)));
    }

    #[test]
    fn indents_by_relative_width() {
        let text = "TTLIN 6\n  VAL uint\n    RAW\nPULSE 4\n  DELAY time\n";
        let lines = split_indented_lines(text);
        assert_eq!(lines[0].indent, 0);
        assert_eq!(lines[1].indent, 1);
        assert_eq!(lines[2].indent, 2);
        assert_eq!(lines[3].indent, 0);
        assert_eq!(lines[4].indent, 1);
    }

    #[test]
    fn strips_comments_and_blank_lines() {
        let text = "# a comment\nTTLIN 6 # inline\n\n   \n";
        let lines = split_indented_lines(text);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "TTLIN 6");
    }
}
