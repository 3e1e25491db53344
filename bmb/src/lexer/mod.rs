//! Lexer implementation using logos

mod token;

pub use token::Token;

use crate::ast::Span;
use crate::error::{CompileError, Result};
use logos::Logos;

/// Tokenize source code
///
/// Produces tokens in strict source order; every span covers both start
/// and end byte offsets. Escape sequences inside string and character
/// literals are already processed.
pub fn tokenize(source: &str) -> Result<Vec<(Token, Span)>> {
    let mut tokens = Vec::new();
    let mut lexer = Token::lexer(source);

    while let Some(result) = lexer.next() {
        let span = Span::new(lexer.span().start, lexer.span().end);
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(_) => {
                return Err(CompileError::lexer(describe_error(lexer.slice()), span));
            }
        }
    }

    Ok(tokens)
}

/// Map an unmatched slice to a precise error message.
fn describe_error(slice: &str) -> String {
    if slice.starts_with('"') {
        if slice.len() >= 2 && slice.ends_with('"') {
            "invalid escape sequence in string literal".to_string()
        } else {
            "unterminated string literal".to_string()
        }
    } else if slice.starts_with("{-") {
        "unterminated block comment".to_string()
    } else if slice.starts_with('\'') {
        "invalid character literal".to_string()
    } else {
        format!("unexpected character: {slice:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source)
            .expect("lex should succeed")
            .into_iter()
            .map(|(t, _)| t)
            .collect()
    }

    #[test]
    fn test_keywords_and_idents() {
        let toks = kinds("fn main let foo var");
        assert_eq!(
            toks,
            vec![
                Token::Fn,
                Token::Ident("main".into()),
                Token::Let,
                Token::Ident("foo".into()),
                Token::Var,
            ]
        );
    }

    #[test]
    fn test_int_literals() {
        assert_eq!(kinds("42"), vec![Token::IntLit(42)]);
        assert_eq!(kinds("0xFF"), vec![Token::IntLit(255)]);
        assert_eq!(kinds("0b1010"), vec![Token::IntLit(10)]);
        assert_eq!(kinds("1_000_000"), vec![Token::IntLit(1_000_000)]);
    }

    #[test]
    fn test_float_literals() {
        assert_eq!(kinds("3.25"), vec![Token::FloatLit(3.25)]);
        assert_eq!(kinds("1e3"), vec![Token::FloatLit(1000.0)]);
        assert_eq!(kinds("6.022e2"), vec![Token::FloatLit(602.2)]);
    }

    #[test]
    fn test_string_escapes_processed_in_lexer() {
        let toks = kinds(r#""a\nb\tc""#);
        assert_eq!(toks, vec![Token::StringLit("a\nb\tc".into())]);

        let toks = kinds(r#""\x41\x42""#);
        assert_eq!(toks, vec![Token::StringLit("AB".into())]);
    }

    #[test]
    fn test_string_escape_bytes() {
        // Each escape is one byte in the lexed record.
        let toks = kinds(r#""\n\r\t\"\\""#);
        match &toks[0] {
            Token::StringLit(s) => {
                assert_eq!(s.as_bytes(), &[b'\n', b'\r', b'\t', b'"', b'\\']);
            }
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn test_char_literals() {
        assert_eq!(kinds("'a'"), vec![Token::CharLit('a')]);
        assert_eq!(kinds(r"'\n'"), vec![Token::CharLit('\n')]);
        assert_eq!(kinds(r"'\''"), vec![Token::CharLit('\'')]);
    }

    #[test]
    fn test_unknown_escape_is_error() {
        let err = tokenize(r#""bad\q""#).unwrap_err();
        assert!(err.message().contains("escape"), "got: {}", err.message());
    }

    #[test]
    fn test_unterminated_string_is_error() {
        let err = tokenize(r#""no end"#).unwrap_err();
        assert!(err.message().contains("unterminated"));
    }

    #[test]
    fn test_line_comments_skipped() {
        let toks = kinds("1 -- this is a comment\n2");
        assert_eq!(toks, vec![Token::IntLit(1), Token::IntLit(2)]);
    }

    #[test]
    fn test_block_comments_skipped() {
        let toks = kinds("1 {- inner -} 2");
        assert_eq!(toks, vec![Token::IntLit(1), Token::IntLit(2)]);
    }

    #[test]
    fn test_block_comments_nest() {
        let toks = kinds("1 {- outer {- inner -} still outer -} 2");
        assert_eq!(toks, vec![Token::IntLit(1), Token::IntLit(2)]);
    }

    #[test]
    fn test_unterminated_block_comment_is_error() {
        let err = tokenize("1 {- never closed").unwrap_err();
        assert!(err.message().contains("block comment"));
    }

    #[test]
    fn test_operators_longest_match() {
        assert_eq!(
            kinds("a <= b << c ..= d .. e"),
            vec![
                Token::Ident("a".into()),
                Token::LtEq,
                Token::Ident("b".into()),
                Token::LtLt,
                Token::Ident("c".into()),
                Token::DotDotEq,
                Token::Ident("d".into()),
                Token::DotDot,
                Token::Ident("e".into()),
            ]
        );
    }

    #[test]
    fn test_refinement_type_tokens() {
        // i64{it >= 0} lexes as type keyword, brace, `it`, operator, int, brace
        assert_eq!(
            kinds("i64{it >= 0}"),
            vec![
                Token::TyI64,
                Token::LBrace,
                Token::It,
                Token::GtEq,
                Token::IntLit(0),
                Token::RBrace,
            ]
        );
    }

    #[test]
    fn test_spans_cover_source() {
        let toks = tokenize("let x = 5;").unwrap();
        let (tok, span) = &toks[1];
        assert_eq!(*tok, Token::Ident("x".into()));
        assert_eq!(*span, Span::new(4, 5));
    }

    #[test]
    fn test_relex_token_stream_stable() {
        // Concatenating lexemes and re-lexing yields the same stream
        // modulo whitespace.
        let source = r#"fn f(a: i64) -> i64 = a + 1; -- tail"#;
        let first = kinds(source);
        let joined = first
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let second = kinds(&joined);
        assert_eq!(first, second);
    }

    #[test]
    fn test_unexpected_character() {
        let err = tokenize("let $x = 1;").unwrap_err();
        assert!(err.message().contains("unexpected character"));
        assert_eq!(err.span().unwrap().start, 4);
    }
}
