//! Token definitions

use logos::Logos;

/// Process the escape sequences of a quoted string literal body.
///
/// Escapes produce single runtime bytes here, in the lexer; the parser
/// never sees a backslash. Returns None on an unknown escape or a
/// malformed \xHH pair, which surfaces as a lexer error over the whole
/// literal.
fn unescape(inner: &str) -> Option<String> {
    let mut result = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => result.push('\n'),
            Some('t') => result.push('\t'),
            Some('r') => result.push('\r'),
            Some('\\') => result.push('\\'),
            Some('"') => result.push('"'),
            Some('\'') => result.push('\''),
            Some('0') => result.push('\0'),
            Some('x') => {
                let hi = chars.next()?;
                let lo = chars.next()?;
                let byte = u8::from_str_radix(&format!("{hi}{lo}"), 16).ok()?;
                result.push(byte as char);
            }
            _ => return None,
        }
    }
    Some(result)
}

/// Skip a `{- ... -}` block comment, honoring nesting.
fn lex_block_comment(lex: &mut logos::Lexer<Token>) -> logos::FilterResult<(), ()> {
    let rem = lex.remainder();
    let bytes = rem.as_bytes();
    let mut depth = 1usize;
    let mut i = 0usize;
    while i + 1 < bytes.len() {
        if bytes[i] == b'{' && bytes[i + 1] == b'-' {
            depth += 1;
            i += 2;
        } else if bytes[i] == b'-' && bytes[i + 1] == b'}' {
            depth -= 1;
            i += 2;
            if depth == 0 {
                lex.bump(i);
                return logos::FilterResult::Skip;
            }
        } else {
            i += 1;
        }
    }
    // Ran off the end of the file inside the comment.
    lex.bump(rem.len());
    logos::FilterResult::Error(())
}

/// BMB Token
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\n\r]+")]
#[logos(skip r"--[^\n]*")]
pub enum Token {
    // Keywords
    #[token("fn")]
    Fn,
    #[token("let")]
    Let,
    #[token("var")]
    Var,
    #[token("if")]
    If,
    #[token("then")]
    Then,
    #[token("else")]
    Else,
    #[token("match")]
    Match,
    #[token("while")]
    While,
    #[token("for")]
    For,
    #[token("in")]
    In,
    #[token("loop")]
    Loop,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("return")]
    Return,
    #[token("struct")]
    Struct,
    #[token("enum")]
    Enum,
    #[token("trait")]
    Trait,
    #[token("impl")]
    Impl,
    #[token("new")]
    New,
    #[token("as")]
    As,
    #[token("pre")]
    Pre,
    #[token("post")]
    Post,
    #[token("where")]
    Where,
    #[token("old")]
    Old,
    #[token("ret")]
    Ret,
    #[token("it")]
    It,
    #[token("and")]
    And,
    #[token("or")]
    Or,
    #[token("not")]
    Not,
    #[token("pub")]
    Pub,
    #[token("use")]
    Use,
    #[token("mut")]
    Mut,
    #[token("ref")]
    Ref,
    #[token("set")]
    Set,
    #[token("invariant")]
    Invariant,
    #[token("spawn")]
    Spawn,
    #[token("null")]
    Null,
    #[token("true")]
    True,
    #[token("false")]
    False,

    // Bitwise operator keywords
    #[token("band")]
    Band,
    #[token("bor")]
    Bor,
    #[token("bxor")]
    Bxor,
    #[token("bnot")]
    Bnot,

    // Type keywords
    #[token("i8")]
    TyI8,
    #[token("i16")]
    TyI16,
    #[token("i32")]
    TyI32,
    #[token("i64")]
    TyI64,
    #[token("f32")]
    TyF32,
    #[token("f64")]
    TyF64,
    #[token("bool")]
    TyBool,
    #[token("String")]
    TyString,
    #[token("dyn")]
    Dyn,

    // Literals
    #[regex(r"[0-9][0-9_]*\.[0-9][0-9_]*([eE][+-]?[0-9]+)?|[0-9]+[eE][+-]?[0-9]+", |lex| {
        lex.slice().replace('_', "").parse::<f64>().ok()
    }, priority = 4)]
    FloatLit(f64),

    #[regex(r"0[xX][0-9a-fA-F][0-9a-fA-F_]*", |lex| {
        let s = lex.slice();
        i64::from_str_radix(&s[2..].replace('_', ""), 16).ok()
    }, priority = 3)]
    #[regex(r"0[bB][01][01_]*", |lex| {
        let s = lex.slice();
        i64::from_str_radix(&s[2..].replace('_', ""), 2).ok()
    }, priority = 3)]
    #[regex(r"[0-9][0-9_]*", |lex| {
        lex.slice().replace('_', "").parse::<i64>().ok()
    }, priority = 2)]
    IntLit(i64),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| {
        let s = lex.slice();
        unescape(&s[1..s.len() - 1])
    })]
    StringLit(String),

    #[regex(r"'([^'\\]|\\.|\\x[0-9a-fA-F][0-9a-fA-F])'", |lex| {
        let s = lex.slice();
        let unescaped = unescape(&s[1..s.len() - 1])?;
        let mut chars = unescaped.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Some(c),
            _ => None,
        }
    })]
    CharLit(char),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string(), priority = 1)]
    Ident(String),

    // Block comments skip themselves via the callback; the variant is
    // never produced.
    #[token("{-", lex_block_comment)]
    BlockComment,

    // Symbols
    #[token(":")]
    Colon,
    #[token("::")]
    ColonColon,
    #[token("->")]
    Arrow,
    #[token("=>")]
    FatArrow,
    #[token("_")]
    Underscore,
    #[token("..=")]
    DotDotEq,
    #[token("..")]
    DotDot,
    #[token(".")]
    Dot,
    #[token("=")]
    Eq,
    #[token(";")]
    Semi,
    #[token(",")]
    Comma,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("&")]
    Ampersand,
    #[token("@")]
    At,
    #[token("?")]
    Question,
    #[token("|")]
    Pipe,

    // Operators
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("<<")]
    LtLt,
    #[token(">>")]
    GtGt,
    #[token("&&")]
    AmpAmp,
    #[token("||")]
    PipePipe,
    #[token("!")]
    Bang,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Fn => write!(f, "fn"),
            Token::Let => write!(f, "let"),
            Token::Var => write!(f, "var"),
            Token::If => write!(f, "if"),
            Token::Then => write!(f, "then"),
            Token::Else => write!(f, "else"),
            Token::Match => write!(f, "match"),
            Token::While => write!(f, "while"),
            Token::For => write!(f, "for"),
            Token::In => write!(f, "in"),
            Token::Loop => write!(f, "loop"),
            Token::Break => write!(f, "break"),
            Token::Continue => write!(f, "continue"),
            Token::Return => write!(f, "return"),
            Token::Struct => write!(f, "struct"),
            Token::Enum => write!(f, "enum"),
            Token::Trait => write!(f, "trait"),
            Token::Impl => write!(f, "impl"),
            Token::New => write!(f, "new"),
            Token::As => write!(f, "as"),
            Token::Pre => write!(f, "pre"),
            Token::Post => write!(f, "post"),
            Token::Where => write!(f, "where"),
            Token::Old => write!(f, "old"),
            Token::Ret => write!(f, "ret"),
            Token::It => write!(f, "it"),
            Token::And => write!(f, "and"),
            Token::Or => write!(f, "or"),
            Token::Not => write!(f, "not"),
            Token::Pub => write!(f, "pub"),
            Token::Use => write!(f, "use"),
            Token::Mut => write!(f, "mut"),
            Token::Ref => write!(f, "ref"),
            Token::Set => write!(f, "set"),
            Token::Invariant => write!(f, "invariant"),
            Token::Spawn => write!(f, "spawn"),
            Token::Null => write!(f, "null"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Band => write!(f, "band"),
            Token::Bor => write!(f, "bor"),
            Token::Bxor => write!(f, "bxor"),
            Token::Bnot => write!(f, "bnot"),
            Token::TyI8 => write!(f, "i8"),
            Token::TyI16 => write!(f, "i16"),
            Token::TyI32 => write!(f, "i32"),
            Token::TyI64 => write!(f, "i64"),
            Token::TyF32 => write!(f, "f32"),
            Token::TyF64 => write!(f, "f64"),
            Token::TyBool => write!(f, "bool"),
            Token::TyString => write!(f, "String"),
            Token::Dyn => write!(f, "dyn"),
            Token::IntLit(n) => write!(f, "{n}"),
            Token::FloatLit(n) => write!(f, "{n}"),
            Token::StringLit(s) => write!(f, "\"{s}\""),
            Token::CharLit(c) => write!(f, "'{c}'"),
            Token::Ident(s) => write!(f, "{s}"),
            Token::BlockComment => write!(f, "{{-"),
            Token::Colon => write!(f, ":"),
            Token::ColonColon => write!(f, "::"),
            Token::Arrow => write!(f, "->"),
            Token::FatArrow => write!(f, "=>"),
            Token::Underscore => write!(f, "_"),
            Token::DotDotEq => write!(f, "..="),
            Token::DotDot => write!(f, ".."),
            Token::Dot => write!(f, "."),
            Token::Eq => write!(f, "="),
            Token::Semi => write!(f, ";"),
            Token::Comma => write!(f, ","),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Ampersand => write!(f, "&"),
            Token::At => write!(f, "@"),
            Token::Question => write!(f, "?"),
            Token::Pipe => write!(f, "|"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::EqEq => write!(f, "=="),
            Token::NotEq => write!(f, "!="),
            Token::LtEq => write!(f, "<="),
            Token::GtEq => write!(f, ">="),
            Token::Lt => write!(f, "<"),
            Token::Gt => write!(f, ">"),
            Token::LtLt => write!(f, "<<"),
            Token::GtGt => write!(f, ">>"),
            Token::AmpAmp => write!(f, "&&"),
            Token::PipePipe => write!(f, "||"),
            Token::Bang => write!(f, "!"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unescape_simple() {
        assert_eq!(unescape("a\\nb").unwrap(), "a\nb");
        assert_eq!(unescape("tab\\there").unwrap(), "tab\there");
        assert_eq!(unescape("q\\\"q").unwrap(), "q\"q");
        assert_eq!(unescape("back\\\\slash").unwrap(), "back\\slash");
        assert_eq!(unescape("nul\\0").unwrap(), "nul\0");
    }

    #[test]
    fn test_unescape_hex() {
        assert_eq!(unescape("\\x41").unwrap(), "A");
        assert_eq!(unescape("\\x0a").unwrap(), "\n");
    }

    #[test]
    fn test_unescape_unknown_rejected() {
        assert!(unescape("\\q").is_none());
        assert!(unescape("\\xZZ").is_none());
        assert!(unescape("trailing\\").is_none());
    }

    #[test]
    fn test_display_round_trip_symbols() {
        assert_eq!(format!("{}", Token::Arrow), "->");
        assert_eq!(format!("{}", Token::DotDotEq), "..=");
        assert_eq!(format!("{}", Token::LBrace), "{");
    }
}
