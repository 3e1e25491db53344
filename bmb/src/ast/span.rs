//! Source location tracking

use serde::{Deserialize, Serialize};

/// A span in the source code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// A zero-width span at the start of the file, for diagnostics that
    /// have no better anchor.
    pub fn dummy() -> Self {
        Self { start: 0, end: 0 }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

impl From<Span> for std::ops::Range<usize> {
    fn from(span: Span) -> Self {
        span.start..span.end
    }
}

impl From<std::ops::Range<usize>> for Span {
    fn from(range: std::ops::Range<usize>) -> Self {
        Span::new(range.start, range.end)
    }
}

/// A value with source location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spanned<T> {
    pub node: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Self { node, span }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Spanned<U> {
        Spanned {
            node: f(self.node),
            span: self.span,
        }
    }
}

/// Resolve a byte offset to a 1-based (line, column) pair.
///
/// Columns count bytes within the line; diagnostics only need this for
/// the human-readable `file:line:col` prefix, ariadne does its own layout.
pub fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, b) in source.bytes().enumerate() {
        if i >= offset {
            break;
        }
        if b == b'\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_new() {
        let span = Span::new(10, 20);
        assert_eq!(span.start, 10);
        assert_eq!(span.end, 20);
    }

    #[test]
    fn test_span_merge_non_overlapping() {
        let a = Span::new(0, 5);
        let b = Span::new(10, 15);
        assert_eq!(a.merge(b), Span::new(0, 15));
    }

    #[test]
    fn test_span_merge_reversed_order() {
        let a = Span::new(10, 20);
        let b = Span::new(0, 5);
        assert_eq!(a.merge(b), Span::new(0, 20));
    }

    #[test]
    fn test_span_merge_commutative() {
        let a = Span::new(10, 20);
        let b = Span::new(5, 15);
        assert_eq!(a.merge(b), b.merge(a));
    }

    #[test]
    fn test_span_display() {
        assert_eq!(format!("{}", Span::new(42, 99)), "42..99");
    }

    #[test]
    fn test_span_to_range() {
        let range: std::ops::Range<usize> = Span::new(5, 15).into();
        assert_eq!(range, 5..15);
    }

    #[test]
    fn test_spanned_map() {
        let s = Spanned::new(10, Span::new(0, 5));
        let mapped = s.map(|n| n * 2);
        assert_eq!(mapped.node, 20);
        assert_eq!(mapped.span, Span::new(0, 5));
    }

    #[test]
    fn test_line_col_first_line() {
        assert_eq!(line_col("hello", 3), (1, 4));
    }

    #[test]
    fn test_line_col_second_line() {
        assert_eq!(line_col("ab\ncd\nef", 4), (2, 2));
    }

    #[test]
    fn test_line_col_at_newline() {
        let src = "ab\ncd";
        assert_eq!(line_col(src, 2), (1, 3));
        assert_eq!(line_col(src, 3), (2, 1));
    }
}
