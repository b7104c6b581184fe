//! Pure functions over source text: the expression-vs-statement classifier
//! for the last source line and a top-level statement
//! splitter used to make execution interruptible between statements.
//!
//! Both are hand-rolled scanners rather than a full parser: `rustpython-vm`
//! already validates syntax before either one runs, so a narrow lexical
//! rule over indentation depth and statement keywords is enough.

const STATEMENT_KEYWORDS: &[&str] = &[
    "import", "from", "def", "class", "if", "elif", "else", "for", "while", "try", "except",
    "finally", "with", "assert", "del", "global", "nonlocal", "pass", "break", "continue",
    "return", "raise", "yield",
];

/// Whether the last line of a cell should be re-evaluated as an expression
/// and published as an `execute_result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastLine {
    /// Re-evaluate this line as an expression.
    Expression,
    /// Leave it alone: it already ran as a statement.
    Statement,
}

/// Classify the last source line of a cell: trims internally so
/// callers can pass the raw last line.
pub fn classify_last_line(line: &str) -> LastLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LastLine::Statement;
    }

    if starts_with_keyword(trimmed) {
        return LastLine::Statement;
    }

    if has_unpaired_assignment(trimmed) {
        return LastLine::Statement;
    }

    if has_balanced_call(trimmed) {
        return LastLine::Statement;
    }

    LastLine::Expression
}

fn starts_with_keyword(trimmed: &str) -> bool {
    let first_word: String = trimmed
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    STATEMENT_KEYWORDS.contains(&first_word.as_str())
}

/// True if `trimmed` contains a top-level `=` that isn't part of `==`,
/// `!=`, `<=`, or `>=`. Walrus (`:=`) is a separate two-char operator and is
/// also excluded — `x := 1` is itself an expression, not an assignment
/// statement, so it must NOT trip this rule.
fn has_unpaired_assignment(trimmed: &str) -> bool {
    let bytes = trimmed.as_bytes();
    let mut depth: i32 = 0;
    let mut in_string: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(quote) = in_string {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == quote {
                in_string = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' | b'"' => in_string = Some(b),
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            b'=' if depth == 0 => {
                let prev = if i > 0 { bytes[i - 1] } else { 0 };
                let next = if i + 1 < bytes.len() { bytes[i + 1] } else { 0 };
                let is_comparison_or_walrus = matches!(prev, b'=' | b'!' | b'<' | b'>' | b':')
                    || next == b'=';
                if !is_comparison_or_walrus {
                    return true;
                }
            }
            _ => {}
        }
        i += 1;
    }
    false
}

/// True if `trimmed` contains a balanced-parenthesis function-call form
/// (i.e. an identifier immediately followed by `(...)` with matching
/// parens) — the "contains a function-call form" rule.
fn has_balanced_call(trimmed: &str) -> bool {
    let bytes = trimmed.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_alphabetic() || b == b'_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            // Skip attribute access chains like `a.b.c(...)`.
            let mut j = i;
            while j < bytes.len() && bytes[j] == b'.' {
                j += 1;
                while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
                    j += 1;
                }
            }
            if j < bytes.len() && bytes[j] == b'(' && start < j {
                let mut depth = 0i32;
                let mut k = j;
                let mut closed = false;
                while k < bytes.len() {
                    match bytes[k] {
                        b'(' => depth += 1,
                        b')' => {
                            depth -= 1;
                            if depth == 0 {
                                closed = true;
                                break;
                            }
                        }
                        _ => {}
                    }
                    k += 1;
                }
                if closed {
                    return true;
                }
            }
            i = j.max(i);
        } else {
            i += 1;
        }
    }
    false
}

/// Split `source` into top-level statement chunks at blank-paren-depth
/// newline boundaries, so the worker can check the interrupt flag between
/// chunks instead of running the whole cell as one opaque blob. A chunk that
/// opens an unclosed bracket or a block header (`if ...:` followed by an
/// indented body) stays joined with its continuation lines.
pub fn split_top_level_statements(source: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut in_block = false;

    for line in source.lines() {
        let indented = line.starts_with(' ') || line.starts_with('\t');
        let blank = line.trim().is_empty();

        if !current.is_empty() && depth == 0 && !in_block && !indented && !blank {
            chunks.push(std::mem::take(&mut current));
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);

        depth += paren_delta(line);
        if depth == 0 {
            let trimmed = line.trim_end();
            in_block = trimmed.ends_with(':');
        }
    }

    if !current.trim().is_empty() {
        chunks.push(current);
    }

    chunks
}

fn paren_delta(line: &str) -> i32 {
    let mut delta = 0;
    let mut in_string: Option<u8> = None;
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(quote) = in_string {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == quote {
                in_string = None;
            }
        } else {
            match b {
                b'\'' | b'"' => in_string = Some(b),
                b'(' | b'[' | b'{' => delta += 1,
                b')' | b']' | b'}' => delta -= 1,
                b'#' => break,
                _ => {}
            }
        }
        i += 1;
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_not_assignment() {
        assert_eq!(classify_last_line("a == b"), LastLine::Expression);
    }

    #[test]
    fn comparisons_are_not_assignment() {
        for line in ["a != b", "a <= b", "a >= b"] {
            assert_eq!(classify_last_line(line), LastLine::Expression, "{line}");
        }
    }

    #[test]
    fn function_call_is_statement() {
        assert_eq!(classify_last_line("f(x)"), LastLine::Statement);
    }

    #[test]
    fn assert_call_is_statement() {
        assert_eq!(classify_last_line("assert(x)"), LastLine::Statement);
    }

    #[test]
    fn walrus_is_expression() {
        assert_eq!(classify_last_line("x := 1"), LastLine::Expression);
    }

    #[test]
    fn plain_assignment_is_statement() {
        assert_eq!(classify_last_line("x = 1"), LastLine::Statement);
    }

    #[test]
    fn bare_name_is_expression() {
        assert_eq!(classify_last_line("x"), LastLine::Expression);
    }

    #[test]
    fn keyword_prefixed_lines_are_statements() {
        for line in ["import os", "def f():", "if x:", "return 1", "raise ValueError()"] {
            assert_eq!(classify_last_line(line), LastLine::Statement, "{line}");
        }
    }

    #[test]
    fn attribute_call_is_statement() {
        assert_eq!(classify_last_line("obj.method(1, 2)"), LastLine::Statement);
    }

    #[test]
    fn empty_line_is_statement() {
        assert_eq!(classify_last_line(""), LastLine::Statement);
    }

    #[test]
    fn splits_simple_statements() {
        let chunks = split_top_level_statements("x = 1\ny = 2\nx + y");
        assert_eq!(chunks, vec!["x = 1", "y = 2", "x + y"]);
    }

    #[test]
    fn keeps_block_bodies_joined() {
        let chunks = split_top_level_statements("if True:\n    x = 1\n    y = 2\nz = 3");
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with("if True:"));
        assert_eq!(chunks[1], "z = 3");
    }

    #[test]
    fn keeps_unclosed_brackets_joined() {
        let chunks = split_top_level_statements("x = [\n    1,\n    2,\n]\ny = x");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1], "y = x");
    }

    #[test]
    fn multiline_bracketed_assignment_is_statement() {
        // The last physical line alone (`]`) looks like a bare expression;
        // classifying the whole chunk must still see the top-level `=`.
        assert_eq!(
            classify_last_line("x = [\n    1,\n    2,\n]"),
            LastLine::Statement
        );
    }

    #[test]
    fn multiline_call_spanning_lines_is_statement() {
        assert_eq!(
            classify_last_line("foo(\n    1,\n    2,\n)"),
            LastLine::Statement
        );
    }
}
