//! Text layout helpers for statement trees and loop-nest summaries.

use std::fmt;

/// Indented line writer used by the statement printer and the loop-nest
/// summary.
#[derive(Debug)]
pub struct CodeFormatter {
    output: String,
    depth: usize,
    unit: String,
    at_line_start: bool,
}

impl CodeFormatter {
    /// Create a formatter that indents by `unit` per level.
    pub fn new(unit: &str) -> Self {
        Self {
            output: String::new(),
            depth: 0,
            unit: unit.to_string(),
            at_line_start: true,
        }
    }

    /// Two-space indentation.
    pub fn default_indent() -> Self {
        Self::new("  ")
    }

    pub fn indent(&mut self) {
        self.depth += 1;
    }

    pub fn dedent(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Current nesting depth.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Append text, indenting at the start of every line.
    pub fn write(&mut self, s: &str) {
        for c in s.chars() {
            if c == '\n' {
                self.output.push('\n');
                self.at_line_start = true;
                continue;
            }
            if self.at_line_start {
                for _ in 0..self.depth {
                    self.output.push_str(&self.unit);
                }
                self.at_line_start = false;
            }
            self.output.push(c);
        }
    }

    pub fn writeln(&mut self, s: &str) {
        self.write(s);
        self.write("\n");
    }

    /// Write `header {`, the body one level deeper, then `}`.
    pub fn block<F: FnOnce(&mut Self)>(&mut self, header: &str, f: F) {
        self.write(header);
        self.writeln(" {");
        self.indent();
        f(self);
        self.dedent();
        self.writeln("}");
    }

    /// Write `header:` and the body one level deeper, without braces.
    pub fn section<F: FnOnce(&mut Self)>(&mut self, header: &str, f: F) {
        self.write(header);
        self.writeln(":");
        self.indent();
        f(self);
        self.dedent();
    }

    pub fn finish(self) -> String {
        self.output
    }

    pub fn output(&self) -> &str {
        &self.output
    }
}

impl fmt::Write for CodeFormatter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write(s);
        Ok(())
    }
}

/// Join displayable items with a separator.
pub fn format_list<T: fmt::Display>(items: &[T], sep: &str) -> String {
    items
        .iter()
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(sep)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_indents_body() {
        let mut fmt = CodeFormatter::default_indent();
        fmt.block("for (x, 0, 8)", |f| {
            f.writeln("f(x) = x");
        });
        let out = fmt.finish();
        assert_eq!(out, "for (x, 0, 8) {\n  f(x) = x\n}\n");
    }

    #[test]
    fn test_section_and_nesting() {
        let mut fmt = CodeFormatter::new("    ");
        fmt.section("produce g", |f| {
            f.section("for y", |f| {
                f.writeln("g(...) = ...");
            });
        });
        let out = fmt.finish();
        assert!(out.contains("\n    for y:\n        g(...) = ...\n"));
    }

    #[test]
    fn test_format_list() {
        assert_eq!(format_list(&[1, 2, 3], ", "), "1, 2, 3");
        let empty: [i64; 0] = [];
        assert_eq!(format_list(&empty, ", "), "");
    }
}
