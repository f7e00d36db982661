//! Delimited record parsing with RFC 4180-like quoting
//!
//! Quoted fields may span physical lines, so the parser keeps its state
//! between calls to [`CsvParser::push_line`] until a record is complete.

/// Incremental parser for delimited text records
pub struct CsvParser {
    delimiter: char,
    quote_char: char,
    fields: Vec<String>,
    current_field: String,
    in_quotes: bool,
    // True right after a closing quote, where a second quote means an escaped one
    after_quote: bool,
}

impl CsvParser {
    /// Create a parser with custom delimiter and quote character
    pub fn new(delimiter: u8, quote_char: u8) -> Self {
        Self {
            delimiter: delimiter as char,
            quote_char: quote_char as char,
            fields: Vec::new(),
            current_field: String::new(),
            in_quotes: false,
            after_quote: false,
        }
    }

    /// Feed one physical line (without its terminator)
    ///
    /// Returns the finished record, or `None` while a quoted field is still open.
    pub fn push_line(&mut self, line: &str) -> Option<Vec<String>> {
        for ch in line.chars() {
            if self.in_quotes {
                if ch == self.quote_char {
                    self.in_quotes = false;
                    self.after_quote = true;
                } else {
                    self.current_field.push(ch);
                }
                continue;
            }

            if ch == self.quote_char {
                if self.after_quote {
                    // "" inside a quoted field
                    self.current_field.push(ch);
                }
                self.in_quotes = true;
                self.after_quote = false;
            } else if ch == self.delimiter {
                self.fields.push(std::mem::take(&mut self.current_field));
                self.after_quote = false;
            } else {
                self.current_field.push(ch);
                self.after_quote = false;
            }
        }

        if self.in_quotes {
            self.current_field.push('\n');
            return None;
        }

        self.after_quote = false;
        self.fields.push(std::mem::take(&mut self.current_field));
        Some(std::mem::take(&mut self.fields))
    }

    /// True when a quoted field is still waiting for its closing quote
    pub fn is_pending(&self) -> bool {
        self.in_quotes
    }

    /// Close an unterminated record at end of input
    pub fn finish(&mut self) -> Option<Vec<String>> {
        if !self.in_quotes && self.fields.is_empty() && self.current_field.is_empty() {
            return None;
        }
        self.in_quotes = false;
        self.after_quote = false;
        if self.current_field.ends_with('\n') {
            self.current_field.pop();
        }
        self.fields.push(std::mem::take(&mut self.current_field));
        Some(std::mem::take(&mut self.fields))
    }

    /// Parse a complete record in one call
    pub fn parse_line(&mut self, line: &str) -> Vec<String> {
        match self.push_line(line) {
            Some(fields) => fields,
            None => self.finish().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Vec<String> {
        CsvParser::new(b',', b'"').parse_line(line)
    }

    #[test]
    fn test_simple() {
        assert_eq!(parse("a,b,c"), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_quoted_delimiter() {
        assert_eq!(parse(r#""a,b",c"#), vec!["a,b", "c"]);
    }

    #[test]
    fn test_escaped_quotes() {
        assert_eq!(
            parse(r#""Say ""Hello""",world"#),
            vec![r#"Say "Hello""#, "world"]
        );
    }

    #[test]
    fn test_empty_fields() {
        assert_eq!(parse("a,,c"), vec!["a", "", "c"]);
        assert_eq!(parse(",,"), vec!["", "", ""]);
        assert_eq!(parse(r#""","""#), vec!["", ""]);
    }

    #[test]
    fn test_record_spanning_lines() {
        let mut parser = CsvParser::new(b',', b'"');
        assert_eq!(parser.push_line("1,\"Line 1"), None);
        assert!(parser.is_pending());
        assert_eq!(
            parser.push_line("Line 2\",normal"),
            Some(vec!["1".to_string(), "Line 1\nLine 2".to_string(), "normal".to_string()])
        );
        assert!(!parser.is_pending());
    }

    #[test]
    fn test_custom_delimiter() {
        let mut parser = CsvParser::new(b'|', b'"');
        assert_eq!(parser.parse_line(r#"a|"b|c"|d"#), vec!["a", "b|c", "d"]);
    }

    #[test]
    fn test_unterminated_quote_at_eof() {
        let mut parser = CsvParser::new(b',', b'"');
        assert_eq!(parser.push_line("a,\"open"), None);
        assert_eq!(
            parser.finish(),
            Some(vec!["a".to_string(), "open".to_string()])
        );
        assert_eq!(parser.finish(), None);
    }
}
