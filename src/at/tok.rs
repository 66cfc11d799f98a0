//! Tokenizer for AT response lines.
//!
//! Response lines look like `+CGREG: 1,"1A2B","00001234",2` — a prefix up
//! to the first `:`, then comma-separated values where strings may or may
//! not be double-quoted. The tokenizer borrows the line and hands out one
//! value at a time.

/// Borrowing cursor over the value part of an AT response line.
pub struct Tokenizer<'a> {
    rest: &'a str,
}

impl<'a> Tokenizer<'a> {
    /// Start tokenizing after the `:` prefix separator. Lines without a
    /// prefix (e.g. numeric responses) are rejected.
    pub fn new(line: &'a str) -> Option<Self> {
        let (_, rest) = line.split_once(':')?;
        Some(Tokenizer { rest })
    }

    /// Tokenize a bare value list with no prefix.
    pub fn bare(values: &'a str) -> Self {
        Tokenizer { rest: values }
    }

    /// True if another value follows.
    pub fn has_more(&self) -> bool {
        !self.rest.trim_start().is_empty()
    }

    /// Next raw value, unquoted and trimmed. `None` when exhausted.
    pub fn next_str(&mut self) -> Option<&'a str> {
        let trimmed = self.rest.trim_start();
        if trimmed.is_empty() {
            return None;
        }

        if let Some(inner) = trimmed.strip_prefix('"') {
            // Quoted value: take through the closing quote, then skip a
            // trailing comma if present.
            let end = inner.find('"')?;
            let value = &inner[..end];
            let mut after = &inner[end + 1..];
            if let Some(stripped) = after.trim_start().strip_prefix(',') {
                after = stripped;
            } else {
                after = after.trim_start();
            }
            self.rest = after;
            Some(value)
        } else {
            match trimmed.find(',') {
                Some(pos) => {
                    self.rest = &trimmed[pos + 1..];
                    Some(trimmed[..pos].trim())
                }
                None => {
                    self.rest = "";
                    Some(trimmed.trim_end())
                }
            }
        }
    }

    /// Next value parsed as a decimal integer.
    pub fn next_int(&mut self) -> Option<i32> {
        self.next_str()?.parse().ok()
    }

    /// Next value parsed as hexadecimal (LAC/CID fields arrive as quoted
    /// hex strings with no `0x` marker).
    pub fn next_hex(&mut self) -> Option<u32> {
        u32::from_str_radix(self.next_str()?, 16).ok()
    }

    /// Next value parsed as a 0/1 flag.
    pub fn next_bool(&mut self) -> Option<bool> {
        match self.next_int()? {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }
    }

    /// Peek at the upcoming raw text without consuming it.
    pub fn peek(&self) -> &'a str {
        self.rest.trim_start()
    }

    /// Number of commas left in the unconsumed remainder. The CREG/CGREG
    /// parser uses this to pick a response shape before consuming values.
    pub fn remaining_commas(&self) -> usize {
        self.rest.matches(',').count()
    }
}
