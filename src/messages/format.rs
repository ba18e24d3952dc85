//! Compiled message patterns.
//!
//! Pattern syntax follows the usual message-bundle conventions: `{n}` (or
//! `{n,type,style}`) refers to the n-th argument, `''` is a literal single
//! quote and text between single quotes is copied verbatim, braces included.

use crate::error::MimirError;
use crate::messages::locale::Locale;
use std::fmt::{Display, Write};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Argument {
        index: usize,
        /// Type and style, kept for callers that want them; rendering uses `Display`
        style: Option<String>,
    },
}

/// A message pattern parsed once and formatted many times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFormat {
    pattern: String,
    locale: Locale,
    segments: Vec<Segment>,
}

impl MessageFormat {
    pub fn compile(pattern: &str, locale: &Locale) -> Result<Self, MimirError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = pattern.chars().peekable();
        let mut quoted = false;

        while let Some(c) = chars.next() {
            match c {
                '\'' if chars.peek() == Some(&'\'') => {
                    chars.next();
                    literal.push('\'');
                }
                '\'' => quoted = !quoted,
                '{' if !quoted => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    let body = Self::argument_body(&mut chars, pattern)?;
                    segments.push(Self::parse_argument(&body, pattern)?);
                }
                c => literal.push(c),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            pattern: pattern.to_string(),
            locale: locale.clone(),
            segments,
        })
    }

    /// Text up to the brace that closes the current argument.
    fn argument_body(
        chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
        pattern: &str,
    ) -> Result<String, MimirError> {
        let mut body = String::new();
        let mut depth = 1;
        let mut quoted = false;

        for c in chars.by_ref() {
            match c {
                '\'' => {
                    quoted = !quoted;
                    body.push(c);
                }
                '{' if !quoted => {
                    depth += 1;
                    body.push(c);
                }
                '}' if !quoted => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(body);
                    }
                    body.push(c);
                }
                c => body.push(c),
            }
        }

        Err(MimirError::Format(format!("unmatched braces in '{}'", pattern)))
    }

    fn parse_argument(body: &str, pattern: &str) -> Result<Segment, MimirError> {
        let (index, style) = match body.split_once(',') {
            Some((index, style)) => (index, Some(style.trim().to_string())),
            None => (body, None),
        };

        let index = index.trim().parse::<usize>().map_err(|_| {
            MimirError::Format(format!(
                "can't parse argument number '{}' in '{}'",
                index.trim(),
                pattern
            ))
        })?;

        Ok(Segment::Argument {
            index,
            style: style.filter(|s| !s.is_empty()),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn locale(&self) -> &Locale {
        &self.locale
    }

    /// One more than the highest argument index referenced.
    pub fn argument_count(&self) -> usize {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Argument { index, .. } => Some(index + 1),
                Segment::Literal(_) => None,
            })
            .max()
            .unwrap_or(0)
    }

    /// Style of the argument at `index`, e.g. `number,integer`.
    pub fn argument_style(&self, index: usize) -> Option<&str> {
        self.segments.iter().find_map(|segment| match segment {
            Segment::Argument { index: i, style } if *i == index => style.as_deref(),
            _ => None,
        })
    }

    /// Render with the given arguments. Arguments that are not supplied stay
    /// as their `{n}` placeholder.
    pub fn format<A: Display>(&self, args: &[A]) -> String {
        let mut out = String::with_capacity(self.pattern.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Argument { index, .. } => match args.get(*index) {
                    Some(arg) => {
                        let _ = write!(out, "{}", arg);
                    }
                    None => {
                        let _ = write!(out, "{{{}}}", index);
                    }
                },
            }
        }
        out
    }
}
