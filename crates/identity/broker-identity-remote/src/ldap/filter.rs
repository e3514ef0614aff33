//! RFC 4515 string filters and their BER encoding.

use super::ber::{self, context_constructed, context_primitive};

/// Escapes a value for literal use inside a filter.
pub fn escape_filter_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\\' => escaped.push_str("\\5c"),
            '\0' => escaped.push_str("\\00"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality(String, Vec<u8>),
    GreaterOrEqual(String, Vec<u8>),
    LessOrEqual(String, Vec<u8>),
    Approx(String, Vec<u8>),
    Present(String),
    Substrings {
        attribute: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        last: Option<Vec<u8>>,
    },
}

impl Filter {
    pub fn parse(input: &str) -> Result<Filter, String> {
        let mut parser = Parser {
            input: input.trim().as_bytes(),
            pos: 0,
        };
        let filter = parser.filter()?;
        if parser.pos != parser.input.len() {
            return Err(format!("trailing characters in filter {input:?}"));
        }
        Ok(filter)
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Filter::And(items) => ber::constructed(
                context_constructed(0),
                &items.iter().map(Filter::encode).collect::<Vec<_>>(),
            ),
            Filter::Or(items) => ber::constructed(
                context_constructed(1),
                &items.iter().map(Filter::encode).collect::<Vec<_>>(),
            ),
            Filter::Not(inner) => ber::tlv(context_constructed(2), &inner.encode()),
            Filter::Equality(attr, value) => assertion(3, attr, value),
            Filter::GreaterOrEqual(attr, value) => assertion(5, attr, value),
            Filter::LessOrEqual(attr, value) => assertion(6, attr, value),
            Filter::Approx(attr, value) => assertion(8, attr, value),
            Filter::Present(attr) => ber::tlv(context_primitive(7), attr.as_bytes()),
            Filter::Substrings {
                attribute,
                initial,
                any,
                last,
            } => {
                let mut parts = Vec::new();
                if let Some(initial) = initial {
                    parts.push(ber::tlv(context_primitive(0), initial));
                }
                for value in any {
                    parts.push(ber::tlv(context_primitive(1), value));
                }
                if let Some(last) = last {
                    parts.push(ber::tlv(context_primitive(2), last));
                }
                ber::constructed(
                    context_constructed(4),
                    &[
                        ber::octet_string(attribute.as_bytes()),
                        ber::constructed(ber::SEQUENCE, &parts),
                    ],
                )
            }
        }
    }
}

fn assertion(choice: u8, attribute: &str, value: &[u8]) -> Vec<u8> {
    ber::constructed(
        context_constructed(choice),
        &[ber::octet_string(attribute.as_bytes()), ber::octet_string(value)],
    )
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, expected: u8) -> Result<(), String> {
        match self.peek() {
            Some(c) if c == expected => {
                self.pos += 1;
                Ok(())
            }
            other => Err(format!(
                "expected {:?} at offset {}, found {:?}",
                char::from(expected),
                self.pos,
                other.map(char::from)
            )),
        }
    }

    fn filter(&mut self) -> Result<Filter, String> {
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.filter_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.filter_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.filter()?))
            }
            _ => self.item()?,
        };
        self.expect(b')')?;
        Ok(filter)
    }

    fn filter_list(&mut self) -> Result<Vec<Filter>, String> {
        let mut filters = Vec::new();
        while self.peek() == Some(b'(') {
            filters.push(self.filter()?);
        }
        if filters.is_empty() {
            return Err(format!("empty filter list at offset {}", self.pos));
        }
        Ok(filters)
    }

    fn item(&mut self) -> Result<Filter, String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, b'=' | b'~' | b'>' | b'<' | b'(' | b')') {
                break;
            }
            self.pos += 1;
        }
        let attribute = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
        if attribute.is_empty() {
            return Err(format!("missing attribute at offset {start}"));
        }

        let operator = match self.peek() {
            Some(b'=') => {
                self.pos += 1;
                b'='
            }
            Some(op @ (b'~' | b'>' | b'<')) => {
                self.pos += 1;
                self.expect(b'=')?;
                op
            }
            _ => return Err(format!("missing operator after {attribute:?}")),
        };

        let raw_start = self.pos;
        while let Some(c) = self.peek() {
            if c == b')' || c == b'(' {
                break;
            }
            self.pos += 1;
        }
        let raw = &self.input[raw_start..self.pos];

        match operator {
            b'~' => Ok(Filter::Approx(attribute, unescape(raw)?)),
            b'>' => Ok(Filter::GreaterOrEqual(attribute, unescape(raw)?)),
            b'<' => Ok(Filter::LessOrEqual(attribute, unescape(raw)?)),
            _ if raw == b"*" => Ok(Filter::Present(attribute)),
            _ if raw.contains(&b'*') => substrings(attribute, raw),
            _ => Ok(Filter::Equality(attribute, unescape(raw)?)),
        }
    }
}

fn substrings(attribute: String, raw: &[u8]) -> Result<Filter, String> {
    let pieces: Vec<&[u8]> = raw.split(|c| *c == b'*').collect();
    let last_index = pieces.len() - 1;

    let mut initial = None;
    let mut any = Vec::new();
    let mut last = None;
    for (index, piece) in pieces.iter().enumerate() {
        if piece.is_empty() {
            continue;
        }
        let value = unescape(piece)?;
        if index == 0 {
            initial = Some(value);
        } else if index == last_index {
            last = Some(value);
        } else {
            any.push(value);
        }
    }

    Ok(Filter::Substrings {
        attribute,
        initial,
        any,
        last,
    })
}

fn unescape(raw: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\\' {
            let hex = raw
                .get(i + 1..i + 3)
                .and_then(|pair| std::str::from_utf8(pair).ok())
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| "invalid escape in filter value".to_string())?;
            out.push(hex);
            i += 3;
        } else {
            out.push(raw[i]);
            i += 1;
        }
    }
    Ok(out)
}
