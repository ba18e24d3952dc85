use crate::error::MimirError;
use crate::services::bundles::SourceKind;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::str::FromStr;

static XML_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static XML_ROOT: Lazy<Regex> = Lazy::new(|| Regex::new(r"<properties[\s>/]").unwrap());
static XML_ENTRY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<entry\s+key\s*=\s*(?:"([^"]*)"|'([^']*)')\s*(?:/>|>(.*?)</entry\s*>)"#)
        .unwrap()
});
static XML_CDATA: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!\[CDATA\[(.*?)\]\]>").unwrap());
static XML_ENTITY: Lazy<Regex> = Lazy::new(|| Regex::new(r"&(#x[0-9a-fA-F]+|#[0-9]+|[a-zA-Z]+);").unwrap());

/// Character encodings accepted for `.properties` sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    Utf8,
    /// The classic properties-file default
    #[default]
    Latin1,
}

impl Encoding {
    pub fn decode(&self, bytes: &[u8], location: &str) -> Result<String, MimirError> {
        match self {
            Encoding::Utf8 => {
                let text = std::str::from_utf8(bytes).map_err(|e| {
                    MimirError::Encoding(format!("{} is not valid UTF-8: {}", location, e))
                })?;
                Ok(text.strip_prefix('\u{feff}').unwrap_or(text).to_string())
            }
            Encoding::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Utf8 => "UTF-8",
            Encoding::Latin1 => "ISO-8859-1",
        }
    }
}

impl FromStr for Encoding {
    type Err = MimirError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_uppercase();

        match normalized.as_str() {
            "UTF8" => Ok(Encoding::Utf8),
            "ISO88591" | "LATIN1" | "L1" | "CP819" | "USASCII" | "ASCII" => Ok(Encoding::Latin1),
            _ => Err(MimirError::Encoding(format!("unsupported encoding '{}'", s))),
        }
    }
}

/// Parse a source of the given kind. `encoding` applies to `.properties`
/// only; XML sources are always read as UTF-8.
pub fn parse(
    kind: SourceKind,
    bytes: &[u8],
    encoding: Encoding,
    location: &str,
) -> Result<HashMap<String, String>, MimirError> {
    match kind {
        SourceKind::Properties => parse_properties(&encoding.decode(bytes, location)?, location),
        SourceKind::Xml => parse_xml(&Encoding::Utf8.decode(bytes, location)?, location),
    }
}

fn is_blank(c: char) -> bool {
    c == ' ' || c == '\t' || c == '\x0c'
}

/// Parse `.properties` text: `#`/`!` comments, `key=value`, `key: value`
/// or `key value`, backslash continuation lines and escapes.
pub fn parse_properties(text: &str, location: &str) -> Result<HashMap<String, String>, MimirError> {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut properties = HashMap::new();
    let mut logical = String::new();

    for line in normalized.split('\n') {
        let line = line.trim_start_matches(is_blank);
        if logical.is_empty() && (line.is_empty() || line.starts_with('#') || line.starts_with('!')) {
            continue;
        }

        logical.push_str(line);

        let trailing = logical.chars().rev().take_while(|c| *c == '\\').count();
        if trailing % 2 == 1 {
            logical.pop();
            continue;
        }

        let (key, value) = split_entry(&logical, location)?;
        properties.insert(key, value);
        logical.clear();
    }

    // A continuation on the last line
    if !logical.is_empty() {
        let (key, value) = split_entry(&logical, location)?;
        properties.insert(key, value);
    }

    Ok(properties)
}

fn split_entry(line: &str, location: &str) -> Result<(String, String), MimirError> {
    let chars: Vec<char> = line.chars().collect();
    let mut key_end = chars.len();
    let mut separator_seen = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' | ':' => {
                key_end = i;
                separator_seen = true;
                break;
            }
            c if is_blank(c) => {
                key_end = i;
                break;
            }
            _ => {}
        }
    }

    let mut value_start = (key_end + 1).min(chars.len());
    if !separator_seen {
        value_start = key_end;
        while value_start < chars.len() && is_blank(chars[value_start]) {
            value_start += 1;
        }
        if value_start < chars.len() && (chars[value_start] == '=' || chars[value_start] == ':') {
            value_start += 1;
        }
    }
    while value_start < chars.len() && is_blank(chars[value_start]) {
        value_start += 1;
    }

    let key: String = chars[..key_end].iter().collect();
    let value: String = chars[value_start..].iter().collect();

    Ok((unescape(&key, location)?, unescape(&value, location)?))
}

fn unescape(raw: &str, location: &str) -> Result<String, MimirError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    let mut pending_high: Option<u16> = None;

    while let Some(c) = chars.next() {
        if c != '\\' {
            flush_surrogate(&mut out, &mut pending_high);
            out.push(c);
            continue;
        }

        let Some(escaped) = chars.next() else {
            break;
        };

        if escaped == 'u' {
            let hex: String = chars.by_ref().take(4).collect();
            let unit = u16::from_str_radix(&hex, 16)
                .ok()
                .filter(|_| hex.len() == 4)
                .ok_or_else(|| {
                    MimirError::Parsing(format!("{}: malformed \\uxxxx encoding '\\u{}'", location, hex))
                })?;
            push_utf16_unit(&mut out, &mut pending_high, unit);
            continue;
        }

        flush_surrogate(&mut out, &mut pending_high);
        out.push(match escaped {
            't' => '\t',
            'n' => '\n',
            'r' => '\r',
            'f' => '\x0c',
            other => other,
        });
    }

    flush_surrogate(&mut out, &mut pending_high);
    Ok(out)
}

/// `\u` escapes are UTF-16 code units; pair up surrogates, replace strays.
fn push_utf16_unit(out: &mut String, pending_high: &mut Option<u16>, unit: u16) {
    match unit {
        0xD800..=0xDBFF => {
            flush_surrogate(out, pending_high);
            *pending_high = Some(unit);
        }
        0xDC00..=0xDFFF => match pending_high.take() {
            Some(high) => {
                let decoded = char::decode_utf16([high, unit])
                    .next()
                    .and_then(|r| r.ok())
                    .unwrap_or(char::REPLACEMENT_CHARACTER);
                out.push(decoded);
            }
            None => out.push(char::REPLACEMENT_CHARACTER),
        },
        _ => {
            flush_surrogate(out, pending_high);
            out.push(char::from_u32(u32::from(unit)).unwrap_or(char::REPLACEMENT_CHARACTER));
        }
    }
}

fn flush_surrogate(out: &mut String, pending_high: &mut Option<u16>) {
    if pending_high.take().is_some() {
        out.push(char::REPLACEMENT_CHARACTER);
    }
}

/// Parse the XML properties format:
/// `<properties><entry key="k">value</entry></properties>`.
pub fn parse_xml(text: &str, location: &str) -> Result<HashMap<String, String>, MimirError> {
    let text = XML_COMMENT.replace_all(text, "");
    if !XML_ROOT.is_match(&text) {
        return Err(MimirError::Parsing(format!(
            "{}: missing <properties> root element",
            location
        )));
    }

    let mut properties = HashMap::new();
    for caps in XML_ENTRY.captures_iter(&text) {
        let key = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        let value = caps.get(3).map(|m| m.as_str()).unwrap_or_default();

        properties.insert(
            unescape_xml(key, location)?,
            xml_text(value, location)?,
        );
    }

    Ok(properties)
}

/// Element text: entities resolved outside CDATA sections, CDATA copied verbatim.
fn xml_text(raw: &str, location: &str) -> Result<String, MimirError> {
    let mut out = String::new();
    let mut last = 0;
    for caps in XML_CDATA.captures_iter(raw) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&unescape_xml(&raw[last..whole.start()], location)?);
        out.push_str(inner.as_str());
        last = whole.end();
    }
    out.push_str(&unescape_xml(&raw[last..], location)?);
    Ok(out)
}

fn unescape_xml(raw: &str, location: &str) -> Result<String, MimirError> {
    let mut out = String::with_capacity(raw.len());
    let mut last = 0;
    for caps in XML_ENTITY.captures_iter(raw) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&raw[last..whole.start()]);
        let name = name.as_str();
        let resolved = match name {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ if name.starts_with("#x") => u32::from_str_radix(&name[2..], 16)
                .ok()
                .and_then(char::from_u32),
            _ if name.starts_with('#') => name[1..].parse::<u32>().ok().and_then(char::from_u32),
            _ => None,
        };
        let c = resolved.ok_or_else(|| {
            MimirError::Parsing(format!("{}: unknown entity '&{};'", location, name))
        })?;
        out.push(c);
        last = whole.end();
    }
    out.push_str(&raw[last..]);
    Ok(out)
}
