//! Topic grammar `<direction>/<device>/<leaf>[<digit>]`.

/// Characters the state tree does not accept in ids.
pub const FORBIDDEN_CHARS: &[char] = &['[', ']', '*', ',', ';', '\'', '"', '`', '<', '>', '\\', '?'];

/// Replaces every forbidden character with `_`.
pub fn sanitize(raw: &str) -> String {
    raw.replace(FORBIDDEN_CHARS, "_")
}

/// Id component for a single-attribute topic leaf: runs of `-`, `.`, `+`
/// and whitespace collapse into one `_`.
pub fn sanitize_leaf(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_run = false;
    for c in raw.chars() {
        if c == '-' || c == '.' || c == '+' || c.is_whitespace() {
            if !in_run {
                out.push('_');
                in_run = true;
            }
        } else {
            out.push(c);
            in_run = false;
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Direction {
    Command,
    Status,
    Telemetry,
    Other(String),
}

impl Direction {
    fn parse(segment: &str) -> Self {
        match segment {
            "cmnd" => Direction::Command,
            "stat" => Direction::Status,
            "tele" => Direction::Telemetry,
            other => Direction::Other(other.to_string()),
        }
    }
}

/// Last topic segment. Record leaves accept one trailing digit (`STATE1`,
/// `INFO2`); anything else is an attribute name kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Leaf {
    State,
    Sensor,
    Wakeup,
    Info,
    Energy,
    Result,
    Lwt,
    Attribute(String),
}

impl Leaf {
    fn parse(segment: &str) -> Self {
        let base = match segment.char_indices().last() {
            Some((idx, c)) if c.is_ascii_digit() => &segment[..idx],
            _ => segment,
        };
        match base {
            "STATE" => Leaf::State,
            "SENSOR" => Leaf::Sensor,
            "WAKEUP" => Leaf::Wakeup,
            "INFO" => Leaf::Info,
            "ENERGY" => Leaf::Energy,
            "RESULT" => Leaf::Result,
            "LWT" => Leaf::Lwt,
            _ => Leaf::Attribute(segment.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub raw: String,
    pub direction: Direction,
    /// Second segment, the device's topic name
    pub device_segment: Option<String>,
    pub leaf: Leaf,
}

impl Topic {
    pub fn parse(raw: &str) -> Self {
        let segments: Vec<&str> = raw.split('/').collect();
        let direction = Direction::parse(segments.first().copied().unwrap_or_default());
        let device_segment = segments
            .get(1)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        let leaf = Leaf::parse(segments.last().copied().unwrap_or_default());

        Self {
            raw: raw.to_string(),
            direction,
            device_segment,
            leaf,
        }
    }
}
