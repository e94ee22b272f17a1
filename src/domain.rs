use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ChelsaError;

static TRACE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^CHELSA[_-]TraCE21k_([a-z]+[0-9]*)(?:_([0-9]{2}))?_(-?[0-9]+)_V[0-9.]+\.tif$")
        .unwrap()
});

static PRESENT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^CHELSA_([a-z]+[0-9]*(?:_[a-z]+)*)(?:_([0-9]{2}))?_([0-9]{4})-([0-9]{4})(?:_([a-z0-9-]+)_(ssp[0-9]{3}))?_V\.?2\.1\.tif$",
    )
    .unwrap()
});

static BIO_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^bio([0-9]{1,2})$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Trace,
    Present,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Trace => "trace",
            Kind::Present => "present",
        }
    }

    pub fn parse_name(self, name: &str) -> Result<ParsedName, ParseFailure> {
        let parsed = match self {
            Kind::Trace => parse_trace_name(name),
            Kind::Present => parse_present_name(name),
        };
        parsed.ok_or_else(|| ParseFailure {
            kind: self,
            name: name.to_string(),
        })
    }

    pub fn sort_entries(self, entries: &mut [ListEntry]) {
        match self {
            Kind::Trace => entries.sort_by(|a, b| {
                a.parsed
                    .time
                    .start()
                    .cmp(&b.parsed.time.start())
                    .then_with(|| a.parsed.month.cmp(&b.parsed.month))
                    .then_with(|| a.path.cmp(&b.path))
            }),
            Kind::Present => entries.sort_by(|a, b| match a.file_name().cmp(b.file_name()) {
                Ordering::Equal => a.path.cmp(&b.path),
                other => other,
            }),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Kind {
    type Err = ChelsaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Kind::Trace),
            "present" => Ok(Kind::Present),
            _ => Err(ChelsaError::InvalidKind(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Variable(String);

impl Variable {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn normalized(raw: &str) -> String {
        let lower = raw.trim().to_ascii_lowercase();
        match BIO_CODE.captures(&lower) {
            Some(caps) => match caps[1].parse::<u8>() {
                Ok(code) => format!("bio{code:02}"),
                Err(_) => lower,
            },
            None => lower,
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Variable {
    type Err = ChelsaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = Self::normalized(value);
        let mut chars = normalized.chars();
        let is_valid = chars.next().is_some_and(|ch| ch.is_ascii_lowercase())
            && chars.all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_');
        if !is_valid {
            return Err(ChelsaError::InvalidVariable(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scenario {
    pub model: String,
    pub ssp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimeToken {
    /// TraCE21k time id: 20 is 1990 CE, each step is one century.
    Step(i32),
    Period {
        start: i32,
        end: i32,
        scenario: Option<Scenario>,
    },
}

impl TimeToken {
    pub fn start(&self) -> i32 {
        match self {
            TimeToken::Step(id) => *id,
            TimeToken::Period { start, .. } => *start,
        }
    }

    pub fn end(&self) -> i32 {
        match self {
            TimeToken::Step(id) => *id,
            TimeToken::Period { end, .. } => *end,
        }
    }

    pub fn step(&self) -> Option<i32> {
        match self {
            TimeToken::Step(id) => Some(*id),
            TimeToken::Period { .. } => None,
        }
    }

    pub fn period_label(&self) -> Option<String> {
        match self {
            TimeToken::Step(_) => None,
            TimeToken::Period {
                start,
                end,
                scenario,
            } => Some(match scenario {
                Some(scenario) => format!("{start}-{end}_{}_{}", scenario.model, scenario.ssp),
                None => format!("{start}-{end}"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub variable: Variable,
    pub month: Option<u8>,
    pub time: TimeToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseFailure {
    pub kind: Kind,
    pub name: String,
}

impl fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} does not match the {} file grammar", self.name, self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub path: String,
    pub size: Option<u64>,
    pub mod_time: Option<String>,
    pub parsed: ParsedName,
}

impl ListEntry {
    pub fn file_name(&self) -> &str {
        file_name(&self.path)
    }
}

pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub fn trace_time_id_to_ka(time_id: i32) -> f64 {
    f64::from(20 - time_id) / 10.0
}

fn parse_trace_name(name: &str) -> Option<ParsedName> {
    let caps = TRACE_NAME.captures(name)?;
    let variable = caps[1].parse().ok()?;
    let month = parse_month(caps.get(2).map(|m| m.as_str()))?;
    let time_id = caps[3].parse().ok()?;
    Some(ParsedName {
        variable,
        month,
        time: TimeToken::Step(time_id),
    })
}

fn parse_present_name(name: &str) -> Option<ParsedName> {
    let caps = PRESENT_NAME.captures(name)?;
    let variable = caps[1].parse().ok()?;
    let month = parse_month(caps.get(2).map(|m| m.as_str()))?;
    let start: i32 = caps[3].parse().ok()?;
    let end: i32 = caps[4].parse().ok()?;
    if end < start {
        return None;
    }
    let scenario = match (caps.get(5), caps.get(6)) {
        (Some(model), Some(ssp)) => Some(Scenario {
            model: model.as_str().to_ascii_lowercase(),
            ssp: ssp.as_str().to_ascii_lowercase(),
        }),
        _ => None,
    };
    Some(ParsedName {
        variable,
        month,
        time: TimeToken::Period {
            start,
            end,
            scenario,
        },
    })
}

/// `None` means the month token was present but out of range; `Some(None)`
/// means there was no month token at all.
fn parse_month(raw: Option<&str>) -> Option<Option<u8>> {
    match raw {
        None => Some(None),
        Some(value) => {
            let month: u8 = value.parse().ok()?;
            (1..=12).contains(&month).then_some(Some(month))
        }
    }
}
