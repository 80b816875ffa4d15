use chrono::{DateTime, Local, NaiveTime, Utc};
use serde::{Deserialize, Deserializer};

/// Time source for token expiry, throttles and tariff windows.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;

    /// Wall-clock time of day in the host's local timezone.
    fn local_time(&self) -> NaiveTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn local_time(&self) -> NaiveTime {
        Local::now().time()
    }
}

/// Deserialize an identifier the API may send either as a string or as a number.
pub fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Int(i64),
        UInt(u64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Int(n) => n.to_string(),
        Raw::UInt(n) => n.to_string(),
    })
}

/// Render a JSON value the way the attribute endpoint expects it: strings verbatim,
/// everything else as its JSON text.
pub fn attribute_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
