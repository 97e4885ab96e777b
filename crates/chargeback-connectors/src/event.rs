//! Chargeback event model and wire decoder.
//!
//! A [`ChargebackEvent`] is built only by decoding one queue record and is
//! never mutated afterwards. Every field is optional on the wire; unknown
//! fields are ignored so producers can add attributes without breaking the
//! archiver.

use bytes::Bytes;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Number;

use crate::error::{PipelineFault, RecordContext, Result};

/// A chargeback event as carried on the inbound topic.
///
/// Field names are the snake_case wire names; absent fields serialize back as
/// `null` so archived objects always carry the full shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChargebackEvent {
    pub transaction_id: Option<String>,
    pub chargeback_id: Option<String>,
    /// Exact decimal text as sent; never rounded to a fixed precision.
    #[serde(default, deserialize_with = "amount::deserialize")]
    pub amount: Option<Number>,
    pub currency: Option<String>,
    pub merchant_id: Option<String>,
    pub reason_code: Option<String>,
    #[serde(default, with = "timestamp")]
    pub timestamp: Option<NaiveDateTime>,
    pub customer_id: Option<String>,
    pub card_last_four: Option<String>,
    pub status: Option<String>,
}

impl ChargebackEvent {
    /// Decode a raw record payload.
    ///
    /// A missing payload, an empty payload, a JSON `null`, malformed or
    /// truncated JSON and type mismatches all surface as
    /// [`PipelineFault::Decode`] carrying `context`.
    pub fn decode(
        payload: Option<&[u8]>,
        context: &RecordContext,
    ) -> std::result::Result<Self, PipelineFault> {
        let fault = |reason: String| PipelineFault::Decode {
            context: context.clone(),
            reason,
        };

        let bytes = payload.ok_or_else(|| fault("record has no payload".to_string()))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(fault("record payload is empty".to_string()));
        }

        serde_json::from_slice::<ChargebackEvent>(bytes).map_err(|e| fault(e.to_string()))
    }

    /// Canonical JSON body written to the archive.
    pub fn to_json_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// Reads `amount` as a JSON number or a numeric string, keeping its text.
pub(crate) mod amount {
    use serde::de::{self, Deserialize, Deserializer};
    use serde_json::{Number, Value};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Number>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => Ok(Some(n)),
            Some(Value::String(text)) => text
                .trim()
                .parse::<Number>()
                .map(Some)
                .map_err(|_| de::Error::custom(format!("invalid amount '{}'", text))),
            Some(other) => Err(de::Error::custom(format!(
                "invalid amount {}, expected a number",
                other
            ))),
        }
    }
}

/// Serde adapter for the optional event time.
///
/// Accepts an ISO local date-time (seconds and fraction optional), an RFC 3339
/// date-time with offset (normalized to UTC), or the array form
/// `[year, month, day, hour, minute, second?, nanos?]`. Always writes
/// `YYYY-MM-DDTHH:MM:SS[.fraction]`.
pub(crate) mod timestamp {
    use std::fmt;

    use chrono::{DateTime, NaiveDate, NaiveDateTime};
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};

    const OUTPUT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

    pub fn serialize<S>(value: &Option<NaiveDateTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_str(&ts.format(OUTPUT_FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_option(OptionalTimestampVisitor)
    }

    /// Parse the textual forms.
    pub(crate) fn parse_text(text: &str) -> Option<NaiveDateTime> {
        let text = text.trim();
        text.parse::<NaiveDateTime>()
            .ok()
            .or_else(|| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M").ok())
            .or_else(|| {
                DateTime::parse_from_rfc3339(text)
                    .ok()
                    .map(|dt| dt.naive_utc())
            })
    }

    struct OptionalTimestampVisitor;

    impl<'de> Visitor<'de> for OptionalTimestampVisitor {
        type Value = Option<NaiveDateTime>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a date-time string, a date-time array or null")
        }

        fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_any(TimestampVisitor).map(Some)
        }
    }

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = NaiveDateTime;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a date-time string or [year, month, day, hour, minute, second?, nanos?]")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            parse_text(v).ok_or_else(|| E::custom(format!("invalid timestamp '{}'", v)))
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut parts: Vec<u32> = Vec::with_capacity(7);
            while let Some(part) = seq.next_element::<u32>()? {
                parts.push(part);
            }
            if !(5..=7).contains(&parts.len()) {
                return Err(de::Error::invalid_length(parts.len(), &self));
            }

            let year = i32::try_from(parts[0])
                .map_err(|_| de::Error::custom("timestamp year out of range"))?;
            let second = parts.get(5).copied().unwrap_or(0);
            let nanos = parts.get(6).copied().unwrap_or(0);

            NaiveDate::from_ymd_opt(year, parts[1], parts[2])
                .and_then(|date| date.and_hms_nano_opt(parts[3], parts[4], second, nanos))
                .ok_or_else(|| de::Error::custom(format!("invalid timestamp parts {:?}", parts)))
        }
    }
}
