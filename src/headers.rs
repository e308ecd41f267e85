//! Message header model.
//!
//! Headers are an ordered list of name/value pairs. Names compare
//! case-insensitively; insertion order is preserved so an envelope
//! round-trips through storage byte-for-byte.
//!
//! The well-known names in [`names`] have typed accessors on [`Headers`].
//! A typed getter returns `None` when the header is absent or does not
//! parse; senders are not trusted to produce well-formed values.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Well-known header names.
pub mod names {
    pub const MESSAGE_ID: &str = "MessageId";
    pub const MESSAGE_NAME: &str = "MessageName";
    pub const CONTENT_TYPE: &str = "ContentType";
    pub const ORIGINATION: &str = "Origination";
    pub const DESTINATION: &str = "Destination";
    pub const REPLY_TO: &str = "ReplyTo";
    pub const RELATED_TO: &str = "RelatedTo";
    pub const TOPIC: &str = "Topic";
    pub const IMPORTANCE: &str = "Importance";
    pub const EXPIRES: &str = "Expires";
    pub const SENT: &str = "Sent";
    pub const SECURITY_TOKEN: &str = "SecurityToken";
}

/// Relative priority of a message. Stored as its display string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Importance {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Importance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Normal => "Normal",
            Self::High => "High",
            Self::Critical => "Critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            v if v.eq_ignore_ascii_case("Low") => Some(Self::Low),
            v if v.eq_ignore_ascii_case("Normal") => Some(Self::Normal),
            v if v.eq_ignore_ascii_case("High") => Some(Self::High),
            v if v.eq_ignore_ascii_case("Critical") => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Importance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered name/value pairs with case-insensitive name lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces the value of an existing header in place, or appends.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            Some((_, v)) => *v = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let idx = self.0.iter().position(|(n, _)| n.eq_ignore_ascii_case(name))?;
        Some(self.0.remove(idx).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    // Typed views over the well-known names.

    pub fn message_id(&self) -> Option<Uuid> {
        self.get(names::MESSAGE_ID).and_then(|v| v.parse().ok())
    }

    pub fn set_message_id(&mut self, id: Uuid) {
        self.set(names::MESSAGE_ID, id.to_string());
    }

    pub fn message_name(&self) -> Option<&str> {
        self.get(names::MESSAGE_NAME)
    }

    pub fn set_message_name(&mut self, name: impl Into<String>) {
        self.set(names::MESSAGE_NAME, name.into());
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get(names::CONTENT_TYPE)
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.set(names::CONTENT_TYPE, content_type.into());
    }

    pub fn origination(&self) -> Option<Url> {
        self.get(names::ORIGINATION).and_then(|v| v.parse().ok())
    }

    pub fn set_origination(&mut self, uri: &Url) {
        self.set(names::ORIGINATION, uri.to_string());
    }

    pub fn destination(&self) -> Option<Url> {
        self.get(names::DESTINATION).and_then(|v| v.parse().ok())
    }

    pub fn set_destination(&mut self, uri: &Url) {
        self.set(names::DESTINATION, uri.to_string());
    }

    pub fn reply_to(&self) -> Option<Url> {
        self.get(names::REPLY_TO).and_then(|v| v.parse().ok())
    }

    pub fn set_reply_to(&mut self, uri: &Url) {
        self.set(names::REPLY_TO, uri.to_string());
    }

    pub fn related_to(&self) -> Option<Uuid> {
        self.get(names::RELATED_TO).and_then(|v| v.parse().ok())
    }

    pub fn set_related_to(&mut self, id: Uuid) {
        self.set(names::RELATED_TO, id.to_string());
    }

    pub fn topic(&self) -> Option<&str> {
        self.get(names::TOPIC)
    }

    pub fn set_topic(&mut self, topic: impl Into<String>) {
        self.set(names::TOPIC, topic.into());
    }

    /// Missing or malformed importance reads as [`Importance::Normal`].
    pub fn importance(&self) -> Importance {
        self.get(names::IMPORTANCE)
            .and_then(Importance::parse)
            .unwrap_or_default()
    }

    pub fn set_importance(&mut self, importance: Importance) {
        self.set(names::IMPORTANCE, importance.as_str());
    }

    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.get(names::EXPIRES)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn set_expires(&mut self, expires: DateTime<Utc>) {
        self.set(
            names::EXPIRES,
            expires.to_rfc3339_opts(SecondsFormat::Micros, true),
        );
    }

    pub fn sent(&self) -> Option<DateTime<Utc>> {
        self.get(names::SENT)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn set_sent(&mut self, sent: DateTime<Utc>) {
        self.set(
            names::SENT,
            sent.to_rfc3339_opts(SecondsFormat::Micros, true),
        );
    }

    pub fn security_token(&self) -> Option<&str> {
        self.get(names::SECURITY_TOKEN)
    }

    pub fn set_security_token(&mut self, token: impl Into<String>) {
        self.set(names::SECURITY_TOKEN, token.into());
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.set("Content-Encoding", "gzip");

        assert_eq!(headers.get("content-encoding"), Some("gzip"));
        assert_eq!(headers.get("CONTENT-ENCODING"), Some("gzip"));
        assert_eq!(headers.get("content_encoding"), None);
    }

    #[test]
    fn set_replaces_in_place() {
        let mut headers = Headers::new();
        headers.set("a", "1");
        headers.set("b", "2");
        headers.set("A", "3");

        let pairs: Vec<_> = headers.iter().collect();
        assert_eq!(pairs, vec![("a", "3"), ("b", "2")]);
    }

    #[test]
    fn expires_round_trip() {
        let mut headers = Headers::new();
        let when = Utc::now();
        headers.set_expires(when);

        let got = headers.expires().unwrap();
        assert_eq!(got.timestamp_micros(), when.timestamp_micros());
    }

    #[test]
    fn malformed_importance_reads_as_normal() {
        let mut headers = Headers::new();
        headers.set(names::IMPORTANCE, "urgent-ish");
        assert_eq!(headers.importance(), Importance::Normal);

        headers.set_importance(Importance::Critical);
        assert_eq!(headers.importance(), Importance::Critical);
    }
}
