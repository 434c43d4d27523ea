//! Core domain types shared across ingress, publisher, and consumers.

use serde::{Deserialize, Serialize};

/// Delivery class of an SMS request.
///
/// Express traffic is charged at a higher rate and is routed through its own
/// queue and publisher pool so it can never be starved by normal traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmsType {
    #[default]
    Normal,
    Express,
}

impl SmsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SmsType::Normal => "normal",
            SmsType::Express => "express",
        }
    }

    /// Price per recipient for this delivery class.
    pub fn price(&self) -> i64 {
        match self {
            SmsType::Normal => 1,
            SmsType::Express => 3,
        }
    }

    /// Outbox priority for this delivery class. The high publisher pool
    /// claims rows with priority >= 5, the low pool everything below.
    pub fn priority(&self) -> i32 {
        match self {
            SmsType::Normal => 0,
            SmsType::Express => 10,
        }
    }
}

impl std::fmt::Display for SmsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An SMS send request.
///
/// `sms_identifier` and `transaction_id` are empty on the wire coming in
/// from a client; ingress assigns both before the request is persisted and
/// they travel with the message through the outbox and the bus.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Sms {
    pub customer_id: i64,
    pub text: String,
    pub recipients: Vec<String>,
    #[serde(rename = "type")]
    pub kind: SmsType,
    pub sms_identifier: String,
    pub transaction_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sms_type_pricing() {
        assert_eq!(SmsType::Normal.price(), 1);
        assert_eq!(SmsType::Express.price(), 3);
    }

    #[test]
    fn test_sms_type_priority_partition() {
        // Express must land in the high pool's claim window, normal below it.
        assert!(SmsType::Express.priority() >= 5);
        assert!(SmsType::Normal.priority() < 5);
    }

    #[test]
    fn test_sms_json_field_names() {
        let json = r#"{"customer_id":7,"text":"hi","recipients":["+1"],"type":"express"}"#;
        let sms: Sms = serde_json::from_str(json).expect("decode sms");
        assert_eq!(sms.customer_id, 7);
        assert_eq!(sms.kind, SmsType::Express);
        assert!(sms.sms_identifier.is_empty());
        assert!(sms.transaction_id.is_empty());

        let encoded = serde_json::to_value(&sms).expect("encode sms");
        assert_eq!(encoded["type"], "express");
        assert_eq!(encoded["sms_identifier"], "");
    }

    #[test]
    fn test_sms_defaults_on_missing_fields() {
        let sms: Sms = serde_json::from_str(r#"{"customer_id":1}"#).expect("decode sms");
        assert!(sms.recipients.is_empty());
        assert_eq!(sms.kind, SmsType::Normal);
    }
}
