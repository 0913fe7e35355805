/// Closed verdict types and their legacy wire encodings.
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Why we think the target is blocked.
///
/// On the wire this is a string tag, `false` for not blocked, or `null`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlockingReason {
    TcpIp,
    Dns,
    HttpDiff,
    HttpFailure,
    NotBlocked,
    #[default]
    Undetermined,
}

const BLOCKING_TAGS: &[(BlockingReason, &str)] = &[
    (BlockingReason::TcpIp, "tcp_ip"),
    (BlockingReason::Dns, "dns"),
    (BlockingReason::HttpDiff, "http-diff"),
    (BlockingReason::HttpFailure, "http-failure"),
];

impl BlockingReason {
    pub fn is_blocked(self) -> bool {
        matches!(
            self,
            Self::TcpIp | Self::Dns | Self::HttpDiff | Self::HttpFailure
        )
    }

    pub fn tag(self) -> Option<&'static str> {
        BLOCKING_TAGS
            .iter()
            .find(|(reason, _)| *reason == self)
            .map(|(_, tag)| *tag)
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        BLOCKING_TAGS
            .iter()
            .find(|(_, t)| *t == tag)
            .map(|(reason, _)| *reason)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BlockingRepr {
    Tag(String),
    Flag(bool),
}

impl Serialize for BlockingReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::NotBlocked => serializer.serialize_bool(false),
            Self::Undetermined => serializer.serialize_none(),
            reason => match reason.tag() {
                Some(tag) => serializer.serialize_str(tag),
                None => serializer.serialize_none(),
            },
        }
    }
}

impl<'de> Deserialize<'de> for BlockingReason {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Option::<BlockingRepr>::deserialize(deserializer)? {
            None => Ok(Self::Undetermined),
            Some(BlockingRepr::Flag(false)) => Ok(Self::NotBlocked),
            Some(BlockingRepr::Flag(true)) => {
                Err(serde::de::Error::custom("blocking cannot be `true`"))
            }
            Some(BlockingRepr::Tag(tag)) => Self::from_tag(&tag).ok_or_else(|| {
                serde::de::Error::custom(format!("unknown blocking tag: {tag}"))
            }),
        }
    }
}

/// Whether the target is reachable from the probe. `true`, `false` or
/// `null` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Accessibility {
    Accessible,
    NotAccessible,
    #[default]
    Undetermined,
}

impl Accessibility {
    pub fn as_option(self) -> Option<bool> {
        match self {
            Self::Accessible => Some(true),
            Self::NotAccessible => Some(false),
            Self::Undetermined => None,
        }
    }
}

impl From<Option<bool>> for Accessibility {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(true) => Self::Accessible,
            Some(false) => Self::NotAccessible,
            None => Self::Undetermined,
        }
    }
}

impl Serialize for Accessibility {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_option().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Accessibility {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<bool>::deserialize(deserializer).map(Self::from)
    }
}

/// Agreement between the probe's and the control's DNS answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DnsConsistency {
    Consistent,
    Inconsistent,
    #[default]
    Undetermined,
}

impl Serialize for DnsConsistency {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Consistent => serializer.serialize_str("consistent"),
            Self::Inconsistent => serializer.serialize_str("inconsistent"),
            Self::Undetermined => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for DnsConsistency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Option::<String>::deserialize(deserializer)?.as_deref() {
            None | Some("") => Ok(Self::Undetermined),
            Some("consistent") => Ok(Self::Consistent),
            Some("inconsistent") => Ok(Self::Inconsistent),
            Some(other) => Err(serde::de::Error::custom(format!(
                "unknown dns_consistency: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blocking_reason_legacy_encoding() {
        let cases = [
            (BlockingReason::TcpIp, json!("tcp_ip")),
            (BlockingReason::Dns, json!("dns")),
            (BlockingReason::HttpDiff, json!("http-diff")),
            (BlockingReason::HttpFailure, json!("http-failure")),
            (BlockingReason::NotBlocked, json!(false)),
            (BlockingReason::Undetermined, json!(null)),
        ];
        for (reason, wire) in cases {
            assert_eq!(serde_json::to_value(reason).unwrap(), wire);
            let back: BlockingReason = serde_json::from_value(wire).unwrap();
            assert_eq!(back, reason);
        }
    }

    #[test]
    fn blocking_true_is_not_a_valid_encoding() {
        assert!(serde_json::from_value::<BlockingReason>(json!(true)).is_err());
        assert!(serde_json::from_value::<BlockingReason>(json!("tls")).is_err());
    }

    #[test]
    fn accessibility_is_nullable_bool() {
        assert_eq!(serde_json::to_value(Accessibility::Accessible).unwrap(), json!(true));
        assert_eq!(serde_json::to_value(Accessibility::NotAccessible).unwrap(), json!(false));
        assert_eq!(serde_json::to_value(Accessibility::Undetermined).unwrap(), json!(null));
    }

    #[test]
    fn empty_dns_consistency_reads_as_undetermined() {
        let value: DnsConsistency = serde_json::from_value(json!("")).unwrap();
        assert_eq!(value, DnsConsistency::Undetermined);
        assert_eq!(
            serde_json::to_value(DnsConsistency::Inconsistent).unwrap(),
            json!("inconsistent")
        );
    }
}
