use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// One element of a query key tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySegment {
    Int(i64),
    Str(String),
}

impl From<&str> for KeySegment {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for KeySegment {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for KeySegment {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl fmt::Display for KeySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Str(value) => write!(f, "{value:?}"),
        }
    }
}

/// Every cacheable unit of server data the client knows about.
///
/// Each shape projects to an ordered tuple of segments; that tuple is what
/// gets persisted and what prefix filters match against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryKey {
    UserProfile,
    Interests,
    UsernameAvailability { username: String },
    UsernameSuggestions { seed: String },
    AccountName { account_number: String, bank_code: String },
    Lift { id: String },
}

impl QueryKey {
    pub fn segments(&self) -> Vec<KeySegment> {
        match self {
            Self::UserProfile => vec!["user".into(), "profile".into()],
            Self::Interests => vec!["interests".into()],
            Self::UsernameAvailability { username } => {
                vec!["username".into(), "check".into(), username.clone().into()]
            }
            Self::UsernameSuggestions { seed } => {
                vec!["username".into(), "suggestions".into(), seed.clone().into()]
            }
            Self::AccountName {
                account_number,
                bank_code,
            } => vec![
                "accountName".into(),
                account_number.clone().into(),
                bank_code.clone().into(),
            ],
            Self::Lift { id } => vec!["lift".into(), id.clone().into()],
        }
    }

    /// Parse a segment tuple back into a known shape.
    pub fn from_segments(segments: &[KeySegment]) -> Option<Self> {
        let strs: Option<Vec<&str>> = segments
            .iter()
            .map(|segment| match segment {
                KeySegment::Str(value) => Some(value.as_str()),
                KeySegment::Int(_) => None,
            })
            .collect();
        let key = match strs?.as_slice() {
            ["user", "profile"] => Self::UserProfile,
            ["interests"] => Self::Interests,
            ["username", "check", username] => Self::UsernameAvailability {
                username: username.to_string(),
            },
            ["username", "suggestions", seed] => Self::UsernameSuggestions {
                seed: seed.to_string(),
            },
            ["accountName", account_number, bank_code] => Self::AccountName {
                account_number: account_number.to_string(),
                bank_code: bank_code.to_string(),
            },
            ["lift", id] => Self::Lift { id: id.to_string() },
            _ => return None,
        };
        Some(key)
    }

    /// Keys holding data that belongs to the signed-in user.
    pub fn is_user_scoped(&self) -> bool {
        matches!(
            self,
            Self::UserProfile | Self::AccountName { .. } | Self::Lift { .. }
        )
    }

    pub fn starts_with(&self, prefix: &[KeySegment]) -> bool {
        let segments = self.segments();
        segments.len() >= prefix.len() && segments.iter().zip(prefix).all(|(a, b)| a == b)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (idx, segment) in self.segments().iter().enumerate() {
            if idx > 0 {
                write!(f, ",")?;
            }
            write!(f, "{segment}")?;
        }
        write!(f, "]")
    }
}

impl Serialize for QueryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.segments().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for QueryKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let segments = Vec::<KeySegment>::deserialize(deserializer)?;
        Self::from_segments(&segments)
            .ok_or_else(|| D::Error::custom(format!("unknown query key shape {segments:?}")))
    }
}

/// Selects cache entries for invalidation or removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFilter {
    All,
    Exact(QueryKey),
    Prefix(Vec<KeySegment>),
    UserScoped,
}

impl KeyFilter {
    pub fn prefix<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<KeySegment>,
    {
        Self::Prefix(segments.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, key: &QueryKey) -> bool {
        match self {
            Self::All => true,
            Self::Exact(expected) => expected == key,
            Self::Prefix(prefix) => key.starts_with(prefix),
            Self::UserScoped => key.is_user_scoped(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_name_key_keeps_segment_order() {
        let key = QueryKey::AccountName {
            account_number: "0123456789".into(),
            bank_code: "058".into(),
        };
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#"["accountName","0123456789","058"]"#);
        let swapped = QueryKey::AccountName {
            account_number: "058".into(),
            bank_code: "0123456789".into(),
        };
        assert_ne!(key, swapped);
    }

    #[test]
    fn unknown_shapes_fail_to_parse() {
        let err = serde_json::from_str::<QueryKey>(r#"["feed","page",2]"#);
        assert!(err.is_err());
        let parsed: QueryKey = serde_json::from_str(r#"["user","profile"]"#).unwrap();
        assert_eq!(parsed, QueryKey::UserProfile);
    }

    #[test]
    fn prefix_filter_matches_family() {
        let filter = KeyFilter::prefix(["username"]);
        assert!(filter.matches(&QueryKey::UsernameSuggestions { seed: "ada".into() }));
        assert!(filter.matches(&QueryKey::UsernameAvailability {
            username: "ada".into()
        }));
        assert!(!filter.matches(&QueryKey::UserProfile));
    }

    #[test]
    fn user_scope_covers_profile_but_not_interests() {
        assert!(KeyFilter::UserScoped.matches(&QueryKey::UserProfile));
        assert!(KeyFilter::UserScoped.matches(&QueryKey::Lift { id: "l-1".into() }));
        assert!(!KeyFilter::UserScoped.matches(&QueryKey::Interests));
    }

    #[test]
    fn display_renders_tuple() {
        assert_eq!(QueryKey::UserProfile.to_string(), r#"["user","profile"]"#);
    }
}
