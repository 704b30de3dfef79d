use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Identifiers are used verbatim as document path segments, so they must be
/// non-empty, reasonably short, and free of `/`.
fn validate_segment(s: &str) -> Result<(), ParseError> {
    if s.is_empty() || s.len() > 128 {
        return Err(ParseError::InvalidIdentifier(s.to_string()));
    }
    if s
        .chars()
        .any(|c| c == '/' || c.is_whitespace() || c.is_control())
    {
        return Err(ParseError::InvalidIdentifier(s.to_string()));
    }
    Ok(())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Build an identifier, rejecting values that cannot be used as a
            /// document path segment.
            pub fn parse(s: &str) -> Result<Self, ParseError> {
                validate_segment(s)?;
                Ok(Self(s.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ParseError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                validate_segment(&s)?;
                Ok(Self(s))
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Account identity of a learner, issued by the external auth collaborator.
    LearnerId
);
string_id!(
    /// Identity of a course in the content catalogue.
    CourseId
);
string_id!(
    /// Identity of a lesson video.
    VideoId
);
string_id!(QuizId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_path_separators() {
        assert!(CourseId::parse("intro").is_ok());
        assert!(CourseId::parse("a/b").is_err());
        assert!(CourseId::parse("").is_err());
        assert!(VideoId::parse("with space").is_err());
    }

    #[test]
    fn deserialization_validates() {
        let ok: LearnerId = serde_json::from_str("\"learner-1\"").unwrap();
        assert_eq!(ok.as_str(), "learner-1");
        assert!(serde_json::from_str::<LearnerId>("\"../etc\"").is_err());
    }
}
