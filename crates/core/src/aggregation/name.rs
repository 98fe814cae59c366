//! Hierarchical request names.
//!
//! A name is a `/`-separated path whose last component is the decimal
//! sequence number of the round it addresses, e.g. `/agg1/17`. The first
//! component names the node the request is routed to.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::NameError;
use super::SequenceId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestName {
    components: Vec<String>,
}

impl RequestName {
    /// Parses an absolute name such as `/root/3`.
    pub fn parse(raw: &str) -> Result<Self, NameError> {
        if raw.is_empty() {
            return Err(NameError::Empty);
        }
        let Some(rest) = raw.strip_prefix('/') else {
            return Err(NameError::NotAbsolute(raw.to_string()));
        };
        if rest.is_empty() {
            return Err(NameError::Empty);
        }
        let components = rest
            .split('/')
            .map(|c| {
                if c.is_empty() {
                    Err(NameError::EmptyComponent(raw.to_string()))
                } else {
                    Ok(c.to_string())
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { components })
    }

    /// Name of the request a node sends to `child` for round `seq`: `/<child>/<seq>`.
    pub fn for_child(child: &str, seq: SequenceId) -> Self {
        Self {
            components: vec![child.to_string(), seq.to_string()],
        }
    }

    /// Extracts the trailing sequence component.
    pub fn sequence(&self) -> Result<SequenceId, NameError> {
        let last = self.components.last().ok_or(NameError::Empty)?;
        // Reject signs and whitespace that `u64::from_str` would otherwise let through.
        if !last.bytes().all(|b| b.is_ascii_digit()) {
            return Err(NameError::MalformedSequence(last.clone()));
        }
        last.parse::<u64>()
            .map(SequenceId::new)
            .map_err(|_| NameError::MalformedSequence(last.clone()))
    }

    /// First component; the node this name is routed to.
    pub fn head(&self) -> &str {
        // A parsed name always has at least one component.
        self.components.first().map(String::as_str).unwrap_or_default()
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }
}

impl fmt::Display for RequestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in &self.components {
            write!(f, "/{c}")?;
        }
        Ok(())
    }
}

impl FromStr for RequestName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RequestName {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RequestName> for String {
    fn from(value: RequestName) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn parses_sequence_and_head() {
        let name = RequestName::parse("/agg1/17").unwrap();
        assert_eq!(name.head(), "agg1");
        assert_eq!(name.sequence().unwrap(), SequenceId::new(17));
        assert_eq!(name.to_string(), "/agg1/17");
    }

    #[test]
    fn child_name_round_trips_through_display() {
        let name = RequestName::for_child("leaf3", SequenceId::new(42));
        assert_eq!(name.to_string(), "/leaf3/42");
        assert_eq!(RequestName::parse(&name.to_string()).unwrap(), name);
    }

    #[rstest]
    #[case("", NameError::Empty)]
    #[case("/", NameError::Empty)]
    #[case("agg/1", NameError::NotAbsolute("agg/1".into()))]
    #[case("/agg//1", NameError::EmptyComponent("/agg//1".into()))]
    #[case("/agg/1/", NameError::EmptyComponent("/agg/1/".into()))]
    fn rejects_malformed_names(#[case] raw: &str, #[case] expected: NameError) {
        assert_eq!(RequestName::parse(raw).unwrap_err(), expected);
    }

    #[rstest]
    #[case("/agg/seven")]
    #[case("/agg/-1")]
    #[case("/agg/+1")]
    #[case("/agg/99999999999999999999999")]
    fn rejects_malformed_sequences(#[case] raw: &str) {
        let name = RequestName::parse(raw).unwrap();
        assert!(matches!(
            name.sequence(),
            Err(NameError::MalformedSequence(_))
        ));
    }
}
