// ABOUTME: Data types exchanged with the remote character-chat backend.
// ABOUTME: Turns hold one or more candidates; sessions may open with a greeting turn.

use serde::{Deserialize, Serialize};

/// One candidate text for a turn. The backend may produce several; the first
/// is the one shown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate_id: String,
    pub text: String,
    /// Set when the backend's moderation replaced the text
    #[serde(default)]
    pub is_filtered: bool,
}

impl Candidate {
    pub fn new(candidate_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            candidate_id: candidate_id.into(),
            text: text.into(),
            is_filtered: false,
        }
    }

    pub fn filtered(candidate_id: impl Into<String>) -> Self {
        Self {
            candidate_id: candidate_id.into(),
            text: String::new(),
            is_filtered: true,
        }
    }
}

/// A stored message unit in a remote session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: String,
    pub author_is_human: bool,
    pub candidates: Vec<Candidate>,
}

impl Turn {
    /// The candidate a reply is built from, if the backend returned any
    pub fn primary(&self) -> Option<&Candidate> {
        self.candidates.first()
    }
}

/// Result of creating a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub session_id: String,
    /// Greeting turn when one was requested
    pub greeting: Option<Turn>,
}

/// Star rating for an AI turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    Terrible,
    Bad,
    Good,
    Fantastic,
}

impl Rating {
    /// Numeric value sent to the backend (0..=3)
    pub fn value(self) -> u8 {
        match self {
            Self::Terrible => 0,
            Self::Bad => 1,
            Self::Good => 2,
            Self::Fantastic => 3,
        }
    }
}

impl std::str::FromStr for Rating {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "terrible" => Ok(Self::Terrible),
            "bad" => Ok(Self::Bad),
            "good" => Ok(Self::Good),
            "fantastic" => Ok(Self::Fantastic),
            _ => anyhow::bail!("Unknown rating: {}", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rating_values() {
        assert_eq!(Rating::Terrible.value(), 0);
        assert_eq!(Rating::Fantastic.value(), 3);
        assert_eq!("good".parse::<Rating>().unwrap(), Rating::Good);
        assert!("meh".parse::<Rating>().is_err());
    }

    #[test]
    fn test_primary_candidate() {
        let turn = Turn {
            turn_id: "t1".to_string(),
            author_is_human: false,
            candidates: vec![Candidate::new("c1", "hi"), Candidate::new("c2", "hello")],
        };
        assert_eq!(turn.primary().map(|c| c.text.as_str()), Some("hi"));

        let empty = Turn {
            candidates: Vec::new(),
            ..turn
        };
        assert!(empty.primary().is_none());
    }
}
