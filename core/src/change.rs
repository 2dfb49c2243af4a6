//! Change events: the vocabulary of "something changed" notifications.
//!
//! A [`ChangeEvent`] is produced only by the change bus (see
//! `keystone_runtime::bus::ChangeBus::emit_change`) and is immutable once
//! published. Consumers key their reactions on the closed [`ChangeType`]
//! enumeration, so adding a new kind of change is a compile-time visible
//! decision rather than a new magic string.
//!
//! # Example
//!
//! ```
//! use keystone_core::change::{ChangeSource, ChangeType};
//!
//! let ty: ChangeType = "USER_PROFILE".parse().unwrap();
//! assert_eq!(ty, ChangeType::UserProfile);
//! assert_eq!(ty.to_string(), "USER_PROFILE");
//! assert_eq!(ChangeSource::default(), ChangeSource::System);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Category of an application state change.
///
/// The set is closed: dispatch tables are keyed on this enum and
/// [`ChangeType::ALL`] enumerates every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    // Application state
    /// Authentication state changed
    Auth,
    /// First-run flow progressed
    Ftux,
    /// First-run flow finished
    FtuxComplete,
    /// A user logged in
    Login,
    /// A user signed up
    Signup,
    /// A user logged out
    Logout,
    /// Application start-up finished
    AppInitDone,

    // User data
    /// Profile record changed
    UserProfile,
    /// Assessment record changed
    UserAssessment,
    /// An assessment was updated
    AssessmentUpdated,
    /// An assessment was deleted
    AssessmentDeleted,
    /// Profile must be reloaded
    UserProfileRefresh,
    /// Profile summary must be regenerated
    UserProfileGenerateSummary,

    // Goals and interests
    /// Short-term goal changed
    ShortTermGoal,
    /// Long-term goal changed
    LongTermGoal,
    /// Main interest changed
    MainInterest,

    // Personal development
    /// Professional development data changed
    ProfessionalDevelopment,
    /// Dig-deeper answers changed
    DigDeeper,
    /// Chat history changed
    Chat,

    // Personal attributes
    /// Core values changed
    CoreValues,
    /// Motivations changed
    Motivations,
    /// Weaknesses changed
    Weaknesses,
    /// "About you" data changed
    AboutYou,
    /// Top qualities changed
    TopQualities,
    /// Quick insight changed
    QuickInsight,
    /// Inner circle changed
    InnerCircle,
}

impl ChangeType {
    /// Every change type, in declaration order.
    pub const ALL: [Self; 26] = [
        Self::Auth,
        Self::Ftux,
        Self::FtuxComplete,
        Self::Login,
        Self::Signup,
        Self::Logout,
        Self::AppInitDone,
        Self::UserProfile,
        Self::UserAssessment,
        Self::AssessmentUpdated,
        Self::AssessmentDeleted,
        Self::UserProfileRefresh,
        Self::UserProfileGenerateSummary,
        Self::ShortTermGoal,
        Self::LongTermGoal,
        Self::MainInterest,
        Self::ProfessionalDevelopment,
        Self::DigDeeper,
        Self::Chat,
        Self::CoreValues,
        Self::Motivations,
        Self::Weaknesses,
        Self::AboutYou,
        Self::TopQualities,
        Self::QuickInsight,
        Self::InnerCircle,
    ];

    /// Stable wire name (`SCREAMING_SNAKE_CASE`), also used as a metrics label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "AUTH",
            Self::Ftux => "FTUX",
            Self::FtuxComplete => "FTUX_COMPLETE",
            Self::Login => "LOGIN",
            Self::Signup => "SIGNUP",
            Self::Logout => "LOGOUT",
            Self::AppInitDone => "APP_INIT_DONE",
            Self::UserProfile => "USER_PROFILE",
            Self::UserAssessment => "USER_ASSESSMENT",
            Self::AssessmentUpdated => "ASSESSMENT_UPDATED",
            Self::AssessmentDeleted => "ASSESSMENT_DELETED",
            Self::UserProfileRefresh => "USER_PROFILE_REFRESH",
            Self::UserProfileGenerateSummary => "USER_PROFILE_GENERATE_SUMMARY",
            Self::ShortTermGoal => "SHORT_TERM_GOAL",
            Self::LongTermGoal => "LONG_TERM_GOAL",
            Self::MainInterest => "MAIN_INTEREST",
            Self::ProfessionalDevelopment => "PROFESSIONAL_DEVELOPMENT",
            Self::DigDeeper => "DIG_DEEPER",
            Self::Chat => "CHAT",
            Self::CoreValues => "CORE_VALUES",
            Self::Motivations => "MOTIVATIONS",
            Self::Weaknesses => "WEAKNESSES",
            Self::AboutYou => "ABOUT_YOU",
            Self::TopQualities => "TOP_QUALITIES",
            Self::QuickInsight => "QUICK_INSIGHT",
            Self::InnerCircle => "INNER_CIRCLE",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown change type name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown change type: {0}")]
pub struct UnknownChangeType(pub String);

impl FromStr for ChangeType {
    type Err = UnknownChangeType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.as_str() == s)
            .ok_or_else(|| UnknownChangeType(s.to_string()))
    }
}

/// Where a change originated. Used for debugging and analytics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    /// Direct user interaction
    UserAction,
    /// Internal application logic
    #[default]
    System,
    /// Response from a remote API
    Api,
}

impl fmt::Display for ChangeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::UserAction => "user_action",
            Self::System => "system",
            Self::Api => "api",
        })
    }
}

/// A published change.
///
/// Events are shared as `Arc<ChangeEvent>` between the bus and its
/// subscribers and are never mutated after publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Category of the change
    pub change_type: ChangeType,
    /// Opaque structured data attached by the producer
    pub payload: serde_json::Value,
    /// When the bus accepted the change
    pub timestamp: DateTime<Utc>,
    /// Origin of the change
    pub source: ChangeSource,
}

impl ChangeEvent {
    /// Create a new event.
    #[must_use]
    pub const fn new(
        change_type: ChangeType,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
        source: ChangeSource,
    ) -> Self {
        Self {
            change_type,
            payload,
            timestamp,
            source,
        }
    }

    /// Identifier grouping all work dispatched for this event: `{TYPE}_{millis}`.
    #[must_use]
    pub fn dispatch_id(&self) -> String {
        format!("{}_{}", self.change_type, self.timestamp.timestamp_millis())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use proptest::prelude::*;

    #[test]
    fn wire_names_round_trip_through_serde() {
        let json = serde_json::to_string(&ChangeType::UserProfileGenerateSummary).unwrap();
        assert_eq!(json, "\"USER_PROFILE_GENERATE_SUMMARY\"");
        assert_eq!(
            json.trim_matches('"'),
            ChangeType::UserProfileGenerateSummary.as_str()
        );
    }

    #[test]
    fn unknown_names_are_rejected() {
        let err = "NOT_A_TYPE".parse::<ChangeType>().unwrap_err();
        assert_eq!(err, UnknownChangeType("NOT_A_TYPE".to_string()));
    }

    #[test]
    fn all_is_exhaustive_and_unique() {
        let mut names: Vec<_> = ChangeType::ALL.iter().map(|t| t.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), ChangeType::ALL.len());
    }

    #[test]
    fn dispatch_id_uses_type_and_millis() {
        let ts = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let event = ChangeEvent::new(
            ChangeType::Login,
            serde_json::Value::Null,
            ts,
            ChangeSource::UserAction,
        );
        assert_eq!(event.dispatch_id(), "LOGIN_1735689600000");
    }

    proptest! {
        #[test]
        fn display_and_parse_agree(index in 0usize..ChangeType::ALL.len()) {
            let ty = ChangeType::ALL[index];
            prop_assert_eq!(ty.to_string().parse::<ChangeType>().unwrap(), ty);
        }
    }
}
