//! Record status machines.
//!
//! Every record with a status column moves through an explicit transition
//! table. Services ask [`Lifecycle::transition_to`] before writing and then
//! update with a compare-and-set on the previous status, so a rejected
//! transition never touches the row.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SiteError};

/// A status enum governed by a fixed transition table.
pub trait Lifecycle: Copy + Eq + Debug + Send + Sync + 'static {
    /// Record name used in error messages.
    const RECORD: &'static str;

    /// Every legal `(from, to)` pair.
    fn transitions() -> &'static [(Self, Self)];

    /// Database representation.
    fn as_str(&self) -> &'static str;

    /// Parse the database representation.
    fn parse(s: &str) -> Option<Self>;

    /// Whether `self -> next` is listed in the table.
    fn can_transition_to(self, next: Self) -> bool {
        Self::transitions().contains(&(self, next))
    }

    /// Validate `self -> next`, returning `next` on success.
    fn transition_to(self, next: Self) -> Result<Self> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(SiteError::InvalidTransition {
                record: Self::RECORD,
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

/// Parse a stored status, treating unknown values as corruption.
pub fn parse_stored<L: Lifecycle>(s: &str) -> Result<L> {
    L::parse(s).ok_or_else(|| {
        SiteError::Database(format!("Unknown {} status {:?}", L::RECORD, s))
    })
}

/// Parse a status supplied by a client.
pub fn parse_requested<L: Lifecycle>(s: &str) -> Result<L> {
    L::parse(s).ok_or_else(|| SiteError::Validation(format!("Unknown status: {}", s)))
}

/// Interpret the row count of an `UPDATE ... WHERE status = <from>`.
///
/// Zero rows means the record left `from` after it was read.
pub fn check_swap<L: Lifecycle>(rows_affected: u64, from: L, to: L) -> Result<L> {
    if rows_affected == 0 {
        Err(SiteError::InvalidTransition {
            record: L::RECORD,
            from: from.as_str(),
            to: to.as_str(),
        })
    } else {
        Ok(to)
    }
}

// ========== Content ==========

/// Editorial status of a content item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentStatus {
    Draft,
    PendingReview,
    Published,
    Rejected,
}

impl Lifecycle for ContentStatus {
    const RECORD: &'static str = "content";

    fn transitions() -> &'static [(Self, Self)] {
        use ContentStatus::*;
        &[
            (Draft, PendingReview),
            (PendingReview, Published),
            (PendingReview, Rejected),
            (Rejected, Draft),
            (Rejected, PendingReview),
            (Published, Draft),
        ]
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::PendingReview => "pending_review",
            Self::Published => "published",
            Self::Rejected => "rejected",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "pending_review" => Some(Self::PendingReview),
            "published" => Some(Self::Published),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl ContentStatus {
    /// Whether the body may still be edited.
    pub fn is_editable(&self) -> bool {
        matches!(self, Self::Draft | Self::Rejected)
    }
}

// ========== Applications ==========

/// Review status of a volunteer or teacher application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Pending,
    Contacted,
    Approved,
    Rejected,
}

impl Lifecycle for ApplicationStatus {
    const RECORD: &'static str = "application";

    fn transitions() -> &'static [(Self, Self)] {
        use ApplicationStatus::*;
        &[
            (Pending, Contacted),
            (Pending, Approved),
            (Pending, Rejected),
            (Contacted, Approved),
            (Contacted, Rejected),
        ]
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Contacted => "contacted",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "contacted" => Some(Self::Contacted),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

// ========== Subscribers ==========

/// Newsletter subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberStatus {
    Active,
    Unsubscribed,
}

impl Lifecycle for SubscriberStatus {
    const RECORD: &'static str = "subscriber";

    fn transitions() -> &'static [(Self, Self)] {
        use SubscriberStatus::*;
        &[(Active, Unsubscribed), (Unsubscribed, Active)]
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Unsubscribed => "unsubscribed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "unsubscribed" => Some(Self::Unsubscribed),
            _ => None,
        }
    }
}

// ========== Contact messages ==========

/// Inbox status of a contact message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    New,
    Read,
    Archived,
}

impl Lifecycle for MessageStatus {
    const RECORD: &'static str = "message";

    fn transitions() -> &'static [(Self, Self)] {
        use MessageStatus::*;
        &[(New, Read), (New, Archived), (Read, Archived)]
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Read => "read",
            Self::Archived => "archived",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "read" => Some(Self::Read),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}


#[cfg(test)]
mod property_tests {
    use proptest::prelude::*;

    use super::*;

    fn arb_content() -> impl Strategy<Value = ContentStatus> {
        prop_oneof![
            Just(ContentStatus::Draft),
            Just(ContentStatus::PendingReview),
            Just(ContentStatus::Published),
            Just(ContentStatus::Rejected),
        ]
    }

    fn arb_application() -> impl Strategy<Value = ApplicationStatus> {
        prop_oneof![
            Just(ApplicationStatus::Pending),
            Just(ApplicationStatus::Contacted),
            Just(ApplicationStatus::Approved),
            Just(ApplicationStatus::Rejected),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// No status may transition to itself; updates always change state.
        #[test]
        fn prop_no_self_transitions(a in arb_content(), b in arb_application()) {
            prop_assert!(!a.can_transition_to(a));
            prop_assert!(!b.can_transition_to(b));
        }

        /// `transition_to` agrees with the table and reports both ends on failure.
        #[test]
        fn prop_transition_matches_table(from in arb_content(), to in arb_content()) {
            let listed = ContentStatus::transitions().contains(&(from, to));
            match from.transition_to(to) {
                Ok(next) => {
                    prop_assert!(listed);
                    prop_assert_eq!(next, to);
                }
                Err(SiteError::InvalidTransition { from: f, to: t, .. }) => {
                    prop_assert!(!listed);
                    prop_assert_eq!(f, from.as_str());
                    prop_assert_eq!(t, to.as_str());
                }
                Err(other) => prop_assert!(false, "unexpected error {:?}", other),
            }
        }

        /// Database strings parse back to the same status.
        #[test]
        fn prop_status_strings_parse_back(a in arb_content(), b in arb_application()) {
            prop_assert_eq!(ContentStatus::parse(a.as_str()), Some(a));
            prop_assert_eq!(ApplicationStatus::parse(b.as_str()), Some(b));
        }
    }
}
