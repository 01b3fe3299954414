use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::ParseLabelError;

/// Pipeline stage a lead occupies. The serialized labels are fixed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    #[default]
    #[serde(rename = "Interest")]
    Interest,
    #[serde(rename = "Meeting booked")]
    MeetingBooked,
    #[serde(rename = "Proposal sent")]
    ProposalSent,
    #[serde(rename = "Closed win")]
    ClosedWin,
    #[serde(rename = "Closed lost")]
    ClosedLost,
}

impl Stage {
    /// Board order, left to right.
    pub const ALL: [Stage; 5] = [
        Stage::Interest,
        Stage::MeetingBooked,
        Stage::ProposalSent,
        Stage::ClosedWin,
        Stage::ClosedLost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interest => "Interest",
            Self::MeetingBooked => "Meeting booked",
            Self::ProposalSent => "Proposal sent",
            Self::ClosedWin => "Closed win",
            Self::ClosedLost => "Closed lost",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Interest" => Ok(Self::Interest),
            "Meeting booked" => Ok(Self::MeetingBooked),
            "Proposal sent" => Ok(Self::ProposalSent),
            "Closed win" => Ok(Self::ClosedWin),
            "Closed lost" => Ok(Self::ClosedLost),
            _ => Err(ParseLabelError {
                kind: "status",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: i64,
    #[serde(default)]
    pub user_id: i64,
    pub name: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
    pub status: Stage,
    #[serde(default)]
    pub source: Option<String>,
    pub card_order: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// Payload for creating a lead. Only `name` is required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewLead {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_amount",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl NewLead {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Partial update of a lead. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_amount",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_order: Option<i64>,
}

impl LeadPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Body of `PUT /leads/{id}/status/` (a card dropped on another column).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    #[serde(default)]
    pub status: Option<Stage>,
    #[serde(default = "first_card")]
    pub card_order: i64,
}

fn first_card() -> i64 {
    1
}

/// Forms post currency either as a JSON number or as a string; blank means unset.
fn deserialize_amount<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Amount {
        Number(f64),
        Text(String),
    }

    match Option::<Amount>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Amount::Number(n)) => Ok(Some(n)),
        Some(Amount::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(Amount::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid lead value: {}", s))),
    }
}

/// Leads grouped by stage, serialized as an object keyed by stage label in
/// board order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KanbanBoard {
    #[serde(rename = "Interest", default)]
    pub interest: Vec<Lead>,
    #[serde(rename = "Meeting booked", default)]
    pub meeting_booked: Vec<Lead>,
    #[serde(rename = "Proposal sent", default)]
    pub proposal_sent: Vec<Lead>,
    #[serde(rename = "Closed win", default)]
    pub closed_win: Vec<Lead>,
    #[serde(rename = "Closed lost", default)]
    pub closed_lost: Vec<Lead>,
}

impl KanbanBoard {
    /// Group leads by stage, preserving the incoming order within a column.
    pub fn group(leads: impl IntoIterator<Item = Lead>) -> Self {
        let mut board = Self::default();
        for lead in leads {
            board.column_mut(lead.status).push(lead);
        }
        board
    }

    pub fn column(&self, stage: Stage) -> &[Lead] {
        match stage {
            Stage::Interest => &self.interest,
            Stage::MeetingBooked => &self.meeting_booked,
            Stage::ProposalSent => &self.proposal_sent,
            Stage::ClosedWin => &self.closed_win,
            Stage::ClosedLost => &self.closed_lost,
        }
    }

    fn column_mut(&mut self, stage: Stage) -> &mut Vec<Lead> {
        match stage {
            Stage::Interest => &mut self.interest,
            Stage::MeetingBooked => &mut self.meeting_booked,
            Stage::ProposalSent => &mut self.proposal_sent,
            Stage::ClosedWin => &mut self.closed_win,
            Stage::ClosedLost => &mut self.closed_lost,
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = (Stage, &[Lead])> {
        Stage::ALL.into_iter().map(move |s| (s, self.column(s)))
    }

    pub fn len(&self) -> usize {
        Stage::ALL.iter().map(|s| self.column(*s).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
