//! Cell values stored in partition and aggregate relations.

use crate::date::{format_timestamp, YearMonth};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Declared data type of a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Uint,
    Int,
    Timestamp,
    Histogram,
}

impl ColumnType {
    pub fn is_numeric(self) -> bool {
        matches!(self, ColumnType::Uint | ColumnType::Int | ColumnType::Timestamp)
    }
}

/// One cell. The serialized tags are short because relations hold one
/// cell per metric per group key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cell {
    #[serde(rename = "n")]
    Null,
    #[serde(rename = "t")]
    Text(String),
    #[serde(rename = "u")]
    Uint(u64),
    #[serde(rename = "i")]
    Int(i64),
    #[serde(rename = "s")]
    Timestamp(i64),
    #[serde(rename = "h")]
    Histogram(BTreeMap<YearMonth, u64>),
}

impl Cell {
    pub fn matches_type(&self, ty: ColumnType) -> bool {
        matches!(
            (self, ty),
            (Cell::Null, _)
                | (Cell::Text(_), ColumnType::Text)
                | (Cell::Uint(_), ColumnType::Uint)
                | (Cell::Int(_), ColumnType::Int)
                | (Cell::Timestamp(_), ColumnType::Timestamp)
                | (Cell::Histogram(_), ColumnType::Histogram)
        )
    }

    /// Numeric view used for ranking and derived arithmetic.
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Cell::Uint(v) => Some(*v as i128),
            Cell::Int(v) | Cell::Timestamp(v) => Some(*v as i128),
            _ => None,
        }
    }

    /// Ordering for ranking; nulls sort lowest.
    pub fn rank_cmp(&self, other: &Cell) -> Ordering {
        match (self.as_i128(), other.as_i128()) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        }
    }

    /// Text rendering for the CSV sink (unescaped).
    pub fn render(&self) -> String {
        match self {
            Cell::Null => String::new(),
            Cell::Text(s) => s.clone(),
            Cell::Uint(v) => v.to_string(),
            Cell::Int(v) => v.to_string(),
            Cell::Timestamp(ts) => format_timestamp(*ts),
            Cell::Histogram(h) => h
                .iter()
                .map(|(ym, n)| format!("{ym}:{n}"))
                .collect::<Vec<_>>()
                .join("|"),
        }
    }
}
