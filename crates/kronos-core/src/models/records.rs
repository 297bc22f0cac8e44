//! Per-user rows held by the managed database.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Period;
use crate::error::Result;

pub const TIMETABLES_TABLE: &str = "timetables";
pub const GRADES_TABLE: &str = "grades";
pub const TODOS_TABLE: &str = "todos";

/// One weekday of a user's timetable. Periods are stored as a JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimetableRow {
    pub user_id: String,
    pub day: String,
    pub periods: String,
}

impl TimetableRow {
    pub fn new(user_id: &str, day: &str, periods: &[Period]) -> Result<Self> {
        Ok(Self {
            user_id: user_id.to_string(),
            day: day.to_string(),
            periods: serde_json::to_string(periods)?,
        })
    }

    pub fn periods(&self) -> Result<Vec<Period>> {
        Ok(serde_json::from_str(&self.periods)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeEntry {
    pub label: String,
    pub score: f64,
    pub max: f64,
}

impl GradeEntry {
    /// Score as a percentage of the maximum, `None` when max is zero.
    pub fn percentage(&self) -> Option<f64> {
        if self.max > 0.0 {
            Some(self.score / self.max * 100.0)
        } else {
            None
        }
    }
}

/// Grades keyed by subject name.
pub type Grades = BTreeMap<String, Vec<GradeEntry>>;

/// A user's grades blob. One row per user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradesRow {
    pub user_id: String,
    pub data: String,
}

impl GradesRow {
    pub fn new(user_id: &str, grades: &Grades) -> Result<Self> {
        Ok(Self {
            user_id: user_id.to_string(),
            data: serde_json::to_string(grades)?,
        })
    }

    pub fn grades(&self) -> Result<Grades> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    pub id: i64,
    pub user_id: String,
    pub text: String,
    #[serde(default)]
    pub due: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Insert payload for a todo; the store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTodo {
    pub user_id: String,
    pub text: String,
    pub due: Option<String>,
    pub done: bool,
}
