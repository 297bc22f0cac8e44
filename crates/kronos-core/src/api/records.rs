//! Per-user record services: timetables, grades, todos.
//!
//! Every call first resolves the caller's bearer token to a user id, then
//! runs its reads and writes as that user and scopes them by that id. A
//! missing or unrecognised token is an [`WorkerError::Auth`] before any row
//! is touched.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::provider::{RowFilter, RowStore};
use crate::error::{Result, WorkerError};
use crate::models::{
    Grades, GradesRow, NewTodo, Period, TimetableRow, Todo, GRADES_TABLE, TIMETABLES_TABLE,
    TODOS_TABLE,
};

const USER_ID: &str = "user_id";

/// Resolve an `Authorization` header value (with or without the `Bearer `
/// prefix) to a user id.
pub async fn authorize(store: &dyn RowStore, authorization: Option<&str>) -> Result<String> {
    verify(store, bearer_token(authorization)?).await
}

fn bearer_token(authorization: Option<&str>) -> Result<&str> {
    authorization
        .map(|h| h.strip_prefix("Bearer ").unwrap_or(h).trim())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| WorkerError::Auth("missing bearer token".to_string()))
}

async fn verify(store: &dyn RowStore, token: &str) -> Result<String> {
    store
        .verify_token(token)
        .await?
        .ok_or_else(|| WorkerError::Auth("invalid or expired token".to_string()))
}

/// A verified caller and a store acting as them.
struct Caller {
    user_id: String,
    store: Arc<dyn RowStore>,
}

async fn resolve_caller(store: &dyn RowStore, authorization: Option<&str>) -> Result<Caller> {
    let token = bearer_token(authorization)?;
    let user_id = verify(store, token).await?;
    Ok(Caller {
        user_id,
        store: store.for_token(token),
    })
}

fn user_filter(user_id: &str) -> RowFilter {
    RowFilter::new().eq(USER_ID, user_id)
}

fn decode_rows<T: serde::de::DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(WorkerError::from))
        .collect()
}

/// Body of a timetable save. Both fields are required.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveDay {
    #[serde(default)]
    pub day: Option<String>,
    #[serde(default)]
    pub periods: Option<Vec<Period>>,
}

#[derive(Clone)]
pub struct TimetableService {
    store: Arc<dyn RowStore>,
}

impl TimetableService {
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self { store }
    }

    pub async fn list(&self, authorization: Option<&str>) -> Result<Vec<TimetableRow>> {
        let caller = resolve_caller(self.store.as_ref(), authorization).await?;
        let rows = caller
            .store
            .read_rows(TIMETABLES_TABLE, &user_filter(&caller.user_id))
            .await?;
        decode_rows(rows)
    }

    /// Replace one day's periods.
    pub async fn save_day(&self, authorization: Option<&str>, request: SaveDay) -> Result<()> {
        let caller = resolve_caller(self.store.as_ref(), authorization).await?;
        let (Some(day), Some(periods)) = (request.day.filter(|d| !d.is_empty()), request.periods)
        else {
            return Err(WorkerError::Validation("Missing day or periods".to_string()));
        };

        let periods: Vec<Period> = periods.into_iter().map(Period::normalized).collect();
        let row = TimetableRow::new(&caller.user_id, &day, &periods)?;
        caller
            .store
            .upsert_row(TIMETABLES_TABLE, serde_json::to_value(&row)?, &[USER_ID, "day"])
            .await?;
        info!(day = %day, periods = periods.len(), "Saved timetable day");
        Ok(())
    }
}

#[derive(Clone)]
pub struct GradesService {
    store: Arc<dyn RowStore>,
}

impl GradesService {
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self { store }
    }

    /// The caller's grades, empty when nothing was saved yet.
    pub async fn get(&self, authorization: Option<&str>) -> Result<Grades> {
        let caller = resolve_caller(self.store.as_ref(), authorization).await?;
        let rows = caller
            .store
            .read_rows(GRADES_TABLE, &user_filter(&caller.user_id))
            .await?;
        match decode_rows::<GradesRow>(rows)?.into_iter().next() {
            Some(row) => row.grades(),
            None => Ok(Grades::new()),
        }
    }

    pub async fn save(&self, authorization: Option<&str>, grades: &Grades) -> Result<()> {
        let caller = resolve_caller(self.store.as_ref(), authorization).await?;
        let row = GradesRow::new(&caller.user_id, grades)?;
        caller
            .store
            .upsert_row(GRADES_TABLE, serde_json::to_value(&row)?, &[USER_ID])
            .await?;
        debug!(subjects = grades.len(), "Saved grades");
        Ok(())
    }
}

#[derive(Clone)]
pub struct TodoService {
    store: Arc<dyn RowStore>,
}

impl TodoService {
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self { store }
    }

    /// Newest first.
    pub async fn list(&self, authorization: Option<&str>) -> Result<Vec<Todo>> {
        let caller = resolve_caller(self.store.as_ref(), authorization).await?;
        let filter = user_filter(&caller.user_id).order_by("created_at", false);
        decode_rows(caller.store.read_rows(TODOS_TABLE, &filter).await?)
    }

    pub async fn add(
        &self,
        authorization: Option<&str>,
        text: &str,
        due: Option<&str>,
    ) -> Result<Todo> {
        let caller = resolve_caller(self.store.as_ref(), authorization).await?;
        let todo = NewTodo {
            user_id: caller.user_id,
            text: text.to_string(),
            due: due.filter(|d| !d.is_empty()).map(str::to_string),
            done: false,
        };
        let stored = caller
            .store
            .insert_row(TODOS_TABLE, serde_json::to_value(&todo)?)
            .await?;
        Ok(serde_json::from_value(stored)?)
    }

    pub async fn toggle(&self, authorization: Option<&str>, id: i64, done: bool) -> Result<()> {
        let caller = resolve_caller(self.store.as_ref(), authorization).await?;
        let filter = RowFilter::new().eq("id", id).eq(USER_ID, caller.user_id);
        caller
            .store
            .update_rows(TODOS_TABLE, &filter, json!({ "done": done }))
            .await
    }

    pub async fn delete(&self, authorization: Option<&str>, id: i64) -> Result<()> {
        let caller = resolve_caller(self.store.as_ref(), authorization).await?;
        let filter = RowFilter::new().eq("id", id).eq(USER_ID, caller.user_id);
        caller.store.delete_rows(TODOS_TABLE, &filter).await
    }

    pub async fn clear_done(&self, authorization: Option<&str>) -> Result<()> {
        let caller = resolve_caller(self.store.as_ref(), authorization).await?;
        let filter = user_filter(&caller.user_id).eq("done", true);
        caller.store.delete_rows(TODOS_TABLE, &filter).await
    }
}
