//! Clients for the worker's external collaborators.
//!
//! - `provider`: the managed auth/database provider as a row store
//! - `records`: per-user timetable, grades and todo services on top of it
//! - `vision`: timetable screenshot parsing

pub mod provider;
pub mod records;
pub mod vision;

pub use provider::{RestRowStore, RowFilter, RowStore};
pub use records::{authorize, GradesService, SaveDay, TimetableService, TodoService};
pub use vision::{ScreenshotParser, VisionClient};
