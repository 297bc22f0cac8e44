//! Data models shared across the worker and the provider clients.
//!
//! - `Request`, `Response`, `ResponseSnapshot`: fetch traffic and cache entries
//! - `NotificationOptions`, `NotificationRecord`: platform notifications
//! - `WorkerCommand`, `PushPayload`: messages delivered to the worker
//! - `Period`: a parsed timetable slot
//! - Row types for timetables, grades, and todos

pub mod http;
pub mod message;
pub mod notification;
pub mod records;
pub mod timetable;

pub use http::{Request, Response, ResponseSnapshot};
pub use message::{PushPayload, ScheduleNotification, WorkerCommand};
pub use notification::{NotificationId, NotificationOptions, NotificationRecord};
pub use records::{
    GradeEntry, Grades, GradesRow, NewTodo, TimetableRow, Todo, GRADES_TABLE, TIMETABLES_TABLE,
    TODOS_TABLE,
};
pub use timetable::{Period, PeriodKind};
