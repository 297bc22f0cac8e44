use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    Class,
    Break,
    Study,
}

impl PeriodKind {
    /// Classify a period from its name: breaks and lunch are breaks,
    /// study periods are study, anything else is a class.
    pub fn classify(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower.contains("break") || lower.contains("lunch") {
            PeriodKind::Break
        } else if lower.contains("study") {
            PeriodKind::Study
        } else {
            PeriodKind::Class
        }
    }
}

impl std::fmt::Display for PeriodKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeriodKind::Class => write!(f, "class"),
            PeriodKind::Break => write!(f, "break"),
            PeriodKind::Study => write!(f, "study"),
        }
    }
}

/// One timetable slot as extracted from a screenshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Period {
    /// Short weekday name ("Mon" .. "Fri").
    pub day: String,
    /// Period number, 0 for homeroom/registration.
    #[serde(default)]
    pub num: u32,
    pub name: String,
    /// 24h "HH:MM", empty when not visible.
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub end: String,
    #[serde(rename = "type", default)]
    pub kind: Option<PeriodKind>,
    #[serde(default)]
    pub room: String,
}

impl Period {
    pub fn kind(&self) -> PeriodKind {
        self.kind.unwrap_or_else(|| PeriodKind::classify(&self.name))
    }

    /// Fill in a missing kind from the period name.
    pub fn normalized(mut self) -> Self {
        self.kind = Some(self.kind());
        self
    }
}
