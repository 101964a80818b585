//! Cron expression parsing and next-fire computation.
//!
//! Expressions use the Quartz layout (`sec min hour dom month dow [year]`).
//! Standard five-field expressions are accepted and fire at second zero.
//! The Quartz "no specific value" marker `?` is treated as `*`.

use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::job_config::ConfigError;

/// A parsed cron schedule evaluated in UTC.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    /// Parse a cron expression.
    pub fn parse(expression: &str) -> Result<Self, ConfigError> {
        let normalized = normalize_cron_expr(expression);
        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| ConfigError::InvalidCron {
                cron: expression.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    /// The expression as written in the job record.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

fn normalize_cron_expr(expr: &str) -> String {
    let mut fields: Vec<&str> = expr
        .split_whitespace()
        .map(|f| if f == "?" { "*" } else { f })
        .collect();
    if fields.len() == 5 {
        fields.insert(0, "0");
    }
    fields.join(" ")
}
