//! Next-trigger computation for 5-field cron expressions
//! (minute hour day-of-month month day-of-week).

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use chrono::{DateTime, Utc};
use std::fmt::Debug;

const CRON_FIELD_COUNT: usize = 5;
const MAX_REEVALUATIONS: usize = 3;

/// Returns the first trigger instant strictly after `from`.
pub fn next_run(cron: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let field_count = cron.split_whitespace().count();
    if field_count != CRON_FIELD_COUNT {
        return Err(Error::InvalidCronFormat {
            expr: cron.to_string(),
            reason: format!("expected {CRON_FIELD_COUNT} fields, found {field_count}"),
        });
    }

    let mut next = cron_parser::parse(cron, &from).map_err(|e| invalid(cron, e))?;
    for _ in 0..MAX_REEVALUATIONS {
        if next > from {
            return Ok(next);
        }
        next = cron_parser::parse(cron, &next).map_err(|e| invalid(cron, e))?;
    }

    Err(Error::InvalidCronFormat {
        expr: cron.to_string(),
        reason: format!("no trigger instant after {from}"),
    })
}

fn invalid<E: Debug>(cron: &str, e: E) -> Error {
    Error::InvalidCronFormat {
        expr: cron.to_string(),
        reason: format!("{e:?}"),
    }
}
