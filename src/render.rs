use std::time::Duration;

use serde::Serialize;

use crate::state::SpecialAnimation;

/// What a display should show right now.
///
/// While a special announcement is active the plain counter is replaced by
/// the announcement; once it expires the counter comes back.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum DisplayFrame {
    Counter {
        value: i64,
        text: String,
    },
    Special {
        message: Option<String>,
        amount: Option<i64>,
        text: String,
        countdown: String,
    },
}

pub fn render(value: i64, special: &SpecialAnimation, remaining: Option<Duration>) -> DisplayFrame {
    if !special.active {
        return DisplayFrame::Counter {
            value,
            text: render_number(value),
        };
    }

    let text = match (&special.message, special.amount) {
        (Some(message), Some(amount)) => format!("{message} {}", render_number(amount)),
        (Some(message), None) => message.clone(),
        (None, Some(amount)) => render_number(amount),
        (None, None) => render_number(value),
    };
    DisplayFrame::Special {
        message: special.message.clone(),
        amount: special.amount,
        text,
        countdown: render_time_mmss(remaining.map(|d| d.as_secs()).unwrap_or(0)),
    }
}

/// Plain digits; currency formatting is left to the client.
pub fn render_number(value: i64) -> String {
    value.to_string()
}

/// Render seconds in `MM:SS` format (max 99:59).
pub fn render_time_mmss(total_secs: u64) -> String {
    let mins = (total_secs / 60).min(99);
    let secs = total_secs % 60;
    format!("{:02}:{:02}", mins, secs)
}
