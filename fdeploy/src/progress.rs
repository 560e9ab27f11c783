use std::{fmt, time::Duration};

use byte_unit::{AdjustedByte, Byte, UnitType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    IndexLocal,
    IndexRemote,
    OnlineCopy,
    TakeOffline,
    OfflineCopy,
    DeleteOrphans,
    BringOnline,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::IndexLocal => "Indexing local files",
            Stage::IndexRemote => "Indexing server files",
            Stage::OnlineCopy => "Deploying online files",
            Stage::TakeOffline => "Taking website offline",
            Stage::OfflineCopy => "Deploying files",
            Stage::DeleteOrphans => "Deleting orphaned files",
            Stage::BringOnline => "Bringing website online",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    StageStarted(Stage),
    Item {
        stage: Stage,
        text: String,
    },
    /// An attempt failed and will be tried again
    Retry {
        stage: Stage,
        text: String,
        attempt: u32,
        of: u32,
    },
    StageFinished {
        stage: Stage,
        success: bool,
        elapsed: Duration,
        items: usize,
        bytes: u64,
    },
    /// Time elapsed between taking the site offline and bringing it back
    Downtime(Duration),
}

impl Event {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Event::StageStarted(stage) => Some(*stage),
            Event::Item { stage, .. }
            | Event::Retry { stage, .. }
            | Event::StageFinished { stage, .. } => Some(*stage),
            Event::Downtime(..) => None,
        }
    }

    /// Transfer rate of a finished stage, if it moved any data
    pub fn bytes_per_sec(&self) -> Option<AdjustedByte> {
        match self {
            Event::StageFinished { elapsed, bytes, .. } if *bytes > 0 => {
                let secs = elapsed.as_secs_f64().max(0.001);
                let rate = (*bytes as f64 / secs) as u64;
                Some(adjusted_byte(rate))
            }
            _ => None,
        }
    }
}

pub fn adjusted_byte(val: u64) -> AdjustedByte {
    Byte::from(val).get_appropriate_unit(UnitType::Binary)
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::StageStarted(stage) => write!(f, "{stage}..."),
            Event::Item { stage, text } => write!(f, "{stage}... {text}"),
            Event::Retry {
                stage,
                text,
                attempt,
                of,
            } => write!(f, "{stage}... {text} (retry {attempt} of {of})"),
            Event::StageFinished {
                stage,
                success,
                elapsed,
                items,
                bytes,
            } => {
                let status = if *success { "Success" } else { "Failed" };
                write!(f, "{stage}... {status} ({:.1}s", elapsed.as_secs_f64())?;
                if *items > 0 {
                    write!(f, ", {items} item(s)")?;
                }
                if *bytes > 0 {
                    write!(f, ", {:#.2}", adjusted_byte(*bytes))?;
                }
                if let Some(rate) = self.bytes_per_sec() {
                    write!(f, ", {rate:#.2}/s")?;
                }
                f.write_str(")")
            }
            Event::Downtime(elapsed) => {
                write!(f, "Website was offline for {:.1}s", elapsed.as_secs_f64())
            }
        }
    }
}

/// Sink of progress events, shared by every component of a run
pub trait Reporter: Send + Sync + 'static {
    fn report(&self, event: Event);
}

/// Reports progress through the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, event: Event) {
        match &event {
            Event::Item { .. } => log::debug!("{event}"),
            Event::Retry { .. } => log::warn!("{event}"),
            Event::StageFinished { success: false, .. } => log::error!("{event}"),
            _ => log::info!("{event}"),
        }
    }
}

impl<R: Reporter> Reporter for std::sync::Arc<R> {
    fn report(&self, event: Event) {
        (**self).report(event)
    }
}
