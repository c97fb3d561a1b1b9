// ABOUTME: Ordered stages a task run advances through

use std::fmt;

/// A step of the task run pipeline. Stages only ever advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Prepare,
    Build,
    Start,
    Started,
    Waiting,
    Stopped,
    Finished,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Prepare,
        Stage::Build,
        Stage::Start,
        Stage::Started,
        Stage::Waiting,
        Stage::Stopped,
        Stage::Finished,
    ];

    /// The stage after this one; `None` after `Finished`.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Prepare => Some(Stage::Build),
            Stage::Build => Some(Stage::Start),
            Stage::Start => Some(Stage::Started),
            Stage::Started => Some(Stage::Waiting),
            Stage::Waiting => Some(Stage::Stopped),
            Stage::Stopped => Some(Stage::Finished),
            Stage::Finished => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Prepare => "prepare",
            Stage::Build => "build",
            Stage::Start => "start",
            Stage::Started => "started",
            Stage::Waiting => "waiting",
            Stage::Stopped => "stopped",
            Stage::Finished => "finished",
        };
        f.write_str(name)
    }
}
