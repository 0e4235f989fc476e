use evalkit_types::{ProgressCounters, RunStatus};

/// Everything the reducer needs, independent of how the caller persists it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    pub status: RunStatus,
    pub progress: ProgressCounters,
    pub summarize_progress: ProgressCounters,
    /// Remembers which status to resume into; set on pause, consulted on
    /// resume (§4.6: `PAUSED -> user resume -> RUNNING or SUMMARIZING`).
    pub paused_from: Option<RunStatus>,
}

impl RunState {
    pub fn new(total_jobs: u64) -> Self {
        Self {
            status: RunStatus::Pending,
            progress: ProgressCounters {
                total: total_jobs,
                completed: 0,
                failed: 0,
            },
            summarize_progress: ProgressCounters::default(),
            paused_from: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    ProbeSucceeded,
    ProbeFailed,
    /// Fired once, at the RUNNING→SUMMARIZING transition, to freeze
    /// `summarize.total` at the current transcript count.
    SummarizeTotalSet { total: u64 },
    SummarizeSucceeded,
    SummarizeFailed,
    Paused,
    Resumed,
    Cancelled,
}

/// Side effects the caller should perform in response to a reduction. The
/// reducer itself never enqueues or persists anything (§9: message-passing
/// actions are observed, not performed, from pure state transitions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCommand {
    StatusChanged { from: RunStatus, to: RunStatus },
}

/// Applies one event to `state`, returning the new state and any commands
/// the caller should act on. Mirrors the clone-mutate-diff shape used
/// elsewhere in this codebase's reducers: mutate a clone, then derive
/// whether the status itself needs to move.
pub fn reduce(state: &RunState, event: RunEvent) -> (RunState, Vec<RunCommand>) {
    let mut next = state.clone();
    let before_status = next.status;

    match event {
        RunEvent::ProbeSucceeded => next.progress.completed += 1,
        RunEvent::ProbeFailed => next.progress.failed += 1,
        RunEvent::SummarizeTotalSet { total } => next.summarize_progress.total = total,
        RunEvent::SummarizeSucceeded => next.summarize_progress.completed += 1,
        RunEvent::SummarizeFailed => next.summarize_progress.failed += 1,
        RunEvent::Paused => {
            if !next.status.is_terminal() && next.status != RunStatus::Paused {
                next.paused_from = Some(next.status);
                next.status = RunStatus::Paused;
            }
        }
        RunEvent::Resumed => {
            if next.status == RunStatus::Paused {
                next.status = next.paused_from.take().unwrap_or(RunStatus::Running);
            }
        }
        RunEvent::Cancelled => {
            if !next.status.is_terminal() {
                next.paused_from = None;
                next.status = RunStatus::Cancelled;
            }
        }
    }

    // Counter-driven transitions only apply while the run isn't paused or
    // terminal; pause/resume/cancel above are the only other movers.
    if !matches!(next.status, RunStatus::Paused) && !next.status.is_terminal() {
        next.status = derive_counter_status(&next);
    }

    let mut commands = Vec::new();
    if next.status != before_status {
        commands.push(RunCommand::StatusChanged {
            from: before_status,
            to: next.status,
        });
    }
    (next, commands)
}

fn derive_counter_status(state: &RunState) -> RunStatus {
    match state.status {
        RunStatus::Pending => {
            if state.progress.completed + state.progress.failed > 0 {
                RunStatus::Running
            } else {
                RunStatus::Pending
            }
        }
        RunStatus::Running => {
            if state.progress.total > 0 && state.progress.is_terminal() {
                RunStatus::Summarizing
            } else {
                RunStatus::Running
            }
        }
        RunStatus::Summarizing => {
            if state.summarize_progress.total > 0 && state.summarize_progress.is_terminal() {
                RunStatus::Completed
            } else {
                RunStatus::Summarizing
            }
        }
        other => other,
    }
}
