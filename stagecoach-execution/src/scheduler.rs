//! Stage scheduler
//!
//! Runs one stage program for one (configuration, cluster) pair. Stage
//! outcomes drive the transitions; the teardown and cleanup stages at the
//! end of the program run no matter how the main section ended.

use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use stagecoach_core::program::{loop_begin_label, loop_end_label};
use stagecoach_core::{
    CoordinatorState, Stage, StageOutcome, StageProgram, StageRegistry, Timeline, TimelineEvent,
};

use crate::connections::WorkerConnections;
use crate::error::{ExecutionError, Result};

/// Where the scheduler goes after a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: usize,
    /// The run now has a non-zero return code
    pub failed: bool,
    /// Remaining configurations must be skipped
    pub exit_requested: bool,
}

/// Compute the stage following `current` given its outcome.
///
/// BREAK and CONTINUE leave the innermost loop construct; BREAK also
/// forgets the loop's iteration count so a later re-entry starts over.
pub fn resolve_transition(
    program: &StageProgram,
    state: &mut CoordinatorState,
    current: usize,
    outcome: StageOutcome,
) -> Result<Transition> {
    let teardown = program.teardown_index();
    let jump = |next| Transition {
        next,
        failed: false,
        exit_requested: false,
    };

    match outcome {
        StageOutcome::Success => Ok(jump(current + 1)),
        StageOutcome::Fail => Ok(Transition {
            next: teardown,
            failed: true,
            exit_requested: false,
        }),
        StageOutcome::Exit => Ok(Transition {
            next: teardown,
            failed: true,
            exit_requested: true,
        }),
        StageOutcome::Break | StageOutcome::Continue => {
            let name = state.pop_loop()?.ok_or_else(|| {
                ExecutionError::LoopControl(format!("{} outside of any loop construct", outcome))
            })?;
            let label = if outcome == StageOutcome::Break {
                state.reset_loop_counter(&name);
                loop_end_label(&name)
            } else {
                loop_begin_label(&name)
            };
            let next = program
                .label(&label)
                .ok_or_else(|| ExecutionError::LoopControl(format!("undefined label '{}'", label)))?;
            Ok(jump(next))
        }
    }
}

/// Result of running the program for one cluster
#[derive(Debug, Default)]
pub struct ClusterRunOutcome {
    pub failed: bool,
    pub exit_requested: bool,
    /// Error that interrupted the run, after teardown and cleanup were attempted
    pub error: Option<ExecutionError>,
    /// Stages executed on the coordinator
    pub timeline: Timeline,
}

/// Executes a stage program against a set of worker connections
pub struct StageScheduler<'a> {
    program: &'a StageProgram,
    registry: &'a StageRegistry,
    connections: &'a mut dyn WorkerConnections,
    timeline: Timeline,
}

impl<'a> StageScheduler<'a> {
    pub fn new(
        program: &'a StageProgram,
        registry: &'a StageRegistry,
        connections: &'a mut dyn WorkerConnections,
    ) -> Self {
        Self {
            program,
            registry,
            connections,
            timeline: Timeline::for_coordinator(),
        }
    }

    /// Run the program. Teardown and cleanup always run, in that order, and
    /// each exactly once.
    pub async fn run(mut self, state: &mut CoordinatorState) -> ClusterRunOutcome {
        let mut outcome = ClusterRunOutcome::default();

        if let Err(e) = self.run_main(state, &mut outcome).await {
            error!("Scenario interrupted: {}", e);
            outcome.failed = true;
            outcome.error = Some(e);
        }

        for stage_id in [self.program.teardown_index(), self.program.cleanup_index()] {
            match self.execute(stage_id, state).await {
                Ok(stage_outcome) => {
                    if stage_outcome.is_error() {
                        outcome.failed = true;
                    }
                    if stage_outcome == StageOutcome::Exit {
                        outcome.exit_requested = true;
                    }
                    if stage_outcome.is_loop_control() {
                        warn!("Ignoring {} returned by final stage {}", stage_outcome, stage_id);
                    }
                }
                Err(e) => {
                    error!("Final stage {} failed: {}", stage_id, e);
                    outcome.failed = true;
                    if outcome.error.is_none() {
                        outcome.error = Some(e);
                    }
                }
            }
        }

        outcome.timeline = self.timeline;
        outcome
    }

    async fn run_main(&mut self, state: &mut CoordinatorState, outcome: &mut ClusterRunOutcome) -> Result<()> {
        let teardown = self.program.teardown_index();
        let mut current = 0;

        while current < teardown {
            let stage_outcome = self.execute(current, state).await?;
            let transition = match resolve_transition(self.program, state, current, stage_outcome) {
                Ok(transition) => transition,
                Err(e @ ExecutionError::LoopControl(_)) => {
                    error!("Stage {} returned {}: {}", current, stage_outcome, e);
                    outcome.failed = true;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            outcome.failed |= transition.failed;
            outcome.exit_requested |= transition.exit_requested;
            if transition.next != current + 1 {
                debug!("Stage {} returned {}, continuing at {}", current, stage_outcome, transition.next);
            }
            current = transition.next;
        }
        Ok(())
    }

    async fn execute(&mut self, stage_id: usize, state: &mut CoordinatorState) -> Result<StageOutcome> {
        let descriptor = self.program.stage(stage_id)?;
        let stage_name = descriptor.name.clone();
        let stage = self.registry.instantiate(descriptor)?;
        let stage_error = |message: String| ExecutionError::Stage {
            stage: stage_name.clone(),
            message,
        };

        let started_at = Utc::now();
        let started = Instant::now();

        let outcome = match stage {
            Stage::Local(stage) => {
                match AssertUnwindSafe(stage.execute(state)).catch_unwind().await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(e)) => return Err(stage_error(e.to_string())),
                    Err(_) => return Err(stage_error("panicked on the coordinator".to_string())),
                }
            }
            Stage::Distributed(mut stage) => {
                stage
                    .init_on_coordinator(state)
                    .map_err(|e| stage_error(e.to_string()))?;
                let data = stage.create_auxiliary_data(state);
                let num_workers = state
                    .cluster()
                    .map(|cluster| cluster.size())
                    .ok_or_else(|| ExecutionError::InvalidState("no active cluster".to_string()))?;
                let acks = self.connections.run_stage(stage_id, data, num_workers).await?;
                stage.reduce_acks(state, &acks)
            }
        };

        let duration = started.elapsed();
        self.timeline.record(TimelineEvent {
            stage_id,
            stage_name: stage_name.clone(),
            started_at,
            duration_ms: duration.as_millis() as u64,
            success: !outcome.is_error(),
        });
        info!("Stage {} ({}) finished with {} in {:?}", stage_id, stage_name, outcome, duration);
        Ok(outcome)
    }
}
