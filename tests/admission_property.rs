use std::time::Duration;

use proptest::prelude::*;

use media_relay::error::JobError;
use media_relay::jobs::{JobId, JobPhase, JobRegistry, PhaseParser, ProgressEvent};

#[derive(Debug, Clone)]
enum Op {
    Admit,
    Finish(usize),
    Fail(usize),
    Evict(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Admit),
        1 => any::<usize>().prop_map(Op::Finish),
        1 => any::<usize>().prop_map(Op::Fail),
        1 => any::<usize>().prop_map(Op::Evict),
    ]
}

// Lines drawn from the downloader's grammar plus noise.
fn line_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("[download] Destination: clip.f137.mp4".to_string()),
        Just("[download] Destination: clip.f140.m4a".to_string()),
        (0u32..=1500).prop_map(|tenths| format!("[download] {:>5.1}% of 10.00MiB", tenths as f64 / 10.0)),
        Just("[download] 100% of 10.00MiB in 00:03".to_string()),
        Just("[Merger] Merging formats into \"clip.mp4\"".to_string()),
        "[a-z ]{0,20}",
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #[test]
    fn admission_never_exceeds_ceiling(
        max_jobs in 1usize..5,
        ops in proptest::collection::vec(op_strategy(), 1..60),
    ) {
        runtime().block_on(async {
            let registry = JobRegistry::new(max_jobs, Duration::from_secs(10), 4);
            // Model: (id, still active)
            let mut jobs: Vec<(JobId, bool)> = Vec::new();

            for op in ops {
                match op {
                    Op::Admit => {
                        let active = jobs.iter().filter(|(_, a)| *a).count();
                        match registry.admit("https://example.com/v", None).await {
                            Ok(ticket) => {
                                prop_assert!(active < max_jobs);
                                jobs.push((ticket.id, true));
                            }
                            Err(JobError::TooManyJobs { active: reported, max }) => {
                                prop_assert_eq!(reported, active);
                                prop_assert_eq!(max, max_jobs);
                                prop_assert_eq!(active, max_jobs);
                            }
                            Err(e) => prop_assert!(false, "unexpected error: {e}"),
                        }
                    }
                    Op::Finish(i) | Op::Fail(i) if !jobs.is_empty() => {
                        let target = if matches!(op, Op::Finish(_)) {
                            JobPhase::Completed
                        } else {
                            JobPhase::Failed
                        };
                        let idx = i % jobs.len();
                        let (id, active) = &mut jobs[idx];
                        let outcome = registry.transition(*id, target).await;
                        prop_assert_eq!(outcome.is_publishable(), *active);
                        *active = false;
                    }
                    Op::Evict(i) if !jobs.is_empty() => {
                        let idx = i % jobs.len();
                        let (id, _) = jobs.remove(idx);
                        prop_assert!(registry.evict(id).await);
                    }
                    _ => {}
                }

                let active = jobs.iter().filter(|(_, a)| *a).count();
                prop_assert!(registry.active_count().await <= max_jobs);
                prop_assert_eq!(registry.active_count().await, active);
                prop_assert_eq!(registry.len().await, jobs.len());
            }
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn parser_output_is_monotonic(
        lines in proptest::collection::vec(line_strategy(), 0..80),
    ) {
        let mut parser = PhaseParser::new();
        let mut last_rank = JobPhase::Initializing.rank();
        let mut last_percent: Option<(JobPhase, f64)> = None;

        for line in &lines {
            let Some(event) = parser.feed_line(line) else { continue };
            let phase = event.phase();
            prop_assert!(phase.rank() >= last_rank, "phase regressed to {phase} on {line:?}");
            prop_assert!(!event.is_terminal());
            last_rank = phase.rank();

            if let ProgressEvent::Downloading { percent, .. } = event {
                prop_assert!((0.0..=100.0).contains(&percent));
                if let Some((prev_phase, prev)) = last_percent {
                    if prev_phase == phase {
                        prop_assert!(percent >= prev, "{percent} after {prev}");
                    }
                }
                last_percent = Some((phase, percent));
            }
            prop_assert_eq!(parser.phase(), phase);
        }
    }
}
