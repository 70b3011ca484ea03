use crate::infra::{build_engine, demo_submission};
use caseflow::config::EngineSettings;
use caseflow::error::AppError;
use caseflow::orchestration::Recommendation;
use clap::Args;
use std::time::Duration;

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// Caseworker name recorded on the approval.
    #[arg(long, default_value = "demo_caseworker")]
    pub(crate) actor: String,
    /// Override the approval threshold for the demo run.
    #[arg(long)]
    pub(crate) threshold: Option<f64>,
    /// Stop after intake and scoring; do not approve or execute.
    #[arg(long)]
    pub(crate) skip_approval: bool,
}

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let mut settings = EngineSettings::default();
    if let Some(threshold) = args.threshold {
        settings.approval_threshold = threshold;
    }
    let engine = build_engine(settings)?;

    println!("Caseflow orchestration demo");
    let submission = demo_submission();
    println!(
        "Submitting '{}' event for subjects {:?}",
        submission.event_type,
        submission.subject_ids.values().collect::<Vec<_>>()
    );

    let outcome = match engine.submit_event(submission) {
        Ok(outcome) => outcome,
        Err(err) => {
            println!("  Event rejected: {err}");
            return Ok(());
        }
    };
    println!("- Event recorded as {}", outcome.event.id);

    let Some(recommendation) = outcome.recommendation else {
        println!("- Confidence stayed below the threshold; no recommendation created");
        return Ok(());
    };
    render_recommendation(&recommendation);

    if args.skip_approval {
        println!("\nSkipping approval; recommendation stays pending");
        return Ok(());
    }

    println!("\nApproving as '{}'", args.actor);
    let mut transitions = engine.subscribe();
    let executing = match engine.approve(&recommendation.id, &args.actor) {
        Ok(record) => record,
        Err(err) => {
            println!("  Approval failed: {err}");
            return Ok(());
        }
    };
    println!("- Status now {}", executing.status);

    let terminal = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match transitions.recv().await {
                Ok(event) if event.recommendation.status.is_terminal() => {
                    break Some(event.recommendation);
                }
                Ok(_) => continue,
                Err(_) => break None,
            }
        }
    })
    .await
    .ok()
    .flatten();

    match terminal {
        Some(record) => {
            println!("\nExecution finished: {}", record.status);
            for step in &record.action_plan {
                let error_note = match &step.last_error {
                    Some(err) => format!(" ({err})"),
                    None => String::new(),
                };
                println!(
                    "  - step {} [{}] {} after {} attempt(s){}",
                    step.sequence_no,
                    step.target_system,
                    step.status.label(),
                    step.attempt_count,
                    error_note
                );
            }
        }
        None => println!("\nExecution did not reach a terminal state in time"),
    }

    let stats = engine.statistics();
    println!(
        "\nCounters: {} accepted, {} recommendations, {} completed, {} failed",
        stats.events_accepted,
        stats.recommendations_created,
        stats.executions_completed,
        stats.executions_failed
    );

    Ok(())
}

fn render_recommendation(recommendation: &Recommendation) {
    println!(
        "- Recommendation {} (confidence {:.0}%)",
        recommendation.id,
        recommendation.confidence * 100.0
    );
    println!("  Summary: {}", recommendation.summary);
    println!("  Reasoning:");
    for line in &recommendation.reasoning {
        println!("    - {line}");
    }
    println!(
        "  Estimated impact: ${:.2} saved, {} minutes recovered",
        recommendation.estimated_impact.monetary_savings_cents as f64 / 100.0,
        recommendation.estimated_impact.time_saved_minutes
    );
    println!("  Planned steps:");
    for step in &recommendation.action_plan {
        println!(
            "    {}. [{}] {}",
            step.sequence_no, step.target_system, step.payload
        );
    }
}
