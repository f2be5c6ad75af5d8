use buildscope_types::{ArcBuildLog, BuildStep, Deployment, ProcessedStep, ReadyState};

/// Shown until the first non-empty line arrives
pub const PLACEHOLDER_TEXT: &str = "Deployment started ...";

/// Group classified lines into build steps.
///
/// Every non-delimiter line lands in a single "Building" step. It starts at
/// the first line, or at the deployment's build start if that is earlier,
/// and finishes at the ready time once the deployment is `READY`.
pub fn project_steps(logs: &[ArcBuildLog], deployment: Option<&Deployment>) -> Vec<ProcessedStep> {
    let mut building: Option<ProcessedStep> = None;

    for log in logs.iter().filter(|log| !log.is_delimiter()) {
        let step = building.get_or_insert_with(|| ProcessedStep {
            name: BuildStep::Building,
            started_at: deployment
                .and_then(|d| d.building_at)
                .map_or(log.created, |at| at.min(log.created)),
            finished_at: None,
            logs: Vec::new(),
        });
        step.logs.push(log.clone());
    }

    if let (Some(step), Some(deployment)) = (building.as_mut(), deployment) {
        if deployment.ready_state == ReadyState::Ready {
            step.finished_at = deployment.ready;
        }
    }

    building.into_iter().collect()
}

/// Text of the most recent non-empty line, or the placeholder
pub fn latest_log_text(steps: &[ProcessedStep]) -> &str {
    latest_log(steps)
        .and_then(|log| log.text())
        .unwrap_or(PLACEHOLDER_TEXT)
}

/// Most recent line of the first step with non-empty text
pub fn latest_log(steps: &[ProcessedStep]) -> Option<&ArcBuildLog> {
    steps
        .first()?
        .logs
        .iter()
        .rev()
        .find(|log| log.text().is_some_and(|text| !text.is_empty()))
}
